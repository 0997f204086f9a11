//! Value objects shared across the commerce domain.

use chrono::Utc;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Monetary amount in integer minor currency units (cents/fen).
///
/// The platform is single-currency, so no currency tag is carried. All
/// arithmetic saturates rather than wrapping; amounts never go negative
/// through the provided operations.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Money(i64);

impl Money {
    pub const ZERO: Money = Money(0);

    pub fn from_minor(minor: i64) -> Self { Self(minor) }
    pub fn minor(&self) -> i64 { self.0 }

    pub fn saturating_add(self, other: Money) -> Money { Money(self.0.saturating_add(other.0)) }

    /// Subtraction floored at zero.
    pub fn saturating_sub(self, other: Money) -> Money { Money((self.0 - other.0).max(0)) }

    pub fn multiply(self, quantity: u32) -> Money { Money(self.0.saturating_mul(i64::from(quantity))) }

    /// Fraction of this amount expressed in basis points (1000 = 10%),
    /// truncating division.
    pub fn percent_bps(self, bps: u32) -> Money { Money(self.0.saturating_mul(i64::from(bps)) / 10_000) }

    pub fn sum(amounts: impl IntoIterator<Item = Money>) -> Money {
        amounts.into_iter().fold(Money::ZERO, Money::saturating_add)
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:02}", self.0 / 100, (self.0 % 100).abs())
    }
}

/// Chosen variant attributes for a product, e.g. `{color: black, size: M}`.
///
/// Backed by a `BTreeMap` so iteration order is canonical regardless of the
/// order attributes arrived in a request payload.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VariantSelection(BTreeMap<String, String>);

impl VariantSelection {
    pub fn new() -> Self { Self::default() }
    pub fn is_empty(&self) -> bool { self.0.is_empty() }

    pub fn insert(&mut self, attribute: impl Into<String>, value: impl Into<String>) {
        self.0.insert(attribute.into(), value.into());
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Canonical `attr:value|attr:value` rendering, attributes sorted by name.
    pub fn canonical_key(&self) -> String {
        self.0.iter().map(|(k, v)| format!("{k}:{v}")).collect::<Vec<_>>().join("|")
    }

    /// Identity key for cart merge/lookup: product id plus canonical variants.
    pub fn line_key(&self, product_id: &str) -> LineKey {
        LineKey(format!("{product_id}|{}", self.canonical_key()))
    }

    /// Human-readable description for order snapshots, e.g. `color: black, size: M`.
    pub fn describe(&self) -> String {
        self.0.iter().map(|(k, v)| format!("{k}: {v}")).collect::<Vec<_>>().join(", ")
    }
}

impl FromIterator<(String, String)> for VariantSelection {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Cart line identity: `{productId}|{attr:value|...}`. Two additions with the
/// same product and the same variant choices always map to the same key.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LineKey(String);

impl LineKey {
    pub fn as_str(&self) -> &str { &self.0 }
}

impl From<String> for LineKey {
    fn from(value: String) -> Self { Self(value) }
}

impl fmt::Display for LineKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "{}", self.0) }
}

/// Human-traceable order number: `ORD` + millisecond timestamp + zero-padded
/// random suffix. Practically unique under concurrent creation; collisions
/// are treated as negligible rather than formally excluded.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrderNumber(String);

impl OrderNumber {
    pub fn generate() -> Self {
        let millis = Utc::now().timestamp_millis();
        let suffix: u32 = rand::thread_rng().gen_range(0..1000);
        Self(format!("ORD{millis}{suffix:03}"))
    }

    pub fn as_str(&self) -> &str { &self.0 }
}

impl From<String> for OrderNumber {
    fn from(value: String) -> Self { Self(value) }
}

impl fmt::Display for OrderNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "{}", self.0) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_money_arithmetic() {
        let a = Money::from_minor(5000);
        assert_eq!(a.multiply(2).minor(), 10_000);
        assert_eq!(a.saturating_sub(Money::from_minor(6000)), Money::ZERO);
        assert_eq!(a.percent_bps(1000).minor(), 500);
        assert_eq!(Money::sum([a, a, Money::from_minor(1)]).minor(), 10_001);
    }

    #[test]
    fn test_money_display() {
        assert_eq!(Money::from_minor(9900).to_string(), "99.00");
        assert_eq!(Money::from_minor(105).to_string(), "1.05");
    }

    #[test]
    fn test_line_key_insertion_order_independent() {
        let mut a = VariantSelection::new();
        a.insert("size", "M");
        a.insert("color", "black");
        let mut b = VariantSelection::new();
        b.insert("color", "black");
        b.insert("size", "M");
        assert_eq!(a.line_key("P1"), b.line_key("P1"));
        assert_eq!(a.line_key("P1").as_str(), "P1|color:black|size:M");
    }

    #[test]
    fn test_empty_selection_key() {
        let sel = VariantSelection::new();
        assert_eq!(sel.line_key("P1").as_str(), "P1|");
        assert_eq!(sel.describe(), "");
    }

    #[test]
    fn test_order_number_format() {
        let n = OrderNumber::generate();
        assert!(n.as_str().starts_with("ORD"));
        // ORD + 13-digit millis + 3-digit suffix
        assert_eq!(n.as_str().len(), 19);
        assert!(n.as_str()[3..].chars().all(|c| c.is_ascii_digit()));
    }
}
