//! Product/stock lookup contract consumed by the cart and checkout.
//!
//! The catalog itself lives behind the persistence layer; the domain only
//! sees the snapshot a lookup returns at add-to-cart or checkout time.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::domain::value_objects::Money;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProductStatus {
    #[default]
    Draft,
    Published,
    Archived,
}

impl ProductStatus {
    /// Only published products may enter a cart.
    pub fn is_purchasable(&self) -> bool {
        matches!(self, Self::Published)
    }
}

impl fmt::Display for ProductStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Draft => write!(f, "draft"),
            Self::Published => write!(f, "published"),
            Self::Archived => write!(f, "archived"),
        }
    }
}

impl FromStr for ProductStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(Self::Draft),
            "published" => Ok(Self::Published),
            "archived" => Ok(Self::Archived),
            other => Err(format!("unknown product status: {other}")),
        }
    }
}

/// What a product/stock lookup returns for a product and an optional chosen
/// spec: current price, price adjustment for the spec, and available stock.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProductSnapshot {
    pub product_id: String,
    pub spec_id: Option<String>,
    pub name: String,
    pub image: String,
    pub unit_price: Money,
    /// Surcharge (or zero) carried by the chosen spec.
    pub price_adjustment: Money,
    pub stock: u32,
    pub status: ProductStatus,
}

impl ProductSnapshot {
    pub fn effective_price(&self) -> Money {
        self.unit_price.saturating_add(self.price_adjustment)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_published_is_purchasable() {
        assert!(ProductStatus::Published.is_purchasable());
        assert!(!ProductStatus::Draft.is_purchasable());
        assert!(!ProductStatus::Archived.is_purchasable());
    }

    #[test]
    fn test_status_round_trip() {
        for s in [ProductStatus::Draft, ProductStatus::Published, ProductStatus::Archived] {
            assert_eq!(s.to_string().parse::<ProductStatus>().unwrap(), s);
        }
    }
}
