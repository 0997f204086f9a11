//! Order pricing: subtotal, shipping, coupon discount, total.
//!
//! `calculate` is a pure function over injected [`PricingRules`] — the coupon
//! table and shipping thresholds are configuration handed in by the caller,
//! never process globals, so alternate rule sets can be substituted in tests.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::domain::value_objects::Money;

/// Anything that can be priced as an order line.
pub trait Priceable {
    fn unit_price(&self) -> Money;
    fn quantity(&self) -> u32;

    fn line_total(&self) -> Money {
        self.unit_price().multiply(self.quantity())
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub enum CouponKind {
    /// Flat discount in minor units, capped at the subtotal.
    Fixed(Money),
    /// Percentage of the subtotal in basis points (1000 = 10%).
    Percent(u32),
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct Coupon {
    pub kind: CouponKind,
    /// Subtotal below which the coupon does not apply.
    pub minimum_subtotal: Option<Money>,
}

impl Coupon {
    pub fn fixed(value: Money, minimum: Money) -> Self {
        Self { kind: CouponKind::Fixed(value), minimum_subtotal: Some(minimum) }
    }

    pub fn percent(bps: u32, minimum: Money) -> Self {
        Self { kind: CouponKind::Percent(bps), minimum_subtotal: Some(minimum) }
    }
}

/// Injected pricing configuration: shipping thresholds plus the coupon table.
#[derive(Clone, Debug)]
pub struct PricingRules {
    pub free_shipping_threshold: Money,
    pub flat_shipping_fee: Money,
    pub coupons: HashMap<String, Coupon>,
}

impl Default for PricingRules {
    /// Reference rule set: free shipping from 99.00, flat 10.00 fee below.
    fn default() -> Self {
        let mut coupons = HashMap::new();
        coupons.insert("SAVE10".to_string(), Coupon::fixed(Money::from_minor(1000), Money::from_minor(5000)));
        coupons.insert("SAVE20".to_string(), Coupon::fixed(Money::from_minor(2000), Money::from_minor(10_000)));
        coupons.insert("PERCENT10".to_string(), Coupon::percent(1000, Money::from_minor(8000)));
        Self {
            free_shipping_threshold: Money::from_minor(9900),
            flat_shipping_fee: Money::from_minor(1000),
            coupons,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShippingMethod {
    Free,
    Standard,
}

impl ShippingMethod {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Free => "Free shipping",
            Self::Standard => "Standard shipping",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Free => "free",
            Self::Standard => "standard",
        }
    }
}

impl std::fmt::Display for ShippingMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for ShippingMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "free" => Ok(Self::Free),
            "standard" => Ok(Self::Standard),
            other => Err(format!("unknown shipping method: {other}")),
        }
    }
}

/// Monetary breakdown of an order, all integer minor units.
///
/// Invariant: `total = max(0, subtotal + shipping - discount)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderCalculation {
    pub subtotal: Money,
    pub shipping: Money,
    pub coupon_discount: Money,
    /// Total discount. Currently equal to `coupon_discount`; kept separate so
    /// further discount sources can feed in without changing the shape.
    pub discount: Money,
    pub total: Money,
    pub shipping_method: ShippingMethod,
}

/// Price a set of line items under the given rules.
///
/// Unknown coupon codes and unmet minimums resolve to zero discount rather
/// than an error, so checkout never blocks on a coupon typo.
pub fn calculate<T: Priceable>(rules: &PricingRules, items: &[T], coupon_code: Option<&str>) -> OrderCalculation {
    let subtotal = Money::sum(items.iter().map(Priceable::line_total));

    let (shipping, shipping_method) = if subtotal >= rules.free_shipping_threshold {
        (Money::ZERO, ShippingMethod::Free)
    } else {
        (rules.flat_shipping_fee, ShippingMethod::Standard)
    };

    let coupon_discount = coupon_code
        .map(|code| coupon_discount(rules, code, subtotal))
        .unwrap_or(Money::ZERO);
    let discount = coupon_discount;

    // Floor at zero: the total must never go negative regardless of how the
    // discount stacks against subtotal + shipping.
    let total = subtotal.saturating_add(shipping).saturating_sub(discount);

    OrderCalculation { subtotal, shipping, coupon_discount, discount, total, shipping_method }
}

fn coupon_discount(rules: &PricingRules, code: &str, subtotal: Money) -> Money {
    let Some(coupon) = rules.coupons.get(code) else {
        return Money::ZERO;
    };
    if let Some(minimum) = coupon.minimum_subtotal {
        if subtotal < minimum {
            return Money::ZERO;
        }
    }
    match coupon.kind {
        CouponKind::Fixed(value) => value.min(subtotal),
        CouponKind::Percent(bps) => subtotal.percent_bps(bps),
    }
}
