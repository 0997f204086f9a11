//! Order assembly: validated line items + address + optional coupon in,
//! pending order out.
//!
//! The assembler never touches the source cart; clearing the cart after a
//! successful checkout is the caller's separate concern, so "order created"
//! and "cart cleared" can never end up ambiguously entangled on failure.

use thiserror::Error;

use crate::domain::aggregates::order::{Address, Order, OrderLine};
use crate::domain::pricing::{calculate, OrderCalculation, Priceable, PricingRules};
use crate::domain::value_objects::{Money, VariantSelection};

/// A validated line item ready for checkout. Name and image ride along so
/// the order can freeze them into its snapshot.
#[derive(Clone, Debug)]
pub struct CheckoutItem {
    pub product_id: String,
    pub name: String,
    pub image: String,
    pub quantity: u32,
    pub unit_price: Money,
    pub variants: VariantSelection,
}

impl Priceable for CheckoutItem {
    fn unit_price(&self) -> Money { self.unit_price }
    fn quantity(&self) -> u32 { self.quantity }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CheckoutError {
    #[error("order must contain at least one item")]
    EmptyOrder,
    #[error("quantity must be at least 1 for product {0}")]
    InvalidQuantity(String),
}

/// Turns line items into pending orders under a fixed set of pricing rules.
#[derive(Clone, Debug, Default)]
pub struct OrderAssembler {
    rules: PricingRules,
}

impl OrderAssembler {
    pub fn new(rules: PricingRules) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> &PricingRules {
        &self.rules
    }

    /// Price a prospective order without creating anything.
    pub fn preview(&self, items: &[CheckoutItem], coupon_code: Option<&str>) -> OrderCalculation {
        calculate(&self.rules, items, coupon_code)
    }

    /// Assemble a pending order: price the items, freeze the line snapshot
    /// and the address, generate an order number.
    pub fn create_order(
        &self,
        buyer_id: &str,
        items: Vec<CheckoutItem>,
        shipping_address: Address,
        coupon_code: Option<&str>,
        remark: Option<String>,
    ) -> Result<Order, CheckoutError> {
        if items.is_empty() {
            return Err(CheckoutError::EmptyOrder);
        }
        if let Some(item) = items.iter().find(|i| i.quantity == 0) {
            return Err(CheckoutError::InvalidQuantity(item.product_id.clone()));
        }

        let calculation = calculate(&self.rules, &items, coupon_code);
        let lines = items
            .into_iter()
            .map(|item| OrderLine {
                product_id: item.product_id,
                name: item.name,
                image: item.image,
                quantity: item.quantity,
                unit_price: item.unit_price,
                variant_description: item.variants.describe(),
            })
            .collect();

        Ok(Order::create(buyer_id, lines, shipping_address, &calculation, remark))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::aggregates::order::OrderStatus;

    fn item(product_id: &str, price: i64, qty: u32) -> CheckoutItem {
        CheckoutItem {
            product_id: product_id.to_string(),
            name: format!("Product {product_id}"),
            image: String::new(),
            quantity: qty,
            unit_price: Money::from_minor(price),
            variants: VariantSelection::new(),
        }
    }

    fn assembler() -> OrderAssembler {
        OrderAssembler::new(PricingRules::default())
    }

    #[test]
    fn test_creates_pending_order_with_breakdown() {
        let order = assembler()
            .create_order("u1", vec![item("P1", 6000, 1)], Address::default(), Some("SAVE10"), None)
            .unwrap();
        assert_eq!(order.status(), OrderStatus::Pending);
        let record = order.record();
        assert_eq!(record.subtotal, Money::from_minor(6000));
        assert_eq!(record.shipping_amount, Money::from_minor(1000));
        assert_eq!(record.discount_amount, Money::from_minor(1000));
        assert_eq!(record.payment_amount, Money::from_minor(6000));
        assert!(record.order_number.as_str().starts_with("ORD"));
    }

    #[test]
    fn test_empty_order_rejected() {
        let err = assembler()
            .create_order("u1", vec![], Address::default(), None, None)
            .unwrap_err();
        assert_eq!(err, CheckoutError::EmptyOrder);
    }

    #[test]
    fn test_zero_quantity_rejected() {
        let err = assembler()
            .create_order("u1", vec![item("P1", 1000, 0)], Address::default(), None, None)
            .unwrap_err();
        assert_eq!(err, CheckoutError::InvalidQuantity("P1".to_string()));
    }

    #[test]
    fn test_snapshot_is_independent_of_later_price_changes() {
        let mut source = item("P1", 5000, 1);
        let order = assembler()
            .create_order("u1", vec![source.clone()], Address::default(), None, None)
            .unwrap();
        // A later price change on the product must not reach the order
        source.unit_price = Money::from_minor(9999);
        assert_eq!(order.items()[0].unit_price, Money::from_minor(5000));
    }

    #[test]
    fn test_variant_description_frozen() {
        let mut i = item("P1", 5000, 1);
        i.variants.insert("size", "M");
        i.variants.insert("color", "black");
        let order = assembler()
            .create_order("u1", vec![i], Address::default(), None, None)
            .unwrap();
        assert_eq!(order.items()[0].variant_description, "color: black, size: M");
    }

    #[test]
    fn test_preview_matches_create() {
        let items = vec![item("P1", 6000, 1)];
        let preview = assembler().preview(&items, Some("SAVE10"));
        let order = assembler()
            .create_order("u1", items, Address::default(), Some("SAVE10"), None)
            .unwrap();
        assert_eq!(order.payment_amount(), preview.total);
    }
}
