//! Cart aggregate: per-user cart lines keyed by product + variant selection.
//!
//! Over-stock policy: additions (fresh line or merge into an existing line)
//! clamp the quantity to the stock ceiling; batch updates reject the whole
//! batch when any quantity exceeds its line's ceiling. Each operation
//! documents which side it is on.

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::domain::catalog::ProductSnapshot;
use crate::domain::pricing::Priceable;
use crate::domain::value_objects::{LineKey, Money, VariantSelection};

#[derive(Clone, Debug)]
pub struct Cart {
    user_id: String,
    lines: Vec<CartLine>,
    updated_at: DateTime<Utc>,
}

/// One cart line. Invariant: `0 < quantity <= stock_ceiling` for as long as
/// the line exists; a line driven to zero quantity is deleted, never stored.
#[derive(Clone, Debug)]
pub struct CartLine {
    pub key: LineKey,
    pub product_id: String,
    pub spec_id: Option<String>,
    pub name: String,
    pub image: String,
    pub unit_price: Money,
    /// Surcharge carried by the chosen spec, zero when none.
    pub price_adjustment: Money,
    pub variants: VariantSelection,
    pub quantity: u32,
    /// Available stock at the time the product was last read.
    pub stock_ceiling: u32,
    pub selected: bool,
}

impl CartLine {
    pub fn effective_price(&self) -> Money {
        self.unit_price.saturating_add(self.price_adjustment)
    }
}

impl Priceable for CartLine {
    fn unit_price(&self) -> Money { self.effective_price() }
    fn quantity(&self) -> u32 { self.quantity }
}

/// One entry of an atomic batch quantity update.
#[derive(Clone, Debug)]
pub struct BatchUpdate {
    pub key: LineKey,
    pub quantity: u32,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CartError {
    #[error("product is not available for purchase")]
    ProductUnavailable,
    #[error("quantity must be at least 1")]
    InvalidQuantity,
    #[error("insufficient stock")]
    InsufficientStock,
    #[error("cart line not found")]
    LineNotFound,
    /// The entire batch was rejected; no line was mutated.
    #[error("batch rejected: {}", .0.join("; "))]
    BatchRejected(Vec<String>),
}

impl Cart {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self { user_id: user_id.into(), lines: vec![], updated_at: Utc::now() }
    }

    /// Rehydrate a cart from stored lines.
    pub fn from_lines(user_id: impl Into<String>, lines: Vec<CartLine>) -> Self {
        Self { user_id: user_id.into(), lines, updated_at: Utc::now() }
    }

    pub fn user_id(&self) -> &str { &self.user_id }
    pub fn lines(&self) -> &[CartLine] { &self.lines }
    pub fn is_empty(&self) -> bool { self.lines.is_empty() }
    pub fn updated_at(&self) -> DateTime<Utc> { self.updated_at }

    pub fn line(&self, key: &LineKey) -> Option<&CartLine> {
        self.lines.iter().find(|l| &l.key == key)
    }

    /// Add `quantity` of a product (with chosen variants) to the cart.
    ///
    /// Merges into the line with the same (product, variants) key when one
    /// exists; the merged quantity is clamped to the stock ceiling. The
    /// snapshot also refreshes the line's price and ceiling, since it is the
    /// most recent read of the product.
    pub fn add_line(
        &mut self,
        quantity: u32,
        variants: VariantSelection,
        product: &ProductSnapshot,
    ) -> Result<&CartLine, CartError> {
        if !product.status.is_purchasable() {
            return Err(CartError::ProductUnavailable);
        }
        if quantity == 0 {
            return Err(CartError::InvalidQuantity);
        }
        if product.stock == 0 {
            // Clamping a fresh addition to a zero ceiling would store a
            // zero-quantity line, which the invariant forbids.
            return Err(CartError::InsufficientStock);
        }

        let key = variants.line_key(&product.product_id);
        let idx = match self.lines.iter().position(|l| l.key == key) {
            Some(idx) => {
                let line = &mut self.lines[idx];
                line.unit_price = product.unit_price;
                line.price_adjustment = product.price_adjustment;
                line.stock_ceiling = product.stock;
                line.quantity = line.quantity.saturating_add(quantity).min(product.stock);
                idx
            }
            None => {
                self.lines.push(CartLine {
                    key,
                    product_id: product.product_id.clone(),
                    spec_id: product.spec_id.clone(),
                    name: product.name.clone(),
                    image: product.image.clone(),
                    unit_price: product.unit_price,
                    price_adjustment: product.price_adjustment,
                    variants,
                    quantity: quantity.min(product.stock),
                    stock_ceiling: product.stock,
                    selected: true,
                });
                self.lines.len() - 1
            }
        };
        self.touch();
        Ok(&self.lines[idx])
    }

    /// Set a line's quantity. Zero or negative removes the line (removing an
    /// absent line is a no-op); a positive quantity is clamped to the line's
    /// stock ceiling. A positive quantity for a missing line is an error.
    pub fn set_quantity(&mut self, key: &LineKey, quantity: i32) -> Result<(), CartError> {
        if quantity <= 0 {
            self.remove_line(key);
            return Ok(());
        }
        let line = self.lines.iter_mut().find(|l| &l.key == key).ok_or(CartError::LineNotFound)?;
        line.quantity = (quantity as u32).min(line.stock_ceiling);
        self.touch();
        Ok(())
    }

    /// Remove a line; idempotent. Returns whether a line was removed.
    pub fn remove_line(&mut self, key: &LineKey) -> bool {
        let before = self.lines.len();
        self.lines.retain(|l| &l.key != key);
        let removed = self.lines.len() != before;
        if removed {
            self.touch();
        }
        removed
    }

    pub fn clear(&mut self) {
        self.lines.clear();
        self.touch();
    }

    /// Apply a set of quantity updates atomically: every update is validated
    /// (line present, quantity >= 1, quantity within the stock ceiling)
    /// before any is applied. Any failure rejects the whole batch untouched.
    pub fn batch_update(&mut self, updates: &[BatchUpdate]) -> Result<(), CartError> {
        let mut failures = Vec::new();
        for update in updates {
            match self.lines.iter().find(|l| l.key == update.key) {
                None => failures.push(format!("line {} not found in cart", update.key)),
                Some(line) => {
                    if update.quantity == 0 {
                        failures.push(format!("quantity for {} must be at least 1", line.name));
                    } else if update.quantity > line.stock_ceiling {
                        failures.push(format!("insufficient stock for {}", line.name));
                    }
                }
            }
        }
        if !failures.is_empty() {
            return Err(CartError::BatchRejected(failures));
        }
        for update in updates {
            if let Some(line) = self.lines.iter_mut().find(|l| l.key == update.key) {
                line.quantity = update.quantity;
            }
        }
        self.touch();
        Ok(())
    }

    pub fn total_quantity(&self) -> u32 {
        self.lines.iter().map(|l| l.quantity).sum()
    }

    pub fn total_price(&self) -> Money {
        Money::sum(self.lines.iter().map(Priceable::line_total))
    }

    pub fn selected_lines(&self) -> impl Iterator<Item = &CartLine> {
        self.lines.iter().filter(|l| l.selected)
    }

    pub fn selected_quantity(&self) -> u32 {
        self.selected_lines().map(|l| l.quantity).sum()
    }

    pub fn selected_price(&self) -> Money {
        Money::sum(self.selected_lines().map(Priceable::line_total))
    }

    pub fn toggle_selected(&mut self, key: &LineKey) -> Result<(), CartError> {
        let line = self.lines.iter_mut().find(|l| &l.key == key).ok_or(CartError::LineNotFound)?;
        line.selected = !line.selected;
        self.touch();
        Ok(())
    }

    /// Select every line if any is unselected; otherwise deselect all.
    pub fn toggle_all(&mut self) {
        let select = self.lines.iter().any(|l| !l.selected);
        for line in &mut self.lines {
            line.selected = select;
        }
        self.touch();
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::catalog::ProductStatus;

    fn snapshot(product_id: &str, price: i64, stock: u32) -> ProductSnapshot {
        ProductSnapshot {
            product_id: product_id.to_string(),
            spec_id: None,
            name: format!("Product {product_id}"),
            image: String::new(),
            unit_price: Money::from_minor(price),
            price_adjustment: Money::ZERO,
            stock,
            status: ProductStatus::Published,
        }
    }

    fn variants(pairs: &[(&str, &str)]) -> VariantSelection {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn test_add_merges_same_product_and_variants() {
        let mut cart = Cart::new("u1");
        let p = snapshot("P1", 1000, 10);
        cart.add_line(2, variants(&[("color", "black"), ("size", "M")]), &p).unwrap();
        // Same choices, different insertion order
        cart.add_line(3, variants(&[("size", "M"), ("color", "black")]), &p).unwrap();
        assert_eq!(cart.lines().len(), 1);
        assert_eq!(cart.lines()[0].quantity, 5);
    }

    #[test]
    fn test_different_variants_do_not_merge() {
        let mut cart = Cart::new("u1");
        let p = snapshot("P1", 1000, 10);
        cart.add_line(1, variants(&[("size", "M")]), &p).unwrap();
        cart.add_line(1, variants(&[("size", "L")]), &p).unwrap();
        assert_eq!(cart.lines().len(), 2);
    }

    #[test]
    fn test_add_merges_into_rehydrated_line() {
        // An addition is a delta against the stored line, never an absolute
        // overwrite: a line persisted by an earlier request must accumulate.
        let p = snapshot("P1", 1000, 10);
        let mut first = Cart::new("u1");
        let stored = first.add_line(2, VariantSelection::new(), &p).unwrap().clone();
        let mut cart = Cart::from_lines("u1", vec![stored]);
        cart.add_line(3, VariantSelection::new(), &p).unwrap();
        assert_eq!(cart.lines().len(), 1);
        assert_eq!(cart.lines()[0].quantity, 5);
    }

    #[test]
    fn test_merge_clamps_to_stock_ceiling() {
        let mut cart = Cart::new("u1");
        let p = snapshot("P1", 1000, 5);
        cart.add_line(3, VariantSelection::new(), &p).unwrap();
        cart.add_line(4, VariantSelection::new(), &p).unwrap();
        assert_eq!(cart.lines()[0].quantity, 5);
    }

    #[test]
    fn test_fresh_line_clamps_to_stock_ceiling() {
        let mut cart = Cart::new("u1");
        let line = cart.add_line(99, VariantSelection::new(), &snapshot("P1", 1000, 5)).unwrap();
        assert_eq!(line.quantity, 5);
    }

    #[test]
    fn test_zero_stock_rejected() {
        let mut cart = Cart::new("u1");
        let err = cart.add_line(1, VariantSelection::new(), &snapshot("P1", 1000, 0)).unwrap_err();
        assert_eq!(err, CartError::InsufficientStock);
        assert!(cart.is_empty());
    }

    #[test]
    fn test_unpublished_product_rejected() {
        let mut cart = Cart::new("u1");
        let mut p = snapshot("P1", 1000, 5);
        p.status = ProductStatus::Draft;
        assert_eq!(cart.add_line(1, VariantSelection::new(), &p).unwrap_err(), CartError::ProductUnavailable);
    }

    #[test]
    fn test_set_quantity_zero_removes_and_is_idempotent() {
        let mut cart = Cart::new("u1");
        let p = snapshot("P1", 1000, 5);
        let key = cart.add_line(2, VariantSelection::new(), &p).unwrap().key.clone();
        cart.set_quantity(&key, 0).unwrap();
        assert!(cart.is_empty());
        // Removing an absent line is a no-op, not an error
        cart.set_quantity(&key, -1).unwrap();
    }

    #[test]
    fn test_set_quantity_clamps_and_requires_line() {
        let mut cart = Cart::new("u1");
        let p = snapshot("P1", 1000, 5);
        let key = cart.add_line(2, VariantSelection::new(), &p).unwrap().key.clone();
        cart.set_quantity(&key, 50).unwrap();
        assert_eq!(cart.line(&key).unwrap().quantity, 5);
        let missing = VariantSelection::new().line_key("P2");
        assert_eq!(cart.set_quantity(&missing, 1).unwrap_err(), CartError::LineNotFound);
    }

    #[test]
    fn test_remove_is_idempotent() {
        let mut cart = Cart::new("u1");
        let p = snapshot("P1", 1000, 5);
        let key = cart.add_line(1, VariantSelection::new(), &p).unwrap().key.clone();
        assert!(cart.remove_line(&key));
        assert!(!cart.remove_line(&key));
    }

    #[test]
    fn test_batch_update_applies_all() {
        let mut cart = Cart::new("u1");
        let k1 = cart.add_line(1, VariantSelection::new(), &snapshot("P1", 1000, 5)).unwrap().key.clone();
        let k2 = cart.add_line(1, VariantSelection::new(), &snapshot("P2", 2000, 5)).unwrap().key.clone();
        cart.batch_update(&[
            BatchUpdate { key: k1.clone(), quantity: 3 },
            BatchUpdate { key: k2.clone(), quantity: 4 },
        ])
        .unwrap();
        assert_eq!(cart.line(&k1).unwrap().quantity, 3);
        assert_eq!(cart.line(&k2).unwrap().quantity, 4);
    }

    #[test]
    fn test_batch_update_is_atomic() {
        let mut cart = Cart::new("u1");
        let k1 = cart.add_line(1, VariantSelection::new(), &snapshot("P1", 1000, 5)).unwrap().key.clone();
        let foreign = VariantSelection::new().line_key("P9");
        let err = cart
            .batch_update(&[
                BatchUpdate { key: k1.clone(), quantity: 3 },
                BatchUpdate { key: foreign, quantity: 1 },
            ])
            .unwrap_err();
        assert!(matches!(err, CartError::BatchRejected(_)));
        // The valid half of the batch must not have been applied
        assert_eq!(cart.line(&k1).unwrap().quantity, 1);
    }

    #[test]
    fn test_batch_update_rejects_over_stock() {
        let mut cart = Cart::new("u1");
        let k1 = cart.add_line(1, VariantSelection::new(), &snapshot("P1", 1000, 5)).unwrap().key.clone();
        let err = cart.batch_update(&[BatchUpdate { key: k1.clone(), quantity: 6 }]).unwrap_err();
        assert!(matches!(err, CartError::BatchRejected(_)));
        assert_eq!(cart.line(&k1).unwrap().quantity, 1);
    }

    #[test]
    fn test_totals_include_price_adjustment() {
        let mut cart = Cart::new("u1");
        let mut p = snapshot("P1", 1000, 10);
        p.price_adjustment = Money::from_minor(200);
        cart.add_line(2, VariantSelection::new(), &p).unwrap();
        assert_eq!(cart.total_quantity(), 2);
        assert_eq!(cart.total_price(), Money::from_minor(2400));
    }

    #[test]
    fn test_toggle_all_semantics() {
        let mut cart = Cart::new("u1");
        let k1 = cart.add_line(1, VariantSelection::new(), &snapshot("P1", 1000, 5)).unwrap().key.clone();
        cart.add_line(1, VariantSelection::new(), &snapshot("P2", 2000, 5)).unwrap();
        // New lines default selected; deselect one, toggle-all selects everything
        cart.toggle_selected(&k1).unwrap();
        cart.toggle_all();
        assert!(cart.lines().iter().all(|l| l.selected));
        // All selected -> toggle-all deselects everything
        cart.toggle_all();
        assert!(cart.lines().iter().all(|l| !l.selected));
    }

    #[test]
    fn test_selected_totals() {
        let mut cart = Cart::new("u1");
        let k1 = cart.add_line(1, VariantSelection::new(), &snapshot("P1", 1000, 5)).unwrap().key.clone();
        cart.add_line(2, VariantSelection::new(), &snapshot("P2", 2000, 5)).unwrap();
        cart.toggle_selected(&k1).unwrap();
        assert_eq!(cart.selected_quantity(), 2);
        assert_eq!(cart.selected_price(), Money::from_minor(4000));
        assert_eq!(cart.total_price(), Money::from_minor(5000));
    }
}
