//! Minimall Commerce Platform
//!
//! Self-hosted mini-mall backend: shopping cart, order pricing, checkout
//! and order lifecycle over a small REST surface.
//!
//! ## Features
//! - Cart reconciliation keyed by product + variant selection
//! - Order pricing: subtotal, shipping thresholds, coupon discounts
//! - Checkout into immutable order snapshots
//! - Order lifecycle state machine with idempotent payment confirmation
//!
//! The domain core under [`domain`] is pure and storage-agnostic; the
//! `minimall` binary wires it to PostgreSQL and HTTP.

pub mod domain;

pub use domain::aggregates::cart::{BatchUpdate, Cart, CartError, CartLine};
pub use domain::aggregates::order::{
    Address, Order, OrderError, OrderLine, OrderRecord, OrderStatus,
};
pub use domain::catalog::{ProductSnapshot, ProductStatus};
pub use domain::checkout::{CheckoutError, CheckoutItem, OrderAssembler};
pub use domain::events::{DomainEvent, OrderEvent};
pub use domain::pricing::{
    calculate, Coupon, CouponKind, OrderCalculation, Priceable, PricingRules, ShippingMethod,
};
pub use domain::value_objects::{LineKey, Money, OrderNumber, VariantSelection};
