//! Aggregates module
pub mod cart;
pub mod order;

pub use cart::{BatchUpdate, Cart, CartError, CartLine};
pub use order::{Address, Order, OrderError, OrderLine, OrderRecord, OrderStatus};
