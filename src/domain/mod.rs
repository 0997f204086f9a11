//! Commerce domain: value objects, pricing, cart and order aggregates.

pub mod aggregates;
pub mod catalog;
pub mod checkout;
pub mod events;
pub mod pricing;
pub mod value_objects;
