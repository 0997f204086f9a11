//! Domain events raised by aggregates and published to the event bus.

use serde::{Deserialize, Serialize};

use crate::domain::value_objects::Money;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DomainEvent {
    Order(OrderEvent),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OrderEvent {
    Created { order_id: String, order_number: String, buyer_id: String, total: Money },
    Paid { order_id: String, transaction_id: String },
    Shipped { order_id: String, tracking_number: Option<String> },
    Delivered { order_id: String },
    Cancelled { order_id: String },
}

impl DomainEvent {
    /// NATS subject this event is published on.
    pub fn subject(&self) -> &'static str {
        match self {
            Self::Order(_) => "orders.events",
        }
    }
}
