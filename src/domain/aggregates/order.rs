//! Order aggregate: an immutable line-item snapshot plus a small status
//! state machine.
//!
//! Legal transitions only: `pending -> paid` (external payment confirmation),
//! `pending -> cancelled`, `paid -> shipped`, `shipped -> delivered`.
//! `cancelled` and `delivered` are terminal. Payment confirmations replay
//! idempotently: a confirmation whose transaction id already paid the order
//! is a silent no-op.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

use crate::domain::events::{DomainEvent, OrderEvent};
use crate::domain::pricing::{OrderCalculation, Priceable, ShippingMethod};
use crate::domain::value_objects::{Money, OrderNumber};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    #[default]
    Pending,
    Paid,
    Shipped,
    Delivered,
    Cancelled,
}

impl OrderStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Delivered | Self::Cancelled)
    }

    pub fn can_transition_to(&self, next: OrderStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Paid)
                | (Self::Pending, Self::Cancelled)
                | (Self::Paid, Self::Shipped)
                | (Self::Shipped, Self::Delivered)
        )
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Paid => "paid",
            Self::Shipped => "shipped",
            Self::Delivered => "delivered",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

impl FromStr for OrderStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "paid" => Ok(Self::Paid),
            "shipped" => Ok(Self::Shipped),
            "delivered" => Ok(Self::Delivered),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(format!("unknown order status: {other}")),
        }
    }
}

/// Line-item snapshot captured at order creation. Name, image and price are
/// frozen here; later product changes never reach an existing order.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OrderLine {
    pub product_id: String,
    pub name: String,
    pub image: String,
    pub quantity: u32,
    pub unit_price: Money,
    /// Human-readable variant choice, e.g. `color: black, size: M`.
    pub variant_description: String,
}

impl Priceable for OrderLine {
    fn unit_price(&self) -> Money { self.unit_price }
    fn quantity(&self) -> u32 { self.quantity }
}

/// Shipping address snapshot.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Address {
    pub name: String,
    pub phone: String,
    pub province: String,
    pub city: String,
    pub district: String,
    pub detail: String,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum OrderError {
    #[error("order not found or not cancellable")]
    NotCancellable,
    #[error("invalid status transition: {from} -> {to}")]
    InvalidTransition { from: OrderStatus, to: OrderStatus },
}

/// Persistence shape of an order; what the store reads and writes.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OrderRecord {
    pub id: String,
    pub order_number: OrderNumber,
    pub buyer_id: String,
    pub status: OrderStatus,
    pub items: Vec<OrderLine>,
    pub shipping_address: Address,
    pub subtotal: Money,
    pub shipping_amount: Money,
    pub discount_amount: Money,
    pub payment_amount: Money,
    pub shipping_method: ShippingMethod,
    pub payment_method: String,
    pub transaction_id: Option<String>,
    pub paid_at: Option<DateTime<Utc>>,
    pub tracking_number: Option<String>,
    pub remark: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone, Debug)]
pub struct Order {
    record: OrderRecord,
    events: Vec<DomainEvent>,
}

impl Order {
    /// Create a pending order from priced items. Orders are never deleted;
    /// cancellation is a status, not a removal.
    pub fn create(
        buyer_id: impl Into<String>,
        items: Vec<OrderLine>,
        shipping_address: Address,
        calculation: &OrderCalculation,
        remark: Option<String>,
    ) -> Self {
        let id = Uuid::new_v4().to_string();
        let order_number = OrderNumber::generate();
        let buyer_id = buyer_id.into();
        let now = Utc::now();
        let mut order = Self {
            record: OrderRecord {
                id: id.clone(),
                order_number: order_number.clone(),
                buyer_id: buyer_id.clone(),
                status: OrderStatus::Pending,
                items,
                shipping_address,
                subtotal: calculation.subtotal,
                shipping_amount: calculation.shipping,
                discount_amount: calculation.coupon_discount,
                payment_amount: calculation.total,
                shipping_method: calculation.shipping_method,
                payment_method: "mockpay".to_string(),
                transaction_id: None,
                paid_at: None,
                tracking_number: None,
                remark,
                created_at: now,
                updated_at: now,
            },
            events: vec![],
        };
        order.raise(DomainEvent::Order(OrderEvent::Created {
            order_id: id,
            order_number: order_number.as_str().to_string(),
            buyer_id,
            total: calculation.total,
        }));
        order
    }

    /// Rehydrate a stored order.
    pub fn from_record(record: OrderRecord) -> Self {
        Self { record, events: vec![] }
    }

    pub fn record(&self) -> &OrderRecord { &self.record }
    pub fn id(&self) -> &str { &self.record.id }
    pub fn order_number(&self) -> &OrderNumber { &self.record.order_number }
    pub fn buyer_id(&self) -> &str { &self.record.buyer_id }
    pub fn status(&self) -> OrderStatus { self.record.status }
    pub fn items(&self) -> &[OrderLine] { &self.record.items }
    pub fn payment_amount(&self) -> Money { self.record.payment_amount }

    /// Apply an external payment confirmation.
    ///
    /// Returns `Ok(true)` when the transition was applied, `Ok(false)` when
    /// this exact confirmation (same transaction id) had already been
    /// processed. Anything else against a non-pending order is an invalid
    /// transition — a confirmation must never double-transition an order.
    pub fn confirm_payment(&mut self, transaction_id: &str) -> Result<bool, OrderError> {
        if self.record.transaction_id.as_deref() == Some(transaction_id)
            && self.record.status != OrderStatus::Pending
        {
            return Ok(false);
        }
        self.transition_to(OrderStatus::Paid)?;
        self.record.transaction_id = Some(transaction_id.to_string());
        self.record.paid_at = Some(Utc::now());
        self.raise(DomainEvent::Order(OrderEvent::Paid {
            order_id: self.record.id.clone(),
            transaction_id: transaction_id.to_string(),
        }));
        Ok(true)
    }

    /// Buyer cancellation; permitted only while pending.
    pub fn cancel(&mut self) -> Result<(), OrderError> {
        if self.record.status != OrderStatus::Pending {
            return Err(OrderError::NotCancellable);
        }
        self.transition_to(OrderStatus::Cancelled)?;
        self.raise(DomainEvent::Order(OrderEvent::Cancelled { order_id: self.record.id.clone() }));
        Ok(())
    }

    pub fn ship(&mut self, tracking_number: Option<String>) -> Result<(), OrderError> {
        self.transition_to(OrderStatus::Shipped)?;
        self.record.tracking_number = tracking_number.clone();
        self.raise(DomainEvent::Order(OrderEvent::Shipped {
            order_id: self.record.id.clone(),
            tracking_number,
        }));
        Ok(())
    }

    pub fn deliver(&mut self) -> Result<(), OrderError> {
        self.transition_to(OrderStatus::Delivered)?;
        self.raise(DomainEvent::Order(OrderEvent::Delivered { order_id: self.record.id.clone() }));
        Ok(())
    }

    pub fn take_events(&mut self) -> Vec<DomainEvent> {
        std::mem::take(&mut self.events)
    }

    fn transition_to(&mut self, next: OrderStatus) -> Result<(), OrderError> {
        if !self.record.status.can_transition_to(next) {
            return Err(OrderError::InvalidTransition { from: self.record.status, to: next });
        }
        self.record.status = next;
        self.record.updated_at = Utc::now();
        Ok(())
    }

    fn raise(&mut self, event: DomainEvent) {
        self.events.push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::pricing::{calculate, PricingRules};

    fn line(price: i64, qty: u32) -> OrderLine {
        OrderLine {
            product_id: "P1".to_string(),
            name: "Widget".to_string(),
            image: String::new(),
            quantity: qty,
            unit_price: Money::from_minor(price),
            variant_description: String::new(),
        }
    }

    fn order() -> Order {
        let items = vec![line(5000, 2)];
        let calc = calculate(&PricingRules::default(), &items, None);
        Order::create("u1", items, Address::default(), &calc, None)
    }

    #[test]
    fn test_created_pending_with_totals() {
        let mut o = order();
        assert_eq!(o.status(), OrderStatus::Pending);
        assert_eq!(o.payment_amount(), Money::from_minor(10_000));
        assert_eq!(o.record().shipping_amount, Money::ZERO);
        let events = o.take_events();
        assert!(matches!(events.as_slice(), [DomainEvent::Order(OrderEvent::Created { .. })]));
    }

    #[test]
    fn test_happy_path() {
        let mut o = order();
        assert!(o.confirm_payment("txn-1").unwrap());
        o.ship(Some("TRACK123".to_string())).unwrap();
        o.deliver().unwrap();
        assert_eq!(o.status(), OrderStatus::Delivered);
        assert_eq!(o.record().tracking_number.as_deref(), Some("TRACK123"));
        assert!(o.record().paid_at.is_some());
    }

    #[test]
    fn test_payment_confirmation_is_idempotent() {
        let mut o = order();
        assert!(o.confirm_payment("txn-1").unwrap());
        // Same confirmation redelivered: no-op, no double transition
        assert!(!o.confirm_payment("txn-1").unwrap());
        assert_eq!(o.status(), OrderStatus::Paid);
        // A different confirmation against a paid order is a hard failure
        assert!(o.confirm_payment("txn-2").is_err());
    }

    #[test]
    fn test_paid_order_cannot_be_cancelled() {
        let mut o = order();
        o.confirm_payment("txn-1").unwrap();
        assert_eq!(o.cancel().unwrap_err(), OrderError::NotCancellable);
        assert_eq!(o.status(), OrderStatus::Paid);
    }

    #[test]
    fn test_pending_order_cancels() {
        let mut o = order();
        o.cancel().unwrap();
        assert_eq!(o.status(), OrderStatus::Cancelled);
        assert!(o.status().is_terminal());
    }

    #[test]
    fn test_ship_requires_paid() {
        let mut o = order();
        assert_eq!(
            o.ship(None).unwrap_err(),
            OrderError::InvalidTransition { from: OrderStatus::Pending, to: OrderStatus::Shipped }
        );
    }

    #[test]
    fn test_deliver_requires_shipped() {
        let mut o = order();
        o.confirm_payment("txn-1").unwrap();
        assert!(o.deliver().is_err());
    }

    #[test]
    fn test_terminal_states_accept_nothing() {
        let mut o = order();
        o.cancel().unwrap();
        assert!(o.confirm_payment("txn-1").is_err());
        assert!(o.ship(None).is_err());
        assert!(o.deliver().is_err());
    }

    #[test]
    fn test_status_round_trip() {
        for s in [
            OrderStatus::Pending,
            OrderStatus::Paid,
            OrderStatus::Shipped,
            OrderStatus::Delivered,
            OrderStatus::Cancelled,
        ] {
            assert_eq!(s.to_string().parse::<OrderStatus>().unwrap(), s);
        }
    }
}
