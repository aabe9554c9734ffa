use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AmountOverflow;
use crate::models::actor::{Actor, ActorRole};
use crate::models::rider::GeoPoint;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    Assigned,
    Accepted,
    PickedUp,
    InTransit,
    Nearby,
    Delivered,
    Cancelled,
    Failed,
}

impl OrderStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OrderStatus::Delivered | OrderStatus::Cancelled | OrderStatus::Failed
        )
    }

    /// States in which a committed rider is carrying the order.
    pub fn is_active_delivery(self) -> bool {
        matches!(
            self,
            OrderStatus::Accepted
                | OrderStatus::PickedUp
                | OrderStatus::InTransit
                | OrderStatus::Nearby
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Assigned => "assigned",
            OrderStatus::Accepted => "accepted",
            OrderStatus::PickedUp => "picked_up",
            OrderStatus::InTransit => "in_transit",
            OrderStatus::Nearby => "nearby",
            OrderStatus::Delivered => "delivered",
            OrderStatus::Cancelled => "cancelled",
            OrderStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LineItem {
    pub name: String,
    pub quantity: u32,
    pub unit_price: Decimal,
}

impl LineItem {
    pub fn total(&self) -> Result<Decimal, AmountOverflow> {
        Decimal::from(self.quantity)
            .checked_mul(self.unit_price)
            .ok_or(AmountOverflow)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeliveryTarget {
    pub location: GeoPoint,
    pub address: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    Cash,
    Momo,
    Card,
    Wallet,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Processing,
    Paid,
    Failed,
    Refunded,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Payment {
    pub method: PaymentMethod,
    pub subtotal: Decimal,
    pub delivery_fee: Decimal,
    pub tax: Decimal,
    pub discount: Decimal,
    pub total: Decimal,
    pub status: PaymentStatus,
    pub paid_at: Option<DateTime<Utc>>,
}

impl Payment {
    pub fn for_items(
        method: PaymentMethod,
        items: &[LineItem],
        delivery_fee: Decimal,
    ) -> Result<Self, AmountOverflow> {
        let mut payment = Self {
            method,
            subtotal: Decimal::ZERO,
            delivery_fee,
            tax: Decimal::ZERO,
            discount: Decimal::ZERO,
            total: Decimal::ZERO,
            status: PaymentStatus::Pending,
            paid_at: None,
        };
        payment.recalculate(items)?;
        Ok(payment)
    }

    /// Recomputes subtotal and total. Leaves the payment untouched when an
    /// amount overflows.
    pub fn recalculate(&mut self, items: &[LineItem]) -> Result<(), AmountOverflow> {
        let subtotal = items.iter().try_fold(Decimal::ZERO, |sum, item| {
            sum.checked_add(item.total()?).ok_or(AmountOverflow)
        })?;
        let total = subtotal
            .checked_add(self.delivery_fee)
            .and_then(|total| total.checked_add(self.tax))
            .and_then(|total| total.checked_sub(self.discount))
            .ok_or(AmountOverflow)?;

        self.subtotal = subtotal;
        self.total = total;
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatusEntry {
    pub status: OrderStatus,
    pub timestamp: DateTime<Utc>,
    pub location: Option<GeoPoint>,
    pub note: Option<String>,
    pub actor: Option<Actor>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrackPoint {
    pub location: GeoPoint,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Tracking {
    pub assigned_at: Option<DateTime<Utc>>,
    pub accepted_at: Option<DateTime<Utc>>,
    pub picked_up_at: Option<DateTime<Utc>>,
    pub in_transit_at: Option<DateTime<Utc>>,
    pub nearby_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub current_location: Option<TrackPoint>,
    pub route: Vec<TrackPoint>,
}

impl Tracking {
    pub fn record_position(&mut self, location: GeoPoint, at: DateTime<Utc>) {
        let point = TrackPoint {
            location,
            recorded_at: at,
        };
        self.current_location = Some(point.clone());
        self.route.push(point);
    }

    pub(crate) fn stamp(&mut self, status: OrderStatus, at: DateTime<Utc>) {
        let slot = match status {
            OrderStatus::Assigned => &mut self.assigned_at,
            OrderStatus::Accepted => &mut self.accepted_at,
            OrderStatus::PickedUp => &mut self.picked_up_at,
            OrderStatus::InTransit => &mut self.in_transit_at,
            OrderStatus::Nearby => &mut self.nearby_at,
            OrderStatus::Delivered => &mut self.delivered_at,
            OrderStatus::Pending | OrderStatus::Cancelled | OrderStatus::Failed => return,
        };
        *slot = Some(at);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Cancellation {
    pub by: ActorRole,
    pub reason: Option<String>,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: Uuid,
    pub customer_id: Uuid,
    pub rider_id: Option<Uuid>,
    pub items: Vec<LineItem>,
    pub status: OrderStatus,
    pub delivery: DeliveryTarget,
    pub status_history: Vec<StatusEntry>,
    pub tracking: Tracking,
    pub payment: Payment,
    pub cancellation: Option<Cancellation>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    pub fn new(
        customer_id: Uuid,
        items: Vec<LineItem>,
        delivery: DeliveryTarget,
        payment_method: PaymentMethod,
        delivery_fee: Decimal,
        now: DateTime<Utc>,
    ) -> Result<Self, AmountOverflow> {
        let payment = Payment::for_items(payment_method, &items, delivery_fee)?;

        Ok(Self {
            id: Uuid::new_v4(),
            customer_id,
            rider_id: None,
            items,
            status: OrderStatus::Pending,
            delivery,
            status_history: vec![StatusEntry {
                status: OrderStatus::Pending,
                timestamp: now,
                location: None,
                note: Some("order placed".to_string()),
                actor: Some(Actor::customer(customer_id)),
            }],
            tracking: Tracking::default(),
            payment,
            cancellation: None,
            created_at: now,
            updated_at: now,
        })
    }

    /// Whether `actor` may read this order's snapshot.
    pub fn is_visible_to(&self, actor: &Actor) -> bool {
        match actor.role {
            ActorRole::Operator | ActorRole::System => true,
            ActorRole::Customer => self.customer_id == actor.id,
            ActorRole::Rider => self.rider_id == Some(actor.id),
        }
    }
}
