//! Wire format shared by the backend and devices.
//!
//! Every frame on the channel is a text frame carrying
//! `{ "type": .., "data"?: .., "timestamp"?: .. }`. The keep-alive protocol
//! mixes other shapes on the same socket, so inbound text is classified
//! before anyone sees it: either an [`Envelope`] or an [`IgnoredFrame`].

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::models::location::LocationSample;
use crate::models::offer::OfferOutcome;
use crate::models::order::{DeliveryTarget, OrderStatus};
use crate::models::rider::GeoPoint;

pub mod events {
    pub const NEW_ORDER_ASSIGNED: &str = "new_order_assigned";
    pub const ORDER_STATUS_UPDATED: &str = "order_status_updated";
    pub const EARNINGS_UPDATED: &str = "earnings_updated";
    pub const RIDER_LOCATION_UPDATE: &str = "rider_location_update";
    pub const RIDER_LOCATION: &str = "rider_location";
    pub const PING: &str = "ping";
    pub const PONG: &str = "pong";
    pub const ASSIGNMENT_ACCEPT: &str = "assignment_accept";
    pub const ASSIGNMENT_REJECT: &str = "assignment_reject";
    pub const ASSIGNMENT_RESOLVED: &str = "assignment_resolved";
    pub const ASSIGNMENT_DELAYED: &str = "assignment_delayed";

    pub const CHAT_MESSAGE: &str = "chat_message";
    pub const CHAT_TYPING_START: &str = "chat_typing_start";
    pub const CHAT_TYPING_STOP: &str = "chat_typing_stop";
    pub const CHAT_JOIN_ROOM: &str = "chat_join_room";
    pub const CHAT_LEAVE_ROOM: &str = "chat_leave_room";

    // Raised locally by the channel, never sent over the wire.
    pub const CONNECTED: &str = "connected";
    pub const DISCONNECTED: &str = "disconnected";
    pub const ERROR: &str = "error";
    pub const MAX_RECONNECTS_REACHED: &str = "max_reconnects_reached";
    pub const MESSAGE: &str = "message";
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

impl Envelope {
    pub fn bare(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            data: None,
            timestamp: Some(Utc::now().to_rfc3339()),
        }
    }

    pub fn new<T: Serialize>(
        kind: impl Into<String>,
        payload: &T,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self {
            kind: kind.into(),
            data: Some(serde_json::to_value(payload)?),
            timestamp: Some(Utc::now().to_rfc3339()),
        })
    }

    pub fn ping() -> Self {
        Self::bare(events::PING)
    }

    pub fn pong() -> Self {
        Self::bare(events::PONG)
    }

    /// Decodes `data` into a typed payload.
    pub fn payload<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.data.clone().unwrap_or(Value::Null))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoredFrame {
    Binary,
    Empty,
    /// Text that is not a JSON object, e.g. a server banner or raw `pong`.
    NotStructured,
    /// Looked like JSON but did not decode into an envelope.
    Malformed,
    KeepAliveAck,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Envelope(Envelope),
    Ignored(IgnoredFrame),
}

pub fn classify_text(text: &str) -> Inbound {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Inbound::Ignored(IgnoredFrame::Empty);
    }
    if !trimmed.starts_with('{') {
        return Inbound::Ignored(IgnoredFrame::NotStructured);
    }

    match serde_json::from_str::<Envelope>(trimmed) {
        Ok(envelope) if envelope.kind == events::PONG => {
            Inbound::Ignored(IgnoredFrame::KeepAliveAck)
        }
        Ok(envelope) => Inbound::Envelope(envelope),
        Err(_) => Inbound::Ignored(IgnoredFrame::Malformed),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OfferPayload {
    pub offer_id: Uuid,
    pub order_id: Uuid,
    pub rider_id: Uuid,
    pub expires_at: DateTime<Utc>,
    pub countdown_secs: u64,
    pub delivery: DeliveryTarget,
    pub total: Decimal,
    pub distance_km: f64,
    /// Riding time to the drop-off at the backend's average speed.
    #[serde(default)]
    pub eta_minutes: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OfferDecisionPayload {
    pub order_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OfferResolvedPayload {
    pub offer_id: Uuid,
    pub order_id: Uuid,
    pub rider_id: Uuid,
    pub outcome: OfferOutcome,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatusUpdatePayload {
    pub order_id: Uuid,
    pub status: OrderStatus,
    pub previous_status: OrderStatus,
    pub rider_id: Option<Uuid>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub location: Option<GeoPoint>,
    #[serde(default)]
    pub note: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RiderLocationPayload {
    pub order_id: Uuid,
    pub rider_id: Uuid,
    pub location: LocationSample,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AssignmentDelayedPayload {
    pub order_id: Uuid,
    pub attempts: usize,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EarningsPayload {
    pub rider_id: Uuid,
    pub order_id: Uuid,
    pub earnings: Decimal,
    pub completed_deliveries: u32,
}
