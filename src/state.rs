use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::warn;
use uuid::Uuid;

use crate::config::DispatchSettings;
use crate::models::actor::{Actor, ActorRole};
use crate::models::envelope::Envelope;
use crate::models::offer::OfferLedger;
use crate::models::order::Order;
use crate::models::rider::Rider;
use crate::observability::metrics::Metrics;

/// Device sessions an outbound envelope is addressed to. Operators see all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Audience {
    Rider(Uuid),
    Customer(Uuid),
}

#[derive(Debug, Clone)]
pub struct Outbound {
    pub audience: Vec<Audience>,
    pub envelope: Envelope,
}

impl Outbound {
    pub fn is_for(&self, actor: &Actor) -> bool {
        match actor.role {
            ActorRole::Operator => true,
            ActorRole::Rider => self.audience.contains(&Audience::Rider(actor.id)),
            ActorRole::Customer => self.audience.contains(&Audience::Customer(actor.id)),
            ActorRole::System => false,
        }
    }
}

/// Expiry timer armed for the pending offer of one order.
pub struct OfferTimer {
    pub offer_id: Uuid,
    pub handle: JoinHandle<()>,
}

pub struct AppState {
    pub settings: DispatchSettings,
    pub riders: DashMap<Uuid, Rider>,
    pub orders: DashMap<Uuid, Order>,
    pub offers: DashMap<Uuid, OfferLedger>,
    pub offer_timers: DashMap<Uuid, OfferTimer>,
    pub order_tx: mpsc::Sender<Uuid>,
    pub events_tx: broadcast::Sender<Outbound>,
    pub metrics: Metrics,
}

impl AppState {
    pub fn new(
        settings: DispatchSettings,
        order_queue_size: usize,
        event_buffer_size: usize,
    ) -> (Self, mpsc::Receiver<Uuid>) {
        let (order_tx, order_rx) = mpsc::channel(order_queue_size);
        let (events_tx, _unused_rx) = broadcast::channel(event_buffer_size);

        (
            Self {
                settings,
                riders: DashMap::new(),
                orders: DashMap::new(),
                offers: DashMap::new(),
                offer_timers: DashMap::new(),
                order_tx,
                events_tx,
                metrics: Metrics::new(),
            },
            order_rx,
        )
    }

    /// Fans an event out to the connected sessions of `audience`.
    pub fn publish<T: Serialize>(&self, audience: Vec<Audience>, kind: &str, payload: &T) {
        let envelope = match Envelope::new(kind, payload) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(event = kind, error = %err, "failed to encode outbound event");
                return;
            }
        };

        // No receivers simply means no device is connected right now.
        let _ = self.events_tx.send(Outbound { audience, envelope });
    }

    /// Cancels the expiry timer of `offer_id`, if still armed.
    pub fn disarm_offer_timer(&self, order_id: Uuid, offer_id: Uuid) {
        if let Some(timer) = self.release_offer_timer(order_id, offer_id) {
            timer.handle.abort();
        }
    }

    /// Forgets the timer without aborting it; used by the timer task itself.
    pub fn release_offer_timer(&self, order_id: Uuid, offer_id: Uuid) -> Option<OfferTimer> {
        self.offer_timers
            .remove_if(&order_id, |_, timer| timer.offer_id == offer_id)
            .map(|(_, timer)| timer)
    }
}
