//! Device half of the assignment-offer protocol.
//!
//! The backend owns the offer clock. The device only mirrors it: a countdown
//! derived from `expires_at`, one decision at most, and reconciliation to
//! whatever outcome the backend reports.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::client::backend::OrderBackend;
use crate::client::channel::{Channel, Subscription};
use crate::client::error::{BackendError, DecisionError};
use crate::engine::assignment::Decision;
use crate::models::envelope::{
    events, Envelope, OfferDecisionPayload, OfferPayload, OfferResolvedPayload,
};
use crate::models::offer::OfferOutcome;

/// Whole seconds left until `expires_at`; never negative.
pub fn remaining_secs(expires_at: DateTime<Utc>, now: DateTime<Utc>) -> u64 {
    (expires_at - now).num_seconds().max(0) as u64
}

#[derive(Debug, Clone, PartialEq)]
pub struct OfferCountdown {
    pub offer: OfferPayload,
    decision: Option<Decision>,
    outcome: OfferOutcome,
}

impl OfferCountdown {
    pub fn new(offer: OfferPayload) -> Self {
        Self {
            offer,
            decision: None,
            outcome: OfferOutcome::Pending,
        }
    }

    pub fn order_id(&self) -> Uuid {
        self.offer.order_id
    }

    pub fn offer_id(&self) -> Uuid {
        self.offer.offer_id
    }

    pub fn remaining_secs(&self, now: DateTime<Utc>) -> u64 {
        remaining_secs(self.offer.expires_at, now)
    }

    pub fn decision(&self) -> Option<Decision> {
        self.decision
    }

    /// Last outcome reported by the backend.
    pub fn outcome(&self) -> OfferOutcome {
        self.outcome
    }

    pub fn can_respond(&self, now: DateTime<Utc>) -> bool {
        self.outcome == OfferOutcome::Pending
            && self.decision.is_none()
            && self.remaining_secs(now) > 0
    }

    pub fn record_decision(
        &mut self,
        decision: Decision,
        now: DateTime<Utc>,
    ) -> Result<(), DecisionError> {
        if self.decision.is_some() {
            return Err(DecisionError::AlreadyDecided);
        }
        match self.outcome {
            OfferOutcome::Pending if self.remaining_secs(now) > 0 => {}
            OfferOutcome::Pending | OfferOutcome::Expired => return Err(DecisionError::Expired),
            OfferOutcome::Accepted | OfferOutcome::Rejected => {
                return Err(DecisionError::AlreadyDecided);
            }
        }

        self.decision = Some(decision);
        Ok(())
    }

    fn withdraw_decision(&mut self) {
        self.decision = None;
    }

    /// Adopts the backend's outcome, which wins over any local decision.
    pub fn reconcile(&mut self, outcome: OfferOutcome) {
        if outcome != self.outcome {
            debug!(
                order_id = %self.order_id(),
                from = %self.outcome,
                to = %outcome,
                "offer reconciled"
            );
        }
        self.outcome = outcome;
    }
}

/// Reports the remaining seconds of one countdown every `period` until it
/// reaches zero. Aborted when dropped.
pub struct CountdownTicker {
    handle: JoinHandle<()>,
}

impl CountdownTicker {
    pub fn start<F>(expires_at: DateTime<Utc>, period: Duration, on_tick: F) -> Self
    where
        F: Fn(u64) + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            let mut ticker = interval(period);
            loop {
                ticker.tick().await;
                let remaining = remaining_secs(expires_at, Utc::now());
                on_tick(remaining);
                if remaining == 0 {
                    break;
                }
            }
        });

        Self { handle }
    }

    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }
}

impl Drop for CountdownTicker {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

pub type TickHandler = Arc<dyn Fn(Uuid, u64) + Send + Sync>;

#[derive(Default)]
struct Slot {
    countdown: Option<OfferCountdown>,
    ticker: Option<CountdownTicker>,
}

fn lock(slot: &Mutex<Slot>) -> MutexGuard<'_, Slot> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Tracks the offer currently shown to one rider and sends its decision.
pub struct OfferClient {
    channel: Channel,
    rider_id: Uuid,
    slot: Arc<Mutex<Slot>>,
    subscriptions: Vec<Subscription>,
}

impl OfferClient {
    /// Listens for offers addressed to `rider_id`. `on_tick` receives the
    /// order id and remaining seconds once per second while an offer is
    /// shown.
    pub fn attach<F>(channel: &Channel, rider_id: Uuid, on_tick: F) -> Self
    where
        F: Fn(Uuid, u64) + Send + Sync + 'static,
    {
        let slot = Arc::new(Mutex::new(Slot::default()));
        let on_tick: TickHandler = Arc::new(on_tick);

        let offered_slot = Arc::clone(&slot);
        let offered = channel.on_typed(events::NEW_ORDER_ASSIGNED, move |offer: OfferPayload| {
            if offer.rider_id != rider_id {
                return;
            }
            info!(order_id = %offer.order_id, expires_at = %offer.expires_at, "offer received");

            let tick = Arc::clone(&on_tick);
            let order_id = offer.order_id;
            let period = Duration::from_secs(1);
            let ticker = CountdownTicker::start(offer.expires_at, period, move |remaining| {
                tick(order_id, remaining);
            });

            let mut slot = lock(&offered_slot);
            slot.countdown = Some(OfferCountdown::new(offer));
            slot.ticker = Some(ticker);
        });

        let resolved_slot = Arc::clone(&slot);
        let resolved = channel.on_typed(
            events::ASSIGNMENT_RESOLVED,
            move |resolution: OfferResolvedPayload| {
                let mut slot = lock(&resolved_slot);
                let Some(countdown) = slot
                    .countdown
                    .as_mut()
                    .filter(|countdown| countdown.offer_id() == resolution.offer_id)
                else {
                    return;
                };

                countdown.reconcile(resolution.outcome);
                if resolution.outcome != OfferOutcome::Pending {
                    slot.ticker = None;
                }
                info!(
                    order_id = %resolution.order_id,
                    outcome = %resolution.outcome,
                    reason = resolution.reason.as_deref().unwrap_or(""),
                    "offer resolved"
                );
            },
        );

        Self {
            channel: channel.clone(),
            rider_id,
            slot,
            subscriptions: vec![offered, resolved],
        }
    }

    pub fn rider_id(&self) -> Uuid {
        self.rider_id
    }

    pub fn current(&self) -> Option<OfferCountdown> {
        lock(&self.slot).countdown.clone()
    }

    pub fn accept(&self) -> Result<(), DecisionError> {
        self.decide(Decision::Accept)
    }

    pub fn reject(&self) -> Result<(), DecisionError> {
        self.decide(Decision::Reject)
    }

    fn decide(&self, decision: Decision) -> Result<(), DecisionError> {
        let order_id = {
            let mut slot = lock(&self.slot);
            let countdown = slot.countdown.as_mut().ok_or(DecisionError::NoOffer)?;
            countdown.record_decision(decision, Utc::now())?;
            countdown.order_id()
        };

        let kind = match decision {
            Decision::Accept => events::ASSIGNMENT_ACCEPT,
            Decision::Reject => events::ASSIGNMENT_REJECT,
        };

        let sent = match Envelope::new(kind, &OfferDecisionPayload { order_id }) {
            Ok(envelope) => self.channel.send(&envelope),
            Err(err) => {
                warn!(error = %err, "failed to encode offer decision");
                false
            }
        };

        if !sent {
            // Nothing left the device; the rider may try again in time.
            if let Some(countdown) = lock(&self.slot).countdown.as_mut() {
                countdown.withdraw_decision();
            }
            return Err(DecisionError::NotSent);
        }

        info!(order_id = %order_id, ?decision, "offer decision sent");
        Ok(())
    }

    /// Re-fetches the shown offer and adopts the backend's outcome. Used
    /// after a reconnect, when resolutions may have been missed.
    pub async fn reconcile(
        &self,
        backend: &dyn OrderBackend,
    ) -> Result<Option<OfferCountdown>, BackendError> {
        let shown = lock(&self.slot).countdown.as_ref().map(OfferCountdown::order_id);
        let Some(order_id) = shown else {
            return Ok(None);
        };

        let offer = backend.fetch_offer(order_id).await?;

        let mut slot = lock(&self.slot);
        if let Some(countdown) = slot
            .countdown
            .as_mut()
            .filter(|countdown| countdown.offer_id() == offer.id)
        {
            countdown.reconcile(offer.outcome);
            if offer.outcome != OfferOutcome::Pending {
                slot.ticker = None;
            }
        }
        Ok(slot.countdown.clone())
    }

    /// Stops listening and cancels the countdown.
    pub fn detach(self) {
        for subscription in self.subscriptions {
            subscription.unsubscribe();
        }
        lock(&self.slot).ticker = None;
    }
}
