use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::engine::lifecycle::{self, StatusChange};
use crate::engine::queue::try_enqueue_order;
use crate::engine::scoring::compute_score;
use crate::error::{AppError, OfferError};
use crate::geo::eta_minutes;
use crate::models::actor::{Actor, ActorRole};
use crate::models::envelope::{
    events, AssignmentDelayedPayload, OfferPayload, OfferResolvedPayload,
};
use crate::models::offer::{AssignmentOffer, OfferOutcome};
use crate::models::order::OrderStatus;
use crate::state::{AppState, Audience, OfferTimer};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Accept,
    Reject,
}

impl Decision {
    fn outcome(self) -> OfferOutcome {
        match self {
            Decision::Accept => OfferOutcome::Accepted,
            Decision::Reject => OfferOutcome::Rejected,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Offered { rider_id: Uuid },
    Delayed,
    /// Nothing to do: the order is settled, already has a pending offer,
    /// or is waiting for a new round.
    Skipped,
}

impl DispatchOutcome {
    fn label(self) -> &'static str {
        match self {
            DispatchOutcome::Offered { .. } => "offered",
            DispatchOutcome::Delayed => "delayed",
            DispatchOutcome::Skipped => "skipped",
        }
    }
}

pub async fn run_assignment_engine(state: Arc<AppState>, mut order_rx: mpsc::Receiver<Uuid>) {
    info!("assignment engine started");

    while let Some(order_id) = order_rx.recv().await {
        state.metrics.orders_in_queue.dec();

        let start = Instant::now();
        let label = match dispatch_order(&state, order_id) {
            Ok(outcome) => outcome.label(),
            Err(err) => {
                error!(order_id = %order_id, error = %err, "failed to dispatch order");
                "error"
            }
        };

        state
            .metrics
            .dispatch_latency_seconds
            .with_label_values(&[label])
            .observe(start.elapsed().as_secs_f64());
        state
            .metrics
            .dispatch_attempts_total
            .with_label_values(&[label])
            .inc();
    }

    warn!("assignment engine stopped: queue channel closed");
}

/// Offers `order_id` to the best eligible rider, or marks it delayed.
pub fn dispatch_order(state: &Arc<AppState>, order_id: Uuid) -> Result<DispatchOutcome, AppError> {
    let order = state
        .orders
        .get(&order_id)
        .map(|order| order.clone())
        .ok_or_else(|| AppError::NotFound(format!("order {order_id} not found")))?;

    if !matches!(order.status, OrderStatus::Pending | OrderStatus::Assigned) {
        debug!(order_id = %order_id, status = %order.status, "order no longer needs a rider");
        return Ok(DispatchOutcome::Skipped);
    }

    // Riders already holding an offer for some other order.
    let engaged: HashSet<Uuid> = state
        .offers
        .iter()
        .filter_map(|ledger| ledger.pending().map(|offer| offer.rider_id))
        .collect();

    let ledger = state
        .offers
        .get(&order_id)
        .map(|ledger| ledger.clone())
        .unwrap_or_default();

    if ledger.pending().is_some() || ledger.delayed {
        return Ok(DispatchOutcome::Skipped);
    }

    let max_attempts = state.settings.max_offer_attempts;
    if ledger.round_attempts() >= max_attempts {
        mark_delayed(
            state,
            order_id,
            order.customer_id,
            ledger.round_attempts(),
            format!("no rider accepted after {max_attempts} offers"),
        );
        return Ok(DispatchOutcome::Delayed);
    }

    let max_distance_km = state.settings.max_assignment_distance_km;
    let best = state
        .riders
        .iter()
        .filter(|entry| {
            let rider = entry.value();
            rider.can_take_order()
                && !engaged.contains(&rider.id)
                && !ledger.offered_this_round(rider.id)
        })
        .map(|entry| {
            let (score, breakdown, distance_km) =
                compute_score(entry.value(), &order.delivery.location);
            (*entry.key(), score, breakdown, distance_km)
        })
        .filter(|(_, _, _, distance_km)| *distance_km <= max_distance_km)
        .max_by(|a, b| a.1.total_cmp(&b.1));

    let Some((rider_id, score, score_breakdown, distance_km)) = best else {
        mark_delayed(
            state,
            order_id,
            order.customer_id,
            ledger.round_attempts(),
            format!("no available rider within {max_distance_km} km"),
        );
        return Ok(DispatchOutcome::Delayed);
    };

    let now = Utc::now();
    let timeout = state.settings.offer_timeout;
    let expires_at = now
        + chrono::Duration::from_std(timeout)
            .map_err(|err| AppError::Internal(format!("offer timeout out of range: {err}")))?;

    let offer = AssignmentOffer {
        id: Uuid::new_v4(),
        order_id,
        rider_id,
        score,
        score_breakdown,
        distance_km,
        offered_at: now,
        expires_at,
        outcome: OfferOutcome::Pending,
        resolved_at: None,
    };

    state.offers.entry(order_id).or_default().push(offer.clone())?;

    if let Err(err) = bind_candidate(state, order_id, rider_id) {
        // The order settled while the offer was being prepared.
        if let Some(mut ledger) = state.offers.get_mut(&order_id) {
            if let Some(current) = ledger.current_mut().filter(|current| current.id == offer.id) {
                let _ = current.resolve(OfferOutcome::Expired, Utc::now());
            }
        }
        return Err(err);
    }

    arm_offer_timer(state, &offer);

    state.publish(
        vec![Audience::Rider(rider_id)],
        events::NEW_ORDER_ASSIGNED,
        &OfferPayload {
            offer_id: offer.id,
            order_id,
            rider_id,
            expires_at,
            countdown_secs: timeout.as_secs(),
            delivery: order.delivery.clone(),
            total: order.payment.total,
            distance_km,
            eta_minutes: eta_minutes(distance_km * 1000.0, state.settings.average_speed_kmh),
        },
    );

    info!(
        order_id = %order_id,
        rider_id = %rider_id,
        offer_id = %offer.id,
        score,
        distance_km,
        attempt = ledger.round_attempts() + 1,
        "order offered to rider"
    );

    Ok(DispatchOutcome::Offered { rider_id })
}

/// Points the order at its current candidate. A pending order moves to
/// `assigned`; an order being reassigned keeps its status.
fn bind_candidate(state: &AppState, order_id: Uuid, rider_id: Uuid) -> Result<(), AppError> {
    let committed = {
        let mut order = state
            .orders
            .get_mut(&order_id)
            .ok_or_else(|| AppError::NotFound(format!("order {order_id} not found")))?;

        match order.status {
            OrderStatus::Pending => {
                order.rider_id = Some(rider_id);
                let change = StatusChange::new(OrderStatus::Assigned, Actor::system())
                    .with_note("offered to rider");
                if let Err(err) = lifecycle::transition(&mut order, change, Utc::now()) {
                    order.rider_id = None;
                    return Err(err.into());
                }
                Some(order.clone())
            }
            OrderStatus::Assigned => {
                order.rider_id = Some(rider_id);
                order.updated_at = Utc::now();
                None
            }
            other => {
                return Err(AppError::Conflict(format!(
                    "order {order_id} is {other} and cannot be offered"
                )));
            }
        }
    };

    if let Some(order) = committed {
        lifecycle::record_committed(state, &order, OrderStatus::Pending);
    }

    Ok(())
}

fn arm_offer_timer(state: &Arc<AppState>, offer: &AssignmentOffer) {
    let timer_state = Arc::clone(state);
    let order_id = offer.order_id;
    let offer_id = offer.id;
    let timeout = state.settings.offer_timeout;

    let handle = tokio::spawn(async move {
        tokio::time::sleep(timeout).await;
        timer_state.release_offer_timer(order_id, offer_id);
        expire_offer(&timer_state, order_id, offer_id);
    });

    if let Some(previous) = state
        .offer_timers
        .insert(order_id, OfferTimer { offer_id, handle })
    {
        previous.handle.abort();
    }
}

fn mark_delayed(
    state: &AppState,
    order_id: Uuid,
    customer_id: Uuid,
    attempts: usize,
    reason: String,
) {
    let newly_delayed = {
        let mut ledger = state.offers.entry(order_id).or_default();
        !std::mem::replace(&mut ledger.delayed, true)
    };
    if !newly_delayed {
        return;
    }

    warn!(order_id = %order_id, attempts, reason = %reason, "assignment delayed");

    state.publish(
        vec![Audience::Customer(customer_id)],
        events::ASSIGNMENT_DELAYED,
        &AssignmentDelayedPayload {
            order_id,
            attempts,
            reason,
        },
    );
}

/// Resolves the offer as expired if it is still pending and hands the
/// order back to dispatch.
pub fn expire_offer(state: &AppState, order_id: Uuid, offer_id: Uuid) {
    let now = Utc::now();

    let expired = state.offers.get_mut(&order_id).and_then(|mut ledger| {
        let offer = ledger
            .current_mut()
            .filter(|offer| offer.id == offer_id && offer.is_pending())?;
        offer.resolve(OfferOutcome::Expired, now).ok()?;
        Some(offer.clone())
    });

    let Some(offer) = expired else {
        return;
    };

    warn!(
        order_id = %order_id,
        rider_id = %offer.rider_id,
        offer_id = %offer_id,
        "offer expired without a decision"
    );

    hand_back(state, &offer, "no response before the offer expired");
}

/// Clears the candidate from the order, reports the outcome and queues the
/// order for the next candidate.
fn hand_back(state: &AppState, offer: &AssignmentOffer, reason: &str) {
    let requeue = match state.orders.get_mut(&offer.order_id) {
        Some(mut order) => {
            if order.status == OrderStatus::Assigned && order.rider_id == Some(offer.rider_id) {
                order.rider_id = None;
                order.updated_at = Utc::now();
            }
            matches!(order.status, OrderStatus::Pending | OrderStatus::Assigned)
                .then_some(order.customer_id)
        }
        None => None,
    };

    publish_resolution(state, offer, Some(reason.to_string()));

    if let Some(customer_id) = requeue {
        requeue_or_delay(state, offer.order_id, customer_id);
    }
}

/// Queues the order for dispatch. When the queue refuses it the order is
/// parked as delayed so the next available rider picks it up.
fn requeue_or_delay(state: &AppState, order_id: Uuid, customer_id: Uuid) {
    let Err(err) = try_enqueue_order(state, order_id) else {
        return;
    };

    error!(order_id = %order_id, error = %err, "failed to re-queue order");
    let attempts = state
        .offers
        .get(&order_id)
        .map_or(0, |ledger| ledger.round_attempts());
    mark_delayed(
        state,
        order_id,
        customer_id,
        attempts,
        "dispatch queue is full".to_string(),
    );
}

pub(crate) fn publish_resolution(
    state: &AppState,
    offer: &AssignmentOffer,
    reason: Option<String>,
) {
    state
        .metrics
        .offers_total
        .with_label_values(&[&offer.outcome.to_string()])
        .inc();

    state.publish(
        vec![Audience::Rider(offer.rider_id)],
        events::ASSIGNMENT_RESOLVED,
        &resolution_payload(offer, reason),
    );
}

pub fn resolution_payload(offer: &AssignmentOffer, reason: Option<String>) -> OfferResolvedPayload {
    OfferResolvedPayload {
        offer_id: offer.id,
        order_id: offer.order_id,
        rider_id: offer.rider_id,
        outcome: offer.outcome,
        reason,
    }
}

/// Applies a rider's decision to the pending offer of `order_id`.
///
/// A decision reaching the backend at or after `expires_at` loses: the offer
/// is resolved as expired and [`AppError::OfferExpired`] is returned.
pub fn resolve_offer(
    state: &AppState,
    actor: &Actor,
    order_id: Uuid,
    decision: Decision,
) -> Result<AssignmentOffer, AppError> {
    if actor.role != ActorRole::Rider {
        return Err(AppError::Forbidden("only riders answer offers".to_string()));
    }

    let now = Utc::now();
    let (offer, late) = {
        let mut ledger = state
            .offers
            .get_mut(&order_id)
            .ok_or_else(|| AppError::NotFound(format!("no offer for order {order_id}")))?;
        let offer = ledger
            .current_mut()
            .ok_or_else(|| AppError::NotFound(format!("no offer for order {order_id}")))?;

        if offer.rider_id != actor.id {
            return Err(AppError::Forbidden(format!(
                "offer for order {order_id} was not made to this rider"
            )));
        }
        match offer.outcome {
            OfferOutcome::Pending => {}
            OfferOutcome::Expired => return Err(AppError::OfferExpired(order_id)),
            outcome => return Err(OfferError::AlreadyResolved(outcome).into()),
        }

        let late = offer.is_expired_at(now);
        let outcome = if late {
            OfferOutcome::Expired
        } else {
            decision.outcome()
        };
        offer.resolve(outcome, now)?;
        (offer.clone(), late)
    };

    state.disarm_offer_timer(order_id, offer.id);

    if late {
        warn!(order_id = %order_id, rider_id = %actor.id, "decision arrived after offer expiry");
        hand_back(state, &offer, "decision arrived after the offer expired");
        return Err(AppError::OfferExpired(order_id));
    }

    match decision {
        Decision::Accept => {
            let change =
                StatusChange::new(OrderStatus::Accepted, *actor).with_note("rider accepted");
            lifecycle::commit_transition(state, order_id, change)?;

            if let Some(mut rider) = state.riders.get_mut(&actor.id) {
                rider.take_load(now);
                state
                    .metrics
                    .rider_utilization
                    .with_label_values(&[&actor.id.to_string()])
                    .set(rider.utilization());
            }

            info!(order_id = %order_id, rider_id = %actor.id, "offer accepted");
            publish_resolution(state, &offer, None);
        }
        Decision::Reject => {
            info!(order_id = %order_id, rider_id = %actor.id, "offer rejected");
            hand_back(state, &offer, "rider rejected the offer");
        }
    }

    Ok(offer)
}

/// Starts a new assignment round for every delayed order. Called when a
/// rider becomes available.
pub fn requeue_delayed(state: &AppState) -> usize {
    let delayed: Vec<Uuid> = state
        .offers
        .iter_mut()
        .filter(|ledger| ledger.delayed)
        .map(|mut ledger| {
            ledger.begin_round();
            *ledger.key()
        })
        .collect();

    for order_id in &delayed {
        let customer_id = state.orders.get(order_id).map(|order| order.customer_id);
        if let Some(customer_id) = customer_id {
            requeue_or_delay(state, *order_id, customer_id);
        }
    }

    if !delayed.is_empty() {
        info!(count = delayed.len(), "delayed orders re-queued");
    }
    delayed.len()
}

/// Operator-initiated restart of assignment for one order.
pub fn redispatch(state: &AppState, actor: &Actor, order_id: Uuid) -> Result<(), AppError> {
    if actor.role != ActorRole::Operator {
        return Err(AppError::Forbidden("only operators may redispatch".to_string()));
    }

    let status = state
        .orders
        .get(&order_id)
        .map(|order| order.status)
        .ok_or_else(|| AppError::NotFound(format!("order {order_id} not found")))?;

    if !matches!(status, OrderStatus::Pending | OrderStatus::Assigned) {
        return Err(AppError::Conflict(format!(
            "order {order_id} is {status} and needs no rider"
        )));
    }

    {
        let mut ledger = state.offers.entry(order_id).or_default();
        if ledger.pending().is_some() {
            return Err(OfferError::AlreadyPending.into());
        }
        ledger.begin_round();
    }

    info!(order_id = %order_id, operator_id = %actor.id, "redispatch requested");
    try_enqueue_order(state, order_id)
}
