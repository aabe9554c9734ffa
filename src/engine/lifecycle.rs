//! Order lifecycle state machine.
//!
//! `pending -> assigned -> accepted -> picked_up -> in_transit -> nearby ->
//! delivered`, with `nearby` optional and `cancelled` / `failed` reachable
//! from every non-terminal state. History is append-only and its last entry
//! always carries the current status.

use chrono::{DateTime, Utc};
use tracing::info;
use uuid::Uuid;

use crate::engine::assignment;
use crate::error::{AppError, TransitionError};
use crate::models::actor::{Actor, ActorRole};
use crate::models::envelope::{events, EarningsPayload, StatusUpdatePayload};
use crate::models::offer::OfferOutcome;
use crate::models::order::{
    Cancellation, Order, OrderStatus, PaymentMethod, PaymentStatus, StatusEntry,
};
use crate::models::rider::GeoPoint;
use crate::state::{AppState, Audience};

#[derive(Debug, Clone)]
pub struct StatusChange {
    pub to: OrderStatus,
    pub actor: Actor,
    pub location: Option<GeoPoint>,
    pub note: Option<String>,
}

impl StatusChange {
    pub fn new(to: OrderStatus, actor: Actor) -> Self {
        Self {
            to,
            actor,
            location: None,
            note: None,
        }
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }

    pub fn with_location(mut self, location: Option<GeoPoint>) -> Self {
        self.location = location;
        self
    }
}

/// Whether `from -> to` is an edge of the lifecycle graph.
pub fn is_edge(from: OrderStatus, to: OrderStatus) -> bool {
    use OrderStatus::*;

    if from.is_terminal() {
        return false;
    }

    matches!(
        (from, to),
        (Pending, Assigned)
            | (Assigned, Accepted)
            | (Accepted, PickedUp)
            | (PickedUp, InTransit)
            | (InTransit, Nearby)
            | (InTransit, Delivered)
            | (Nearby, Delivered)
            | (_, Cancelled)
            | (_, Failed)
    )
}

fn authorize(order: &Order, actor: &Actor, to: OrderStatus) -> Result<(), TransitionError> {
    let allowed = match to {
        OrderStatus::Assigned => matches!(actor.role, ActorRole::System | ActorRole::Operator),
        OrderStatus::Cancelled => match actor.role {
            ActorRole::Operator => true,
            ActorRole::Customer => order.customer_id == actor.id,
            _ => false,
        },
        OrderStatus::Failed => actor.role == ActorRole::Operator,
        OrderStatus::Pending => false,
        _ => match actor.role {
            ActorRole::Operator => true,
            ActorRole::Rider => order.rider_id == Some(actor.id),
            _ => false,
        },
    };

    if allowed {
        Ok(())
    } else {
        Err(TransitionError::NotPermitted {
            role: actor.role,
            to,
        })
    }
}

/// Applies one transition to `order` in place.
pub fn transition(
    order: &mut Order,
    change: StatusChange,
    at: DateTime<Utc>,
) -> Result<StatusEntry, TransitionError> {
    let from = order.status;
    if from.is_terminal() {
        return Err(TransitionError::Terminal(from));
    }
    if !is_edge(from, change.to) {
        return Err(TransitionError::Invalid { from, to: change.to });
    }
    authorize(order, &change.actor, change.to)?;

    order.status = change.to;
    order.tracking.stamp(change.to, at);

    if let Some(location) = change.location {
        order.tracking.record_position(location, at);
    }

    match change.to {
        OrderStatus::Delivered if order.payment.method == PaymentMethod::Cash => {
            order.payment.status = PaymentStatus::Paid;
            order.payment.paid_at = Some(at);
        }
        OrderStatus::Cancelled => {
            order.cancellation = Some(Cancellation {
                by: change.actor.role,
                reason: change.note.clone(),
                at,
            });
        }
        _ => {}
    }

    let entry = StatusEntry {
        status: change.to,
        timestamp: at,
        location: change.location,
        note: change.note,
        actor: Some(change.actor),
    };
    order.status_history.push(entry.clone());
    order.updated_at = at;

    Ok(entry)
}

/// Commits a transition against the backend of record and settles its
/// side effects. The order's map entry is held for the mutation, which
/// serializes concurrent transitions of the same order.
pub fn commit_transition(
    state: &AppState,
    order_id: Uuid,
    change: StatusChange,
) -> Result<Order, AppError> {
    let now = Utc::now();

    let (order, previous) = {
        let mut order = state
            .orders
            .get_mut(&order_id)
            .ok_or_else(|| AppError::NotFound(format!("order {order_id} not found")))?;
        let previous = order.status;
        transition(&mut order, change, now)?;
        (order.clone(), previous)
    };

    record_committed(state, &order, previous);

    if order.status.is_terminal() {
        settle_terminal(state, &order, now);
    }

    Ok(order)
}

/// Metrics, log line and `order_status_updated` fan-out for a committed
/// transition.
pub(crate) fn record_committed(state: &AppState, order: &Order, previous: OrderStatus) {
    state
        .metrics
        .order_transitions_total
        .with_label_values(&[order.status.as_str()])
        .inc();

    info!(
        order_id = %order.id,
        from = %previous,
        to = %order.status,
        "order transitioned"
    );

    let Some(entry) = order.status_history.last() else {
        return;
    };

    let mut audience = vec![Audience::Customer(order.customer_id)];
    if let Some(rider_id) = order.rider_id {
        audience.push(Audience::Rider(rider_id));
    }

    state.publish(
        audience,
        events::ORDER_STATUS_UPDATED,
        &StatusUpdatePayload {
            order_id: order.id,
            status: order.status,
            previous_status: previous,
            rider_id: order.rider_id,
            timestamp: entry.timestamp,
            location: entry.location,
            note: entry.note.clone(),
        },
    );
}

fn settle_terminal(state: &AppState, order: &Order, now: DateTime<Utc>) {
    // A pending offer can no longer be taken up.
    let withdrawn = state.offers.get_mut(&order.id).and_then(|mut ledger| {
        let offer = ledger.current_mut().filter(|offer| offer.is_pending())?;
        offer.resolve(OfferOutcome::Expired, now).ok()?;
        Some(offer.clone())
    });
    if let Some(offer) = withdrawn {
        state.disarm_offer_timer(order.id, offer.id);
        assignment::publish_resolution(state, &offer, Some(format!("order {}", order.status)));
    }

    let Some(rider_id) = order.rider_id else {
        return;
    };
    if order.tracking.accepted_at.is_none() {
        return;
    }

    let freed = {
        let Some(mut rider) = state.riders.get_mut(&rider_id) else {
            return;
        };
        rider.release_load(now);
        state
            .metrics
            .rider_utilization
            .with_label_values(&[&rider_id.to_string()])
            .set(rider.utilization());

        if order.status == OrderStatus::Delivered {
            rider.completed_deliveries = rider.completed_deliveries.saturating_add(1);
            rider.earnings += order.payment.delivery_fee;

            let payload = EarningsPayload {
                rider_id,
                order_id: order.id,
                earnings: rider.earnings,
                completed_deliveries: rider.completed_deliveries,
            };
            state.publish(vec![Audience::Rider(rider_id)], events::EARNINGS_UPDATED, &payload);
        }

        rider.can_take_order()
    };

    if freed {
        assignment::requeue_delayed(state);
    }
}
