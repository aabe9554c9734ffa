use chrono::Utc;
use tracing::debug;
use uuid::Uuid;

use crate::error::AppError;
use crate::models::actor::{Actor, ActorRole};
use crate::models::envelope::{events, RiderLocationPayload};
use crate::models::location::LocationSample;
use crate::state::{AppState, Audience};

/// Stores a rider's position fix and relays it to the customer of every
/// order the rider is currently carrying. Returns how many orders were
/// updated.
pub fn record_rider_location(
    state: &AppState,
    actor: &Actor,
    rider_id: Uuid,
    sample: LocationSample,
) -> Result<usize, AppError> {
    let may_report = match actor.role {
        ActorRole::Rider => actor.id == rider_id,
        ActorRole::Operator => true,
        ActorRole::Customer | ActorRole::System => false,
    };
    if !may_report {
        return Err(AppError::Forbidden(
            "only the rider may report its own location".to_string(),
        ));
    }

    let point = sample.point();
    if !point.is_valid() {
        return Err(AppError::BadRequest(format!(
            "coordinates out of range: {}, {}",
            point.lat, point.lng
        )));
    }

    {
        let mut rider = state
            .riders
            .get_mut(&rider_id)
            .ok_or_else(|| AppError::NotFound(format!("rider {rider_id} not found")))?;
        rider.location = point;
        rider.updated_at = Utc::now();
    }

    let mut relayed = Vec::new();
    for mut order in state.orders.iter_mut() {
        if order.rider_id != Some(rider_id) || !order.status.is_active_delivery() {
            continue;
        }
        order.tracking.record_position(point, sample.captured_at);
        relayed.push((order.id, order.customer_id));
    }

    for (order_id, customer_id) in &relayed {
        state.publish(
            vec![Audience::Customer(*customer_id)],
            events::RIDER_LOCATION,
            &RiderLocationPayload {
                order_id: *order_id,
                rider_id,
                location: sample.clone(),
            },
        );
    }

    debug!(
        rider_id = %rider_id,
        lat = point.lat,
        lng = point.lng,
        orders = relayed.len(),
        "rider location recorded"
    );

    Ok(relayed.len())
}
