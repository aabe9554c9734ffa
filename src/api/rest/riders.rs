use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::routing::{get, patch, post};
use axum::Json;
use axum::Router;
use chrono::Utc;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::api::rest::auth::Caller;
use crate::engine::assignment::requeue_delayed;
use crate::engine::orders::{rider_orders, RiderOrderScope};
use crate::engine::positions::record_rider_location;
use crate::error::AppError;
use crate::models::actor::{Actor, ActorRole};
use crate::models::location::LocationSample;
use crate::models::order::Order;
use crate::models::rider::{GeoPoint, Rider, RiderStatus};
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/riders", post(create_rider).get(list_riders))
        .route("/riders/:id/status", patch(update_rider_status))
        .route("/riders/:id/location", patch(update_rider_location))
        .route("/riders/:id/orders", get(list_rider_orders))
}

#[derive(Deserialize)]
pub struct CreateRiderRequest {
    pub name: String,
    pub location: GeoPoint,
    pub capacity: u8,
    pub rating: f64,
    #[serde(default)]
    pub completed_deliveries: u32,
}

#[derive(Deserialize)]
pub struct UpdateStatusRequest {
    pub status: RiderStatus,
}

#[derive(Deserialize)]
pub struct OrdersQuery {
    #[serde(default)]
    pub scope: RiderOrderScope,
}

#[derive(Serialize)]
pub struct LocationAck {
    pub rider_id: Uuid,
    pub orders_updated: usize,
}

fn require_operator(actor: &Actor) -> Result<(), AppError> {
    if actor.role == ActorRole::Operator {
        Ok(())
    } else {
        Err(AppError::Forbidden("operator credential required".to_string()))
    }
}

async fn create_rider(
    State(state): State<Arc<AppState>>,
    Caller(actor): Caller,
    Json(payload): Json<CreateRiderRequest>,
) -> Result<Json<Rider>, AppError> {
    require_operator(&actor)?;

    if payload.name.trim().is_empty() {
        return Err(AppError::BadRequest("name cannot be empty".to_string()));
    }

    if payload.capacity == 0 {
        return Err(AppError::BadRequest("capacity must be > 0".to_string()));
    }

    if !payload.location.is_valid() {
        return Err(AppError::BadRequest("location out of range".to_string()));
    }

    let rider = Rider {
        id: Uuid::new_v4(),
        name: payload.name,
        location: payload.location,
        capacity: payload.capacity,
        current_load: 0,
        status: RiderStatus::Available,
        rating: payload.rating.clamp(0.0, 5.0),
        completed_deliveries: payload.completed_deliveries,
        earnings: Decimal::ZERO,
        updated_at: Utc::now(),
    };

    state.riders.insert(rider.id, rider.clone());
    state
        .metrics
        .rider_utilization
        .with_label_values(&[&rider.id.to_string()])
        .set(0.0);

    tracing::info!(rider_id = %rider.id, name = %rider.name, "rider registered");
    requeue_delayed(&state);

    Ok(Json(rider))
}

async fn list_riders(
    State(state): State<Arc<AppState>>,
    Caller(actor): Caller,
) -> Result<Json<Vec<Rider>>, AppError> {
    require_operator(&actor)?;

    let mut riders: Vec<Rider> = state
        .riders
        .iter()
        .map(|entry| entry.value().clone())
        .collect();
    riders.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(Json(riders))
}

async fn update_rider_status(
    State(state): State<Arc<AppState>>,
    Caller(actor): Caller,
    Path(id): Path<Uuid>,
    Json(payload): Json<UpdateStatusRequest>,
) -> Result<Json<Rider>, AppError> {
    let permitted = actor.role == ActorRole::Operator
        || (actor.role == ActorRole::Rider && actor.id == id);
    if !permitted {
        return Err(AppError::Forbidden("riders may only change their own status".to_string()));
    }

    let rider = {
        let mut rider = state
            .riders
            .get_mut(&id)
            .ok_or_else(|| AppError::NotFound(format!("rider {id} not found")))?;

        rider.status = payload.status;
        rider.updated_at = Utc::now();
        rider.clone()
    };

    tracing::info!(rider_id = %id, status = ?rider.status, "rider status changed");

    if rider.can_take_order() {
        requeue_delayed(&state);
    }

    Ok(Json(rider))
}

async fn update_rider_location(
    State(state): State<Arc<AppState>>,
    Caller(actor): Caller,
    Path(id): Path<Uuid>,
    Json(sample): Json<LocationSample>,
) -> Result<Json<LocationAck>, AppError> {
    let orders_updated = record_rider_location(&state, &actor, id, sample)?;
    Ok(Json(LocationAck {
        rider_id: id,
        orders_updated,
    }))
}

async fn list_rider_orders(
    State(state): State<Arc<AppState>>,
    Caller(actor): Caller,
    Path(id): Path<Uuid>,
    Query(query): Query<OrdersQuery>,
) -> Result<Json<Vec<Order>>, AppError> {
    Ok(Json(rider_orders(&state, &actor, id, query.scope)?))
}
