use std::sync::Arc;

use axum::extract::{Path, State};
use axum::routing::{get, post, put};
use axum::Json;
use axum::Router;
use serde::Deserialize;
use uuid::Uuid;

use crate::api::rest::auth::Caller;
use crate::engine::assignment::redispatch;
use crate::engine::lifecycle::{commit_transition, StatusChange};
use crate::engine::orders::{order_snapshot, place_order, NewOrder};
use crate::error::AppError;
use crate::models::order::{Order, OrderStatus};
use crate::models::rider::GeoPoint;
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/orders", post(create_order))
        .route("/orders/:id", get(get_order))
        .route("/orders/:id/status", put(update_order_status))
        .route("/orders/:id/redispatch", post(redispatch_order))
}

#[derive(Deserialize)]
pub struct UpdateStatusRequest {
    pub status: OrderStatus,
    #[serde(default)]
    pub location: Option<GeoPoint>,
    #[serde(default)]
    pub note: Option<String>,
}

async fn create_order(
    State(state): State<Arc<AppState>>,
    Caller(actor): Caller,
    Json(payload): Json<NewOrder>,
) -> Result<Json<Order>, AppError> {
    let order = place_order(&state, &actor, payload).await?;
    Ok(Json(order))
}

async fn get_order(
    State(state): State<Arc<AppState>>,
    Caller(actor): Caller,
    Path(id): Path<Uuid>,
) -> Result<Json<Order>, AppError> {
    Ok(Json(order_snapshot(&state, &actor, id)?))
}

async fn update_order_status(
    State(state): State<Arc<AppState>>,
    Caller(actor): Caller,
    Path(id): Path<Uuid>,
    Json(payload): Json<UpdateStatusRequest>,
) -> Result<Json<Order>, AppError> {
    if payload.status == OrderStatus::Accepted {
        return Err(AppError::BadRequest(
            "accept the offer through /orders/:id/offer/accept".to_string(),
        ));
    }
    if payload.location.is_some_and(|location| !location.is_valid()) {
        return Err(AppError::BadRequest("location out of range".to_string()));
    }

    let change = StatusChange {
        to: payload.status,
        actor,
        location: payload.location,
        note: payload.note,
    };

    let order = commit_transition(&state, id, change)?;
    Ok(Json(order))
}

async fn redispatch_order(
    State(state): State<Arc<AppState>>,
    Caller(actor): Caller,
    Path(id): Path<Uuid>,
) -> Result<Json<Order>, AppError> {
    redispatch(&state, &actor, id)?;
    Ok(Json(order_snapshot(&state, &actor, id)?))
}
