use std::sync::Arc;

use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::Json;
use axum::Router;
use uuid::Uuid;

use crate::api::rest::auth::Caller;
use crate::engine::assignment::{resolve_offer, Decision};
use crate::engine::orders::current_offer;
use crate::error::AppError;
use crate::models::offer::AssignmentOffer;
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/orders/:id/offer", get(get_offer))
        .route("/orders/:id/offer/accept", post(accept_offer))
        .route("/orders/:id/offer/reject", post(reject_offer))
}

async fn get_offer(
    State(state): State<Arc<AppState>>,
    Caller(actor): Caller,
    Path(id): Path<Uuid>,
) -> Result<Json<AssignmentOffer>, AppError> {
    Ok(Json(current_offer(&state, &actor, id)?))
}

async fn accept_offer(
    State(state): State<Arc<AppState>>,
    Caller(actor): Caller,
    Path(id): Path<Uuid>,
) -> Result<Json<AssignmentOffer>, AppError> {
    Ok(Json(resolve_offer(&state, &actor, id, Decision::Accept)?))
}

async fn reject_offer(
    State(state): State<Arc<AppState>>,
    Caller(actor): Caller,
    Path(id): Path<Uuid>,
) -> Result<Json<AssignmentOffer>, AppError> {
    Ok(Json(resolve_offer(&state, &actor, id, Decision::Reject)?))
}
