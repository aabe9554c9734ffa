pub mod auth;
pub mod offers;
pub mod orders;
pub mod riders;
pub mod ws;

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Json;
use axum::Router;
use serde::Serialize;
use tower_http::cors::CorsLayer;

use crate::state::AppState;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .merge(riders::router())
        .merge(orders::router())
        .merge(offers::router())
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/ws", get(ws::ws_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    riders: usize,
    orders: usize,
    pending_offers: usize,
}

async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let pending_offers = state
        .offers
        .iter()
        .filter(|ledger| ledger.pending().is_some())
        .count();

    Json(HealthResponse {
        status: "ok",
        riders: state.riders.len(),
        orders: state.orders.len(),
        pending_offers,
    })
}

async fn metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(err) => (StatusCode::INTERNAL_SERVER_ERROR, err).into_response(),
    }
}
