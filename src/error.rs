use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

use crate::models::actor::ActorRole;
use crate::models::offer::OfferOutcome;
use crate::models::order::OrderStatus;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("offer for order {0} expired before the decision arrived")]
    OfferExpired(uuid::Uuid),

    #[error("internal error: {0}")]
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            AppError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg.clone()),
            AppError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg.clone()),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, msg.clone()),
            AppError::OfferExpired(_) => (StatusCode::CONFLICT, self.to_string()),
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg.clone()),
        };

        let body = Json(json!({
            "error": message
        }));

        (status, body).into_response()
    }
}

/// Reasons the order state machine refuses a transition.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum TransitionError {
    #[error("order is already {0} and accepts no further transitions")]
    Terminal(OrderStatus),

    #[error("cannot move order from {from} to {to}")]
    Invalid { from: OrderStatus, to: OrderStatus },

    #[error("{role} may not move an order to {to}")]
    NotPermitted { role: ActorRole, to: OrderStatus },
}

impl From<TransitionError> for AppError {
    fn from(err: TransitionError) -> Self {
        match err {
            TransitionError::NotPermitted { .. } => AppError::Forbidden(err.to_string()),
            TransitionError::Terminal(_) | TransitionError::Invalid { .. } => {
                AppError::Conflict(err.to_string())
            }
        }
    }
}

/// Offer ledger violations.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum OfferError {
    #[error("offer already resolved as {0}")]
    AlreadyResolved(OfferOutcome),

    #[error("order already has a pending offer")]
    AlreadyPending,

    #[error("an offer cannot be resolved back to pending")]
    PendingOutcome,
}

impl From<OfferError> for AppError {
    fn from(err: OfferError) -> Self {
        AppError::Conflict(err.to_string())
    }
}

/// A money amount left the range `Decimal` can represent.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("order amount out of range")]
pub struct AmountOverflow;

impl From<AmountOverflow> for AppError {
    fn from(err: AmountOverflow) -> Self {
        AppError::BadRequest(err.to_string())
    }
}
