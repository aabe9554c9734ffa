use thiserror::Error;

use crate::error::AppError;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChannelError {
    #[error("a connection attempt is already in progress")]
    ConnectInProgress,

    #[error("failed to open channel: {0}")]
    Connect(String),

    #[error("connection attempt abandoned by disconnect")]
    Aborted,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LocationError {
    #[error("location permission denied")]
    PermissionDenied,

    #[error("position unavailable: {0}")]
    Unavailable(String),
}

/// Failures of the request/response seam between a device and the backend.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BackendError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("not permitted: {0}")]
    Forbidden(String),

    #[error("rejected: {0}")]
    Rejected(String),

    #[error("backend unavailable: {0}")]
    Unavailable(String),
}

impl BackendError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, BackendError::Unavailable(_))
    }
}

impl From<AppError> for BackendError {
    fn from(err: AppError) -> Self {
        match err {
            AppError::NotFound(msg) => BackendError::NotFound(msg),
            AppError::Unauthorized(msg) | AppError::Forbidden(msg) => BackendError::Forbidden(msg),
            AppError::BadRequest(msg) | AppError::Conflict(msg) => BackendError::Rejected(msg),
            err @ AppError::OfferExpired(_) => BackendError::Rejected(err.to_string()),
            AppError::Internal(msg) => BackendError::Unavailable(msg),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TrackingError {
    /// The snapshot could not be loaded; live updates stay blocked until a
    /// later load succeeds.
    #[error("order snapshot unavailable: {0}")]
    SnapshotUnavailable(BackendError),
}

impl TrackingError {
    pub fn is_retryable(&self) -> bool {
        true
    }
}

/// Reasons a device refuses to send an offer decision.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DecisionError {
    #[error("no offer is being shown")]
    NoOffer,

    #[error("offer countdown has run out")]
    Expired,

    #[error("a decision was already sent for this offer")]
    AlreadyDecided,

    #[error("channel is not open; decision not sent")]
    NotSent,
}
