use axum::extract::FromRequestParts;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;

use crate::error::AppError;
use crate::models::actor::Actor;

/// Caller identity taken from `Authorization: Bearer <role>:<uuid>`.
pub struct Caller(pub Actor);

#[axum::async_trait]
impl<S> FromRequestParts<S> for Caller
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(AUTHORIZATION)
            .ok_or_else(|| AppError::Unauthorized("missing bearer credential".to_string()))?;

        let raw = header
            .to_str()
            .map_err(|_| AppError::Unauthorized("credential is not valid text".to_string()))?;

        let token = raw
            .strip_prefix("Bearer ")
            .ok_or_else(|| AppError::Unauthorized("expected a bearer credential".to_string()))?;

        token
            .trim()
            .parse::<Actor>()
            .map(Caller)
            .map_err(|err| AppError::Unauthorized(err.to_string()))
    }
}
