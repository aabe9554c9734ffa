use std::sync::Arc;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use crate::client::error::BackendError;
use crate::config::ClientConfig;
use crate::engine::orders::{self, RiderOrderScope};
use crate::engine::positions;
use crate::models::actor::Actor;
use crate::models::location::LocationSample;
use crate::models::offer::AssignmentOffer;
use crate::models::order::Order;
use crate::state::AppState;

/// Request/response calls a device makes next to the live channel.
#[async_trait]
pub trait OrderBackend: Send + Sync + 'static {
    async fn fetch_order(&self, order_id: Uuid) -> Result<Order, BackendError>;

    async fn fetch_offer(&self, order_id: Uuid) -> Result<AssignmentOffer, BackendError>;

    async fn push_location(
        &self,
        rider_id: Uuid,
        sample: LocationSample,
    ) -> Result<(), BackendError>;

    async fn rider_orders(
        &self,
        rider_id: Uuid,
        scope: RiderOrderScope,
    ) -> Result<Vec<Order>, BackendError>;
}

/// In-process backend acting as `actor`, for embedding the device
/// components next to the server.
pub struct LocalBackend {
    state: Arc<AppState>,
    actor: Actor,
}

impl LocalBackend {
    pub fn new(state: Arc<AppState>, actor: Actor) -> Self {
        Self { state, actor }
    }
}

#[async_trait]
impl OrderBackend for LocalBackend {
    async fn fetch_order(&self, order_id: Uuid) -> Result<Order, BackendError> {
        Ok(orders::order_snapshot(&self.state, &self.actor, order_id)?)
    }

    async fn fetch_offer(&self, order_id: Uuid) -> Result<AssignmentOffer, BackendError> {
        Ok(orders::current_offer(&self.state, &self.actor, order_id)?)
    }

    async fn push_location(
        &self,
        rider_id: Uuid,
        sample: LocationSample,
    ) -> Result<(), BackendError> {
        positions::record_rider_location(&self.state, &self.actor, rider_id, sample)?;
        Ok(())
    }

    async fn rider_orders(
        &self,
        rider_id: Uuid,
        scope: RiderOrderScope,
    ) -> Result<Vec<Order>, BackendError> {
        Ok(orders::rider_orders(&self.state, &self.actor, rider_id, scope)?)
    }
}

/// Backend reached over the REST API, authenticated as `actor`.
pub struct HttpBackend {
    client: Client,
    base_url: String,
    credential: String,
}

impl HttpBackend {
    pub fn new(config: &ClientConfig, actor: &Actor) -> Result<Self, BackendError> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|err| {
                BackendError::Unavailable(format!("failed to create HTTP client: {err}"))
            })?;

        Ok(Self {
            client,
            base_url: config.api_url.trim_end_matches('/').to_string(),
            credential: actor.credential(),
        })
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, BackendError> {
        let response = request
            .bearer_auth(&self.credential)
            .send()
            .await
            .map_err(|err| BackendError::Unavailable(format!("request failed: {err}")))?;

        if response.status().is_success() {
            response
                .json()
                .await
                .map_err(|err| BackendError::Unavailable(format!("invalid response body: {err}")))
        } else {
            Err(error_from_response(response).await)
        }
    }
}

async fn error_from_response(response: Response) -> BackendError {
    let status = response.status();
    let message = response
        .json::<Value>()
        .await
        .ok()
        .and_then(|body| body["error"].as_str().map(str::to_string))
        .unwrap_or_else(|| status.to_string());

    debug!(status = %status, error = %message, "backend refused request");

    match status {
        StatusCode::NOT_FOUND => BackendError::NotFound(message),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => BackendError::Forbidden(message),
        StatusCode::BAD_REQUEST | StatusCode::CONFLICT | StatusCode::UNPROCESSABLE_ENTITY => {
            BackendError::Rejected(message)
        }
        _ => BackendError::Unavailable(format!("{status}: {message}")),
    }
}

#[async_trait]
impl OrderBackend for HttpBackend {
    async fn fetch_order(&self, order_id: Uuid) -> Result<Order, BackendError> {
        let url = format!("{}/orders/{order_id}", self.base_url);
        self.send(self.client.get(&url)).await
    }

    async fn fetch_offer(&self, order_id: Uuid) -> Result<AssignmentOffer, BackendError> {
        let url = format!("{}/orders/{order_id}/offer", self.base_url);
        self.send(self.client.get(&url)).await
    }

    async fn push_location(
        &self,
        rider_id: Uuid,
        sample: LocationSample,
    ) -> Result<(), BackendError> {
        let url = format!("{}/riders/{rider_id}/location", self.base_url);
        let _ack: Value = self.send(self.client.patch(&url).json(&sample)).await?;
        Ok(())
    }

    async fn rider_orders(
        &self,
        rider_id: Uuid,
        scope: RiderOrderScope,
    ) -> Result<Vec<Order>, BackendError> {
        let url = format!("{}/riders/{rider_id}/orders", self.base_url);
        self.send(self.client.get(&url).query(&[("scope", scope)])).await
    }
}
