//! Tracking view for one order: a snapshot fetched from the backend,
//! advanced by the live `rider_location` stream.
//!
//! Snapshot and stream are not ordered relative to each other, so every
//! reconnect and every status change re-fetches the snapshot instead of
//! trusting the stream to be complete.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::client::backend::OrderBackend;
use crate::client::channel::{Channel, Subscription};
use crate::client::error::{BackendError, TrackingError};
use crate::geo::{eta_minutes, format_distance, format_eta, haversine_m};
use crate::models::envelope::{events, RiderLocationPayload, StatusUpdatePayload};
use crate::models::location::LocationSample;
use crate::models::order::{Order, OrderStatus, StatusEntry};
use crate::models::rider::GeoPoint;

#[derive(Debug, Clone)]
enum Baseline {
    Unloaded,
    Loaded(Box<Order>),
    Failed(BackendError),
}

#[derive(Debug, Clone)]
struct LivePosition {
    rider_id: Option<Uuid>,
    sample: LocationSample,
    distance_m: f64,
    eta_minutes: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct TrackingView {
    pub order_id: Uuid,
    pub status: OrderStatus,
    pub rider_id: Option<Uuid>,
    pub target: GeoPoint,
    pub address: String,
    pub rider_position: Option<GeoPoint>,
    pub position_at: Option<DateTime<Utc>>,
    pub distance_m: Option<f64>,
    pub eta_minutes: Option<u32>,
    pub distance_label: Option<String>,
    pub eta_label: Option<String>,
    pub position_stale: bool,
    pub history: Vec<StatusEntry>,
}

struct TrackingState {
    baseline: Baseline,
    live: Option<LivePosition>,
}

struct Shared {
    backend: Arc<dyn OrderBackend>,
    order_id: Uuid,
    stale_after: Duration,
    average_speed_kmh: f64,
    state: Mutex<TrackingState>,
    subscriptions: Mutex<Vec<Subscription>>,
}

#[derive(Clone)]
pub struct TrackingAggregator {
    shared: Arc<Shared>,
}

impl TrackingAggregator {
    pub fn new(
        backend: Arc<dyn OrderBackend>,
        order_id: Uuid,
        stale_after: Duration,
        average_speed_kmh: f64,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                backend,
                order_id,
                stale_after,
                average_speed_kmh,
                state: Mutex::new(TrackingState {
                    baseline: Baseline::Unloaded,
                    live: None,
                }),
                subscriptions: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn order_id(&self) -> Uuid {
        self.shared.order_id
    }

    fn state(&self) -> MutexGuard<'_, TrackingState> {
        self.shared.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fetches the snapshot. On failure live updates are blocked until a
    /// later load succeeds.
    pub async fn load(&self) -> Result<TrackingView, TrackingError> {
        let order_id = self.shared.order_id;

        match self.shared.backend.fetch_order(order_id).await {
            Ok(order) => {
                let mut state = self.state();
                let rider_id = order.rider_id;
                if state.live.as_ref().is_some_and(|live| live.rider_id != rider_id) {
                    debug!(order_id = %order_id, "rider changed, live position cleared");
                    state.live = None;
                }

                let seeded = order.tracking.current_location.as_ref().map(|point| {
                    LocationSample::at(point.location, point.recorded_at)
                });
                let target = order.delivery.location;
                state.baseline = Baseline::Loaded(Box::new(order));

                if let Some(sample) = seeded {
                    let newer = state
                        .live
                        .as_ref()
                        .is_none_or(|live| live.sample.captured_at < sample.captured_at);
                    if newer {
                        state.live = Some(self.position(rider_id, sample, &target));
                    }
                }

                debug!(order_id = %order_id, "tracking snapshot loaded");
                let missing = BackendError::NotFound(order_id.to_string());
                self.render(&state, Utc::now())
                    .ok_or(TrackingError::SnapshotUnavailable(missing))
            }
            Err(err) => {
                warn!(order_id = %order_id, error = %err, "tracking snapshot unavailable");
                self.state().baseline = Baseline::Failed(err.clone());
                Err(TrackingError::SnapshotUnavailable(err))
            }
        }
    }

    pub fn is_loaded(&self) -> bool {
        matches!(self.state().baseline, Baseline::Loaded(_))
    }

    /// Error of the last failed load, if the snapshot is currently missing.
    pub fn last_error(&self) -> Option<TrackingError> {
        match &self.state().baseline {
            Baseline::Failed(err) => Some(TrackingError::SnapshotUnavailable(err.clone())),
            Baseline::Unloaded | Baseline::Loaded(_) => None,
        }
    }

    fn position(
        &self,
        rider_id: Option<Uuid>,
        sample: LocationSample,
        target: &GeoPoint,
    ) -> LivePosition {
        let distance_m = haversine_m(&sample.point(), target);
        let speed = sample.speed_kmh().unwrap_or(self.shared.average_speed_kmh);
        LivePosition {
            rider_id,
            eta_minutes: eta_minutes(distance_m, speed),
            distance_m,
            sample,
        }
    }

    /// Applies one live position. Returns false when the update was
    /// ignored: another order, no snapshot yet, or an older sample.
    pub fn apply_rider_location(&self, update: RiderLocationPayload) -> bool {
        if update.order_id != self.shared.order_id {
            return false;
        }

        let mut state = self.state();
        let Baseline::Loaded(order) = &state.baseline else {
            debug!(order_id = %update.order_id, "live position ignored until snapshot loads");
            return false;
        };
        if order.rider_id.is_some_and(|rider_id| rider_id != update.rider_id) {
            return false;
        }
        let target = order.delivery.location;

        let stale_update = state
            .live
            .as_ref()
            .is_some_and(|live| update.location.captured_at <= live.sample.captured_at);
        if stale_update {
            debug!(order_id = %update.order_id, "out-of-order position ignored");
            return false;
        }

        state.live = Some(self.position(Some(update.rider_id), update.location, &target));
        true
    }

    pub fn view(&self, now: DateTime<Utc>) -> Option<TrackingView> {
        self.render(&self.state(), now)
    }

    fn render(&self, state: &TrackingState, now: DateTime<Utc>) -> Option<TrackingView> {
        let Baseline::Loaded(order) = &state.baseline else {
            return None;
        };
        let live = state.live.as_ref();

        Some(TrackingView {
            order_id: order.id,
            status: order.status,
            rider_id: order.rider_id,
            target: order.delivery.location,
            address: order.delivery.address.clone(),
            rider_position: live.map(|live| live.sample.point()),
            position_at: live.map(|live| live.sample.captured_at),
            distance_m: live.map(|live| live.distance_m),
            eta_minutes: live.map(|live| live.eta_minutes),
            distance_label: live.map(|live| format_distance(live.distance_m)),
            eta_label: live.map(|live| format_eta(live.eta_minutes)),
            position_stale: live
                .is_some_and(|live| live.sample.is_stale(now, self.shared.stale_after)),
            history: order.status_history.clone(),
        })
    }

    fn refresh_in_background(&self) {
        let aggregator = self.clone();
        tokio::spawn(async move {
            if let Err(err) = aggregator.load().await {
                debug!(order_id = %aggregator.order_id(), error = %err, "tracking refresh failed");
            }
        });
    }

    /// Follows the channel: live positions are applied, and status changes
    /// of this order or a (re)connect re-fetch the snapshot.
    pub fn attach(&self, channel: &Channel) {
        let live = self.clone();
        let located = channel.on_typed(
            events::RIDER_LOCATION,
            move |update: RiderLocationPayload| {
                live.apply_rider_location(update);
            },
        );

        let changed = self.clone();
        let status = channel.on_typed(
            events::ORDER_STATUS_UPDATED,
            move |update: StatusUpdatePayload| {
                if update.order_id == changed.order_id() {
                    changed.refresh_in_background();
                }
            },
        );

        let reconnected = self.clone();
        let connected = channel.on(events::CONNECTED, move |_| {
            reconnected.refresh_in_background();
        });

        self.shared
            .subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend([located, status, connected]);
    }

    pub fn detach(&self) {
        let subscriptions: Vec<Subscription> = self
            .shared
            .subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();

        for subscription in subscriptions {
            subscription.unsubscribe();
        }
    }
}
