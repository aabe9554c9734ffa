use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::client::backend::OrderBackend;
use crate::client::channel::Channel;
use crate::client::error::LocationError;
use crate::config::LocationConfig;
use crate::geo::haversine_m;
use crate::models::envelope::{events, Envelope};
use crate::models::location::LocationSample;
use crate::models::rider::GeoPoint;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionStatus {
    Granted,
    Denied,
    Undetermined,
}

/// Platform positioning service.
#[async_trait]
pub trait PositionSource: Send + Sync + 'static {
    async fn permission_status(&self) -> PermissionStatus;

    /// Prompts the user when the platform allows it.
    async fn request_permission(&self) -> PermissionStatus;

    async fn current_fix(&self) -> Result<LocationSample, LocationError>;
}

/// Decides which polled fixes are worth emitting: one when `interval` has
/// passed since the last emitted sample, or sooner when the device moved at
/// least `min_distance_m`.
#[derive(Debug, Clone)]
pub struct SamplingPolicy {
    interval: Duration,
    min_distance_m: f64,
    last: Option<(Instant, GeoPoint)>,
}

impl SamplingPolicy {
    pub fn new(interval: Duration, min_distance_m: f64) -> Self {
        Self {
            interval,
            min_distance_m,
            last: None,
        }
    }

    pub fn admit(&mut self, at: Instant, point: GeoPoint) -> bool {
        let admit = match self.last {
            None => true,
            Some((last_at, last_point)) => {
                at.saturating_duration_since(last_at) >= self.interval
                    || haversine_m(&last_point, &point) >= self.min_distance_m
            }
        };

        if admit {
            self.last = Some((at, point));
        }
        admit
    }
}

pub struct LocationProducer {
    source: Arc<dyn PositionSource>,
    config: LocationConfig,
    tracker: Mutex<Option<JoinHandle<()>>>,
}

impl LocationProducer {
    pub fn new(source: Arc<dyn PositionSource>, config: LocationConfig) -> Self {
        Self {
            source,
            config,
            tracker: Mutex::new(None),
        }
    }

    fn tracker(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.tracker.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Asks for permission unless it was already granted. Never retried on
    /// its own after a refusal.
    pub async fn request_permission(&self) -> bool {
        if self.source.permission_status().await == PermissionStatus::Granted {
            return true;
        }

        let granted = self.source.request_permission().await == PermissionStatus::Granted;
        if !granted {
            warn!("location permission denied");
        }
        granted
    }

    pub async fn get_current_location(&self) -> Option<LocationSample> {
        if !self.request_permission().await {
            return None;
        }

        match self.source.current_fix().await {
            Ok(sample) => Some(sample),
            Err(err) => {
                warn!(error = %err, "could not get current location");
                None
            }
        }
    }

    /// Starts emitting samples to `callback`, stopping any earlier session.
    /// `interval` defaults to the configured one. Returns false without
    /// permission.
    pub async fn start_tracking<F>(&self, callback: F, interval_override: Option<Duration>) -> bool
    where
        F: Fn(LocationSample) + Send + Sync + 'static,
    {
        self.stop_tracking();

        if !self.request_permission().await {
            return false;
        }

        let period = interval_override.unwrap_or(self.config.interval);
        let poll = self.config.poll_interval.min(period);
        let mut policy = SamplingPolicy::new(period, self.config.min_distance_m);
        let source = Arc::clone(&self.source);

        let handle = tokio::spawn(async move {
            let mut ticker = interval(poll);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                match source.current_fix().await {
                    Ok(sample) => {
                        if policy.admit(Instant::now(), sample.point()) {
                            callback(sample);
                        }
                    }
                    Err(err) => debug!(error = %err, "position fix unavailable"),
                }
            }
        });

        if let Some(previous) = self.tracker().replace(handle) {
            previous.abort();
        }

        info!(
            interval_ms = period.as_millis() as u64,
            min_distance_m = self.config.min_distance_m,
            "location tracking started"
        );
        true
    }

    /// Stops the current session, if any.
    pub fn stop_tracking(&self) {
        if let Some(handle) = self.tracker().take() {
            handle.abort();
            info!("location tracking stopped");
        }
    }

    pub fn is_tracking(&self) -> bool {
        self.tracker()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }
}

impl Drop for LocationProducer {
    fn drop(&mut self) {
        self.stop_tracking();
    }
}

/// Callback for [`LocationProducer::start_tracking`] that forwards every
/// sample as `rider_location_update`. Samples produced while the channel is
/// closed are dropped.
pub fn relay_to_channel(channel: Channel) -> impl Fn(LocationSample) + Send + Sync + 'static {
    move |sample| match Envelope::new(events::RIDER_LOCATION_UPDATE, &sample) {
        Ok(envelope) => {
            if !channel.send(&envelope) {
                debug!("location sample not relayed");
            }
        }
        Err(err) => warn!(error = %err, "failed to encode location sample"),
    }
}

/// Callback for [`LocationProducer::start_tracking`] that reports every
/// sample of `rider_id` over the request/response backend. Must be called
/// from within a Tokio runtime.
pub fn relay_to_backend(
    backend: Arc<dyn OrderBackend>,
    rider_id: Uuid,
) -> impl Fn(LocationSample) + Send + Sync + 'static {
    move |sample| {
        let backend = Arc::clone(&backend);
        tokio::spawn(async move {
            if let Err(err) = backend.push_location(rider_id, sample).await {
                warn!(rider_id = %rider_id, error = %err, "failed to report location");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use chrono::Utc;
    use tokio::sync::mpsc;

    use super::*;

    struct FakeSource {
        permission: Mutex<PermissionStatus>,
        grant_on_request: bool,
        requests: AtomicUsize,
        point: Mutex<GeoPoint>,
    }

    impl FakeSource {
        fn new(permission: PermissionStatus, grant_on_request: bool) -> Arc<Self> {
            Arc::new(Self {
                permission: Mutex::new(permission),
                grant_on_request,
                requests: AtomicUsize::new(0),
                point: Mutex::new(GeoPoint {
                    lat: 5.6037,
                    lng: -0.187,
                }),
            })
        }
    }

    #[async_trait]
    impl PositionSource for FakeSource {
        async fn permission_status(&self) -> PermissionStatus {
            *self.permission.lock().unwrap()
        }

        async fn request_permission(&self) -> PermissionStatus {
            self.requests.fetch_add(1, Ordering::SeqCst);
            let status = if self.grant_on_request {
                PermissionStatus::Granted
            } else {
                PermissionStatus::Denied
            };
            *self.permission.lock().unwrap() = status;
            status
        }

        async fn current_fix(&self) -> Result<LocationSample, LocationError> {
            let point = *self.point.lock().unwrap();
            Ok(LocationSample::at(point, Utc::now()))
        }
    }

    fn fast_config() -> LocationConfig {
        LocationConfig {
            interval: Duration::from_millis(10_000),
            min_distance_m: 10.0,
            poll_interval: Duration::from_millis(10),
        }
    }

    #[test]
    fn policy_emits_on_interval_or_distance() {
        let start = Instant::now();
        let here = GeoPoint {
            lat: 5.6037,
            lng: -0.187,
        };
        // About 1.1 m north.
        let nudge = GeoPoint {
            lat: 5.60371,
            lng: -0.187,
        };
        // About 111 m north.
        let moved = GeoPoint {
            lat: 5.6047,
            lng: -0.187,
        };
        let mut policy = SamplingPolicy::new(Duration::from_secs(10), 10.0);

        assert!(policy.admit(start, here));
        assert!(!policy.admit(start + Duration::from_secs(1), nudge));
        assert!(policy.admit(start + Duration::from_secs(2), moved));
        assert!(!policy.admit(start + Duration::from_secs(3), moved));
        assert!(policy.admit(start + Duration::from_secs(12), moved));
    }

    #[tokio::test]
    async fn denied_permission_refuses_tracking() {
        let source = FakeSource::new(PermissionStatus::Undetermined, false);
        let producer = LocationProducer::new(source.clone(), fast_config());

        assert!(!producer.start_tracking(|_| {}, None).await);
        assert!(!producer.is_tracking());
        assert!(producer.get_current_location().await.is_none());
    }

    #[tokio::test]
    async fn granted_permission_is_not_requested_again() {
        let source = FakeSource::new(PermissionStatus::Granted, false);
        let producer = LocationProducer::new(source.clone(), fast_config());

        assert!(producer.request_permission().await);
        assert!(producer.get_current_location().await.is_some());
        assert_eq!(source.requests.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn tracking_delivers_first_fix_and_stops_twice_safely() {
        let source = FakeSource::new(PermissionStatus::Undetermined, true);
        let producer = LocationProducer::new(source.clone(), fast_config());
        let (tx, mut rx) = mpsc::unbounded_channel();

        let started = producer
            .start_tracking(
                move |sample| {
                    let _ = tx.send(sample);
                },
                None,
            )
            .await;
        assert!(started);
        assert!(producer.is_tracking());

        let first = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.latitude, 5.6037);

        producer.stop_tracking();
        producer.stop_tracking();
        assert!(!producer.is_tracking());
    }

    #[tokio::test]
    async fn restarting_replaces_the_previous_session() {
        let source = FakeSource::new(PermissionStatus::Granted, true);
        let producer = LocationProducer::new(source, fast_config());
        let first_calls = Arc::new(AtomicUsize::new(0));
        let second_calls = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&first_calls);
        let started = producer
            .start_tracking(
                move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                },
                None,
            )
            .await;
        assert!(started);
        tokio::time::sleep(Duration::from_millis(50)).await;

        let counter = Arc::clone(&second_calls);
        let started = producer
            .start_tracking(
                move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                },
                None,
            )
            .await;
        assert!(started);
        let frozen = first_calls.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(frozen, 1);
        assert_eq!(first_calls.load(Ordering::SeqCst), frozen);
        assert_eq!(second_calls.load(Ordering::SeqCst), 1);
        producer.stop_tracking();
    }
}
