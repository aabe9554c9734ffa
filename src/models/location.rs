use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::rider::GeoPoint;

/// One device position fix. Transient: consumed, never stored by devices.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LocationSample {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default)]
    pub accuracy: Option<f64>,
    #[serde(default)]
    pub heading: Option<f64>,
    /// Metres per second.
    #[serde(default)]
    pub speed: Option<f64>,
    pub captured_at: DateTime<Utc>,
}

impl LocationSample {
    pub fn at(point: GeoPoint, captured_at: DateTime<Utc>) -> Self {
        Self {
            latitude: point.lat,
            longitude: point.lng,
            accuracy: None,
            heading: None,
            speed: None,
            captured_at,
        }
    }

    pub fn point(&self) -> GeoPoint {
        GeoPoint {
            lat: self.latitude,
            lng: self.longitude,
        }
    }

    /// Live speed in km/h, when the device reported a positive one.
    pub fn speed_kmh(&self) -> Option<f64> {
        self.speed
            .filter(|speed| speed.is_finite() && *speed > 0.0)
            .map(|speed| speed * 3.6)
    }

    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.captured_at).to_std().unwrap_or(Duration::ZERO)
    }

    pub fn is_stale(&self, now: DateTime<Utc>, threshold: Duration) -> bool {
        self.age(now) > threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_goes_stale_after_threshold() {
        let now = Utc::now();
        let point = GeoPoint { lat: 1.0, lng: 2.0 };
        let sample = LocationSample::at(point, now - chrono::Duration::seconds(25));

        assert!(sample.is_stale(now, Duration::from_secs(20)));
        assert!(!sample.is_stale(now, Duration::from_secs(30)));
    }

    #[test]
    fn future_timestamps_are_never_stale() {
        let now = Utc::now();
        let point = GeoPoint { lat: 1.0, lng: 2.0 };
        let sample = LocationSample::at(point, now + chrono::Duration::seconds(5));
        assert_eq!(sample.age(now), Duration::ZERO);
    }

    #[test]
    fn zero_speed_is_treated_as_unknown() {
        let mut sample = LocationSample::at(GeoPoint { lat: 0.0, lng: 0.0 }, Utc::now());
        sample.speed = Some(0.0);
        assert_eq!(sample.speed_kmh(), None);

        sample.speed = Some(10.0);
        let kmh = sample.speed_kmh().unwrap();
        assert!((kmh - 36.0).abs() < 1e-9);
    }
}
