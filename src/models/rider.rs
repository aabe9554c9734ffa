use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
}

impl GeoPoint {
    pub fn is_valid(&self) -> bool {
        (-90.0..=90.0).contains(&self.lat) && (-180.0..=180.0).contains(&self.lng)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RiderStatus {
    Available,
    Busy,
    Offline,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rider {
    pub id: Uuid,
    pub name: String,
    pub location: GeoPoint,
    pub capacity: u8,
    pub current_load: u8,
    pub status: RiderStatus,
    pub rating: f64,
    pub completed_deliveries: u32,
    pub earnings: Decimal,
    pub updated_at: DateTime<Utc>,
}

impl Rider {
    pub fn can_take_order(&self) -> bool {
        self.status == RiderStatus::Available && self.current_load < self.capacity
    }

    pub fn utilization(&self) -> f64 {
        if self.capacity == 0 {
            return 1.0;
        }
        self.current_load as f64 / self.capacity as f64
    }

    /// Called when the rider commits to an order.
    pub fn take_load(&mut self, now: DateTime<Utc>) {
        self.current_load = self.current_load.saturating_add(1);
        if self.current_load >= self.capacity {
            self.status = RiderStatus::Busy;
        }
        self.updated_at = now;
    }

    /// Called when a committed order reaches a terminal state.
    pub fn release_load(&mut self, now: DateTime<Utc>) {
        self.current_load = self.current_load.saturating_sub(1);
        if self.status == RiderStatus::Busy && self.current_load < self.capacity {
            self.status = RiderStatus::Available;
        }
        self.updated_at = now;
    }
}
