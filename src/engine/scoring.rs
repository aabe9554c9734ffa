use crate::geo::haversine_km;
use crate::models::offer::ScoreBreakdown;
use crate::models::rider::{GeoPoint, Rider};

const DISTANCE_WEIGHT: f64 = 0.60;
const RATING_WEIGHT: f64 = 0.25;
const EXPERIENCE_WEIGHT: f64 = 0.15;

/// Deliveries after which experience stops adding to the score.
const EXPERIENCE_CAP: f64 = 100.0;

/// Scores `rider` for a delivery to `target`. Returns the weighted score,
/// its breakdown and the straight-line distance in kilometres.
pub fn compute_score(rider: &Rider, target: &GeoPoint) -> (f64, ScoreBreakdown, f64) {
    let distance_km = haversine_km(&rider.location, target);

    let breakdown = ScoreBreakdown {
        distance_score: distance_score(distance_km),
        rating_score: rating_score(rider.rating),
        experience_score: experience_score(rider.completed_deliveries),
    };

    let score = weighted_score(&breakdown);
    (score, breakdown, distance_km)
}

pub fn weighted_score(breakdown: &ScoreBreakdown) -> f64 {
    (breakdown.distance_score * DISTANCE_WEIGHT)
        + (breakdown.rating_score * RATING_WEIGHT)
        + (breakdown.experience_score * EXPERIENCE_WEIGHT)
}

fn distance_score(distance_km: f64) -> f64 {
    1.0 / (1.0 + distance_km.max(0.0))
}

fn rating_score(rating: f64) -> f64 {
    (rating / 5.0).clamp(0.0, 1.0)
}

fn experience_score(completed_deliveries: u32) -> f64 {
    (completed_deliveries as f64 / EXPERIENCE_CAP).min(1.0)
}
