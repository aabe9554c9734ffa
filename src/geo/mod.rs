use crate::models::rider::GeoPoint;

const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Two-wheel urban delivery speed used when no live speed is known.
pub const DEFAULT_AVERAGE_SPEED_KMH: f64 = 30.0;

pub fn haversine_m(a: &GeoPoint, b: &GeoPoint) -> f64 {
    let lat1 = a.lat.to_radians();
    let lat2 = b.lat.to_radians();
    let delta_lat = (b.lat - a.lat).to_radians();
    let delta_lng = (b.lng - a.lng).to_radians();

    let sin_lat = (delta_lat / 2.0).sin();
    let sin_lng = (delta_lng / 2.0).sin();

    let haversine = sin_lat * sin_lat + lat1.cos() * lat2.cos() * sin_lng * sin_lng;
    let central_angle = 2.0 * haversine.sqrt().asin();

    EARTH_RADIUS_M * central_angle
}

pub fn haversine_km(a: &GeoPoint, b: &GeoPoint) -> f64 {
    haversine_m(a, b) / 1000.0
}

/// Whole minutes to cover `distance_m` at `speed_kmh`, rounded up.
///
/// A non-positive or non-finite speed falls back to
/// [`DEFAULT_AVERAGE_SPEED_KMH`].
pub fn eta_minutes(distance_m: f64, speed_kmh: f64) -> u32 {
    let speed = if speed_kmh.is_finite() && speed_kmh > 0.0 {
        speed_kmh
    } else {
        DEFAULT_AVERAGE_SPEED_KMH
    };

    let minutes = (distance_m.max(0.0) / 1000.0 / speed * 60.0).ceil();
    minutes.min(u32::MAX as f64) as u32
}

pub fn format_distance(meters: f64) -> String {
    if meters < 1000.0 {
        format!("{}m", meters.round() as i64)
    } else {
        format!("{:.1}km", meters / 1000.0)
    }
}

pub fn format_eta(minutes: u32) -> String {
    match minutes {
        0 => "less than 1 min".to_string(),
        1 => "1 minute".to_string(),
        2..=59 => format!("{minutes} minutes"),
        _ => {
            let hours = minutes / 60;
            let rest = minutes % 60;
            if rest == 0 {
                format!("{hours}h")
            } else {
                format!("{hours}h {rest}m")
            }
        }
    }
}
