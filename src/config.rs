use std::env;
use std::time::Duration;

use rust_decimal::Decimal;

use crate::error::AppError;

#[derive(Debug, Clone)]
pub struct Config {
    pub http_port: u16,
    pub log_level: String,
    pub log_format: LogFormat,
    pub order_queue_size: usize,
    pub event_buffer_size: usize,
    pub dispatch: DispatchSettings,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Compact,
    Json,
}

/// Knobs of the assignment-offer protocol and order pricing on the backend.
#[derive(Debug, Clone)]
pub struct DispatchSettings {
    pub offer_timeout: Duration,
    pub max_offer_attempts: usize,
    pub max_assignment_distance_km: f64,
    pub default_delivery_fee: Decimal,
    pub average_speed_kmh: f64,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            offer_timeout: Duration::from_secs(30),
            max_offer_attempts: 5,
            max_assignment_distance_km: 10.0,
            default_delivery_fee: Decimal::from(10),
            average_speed_kmh: crate::geo::DEFAULT_AVERAGE_SPEED_KMH,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, AppError> {
        let _ = dotenvy::dotenv();

        let log_format = match env::var("LOG_FORMAT").as_deref() {
            Ok("json") => LogFormat::Json,
            _ => LogFormat::Compact,
        };

        Ok(Self {
            http_port: parse_or_default("HTTP_PORT", 3000)?,
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            log_format,
            order_queue_size: parse_or_default("ORDER_QUEUE_SIZE", 1024)?,
            event_buffer_size: parse_or_default("EVENT_BUFFER_SIZE", 1024)?,
            dispatch: DispatchSettings {
                offer_timeout: Duration::from_secs(parse_or_default("OFFER_TIMEOUT_SECS", 30)?),
                max_offer_attempts: parse_or_default("MAX_OFFER_ATTEMPTS", 5)?,
                max_assignment_distance_km: parse_or_default("MAX_ASSIGNMENT_DISTANCE_KM", 10.0)?,
                default_delivery_fee: parse_or_default("DEFAULT_DELIVERY_FEE", Decimal::from(10))?,
                average_speed_kmh: parse_or_default(
                    "AVERAGE_SPEED_KMH",
                    crate::geo::DEFAULT_AVERAGE_SPEED_KMH,
                )?,
            },
        })
    }
}

/// Settings for the device side: REST backend, transport channel and
/// location producer.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub api_url: String,
    pub request_timeout: Duration,
    pub channel: ChannelConfig,
    pub location: LocationConfig,
    pub average_speed_kmh: f64,
}

#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub url: String,
    pub reconnect_base: Duration,
    pub reconnect_max: Duration,
    pub max_reconnect_attempts: u32,
    pub ping_interval: Duration,
}

impl ChannelConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            reconnect_base: Duration::from_millis(3000),
            reconnect_max: Duration::from_millis(30_000),
            max_reconnect_attempts: 10,
            ping_interval: Duration::from_millis(30_000),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LocationConfig {
    pub interval: Duration,
    pub min_distance_m: f64,
    pub poll_interval: Duration,
}

impl Default for LocationConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(10_000),
            min_distance_m: 10.0,
            poll_interval: Duration::from_millis(1000),
        }
    }
}

impl LocationConfig {
    /// Samples older than this are shown as stale rather than live.
    pub fn stale_after(&self) -> Duration {
        self.interval * 2
    }
}

impl ClientConfig {
    /// Defaults for a backend serving REST at `api_url` and the channel
    /// under `/ws` of the same host.
    pub fn new(api_url: impl Into<String>) -> Self {
        let api_url = api_url.into().trim_end_matches('/').to_string();
        let channel_url = match api_url.split_once("://") {
            Some(("https", rest)) => format!("wss://{rest}/ws"),
            Some((_, rest)) => format!("ws://{rest}/ws"),
            None => format!("ws://{api_url}/ws"),
        };

        Self {
            api_url,
            request_timeout: Duration::from_secs(30),
            channel: ChannelConfig::new(channel_url),
            location: LocationConfig::default(),
            average_speed_kmh: crate::geo::DEFAULT_AVERAGE_SPEED_KMH,
        }
    }

    pub fn from_env() -> Result<Self, AppError> {
        let _ = dotenvy::dotenv();

        let channel = ChannelConfig {
            url: env::var("CHANNEL_URL").unwrap_or_else(|_| "ws://127.0.0.1:3000/ws".to_string()),
            reconnect_base: Duration::from_millis(parse_or_default("RECONNECT_BASE_MS", 3000)?),
            reconnect_max: Duration::from_millis(parse_or_default("RECONNECT_MAX_MS", 30_000)?),
            max_reconnect_attempts: parse_or_default("MAX_RECONNECT_ATTEMPTS", 10)?,
            ping_interval: Duration::from_millis(parse_or_default("PING_INTERVAL_MS", 30_000)?),
        };

        let location = LocationConfig {
            interval: Duration::from_millis(parse_or_default("LOCATION_INTERVAL_MS", 10_000)?),
            min_distance_m: parse_or_default("LOCATION_MIN_DISTANCE_M", 10.0)?,
            poll_interval: Duration::from_millis(parse_or_default("LOCATION_POLL_MS", 1000)?),
        };

        Ok(Self {
            api_url: env::var("API_URL").unwrap_or_else(|_| "http://127.0.0.1:3000".to_string()),
            request_timeout: Duration::from_millis(parse_or_default("REQUEST_TIMEOUT_MS", 30_000)?),
            channel,
            location,
            average_speed_kmh: parse_or_default(
                "AVERAGE_SPEED_KMH",
                crate::geo::DEFAULT_AVERAGE_SPEED_KMH,
            )?,
        })
    }
}

fn parse_or_default<T>(key: &str, default: T) -> Result<T, AppError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .map_err(|err| AppError::Internal(format!("invalid {key}: {err}"))),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unset_keys_fall_back_to_defaults() {
        let port: u16 = parse_or_default("ORDER_SYNC_TEST_UNSET_PORT", 3000).unwrap();
        assert_eq!(port, 3000);
    }

    #[test]
    fn channel_defaults_follow_the_reconnect_policy() {
        let config = ChannelConfig::new("ws://localhost:3000/ws");
        assert_eq!(config.reconnect_base, Duration::from_secs(3));
        assert_eq!(config.reconnect_max, Duration::from_secs(30));
        assert_eq!(config.max_reconnect_attempts, 10);
        assert_eq!(config.ping_interval, Duration::from_secs(30));
    }

    #[test]
    fn client_channel_url_follows_the_api_host() {
        let plain = ClientConfig::new("http://127.0.0.1:3000/");
        assert_eq!(plain.api_url, "http://127.0.0.1:3000");
        assert_eq!(plain.channel.url, "ws://127.0.0.1:3000/ws");

        let secure = ClientConfig::new("https://orders.example.com");
        assert_eq!(secure.channel.url, "wss://orders.example.com/ws");
        assert_eq!(secure.request_timeout, Duration::from_secs(30));
    }

    #[test]
    fn client_settings_load_from_the_environment() {
        let config = ClientConfig::from_env().unwrap();
        assert!(!config.api_url.is_empty());
        assert!(config.channel.reconnect_base <= config.channel.reconnect_max);
        assert!(config.average_speed_kmh > 0.0);
    }

    #[test]
    fn samples_go_stale_after_two_intervals() {
        assert_eq!(LocationConfig::default().stale_after(), Duration::from_secs(20));
    }
}
