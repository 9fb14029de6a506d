//! Client configuration
//!
//! Only the server URL, stream id and auth token are required. Everything
//! else falls back to the defaults below, and the derived values
//! (`max_delay`, `max_buffer_duration`) are resolved on read.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use url::Url;

/// Default target delay behind the live edge (seconds)
pub const DEFAULT_DELAY: f64 = 30.0;
/// Default capacity of the fragment and segment queues
pub const DEFAULT_QUEUE_LENGTH: usize = 32;
/// Default start-up watchdog (milliseconds)
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;
/// Default heartbeat period (milliseconds)
pub const DEFAULT_HEARTBEAT_PERIOD_MS: u64 = 30_000;
/// Default delay before reconnecting (milliseconds)
pub const DEFAULT_RECONNECT_DELAY_MS: u64 = 1_000;

const MAX_STREAM_ID_LEN: usize = 255;

fn default_delay() -> f64 {
    DEFAULT_DELAY
}

fn default_queue_length() -> usize {
    DEFAULT_QUEUE_LENGTH
}

fn default_timeout_ms() -> u64 {
    DEFAULT_TIMEOUT_MS
}

fn default_heartbeat_period_ms() -> u64 {
    DEFAULT_HEARTBEAT_PERIOD_MS
}

fn default_reconnect_delay_ms() -> u64 {
    DEFAULT_RECONNECT_DELAY_MS
}

/// Configuration for a pull session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// WebSocket URL of the CDN server
    pub server_url: Url,
    /// ID of the stream to pull
    pub stream_id: String,
    /// Token to authenticate the pull
    pub auth_token: String,
    /// Desired delay behind the live edge (seconds)
    #[serde(default = "default_delay")]
    pub delay: f64,
    /// Delay that triggers a catch-up seek (seconds)
    #[serde(default)]
    pub max_delay: Option<f64>,
    /// Buffered duration that triggers eviction (seconds)
    #[serde(default)]
    pub max_buffer_duration: Option<f64>,
    /// Capacity of the produced segment queue
    #[serde(default = "default_queue_length")]
    pub max_segment_queue_length: usize,
    /// Capacity of the raw fragment queue
    #[serde(default = "default_queue_length")]
    pub max_fragment_queue_length: usize,
    /// Max fragments the server replays from its buffer after the pull
    #[serde(default)]
    pub max_initial_fragments: Option<u32>,
    /// Start-up watchdog (milliseconds)
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Heartbeat period (milliseconds)
    #[serde(default = "default_heartbeat_period_ms")]
    pub heartbeat_period_ms: u64,
    /// Delay before reconnecting after an unexpected close (milliseconds)
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
    /// Verbose logging. The library does not install a subscriber; the host
    /// applies [`ClientConfig::log_filter`] to its own.
    #[serde(default)]
    pub debug: bool,
}

impl ClientConfig {
    /// Create a configuration with default tuning
    pub fn new(server_url: Url, stream_id: impl Into<String>, auth_token: impl Into<String>) -> Self {
        Self {
            server_url,
            stream_id: stream_id.into(),
            auth_token: auth_token.into(),
            delay: DEFAULT_DELAY,
            max_delay: None,
            max_buffer_duration: None,
            max_segment_queue_length: DEFAULT_QUEUE_LENGTH,
            max_fragment_queue_length: DEFAULT_QUEUE_LENGTH,
            max_initial_fragments: None,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            heartbeat_period_ms: DEFAULT_HEARTBEAT_PERIOD_MS,
            reconnect_delay_ms: DEFAULT_RECONNECT_DELAY_MS,
            debug: false,
        }
    }

    /// Parse a JSON configuration
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: ClientConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a JSON configuration file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    pub fn with_delay(mut self, delay: f64, max_delay: Option<f64>) -> Self {
        self.delay = delay;
        self.max_delay = max_delay;
        self
    }

    pub fn with_max_buffer_duration(mut self, seconds: f64) -> Self {
        self.max_buffer_duration = Some(seconds);
        self
    }

    pub fn with_queue_lengths(mut self, fragments: usize, segments: usize) -> Self {
        self.max_fragment_queue_length = fragments;
        self.max_segment_queue_length = segments;
        self
    }

    pub fn with_max_initial_fragments(mut self, count: u32) -> Self {
        self.max_initial_fragments = Some(count);
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn with_heartbeat_period_ms(mut self, period_ms: u64) -> Self {
        self.heartbeat_period_ms = period_ms;
        self
    }

    pub fn with_reconnect_delay_ms(mut self, delay_ms: u64) -> Self {
        self.reconnect_delay_ms = delay_ms;
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Catch-up threshold, never below the target delay
    pub fn max_delay(&self) -> f64 {
        resolve_max_delay(self.delay, self.max_delay)
    }

    /// Eviction threshold, twice the max delay unless set
    pub fn max_buffer_duration(&self) -> f64 {
        self.max_buffer_duration.unwrap_or(self.max_delay() * 2.0)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn heartbeat_period(&self) -> Duration {
        Duration::from_millis(self.heartbeat_period_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    /// Default `tracing` filter directive for this configuration
    pub fn log_filter(&self) -> &'static str {
        log_filter(self.debug)
    }

    /// Check the configuration for values the pipeline cannot run with
    pub fn validate(&self) -> Result<()> {
        match self.server_url.scheme() {
            "ws" | "wss" => {}
            other => {
                return Err(Error::InvalidConfig(format!(
                    "server_url must use ws or wss, got {}",
                    other
                )))
            }
        }

        if self.stream_id.is_empty() {
            return Err(Error::InvalidConfig("stream_id cannot be empty".into()));
        }
        if self.stream_id.len() > MAX_STREAM_ID_LEN {
            return Err(Error::InvalidConfig(format!(
                "stream_id cannot be longer than {} characters",
                MAX_STREAM_ID_LEN
            )));
        }
        if self.auth_token.is_empty() {
            return Err(Error::InvalidConfig("auth_token cannot be empty".into()));
        }

        check_seconds("delay", Some(self.delay))?;
        check_seconds("max_delay", self.max_delay)?;
        check_seconds("max_buffer_duration", self.max_buffer_duration)?;

        if self.max_fragment_queue_length == 0 || self.max_segment_queue_length == 0 {
            return Err(Error::InvalidConfig("queue lengths must be at least 1".into()));
        }
        if self.timeout_ms == 0 || self.heartbeat_period_ms == 0 {
            return Err(Error::InvalidConfig(
                "timeout_ms and heartbeat_period_ms must be positive".into(),
            ));
        }

        Ok(())
    }
}

/// `tracing` filter directive for livepull targets
pub fn log_filter(debug: bool) -> &'static str {
    if debug {
        "livepull=debug,livepull_core=debug"
    } else {
        "livepull=info,livepull_core=info"
    }
}

/// Resolve the catch-up threshold for a target delay
pub fn resolve_max_delay(delay: f64, max_delay: Option<f64>) -> f64 {
    delay.max(max_delay.unwrap_or(delay + 1.0))
}

fn check_seconds(name: &str, value: Option<f64>) -> Result<()> {
    match value {
        Some(v) if !v.is_finite() || v < 0.0 => Err(Error::InvalidConfig(format!(
            "{} must be a finite, non-negative number of seconds",
            name
        ))),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> ClientConfig {
        ClientConfig::new(
            Url::parse("wss://cdn.example.com/ws").unwrap(),
            "stream-1",
            "token",
        )
    }

    #[test]
    fn test_defaults() {
        let config = base();
        assert_eq!(config.delay, 30.0);
        assert_eq!(config.max_delay(), 31.0);
        assert_eq!(config.max_buffer_duration(), 62.0);
        assert_eq!(config.max_fragment_queue_length, 32);
        assert_eq!(config.max_segment_queue_length, 32);
        assert_eq!(config.timeout(), Duration::from_secs(30));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_max_delay_never_below_delay() {
        let config = base().with_delay(10.0, Some(5.0));
        assert_eq!(config.max_delay(), 10.0);

        let config = base().with_delay(10.0, Some(20.0));
        assert_eq!(config.max_delay(), 20.0);
        assert_eq!(config.max_buffer_duration(), 40.0);
    }

    #[test]
    fn test_json_defaults() {
        let config = ClientConfig::from_json_str(
            r#"{"server_url": "ws://localhost/", "stream_id": "s", "auth_token": "t", "delay": 4}"#,
        )
        .unwrap();
        assert_eq!(config.delay, 4.0);
        assert_eq!(config.max_delay(), 5.0);
        assert_eq!(config.heartbeat_period_ms, 30_000);
        assert_eq!(config.reconnect_delay_ms, 1_000);
        assert!(!config.debug);
    }

    #[test]
    fn test_log_filter_follows_debug_flag() {
        let config = base();
        assert_eq!(config.log_filter(), "livepull=info,livepull_core=info");
        assert_eq!(config.with_debug(true).log_filter(), log_filter(true));
        assert!(log_filter(true).contains("livepull_core=debug"));
    }

    #[test]
    fn test_validation() {
        let mut config = base();
        config.server_url = Url::parse("https://cdn.example.com/").unwrap();
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));

        let config = base().with_queue_lengths(0, 4);
        assert!(config.validate().is_err());

        let config = base().with_delay(f64::NAN, None);
        assert!(config.validate().is_err());

        let mut config = base();
        config.stream_id = "x".repeat(256);
        assert!(config.validate().is_err());
    }
}
