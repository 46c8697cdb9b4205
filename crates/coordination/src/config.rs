//! Fleet configuration
//!
//! Timing parameters interact: a heartbeat that is slower than the record TTL
//! lets healthy workers expire between beats, and a command TTL shorter than
//! the heartbeat interval lets shutdown commands vanish unread. Nothing fails
//! loudly at runtime when these are wrong, so [`TimingConfig::validate`] is
//! called before any process starts serving.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// Two timing parameters violate a required ordering
    #[error("invalid timing: {0}")]
    InvalidTiming(String),

    /// A selection limit is out of range
    #[error("invalid limit: {0}")]
    InvalidLimit(String),

    /// An environment variable could not be parsed
    #[error("invalid value for {name}: {value}")]
    InvalidEnv { name: String, value: String },
}

/// Per-worker session limits
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct SelectionLimits {
    /// Maximum concurrently open sessions on one worker
    pub max_concurrent: u32,

    /// Sessions a worker may serve before it is retired
    pub max_lifetime: u32,
}

impl Default for SelectionLimits {
    fn default() -> Self {
        Self {
            max_concurrent: 5,
            max_lifetime: 100,
        }
    }
}

impl SelectionLimits {
    pub fn new(max_concurrent: u32, max_lifetime: u32) -> Self {
        Self {
            max_concurrent,
            max_lifetime,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent == 0 {
            return Err(ConfigError::InvalidLimit(
                "max_concurrent must be at least 1".into(),
            ));
        }
        if self.max_lifetime == 0 {
            return Err(ConfigError::InvalidLimit(
                "max_lifetime must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Timing parameters shared by brokers, workers and the reaper
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TimingConfig {
    /// How often a serving worker refreshes its record
    #[serde(with = "duration_millis")]
    pub heartbeat_interval: Duration,

    /// Expiration of a worker record, refreshed on every heartbeat
    #[serde(with = "duration_millis")]
    pub record_ttl: Duration,

    /// Expiration of a pending shutdown command
    #[serde(with = "duration_millis")]
    pub command_ttl: Duration,

    /// Heartbeat age after which the reaper removes a worker
    #[serde(with = "duration_millis")]
    pub stale_threshold: Duration,

    /// Heartbeat age after which the selector skips a worker
    #[serde(with = "duration_millis")]
    pub liveness_window: Duration,

    /// How often the reaper sweeps
    #[serde(with = "duration_millis")]
    pub reap_interval: Duration,

    /// Upper bound on waiting for in-flight sessions while draining
    #[serde(with = "duration_millis")]
    pub drain_timeout: Duration,

    /// Poll interval of the drain wait
    #[serde(with = "duration_millis")]
    pub drain_poll_interval: Duration,

    /// Bound on a single store round trip
    #[serde(with = "duration_millis")]
    pub store_timeout: Duration,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(5),
            record_ttl: Duration::from_secs(15),
            command_ttl: Duration::from_secs(30),
            stale_threshold: Duration::from_secs(30),
            liveness_window: Duration::from_secs(15),
            reap_interval: Duration::from_secs(10),
            drain_timeout: Duration::from_secs(120),
            drain_poll_interval: Duration::from_millis(500),
            store_timeout: Duration::from_secs(2),
        }
    }
}

impl TimingConfig {
    /// Set heartbeat interval
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Set record TTL
    pub fn with_record_ttl(mut self, ttl: Duration) -> Self {
        self.record_ttl = ttl;
        self
    }

    /// Set shutdown command TTL
    pub fn with_command_ttl(mut self, ttl: Duration) -> Self {
        self.command_ttl = ttl;
        self
    }

    /// Set reaper stale threshold
    pub fn with_stale_threshold(mut self, threshold: Duration) -> Self {
        self.stale_threshold = threshold;
        self
    }

    /// Set selector liveness window
    pub fn with_liveness_window(mut self, window: Duration) -> Self {
        self.liveness_window = window;
        self
    }

    /// Set reaper sweep interval
    pub fn with_reap_interval(mut self, interval: Duration) -> Self {
        self.reap_interval = interval;
        self
    }

    /// Set drain timeout and poll interval
    pub fn with_drain(mut self, timeout: Duration, poll_interval: Duration) -> Self {
        self.drain_timeout = timeout;
        self.drain_poll_interval = poll_interval;
        self
    }

    /// Set store round-trip bound
    pub fn with_store_timeout(mut self, timeout: Duration) -> Self {
        self.store_timeout = timeout;
        self
    }

    /// Check the orderings the coordination protocol depends on
    pub fn validate(&self) -> Result<(), ConfigError> {
        let named = [
            ("heartbeat_interval", self.heartbeat_interval),
            ("record_ttl", self.record_ttl),
            ("command_ttl", self.command_ttl),
            ("stale_threshold", self.stale_threshold),
            ("liveness_window", self.liveness_window),
            ("reap_interval", self.reap_interval),
            ("drain_timeout", self.drain_timeout),
            ("drain_poll_interval", self.drain_poll_interval),
            ("store_timeout", self.store_timeout),
        ];
        for (name, value) in named {
            if value.is_zero() {
                return Err(ConfigError::InvalidTiming(format!(
                    "{name} must be greater than zero"
                )));
            }
        }

        if self.heartbeat_interval >= self.record_ttl {
            return Err(ConfigError::InvalidTiming(format!(
                "heartbeat_interval ({:?}) must be less than record_ttl ({:?}); \
                 records would expire between heartbeats",
                self.heartbeat_interval, self.record_ttl
            )));
        }
        if self.record_ttl >= self.command_ttl {
            return Err(ConfigError::InvalidTiming(format!(
                "record_ttl ({:?}) must be less than command_ttl ({:?})",
                self.record_ttl, self.command_ttl
            )));
        }
        if self.command_ttl <= self.heartbeat_interval {
            return Err(ConfigError::InvalidTiming(format!(
                "command_ttl ({:?}) must outlive heartbeat_interval ({:?}); \
                 commands would expire unread",
                self.command_ttl, self.heartbeat_interval
            )));
        }
        if self.stale_threshold < self.heartbeat_interval * 2 {
            return Err(ConfigError::InvalidTiming(format!(
                "stale_threshold ({:?}) must be at least twice heartbeat_interval ({:?}); \
                 healthy workers would be reaped",
                self.stale_threshold, self.heartbeat_interval
            )));
        }
        if self.liveness_window <= self.heartbeat_interval {
            return Err(ConfigError::InvalidTiming(format!(
                "liveness_window ({:?}) must be greater than heartbeat_interval ({:?})",
                self.liveness_window, self.heartbeat_interval
            )));
        }
        if self.drain_poll_interval >= self.drain_timeout {
            return Err(ConfigError::InvalidTiming(format!(
                "drain_poll_interval ({:?}) must be less than drain_timeout ({:?})",
                self.drain_poll_interval, self.drain_timeout
            )));
        }
        Ok(())
    }
}

/// Settings every fleet process needs: where the store is and how it behaves
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FleetConfig {
    pub redis_url: String,
    pub limits: SelectionLimits,
    pub timing: TimingConfig,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://127.0.0.1:6379".to_string(),
            limits: SelectionLimits::default(),
            timing: TimingConfig::default(),
        }
    }
}

impl FleetConfig {
    /// Create configuration from environment variables
    ///
    /// Environment variables:
    /// - `REDIS_URL`: coordination store (default: "redis://127.0.0.1:6379")
    /// - `MAX_CONCURRENT_SESSIONS`, `MAX_LIFETIME_SESSIONS`: selection limits
    /// - `HEARTBEAT_INTERVAL_MS`, `RECORD_TTL_MS`, `COMMAND_TTL_MS`,
    ///   `STALE_THRESHOLD_MS`, `LIVENESS_WINDOW_MS`, `REAP_INTERVAL_MS`,
    ///   `DRAIN_TIMEOUT_MS`, `DRAIN_POLL_INTERVAL_MS`, `STORE_TIMEOUT_MS`
    ///
    /// The result is validated before it is returned.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let timing = defaults.timing;

        let config = Self {
            redis_url: std::env::var("REDIS_URL").unwrap_or(defaults.redis_url),
            limits: SelectionLimits {
                max_concurrent: env_parse("MAX_CONCURRENT_SESSIONS", defaults.limits.max_concurrent)?,
                max_lifetime: env_parse("MAX_LIFETIME_SESSIONS", defaults.limits.max_lifetime)?,
            },
            timing: TimingConfig {
                heartbeat_interval: env_millis("HEARTBEAT_INTERVAL_MS", timing.heartbeat_interval)?,
                record_ttl: env_millis("RECORD_TTL_MS", timing.record_ttl)?,
                command_ttl: env_millis("COMMAND_TTL_MS", timing.command_ttl)?,
                stale_threshold: env_millis("STALE_THRESHOLD_MS", timing.stale_threshold)?,
                liveness_window: env_millis("LIVENESS_WINDOW_MS", timing.liveness_window)?,
                reap_interval: env_millis("REAP_INTERVAL_MS", timing.reap_interval)?,
                drain_timeout: env_millis("DRAIN_TIMEOUT_MS", timing.drain_timeout)?,
                drain_poll_interval: env_millis(
                    "DRAIN_POLL_INTERVAL_MS",
                    timing.drain_poll_interval,
                )?,
                store_timeout: env_millis("STORE_TIMEOUT_MS", timing.store_timeout)?,
            },
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.limits.validate()?;
        self.timing.validate()
    }
}

/// Parse an environment variable, falling back to `default` when unset
pub fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> Result<T, ConfigError> {
    match std::env::var(name) {
        Ok(value) => value.trim().parse().map_err(|_| ConfigError::InvalidEnv {
            name: name.to_string(),
            value,
        }),
        Err(_) => Ok(default),
    }
}

/// Parse a millisecond duration from the environment
pub fn env_millis(name: &str, default: Duration) -> Result<Duration, ConfigError> {
    env_parse(name, default.as_millis() as u64).map(Duration::from_millis)
}

/// Serde support for Duration as milliseconds
pub(crate) mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_timing_is_valid() {
        TimingConfig::default().validate().unwrap();
        FleetConfig::default().validate().unwrap();
    }

    #[test]
    fn test_heartbeat_slower_than_record_ttl_is_rejected() {
        // A worker beating every 10s with a 5s record TTL expires between beats.
        let timing = TimingConfig::default()
            .with_heartbeat_interval(Duration::from_secs(10))
            .with_record_ttl(Duration::from_secs(5));

        let err = timing.validate().unwrap_err();
        assert!(matches!(err, ConfigError::InvalidTiming(_)));
        assert!(err.to_string().contains("record_ttl"));
    }

    #[test]
    fn test_heartbeat_equal_to_record_ttl_is_rejected() {
        let timing = TimingConfig::default()
            .with_heartbeat_interval(Duration::from_secs(15))
            .with_record_ttl(Duration::from_secs(15));
        assert!(timing.validate().is_err());
    }

    #[test]
    fn test_command_ttl_must_exceed_record_ttl() {
        let timing = TimingConfig::default().with_command_ttl(Duration::from_secs(10));
        let err = timing.validate().unwrap_err();
        assert!(err.to_string().contains("command_ttl"));
    }

    #[test]
    fn test_stale_threshold_needs_margin_over_heartbeat() {
        let timing = TimingConfig::default().with_stale_threshold(Duration::from_secs(8));
        let err = timing.validate().unwrap_err();
        assert!(err.to_string().contains("stale_threshold"));

        // Exactly twice the heartbeat interval is accepted.
        TimingConfig::default()
            .with_stale_threshold(Duration::from_secs(10))
            .validate()
            .unwrap();
    }

    #[test]
    fn test_liveness_window_must_exceed_heartbeat() {
        let timing = TimingConfig::default().with_liveness_window(Duration::from_secs(5));
        assert!(timing.validate().is_err());
    }

    #[test]
    fn test_drain_poll_must_be_shorter_than_timeout() {
        let timing = TimingConfig::default()
            .with_drain(Duration::from_secs(1), Duration::from_secs(2));
        assert!(timing.validate().is_err());
    }

    #[test]
    fn test_zero_durations_are_rejected() {
        let timing = TimingConfig::default().with_store_timeout(Duration::ZERO);
        let err = timing.validate().unwrap_err();
        assert!(err.to_string().contains("store_timeout"));
    }

    #[test]
    fn test_limits_validation() {
        assert!(SelectionLimits::new(0, 10).validate().is_err());
        assert!(SelectionLimits::new(1, 0).validate().is_err());
        SelectionLimits::new(1, 1).validate().unwrap();
    }

    #[test]
    fn test_timing_serialization_uses_millis() {
        let timing = TimingConfig::default();
        let json = serde_json::to_value(&timing).unwrap();
        assert_eq!(json["heartbeat_interval"], 5000);

        let parsed: TimingConfig = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, timing);
    }
}
