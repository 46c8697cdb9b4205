//! Bounded waiting for a free worker
//!
//! A caller that finds no worker retries selection with a growing interval
//! until its wait budget is spent.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::duration_millis;

/// Polling configuration for [`Selector::acquire`](super::Selector::acquire)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AcquireConfig {
    /// Interval after the first unavailable answer
    #[serde(with = "duration_millis")]
    pub min_interval: Duration,

    /// Upper bound on the retry interval
    #[serde(with = "duration_millis")]
    pub max_interval: Duration,

    /// Growth factor applied after every unavailable answer
    pub backoff_multiplier: f64,
}

impl Default for AcquireConfig {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_millis(50),
            max_interval: Duration::from_secs(1),
            backoff_multiplier: 1.5,
        }
    }
}

impl AcquireConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set minimum retry interval
    pub fn with_min_interval(mut self, interval: Duration) -> Self {
        self.min_interval = interval;
        self
    }

    /// Set maximum retry interval
    pub fn with_max_interval(mut self, interval: Duration) -> Self {
        self.max_interval = interval;
        self
    }

    /// Set backoff multiplier
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier.max(1.0);
        self
    }
}

/// Retry interval state for one acquire call
#[derive(Debug)]
pub(crate) struct Backoff {
    current: Duration,
    max: Duration,
    multiplier: f64,
}

impl Backoff {
    pub(crate) fn new(config: &AcquireConfig) -> Self {
        Self {
            current: config.min_interval,
            max: config.max_interval.max(config.min_interval),
            multiplier: config.backoff_multiplier.max(1.0),
        }
    }

    /// Interval to wait now; the next one grows by the multiplier
    pub(crate) fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        let grown = Duration::from_secs_f64(self.current.as_secs_f64() * self.multiplier);
        self.current = grown.min(self.max);
        delay
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_grows_to_max() {
        let config = AcquireConfig::new()
            .with_min_interval(Duration::from_millis(100))
            .with_max_interval(Duration::from_millis(300))
            .with_backoff_multiplier(2.0);
        let mut backoff = Backoff::new(&config);

        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
        assert_eq!(backoff.next_delay(), Duration::from_millis(200));
        assert_eq!(backoff.next_delay(), Duration::from_millis(300));
        assert_eq!(backoff.next_delay(), Duration::from_millis(300));
    }

    #[test]
    fn test_multiplier_below_one_is_clamped() {
        let config = AcquireConfig::new().with_backoff_multiplier(0.5);
        assert_eq!(config.backoff_multiplier, 1.0);
    }
}
