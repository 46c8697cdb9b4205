// Broker configuration
//
// Fleet settings (store, limits, timing) come from the shared FleetConfig;
// everything here is specific to the broker process.

use std::net::SocketAddr;
use std::time::Duration;

use browserfleet_coordination::config::{env_millis, env_parse};
use browserfleet_coordination::persistence::validate_capability;
use browserfleet_coordination::{ConfigError, FleetConfig};

#[derive(Debug, thiserror::Error)]
pub enum BrokerConfigError {
    #[error(transparent)]
    Fleet(#[from] ConfigError),

    #[error("invalid listener '{entry}': {reason}")]
    InvalidListener { entry: String, reason: String },

    #[error("invalid address for {name}: {value}")]
    InvalidAddr { name: &'static str, value: String },
}

/// One client-facing listener, bound to a single capability
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerConfig {
    pub capability: String,
    pub addr: SocketAddr,
}

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub fleet: FleetConfig,
    pub listeners: Vec<ListenerConfig>,
    pub admin_addr: SocketAddr,
    /// How long a client connection waits for a worker before it is closed
    pub select_wait: Duration,
    pub backend_connect_timeout: Duration,
    /// Run the reaper inside this broker
    pub run_reaper: bool,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            fleet: FleetConfig::default(),
            listeners: vec![ListenerConfig {
                capability: "chromium".to_string(),
                addr: SocketAddr::from(([0, 0, 0, 0], 3000)),
            }],
            admin_addr: SocketAddr::from(([0, 0, 0, 0], 9000)),
            select_wait: Duration::from_secs(10),
            backend_connect_timeout: Duration::from_secs(5),
            run_reaper: true,
        }
    }
}

impl BrokerConfig {
    /// Create configuration from environment variables
    ///
    /// Environment variables (on top of the fleet variables):
    /// - `BROKER_LISTENERS`: `capability=addr,...` (default: "chromium=0.0.0.0:3000")
    /// - `ADMIN_ADDR`: admin HTTP address (default: "0.0.0.0:9000")
    /// - `SELECT_WAIT_MS`: wait budget per client connection (default: 10000)
    /// - `BACKEND_CONNECT_TIMEOUT_MS`: connect timeout toward workers (default: 5000)
    /// - `RUN_REAPER`: run the reaper in-process (default: true)
    pub fn from_env() -> Result<Self, BrokerConfigError> {
        let defaults = Self::default();

        let listeners = match std::env::var("BROKER_LISTENERS") {
            Ok(value) if !value.trim().is_empty() => parse_listeners(&value)?,
            _ => defaults.listeners,
        };

        let admin_addr = match std::env::var("ADMIN_ADDR") {
            Ok(value) => value
                .trim()
                .parse()
                .map_err(|_| BrokerConfigError::InvalidAddr {
                    name: "ADMIN_ADDR",
                    value,
                })?,
            Err(_) => defaults.admin_addr,
        };

        Ok(Self {
            fleet: FleetConfig::from_env()?,
            listeners,
            admin_addr,
            select_wait: env_millis("SELECT_WAIT_MS", defaults.select_wait)?,
            backend_connect_timeout: env_millis(
                "BACKEND_CONNECT_TIMEOUT_MS",
                defaults.backend_connect_timeout,
            )?,
            run_reaper: env_parse("RUN_REAPER", defaults.run_reaper)?,
        })
    }
}

/// Parse `capability=addr` pairs separated by commas
pub fn parse_listeners(value: &str) -> Result<Vec<ListenerConfig>, BrokerConfigError> {
    let mut listeners = Vec::new();

    for entry in value.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let invalid = |reason: String| BrokerConfigError::InvalidListener {
            entry: entry.to_string(),
            reason,
        };

        let (capability, addr) = entry
            .split_once('=')
            .ok_or_else(|| invalid("expected capability=addr".to_string()))?;
        let capability = capability.trim();
        validate_capability(capability).map_err(|e| invalid(e.to_string()))?;
        let addr: SocketAddr = addr
            .trim()
            .parse()
            .map_err(|e: std::net::AddrParseError| invalid(e.to_string()))?;

        if listeners
            .iter()
            .any(|l: &ListenerConfig| l.capability == capability)
        {
            return Err(invalid(format!("capability '{capability}' listed twice")));
        }

        listeners.push(ListenerConfig {
            capability: capability.to_string(),
            addr,
        });
    }

    if listeners.is_empty() {
        return Err(BrokerConfigError::InvalidListener {
            entry: value.to_string(),
            reason: "no listeners configured".to_string(),
        });
    }
    Ok(listeners)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_listeners() {
        let listeners = parse_listeners("chromium=0.0.0.0:3000, firefox=127.0.0.1:3001").unwrap();
        assert_eq!(listeners.len(), 2);
        assert_eq!(listeners[0].capability, "chromium");
        assert_eq!(listeners[0].addr.port(), 3000);
        assert_eq!(listeners[1].capability, "firefox");
        assert_eq!(listeners[1].addr, "127.0.0.1:3001".parse().unwrap());
    }

    #[test]
    fn test_parse_listeners_rejects_bad_entries() {
        assert!(parse_listeners("chromium").is_err());
        assert!(parse_listeners("chromium=not-an-addr").is_err());
        assert!(parse_listeners("cmd=0.0.0.0:3000").is_err());
        assert!(parse_listeners("a:b=0.0.0.0:3000").is_err());
        assert!(parse_listeners(" , ").is_err());
    }

    #[test]
    fn test_parse_listeners_rejects_duplicates() {
        let err = parse_listeners("chromium=0.0.0.0:3000,chromium=0.0.0.0:3001").unwrap_err();
        assert!(err.to_string().contains("listed twice"));
    }

    #[test]
    fn test_default_config() {
        let config = BrokerConfig::default();
        assert_eq!(config.listeners.len(), 1);
        assert_eq!(config.select_wait, Duration::from_secs(10));
        assert!(config.run_reaper);
    }
}
