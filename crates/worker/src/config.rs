// Worker configuration

use std::net::SocketAddr;
use std::time::Duration;

use browserfleet_coordination::config::env_millis;
use browserfleet_coordination::persistence::validate_capability;
use browserfleet_coordination::{ConfigError, FleetConfig, WorkerKey};
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum WorkerConfigError {
    #[error(transparent)]
    Fleet(#[from] ConfigError),

    #[error("invalid value for {name}: {reason}")]
    Invalid { name: &'static str, reason: String },
}

/// Everything the backend launcher needs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LauncherConfig {
    /// Shell command starting the backend; `None` fronts an already running one
    pub command: Option<String>,
    /// Where the backend itself listens
    pub backend_addr: String,
    /// Where the admission proxy listens
    pub listen_addr: SocketAddr,
    /// Endpoint published to brokers; defaults to `listen_addr`
    pub advertise_endpoint: Option<String>,
    pub ready_timeout: Duration,
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            command: None,
            backend_addr: "127.0.0.1:9222".to_string(),
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 3000)),
            advertise_endpoint: None,
            ready_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub fleet: FleetConfig,
    pub worker_id: String,
    pub capability: String,
    pub launcher: LauncherConfig,
}

impl WorkerConfig {
    /// Create configuration from environment variables
    ///
    /// Environment variables (on top of the fleet variables):
    /// - `WORKER_ID`: worker id (default: "worker-{uuid v7}")
    /// - `WORKER_CAPABILITY`: capability tag served (default: "chromium")
    /// - `WORKER_LISTEN_ADDR`: admission proxy address (default: "0.0.0.0:3000")
    /// - `WORKER_ADVERTISE_ENDPOINT`: endpoint published to brokers
    /// - `BACKEND_COMMAND`: shell command starting the backend (optional)
    /// - `BACKEND_ADDR`: backend listen address (default: "127.0.0.1:9222")
    /// - `BACKEND_READY_TIMEOUT_MS`: start-up readiness bound (default: 30000)
    pub fn from_env() -> Result<Self, WorkerConfigError> {
        let defaults = LauncherConfig::default();

        let worker_id =
            std::env::var("WORKER_ID").unwrap_or_else(|_| format!("worker-{}", Uuid::now_v7()));
        let capability =
            std::env::var("WORKER_CAPABILITY").unwrap_or_else(|_| "chromium".to_string());

        let listen_addr = match std::env::var("WORKER_LISTEN_ADDR") {
            Ok(value) => value
                .trim()
                .parse()
                .map_err(|e: std::net::AddrParseError| WorkerConfigError::Invalid {
                    name: "WORKER_LISTEN_ADDR",
                    reason: e.to_string(),
                })?,
            Err(_) => defaults.listen_addr,
        };

        let config = Self {
            fleet: FleetConfig::from_env()?,
            worker_id,
            capability,
            launcher: LauncherConfig {
                command: non_empty_env("BACKEND_COMMAND"),
                backend_addr: non_empty_env("BACKEND_ADDR").unwrap_or(defaults.backend_addr),
                listen_addr,
                advertise_endpoint: non_empty_env("WORKER_ADVERTISE_ENDPOINT"),
                ready_timeout: env_millis("BACKEND_READY_TIMEOUT_MS", defaults.ready_timeout)?,
            },
        };

        config.worker_key()?;
        Ok(config)
    }

    /// Store key for this worker; rejects ids and tags the key layout cannot hold
    pub fn worker_key(&self) -> Result<WorkerKey, WorkerConfigError> {
        validate_capability(&self.capability).map_err(|e| WorkerConfigError::Invalid {
            name: "WORKER_CAPABILITY",
            reason: e.to_string(),
        })?;
        WorkerKey::new(&self.capability, &self.worker_id).map_err(|e| WorkerConfigError::Invalid {
            name: "WORKER_ID",
            reason: e.to_string(),
        })
    }
}

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(capability: &str, worker_id: &str) -> WorkerConfig {
        WorkerConfig {
            fleet: FleetConfig::default(),
            worker_id: worker_id.to_string(),
            capability: capability.to_string(),
            launcher: LauncherConfig::default(),
        }
    }

    #[test]
    fn test_worker_key() {
        let key = config("chromium", "worker-1").worker_key().unwrap();
        assert_eq!(key.capability(), "chromium");
        assert_eq!(key.id(), "worker-1");
    }

    #[test]
    fn test_worker_key_rejects_bad_identity() {
        assert!(config("", "worker-1").worker_key().is_err());
        assert!(config("chrom:ium", "worker-1").worker_key().is_err());
        assert!(config("cmd", "worker-1").worker_key().is_err());
        assert!(config("chromium", "").worker_key().is_err());
    }

    #[test]
    fn test_launcher_defaults() {
        let launcher = LauncherConfig::default();
        assert!(launcher.command.is_none());
        assert_eq!(launcher.backend_addr, "127.0.0.1:9222");
        assert_eq!(launcher.ready_timeout, Duration::from_secs(30));
    }
}
