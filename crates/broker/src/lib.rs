//! Broker: client-facing listeners that hand each incoming session to a
//! worker chosen by the coordination store, plus a read-only admin API.

pub mod api;
pub mod config;
pub mod relay;

pub use config::{BrokerConfig, BrokerConfigError, ListenerConfig};
pub use relay::{backend_addr, Relay, RelayError, RelayOutcome, RelayStats};
