//! Redis key layout
//!
//! | Key | Type | Contents |
//! |---|---|---|
//! | `worker:{capability}:{id}` | hash | worker record, TTL refreshed by heartbeats |
//! | `worker:cmd:{capability}:{id}` | string | pending shutdown command with its own TTL |
//! | `cluster:active` | hash | `{capability}:{id}` -> open sessions |
//! | `cluster:lifetime` | hash | `{capability}:{id}` -> sessions ever assigned |
//! | `cluster:workers:{capability}` | set | worker ids registered under a capability |
//! | `cluster:capabilities` | set | capabilities with at least one registered worker |
//!
//! The Lua scripts in `redis_store.rs` build the same keys from strings; any change
//! here has to be made there too.

use super::store::WorkerKey;

pub const ACTIVE_COUNTERS: &str = "cluster:active";
pub const LIFETIME_COUNTERS: &str = "cluster:lifetime";
pub const CAPABILITIES: &str = "cluster:capabilities";

/// Value stored under a command key
pub const SHUTDOWN_COMMAND: &str = "shutdown";

// Record hash fields
pub const FIELD_ID: &str = "id";
pub const FIELD_CAPABILITY: &str = "capability";
pub const FIELD_ENDPOINT: &str = "endpoint";
pub const FIELD_STATUS: &str = "status";
pub const FIELD_LAST_HEARTBEAT: &str = "last_heartbeat";
pub const FIELD_REGISTERED_AT: &str = "registered_at";

pub fn record_key(worker: &WorkerKey) -> String {
    format!("worker:{}:{}", worker.capability(), worker.id())
}

pub fn command_key(worker: &WorkerKey) -> String {
    format!("worker:cmd:{}:{}", worker.capability(), worker.id())
}

pub fn index_key(capability: &str) -> String {
    format!("cluster:workers:{capability}")
}
