//! # Worker Coordination Engine
//!
//! Redis-backed coordination for a fleet of interchangeable, stateful backend
//! workers that must be recycled after serving a bounded number of sessions.
//!
//! ## Features
//!
//! - **Worker registry**: TTL-bounded records refreshed by heartbeats
//! - **Atomic staggered selection**: one server-side step picks a worker and
//!   reserves a slot, concentrating retirements on one worker at a time
//! - **Scoped release**: a [`SessionLease`] gives its slot back exactly once,
//!   on every exit path
//! - **Command channel**: brokers ask exhausted workers to shut down; workers
//!   drain and exit through an explicit state machine
//! - **Reaper**: removes workers whose heartbeat went stale
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │            Broker: Selector + SessionLease + Reaper          │
//! │  (atomic select, release, shutdown command on exhaustion)   │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    CoordinationStore                         │
//! │  (Redis: worker records, cluster counters, commands)        │
//! └─────────────────────────────────────────────────────────────┘
//!                              ▲
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │          Worker: LifecycleDriver + WorkerRegistry            │
//! │  (register, heartbeat, drain, deregister)                   │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Consistency is TTL-bounded rather than consensus-based: a worker that
//! vanishes stays visible for at most one record TTL, and re-registration is
//! cheap and idempotent.
//!
//! ## Example
//!
//! ```ignore
//! use browserfleet_coordination::prelude::*;
//!
//! let config = FleetConfig::from_env()?;
//! let store = Arc::new(RedisCoordinationStore::connect(&config.redis_url, &config.timing).await?);
//! let selector = Selector::new(store, config.limits, &config.timing);
//!
//! let lease = selector.acquire("chromium", Duration::from_secs(5)).await?;
//! // ... relay the session to lease.endpoint() ...
//! lease.release().await?;
//! ```

pub mod config;
pub mod lifecycle;
pub mod persistence;
pub mod reaper;
pub mod registry;
pub mod reliability;
pub mod selector;
pub mod session;
pub mod telemetry;

/// Prelude for common imports
pub mod prelude {
    pub use crate::config::{ConfigError, FleetConfig, SelectionLimits, TimingConfig};
    pub use crate::lifecycle::{
        AdmissionGate, BackendLauncher, ExitReason, LaunchError, LifecycleDriver, LifecycleError,
        LifecycleState,
    };
    pub use crate::persistence::{
        CoordinationStore, InMemoryCoordinationStore, RedisCoordinationStore, Selection,
        StoreError, WorkerKey, WorkerStatus,
    };
    pub use crate::reaper::Reaper;
    pub use crate::registry::{RegistryError, WorkerRegistry};
    pub use crate::selector::{AcquireError, SelectError, Selector};
    pub use crate::session::SessionLease;
    pub use std::sync::Arc;
    pub use std::time::Duration;
}

// Re-export main types at crate root
pub use config::{ConfigError, FleetConfig, SelectionLimits, TimingConfig};
pub use lifecycle::{
    AdmissionGate, AdmissionPermit, BackendLauncher, ExitReason, LaunchError, LifecycleDriver,
    LifecycleError, LifecycleState,
};
pub use persistence::{
    Assignment, CoordinationStore, HeartbeatResponse, InMemoryCoordinationStore, ReapReport,
    RedisCoordinationStore, ReleaseOutcome, Selection, SelectionRequest, StoreError, WorkerFilter,
    WorkerKey, WorkerRecord, WorkerSnapshot, WorkerStatus,
};
pub use reaper::Reaper;
pub use registry::{RegistryError, WorkerRegistry};
pub use reliability::{RetryExhausted, RetryPolicy};
pub use selector::{AcquireConfig, AcquireError, SelectError, Selector};
pub use session::SessionLease;
