//! CoordinationStore trait definition

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::SelectionLimits;

/// Capability tag reserved by the shutdown command key prefix
const RESERVED_CAPABILITY: &str = "cmd";

/// Error type for store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Redis command or script failed
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// The store did not answer within the configured bound
    #[error("store operation timed out after {0:?}")]
    Timeout(Duration),

    /// Capability or worker id cannot be encoded into the key layout
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// A stored value could not be decoded
    #[error("corrupt worker record {key}: {reason}")]
    Corrupt { key: String, reason: String },
}

/// Identity of a worker: its capability partition plus its opaque id
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkerKey {
    capability: String,
    id: String,
}

impl WorkerKey {
    /// Build a key, rejecting values that would break the key layout
    pub fn new(capability: impl Into<String>, id: impl Into<String>) -> Result<Self, StoreError> {
        let capability = capability.into();
        let id = id.into();
        validate_capability(&capability)?;
        if id.is_empty() {
            return Err(StoreError::InvalidKey("worker id must not be empty".into()));
        }
        Ok(Self { capability, id })
    }

    pub fn capability(&self) -> &str {
        &self.capability
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Field name used in the cluster-wide counter maps
    pub fn counter_field(&self) -> String {
        format!("{}:{}", self.capability, self.id)
    }
}

impl fmt::Display for WorkerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.capability, self.id)
    }
}

/// Check that a capability tag fits the key layout
pub fn validate_capability(capability: &str) -> Result<(), StoreError> {
    if capability.is_empty() {
        return Err(StoreError::InvalidKey("capability must not be empty".into()));
    }
    if capability.contains(':') {
        return Err(StoreError::InvalidKey(format!(
            "capability '{capability}' must not contain ':'"
        )));
    }
    if capability == RESERVED_CAPABILITY {
        return Err(StoreError::InvalidKey(format!(
            "capability '{RESERVED_CAPABILITY}' is reserved"
        )));
    }
    Ok(())
}

/// Worker status as seen by the selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    /// Worker accepts new sessions
    Available,

    /// Worker finishes its sessions and must never be selected again
    Draining,
}

impl WorkerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Available => "available",
            Self::Draining => "draining",
        }
    }
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for WorkerStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "available" => Ok(Self::Available),
            "draining" => Ok(Self::Draining),
            other => Err(StoreError::InvalidKey(format!("unknown worker status: {other}"))),
        }
    }
}

/// One registry record per worker instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerRecord {
    pub key: WorkerKey,
    pub endpoint: String,
    pub status: WorkerStatus,
    pub last_heartbeat: DateTime<Utc>,
    pub registered_at: DateTime<Utc>,
}

impl WorkerRecord {
    /// A freshly registered, available worker
    pub fn new(key: WorkerKey, endpoint: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            key,
            endpoint: endpoint.into(),
            status: WorkerStatus::Available,
            last_heartbeat: now,
            registered_at: now,
        }
    }
}

/// A worker record together with its cluster-wide counters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerSnapshot {
    pub record: WorkerRecord,
    pub active: u32,
    pub lifetime: u32,
}

/// Filter for listing workers
#[derive(Debug, Clone, Default)]
pub struct WorkerFilter {
    pub capability: Option<String>,
}

impl WorkerFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn capability(capability: impl Into<String>) -> Self {
        Self {
            capability: Some(capability.into()),
        }
    }
}

/// Input of one atomic selection
#[derive(Debug, Clone)]
pub struct SelectionRequest {
    pub capability: String,
    pub limits: SelectionLimits,

    /// Workers whose last heartbeat is older than this are ineligible
    pub liveness_window: Duration,

    pub now: DateTime<Utc>,
}

/// A reserved slot on a worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    pub worker: WorkerKey,
    pub endpoint: String,

    /// Counters after the reservation was committed
    pub active: u32,
    pub lifetime: u32,

    /// Registration the slot was taken on, at millisecond precision
    pub registered_at: DateTime<Utc>,
}

/// Outcome of a selection; running out of workers is not an error
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    Assigned(Assignment),
    Unavailable,
}

impl Selection {
    pub fn assignment(&self) -> Option<&Assignment> {
        match self {
            Self::Assigned(assignment) => Some(assignment),
            Self::Unavailable => None,
        }
    }
}

/// Response from heartbeat operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatResponse {
    /// Whether the record still existed and was refreshed
    pub accepted: bool,

    /// Whether a shutdown command is pending for this worker
    pub shutdown_requested: bool,
}

/// Counters after a session released its slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReleaseOutcome {
    /// False when the worker's counters were already gone (deregistered or
    /// reaped) or belong to a later registration of the same worker
    pub tracked: bool,
    pub active: u32,
    pub lifetime: u32,
}

/// Result of one reaper sweep
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReapReport {
    /// Workers whose heartbeat went stale; record and counters removed
    pub stale: Vec<WorkerKey>,

    /// Counter entries left behind by records that expired through their TTL
    pub orphaned: Vec<WorkerKey>,
}

impl ReapReport {
    pub fn total(&self) -> usize {
        self.stale.len() + self.orphaned.len()
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }
}

/// Store for worker coordination state
///
/// All state lives in the store; implementations keep nothing authoritative
/// in process memory. Implementations must be thread-safe and support
/// concurrent access from many broker and worker processes.
#[async_trait]
pub trait CoordinationStore: Send + Sync + 'static {
    // =========================================================================
    // Registry Operations
    // =========================================================================

    /// Write a fresh record with zeroed counters and the given TTL
    ///
    /// Overwrites any previous record for the same key and clears a leftover
    /// shutdown command.
    async fn register_worker(&self, record: WorkerRecord, ttl: Duration)
        -> Result<(), StoreError>;

    /// Refresh `last_heartbeat` and the record TTL, and report a pending command
    ///
    /// Does not recreate a missing record and does not consume the command.
    async fn heartbeat_worker(
        &self,
        worker: &WorkerKey,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<HeartbeatResponse, StoreError>;

    /// Set the worker status; returns false if the record does not exist
    async fn set_worker_status(
        &self,
        worker: &WorkerKey,
        status: WorkerStatus,
    ) -> Result<bool, StoreError>;

    /// Delete the record, both counters, the index entry and any command
    ///
    /// Idempotent; returns whether anything was removed.
    async fn deregister_worker(&self, worker: &WorkerKey) -> Result<bool, StoreError>;

    /// List worker records with their counters
    async fn list_workers(&self, filter: WorkerFilter) -> Result<Vec<WorkerSnapshot>, StoreError>;

    // =========================================================================
    // Selection and Session Bookkeeping
    // =========================================================================

    /// Choose a worker and reserve a slot on it as one atomic step
    async fn select_worker(&self, request: &SelectionRequest) -> Result<Selection, StoreError>;

    /// Atomically decrement the active counter, never below zero
    ///
    /// With `registered_at` set, nothing is decremented when the live record
    /// was registered at a different millisecond: the slot belonged to an
    /// earlier incarnation whose counters were reset on re-registration.
    async fn release_worker(
        &self,
        worker: &WorkerKey,
        registered_at: Option<DateTime<Utc>>,
    ) -> Result<ReleaseOutcome, StoreError>;

    /// Sum of active sessions across the whole cluster
    async fn total_active(&self) -> Result<u64, StoreError>;

    // =========================================================================
    // Command Channel
    // =========================================================================

    /// Write a shutdown command that expires after `ttl`
    async fn send_shutdown(&self, worker: &WorkerKey, ttl: Duration) -> Result<(), StoreError>;

    /// Remove a pending shutdown command once the worker acted on it
    async fn clear_shutdown(&self, worker: &WorkerKey) -> Result<(), StoreError>;

    // =========================================================================
    // Reaping
    // =========================================================================

    /// Remove workers whose heartbeat is older than `stale_threshold`
    ///
    /// The staleness check and the removal happen in one atomic step per sweep.
    async fn reap_stale_workers(
        &self,
        stale_threshold: Duration,
        now: DateTime<Utc>,
    ) -> Result<ReapReport, StoreError>;
}
