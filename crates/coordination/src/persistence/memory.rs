//! In-memory implementation of CoordinationStore for testing

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::time::Instant;

use super::store::*;
use crate::selector::algorithm;

/// Record state with its expiration
struct StoredRecord {
    record: WorkerRecord,
    expires_at: Instant,
}

#[derive(Default)]
struct State {
    records: HashMap<WorkerKey, StoredRecord>,
    active: HashMap<WorkerKey, u32>,
    lifetime: HashMap<WorkerKey, u32>,
    commands: HashMap<WorkerKey, Instant>,
}

impl State {
    /// Live record for `key`; expired records behave as absent
    fn record(&self, key: &WorkerKey, now: Instant) -> Option<&WorkerRecord> {
        self.records
            .get(key)
            .filter(|stored| stored.expires_at > now)
            .map(|stored| &stored.record)
    }

    fn purge_expired(&mut self, now: Instant) {
        self.records.retain(|_, stored| stored.expires_at > now);
        self.commands.retain(|_, expires_at| *expires_at > now);
    }

    fn snapshot(&self, record: &WorkerRecord) -> WorkerSnapshot {
        WorkerSnapshot {
            record: record.clone(),
            active: self.active.get(&record.key).copied().unwrap_or(0),
            lifetime: self.lifetime.get(&record.key).copied().unwrap_or(0),
        }
    }

    fn remove_worker(&mut self, key: &WorkerKey) -> bool {
        let record = self.records.remove(key).is_some();
        let active = self.active.remove(key).is_some();
        let lifetime = self.lifetime.remove(key).is_some();
        let command = self.commands.remove(key).is_some();
        record || active || lifetime || command
    }
}

/// In-memory implementation of CoordinationStore
///
/// Provides the same semantics as the Redis implementation: TTLs expire
/// records (driven by the Tokio clock, so paused-time tests work), and every
/// operation runs under one lock, which makes selection atomic.
///
/// # Example
///
/// ```
/// use browserfleet_coordination::InMemoryCoordinationStore;
///
/// let store = InMemoryCoordinationStore::new();
/// ```
pub struct InMemoryCoordinationStore {
    state: RwLock<State>,
}

impl InMemoryCoordinationStore {
    /// Create a new in-memory store
    pub fn new() -> Self {
        Self {
            state: RwLock::new(State::default()),
        }
    }

    /// Number of live worker records
    pub fn worker_count(&self) -> usize {
        let now = Instant::now();
        let state = self.state.read();
        state
            .records
            .values()
            .filter(|stored| stored.expires_at > now)
            .count()
    }

    /// Counters for a worker, including ones whose record already expired
    pub fn counters(&self, worker: &WorkerKey) -> Option<(u32, u32)> {
        let state = self.state.read();
        match (state.active.get(worker), state.lifetime.get(worker)) {
            (None, None) => None,
            (active, lifetime) => Some((
                active.copied().unwrap_or(0),
                lifetime.copied().unwrap_or(0),
            )),
        }
    }

    /// Whether a live shutdown command is pending for the worker
    pub fn has_shutdown(&self, worker: &WorkerKey) -> bool {
        let now = Instant::now();
        self.state
            .read()
            .commands
            .get(worker)
            .is_some_and(|expires_at| *expires_at > now)
    }

    /// Overwrite a worker's heartbeat timestamp without touching its TTL (for testing)
    pub fn set_last_heartbeat(&self, worker: &WorkerKey, at: DateTime<Utc>) -> bool {
        let mut state = self.state.write();
        match state.records.get_mut(worker) {
            Some(stored) => {
                stored.record.last_heartbeat = at;
                true
            }
            None => false,
        }
    }

    /// Clear all data (for testing)
    pub fn clear(&self) {
        let mut state = self.state.write();
        *state = State::default();
    }
}

impl Default for InMemoryCoordinationStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CoordinationStore for InMemoryCoordinationStore {
    async fn register_worker(
        &self,
        record: WorkerRecord,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let now = Instant::now();
        let mut state = self.state.write();
        let key = record.key.clone();

        state.commands.remove(&key);
        state.active.insert(key.clone(), 0);
        state.lifetime.insert(key.clone(), 0);
        state.records.insert(
            key,
            StoredRecord {
                record,
                expires_at: now + ttl,
            },
        );
        Ok(())
    }

    async fn heartbeat_worker(
        &self,
        worker: &WorkerKey,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<HeartbeatResponse, StoreError> {
        let instant = Instant::now();
        let mut state = self.state.write();
        state.purge_expired(instant);

        let Some(stored) = state.records.get_mut(worker) else {
            return Ok(HeartbeatResponse {
                accepted: false,
                shutdown_requested: false,
            });
        };
        stored.record.last_heartbeat = now;
        stored.expires_at = instant + ttl;

        Ok(HeartbeatResponse {
            accepted: true,
            shutdown_requested: state.commands.contains_key(worker),
        })
    }

    async fn set_worker_status(
        &self,
        worker: &WorkerKey,
        status: WorkerStatus,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.write();
        state.purge_expired(Instant::now());

        match state.records.get_mut(worker) {
            Some(stored) => {
                stored.record.status = status;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn deregister_worker(&self, worker: &WorkerKey) -> Result<bool, StoreError> {
        Ok(self.state.write().remove_worker(worker))
    }

    async fn list_workers(&self, filter: WorkerFilter) -> Result<Vec<WorkerSnapshot>, StoreError> {
        if let Some(capability) = &filter.capability {
            validate_capability(capability)?;
        }
        let now = Instant::now();
        let state = self.state.read();

        let mut workers: Vec<WorkerSnapshot> = state
            .records
            .values()
            .filter(|stored| stored.expires_at > now)
            .map(|stored| &stored.record)
            .filter(|record| {
                filter
                    .capability
                    .as_deref()
                    .map_or(true, |capability| record.key.capability() == capability)
            })
            .map(|record| state.snapshot(record))
            .collect();

        workers.sort_by(|a, b| a.record.key.cmp(&b.record.key));
        Ok(workers)
    }

    async fn select_worker(&self, request: &SelectionRequest) -> Result<Selection, StoreError> {
        validate_capability(&request.capability)?;
        let now = Instant::now();
        // Held across read and commit: this is the atomic section.
        let mut state = self.state.write();

        let workers: Vec<WorkerSnapshot> = state
            .records
            .values()
            .filter(|stored| stored.expires_at > now)
            .filter(|stored| stored.record.key.capability() == request.capability)
            .map(|stored| state.snapshot(&stored.record))
            .collect();

        let Some(chosen) = algorithm::choose(
            &workers,
            &request.limits,
            request.liveness_window,
            request.now,
        ) else {
            return Ok(Selection::Unavailable);
        };

        let key = chosen.record.key.clone();
        let endpoint = chosen.record.endpoint.clone();
        let registered_at = chosen.record.registered_at;

        let active = state.active.entry(key.clone()).or_insert(0);
        *active += 1;
        let active = *active;
        let lifetime = state.lifetime.entry(key.clone()).or_insert(0);
        *lifetime += 1;
        let lifetime = *lifetime;

        Ok(Selection::Assigned(Assignment {
            worker: key,
            endpoint,
            active,
            lifetime,
            registered_at,
        }))
    }

    async fn release_worker(
        &self,
        worker: &WorkerKey,
        registered_at: Option<DateTime<Utc>>,
    ) -> Result<ReleaseOutcome, StoreError> {
        let now = Instant::now();
        let mut state = self.state.write();

        if let (Some(expected), Some(record)) = (registered_at, state.record(worker, now)) {
            if record.registered_at.timestamp_millis() != expected.timestamp_millis() {
                return Ok(ReleaseOutcome {
                    tracked: false,
                    active: 0,
                    lifetime: 0,
                });
            }
        }

        let lifetime = state.lifetime.get(worker).copied().unwrap_or(0);

        match state.active.get_mut(worker) {
            Some(active) => {
                *active = active.saturating_sub(1);
                Ok(ReleaseOutcome {
                    tracked: true,
                    active: *active,
                    lifetime,
                })
            }
            None => Ok(ReleaseOutcome {
                tracked: false,
                active: 0,
                lifetime,
            }),
        }
    }

    async fn total_active(&self) -> Result<u64, StoreError> {
        let state = self.state.read();
        Ok(state.active.values().map(|count| u64::from(*count)).sum())
    }

    async fn send_shutdown(&self, worker: &WorkerKey, ttl: Duration) -> Result<(), StoreError> {
        let expires_at = Instant::now() + ttl;
        self.state.write().commands.insert(worker.clone(), expires_at);
        Ok(())
    }

    async fn clear_shutdown(&self, worker: &WorkerKey) -> Result<(), StoreError> {
        self.state.write().commands.remove(worker);
        Ok(())
    }

    async fn reap_stale_workers(
        &self,
        stale_threshold: Duration,
        now: DateTime<Utc>,
    ) -> Result<ReapReport, StoreError> {
        let instant = Instant::now();
        let mut state = self.state.write();

        let known: BTreeSet<WorkerKey> = state
            .records
            .keys()
            .chain(state.active.keys())
            .chain(state.lifetime.keys())
            .cloned()
            .collect();

        let mut report = ReapReport::default();
        for key in known {
            let last_heartbeat = state.record(&key, instant).map(|record| record.last_heartbeat);
            match last_heartbeat {
                None => {
                    state.remove_worker(&key);
                    report.orphaned.push(key);
                }
                Some(at) if !algorithm::is_live(at, stale_threshold, now) => {
                    state.remove_worker(&key);
                    report.stale.push(key);
                }
                Some(_) => {}
            }
        }

        state.purge_expired(instant);
        Ok(report)
    }
}
