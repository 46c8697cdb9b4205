//! Worker selection for incoming sessions
//!
//! [`Selector::select`] is one atomic store step: choose a worker and reserve
//! a slot on it. [`Selector::acquire`] wraps it in a bounded wait and hands
//! out a [`SessionLease`] that gives the slot back exactly once.

mod acquire;
pub mod algorithm;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::Instant;
use tracing::{debug, instrument};

pub use acquire::AcquireConfig;

use crate::config::{SelectionLimits, TimingConfig};
use crate::persistence::{
    CoordinationStore, ReleaseOutcome, Selection, SelectionRequest, StoreError, WorkerKey,
};
use crate::session::{Releaser, SessionLease};
use acquire::Backoff;

/// Selection errors
///
/// Running out of workers is not an error; see [`Selection::Unavailable`].
#[derive(Debug, thiserror::Error)]
pub enum SelectError {
    /// Store failed during the atomic selection
    #[error("selection for capability '{capability}' failed: {source}")]
    Store {
        capability: String,
        #[source]
        source: StoreError,
    },

    /// Store failed while giving a slot back
    #[error("release of worker {worker} failed: {source}")]
    Release {
        worker: String,
        #[source]
        source: StoreError,
    },

    /// Release task ended without reporting an outcome
    #[error("release of worker {worker} did not complete: {reason}")]
    ReleaseAborted { worker: String, reason: String },
}

/// Errors from a bounded acquire
#[derive(Debug, thiserror::Error)]
pub enum AcquireError {
    /// No worker became available within the wait budget
    #[error("no worker available for capability '{capability}' after {waited:?}")]
    Unavailable { capability: String, waited: Duration },

    /// Store failure, surfaced without waiting out the budget
    #[error(transparent)]
    Select(#[from] SelectError),
}

/// Chooses workers and tracks their session slots
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use browserfleet_coordination::{InMemoryCoordinationStore, SelectionLimits, Selector, TimingConfig};
///
/// let store = Arc::new(InMemoryCoordinationStore::new());
/// let selector = Selector::new(store, SelectionLimits::new(5, 100), &TimingConfig::default());
/// ```
#[derive(Clone)]
pub struct Selector {
    store: Arc<dyn CoordinationStore>,
    limits: SelectionLimits,
    liveness_window: Duration,
    command_ttl: Duration,
    acquire: AcquireConfig,
}

impl Selector {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        limits: SelectionLimits,
        timing: &TimingConfig,
    ) -> Self {
        Self {
            store,
            limits,
            liveness_window: timing.liveness_window,
            command_ttl: timing.command_ttl,
            acquire: AcquireConfig::default(),
        }
    }

    /// Set acquire polling configuration
    pub fn with_acquire_config(mut self, config: AcquireConfig) -> Self {
        self.acquire = config;
        self
    }

    pub fn limits(&self) -> &SelectionLimits {
        &self.limits
    }

    /// Run one atomic selection for `capability`
    ///
    /// Never retries; a store failure is returned as is.
    #[instrument(skip(self))]
    pub async fn select(&self, capability: &str) -> Result<Selection, SelectError> {
        let request = SelectionRequest {
            capability: capability.to_string(),
            limits: self.limits,
            liveness_window: self.liveness_window,
            now: Utc::now(),
        };

        self.store
            .select_worker(&request)
            .await
            .map_err(|source| SelectError::Store {
                capability: capability.to_string(),
                source,
            })
    }

    /// Wait up to `wait_budget` for a worker and reserve a slot on it
    ///
    /// A zero budget makes exactly one attempt.
    #[instrument(skip(self))]
    pub async fn acquire(
        &self,
        capability: &str,
        wait_budget: Duration,
    ) -> Result<SessionLease, AcquireError> {
        let started = Instant::now();
        let deadline = started + wait_budget;
        let mut backoff = Backoff::new(&self.acquire);

        loop {
            if let Selection::Assigned(assignment) = self.select(capability).await? {
                debug!(
                    worker = %assignment.worker,
                    endpoint = %assignment.endpoint,
                    active = assignment.active,
                    lifetime = assignment.lifetime,
                    "Session slot acquired"
                );
                return Ok(SessionLease::new(assignment, self.releaser()));
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(AcquireError::Unavailable {
                    capability: capability.to_string(),
                    waited: now - started,
                });
            }
            let delay = backoff.next_delay().min(deadline - now);
            tokio::time::sleep(delay).await;
        }
    }

    /// Give back a slot taken by [`select`](Self::select)
    ///
    /// Sends the shutdown command when the worker reached its lifetime limit.
    pub async fn release(&self, worker: &WorkerKey) -> Result<ReleaseOutcome, SelectError> {
        self.releaser().release(worker, None).await
    }

    pub(crate) fn releaser(&self) -> Releaser {
        Releaser {
            store: Arc::clone(&self.store),
            max_lifetime: self.limits.max_lifetime,
            command_ttl: self.command_ttl,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::{InMemoryCoordinationStore, WorkerRecord};

    async fn fleet(ids: &[&str], limits: SelectionLimits) -> (Arc<InMemoryCoordinationStore>, Selector) {
        let store = Arc::new(InMemoryCoordinationStore::new());
        for id in ids {
            let key = WorkerKey::new("chromium", *id).unwrap();
            store
                .register_worker(
                    WorkerRecord::new(key, format!("ws://{id}:9222"), Utc::now()),
                    Duration::from_secs(15),
                )
                .await
                .unwrap();
        }
        let selector = Selector::new(store.clone(), limits, &TimingConfig::default());
        (store, selector)
    }

    #[tokio::test]
    async fn test_select_reserves_slot() {
        let (store, selector) = fleet(&["w-1"], SelectionLimits::new(5, 20)).await;

        let selection = selector.select("chromium").await.unwrap();
        let assignment = selection.assignment().unwrap();
        assert_eq!(assignment.endpoint, "ws://w-1:9222");
        assert_eq!(store.counters(&assignment.worker), Some((1, 1)));
    }

    #[tokio::test]
    async fn test_select_unknown_capability_is_unavailable() {
        let (_store, selector) = fleet(&[], SelectionLimits::default()).await;
        assert_eq!(
            selector.select("firefox").await.unwrap(),
            Selection::Unavailable
        );
    }

    #[tokio::test]
    async fn test_select_rejects_invalid_capability() {
        let (store, selector) = fleet(&["w-1"], SelectionLimits::default()).await;
        let err = selector.select("chrom:ium").await.unwrap_err();
        assert!(matches!(
            err,
            SelectError::Store {
                source: StoreError::InvalidKey(_),
                ..
            }
        ));
        let worker = WorkerKey::new("chromium", "w-1").unwrap();
        assert_eq!(store.counters(&worker), Some((0, 0)));
    }

    #[tokio::test]
    async fn test_release_sends_shutdown_at_lifetime_limit() {
        let (store, selector) = fleet(&["w-1"], SelectionLimits::new(5, 2)).await;
        let worker = WorkerKey::new("chromium", "w-1").unwrap();

        selector.select("chromium").await.unwrap();
        selector.release(&worker).await.unwrap();
        assert!(!store.has_shutdown(&worker));

        selector.select("chromium").await.unwrap();
        let outcome = selector.release(&worker).await.unwrap();
        assert_eq!(outcome.lifetime, 2);
        assert!(store.has_shutdown(&worker));
    }

    #[tokio::test]
    async fn test_release_of_unknown_worker_sends_nothing() {
        let (store, selector) = fleet(&[], SelectionLimits::new(5, 1)).await;
        let ghost = WorkerKey::new("chromium", "ghost").unwrap();

        let outcome = selector.release(&ghost).await.unwrap();
        assert!(!outcome.tracked);
        assert!(!store.has_shutdown(&ghost));
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_gives_up_after_budget() {
        let (_store, selector) = fleet(&["w-1"], SelectionLimits::new(1, 20)).await;
        let _held = selector.acquire("chromium", Duration::ZERO).await.unwrap();

        let err = selector
            .acquire("chromium", Duration::from_millis(500))
            .await
            .unwrap_err();
        match err {
            AcquireError::Unavailable { capability, waited } => {
                assert_eq!(capability, "chromium");
                assert!(waited >= Duration::from_millis(500));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_waits_for_released_slot() {
        let (_store, selector) = fleet(&["w-1"], SelectionLimits::new(1, 20)).await;
        let held = selector.acquire("chromium", Duration::ZERO).await.unwrap();

        let waiter = {
            let selector = selector.clone();
            tokio::spawn(async move { selector.acquire("chromium", Duration::from_secs(5)).await })
        };

        tokio::time::sleep(Duration::from_millis(200)).await;
        held.release().await.unwrap();

        let lease = waiter.await.unwrap().unwrap();
        assert_eq!(lease.assignment().lifetime, 2);
    }
}
