//! Scoped release of a reserved session slot

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::runtime::Handle;
use tracing::{error, info, warn};

use crate::persistence::{Assignment, CoordinationStore, ReleaseOutcome, WorkerKey};
use crate::selector::SelectError;

/// Everything needed to give a slot back after its selector is gone
#[derive(Clone)]
pub(crate) struct Releaser {
    pub(crate) store: Arc<dyn CoordinationStore>,
    pub(crate) max_lifetime: u32,
    pub(crate) command_ttl: Duration,
}

impl Releaser {
    /// Decrement the active counter, then request shutdown at the lifetime limit
    ///
    /// The two steps are separate store calls. A shutdown command is only
    /// sent for workers whose counters still exist and, with
    /// `registered_at`, still belong to that registration.
    pub(crate) async fn release(
        &self,
        worker: &WorkerKey,
        registered_at: Option<DateTime<Utc>>,
    ) -> Result<ReleaseOutcome, SelectError> {
        let release_error = |source| SelectError::Release {
            worker: worker.to_string(),
            source,
        };

        let outcome = self
            .store
            .release_worker(worker, registered_at)
            .await
            .map_err(release_error)?;

        if outcome.tracked && outcome.lifetime >= self.max_lifetime {
            self.store
                .send_shutdown(worker, self.command_ttl)
                .await
                .map_err(release_error)?;
            info!(
                worker = %worker,
                lifetime = outcome.lifetime,
                "Worker reached its lifetime limit, shutdown requested"
            );
        }
        Ok(outcome)
    }
}

/// A reserved slot on a worker
///
/// Call [`release`](Self::release) when the session ends. A lease that is
/// dropped without it (cancellation, early return, panic) schedules the same
/// release on the current Tokio runtime, so the slot is returned on every
/// exit path, and never twice.
#[must_use = "dropping a lease releases its slot immediately"]
pub struct SessionLease {
    assignment: Assignment,
    releaser: Option<Releaser>,
}

impl SessionLease {
    pub(crate) fn new(assignment: Assignment, releaser: Releaser) -> Self {
        Self {
            assignment,
            releaser: Some(releaser),
        }
    }

    pub fn worker(&self) -> &WorkerKey {
        &self.assignment.worker
    }

    pub fn endpoint(&self) -> &str {
        &self.assignment.endpoint
    }

    /// Counters as committed by the selection
    pub fn assignment(&self) -> &Assignment {
        &self.assignment
    }

    /// Give the slot back and wait for the store to confirm
    ///
    /// The release runs as its own task. Cancelling this future stops the
    /// wait, not the release.
    pub async fn release(mut self) -> Result<ReleaseOutcome, SelectError> {
        let Some(releaser) = self.releaser.take() else {
            return Ok(ReleaseOutcome {
                tracked: false,
                active: 0,
                lifetime: self.assignment.lifetime,
            });
        };
        let worker = self.assignment.worker.clone();
        let registered_at = self.assignment.registered_at;

        let task = tokio::spawn({
            let worker = worker.clone();
            async move { releaser.release(&worker, Some(registered_at)).await }
        });
        task.await.map_err(|e| SelectError::ReleaseAborted {
            worker: worker.to_string(),
            reason: e.to_string(),
        })?
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        let Some(releaser) = self.releaser.take() else {
            return;
        };
        let worker = self.assignment.worker.clone();
        let registered_at = self.assignment.registered_at;

        match Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = releaser.release(&worker, Some(registered_at)).await {
                        error!(error = %e, "Release of dropped session lease failed");
                    }
                });
            }
            Err(_) => {
                warn!(
                    worker = %worker,
                    "Session lease dropped outside a runtime; slot stays reserved until the worker is reaped"
                );
            }
        }
    }
}

impl std::fmt::Debug for SessionLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionLease")
            .field("assignment", &self.assignment)
            .field("released", &self.releaser.is_none())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{SelectionLimits, TimingConfig};
    use crate::persistence::{
        HeartbeatResponse, InMemoryCoordinationStore, ReapReport, Selection, SelectionRequest,
        StoreError, WorkerFilter, WorkerRecord, WorkerSnapshot, WorkerStatus,
    };
    use crate::selector::Selector;
    use async_trait::async_trait;
    use chrono::Utc;

    /// In-memory store whose release takes a while to commit
    struct SlowReleaseStore {
        inner: Arc<InMemoryCoordinationStore>,
        delay: Duration,
    }

    #[async_trait]
    impl CoordinationStore for SlowReleaseStore {
        async fn register_worker(&self, record: WorkerRecord, ttl: Duration) -> Result<(), StoreError> {
            self.inner.register_worker(record, ttl).await
        }
        async fn heartbeat_worker(
            &self,
            worker: &WorkerKey,
            now: DateTime<Utc>,
            ttl: Duration,
        ) -> Result<HeartbeatResponse, StoreError> {
            self.inner.heartbeat_worker(worker, now, ttl).await
        }
        async fn set_worker_status(&self, worker: &WorkerKey, status: WorkerStatus) -> Result<bool, StoreError> {
            self.inner.set_worker_status(worker, status).await
        }
        async fn deregister_worker(&self, worker: &WorkerKey) -> Result<bool, StoreError> {
            self.inner.deregister_worker(worker).await
        }
        async fn list_workers(&self, filter: WorkerFilter) -> Result<Vec<WorkerSnapshot>, StoreError> {
            self.inner.list_workers(filter).await
        }
        async fn select_worker(&self, request: &SelectionRequest) -> Result<Selection, StoreError> {
            self.inner.select_worker(request).await
        }
        async fn release_worker(
            &self,
            worker: &WorkerKey,
            registered_at: Option<DateTime<Utc>>,
        ) -> Result<ReleaseOutcome, StoreError> {
            tokio::time::sleep(self.delay).await;
            self.inner.release_worker(worker, registered_at).await
        }
        async fn total_active(&self) -> Result<u64, StoreError> {
            self.inner.total_active().await
        }
        async fn send_shutdown(&self, worker: &WorkerKey, ttl: Duration) -> Result<(), StoreError> {
            self.inner.send_shutdown(worker, ttl).await
        }
        async fn clear_shutdown(&self, worker: &WorkerKey) -> Result<(), StoreError> {
            self.inner.clear_shutdown(worker).await
        }
        async fn reap_stale_workers(
            &self,
            stale_threshold: Duration,
            now: DateTime<Utc>,
        ) -> Result<ReapReport, StoreError> {
            self.inner.reap_stale_workers(stale_threshold, now).await
        }
    }

    async fn setup(limits: SelectionLimits) -> (Arc<InMemoryCoordinationStore>, Selector, WorkerKey) {
        let store = Arc::new(InMemoryCoordinationStore::new());
        let worker = WorkerKey::new("chromium", "w-1").unwrap();
        store
            .register_worker(
                WorkerRecord::new(worker.clone(), "ws://w-1:9222", Utc::now()),
                Duration::from_secs(15),
            )
            .await
            .unwrap();
        let selector = Selector::new(store.clone(), limits, &TimingConfig::default());
        (store, selector, worker)
    }

    #[tokio::test]
    async fn test_release_decrements_once() {
        let (store, selector, worker) = setup(SelectionLimits::new(5, 20)).await;
        let lease = selector.acquire("chromium", Duration::ZERO).await.unwrap();
        assert_eq!(lease.endpoint(), "ws://w-1:9222");
        assert_eq!(store.counters(&worker), Some((1, 1)));

        let outcome = lease.release().await.unwrap();
        assert_eq!(outcome.active, 0);

        // Let any stray drop-spawned task run; nothing may decrement again.
        tokio::task::yield_now().await;
        assert_eq!(store.counters(&worker), Some((0, 1)));
    }

    #[tokio::test]
    async fn test_drop_releases_slot() {
        let (store, selector, worker) = setup(SelectionLimits::new(5, 20)).await;
        {
            let _lease = selector.acquire("chromium", Duration::ZERO).await.unwrap();
            let _other = selector.acquire("chromium", Duration::ZERO).await.unwrap();
            assert_eq!(store.counters(&worker), Some((2, 2)));
        }

        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(store.counters(&worker), Some((0, 2)));
    }

    #[tokio::test]
    async fn test_cancelled_session_still_releases() {
        let (store, selector, worker) = setup(SelectionLimits::new(5, 20)).await;
        let lease = selector.acquire("chromium", Duration::ZERO).await.unwrap();

        let session = tokio::spawn(async move {
            let _lease = lease;
            std::future::pending::<()>().await;
        });
        tokio::task::yield_now().await;
        session.abort();
        let _ = session.await;

        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(store.counters(&worker), Some((0, 1)));
    }

    #[tokio::test]
    async fn test_cancelled_release_still_completes() {
        let (inner, _, worker) = setup(SelectionLimits::new(5, 20)).await;
        let store = Arc::new(SlowReleaseStore {
            inner: inner.clone(),
            delay: Duration::from_millis(50),
        });
        let selector = Selector::new(store, SelectionLimits::new(5, 20), &TimingConfig::default());
        let lease = selector.acquire("chromium", Duration::ZERO).await.unwrap();
        assert_eq!(inner.counters(&worker), Some((1, 1)));

        let waited = tokio::time::timeout(Duration::from_millis(10), lease.release()).await;
        assert!(waited.is_err());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(inner.counters(&worker), Some((0, 1)));
    }

    #[tokio::test]
    async fn test_lease_from_earlier_registration_keeps_new_counters() {
        let (store, selector, worker) = setup(SelectionLimits::new(5, 1)).await;
        let lease = selector.acquire("chromium", Duration::ZERO).await.unwrap();

        let mut record = WorkerRecord::new(worker.clone(), "ws://w-1:9222", Utc::now());
        record.registered_at = lease.assignment().registered_at + chrono::Duration::seconds(1);
        store.register_worker(record, Duration::from_secs(15)).await.unwrap();
        let _fresh = selector.acquire("chromium", Duration::ZERO).await.unwrap();
        assert_eq!(store.counters(&worker), Some((1, 1)));

        let outcome = lease.release().await.unwrap();
        assert!(!outcome.tracked);
        assert_eq!(store.counters(&worker), Some((1, 1)));
        assert!(!store.has_shutdown(&worker));
    }

    #[tokio::test]
    async fn test_dropped_lease_at_limit_requests_shutdown() {
        let (store, selector, worker) = setup(SelectionLimits::new(5, 1)).await;
        drop(selector.acquire("chromium", Duration::ZERO).await.unwrap());

        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert!(store.has_shutdown(&worker));
    }
}
