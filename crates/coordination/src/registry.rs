//! Worker registry: typed access to worker records
//!
//! `register` and `heartbeat` retry transient store failures with backoff;
//! every other operation makes one bounded attempt. Each attempt is capped by
//! the store timeout.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, instrument};

use crate::config::TimingConfig;
use crate::persistence::{
    CoordinationStore, HeartbeatResponse, StoreError, WorkerFilter, WorkerKey, WorkerRecord,
    WorkerSnapshot, WorkerStatus,
};
use crate::reliability::{RetryExhausted, RetryPolicy};

/// Registry errors
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// Store call failed; carries enough context to log and alert
    #[error("{operation} for worker {worker} failed after {attempts} attempt(s): {source}")]
    Store {
        operation: &'static str,
        worker: String,
        attempts: u32,
        #[source]
        source: StoreError,
    },
}

impl RegistryError {
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Store { attempts, .. } => *attempts,
        }
    }
}

/// Worker-facing wrapper over the coordination store
#[derive(Clone)]
pub struct WorkerRegistry {
    store: Arc<dyn CoordinationStore>,
    retry: RetryPolicy,
    record_ttl: Duration,
    store_timeout: Duration,
}

impl WorkerRegistry {
    pub fn new(store: Arc<dyn CoordinationStore>, timing: &TimingConfig) -> Self {
        Self {
            store,
            retry: RetryPolicy::default(),
            record_ttl: timing.record_ttl,
            store_timeout: timing.store_timeout,
        }
    }

    /// Set retry policy for register and heartbeat
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    pub fn store(&self) -> &Arc<dyn CoordinationStore> {
        &self.store
    }

    /// Write a fresh, available record with zeroed counters
    #[instrument(skip(self), fields(worker = %worker))]
    pub async fn register(&self, worker: &WorkerKey, endpoint: &str) -> Result<(), RegistryError> {
        let this = self;
        let result = self
            .retry
            .run("register", move |_| {
                let record = WorkerRecord::new(worker.clone(), endpoint, Utc::now());
                this.timed(this.store.register_worker(record, this.record_ttl))
            })
            .await;
        retried("register", worker, result)?;

        info!(endpoint, "Worker registered");
        Ok(())
    }

    /// Refresh the record and report a pending shutdown command
    #[instrument(skip(self), fields(worker = %worker))]
    pub async fn heartbeat(&self, worker: &WorkerKey) -> Result<HeartbeatResponse, RegistryError> {
        let this = self;
        let result = self
            .retry
            .run("heartbeat", move |_| {
                this.timed(
                    this.store
                        .heartbeat_worker(worker, Utc::now(), this.record_ttl),
                )
            })
            .await;
        retried("heartbeat", worker, result)
    }

    /// Mark the worker draining; the selector never chooses it again
    #[instrument(skip(self), fields(worker = %worker))]
    pub async fn mark_draining(&self, worker: &WorkerKey) -> Result<bool, RegistryError> {
        let updated = self
            .once(
                "mark_draining",
                worker,
                self.store.set_worker_status(worker, WorkerStatus::Draining),
            )
            .await?;
        debug!(updated, "Worker marked draining");
        Ok(updated)
    }

    /// Remove a shutdown command the worker has acted on
    pub async fn acknowledge_shutdown(&self, worker: &WorkerKey) -> Result<(), RegistryError> {
        self.once(
            "acknowledge_shutdown",
            worker,
            self.store.clear_shutdown(worker),
        )
        .await
    }

    /// Delete the record and counters; safe to repeat
    #[instrument(skip(self), fields(worker = %worker))]
    pub async fn deregister(&self, worker: &WorkerKey) -> Result<bool, RegistryError> {
        let removed = self
            .once("deregister", worker, self.store.deregister_worker(worker))
            .await?;
        info!(removed, "Worker deregistered");
        Ok(removed)
    }

    /// Every worker registered under `capability`, in no particular order
    pub async fn list_by_capability(
        &self,
        capability: &str,
    ) -> Result<Vec<WorkerSnapshot>, RegistryError> {
        let filter = WorkerFilter::capability(capability);
        self.timed(self.store.list_workers(filter))
            .await
            .map_err(|source| RegistryError::Store {
                operation: "list_by_capability",
                worker: format!("{capability}:*"),
                attempts: 1,
                source,
            })
    }

    async fn once<T>(
        &self,
        operation: &'static str,
        worker: &WorkerKey,
        fut: impl Future<Output = Result<T, StoreError>>,
    ) -> Result<T, RegistryError> {
        self.timed(fut)
            .await
            .map_err(|source| RegistryError::Store {
                operation,
                worker: worker.to_string(),
                attempts: 1,
                source,
            })
    }

    async fn timed<T>(
        &self,
        fut: impl Future<Output = Result<T, StoreError>>,
    ) -> Result<T, StoreError> {
        match tokio::time::timeout(self.store_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout(self.store_timeout)),
        }
    }
}

fn retried<T>(
    operation: &'static str,
    worker: &WorkerKey,
    result: Result<T, RetryExhausted<StoreError>>,
) -> Result<T, RegistryError> {
    result.map_err(|exhausted| RegistryError::Store {
        operation,
        worker: worker.to_string(),
        attempts: exhausted.attempts,
        source: exhausted.error,
    })
}
