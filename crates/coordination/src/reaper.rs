//! Periodic removal of workers that stopped heartbeating
//!
//! A safety net next to record TTLs: a worker that crashed without
//! deregistering loses its record, counters and index entry here.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, instrument};

use crate::config::TimingConfig;
use crate::lifecycle::shutdown_signalled;
use crate::persistence::{CoordinationStore, ReapReport, StoreError};

/// Sweeps stale workers out of the store
#[derive(Clone)]
pub struct Reaper {
    store: Arc<dyn CoordinationStore>,
    stale_threshold: Duration,
    interval: Duration,
}

impl Reaper {
    pub fn new(store: Arc<dyn CoordinationStore>, timing: &TimingConfig) -> Self {
        Self {
            store,
            stale_threshold: timing.stale_threshold,
            interval: timing.reap_interval,
        }
    }

    /// One atomic sweep; an empty report is a normal outcome
    #[instrument(skip(self))]
    pub async fn sweep(&self) -> Result<ReapReport, StoreError> {
        let report = self
            .store
            .reap_stale_workers(self.stale_threshold, Utc::now())
            .await?;

        if report.is_empty() {
            debug!("Nothing to reap");
        } else {
            info!(
                stale = report.stale.len(),
                orphaned = report.orphaned.len(),
                "Reaped workers"
            );
        }
        Ok(report)
    }

    /// Sweep every `reap_interval` until shutdown; returns the total reaped
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> usize {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut total = 0;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.sweep().await {
                        Ok(report) => total += report.total(),
                        Err(e) => error!(error = %e, "Reaper sweep failed"),
                    }
                }
                _ = shutdown_signalled(&mut shutdown) => {
                    debug!("Reaper: shutdown requested");
                    break;
                }
            }
        }

        debug!(total, "Reaper exited");
        total
    }
}
