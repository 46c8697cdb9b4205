//! Drives one worker process through its lifecycle

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, instrument, trace, warn};

use super::{shutdown_signalled, BackendLauncher, LifecycleError, LifecycleState};
use crate::config::TimingConfig;
use crate::persistence::WorkerKey;
use crate::registry::WorkerRegistry;

/// Why a worker left SERVE and exited
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    /// Shutdown command received and every session finished
    Retired,
    /// Sessions were still open when the drain timeout elapsed
    DrainTimeout,
    /// The record was gone when the worker heartbeated (expired or reaped)
    Evicted,
    /// The process was asked to stop
    Interrupted,
}

/// What ended SERVE
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DrainTrigger {
    ShutdownCommand,
    Evicted,
    Interrupted,
}

/// Runs START -> SERVE -> DRAIN -> EXIT for one worker
pub struct LifecycleDriver {
    registry: WorkerRegistry,
    launcher: Arc<dyn BackendLauncher>,
    worker: WorkerKey,
    heartbeat_interval: Duration,
    drain_timeout: Duration,
    drain_poll_interval: Duration,
    state: watch::Sender<LifecycleState>,
}

impl LifecycleDriver {
    pub fn new(
        registry: WorkerRegistry,
        launcher: Arc<dyn BackendLauncher>,
        worker: WorkerKey,
        timing: &TimingConfig,
    ) -> Self {
        let (state, _) = watch::channel(LifecycleState::Start);
        Self {
            registry,
            launcher,
            worker,
            heartbeat_interval: timing.heartbeat_interval,
            drain_timeout: timing.drain_timeout,
            drain_poll_interval: timing.drain_poll_interval,
            state,
        }
    }

    pub fn worker(&self) -> &WorkerKey {
        &self.worker
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.borrow()
    }

    /// Follow state changes from outside the driver
    pub fn subscribe(&self) -> watch::Receiver<LifecycleState> {
        self.state.subscribe()
    }

    /// Run the lifecycle to completion
    ///
    /// `shutdown` turning true (or its sender being dropped) moves a serving
    /// worker to DRAIN. Errors are only returned from START; once serving,
    /// the driver always reaches EXIT.
    #[instrument(skip(self, shutdown), fields(worker = %self.worker))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<ExitReason, LifecycleError> {
        // START
        let endpoint = match self.launcher.start().await {
            Ok(endpoint) => endpoint,
            Err(e) => {
                error!(error = %e, "Backend failed to start");
                self.enter(LifecycleState::Exit)?;
                return Err(LifecycleError::Launch(e));
            }
        };

        if let Err(e) = self.registry.register(&self.worker, &endpoint).await {
            error!(error = %e, "Registration failed, giving up");
            self.enter(LifecycleState::Exit)?;
            self.stop_backend().await;
            return Err(LifecycleError::Registration(e));
        }
        self.enter(LifecycleState::Serve)?;
        info!(endpoint = %endpoint, "Worker serving");

        // SERVE
        let trigger = self.serve(&mut shutdown).await;

        // DRAIN
        self.enter(LifecycleState::Drain)?;
        self.launcher.close_admission();
        if trigger != DrainTrigger::Evicted {
            if let Err(e) = self.registry.mark_draining(&self.worker).await {
                warn!(error = %e, "Failed to mark worker draining");
            }
        }
        if trigger == DrainTrigger::ShutdownCommand {
            if let Err(e) = self.registry.acknowledge_shutdown(&self.worker).await {
                warn!(error = %e, "Failed to clear shutdown command");
            }
        }
        let drained = self.wait_for_drain().await;

        // EXIT
        self.enter(LifecycleState::Exit)?;
        if let Err(e) = self.registry.deregister(&self.worker).await {
            warn!(error = %e, "Deregistration failed; the reaper will remove the record");
        }
        self.stop_backend().await;

        let reason = match (drained, trigger) {
            (false, _) => ExitReason::DrainTimeout,
            (true, DrainTrigger::ShutdownCommand) => ExitReason::Retired,
            (true, DrainTrigger::Evicted) => ExitReason::Evicted,
            (true, DrainTrigger::Interrupted) => ExitReason::Interrupted,
        };
        info!(?reason, "Worker exited");
        Ok(reason)
    }

    /// Heartbeat until something ends SERVE
    async fn serve(&self, shutdown: &mut watch::Receiver<bool>) -> DrainTrigger {
        let mut ticker = tokio::time::interval(self.heartbeat_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // Registration just wrote a fresh heartbeat.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.registry.heartbeat(&self.worker).await {
                        Ok(response) if !response.accepted => {
                            warn!("Worker record is gone, draining without re-registering");
                            return DrainTrigger::Evicted;
                        }
                        Ok(response) if response.shutdown_requested => {
                            info!("Shutdown command received");
                            return DrainTrigger::ShutdownCommand;
                        }
                        Ok(_) => trace!("Heartbeat accepted"),
                        Err(e) => error!(error = %e, "Heartbeat failed"),
                    }
                }
                _ = shutdown_signalled(shutdown) => {
                    info!("Shutdown signal received");
                    return DrainTrigger::Interrupted;
                }
            }
        }
    }

    /// Poll the in-flight count until zero; false if the timeout elapsed first
    async fn wait_for_drain(&self) -> bool {
        let deadline = Instant::now() + self.drain_timeout;

        loop {
            let in_flight = self.launcher.in_flight();
            if in_flight == 0 {
                debug!("All sessions finished");
                return true;
            }

            if Instant::now() >= deadline {
                warn!(remaining_sessions = in_flight, "Drain timeout reached");
                return false;
            }

            tokio::time::sleep(self.drain_poll_interval).await;
        }
    }

    async fn stop_backend(&self) {
        if let Err(e) = self.launcher.stop().await {
            warn!(error = %e, "Backend did not stop cleanly");
        }
    }

    fn enter(&self, next: LifecycleState) -> Result<(), LifecycleError> {
        let current = *self.state.borrow();
        let next = current.transition(next)?;
        self.state.send_replace(next);
        debug!(from = %current, to = %next, "Lifecycle transition");
        Ok(())
    }
}
