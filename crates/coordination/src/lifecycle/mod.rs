//! Worker lifecycle: START -> SERVE -> DRAIN -> EXIT
//!
//! This module provides:
//! - [`LifecycleState`] - explicit states with a transition table
//! - [`LifecycleDriver`] - runs one worker process through its lifecycle
//! - [`BackendLauncher`] - the seam to the backend the worker fronts
//! - [`AdmissionGate`] - local refusal and in-flight counting for the drain wait
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     LifecycleDriver                          │
//! │  START:  launcher.start() ─► registry.register()            │
//! │  SERVE:  heartbeat every interval, watch for commands       │
//! │  DRAIN:  mark draining, close admission, wait in-flight = 0 │
//! │  EXIT:   registry.deregister() ─► launcher.stop()           │
//! └─────────────────────────────────────────────────────────────┘
//!                  │                           │
//!                  ▼                           ▼
//!          ┌──────────────┐           ┌─────────────────┐
//!          │WorkerRegistry│           │ BackendLauncher │
//!          └──────────────┘           │ + AdmissionGate │
//!                                     └─────────────────┘
//! ```

mod driver;
mod gate;
mod state;

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;

use crate::registry::RegistryError;

pub use driver::{ExitReason, LifecycleDriver};
pub use gate::{AdmissionGate, AdmissionPermit};
pub use state::LifecycleState;

/// Errors starting or stopping a backend
#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    /// Spawning or talking to the backend failed
    #[error("backend I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The backend did not start listening in time
    #[error("backend at {addr} not ready after {waited:?}")]
    NotReady { addr: String, waited: Duration },

    /// The backend process exited on its own
    #[error("backend exited: {0}")]
    Exited(String),

    /// Launcher configuration cannot be used
    #[error("invalid launcher configuration: {0}")]
    Config(String),
}

/// Lifecycle errors
#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    /// Transition not in the table
    #[error("invalid lifecycle transition {from} -> {to}")]
    InvalidTransition {
        from: LifecycleState,
        to: LifecycleState,
    },

    /// The backend could not be started
    #[error("backend launch failed: {0}")]
    Launch(#[from] LaunchError),

    /// Registration failed after the retry budget; the worker must not serve
    #[error("worker registration failed: {0}")]
    Registration(#[source] RegistryError),
}

/// The backend a worker fronts
///
/// The driver only needs to start it, stop it, know how many sessions are
/// open, and stop admitting new ones.
#[async_trait]
pub trait BackendLauncher: Send + Sync + 'static {
    /// Start the backend; returns the endpoint brokers should connect to
    async fn start(&self) -> Result<String, LaunchError>;

    /// Release the backend's resources
    async fn stop(&self) -> Result<(), LaunchError>;

    /// Sessions currently open on this worker
    fn in_flight(&self) -> usize;

    /// Refuse new sessions locally
    fn close_admission(&self);
}

/// Resolve once shutdown is signalled or the sender is gone
pub async fn shutdown_signalled(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}
