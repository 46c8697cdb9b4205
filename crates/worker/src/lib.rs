//! Worker: runs one backend behind an admission proxy and keeps it in the
//! fleet registry until it retires.

pub mod config;
pub mod launcher;

pub use config::{LauncherConfig, WorkerConfig, WorkerConfigError};
pub use launcher::ProcessLauncher;
