use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use browserfleet_coordination::telemetry::{init_telemetry, TelemetryConfig};
use browserfleet_coordination::{
    BackendLauncher, ExitReason, LifecycleDriver, RedisCoordinationStore, WorkerRegistry,
};
use browserfleet_worker::{ProcessLauncher, WorkerConfig};
use tokio::sync::watch;

#[tokio::main]
async fn main() -> Result<ExitCode> {
    dotenvy::dotenv().ok();

    // Configure via environment variables:
    // - OTEL_EXPORTER_OTLP_ENDPOINT: OTLP endpoint (e.g., "http://localhost:4317")
    // - RUST_LOG: Log filter (default: "browserfleet_worker=debug,browserfleet_coordination=info")
    let mut telemetry_config = TelemetryConfig::from_env("browserfleet-worker");
    if telemetry_config.log_filter.is_none() {
        telemetry_config.log_filter =
            Some("browserfleet_worker=debug,browserfleet_coordination=info".to_string());
    }

    // Keep the guard alive for the lifetime of the application
    let _telemetry_guard = init_telemetry(telemetry_config);

    let config = WorkerConfig::from_env().context("Invalid worker configuration")?;
    let worker = config.worker_key()?;
    tracing::info!(
        worker_id = %config.worker_id,
        capability = %config.capability,
        listen = %config.launcher.listen_addr,
        backend = %config.launcher.backend_addr,
        "browserfleet-worker starting..."
    );

    let store = Arc::new(
        RedisCoordinationStore::connect(&config.fleet.redis_url, &config.fleet.timing)
            .await
            .context("Failed to connect to coordination store")?,
    );
    let registry = WorkerRegistry::new(store, &config.fleet.timing);
    let launcher: Arc<dyn BackendLauncher> = Arc::new(ProcessLauncher::new(config.launcher.clone()));
    let driver = LifecycleDriver::new(registry, launcher, worker, &config.fleet.timing);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("Received shutdown signal, draining");
                shutdown_tx.send(true).ok();
            }
            Err(e) => {
                // Dropping the sender would read as a shutdown request
                tracing::error!(error = %e, "Failed to listen for shutdown signal");
                std::future::pending::<()>().await;
                drop(shutdown_tx);
            }
        }
    });

    let reason = driver
        .run(shutdown_rx)
        .await
        .context("Worker lifecycle failed")?;

    tracing::info!(reason = ?reason, "Worker shutdown complete");
    Ok(match reason {
        ExitReason::Retired | ExitReason::Interrupted => ExitCode::SUCCESS,
        ExitReason::DrainTimeout | ExitReason::Evicted => ExitCode::FAILURE,
    })
}
