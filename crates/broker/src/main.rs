use std::sync::Arc;

use anyhow::{Context, Result};
use browserfleet_broker::{api, BrokerConfig, Relay};
use browserfleet_coordination::telemetry::{init_telemetry, TelemetryConfig};
use browserfleet_coordination::{CoordinationStore, Reaper, RedisCoordinationStore, Selector};
use tokio::net::TcpListener;
use tokio::sync::watch;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    // Configure via environment variables:
    // - OTEL_EXPORTER_OTLP_ENDPOINT: OTLP endpoint (e.g., "http://localhost:4317")
    // - RUST_LOG: Log filter (default: "browserfleet_broker=debug,browserfleet_coordination=info,tower_http=debug")
    let mut telemetry_config = TelemetryConfig::from_env("browserfleet-broker");
    if telemetry_config.log_filter.is_none() {
        telemetry_config.log_filter = Some(
            "browserfleet_broker=debug,browserfleet_coordination=info,tower_http=debug".to_string(),
        );
    }

    // Keep the guard alive for the lifetime of the application
    let _telemetry_guard = init_telemetry(telemetry_config);

    let config = BrokerConfig::from_env().context("Invalid broker configuration")?;
    tracing::info!(
        listeners = config.listeners.len(),
        max_concurrent = config.fleet.limits.max_concurrent,
        max_lifetime = config.fleet.limits.max_lifetime,
        run_reaper = config.run_reaper,
        "browserfleet-broker starting..."
    );

    let store: Arc<dyn CoordinationStore> = Arc::new(
        RedisCoordinationStore::connect(&config.fleet.redis_url, &config.fleet.timing)
            .await
            .context("Failed to connect to coordination store")?,
    );
    tracing::info!("Connected to coordination store");

    let selector = Selector::new(store.clone(), config.fleet.limits, &config.fleet.timing);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut relay_stats = Vec::new();
    let mut tasks = Vec::new();
    for listener_config in &config.listeners {
        let listener = TcpListener::bind(listener_config.addr)
            .await
            .with_context(|| format!("Failed to bind relay listener {}", listener_config.addr))?;
        let relay = Arc::new(Relay::new(
            selector.clone(),
            config.select_wait,
            config.backend_connect_timeout,
        ));
        relay_stats.push((listener_config.capability.clone(), relay.stats()));
        tasks.push(tokio::spawn(relay.serve(
            listener,
            listener_config.capability.clone(),
            shutdown_rx.clone(),
        )));
    }

    if config.run_reaper {
        let reaper = Reaper::new(store.clone(), &config.fleet.timing);
        let rx = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move {
            reaper.run(rx).await;
        }));
    }

    let app = api::routes(api::AppState {
        store,
        limits: config.fleet.limits,
        relay: relay_stats,
    });
    let listener = TcpListener::bind(config.admin_addr)
        .await
        .context("Failed to bind admin address")?;
    tracing::info!("Admin HTTP server listening on {}", config.admin_addr);

    let mut admin_shutdown = shutdown_rx.clone();
    let admin = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                admin_shutdown.wait_for(|stop| *stop).await.ok();
            })
            .await
    });

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    tracing::info!("Received shutdown signal");
    shutdown_tx.send(true).ok();

    for task in tasks {
        task.await.ok();
    }
    admin
        .await
        .context("Admin server task panicked")?
        .context("Admin server error")?;

    tracing::info!("Broker shutdown complete");
    Ok(())
}
