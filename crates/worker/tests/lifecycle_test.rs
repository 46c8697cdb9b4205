//! A worker process served through a lease and retired by its lifetime limit
//!
//! Run with: cargo test -p browserfleet-worker --test lifecycle_test

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use browserfleet_coordination::{
    BackendLauncher, ExitReason, InMemoryCoordinationStore, LifecycleDriver, LifecycleState,
    Selection, SelectionLimits, Selector, TimingConfig, WorkerKey, WorkerRegistry,
};
use browserfleet_worker::{LauncherConfig, ProcessLauncher};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

fn fast_timing() -> TimingConfig {
    TimingConfig::default()
        .with_heartbeat_interval(Duration::from_millis(50))
        .with_record_ttl(Duration::from_secs(1))
        .with_command_ttl(Duration::from_secs(2))
        .with_stale_threshold(Duration::from_millis(500))
        .with_liveness_window(Duration::from_secs(1))
        .with_drain(Duration::from_secs(5), Duration::from_millis(20))
        .with_store_timeout(Duration::from_millis(500))
}

async fn echo_backend() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut reader, mut writer) = stream.split();
                tokio::io::copy(&mut reader, &mut writer).await.ok();
            });
        }
    });
    addr
}

async fn wait_for_state(rx: &mut watch::Receiver<LifecycleState>, state: LifecycleState) {
    tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| *s == state))
        .await
        .unwrap_or_else(|_| panic!("worker never reached {state}"))
        .unwrap();
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 2))]
async fn test_worker_retires_after_lifetime_limit() {
    let timing = fast_timing();
    timing.validate().unwrap();

    let store = Arc::new(InMemoryCoordinationStore::new());
    let worker = WorkerKey::new("chromium", "worker-1").unwrap();
    let launcher = Arc::new(ProcessLauncher::new(LauncherConfig {
        backend_addr: echo_backend().await.to_string(),
        listen_addr: "127.0.0.1:0".parse().unwrap(),
        ready_timeout: Duration::from_secs(2),
        ..LauncherConfig::default()
    }));

    let driver = LifecycleDriver::new(
        WorkerRegistry::new(store.clone(), &timing),
        launcher.clone() as Arc<dyn BackendLauncher>,
        worker.clone(),
        &timing,
    );
    let mut states = driver.subscribe();
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let run = tokio::spawn(async move { driver.run(shutdown_rx).await });

    wait_for_state(&mut states, LifecycleState::Serve).await;

    // One session is the whole lifetime of this worker.
    let selector = Selector::new(store.clone(), SelectionLimits::new(2, 1), &timing);
    let lease = selector
        .acquire("chromium", Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(lease.worker(), &worker);

    let mut session = TcpStream::connect(lease.endpoint()).await.unwrap();
    session.write_all(b"ping").await.unwrap();
    let mut buf = [0u8; 4];
    session.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"ping");
    assert_eq!(launcher.in_flight(), 1);

    let endpoint = lease.endpoint().to_string();
    let outcome = lease.release().await.unwrap();
    assert_eq!(outcome.lifetime, 1);

    // The next heartbeat picks up the shutdown command.
    wait_for_state(&mut states, LifecycleState::Drain).await;
    assert_eq!(
        selector.select("chromium").await.unwrap(),
        Selection::Unavailable
    );

    // Draining: new connections are turned away, the open one keeps going.
    let mut refused = TcpStream::connect(&endpoint).await.unwrap();
    let mut rest = Vec::new();
    assert_eq!(refused.read_to_end(&mut rest).await.unwrap_or(0), 0);
    session.write_all(b"pong").await.unwrap();
    session.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"pong");

    drop(session);
    let reason = tokio::time::timeout(Duration::from_secs(5), run)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(reason, ExitReason::Retired);
    assert_eq!(store.worker_count(), 0);
    assert_eq!(store.counters(&worker), None);
    assert!(!store.has_shutdown(&worker));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_interrupted_worker_deregisters() {
    let timing = fast_timing();
    let store = Arc::new(InMemoryCoordinationStore::new());
    let worker = WorkerKey::new("chromium", "worker-2").unwrap();
    let launcher: Arc<dyn BackendLauncher> = Arc::new(ProcessLauncher::new(LauncherConfig {
        backend_addr: echo_backend().await.to_string(),
        listen_addr: "127.0.0.1:0".parse().unwrap(),
        ..LauncherConfig::default()
    }));

    let driver = LifecycleDriver::new(
        WorkerRegistry::new(store.clone(), &timing),
        launcher,
        worker.clone(),
        &timing,
    );
    let mut states = driver.subscribe();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let run = tokio::spawn(async move { driver.run(shutdown_rx).await });

    wait_for_state(&mut states, LifecycleState::Serve).await;
    assert_eq!(store.worker_count(), 1);

    shutdown_tx.send(true).unwrap();
    let reason = tokio::time::timeout(Duration::from_secs(5), run)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(reason, ExitReason::Interrupted);
    assert_eq!(store.worker_count(), 0);
}
