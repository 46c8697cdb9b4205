// Process backend launcher
//
// Starts the backend as a child process (`sh -c`), waits until it accepts
// TCP connections, and fronts it with an admission proxy. Every proxied
// connection holds an AdmissionPermit, so the lifecycle driver can see how
// many sessions are still open while it drains.

use std::net::SocketAddr;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use browserfleet_coordination::lifecycle::shutdown_signalled;
use browserfleet_coordination::{AdmissionGate, BackendLauncher, LaunchError};
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::LauncherConfig;

const READY_POLL_INTERVAL: Duration = Duration::from_millis(100);

struct Proxy {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Runs the backend process and its admission proxy
pub struct ProcessLauncher {
    config: LauncherConfig,
    gate: Arc<AdmissionGate>,
    child: Mutex<Option<Child>>,
    proxy: Mutex<Option<Proxy>>,
}

impl ProcessLauncher {
    pub fn new(config: LauncherConfig) -> Self {
        Self {
            config,
            gate: AdmissionGate::new(),
            child: Mutex::new(None),
            proxy: Mutex::new(None),
        }
    }

    pub fn gate(&self) -> &Arc<AdmissionGate> {
        &self.gate
    }

    fn spawn_backend(&self, command: &str) -> Result<(), LaunchError> {
        let child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;
        info!(pid = ?child.id(), command, "Backend process started");
        *self.child.lock() = Some(child);
        Ok(())
    }

    /// Fails fast if the child already exited
    fn check_child(&self) -> Result<(), LaunchError> {
        let mut child = self.child.lock();
        if let Some(process) = child.as_mut() {
            if let Some(status) = process.try_wait()? {
                child.take();
                return Err(LaunchError::Exited(status.to_string()));
            }
        }
        Ok(())
    }

    async fn wait_ready(&self) -> Result<(), LaunchError> {
        let started = Instant::now();
        let deadline = started + self.config.ready_timeout;

        loop {
            self.check_child()?;
            if TcpStream::connect(&self.config.backend_addr).await.is_ok() {
                debug!(
                    addr = %self.config.backend_addr,
                    waited = ?started.elapsed(),
                    "Backend is accepting connections"
                );
                return Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(LaunchError::NotReady {
                    addr: self.config.backend_addr.clone(),
                    waited: now - started,
                });
            }
            tokio::time::sleep(READY_POLL_INTERVAL.min(deadline - now)).await;
        }
    }

    fn advertised_endpoint(&self, bound: SocketAddr) -> Result<String, LaunchError> {
        match &self.config.advertise_endpoint {
            Some(endpoint) => Ok(endpoint.clone()),
            None if bound.ip().is_unspecified() => Err(LaunchError::Config(format!(
                "listening on {bound}; set an advertised endpoint brokers can reach"
            ))),
            None => Ok(bound.to_string()),
        }
    }

    async fn kill_backend(&self) -> Result<(), LaunchError> {
        let child = self.child.lock().take();
        if let Some(mut child) = child {
            if child.try_wait()?.is_none() {
                child.kill().await?;
                info!("Backend process stopped");
            }
        }
        Ok(())
    }
}

#[async_trait]
impl BackendLauncher for ProcessLauncher {
    async fn start(&self) -> Result<String, LaunchError> {
        if let Some(command) = &self.config.command {
            self.spawn_backend(command)?;
        }

        if let Err(e) = self.wait_ready().await {
            self.kill_backend().await.ok();
            return Err(e);
        }

        let listener = match TcpListener::bind(self.config.listen_addr).await {
            Ok(listener) => listener,
            Err(e) => {
                self.kill_backend().await.ok();
                return Err(e.into());
            }
        };
        let bound = listener.local_addr()?;
        let endpoint = match self.advertised_endpoint(bound) {
            Ok(endpoint) => endpoint,
            Err(e) => {
                self.kill_backend().await.ok();
                return Err(e);
            }
        };

        let (shutdown, rx) = watch::channel(false);
        let handle = tokio::spawn(run_proxy(
            listener,
            self.config.backend_addr.clone(),
            Arc::clone(&self.gate),
            rx,
        ));
        *self.proxy.lock() = Some(Proxy { shutdown, handle });

        info!(listen = %bound, endpoint = %endpoint, "Admission proxy started");
        Ok(endpoint)
    }

    async fn stop(&self) -> Result<(), LaunchError> {
        let proxy = self.proxy.lock().take();
        if let Some(proxy) = proxy {
            proxy.shutdown.send(true).ok();
            proxy.handle.await.ok();
        }
        self.kill_backend().await
    }

    fn in_flight(&self) -> usize {
        self.gate.in_flight()
    }

    fn close_admission(&self) {
        self.gate.close();
    }
}

async fn run_proxy(
    listener: TcpListener,
    backend_addr: String,
    gate: Arc<AdmissionGate>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (mut client, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!(error = %e, "Proxy accept failed");
                        continue;
                    }
                };
                let Some(permit) = gate.try_admit() else {
                    debug!(%peer, "Draining, session refused");
                    continue;
                };
                let backend_addr = backend_addr.clone();
                tokio::spawn(async move {
                    let _permit = permit;
                    match TcpStream::connect(&backend_addr).await {
                        Ok(mut backend) => {
                            if let Err(e) = tokio::io::copy_bidirectional(&mut client, &mut backend).await {
                                debug!(%peer, error = %e, "Session ended with an error");
                            }
                        }
                        Err(e) => warn!(%peer, error = %e, "Backend connect failed"),
                    }
                });
            }
            _ = shutdown_signalled(&mut shutdown) => break,
        }
    }
    debug!("Admission proxy stopped");
}
