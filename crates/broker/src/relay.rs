// Client connection relay
//
// One listener per capability. Every accepted connection takes a session
// lease, is piped byte-for-byte to the chosen worker, and gives the lease
// back when either side closes. Payload is never inspected, so WebSocket
// upgrades pass through unchanged.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use browserfleet_coordination::lifecycle::shutdown_signalled;
use browserfleet_coordination::{AcquireError, Selector};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};
use url::Url;

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error(transparent)]
    Acquire(AcquireError),

    #[error("worker endpoint '{0}' has no usable host and port")]
    Endpoint(String),

    #[error("connect to worker at {addr} timed out after {timeout:?}")]
    ConnectTimeout { addr: String, timeout: Duration },

    #[error("connect to worker at {addr} failed: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("relay I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

/// How one client connection ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayOutcome {
    /// Bytes were piped until one side closed
    Relayed { to_worker: u64, to_client: u64 },
    /// No worker within the wait budget; the client was closed
    Unavailable,
}

/// Connection counters reported by the admin API
#[derive(Debug, Default)]
pub struct RelayStats {
    accepted: AtomicU64,
    relayed: AtomicU64,
    unavailable: AtomicU64,
    failed: AtomicU64,
    open: AtomicU64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct RelayStatsSnapshot {
    pub accepted: u64,
    pub relayed: u64,
    pub unavailable: u64,
    pub failed: u64,
    pub open: u64,
}

impl RelayStats {
    pub fn snapshot(&self) -> RelayStatsSnapshot {
        RelayStatsSnapshot {
            accepted: self.accepted.load(Ordering::Relaxed),
            relayed: self.relayed.load(Ordering::Relaxed),
            unavailable: self.unavailable.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            open: self.open.load(Ordering::Relaxed),
        }
    }

    fn record(&self, result: &Result<RelayOutcome, RelayError>) {
        let counter = match result {
            Ok(RelayOutcome::Relayed { .. }) => &self.relayed,
            Ok(RelayOutcome::Unavailable) => &self.unavailable,
            Err(_) => &self.failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Pipes client connections to workers chosen by the selector
pub struct Relay {
    selector: Selector,
    select_wait: Duration,
    connect_timeout: Duration,
    stats: Arc<RelayStats>,
}

impl Relay {
    pub fn new(selector: Selector, select_wait: Duration, connect_timeout: Duration) -> Self {
        Self {
            selector,
            select_wait,
            connect_timeout,
            stats: Arc::new(RelayStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<RelayStats> {
        Arc::clone(&self.stats)
    }

    /// Accept connections for `capability` until shutdown
    ///
    /// Connections already being relayed keep running after shutdown.
    pub async fn serve(
        self: Arc<Self>,
        listener: TcpListener,
        capability: String,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(
            capability = %capability,
            addr = ?listener.local_addr().ok(),
            "Relay listening"
        );

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((client, peer)) => {
                            let relay = Arc::clone(&self);
                            let capability = capability.clone();
                            tokio::spawn(async move {
                                relay.handle(&capability, client, peer).await;
                            });
                        }
                        Err(e) => {
                            warn!(capability = %capability, error = %e, "Accept failed");
                        }
                    }
                }
                _ = shutdown_signalled(&mut shutdown) => break,
            }
        }

        info!(capability = %capability, "Relay stopped accepting");
    }

    async fn handle(&self, capability: &str, client: TcpStream, peer: SocketAddr) {
        self.stats.accepted.fetch_add(1, Ordering::Relaxed);
        self.stats.open.fetch_add(1, Ordering::Relaxed);

        let result = self.relay(capability, client).await;
        self.stats.record(&result);
        self.stats.open.fetch_sub(1, Ordering::Relaxed);

        match result {
            Ok(RelayOutcome::Relayed {
                to_worker,
                to_client,
            }) => {
                debug!(%peer, capability, to_worker, to_client, "Session closed");
            }
            Ok(RelayOutcome::Unavailable) => {
                warn!(%peer, capability, "No worker available, closing client connection");
            }
            Err(e) => {
                error!(%peer, capability, error = %e, "Relay failed");
            }
        }
    }

    /// Relay one client connection; the lease is released on every path
    #[instrument(skip(self, client))]
    pub async fn relay(
        &self,
        capability: &str,
        mut client: TcpStream,
    ) -> Result<RelayOutcome, RelayError> {
        let lease = match self.selector.acquire(capability, self.select_wait).await {
            Ok(lease) => lease,
            Err(AcquireError::Unavailable { .. }) => {
                client.shutdown().await.ok();
                return Ok(RelayOutcome::Unavailable);
            }
            Err(e) => return Err(RelayError::Acquire(e)),
        };

        let result = self.pipe(&mut client, lease.endpoint()).await;

        if let Err(e) = lease.release().await {
            error!(error = %e, "Failed to release session slot");
        }
        result
    }

    async fn pipe(&self, client: &mut TcpStream, endpoint: &str) -> Result<RelayOutcome, RelayError> {
        let addr = backend_addr(endpoint)?;
        let mut backend = match tokio::time::timeout(self.connect_timeout, TcpStream::connect(&addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => return Err(RelayError::Connect { addr, source }),
            Err(_) => {
                return Err(RelayError::ConnectTimeout {
                    addr,
                    timeout: self.connect_timeout,
                })
            }
        };
        backend.set_nodelay(true).ok();
        client.set_nodelay(true).ok();

        let (to_worker, to_client) = tokio::io::copy_bidirectional(client, &mut backend).await?;
        Ok(RelayOutcome::Relayed {
            to_worker,
            to_client,
        })
    }
}

/// Reduce an advertised endpoint to `host:port`
///
/// Accepts a bare `host:port` or a `ws`, `wss`, `http` or `https` URL.
pub fn backend_addr(endpoint: &str) -> Result<String, RelayError> {
    if !endpoint.contains("://") {
        return match endpoint.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => {
                Ok(endpoint.to_string())
            }
            _ => Err(RelayError::Endpoint(endpoint.to_string())),
        };
    }

    let url = Url::parse(endpoint).map_err(|_| RelayError::Endpoint(endpoint.to_string()))?;
    let host = url
        .host_str()
        .ok_or_else(|| RelayError::Endpoint(endpoint.to_string()))?;
    let port = match (url.port(), url.scheme()) {
        (Some(port), _) => port,
        (None, "ws" | "http") => 80,
        (None, "wss" | "https") => 443,
        _ => return Err(RelayError::Endpoint(endpoint.to_string())),
    };
    Ok(format!("{host}:{port}"))
}
