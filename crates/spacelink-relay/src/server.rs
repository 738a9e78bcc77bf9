//! Relay server implementation
//!
//! Accepts tunnel connections from the agent on one port and external
//! client connections on another, then pairs them one-to-one.

use crate::pool::{peer_alive, peer_closed, IdleTunnel, TunnelPool};
use crate::tracker::{CircuitIdGenerator, CircuitTracker, RelayStats};
use spacelink_pipe::{Pipe, DEFAULT_BUFFER_SIZE};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to bind to {address}: {reason}\n\nTroubleshooting:\n  • Check if another process is using this port: lsof -i :{port}\n  • Try using a different address or port")]
    BindError {
        address: String,
        port: u16,
        reason: String,
    },
}

/// Relay configuration
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address external clients connect to
    pub client_addr: SocketAddr,
    /// Address the agent dials its tunnel connections to
    pub tunnel_addr: SocketAddr,
    /// Idle tunnels kept waiting for clients; extra tunnels are rejected
    pub max_idle_tunnels: usize,
    /// How long a client waits for a tunnel before it is rejected
    pub client_wait: Duration,
    /// Read buffer size for circuit pipes
    pub buffer_size: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            client_addr: SocketAddr::from(([0, 0, 0, 0], 4000)),
            tunnel_addr: SocketAddr::from(([0, 0, 0, 0], 3000)),
            max_idle_tunnels: 16,
            client_wait: Duration::from_secs(10),
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }
}

/// Relay server with per-circuit pairing
pub struct RelayServer {
    config: RelayConfig,
    client_listener: TcpListener,
    tunnel_listener: TcpListener,
    pool: Arc<TunnelPool>,
    circuits: CircuitTracker,
    circuit_ids: CircuitIdGenerator,
    stats: Arc<RelayStats>,
}

impl RelayServer {
    /// Bind both listeners
    pub async fn bind(config: RelayConfig) -> Result<Self, RelayError> {
        let client_listener = bind_with_retry(config.client_addr).await?;
        let tunnel_listener = bind_with_retry(config.tunnel_addr).await?;

        Ok(Self {
            pool: Arc::new(TunnelPool::new(config.max_idle_tunnels)),
            config,
            client_listener,
            tunnel_listener,
            circuits: CircuitTracker::new(),
            circuit_ids: CircuitIdGenerator::new(),
            stats: Arc::new(RelayStats::default()),
        })
    }

    pub fn client_addr(&self) -> Result<SocketAddr, RelayError> {
        Ok(self.client_listener.local_addr()?)
    }

    pub fn tunnel_addr(&self) -> Result<SocketAddr, RelayError> {
        Ok(self.tunnel_listener.local_addr()?)
    }

    /// Shared counters, still readable after `run` consumed the server
    pub fn stats(&self) -> Arc<RelayStats> {
        self.stats.clone()
    }

    /// Serve until `shutdown` fires, then stop accepting and drain circuits
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), RelayError> {
        info!(
            "Relay listening for clients on {} and tunnels on {}",
            self.client_addr()?,
            self.tunnel_addr()?
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.tunnel_listener.accept() => match accepted {
                    Ok((stream, peer_addr)) => self.accept_tunnel(stream, peer_addr),
                    Err(e) => error!("Failed to accept tunnel connection: {}", e),
                },
                accepted = self.client_listener.accept() => match accepted {
                    Ok((stream, peer_addr)) => self.accept_client(stream, peer_addr, &shutdown),
                    Err(e) => error!("Failed to accept client connection: {}", e),
                },
            }
        }

        info!("Relay shutting down");
        drop(self.client_listener);
        drop(self.tunnel_listener);

        self.circuits.shutdown().await;
        let dropped = self.pool.drain().await;
        if dropped > 0 {
            debug!("Closed {} idle tunnel(s)", dropped);
        }

        let stats = self.stats.snapshot();
        info!(
            circuits_opened = stats.circuits_opened,
            clients_rejected = stats.clients_rejected,
            tunnels_rejected = stats.tunnels_rejected,
            "Relay stopped"
        );
        Ok(())
    }

    fn accept_tunnel(&self, stream: TcpStream, peer_addr: SocketAddr) {
        if let Err(e) = stream.set_nodelay(true) {
            debug!(tunnel = %peer_addr, "Failed to set TCP_NODELAY: {}", e);
        }

        match self.pool.offer(IdleTunnel::new(stream, peer_addr)) {
            Ok(()) => {
                self.stats.tunnel_accepted();
                info!(
                    tunnel = %peer_addr,
                    idle = self.pool.idle(),
                    "Tunnel connected"
                );
            }
            Err(rejected) => {
                self.stats.tunnel_rejected();
                warn!(
                    tunnel = %rejected.peer_addr,
                    limit = self.config.max_idle_tunnels,
                    "Idle tunnel limit reached, rejecting tunnel"
                );
            }
        }
    }

    fn accept_client(&self, stream: TcpStream, peer_addr: SocketAddr, shutdown: &CancellationToken) {
        if let Err(e) = stream.set_nodelay(true) {
            debug!(client = %peer_addr, "Failed to set TCP_NODELAY: {}", e);
        }

        let circuit_id = self.circuit_ids.generate();
        let cancel = shutdown.child_token();
        debug!(circuit_id, client = %peer_addr, "Client connected, waiting for tunnel");

        let circuit = Self::handle_client(
            circuit_id,
            stream,
            peer_addr,
            self.pool.clone(),
            self.stats.clone(),
            self.config.clone(),
            cancel.clone(),
        );
        self.circuits.spawn(circuit_id, cancel, circuit);
    }

    async fn handle_client(
        circuit_id: u64,
        client: TcpStream,
        client_addr: SocketAddr,
        pool: Arc<TunnelPool>,
        stats: Arc<RelayStats>,
        config: RelayConfig,
        cancel: CancellationToken,
    ) {
        let tunnel = tokio::select! {
            _ = cancel.cancelled() => None,
            _ = peer_closed(&client) => {
                debug!(circuit_id, client = %client_addr, "Client left while waiting for a tunnel");
                return;
            }
            tunnel = pool.take(config.client_wait) => tunnel,
        };

        // The client can still leave between the take and this point
        let tunnel = match tunnel {
            Some(tunnel) if !peer_alive(&client) => {
                debug!(
                    circuit_id,
                    client = %client_addr,
                    tunnel = %tunnel.peer_addr,
                    "Client left during pairing, returning tunnel to the pool"
                );
                if let Err(rejected) = pool.offer(tunnel) {
                    debug!(tunnel = %rejected.peer_addr, "Pool full, closing returned tunnel");
                }
                return;
            }
            tunnel => tunnel,
        };

        let Some(tunnel) = tunnel else {
            if !cancel.is_cancelled() {
                stats.client_rejected();
                warn!(
                    circuit_id,
                    client = %client_addr,
                    "No tunnel available within {:?}, rejecting client",
                    config.client_wait
                );
            }
            return;
        };

        stats.circuit_opened();
        info!(
            circuit_id,
            client = %client_addr,
            tunnel = %tunnel.peer_addr,
            "Circuit established"
        );

        let report = Pipe::new(client, tunnel.stream)
            .with_buffer_size(config.buffer_size)
            .run(cancel)
            .await;

        stats.circuit_closed();
        info!(
            circuit_id,
            client = %client_addr,
            reason = %report.closed,
            bytes_to_service = report.bytes_a_to_b,
            bytes_to_client = report.bytes_b_to_a,
            "Circuit closed"
        );
    }
}

/// Bind, retrying `AddrInUse` to ride out TIME_WAIT (3 attempts, 1 second apart)
async fn bind_with_retry(addr: SocketAddr) -> Result<TcpListener, RelayError> {
    for attempt in 1..=3 {
        match TcpListener::bind(addr).await {
            Ok(listener) => {
                if attempt > 1 {
                    info!("Successfully bound to {} on attempt {}/3", addr, attempt);
                }
                return Ok(listener);
            }
            Err(e) if e.kind() == std::io::ErrorKind::AddrInUse && attempt < 3 => {
                warn!(
                    "Port {} is in use (attempt {}/3, may be in TIME_WAIT state), retrying in 1 second...",
                    addr.port(),
                    attempt
                );
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
            Err(e) => {
                return Err(RelayError::BindError {
                    address: addr.ip().to_string(),
                    port: addr.port(),
                    reason: e.to_string(),
                });
            }
        }
    }

    Err(RelayError::BindError {
        address: addr.ip().to_string(),
        port: addr.port(),
        reason: "Address in use after 3 retry attempts".to_string(),
    })
}
