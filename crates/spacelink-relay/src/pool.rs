//! Idle tunnel pool
//!
//! Tunnel connections from the agent wait here until a client takes them.
//! The pool is a bounded FIFO channel; waiting clients queue on the
//! receiver lock, so both tunnels and clients are served in arrival order.

use futures::FutureExt;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::time::{timeout_at, Instant};
use tracing::debug;

/// A tunnel connection waiting for a client
#[derive(Debug)]
pub struct IdleTunnel {
    pub stream: TcpStream,
    pub peer_addr: SocketAddr,
    pub accepted_at: Instant,
}

impl IdleTunnel {
    pub fn new(stream: TcpStream, peer_addr: SocketAddr) -> Self {
        Self {
            stream,
            peer_addr,
            accepted_at: Instant::now(),
        }
    }

    /// Whether the agent still holds its end of the tunnel
    ///
    /// Never blocks: a pending peek means the peer is connected but quiet,
    /// a zero-length peek means it already closed. Bytes the service sent
    /// before pairing stay queued in the socket.
    pub fn is_alive(&self) -> bool {
        peer_alive(&self.stream)
    }
}

/// Non-blocking check that the peer has not closed `stream`
pub(crate) fn peer_alive(stream: &TcpStream) -> bool {
    let mut buf = [0u8; 1];
    match stream.peek(&mut buf).now_or_never() {
        None => true,
        Some(Ok(0)) => false,
        Some(Ok(_)) => true,
        Some(Err(_)) => false,
    }
}

/// Resolves once the peer closes `stream`
///
/// A peer that already sent data cannot be watched without consuming it,
/// so in that case this never resolves.
pub(crate) async fn peer_closed(stream: &TcpStream) {
    let mut buf = [0u8; 1];
    match stream.peek(&mut buf).await {
        Ok(0) | Err(_) => {}
        Ok(_) => std::future::pending().await,
    }
}

/// Bounded FIFO of idle tunnels
pub struct TunnelPool {
    tx: mpsc::Sender<IdleTunnel>,
    rx: Mutex<mpsc::Receiver<IdleTunnel>>,
}

impl TunnelPool {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            tx,
            rx: Mutex::new(rx),
        }
    }

    /// Queue a tunnel, handing it back when the pool is full
    pub fn offer(&self, tunnel: IdleTunnel) -> Result<(), IdleTunnel> {
        self.tx.try_send(tunnel).map_err(|e| match e {
            mpsc::error::TrySendError::Full(tunnel) => tunnel,
            mpsc::error::TrySendError::Closed(tunnel) => tunnel,
        })
    }

    /// Take the oldest live tunnel, waiting at most `wait`
    ///
    /// Tunnels whose agent side already closed are dropped and skipped.
    pub async fn take(&self, wait: Duration) -> Option<IdleTunnel> {
        let deadline = Instant::now() + wait;
        let mut rx = timeout_at(deadline, self.rx.lock()).await.ok()?;

        loop {
            let tunnel = timeout_at(deadline, rx.recv()).await.ok()??;
            if tunnel.is_alive() {
                return Some(tunnel);
            }
            debug!(
                tunnel = %tunnel.peer_addr,
                idle_ms = tunnel.accepted_at.elapsed().as_millis() as u64,
                "Discarding idle tunnel closed by agent"
            );
        }
    }

    /// Number of tunnels currently queued
    pub fn idle(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    /// Close every queued tunnel, returning how many were dropped
    pub async fn drain(&self) -> usize {
        let mut rx = self.rx.lock().await;
        let mut dropped = 0;
        while rx.try_recv().is_ok() {
            dropped += 1;
        }
        dropped
    }
}
