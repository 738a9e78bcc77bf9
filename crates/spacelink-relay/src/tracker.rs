//! Circuit bookkeeping
//!
//! Tracks the task and cancellation token of every live circuit so the
//! relay can tear them all down on shutdown.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Sequential circuit IDs for logging
#[derive(Clone)]
pub struct CircuitIdGenerator {
    next_id: Arc<AtomicU64>,
}

impl CircuitIdGenerator {
    pub fn new() -> Self {
        Self {
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn generate(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }
}

impl Default for CircuitIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

struct TrackedCircuit {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Tracks running circuit tasks by circuit ID
#[derive(Clone, Default)]
pub struct CircuitTracker {
    circuits: Arc<Mutex<HashMap<u64, TrackedCircuit>>>,
}

impl CircuitTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn a circuit task and register it under `id`
    ///
    /// The entry is removed when the task finishes.
    pub fn spawn<F>(&self, id: u64, cancel: CancellationToken, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let circuits = self.circuits.clone();
        let Ok(mut guard) = self.circuits.lock() else {
            return;
        };

        // Holding the lock across spawn keeps the task's own removal from
        // running before the insert.
        let handle = tokio::spawn(async move {
            future.await;
            if let Ok(mut circuits) = circuits.lock() {
                circuits.remove(&id);
            }
        });

        guard.insert(id, TrackedCircuit { cancel, handle });
    }

    /// Number of circuits currently tracked
    pub fn len(&self) -> usize {
        self.circuits.lock().map(|c| c.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cancel every circuit and wait for their tasks to finish
    pub async fn shutdown(&self) {
        let circuits: Vec<TrackedCircuit> = match self.circuits.lock() {
            Ok(mut circuits) => circuits.drain().map(|(_, c)| c).collect(),
            Err(_) => return,
        };

        for circuit in &circuits {
            circuit.cancel.cancel();
        }

        for circuit in circuits {
            let _ = circuit.handle.await;
        }
    }
}

/// Relay counters
#[derive(Default)]
pub struct RelayStats {
    active_circuits: AtomicU64,
    circuits_opened: AtomicU64,
    clients_rejected: AtomicU64,
    tunnels_accepted: AtomicU64,
    tunnels_rejected: AtomicU64,
}

/// Point-in-time copy of [`RelayStats`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RelayStatsSnapshot {
    pub active_circuits: u64,
    pub circuits_opened: u64,
    pub clients_rejected: u64,
    pub tunnels_accepted: u64,
    pub tunnels_rejected: u64,
}

impl RelayStats {
    pub fn circuit_opened(&self) {
        self.circuits_opened.fetch_add(1, Ordering::Relaxed);
        self.active_circuits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn circuit_closed(&self) {
        self.active_circuits.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn client_rejected(&self) {
        self.clients_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn tunnel_accepted(&self) {
        self.tunnels_accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn tunnel_rejected(&self) {
        self.tunnels_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> RelayStatsSnapshot {
        RelayStatsSnapshot {
            active_circuits: self.active_circuits.load(Ordering::Relaxed),
            circuits_opened: self.circuits_opened.load(Ordering::Relaxed),
            clients_rejected: self.clients_rejected.load(Ordering::Relaxed),
            tunnels_accepted: self.tunnels_accepted.load(Ordering::Relaxed),
            tunnels_rejected: self.tunnels_rejected.load(Ordering::Relaxed),
        }
    }
}
