//! Relay server
//!
//! Listens on a client port and a tunnel port. Every accepted tunnel
//! connection waits in a FIFO pool; every accepted client connection takes
//! the oldest live tunnel and the two are spliced into a circuit with its
//! own pipe and cancellation signal.

mod pool;
mod server;
mod tracker;

pub use pool::{IdleTunnel, TunnelPool};
pub use server::{RelayConfig, RelayError, RelayServer};
pub use tracker::{CircuitIdGenerator, CircuitTracker, RelayStats, RelayStatsSnapshot};
