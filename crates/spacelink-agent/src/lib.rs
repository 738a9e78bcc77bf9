//! Tunnel agent
//!
//! Runs next to the protected service. Dials the relay's tunnel port and
//! the local service, splices the two connections, and redials whenever the
//! circuit breaks. An optional heartbeat keeps the presence endpoint fresh.

pub mod agent;
pub mod heartbeat;

pub use agent::{
    validate_address, Agent, AgentConfig, AgentError, CircuitState, DialTarget, ExhaustionPolicy,
    HeartbeatConfig,
};
pub use heartbeat::run_heartbeat;
