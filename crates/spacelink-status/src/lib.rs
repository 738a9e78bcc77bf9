//! Presence endpoint and heartbeat client
//!
//! The status server answers `GET /` with a SpaceAPI-style presence document
//! whose `state.open` flag is derived from the last heartbeat, and records a
//! heartbeat on `POST /`. The agent pings it with [`HeartbeatClient`].

pub mod client;
pub mod error;
pub mod handlers;
pub mod models;
pub mod server;

pub use client::HeartbeatClient;
pub use error::StatusError;
pub use models::{HeartbeatResponse, PresenceDocument, SpaceInfo};
pub use server::{Presence, StatusServer, StatusServerConfig};
