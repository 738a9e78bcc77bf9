//! Status HTTP server

use crate::error::StatusError;
use crate::handlers;
use crate::models::SpaceInfo;
use axum::{routing::get, Router};
use chrono::{DateTime, Utc};
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Heartbeat freshness tracking
pub struct Presence {
    last_heartbeat: RwLock<Option<DateTime<Utc>>>,
    freshness: Duration,
}

impl Presence {
    pub fn new(freshness: Duration) -> Self {
        Self {
            last_heartbeat: RwLock::new(None),
            freshness,
        }
    }

    pub fn record(&self, at: DateTime<Utc>) {
        if let Ok(mut last) = self.last_heartbeat.write() {
            *last = Some(at);
        }
    }

    pub fn clear(&self) {
        if let Ok(mut last) = self.last_heartbeat.write() {
            *last = None;
        }
    }

    pub fn last_heartbeat(&self) -> Option<DateTime<Utc>> {
        self.last_heartbeat.read().ok().and_then(|last| *last)
    }

    /// Open when the last heartbeat is younger than the freshness window
    pub fn is_open_at(&self, now: DateTime<Utc>) -> bool {
        let Some(last) = self.last_heartbeat() else {
            return false;
        };
        match (now - last).to_std() {
            Ok(age) => age < self.freshness,
            // Heartbeat stamped in the future (clock skew): treat as fresh
            Err(_) => true,
        }
    }
}

/// Application state shared across handlers
pub struct AppState {
    pub info: SpaceInfo,
    pub presence: Presence,
}

/// Status server configuration
#[derive(Debug, Clone)]
pub struct StatusServerConfig {
    pub bind_addr: SocketAddr,
    /// How long a heartbeat keeps the space open
    pub freshness: Duration,
    pub info: SpaceInfo,
}

impl Default for StatusServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 2000)),
            freshness: Duration::from_secs(70),
            info: SpaceInfo::default(),
        }
    }
}

/// Status server
pub struct StatusServer {
    listener: TcpListener,
    state: Arc<AppState>,
}

impl StatusServer {
    pub async fn bind(config: StatusServerConfig) -> Result<Self, StatusError> {
        let listener = TcpListener::bind(config.bind_addr).await?;
        let state = Arc::new(AppState {
            info: config.info,
            presence: Presence::new(config.freshness),
        });
        Ok(Self { listener, state })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, StatusError> {
        Ok(self.listener.local_addr()?)
    }

    pub fn state(&self) -> Arc<AppState> {
        self.state.clone()
    }

    /// Serve until `shutdown` fires
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), StatusError> {
        info!("Status server listening on {}", self.local_addr()?);

        axum::serve(self.listener, build_router(self.state))
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;

        info!("Status server stopped");
        Ok(())
    }
}

/// Build the router: `GET /` presence document, `POST /` heartbeat
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route(
            "/",
            get(handlers::get_status).post(handlers::record_heartbeat),
        )
        .with_state(state)
}
