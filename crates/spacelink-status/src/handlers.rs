use crate::models::{HeartbeatQuery, HeartbeatResponse, PresenceDocument, SpaceState};
use crate::server::AppState;
use axum::{
    extract::{rejection::QueryRejection, Query, State},
    Json,
};
use chrono::{SecondsFormat, Utc};
use std::sync::Arc;
use tracing::{debug, warn};

/// Presence document with `state.open` derived from the last heartbeat
pub async fn get_status(State(state): State<Arc<AppState>>) -> Json<PresenceDocument> {
    let open = state.presence.is_open_at(Utc::now());

    Json(PresenceDocument {
        info: state.info.clone(),
        state: SpaceState { open },
    })
}

/// Record a heartbeat; `?open=false` marks the space closed right away
pub async fn record_heartbeat(
    State(state): State<Arc<AppState>>,
    query: Result<Query<HeartbeatQuery>, QueryRejection>,
) -> Json<HeartbeatResponse> {
    let now = Utc::now();
    let open = match query {
        Ok(Query(query)) => query.open.unwrap_or(true),
        Err(e) => {
            warn!("Ignoring malformed heartbeat query: {}", e);
            true
        }
    };

    if open {
        state.presence.record(now);
        debug!("Heartbeat recorded");
    } else {
        state.presence.clear();
        debug!("Space marked closed");
    }

    Json(HeartbeatResponse {
        error: None,
        response: "OK".to_string(),
        updated_at: now.to_rfc3339_opts(SecondsFormat::Secs, true),
    })
}
