//! Capture status and on-demand lifecycle handlers

use axum::{extract::State, Json};

use crate::AppState;
use debugtap_common::{errors::Result, sessions::SessionStatus, LifecycleReport};

/// Whether capture is on, which sessions are live and how much is stored
pub async fn status(State(state): State<AppState>) -> Result<Json<SessionStatus>> {
    Ok(Json(state.sessions.status().await?))
}

/// Run one expiry and retention pass now
pub async fn prune(State(state): State<AppState>) -> Json<LifecycleReport> {
    Json(state.lifecycle.run_once().await)
}
