//! Debug session management handlers

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::AppState;
use debugtap_common::{
    errors::Result,
    sessions::SessionSummary,
    AuthenticatedUser, Selector,
};

/// Stopped or expired sessions shown next to the active ones
const RECENT_SESSIONS_LIMIT: u64 = 10;

/// Start (or refresh) a debug session.
///
/// Omitting both `tenant_id` and `user_id` targets all traffic.
#[derive(Debug, Deserialize, Validate)]
pub struct CreateSessionRequest {
    #[validate(length(min = 1, max = 255))]
    pub tenant_id: Option<String>,

    #[validate(range(min = 1))]
    pub user_id: Option<i64>,

    /// Defaults to the configured duration, capped at the maximum
    #[validate(range(min = 1))]
    pub minutes: Option<i64>,

    #[validate(length(max = 255))]
    pub label: Option<String>,

    /// Operator who asked for the session
    pub created_by: Option<i64>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct ExtendSessionRequest {
    #[validate(range(min = 1))]
    pub minutes: i64,
}

/// Bulk stop: by tenant, by user, or everything when both are absent
#[derive(Debug, Default, Deserialize, Validate)]
pub struct DisableSessionsRequest {
    #[validate(length(min = 1, max = 255))]
    pub tenant_id: Option<String>,

    #[validate(range(min = 1))]
    pub user_id: Option<i64>,
}

#[derive(Serialize)]
pub struct SessionListResponse {
    pub active: Vec<SessionSummary>,
    pub recent: Vec<SessionSummary>,
}

#[derive(Serialize)]
pub struct DeletedResponse {
    pub deleted_records: u64,
}

#[derive(Serialize)]
pub struct DisabledResponse {
    pub stopped_sessions: u64,
}

/// Active sessions plus the most recent inactive ones
pub async fn list_sessions(State(state): State<AppState>) -> Result<Json<SessionListResponse>> {
    let mut active = Vec::new();
    for session in state.sessions.list_active().await? {
        active.push(state.sessions.summarize(session).await?);
    }

    let mut recent = Vec::new();
    for session in state
        .sessions
        .list_recent_inactive(RECENT_SESSIONS_LIMIT)
        .await?
    {
        recent.push(state.sessions.summarize(session).await?);
    }

    Ok(Json(SessionListResponse { active, recent }))
}

pub async fn create_session(
    State(state): State<AppState>,
    operator: Option<axum::Extension<AuthenticatedUser>>,
    Json(request): Json<CreateSessionRequest>,
) -> Result<(StatusCode, Json<SessionSummary>)> {
    request.validate()?;

    let selector = Selector::new(request.tenant_id, request.user_id)?;
    let created_by = request
        .created_by
        .or(operator.map(|axum::Extension(user)| user.0));

    let session = state
        .sessions
        .enable(&selector, request.minutes, created_by, request.label)
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(state.sessions.summarize(session).await?),
    ))
}

pub async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<SessionSummary>> {
    let session = state.sessions.find(id).await?;
    Ok(Json(state.sessions.summarize(session).await?))
}

/// Delete a session together with its records
pub async fn delete_session(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<DeletedResponse>> {
    let deleted_records = state.sessions.delete(id).await?;
    Ok(Json(DeletedResponse { deleted_records }))
}

pub async fn extend_session(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(request): Json<ExtendSessionRequest>,
) -> Result<Json<SessionSummary>> {
    request.validate()?;

    let session = state.sessions.extend(id, Some(request.minutes)).await?;
    Ok(Json(state.sessions.summarize(session).await?))
}

pub async fn stop_session(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<SessionSummary>> {
    let session = state.sessions.stop(id).await?;
    Ok(Json(state.sessions.summarize(session).await?))
}

pub async fn disable_sessions(
    State(state): State<AppState>,
    Json(request): Json<DisableSessionsRequest>,
) -> Result<Json<DisabledResponse>> {
    request.validate()?;

    let stopped_sessions = match (request.tenant_id.as_deref(), request.user_id) {
        (Some(tenant), _) => state.sessions.disable_for_tenant(tenant).await?,
        (None, Some(user)) => state.sessions.disable_for_user(user).await?,
        (None, None) => state.sessions.disable_all().await?,
    };

    Ok(Json(DisabledResponse { stopped_sessions }))
}
