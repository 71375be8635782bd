//! Captured record handlers

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::AppState;
use debugtap_common::{
    db::{
        filters,
        models::{CapturedRecord, StatusClass},
    },
    errors::{AppError, Result},
};

const DEFAULT_PER_PAGE: u64 = 25;
const MAX_PER_PAGE: u64 = 100;

/// Pagination, pages counted from 1
#[derive(Debug, Default, Deserialize)]
pub struct PageQuery {
    pub page: Option<u64>,
    pub per_page: Option<u64>,
}

impl PageQuery {
    fn page(&self) -> u64 {
        self.page.unwrap_or(1).max(1)
    }

    fn per_page(&self) -> u64 {
        self.per_page.unwrap_or(DEFAULT_PER_PAGE).clamp(1, MAX_PER_PAGE)
    }
}

/// One row in a session's record list
#[derive(Serialize)]
pub struct RecordSummary {
    pub id: i64,
    pub request_id: String,
    pub method: String,
    pub url: String,
    pub route_name: Option<String>,
    pub status_code: i32,
    pub status_class: StatusClass,
    pub duration: String,
    pub has_exception: bool,
    pub requested_at: DateTime<Utc>,
}

impl From<CapturedRecord> for RecordSummary {
    fn from(record: CapturedRecord) -> Self {
        Self {
            status_class: record.status_class(),
            duration: record.formatted_duration(),
            has_exception: record.has_exception(),
            id: record.id,
            request_id: record.request_id,
            method: record.method,
            url: record.url,
            route_name: record.route_name,
            status_code: record.status_code,
            requested_at: record.requested_at,
        }
    }
}

#[derive(Serialize)]
pub struct RecordPage {
    pub session_id: i64,
    pub page: u64,
    pub per_page: u64,
    pub total: u64,
    pub records: Vec<RecordSummary>,
}

/// Full record as shown to an operator
#[derive(Serialize)]
pub struct RecordDetail {
    pub id: i64,
    pub session_id: i64,
    pub request_id: String,
    pub method: String,
    pub url: String,
    pub full_url: String,
    pub route_name: Option<String>,
    pub route_action: Option<String>,
    pub status_code: i32,
    pub status_class: StatusClass,
    pub duration: String,
    pub request_size: String,
    pub response_size: String,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub tenant_id: Option<String>,
    pub user_id: Option<i64>,
    pub request_headers: BTreeMap<String, String>,
    pub request_query: BTreeMap<String, String>,
    pub request_body: Option<serde_json::Value>,
    pub request_content_type: Option<String>,
    pub response_headers: BTreeMap<String, String>,
    pub response_body: Option<serde_json::Value>,
    pub response_content_type: Option<String>,
    pub has_exception: bool,
    pub exception_class: Option<String>,
    pub exception_message: Option<String>,
    pub exception_trace: Option<String>,
    pub memory_peak_mb: Option<f64>,
    pub requested_at: DateTime<Utc>,
    pub responded_at: Option<DateTime<Utc>>,
}

#[derive(Serialize)]
pub struct ClearedResponse {
    pub deleted_records: u64,
}

/// JSON bodies are shown parsed; anything else (including truncated JSON) as text
fn display_body(body: Option<&str>, is_json: bool) -> Option<serde_json::Value> {
    let body = body?;
    if is_json {
        if let Ok(parsed) = serde_json::from_str(body) {
            return Some(parsed);
        }
    }
    Some(serde_json::Value::String(body.to_string()))
}

impl RecordDetail {
    fn new(record: CapturedRecord, redact_headers: &[String], replacement: &str) -> Self {
        Self {
            status_class: record.status_class(),
            duration: record.formatted_duration(),
            request_size: record.formatted_request_size(),
            response_size: record.formatted_response_size(),
            request_headers: record.request_headers_for_display(redact_headers, replacement),
            response_headers: record.response_headers_for_display(redact_headers, replacement),
            request_query: record.query_map(),
            request_body: display_body(record.request_body.as_deref(), record.is_json_request()),
            response_body: display_body(
                record.response_body.as_deref(),
                record.is_json_response(),
            ),
            has_exception: record.has_exception(),
            id: record.id,
            session_id: record.session_id,
            request_id: record.request_id,
            method: record.method,
            url: record.url,
            full_url: record.full_url,
            route_name: record.route_name,
            route_action: record.route_action,
            status_code: record.status_code,
            ip_address: record.ip_address,
            user_agent: record.user_agent,
            tenant_id: record.tenant_id,
            user_id: record.user_id,
            request_content_type: record.request_content_type,
            response_content_type: record.response_content_type,
            exception_class: record.exception_class,
            exception_message: record.exception_message,
            exception_trace: record.exception_trace,
            memory_peak_mb: record.memory_peak_mb,
            requested_at: record.requested_at,
            responded_at: record.responded_at,
        }
    }
}

/// A session's records, newest first
pub async fn list_records(
    State(state): State<AppState>,
    Path(session_id): Path<i64>,
    Query(query): Query<PageQuery>,
) -> Result<Json<RecordPage>> {
    // 404 for unknown sessions rather than an empty page
    state.sessions.find(session_id).await?;

    let page = query.page();
    let per_page = query.per_page();
    let (records, total) = state
        .repository()
        .list_records(session_id, page - 1, per_page)
        .await?;

    Ok(Json(RecordPage {
        session_id,
        page,
        per_page,
        total,
        records: records.into_iter().map(RecordSummary::from).collect(),
    }))
}

/// Delete every record of a session, keeping the session
pub async fn clear_records(
    State(state): State<AppState>,
    Path(session_id): Path<i64>,
) -> Result<Json<ClearedResponse>> {
    state.sessions.find(session_id).await?;

    let deleted_records = state
        .repository()
        .delete_records_batched(
            filters::record_in_session(session_id),
            state.config.debugger.retention.batch_size,
        )
        .await?;

    tracing::info!(session_id, deleted_records, "Session records cleared");
    Ok(Json(ClearedResponse { deleted_records }))
}

pub async fn get_record(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<RecordDetail>> {
    let record = state
        .repository()
        .find_record(id)
        .await?
        .ok_or_else(|| AppError::RecordNotFound { id: id.to_string() })?;

    let redact = &state.config.debugger.redact;
    Ok(Json(RecordDetail::new(
        record,
        &redact.headers,
        &redact.replacement,
    )))
}

pub async fn delete_record(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<StatusCode> {
    if state.repository().delete_record(id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(AppError::RecordNotFound { id: id.to_string() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_query_bounds() {
        let query = PageQuery {
            page: Some(0),
            per_page: Some(10_000),
        };
        assert_eq!(query.page(), 1);
        assert_eq!(query.per_page(), MAX_PER_PAGE);

        let defaults = PageQuery::default();
        assert_eq!(defaults.page(), 1);
        assert_eq!(defaults.per_page(), DEFAULT_PER_PAGE);
    }

    #[test]
    fn test_display_body() {
        assert_eq!(
            display_body(Some(r#"{"a":1}"#), true),
            Some(serde_json::json!({ "a": 1 }))
        );
        assert_eq!(
            display_body(Some(r#"{"a":1"#), true),
            Some(serde_json::Value::String(r#"{"a":1"#.to_string()))
        );
        assert_eq!(
            display_body(Some(r#"{"a":1}"#), false),
            Some(serde_json::Value::String(r#"{"a":1}"#.to_string()))
        );
        assert_eq!(display_body(None, true), None);
    }
}
