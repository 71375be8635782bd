//! Snapshots of the request, response and failure of a captured exchange
//!
//! Everything here works on kept body bytes and `http` parts; nothing touches
//! the live request or response.

use crate::db::models::CapturedRecordActiveModel;
use crate::errors::{HandlerFailure, Result};
use crate::redact::{HeaderMap, Redactor};
use crate::resolver::RequestContext;
use axum::extract::{ConnectInfo, MatchedPath, Query};
use axum::body::Bytes;
use axum::http::{header, request, HeaderMap as HttpHeaderMap, StatusCode};
use chrono::{DateTime, Utc};
use sea_orm::{NotSet, Set};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::Instant;
use uuid::Uuid;

/// Request facet of a captured record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestSnapshot {
    pub request_id: String,
    pub method: String,
    /// Path without the leading slash
    pub url: String,
    pub full_url: String,
    pub route_name: Option<String>,
    pub route_action: Option<String>,
    pub request_headers: HeaderMap,
    pub request_query: BTreeMap<String, String>,
    pub request_body: Option<String>,
    pub request_content_type: Option<String>,
    pub request_size: i64,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub tenant_id: Option<String>,
    pub user_id: Option<i64>,
    pub requested_at: DateTime<Utc>,
}

/// Response facet of a captured record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseSnapshot {
    pub status_code: u16,
    pub response_headers: HeaderMap,
    pub response_body: Option<String>,
    pub response_content_type: Option<String>,
    pub response_size: i64,
    pub duration_ms: f64,
    pub memory_peak_mb: Option<f64>,
    pub responded_at: Option<DateTime<Utc>>,
}

/// Exception facet of a captured record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExceptionSnapshot {
    pub exception_class: String,
    pub exception_message: String,
    pub exception_trace: Option<String>,
}

/// When the exchange reached the recorder
#[derive(Debug, Clone, Copy)]
pub struct CaptureTiming {
    started: Instant,
    started_at: DateTime<Utc>,
}

impl CaptureTiming {
    pub fn start() -> Self {
        Self {
            started: Instant::now(),
            started_at: Utc::now(),
        }
    }

    pub fn elapsed_ms(&self) -> f64 {
        self.started.elapsed().as_secs_f64() * 1000.0
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }
}

/// Leading bytes of a body together with its full size
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapturedBody {
    pub kept: Bytes,
    pub size: usize,
}

impl CapturedBody {
    /// A body held in full
    pub fn full(bytes: Bytes) -> Self {
        Self {
            size: bytes.len(),
            kept: bytes,
        }
    }
}

/// Snapshot a request from its parts and kept body
pub fn capture_request(
    parts: &request::Parts,
    body: &CapturedBody,
    ctx: &RequestContext,
    redactor: &Redactor,
    timing: &CaptureTiming,
) -> RequestSnapshot {
    let content_type = header_value(&parts.headers, header::CONTENT_TYPE);
    let route_name = parts
        .extensions
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string());
    let route_action = route_name
        .as_ref()
        .map(|route| format!("{} {}", parts.method, route));

    RequestSnapshot {
        request_id: Uuid::new_v4().to_string(),
        method: parts.method.to_string(),
        url: relative_path(parts.uri.path()),
        full_url: full_url(parts),
        route_name,
        route_action,
        request_headers: redactor.redact_headers(&header_map(&parts.headers)),
        request_query: query_map(&parts.uri),
        request_body: redactor.prepare_prefix(&body.kept, body.size, content_type.as_deref()),
        request_content_type: content_type,
        request_size: body.size as i64,
        ip_address: client_ip(parts),
        user_agent: header_value(&parts.headers, header::USER_AGENT),
        tenant_id: ctx.tenant_id.clone(),
        user_id: ctx.user_id,
        requested_at: timing.started_at(),
    }
}

/// Snapshot a response once its body is done; duration runs to this call
pub fn capture_response(
    status: StatusCode,
    headers: &HttpHeaderMap,
    body: &CapturedBody,
    timing: &CaptureTiming,
    redactor: &Redactor,
) -> ResponseSnapshot {
    let content_type = header_value(headers, header::CONTENT_TYPE);

    ResponseSnapshot {
        status_code: status.as_u16(),
        response_headers: redactor.redact_headers(&header_map(headers)),
        response_body: redactor.prepare_prefix(&body.kept, body.size, content_type.as_deref()),
        response_content_type: content_type,
        response_size: body.size as i64,
        duration_ms: timing.elapsed_ms(),
        memory_peak_mb: peak_memory_mb(),
        responded_at: Some(Utc::now()),
    }
}

pub fn capture_failure(failure: &HandlerFailure) -> ExceptionSnapshot {
    ExceptionSnapshot {
        exception_class: failure.kind.clone(),
        exception_message: failure.message.clone(),
        exception_trace: failure.trace.clone(),
    }
}

/// Stand-in when the handler never produced a response
pub fn synthetic_failure_response(timing: &CaptureTiming) -> ResponseSnapshot {
    ResponseSnapshot {
        status_code: 500,
        response_headers: HeaderMap::new(),
        response_body: None,
        response_content_type: None,
        response_size: 0,
        duration_ms: timing.elapsed_ms(),
        memory_peak_mb: peak_memory_mb(),
        responded_at: None,
    }
}

/// Assemble the row to insert for a captured exchange
pub fn build_record(
    session_id: i64,
    request: &RequestSnapshot,
    response: &ResponseSnapshot,
    exception: Option<&ExceptionSnapshot>,
) -> Result<CapturedRecordActiveModel> {
    let request_query = if request.request_query.is_empty() {
        None
    } else {
        Some(serde_json::to_string(&request.request_query)?)
    };

    Ok(CapturedRecordActiveModel {
        id: NotSet,
        session_id: Set(session_id),
        request_id: Set(request.request_id.clone()),
        method: Set(request.method.clone()),
        url: Set(request.url.clone()),
        full_url: Set(request.full_url.clone()),
        route_name: Set(request.route_name.clone()),
        route_action: Set(request.route_action.clone()),
        request_headers: Set(serde_json::to_string(&request.request_headers)?),
        request_query: Set(request_query),
        request_body: Set(request.request_body.clone()),
        request_content_type: Set(request.request_content_type.clone()),
        request_size: Set(request.request_size),
        ip_address: Set(request.ip_address.clone()),
        user_agent: Set(request.user_agent.clone()),
        tenant_id: Set(request.tenant_id.clone()),
        user_id: Set(request.user_id),
        status_code: Set(i32::from(response.status_code)),
        response_headers: Set(Some(serde_json::to_string(&response.response_headers)?)),
        response_body: Set(response.response_body.clone()),
        response_content_type: Set(response.response_content_type.clone()),
        response_size: Set(Some(response.response_size)),
        duration_ms: Set(Some(response.duration_ms)),
        memory_peak_mb: Set(response.memory_peak_mb),
        exception_class: Set(exception.map(|e| e.exception_class.clone())),
        exception_message: Set(exception.map(|e| e.exception_message.clone())),
        exception_trace: Set(exception.and_then(|e| e.exception_trace.clone())),
        requested_at: Set(request.requested_at),
        responded_at: Set(response.responded_at),
        created_at: Set(Utc::now()),
    })
}

fn header_value(headers: &HttpHeaderMap, name: header::HeaderName) -> Option<String> {
    headers
        .get(name)
        .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
}

/// Every header with all of its values, in wire order per name
pub fn header_map(headers: &HttpHeaderMap) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        map.entry(name.as_str().to_string())
            .or_default()
            .push(String::from_utf8_lossy(value.as_bytes()).into_owned());
    }
    map
}

fn relative_path(path: &str) -> String {
    let trimmed = path.trim_start_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        trimmed.to_string()
    }
}

fn query_map(uri: &axum::http::Uri) -> BTreeMap<String, String> {
    Query::<BTreeMap<String, String>>::try_from_uri(uri)
        .map(|Query(map)| map)
        .unwrap_or_default()
}

fn full_url(parts: &request::Parts) -> String {
    if parts.uri.scheme().is_some() {
        return parts.uri.to_string();
    }

    let scheme = header_value(&parts.headers, header::HeaderName::from_static("x-forwarded-proto"))
        .unwrap_or_else(|| "http".to_string());
    let host = header_value(&parts.headers, header::HOST).unwrap_or_else(|| "localhost".to_string());
    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");

    format!("{}://{}{}", scheme, host, path_and_query)
}

/// Socket peer when known, else the first `X-Forwarded-For` hop
fn client_ip(parts: &request::Parts) -> Option<String> {
    if let Some(ConnectInfo(addr)) = parts.extensions.get::<ConnectInfo<SocketAddr>>() {
        return Some(addr.ip().to_string());
    }

    header_value(&parts.headers, header::HeaderName::from_static("x-forwarded-for")).and_then(
        |forwarded| {
            forwarded
                .split(',')
                .next()
                .map(str::trim)
                .filter(|ip| !ip.is_empty())
                .map(str::to_string)
        },
    )
}

/// Process high-water mark in MiB; `None` off Linux
pub fn peak_memory_mb() -> Option<f64> {
    let status = std::fs::read_to_string("/proc/self/status").ok()?;
    status
        .lines()
        .find_map(|line| parse_status_kib(line, "VmHWM"))
        .map(|kib| kib as f64 / 1024.0)
}

fn parse_status_kib(line: &str, key: &str) -> Option<u64> {
    let (line_key, remainder) = line.split_once(':')?;
    if line_key.trim() != key {
        return None;
    }
    remainder.split_whitespace().next()?.parse::<u64>().ok()
}
