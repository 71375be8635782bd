//! Captured record entity: one observed request/response pair

use crate::redact::{self, HeaderMap};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "captured_records")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,

    #[sea_orm(indexed)]
    pub session_id: i64,

    // Request facet
    #[sea_orm(unique)]
    pub request_id: String,

    pub method: String,

    /// Path without the leading slash
    #[sea_orm(column_type = "Text")]
    pub url: String,

    #[sea_orm(column_type = "Text")]
    pub full_url: String,

    pub route_name: Option<String>,

    pub route_action: Option<String>,

    /// JSON-encoded `{name: [values]}`
    #[sea_orm(column_type = "Text")]
    pub request_headers: String,

    /// JSON-encoded `{name: value}`
    #[sea_orm(column_type = "Text", nullable)]
    pub request_query: Option<String>,

    #[sea_orm(column_type = "Text", nullable)]
    pub request_body: Option<String>,

    pub request_content_type: Option<String>,

    pub request_size: i64,

    pub ip_address: Option<String>,

    #[sea_orm(column_type = "Text", nullable)]
    pub user_agent: Option<String>,

    pub tenant_id: Option<String>,

    pub user_id: Option<i64>,

    // Response facet
    pub status_code: i32,

    #[sea_orm(column_type = "Text", nullable)]
    pub response_headers: Option<String>,

    #[sea_orm(column_type = "Text", nullable)]
    pub response_body: Option<String>,

    pub response_content_type: Option<String>,

    pub response_size: Option<i64>,

    pub duration_ms: Option<f64>,

    pub memory_peak_mb: Option<f64>,

    // Exception facet
    pub exception_class: Option<String>,

    #[sea_orm(column_type = "Text", nullable)]
    pub exception_message: Option<String>,

    #[sea_orm(column_type = "Text", nullable)]
    pub exception_trace: Option<String>,

    pub requested_at: ChronoDateTimeUtc,

    pub responded_at: Option<ChronoDateTimeUtc>,

    /// Capture time; retention is measured from here
    #[sea_orm(indexed)]
    pub created_at: ChronoDateTimeUtc,
}

/// Coarse bucket of a status code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusClass {
    Informational,
    Success,
    Redirect,
    ClientError,
    ServerError,
}

impl Model {
    pub fn request_header_map(&self) -> HeaderMap {
        serde_json::from_str(&self.request_headers).unwrap_or_default()
    }

    pub fn response_header_map(&self) -> HeaderMap {
        self.response_headers
            .as_deref()
            .and_then(|h| serde_json::from_str(h).ok())
            .unwrap_or_default()
    }

    pub fn query_map(&self) -> BTreeMap<String, String> {
        self.request_query
            .as_deref()
            .and_then(|q| serde_json::from_str(q).ok())
            .unwrap_or_default()
    }

    /// Request headers collapsed to one string each, redaction re-applied
    pub fn request_headers_for_display(
        &self,
        redact_headers: &[String],
        replacement: &str,
    ) -> BTreeMap<String, String> {
        redact::headers_for_display(&self.request_header_map(), redact_headers, replacement)
    }

    pub fn response_headers_for_display(
        &self,
        redact_headers: &[String],
        replacement: &str,
    ) -> BTreeMap<String, String> {
        redact::headers_for_display(&self.response_header_map(), redact_headers, replacement)
    }

    pub fn has_exception(&self) -> bool {
        self.exception_class.is_some()
    }

    pub fn is_json_request(&self) -> bool {
        is_json(self.request_content_type.as_deref())
    }

    pub fn is_json_response(&self) -> bool {
        is_json(self.response_content_type.as_deref())
    }

    pub fn status_class(&self) -> StatusClass {
        match self.status_code {
            200..=299 => StatusClass::Success,
            300..=399 => StatusClass::Redirect,
            400..=499 => StatusClass::ClientError,
            code if code >= 500 => StatusClass::ServerError,
            _ => StatusClass::Informational,
        }
    }

    pub fn formatted_duration(&self) -> String {
        match self.duration_ms {
            None => "-".to_string(),
            Some(ms) if ms < 1000.0 => format!("{:.2}ms", ms),
            Some(ms) => format!("{:.2}s", ms / 1000.0),
        }
    }

    pub fn formatted_request_size(&self) -> String {
        format_bytes(Some(self.request_size))
    }

    pub fn formatted_response_size(&self) -> String {
        format_bytes(self.response_size)
    }
}

fn is_json(content_type: Option<&str>) -> bool {
    content_type
        .map(|ct| ct.to_ascii_lowercase().contains("json"))
        .unwrap_or(false)
}

/// Render a byte count with binary units
pub fn format_bytes(bytes: Option<i64>) -> String {
    let Some(bytes) = bytes else {
        return "-".to_string();
    };

    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    let mut size = bytes.max(0) as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }

    if unit == 0 {
        format!("{} B", bytes)
    } else {
        format!("{:.1} {}", size, UNITS[unit])
    }
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::debug_session::Entity",
        from = "Column::SessionId",
        to = "super::debug_session::Column::Id",
        on_delete = "Cascade"
    )]
    DebugSession,
}

impl Related<super::debug_session::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::DebugSession.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
