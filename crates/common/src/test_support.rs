//! Fixtures shared by unit tests

use crate::cache::{CacheStore, MemoryCache};
use crate::config::DebuggerConfig;
use crate::db::models::{CapturedRecordActiveModel, DebugSession};
use crate::db::{DbPool, Repository};
use crate::errors::{AppError, Result};
use crate::sessions::{SessionCache, SessionService};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sea_orm::{NotSet, Set};
use std::sync::Arc;

/// Minimal record row for `session_id` captured at `created_at`
pub fn record_for(session_id: i64, created_at: DateTime<Utc>) -> CapturedRecordActiveModel {
    CapturedRecordActiveModel {
        id: NotSet,
        session_id: Set(session_id),
        request_id: Set(uuid::Uuid::new_v4().to_string()),
        method: Set("GET".to_string()),
        url: Set("api/orders".to_string()),
        full_url: Set("http://localhost/api/orders".to_string()),
        route_name: Set(Some("/api/orders".to_string())),
        route_action: Set(None),
        request_headers: Set("{}".to_string()),
        request_query: Set(None),
        request_body: Set(None),
        request_content_type: Set(None),
        request_size: Set(0),
        ip_address: Set(None),
        user_agent: Set(None),
        tenant_id: Set(None),
        user_id: Set(None),
        status_code: Set(200),
        response_headers: Set(Some("{}".to_string())),
        response_body: Set(None),
        response_content_type: Set(None),
        response_size: Set(Some(0)),
        duration_ms: Set(Some(1.5)),
        memory_peak_mb: Set(None),
        exception_class: Set(None),
        exception_message: Set(None),
        exception_trace: Set(None),
        requested_at: Set(created_at),
        responded_at: Set(Some(created_at)),
        created_at: Set(created_at),
    }
}

/// Unsaved active session expiring in an hour; the token is derived from `id`
pub fn session_model(id: i64, tenant: Option<&str>, user: Option<i64>) -> DebugSession {
    let now = Utc::now();
    DebugSession {
        id,
        token: format!("{:064x}", id),
        tenant_id: tenant.map(str::to_string),
        user_id: user,
        label: None,
        active: true,
        expires_at: now + Duration::hours(1),
        created_by: None,
        created_at: now,
        updated_at: now,
    }
}

/// Cache store whose every operation fails
pub struct FailingCache;

#[async_trait]
impl CacheStore for FailingCache {
    async fn get(&self, _key: &str) -> Result<Option<String>> {
        Err(unavailable())
    }

    async fn set(&self, _key: &str, _value: &str, _ttl: std::time::Duration) -> Result<()> {
        Err(unavailable())
    }

    async fn delete(&self, _key: &str) -> Result<()> {
        Err(unavailable())
    }

    async fn incr(&self, _key: &str) -> Result<i64> {
        Err(unavailable())
    }
}

fn unavailable() -> AppError {
    AppError::CacheError {
        message: "cache unavailable".to_string(),
    }
}

/// In-memory database, in-memory cache and the services over them
pub struct TestEnv {
    pub pool: DbPool,
    pub repo: Repository,
    pub store: Arc<MemoryCache>,
    pub cache: SessionCache,
    pub sessions: SessionService,
    pub config: Arc<DebuggerConfig>,
}

impl TestEnv {
    pub async fn new() -> Self {
        Self::with_config(enabled_config()).await
    }

    pub async fn with_config(config: DebuggerConfig) -> Self {
        let pool = DbPool::in_memory().await.unwrap();
        let repo = Repository::new(pool.clone());
        let store = Arc::new(MemoryCache::new());
        let config = Arc::new(config);
        let cache = SessionCache::new(store.clone(), config.cache_ttl());
        let sessions = SessionService::new(repo.clone(), cache.clone(), config.clone());

        Self {
            pool,
            repo,
            store,
            cache,
            sessions,
            config,
        }
    }

    pub async fn insert_records(&self, session_id: i64, count: usize, created_at: DateTime<Utc>) {
        for _ in 0..count {
            self.repo
                .insert_record(record_for(session_id, created_at))
                .await
                .unwrap();
        }
    }
}

pub fn enabled_config() -> DebuggerConfig {
    DebuggerConfig {
        enabled: true,
        ..DebuggerConfig::default()
    }
}
