//! Operator actions on debug sessions
//!
//! Every mutation invalidates the session cache before returning, so the
//! next resolution observes it.

use super::{Selector, SessionCache};
use crate::config::DebuggerConfig;
use crate::db::filters;
use crate::db::models::DebugSession;
use crate::db::Repository;
use crate::errors::Result;
use chrono::{Duration, Utc};
use sea_orm::Condition;
use serde::Serialize;
use std::sync::Arc;
use tracing::info;

/// Active session plus its record count
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    #[serde(flatten)]
    pub session: DebugSession,
    pub target: String,
    pub remaining_minutes: i64,
    pub record_count: u64,
}

/// Snapshot for operators: what is being captured right now
#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub enabled: bool,
    pub driver: &'static str,
    pub active_sessions: Vec<SessionSummary>,
    pub total_records: u64,
}

#[derive(Clone)]
pub struct SessionService {
    repo: Repository,
    cache: SessionCache,
    config: Arc<DebuggerConfig>,
}

impl SessionService {
    pub fn new(repo: Repository, cache: SessionCache, config: Arc<DebuggerConfig>) -> Self {
        Self {
            repo,
            cache,
            config,
        }
    }

    pub fn repository(&self) -> &Repository {
        &self.repo
    }

    /// Start capturing for `selector`, refreshing an existing session for it.
    ///
    /// `minutes` falls back to the configured default and is capped at the maximum.
    pub async fn enable(
        &self,
        selector: &Selector,
        minutes: Option<i64>,
        created_by: Option<i64>,
        label: Option<String>,
    ) -> Result<DebugSession> {
        let minutes = self.config.clamp_duration(minutes);
        let expires_at = Utc::now() + Duration::minutes(minutes);

        let session = self
            .repo
            .upsert_session(selector, expires_at, created_by, label)
            .await?;
        self.cache.invalidate(&session).await;

        info!(
            session_id = session.id,
            target = %selector,
            minutes,
            "Debug session enabled"
        );
        Ok(session)
    }

    pub async fn enable_global(&self, minutes: Option<i64>, created_by: Option<i64>) -> Result<DebugSession> {
        self.enable(&Selector::Global, minutes, created_by, None).await
    }

    pub async fn enable_for_tenant(
        &self,
        tenant_id: &str,
        minutes: Option<i64>,
        created_by: Option<i64>,
    ) -> Result<DebugSession> {
        self.enable(&Selector::tenant(tenant_id)?, minutes, created_by, None)
            .await
    }

    pub async fn enable_for_user(
        &self,
        user_id: i64,
        minutes: Option<i64>,
        created_by: Option<i64>,
    ) -> Result<DebugSession> {
        self.enable(&Selector::user(user_id)?, minutes, created_by, None)
            .await
    }

    pub async fn enable_for_tenant_user(
        &self,
        tenant_id: &str,
        user_id: i64,
        minutes: Option<i64>,
        created_by: Option<i64>,
    ) -> Result<DebugSession> {
        self.enable(&Selector::tenant_user(tenant_id, user_id)?, minutes, created_by, None)
            .await
    }

    /// Expire `minutes` from now (clamped) and re-activate
    pub async fn extend(&self, id: i64, minutes: Option<i64>) -> Result<DebugSession> {
        let minutes = self.config.clamp_duration(minutes);
        let expires_at = Utc::now() + Duration::minutes(minutes);

        let session = self.repo.set_session_expiry(id, expires_at).await?;
        self.cache.invalidate(&session).await;

        info!(session_id = id, minutes, "Debug session extended");
        Ok(session)
    }

    pub async fn stop(&self, id: i64) -> Result<DebugSession> {
        let session = self.repo.deactivate_session(id).await?;
        self.cache.invalidate(&session).await;

        info!(session_id = id, "Debug session stopped");
        Ok(session)
    }

    /// Delete a session and its records, records first; returns records removed
    pub async fn delete(&self, id: i64) -> Result<u64> {
        let session = self.repo.get_session(id).await?;

        let records = self
            .repo
            .delete_records_batched(
                filters::record_in_session(id),
                self.config.retention.batch_size,
            )
            .await?;
        self.repo.delete_sessions(&[id]).await?;
        self.cache.invalidate(&session).await;

        info!(session_id = id, records, "Debug session deleted");
        Ok(records)
    }

    /// Stop every active session scoped to the tenant; returns how many
    pub async fn disable_for_tenant(&self, tenant_id: &str) -> Result<u64> {
        self.disable_matching(filters::session_for_tenant(tenant_id))
            .await
    }

    /// Stop every active session scoped to the user; returns how many
    pub async fn disable_for_user(&self, user_id: i64) -> Result<u64> {
        self.disable_matching(filters::session_for_user(user_id)).await
    }

    /// Stop every active session
    pub async fn disable_all(&self) -> Result<u64> {
        self.disable_matching(Condition::all()).await
    }

    async fn disable_matching(&self, condition: Condition) -> Result<u64> {
        let sessions = self
            .repo
            .list_sessions(
                Condition::all()
                    .add(condition)
                    .add(filters::session_active_at(Utc::now())),
                None,
            )
            .await?;

        let ids: Vec<i64> = sessions.iter().map(|s| s.id).collect();
        let stopped = self.repo.deactivate_sessions(&ids).await?;
        for session in &sessions {
            self.cache.invalidate(session).await;
        }

        info!(stopped, "Debug sessions disabled");
        Ok(stopped)
    }

    pub async fn find(&self, id: i64) -> Result<DebugSession> {
        self.repo.get_session(id).await
    }

    /// Matchable sessions, newest first
    pub async fn list_active(&self) -> Result<Vec<DebugSession>> {
        self.repo
            .list_sessions(filters::session_active_at(Utc::now()), None)
            .await
    }

    /// Recently stopped or expired sessions, newest first
    pub async fn list_recent_inactive(&self, limit: u64) -> Result<Vec<DebugSession>> {
        let now = Utc::now();
        self.repo
            .list_sessions(
                Condition::any()
                    .add(filters::session_inactive())
                    .add(filters::session_expired_at(now)),
                Some(limit),
            )
            .await
    }

    pub async fn summarize(&self, session: DebugSession) -> Result<SessionSummary> {
        let record_count = self
            .repo
            .count_records(filters::record_in_session(session.id))
            .await?;

        Ok(SessionSummary {
            target: session.target_label(),
            remaining_minutes: session.remaining_minutes(Utc::now()),
            record_count,
            session,
        })
    }

    pub async fn status(&self) -> Result<SessionStatus> {
        let mut active_sessions = Vec::new();
        for session in self.list_active().await? {
            active_sessions.push(self.summarize(session).await?);
        }

        let total_records = self.repo.count_records(Condition::all()).await?;

        Ok(SessionStatus {
            enabled: self.config.enabled,
            driver: self.config.driver.as_str(),
            active_sessions,
            total_records,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::TestEnv;

    #[tokio::test]
    async fn test_enable_clamps_to_maximum() {
        let env = TestEnv::new().await;
        let session = env
            .sessions
            .enable_for_tenant("acme", Some(10_000), Some(1))
            .await
            .unwrap();

        let remaining = session.remaining_minutes(Utc::now());
        assert!((119..=120).contains(&remaining));
        assert_eq!(session.tenant_id.as_deref(), Some("acme"));
        assert_eq!(session.user_id, None);
    }

    #[tokio::test]
    async fn test_enable_rejects_invalid_selector() {
        let env = TestEnv::new().await;
        assert!(env.sessions.enable_for_user(0, None, None).await.is_err());
        assert!(env.sessions.enable_for_tenant("", None, None).await.is_err());
    }

    #[tokio::test]
    async fn test_stop_then_extend_reactivates() {
        let env = TestEnv::new().await;
        let session = env.sessions.enable_for_user(5, Some(5), None).await.unwrap();

        let stopped = env.sessions.stop(session.id).await.unwrap();
        assert!(!stopped.active);

        let extended = env.sessions.extend(session.id, Some(60)).await.unwrap();
        assert!(extended.active);
        assert!(extended.remaining_minutes(Utc::now()) >= 59);
    }

    #[tokio::test]
    async fn test_disable_for_tenant_covers_tenant_user_sessions() {
        let env = TestEnv::new().await;
        env.sessions.enable_for_tenant("acme", None, None).await.unwrap();
        env.sessions.enable_for_tenant_user("acme", 3, None, None).await.unwrap();
        env.sessions.enable_for_tenant("beta", None, None).await.unwrap();

        assert_eq!(env.sessions.disable_for_tenant("acme").await.unwrap(), 2);

        let active = env.sessions.list_active().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].tenant_id.as_deref(), Some("beta"));
    }

    #[tokio::test]
    async fn test_delete_removes_records_then_session() {
        let env = TestEnv::new().await;
        let session = env.sessions.enable_global(None, None).await.unwrap();
        env.insert_records(session.id, 3, Utc::now()).await;

        assert_eq!(env.sessions.delete(session.id).await.unwrap(), 3);
        assert!(env.sessions.find(session.id).await.is_err());
    }

    #[tokio::test]
    async fn test_status_counts_records() {
        let env = TestEnv::new().await;
        let session = env.sessions.enable_for_user(8, None, None).await.unwrap();
        env.insert_records(session.id, 2, Utc::now()).await;

        let status = env.sessions.status().await.unwrap();
        assert_eq!(status.active_sessions.len(), 1);
        assert_eq!(status.active_sessions[0].record_count, 2);
        assert_eq!(status.active_sessions[0].target, "User: #8");
        assert_eq!(status.total_records, 2);
    }
}
