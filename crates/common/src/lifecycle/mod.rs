//! Session expiry and record retention
//!
//! Three independent sweeps, each batched so no statement touches more than
//! `retention.batch_size` rows:
//! - flip expired sessions inactive (and drop them from the cache)
//! - delete records older than the retention window
//! - delete sessions inactive for longer than the grace period, records first

use crate::config::DebuggerConfig;
use crate::db::filters;
use crate::db::Repository;
use crate::errors::Result;
use crate::metrics;
use crate::sessions::SessionCache;
use chrono::{Duration, Utc};
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use tracing::{error, info, instrument};

/// Outcome of one lifecycle pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LifecycleReport {
    pub sessions_expired: u64,
    pub records_pruned: u64,
    /// Records removed together with their long-inactive sessions
    pub inactive_session_records_pruned: u64,
    pub failed_steps: u64,
}

impl LifecycleReport {
    pub fn total_records_pruned(&self) -> u64 {
        self.records_pruned + self.inactive_session_records_pruned
    }
}

#[derive(Clone)]
pub struct LifecycleManager {
    repo: Repository,
    cache: SessionCache,
    config: Arc<DebuggerConfig>,
}

impl LifecycleManager {
    pub fn new(repo: Repository, cache: SessionCache, config: Arc<DebuggerConfig>) -> Self {
        Self {
            repo,
            cache,
            config,
        }
    }

    fn batch_size(&self) -> u64 {
        self.config.retention.batch_size.max(1)
    }

    /// Flip active-but-expired sessions inactive; returns how many
    pub async fn expire_sessions(&self) -> Result<u64> {
        let batch = self.batch_size();
        let mut expired = 0;

        loop {
            let sessions = self
                .repo
                .list_sessions(filters::session_expired_at(Utc::now()), Some(batch))
                .await?;
            if sessions.is_empty() {
                break;
            }

            let ids: Vec<i64> = sessions.iter().map(|s| s.id).collect();
            expired += self.repo.deactivate_sessions(&ids).await?;
            for session in &sessions {
                self.cache.invalidate(session).await;
            }

            if (sessions.len() as u64) < batch {
                break;
            }
        }

        Ok(expired)
    }

    /// Delete records captured before the retention window; returns how many
    pub async fn prune_aged_records(&self) -> Result<u64> {
        let cutoff = Utc::now() - Duration::hours(self.config.retention.hours);
        self.repo
            .delete_records_batched(filters::record_created_before(cutoff), self.batch_size())
            .await
    }

    /// Delete sessions inactive past the grace period with their records;
    /// returns the record count
    pub async fn prune_inactive_sessions(&self) -> Result<u64> {
        let cutoff = Utc::now() - Duration::minutes(self.config.retention.inactive_grace_minutes);
        let batch = self.batch_size();
        let mut records = 0;
        let mut sessions_deleted = 0;

        loop {
            let sessions = self
                .repo
                .list_sessions(filters::session_inactive_before(cutoff), Some(batch))
                .await?;
            if sessions.is_empty() {
                break;
            }

            let ids: Vec<i64> = sessions.iter().map(|s| s.id).collect();
            records += self
                .repo
                .delete_records_batched(filters::record_in_sessions(&ids), batch)
                .await?;
            sessions_deleted += self.repo.delete_sessions(&ids).await?;
            for session in &sessions {
                self.cache.invalidate(session).await;
            }

            if (sessions.len() as u64) < batch {
                break;
            }
        }

        if sessions_deleted > 0 {
            info!(sessions_deleted, records, "Deleted inactive debug sessions");
        }
        Ok(records)
    }

    /// Run every sweep; a failing step is logged and the rest still run
    #[instrument(skip(self))]
    pub async fn run_once(&self) -> LifecycleReport {
        let mut report = LifecycleReport::default();

        match self.expire_sessions().await {
            Ok(n) => report.sessions_expired = n,
            Err(e) => {
                report.failed_steps += 1;
                error!(error = %e, "Failed to expire debug sessions");
            }
        }

        match self.prune_aged_records().await {
            Ok(n) => report.records_pruned = n,
            Err(e) => {
                report.failed_steps += 1;
                error!(error = %e, "Failed to prune aged records");
            }
        }

        match self.prune_inactive_sessions().await {
            Ok(n) => report.inactive_session_records_pruned = n,
            Err(e) => {
                report.failed_steps += 1;
                error!(error = %e, "Failed to prune inactive sessions");
            }
        }

        metrics::record_lifecycle(
            report.sessions_expired,
            report.total_records_pruned(),
            report.failed_steps,
        );
        info!(
            sessions_expired = report.sessions_expired,
            records_pruned = report.total_records_pruned(),
            failed_steps = report.failed_steps,
            "Lifecycle pass complete"
        );

        report
    }

    /// Sweep every `interval` until `shutdown` resolves
    pub async fn run<F>(self, interval: std::time::Duration, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        info!(interval_secs = interval.as_secs(), "Lifecycle scheduler started");

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Lifecycle scheduler stopping");
                    break;
                }
                _ = ticker.tick() => {
                    self.run_once().await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DebuggerConfig;
    use crate::db::models::DebugSessionActiveModel;
    use crate::sessions::Selector;
    use crate::test_support::{enabled_config, TestEnv};
    use sea_orm::{ActiveModelTrait, Set};

    fn manager(env: &TestEnv) -> LifecycleManager {
        LifecycleManager::new(env.repo.clone(), env.cache.clone(), env.config.clone())
    }

    async fn age_session(env: &TestEnv, id: i64, minutes: i64) {
        let mut session: DebugSessionActiveModel = env.repo.get_session(id).await.unwrap().into();
        session.updated_at = Set(Utc::now() - Duration::minutes(minutes));
        session.update(env.pool.write()).await.unwrap();
    }

    #[tokio::test]
    async fn test_expire_sessions_flips_only_expired() {
        let env = TestEnv::new().await;
        let past = Utc::now() - Duration::minutes(1);
        for user in 1..=3 {
            env.repo
                .upsert_session(&Selector::user(user).unwrap(), past, None, None)
                .await
                .unwrap();
        }
        let live = env.sessions.enable_for_tenant("acme", None, None).await.unwrap();

        assert_eq!(manager(&env).expire_sessions().await.unwrap(), 3);
        assert_eq!(manager(&env).expire_sessions().await.unwrap(), 0);
        assert!(env.sessions.find(live.id).await.unwrap().active);
    }

    #[tokio::test]
    async fn test_expire_sessions_works_in_small_batches() {
        let mut config = enabled_config();
        config.retention.batch_size = 2;
        let env = TestEnv::with_config(config).await;
        let past = Utc::now() - Duration::minutes(1);
        for user in 1..=5 {
            env.repo
                .upsert_session(&Selector::user(user).unwrap(), past, None, None)
                .await
                .unwrap();
        }

        assert_eq!(manager(&env).expire_sessions().await.unwrap(), 5);
        assert!(env.sessions.list_active().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_prune_aged_records_is_idempotent() {
        let env = TestEnv::new().await;
        let session = env.sessions.enable_global(None, None).await.unwrap();
        env.insert_records(session.id, 4, Utc::now() - Duration::hours(25)).await;
        env.insert_records(session.id, 2, Utc::now()).await;

        let manager = manager(&env);
        assert_eq!(manager.prune_aged_records().await.unwrap(), 4);
        assert_eq!(manager.prune_aged_records().await.unwrap(), 0);
        assert_eq!(env.repo.count_records(sea_orm::Condition::all()).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_prune_inactive_sessions_respects_grace() {
        let env = TestEnv::new().await;
        let old = env.sessions.enable_for_user(1, None, None).await.unwrap();
        let recent = env.sessions.enable_for_user(2, None, None).await.unwrap();
        env.insert_records(old.id, 3, Utc::now()).await;
        env.insert_records(recent.id, 1, Utc::now()).await;

        env.sessions.stop(old.id).await.unwrap();
        env.sessions.stop(recent.id).await.unwrap();
        age_session(&env, old.id, 120).await;

        assert_eq!(manager(&env).prune_inactive_sessions().await.unwrap(), 3);
        assert!(env.repo.find_session(old.id).await.unwrap().is_none());
        assert!(env.repo.find_session(recent.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_run_once_reports_every_step() {
        let env = TestEnv::new().await;
        let expired = env
            .repo
            .upsert_session(&Selector::Global, Utc::now() - Duration::minutes(1), None, None)
            .await
            .unwrap();
        env.insert_records(expired.id, 2, Utc::now() - Duration::hours(48)).await;

        let report = manager(&env).run_once().await;

        assert_eq!(report.sessions_expired, 1);
        assert_eq!(report.records_pruned, 2);
        assert_eq!(report.inactive_session_records_pruned, 0);
        assert_eq!(report.failed_steps, 0);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let env = TestEnv::with_config(DebuggerConfig {
            enabled: true,
            ..DebuggerConfig::default()
        })
        .await;

        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let handle = tokio::spawn(manager(&env).run(std::time::Duration::from_millis(10), async move {
            let _ = rx.await;
        }));

        tokio::time::sleep(std::time::Duration::from_millis(30)).await;
        tx.send(()).unwrap();
        handle.await.unwrap();
    }
}
