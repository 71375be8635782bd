//! Repository pattern for database operations
//!
//! Provides a clean interface for all data access operations
//! with proper error handling and transaction support.

use crate::db::filters;
use crate::db::models::*;
use crate::db::DbPool;
use crate::errors::{AppError, Result};
use crate::sessions::{generate_token, Selector};
use chrono::{DateTime, Utc};
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, Condition, DatabaseConnection, DbErr, EntityTrait, NotSet,
    PaginatorTrait, QueryFilter, QueryOrder, QuerySelect, Set, SqlErr, TransactionTrait,
};
use tracing::warn;

/// Repository for data access operations
#[derive(Clone)]
pub struct Repository {
    pool: DbPool,
}

impl Repository {
    /// Create a new repository with the given connection pool
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Get the read connection
    fn read_conn(&self) -> &DatabaseConnection {
        self.pool.read()
    }

    /// Get the write connection
    fn write_conn(&self) -> &DatabaseConnection {
        self.pool.write()
    }

    // ========================================================================
    // Health Check
    // ========================================================================

    /// Ping the database
    pub async fn ping(&self) -> Result<()> {
        self.pool.ping().await
    }

    // ========================================================================
    // Debug Session Operations
    // ========================================================================

    /// Find session by ID
    pub async fn find_session(&self, id: i64) -> Result<Option<DebugSession>> {
        DebugSessionEntity::find_by_id(id)
            .one(self.read_conn())
            .await
            .map_err(Into::into)
    }

    /// Find session by ID or fail with `SessionNotFound`
    pub async fn get_session(&self, id: i64) -> Result<DebugSession> {
        self.find_session(id)
            .await?
            .ok_or_else(|| AppError::SessionNotFound { id: id.to_string() })
    }

    /// Newest session matching a condition; ties on `created_at` go to the higher id
    pub async fn first_session(&self, condition: Condition) -> Result<Option<DebugSession>> {
        DebugSessionEntity::find()
            .filter(condition)
            .order_by_desc(DebugSessionColumn::CreatedAt)
            .order_by_desc(DebugSessionColumn::Id)
            .one(self.read_conn())
            .await
            .map_err(Into::into)
    }

    /// Sessions matching a condition, newest first
    pub async fn list_sessions(
        &self,
        condition: Condition,
        limit: Option<u64>,
    ) -> Result<Vec<DebugSession>> {
        DebugSessionEntity::find()
            .filter(condition)
            .order_by_desc(DebugSessionColumn::CreatedAt)
            .order_by_desc(DebugSessionColumn::Id)
            .limit(limit)
            .all(self.read_conn())
            .await
            .map_err(Into::into)
    }

    /// Create the session for a selector, or refresh the existing one.
    ///
    /// Find-then-write inside a transaction. Two racing creators for a fully
    /// specified selector collide on the unique index; the loser retries once
    /// and lands on the refresh path.
    pub async fn upsert_session(
        &self,
        selector: &Selector,
        expires_at: DateTime<Utc>,
        created_by: Option<i64>,
        label: Option<String>,
    ) -> Result<DebugSession> {
        match self
            .try_upsert_session(selector, expires_at, created_by, label.clone())
            .await
        {
            Err(err) if matches!(err.sql_err(), Some(SqlErr::UniqueConstraintViolation(_))) => {
                warn!(selector = %selector, "Concurrent session upsert, retrying");
                self.try_upsert_session(selector, expires_at, created_by, label)
                    .await
                    .map_err(Into::into)
            }
            other => other.map_err(Into::into),
        }
    }

    async fn try_upsert_session(
        &self,
        selector: &Selector,
        expires_at: DateTime<Utc>,
        created_by: Option<i64>,
        label: Option<String>,
    ) -> std::result::Result<DebugSession, DbErr> {
        let txn = self.write_conn().begin().await?;
        let now = Utc::now();

        let existing = DebugSessionEntity::find()
            .filter(filters::session_for_selector(selector))
            .order_by_asc(DebugSessionColumn::Id)
            .one(&txn)
            .await?;

        let session = match existing {
            Some(model) => {
                let mut session: DebugSessionActiveModel = model.into();
                session.active = Set(true);
                session.expires_at = Set(expires_at);
                session.created_by = Set(created_by);
                if label.is_some() {
                    session.label = Set(label);
                }
                session.updated_at = Set(now);
                session.update(&txn).await?
            }
            None => {
                let session = DebugSessionActiveModel {
                    id: NotSet,
                    token: Set(generate_token()),
                    tenant_id: Set(selector.tenant_id().map(str::to_string)),
                    user_id: Set(selector.user_id()),
                    label: Set(label),
                    active: Set(true),
                    expires_at: Set(expires_at),
                    created_by: Set(created_by),
                    created_at: Set(now),
                    updated_at: Set(now),
                };
                session.insert(&txn).await?
            }
        };

        txn.commit().await?;
        Ok(session)
    }

    /// Push expiry to `expires_at` and re-activate
    pub async fn set_session_expiry(
        &self,
        id: i64,
        expires_at: DateTime<Utc>,
    ) -> Result<DebugSession> {
        let mut session: DebugSessionActiveModel = self.get_session(id).await?.into();
        session.active = Set(true);
        session.expires_at = Set(expires_at);
        session.updated_at = Set(Utc::now());

        session.update(self.write_conn()).await.map_err(Into::into)
    }

    /// Mark one session inactive
    pub async fn deactivate_session(&self, id: i64) -> Result<DebugSession> {
        let mut session: DebugSessionActiveModel = self.get_session(id).await?.into();
        session.active = Set(false);
        session.updated_at = Set(Utc::now());

        session.update(self.write_conn()).await.map_err(Into::into)
    }

    /// Flip still-active sessions among `ids` to inactive; returns rows changed
    pub async fn deactivate_sessions(&self, ids: &[i64]) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }

        let result = DebugSessionEntity::update_many()
            .col_expr(DebugSessionColumn::Active, Expr::value(false))
            .col_expr(DebugSessionColumn::UpdatedAt, Expr::value(Utc::now()))
            .filter(DebugSessionColumn::Id.is_in(ids.to_vec()))
            .filter(DebugSessionColumn::Active.eq(true))
            .exec(self.write_conn())
            .await?;

        Ok(result.rows_affected)
    }

    /// Delete sessions by ID; their records must already be gone
    pub async fn delete_sessions(&self, ids: &[i64]) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }

        let result = DebugSessionEntity::delete_many()
            .filter(DebugSessionColumn::Id.is_in(ids.to_vec()))
            .exec(self.write_conn())
            .await?;

        Ok(result.rows_affected)
    }

    // ========================================================================
    // Captured Record Operations
    // ========================================================================

    /// Insert a captured record
    pub async fn insert_record(&self, record: CapturedRecordActiveModel) -> Result<CapturedRecord> {
        record.insert(self.write_conn()).await.map_err(Into::into)
    }

    /// Find record by ID
    pub async fn find_record(&self, id: i64) -> Result<Option<CapturedRecord>> {
        CapturedRecordEntity::find_by_id(id)
            .one(self.read_conn())
            .await
            .map_err(Into::into)
    }

    /// List a session's records with pagination, newest first
    pub async fn list_records(
        &self,
        session_id: i64,
        page: u64,
        per_page: u64,
    ) -> Result<(Vec<CapturedRecord>, u64)> {
        let paginator = CapturedRecordEntity::find()
            .filter(filters::record_in_session(session_id))
            .order_by_desc(CapturedRecordColumn::CreatedAt)
            .order_by_desc(CapturedRecordColumn::Id)
            .paginate(self.read_conn(), per_page.max(1));

        let total = paginator.num_items().await?;
        let records = paginator.fetch_page(page).await?;

        Ok((records, total))
    }

    /// Count records matching a condition
    pub async fn count_records(&self, condition: Condition) -> Result<u64> {
        CapturedRecordEntity::find()
            .filter(condition)
            .count(self.read_conn())
            .await
            .map_err(Into::into)
    }

    /// Delete record by ID
    pub async fn delete_record(&self, id: i64) -> Result<bool> {
        let result = CapturedRecordEntity::delete_by_id(id)
            .exec(self.write_conn())
            .await?;

        Ok(result.rows_affected > 0)
    }

    /// Delete matching records `batch_size` rows per statement; returns the total
    pub async fn delete_records_batched(
        &self,
        condition: Condition,
        batch_size: u64,
    ) -> Result<u64> {
        let batch_size = batch_size.max(1);
        let mut deleted = 0;

        loop {
            let ids: Vec<i64> = CapturedRecordEntity::find()
                .select_only()
                .column(CapturedRecordColumn::Id)
                .filter(condition.clone())
                .order_by_asc(CapturedRecordColumn::Id)
                .limit(batch_size)
                .into_tuple()
                .all(self.write_conn())
                .await?;

            if ids.is_empty() {
                break;
            }

            let fetched = ids.len() as u64;
            let result = CapturedRecordEntity::delete_many()
                .filter(CapturedRecordColumn::Id.is_in(ids))
                .exec(self.write_conn())
                .await?;
            deleted += result.rows_affected;

            if fetched < batch_size {
                break;
            }
        }

        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::record_for;
    use chrono::Duration;

    async fn repo() -> Repository {
        Repository::new(DbPool::in_memory().await.unwrap())
    }

    #[tokio::test]
    async fn test_upsert_refreshes_instead_of_duplicating() {
        let repo = repo().await;
        let selector = Selector::tenant("acme").unwrap();
        let soon = Utc::now() + Duration::minutes(5);
        let later = Utc::now() + Duration::minutes(50);

        let first = repo
            .upsert_session(&selector, soon, Some(1), Some("checkout bug".into()))
            .await
            .unwrap();
        repo.deactivate_session(first.id).await.unwrap();

        let second = repo.upsert_session(&selector, later, Some(2), None).await.unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(first.token, second.token);
        assert!(second.active);
        assert_eq!(second.created_by, Some(2));
        assert_eq!(second.label.as_deref(), Some("checkout bug"));
        assert!((second.expires_at - later).num_milliseconds().abs() < 1);

        let all = repo.list_sessions(Condition::all(), None).await.unwrap();
        assert_eq!(all.len(), 1);
    }

    #[tokio::test]
    async fn test_global_upsert_is_single_row() {
        let repo = repo().await;
        let expires = Utc::now() + Duration::minutes(5);

        repo.upsert_session(&Selector::Global, expires, None, None).await.unwrap();
        repo.upsert_session(&Selector::Global, expires, None, None).await.unwrap();

        let globals = repo
            .list_sessions(filters::session_global(), None)
            .await
            .unwrap();
        assert_eq!(globals.len(), 1);
        assert_eq!(globals[0].token.len(), 64);
    }

    #[tokio::test]
    async fn test_batched_delete_removes_everything_matching() {
        let repo = repo().await;
        let session = repo
            .upsert_session(&Selector::user(9).unwrap(), Utc::now() + Duration::minutes(5), None, None)
            .await
            .unwrap();

        for _ in 0..7 {
            repo.insert_record(record_for(session.id, Utc::now())).await.unwrap();
        }

        let deleted = repo
            .delete_records_batched(filters::record_in_session(session.id), 3)
            .await
            .unwrap();
        assert_eq!(deleted, 7);
        assert_eq!(
            repo.count_records(filters::record_in_session(session.id)).await.unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn test_missing_session_is_not_found() {
        let repo = repo().await;
        let err = repo.get_session(404).await.unwrap_err();
        assert!(matches!(err, AppError::SessionNotFound { .. }));
    }
}
