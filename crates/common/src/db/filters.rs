//! Query predicates for sessions and records
//!
//! Each function builds one `Condition`; callers compose them with
//! `Condition::all()` / `Condition::any()` instead of chaining on a model.

use crate::db::models::{CapturedRecordColumn, DebugSessionColumn};
use crate::sessions::Selector;
use chrono::{DateTime, Utc};
use sea_orm::{ColumnTrait, Condition};

/// Flagged active and expiring strictly after `now`
pub fn session_active_at(now: DateTime<Utc>) -> Condition {
    Condition::all()
        .add(DebugSessionColumn::Active.eq(true))
        .add(DebugSessionColumn::ExpiresAt.gt(now))
}

/// Still flagged active although `expires_at` has passed
pub fn session_expired_at(now: DateTime<Utc>) -> Condition {
    Condition::all()
        .add(DebugSessionColumn::Active.eq(true))
        .add(DebugSessionColumn::ExpiresAt.lte(now))
}

/// Inactive and untouched since `cutoff`
pub fn session_inactive_before(cutoff: DateTime<Utc>) -> Condition {
    Condition::all()
        .add(DebugSessionColumn::Active.eq(false))
        .add(DebugSessionColumn::UpdatedAt.lt(cutoff))
}

pub fn session_inactive() -> Condition {
    Condition::all().add(DebugSessionColumn::Active.eq(false))
}

pub fn session_with_token(token: &str) -> Condition {
    Condition::all().add(DebugSessionColumn::Token.eq(token))
}

/// Both selector fields null
pub fn session_global() -> Condition {
    Condition::all()
        .add(DebugSessionColumn::TenantId.is_null())
        .add(DebugSessionColumn::UserId.is_null())
}

fn tenant_field(tenant: Option<&str>) -> Condition {
    match tenant {
        Some(t) => Condition::all().add(DebugSessionColumn::TenantId.eq(t)),
        None => Condition::all().add(DebugSessionColumn::TenantId.is_null()),
    }
}

fn user_field(user: Option<i64>) -> Condition {
    match user {
        Some(u) => Condition::all().add(DebugSessionColumn::UserId.eq(u)),
        None => Condition::all().add(DebugSessionColumn::UserId.is_null()),
    }
}

/// Exact selector match, nulls included
pub fn session_for_selector(selector: &Selector) -> Condition {
    Condition::all()
        .add(tenant_field(selector.tenant_id()))
        .add(user_field(selector.user_id()))
}

/// Any session scoped to this tenant, whatever its user field
pub fn session_for_tenant(tenant: &str) -> Condition {
    Condition::all().add(DebugSessionColumn::TenantId.eq(tenant))
}

/// Any session scoped to this user, whatever its tenant field
pub fn session_for_user(user: i64) -> Condition {
    Condition::all().add(DebugSessionColumn::UserId.eq(user))
}

/// Non-global sessions that apply to a request context.
///
/// tenant-only OR user-only OR tenant+user, as one predicate. Returns `None`
/// when the context carries neither identifier.
pub fn session_context_match(tenant: Option<&str>, user: Option<i64>) -> Option<Condition> {
    let mut any = Condition::any();

    if let Some(t) = tenant {
        any = any.add(tenant_field(Some(t)).add(user_field(None)));
    }
    if let Some(u) = user {
        any = any.add(tenant_field(None).add(user_field(Some(u))));
    }
    if let (Some(t), Some(u)) = (tenant, user) {
        any = any.add(tenant_field(Some(t)).add(user_field(Some(u))));
    }

    if tenant.is_none() && user.is_none() {
        None
    } else {
        Some(any)
    }
}

pub fn record_created_before(cutoff: DateTime<Utc>) -> Condition {
    Condition::all().add(CapturedRecordColumn::CreatedAt.lt(cutoff))
}

pub fn record_in_session(session_id: i64) -> Condition {
    Condition::all().add(CapturedRecordColumn::SessionId.eq(session_id))
}

pub fn record_in_sessions(session_ids: &[i64]) -> Condition {
    Condition::all().add(CapturedRecordColumn::SessionId.is_in(session_ids.to_vec()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::DebugSessionEntity;
    use sea_orm::{DbBackend, EntityTrait, QueryFilter, QueryTrait};

    fn sql(condition: Condition) -> String {
        DebugSessionEntity::find()
            .filter(condition)
            .build(DbBackend::Sqlite)
            .to_string()
    }

    #[test]
    fn test_context_match_skips_empty_context() {
        assert!(session_context_match(None, None).is_none());
    }

    #[test]
    fn test_context_match_tenant_only_request() {
        let query = sql(session_context_match(Some("acme"), None).unwrap());
        assert!(query.contains(r#""tenant_id" = 'acme'"#));
        assert!(query.contains(r#""user_id" IS NULL"#));
        assert!(!query.contains(r#""user_id" = "#));
    }

    #[test]
    fn test_context_match_combines_three_shapes() {
        let query = sql(session_context_match(Some("acme"), Some(7)).unwrap());
        assert_eq!(query.matches(" OR ").count(), 2);
        assert!(query.contains(r#""user_id" = 7"#));
    }

    #[test]
    fn test_global_is_both_null() {
        let query = sql(session_global());
        assert!(query.contains(r#""tenant_id" IS NULL"#));
        assert!(query.contains(r#""user_id" IS NULL"#));
    }
}
