//! Debug session entity: a standing instruction to capture matching traffic

use crate::sessions::Selector;
use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "debug_sessions")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,

    /// 64 hex characters; presented as `X-Debug-Token` or `_debug_token`
    #[sea_orm(unique)]
    pub token: String,

    pub tenant_id: Option<String>,

    pub user_id: Option<i64>,

    #[sea_orm(column_type = "Text", nullable)]
    pub label: Option<String>,

    pub active: bool,

    pub expires_at: ChronoDateTimeUtc,

    pub created_by: Option<i64>,

    pub created_at: ChronoDateTimeUtc,

    pub updated_at: ChronoDateTimeUtc,
}

impl Model {
    /// The selector this session was created for
    pub fn selector(&self) -> Selector {
        Selector::from_parts(self.tenant_id.clone(), self.user_id)
    }

    pub fn is_global(&self) -> bool {
        self.tenant_id.is_none() && self.user_id.is_none()
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// Matchable: flagged active and expiring strictly after `now`
    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        self.active && !self.is_expired(now)
    }

    /// Whole minutes left before expiry, zero once expired
    pub fn remaining_minutes(&self, now: DateTime<Utc>) -> i64 {
        if self.is_expired(now) {
            0
        } else {
            (self.expires_at - now).num_minutes()
        }
    }

    /// Human readable description of the selector
    pub fn target_label(&self) -> String {
        self.selector().to_string()
    }
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::captured_record::Entity")]
    CapturedRecords,
}

impl Related<super::captured_record::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::CapturedRecords.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
