//! Database layer for debugtap
//!
//! Provides:
//! - SeaORM entity models
//! - Query predicates composed by callers
//! - Repository pattern for data access
//! - Connection pool management and schema setup

pub mod filters;
pub mod models;
mod repository;

pub use repository::Repository;

use crate::config::DatabaseConfig;
use crate::errors::{AppError, Result};
use models::{CapturedRecordColumn, CapturedRecordEntity, DebugSessionColumn, DebugSessionEntity};
use sea_orm::sea_query::Index;
use sea_orm::{ConnectOptions, ConnectionTrait, Database, DatabaseConnection, DbErr, Schema};
use std::time::Duration;
use tracing::info;

/// Database connection pool wrapper
#[derive(Clone)]
pub struct DbPool {
    /// Primary connection (for writes)
    pub primary: DatabaseConnection,

    /// Read replica connection (optional)
    pub replica: Option<DatabaseConnection>,
}

impl DbPool {
    /// Create a new database pool from configuration
    pub async fn new(config: &DatabaseConfig) -> Result<Self> {
        info!("Connecting to primary database...");

        let primary = Database::connect(connect_options(&config.url, config))
            .await
            .map_err(|e| AppError::DatabaseConnection {
                message: format!("Failed to connect to primary: {}", e),
            })?;

        // Connect to replica if configured
        let replica = if let Some(ref read_url) = config.read_url {
            info!("Connecting to read replica...");

            let replica_conn = Database::connect(connect_options(read_url, config))
                .await
                .map_err(|e| AppError::DatabaseConnection {
                    message: format!("Failed to connect to replica: {}", e),
                })?;

            Some(replica_conn)
        } else {
            None
        };

        info!("Database connections established");

        Ok(Self { primary, replica })
    }

    /// Wrap an existing connection, no replica
    pub fn from_connection(primary: DatabaseConnection) -> Self {
        Self {
            primary,
            replica: None,
        }
    }

    /// Single-connection in-memory SQLite with the schema applied
    pub async fn in_memory() -> Result<Self> {
        let mut opts = ConnectOptions::new("sqlite::memory:");
        opts.max_connections(1).min_connections(1).sqlx_logging(false);

        let conn = Database::connect(opts)
            .await
            .map_err(|e| AppError::DatabaseConnection {
                message: format!("Failed to open in-memory database: {}", e),
            })?;
        migrate(&conn).await?;

        Ok(Self::from_connection(conn))
    }

    /// Get the connection for reads (replica if available, otherwise primary)
    pub fn read(&self) -> &DatabaseConnection {
        self.replica.as_ref().unwrap_or(&self.primary)
    }

    /// Get the connection for writes (always primary)
    pub fn write(&self) -> &DatabaseConnection {
        &self.primary
    }

    /// Ping the database to check connectivity
    pub async fn ping(&self) -> Result<()> {
        self.primary
            .execute_unprepared("SELECT 1")
            .await
            .map_err(|e| AppError::DatabaseConnection {
                message: format!("Primary ping failed: {}", e),
            })?;

        if let Some(ref replica) = self.replica {
            replica
                .execute_unprepared("SELECT 1")
                .await
                .map_err(|e| AppError::DatabaseConnection {
                    message: format!("Replica ping failed: {}", e),
                })?;
        }

        Ok(())
    }
}

fn connect_options(url: &str, config: &DatabaseConfig) -> ConnectOptions {
    let mut opts = ConnectOptions::new(url);
    opts.max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
        .idle_timeout(Duration::from_secs(config.idle_timeout_secs))
        .sqlx_logging(true);
    opts
}

/// Create tables and indexes if they do not exist yet
pub async fn migrate(db: &DatabaseConnection) -> std::result::Result<(), DbErr> {
    let backend = db.get_database_backend();
    let schema = Schema::new(backend);

    let mut sessions = schema.create_table_from_entity(DebugSessionEntity);
    sessions.if_not_exists();
    db.execute(backend.build(&sessions)).await?;

    let mut records = schema.create_table_from_entity(CapturedRecordEntity);
    records.if_not_exists();
    db.execute(backend.build(&records)).await?;

    // One session per (tenant_id, user_id); NULL members are handled by the upsert
    let selector_index = Index::create()
        .name("idx_debug_sessions_selector")
        .table(DebugSessionEntity)
        .col(DebugSessionColumn::TenantId)
        .col(DebugSessionColumn::UserId)
        .unique()
        .if_not_exists()
        .to_owned();
    db.execute(backend.build(&selector_index)).await?;

    let expiry_index = Index::create()
        .name("idx_debug_sessions_active_expires")
        .table(DebugSessionEntity)
        .col(DebugSessionColumn::Active)
        .col(DebugSessionColumn::ExpiresAt)
        .if_not_exists()
        .to_owned();
    db.execute(backend.build(&expiry_index)).await?;

    for mut index in schema.create_index_from_entity(CapturedRecordEntity) {
        index.if_not_exists();
        db.execute(backend.build(&index)).await?;
    }

    let session_created_index = Index::create()
        .name("idx_captured_records_session_created")
        .table(CapturedRecordEntity)
        .col(CapturedRecordColumn::SessionId)
        .col(CapturedRecordColumn::CreatedAt)
        .if_not_exists()
        .to_owned();
    db.execute(backend.build(&session_created_index)).await?;

    info!("Database schema ready");
    Ok(())
}
