//! Cache substrate for session lookups
//!
//! Provides:
//! - A string keyed get/set-with-TTL/delete interface
//! - Redis implementation for shared deployments
//! - In-process implementation for single nodes and tests

mod memory;

pub use memory::MemoryCache;

use crate::errors::{AppError, Result};
use async_trait::async_trait;
use redis::{aio::MultiplexedConnection, AsyncCommands, Client};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Key/value store with per-entry TTL
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;

    async fn delete(&self, key: &str) -> Result<()>;

    /// Atomically increment a counter without expiry, returning the new value
    async fn incr(&self, key: &str) -> Result<i64>;
}

/// Redis cache configuration
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Redis URL (redis://host:port)
    pub url: String,
    /// Key prefix for namespacing
    pub key_prefix: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            key_prefix: "debugtap".to_string(),
        }
    }
}

/// Redis cache client
pub struct RedisCache {
    connection: RwLock<MultiplexedConnection>,
    config: CacheConfig,
}

impl RedisCache {
    /// Create a new cache client
    pub async fn new(config: CacheConfig) -> Result<Self> {
        let client = Client::open(config.url.as_str()).map_err(|e| AppError::CacheError {
            message: format!("Failed to create Redis client: {}", e),
        })?;

        let connection = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| AppError::CacheError {
                message: format!("Failed to connect to Redis: {}", e),
            })?;

        Ok(Self {
            connection: RwLock::new(connection),
            config,
        })
    }

    /// Build a prefixed key
    fn key(&self, key: &str) -> String {
        format!("{}:{}", self.config.key_prefix, key)
    }

    /// Ping Redis to check connectivity
    pub async fn ping(&self) -> Result<()> {
        let mut conn = self.connection.write().await;
        redis::cmd("PING")
            .query_async::<String>(&mut *conn)
            .await
            .map_err(|e| AppError::CacheError {
                message: format!("Redis ping failed: {}", e),
            })?;
        Ok(())
    }
}

#[async_trait]
impl CacheStore for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let full_key = self.key(key);
        let mut conn = self.connection.write().await;

        let value: Option<String> = conn.get(&full_key).await.map_err(|e| AppError::CacheError {
            message: format!("Failed to get key '{}': {}", full_key, e),
        })?;

        debug!(key = %full_key, hit = value.is_some(), "Cache get");
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let full_key = self.key(key);
        let ttl_secs = ttl.as_secs().max(1);
        let mut conn = self.connection.write().await;

        conn.set_ex::<_, _, ()>(&full_key, value, ttl_secs)
            .await
            .map_err(|e| AppError::CacheError {
                message: format!("Failed to set key '{}': {}", full_key, e),
            })?;

        debug!(key = %full_key, ttl_secs, "Cache set");
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let full_key = self.key(key);
        let mut conn = self.connection.write().await;

        let deleted: i32 = conn.del(&full_key).await.map_err(|e| AppError::CacheError {
            message: format!("Failed to delete key '{}': {}", full_key, e),
        })?;

        debug!(key = %full_key, deleted = deleted > 0, "Cache delete");
        Ok(())
    }

    async fn incr(&self, key: &str) -> Result<i64> {
        let full_key = self.key(key);
        let mut conn = self.connection.write().await;

        conn.incr(&full_key, 1).await.map_err(|e| AppError::CacheError {
            message: format!("Failed to increment key '{}': {}", full_key, e),
        })
    }
}

/// Redis when a URL is configured, otherwise an in-process map
pub async fn connect(redis: &crate::config::RedisConfig) -> Result<Arc<dyn CacheStore>> {
    match &redis.url {
        Some(url) => {
            let cache = RedisCache::new(CacheConfig {
                url: url.clone(),
                key_prefix: redis.key_prefix.clone(),
            })
            .await?;
            cache.ping().await?;
            info!("Session cache backed by Redis");
            Ok(Arc::new(cache))
        }
        None => {
            info!("No Redis URL configured, session cache is in-process");
            Ok(Arc::new(MemoryCache::new()))
        }
    }
}
