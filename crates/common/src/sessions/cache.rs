//! TTL-memoized session lookups with explicit invalidation
//!
//! Negative lookups are cached too. Context entries are namespaced by an
//! epoch counter that every session mutation bumps, since a tenant-only
//! session may be cached under any number of `(tenant, user)` contexts.

use crate::cache::CacheStore;
use crate::db::models::DebugSession;
use crate::errors::Result;
use crate::metrics;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Cache key builders
pub mod keys {
    /// Counter namespacing every context entry
    pub const CONTEXT_EPOCH: &str = "session:ctx_epoch";

    pub fn token(token: &str) -> String {
        format!("session:token:{}", token)
    }

    pub fn global() -> String {
        "session:global".to_string()
    }

    /// The user part never contains ':' so tenant ids cannot collide with it
    pub fn context(epoch: i64, tenant: Option<&str>, user: Option<i64>) -> String {
        let user = user.map_or_else(|| "none".to_string(), |u| u.to_string());
        let tenant = tenant.map_or_else(|| "none".to_string(), |t| format!("={}", t));
        format!("session:ctx:{}:{}:{}", epoch, user, tenant)
    }
}

/// Stored wrapper so that "no session" is a cacheable value
#[derive(Debug, Serialize, Deserialize)]
struct CachedLookup {
    session: Option<DebugSession>,
}

#[derive(Clone)]
pub struct SessionCache {
    store: Arc<dyn CacheStore>,
    ttl: Duration,
}

impl SessionCache {
    pub fn new(store: Arc<dyn CacheStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Cached value under `key`, or the loader's result stored for one TTL.
    ///
    /// Read failures propagate. Write failures are logged and the loaded
    /// value is still returned.
    pub async fn remember<F, Fut>(&self, key: &str, loader: F) -> Result<Option<DebugSession>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<DebugSession>>>,
    {
        if let Some(raw) = self.store.get(key).await? {
            match serde_json::from_str::<CachedLookup>(&raw) {
                Ok(cached) => {
                    metrics::record_cache(true, "session");
                    debug!(key, found = cached.session.is_some(), "Session cache hit");
                    return Ok(cached.session);
                }
                Err(e) => warn!(key, error = %e, "Discarding unreadable session cache entry"),
            }
        }

        metrics::record_cache(false, "session");
        let session = loader().await?;

        match serde_json::to_string(&CachedLookup {
            session: session.clone(),
        }) {
            Ok(json) => {
                if let Err(e) = self.store.set(key, &json, self.ttl).await {
                    warn!(key, error = %e, "Failed to cache session lookup, continuing without cache");
                }
            }
            Err(e) => warn!(key, error = %e, "Failed to serialize session lookup"),
        }

        Ok(session)
    }

    /// Current context epoch; a missing counter reads as zero
    pub async fn context_epoch(&self) -> Result<i64> {
        Ok(self
            .store
            .get(keys::CONTEXT_EPOCH)
            .await?
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(0))
    }

    /// Drop every entry that may hold `session`.
    ///
    /// Failures are logged; the affected entries then age out within one TTL.
    pub async fn invalidate(&self, session: &DebugSession) {
        self.delete_logged(&keys::token(&session.token)).await;

        if session.is_global() {
            self.delete_logged(&keys::global()).await;
        }

        match self.context_epoch().await {
            Ok(epoch) => {
                let key = keys::context(epoch, session.tenant_id.as_deref(), session.user_id);
                self.delete_logged(&key).await;
            }
            Err(e) => warn!(error = %e, "Failed to read context epoch during invalidation"),
        }

        self.invalidate_contexts().await;
        debug!(session_id = session.id, "Session cache invalidated");
    }

    /// Retire every cached context lookup at once
    pub async fn invalidate_contexts(&self) {
        if let Err(e) = self.store.incr(keys::CONTEXT_EPOCH).await {
            warn!(error = %e, "Failed to bump context epoch");
        }
    }

    async fn delete_logged(&self, key: &str) {
        if let Err(e) = self.store.delete(key).await {
            warn!(key, error = %e, "Failed to delete session cache entry");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::test_support::{session_model, FailingCache};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn cache() -> SessionCache {
        SessionCache::new(Arc::new(MemoryCache::new()), Duration::from_secs(60))
    }

    #[test]
    fn test_context_keys_are_distinct() {
        assert_ne!(keys::context(0, Some("a"), None), keys::context(0, None, None));
        assert_ne!(keys::context(0, Some("none"), None), keys::context(0, None, None));
        assert_ne!(keys::context(0, Some("x:5"), None), keys::context(0, Some("x"), Some(5)));
        assert_ne!(keys::context(1, Some("a"), Some(1)), keys::context(2, Some("a"), Some(1)));
    }

    #[tokio::test]
    async fn test_negative_lookup_is_cached() {
        let cache = cache();
        let calls = AtomicUsize::new(0);

        for _ in 0..3 {
            let found = cache
                .remember("k", || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(None)
                })
                .await
                .unwrap();
            assert!(found.is_none());
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_invalidate_clears_token_and_bumps_epoch() {
        let cache = cache();
        let session = session_model(1, None, None);

        let token_key = keys::token(&session.token);
        cache
            .remember(&token_key, || async { Ok(Some(session_model(1, None, None))) })
            .await
            .unwrap();
        let before = cache.context_epoch().await.unwrap();

        cache.invalidate(&session).await;

        assert_eq!(cache.context_epoch().await.unwrap(), before + 1);
        let reloaded = cache.remember(&token_key, || async { Ok(None) }).await.unwrap();
        assert!(reloaded.is_none());
    }

    #[tokio::test]
    async fn test_read_failure_propagates() {
        let cache = SessionCache::new(Arc::new(FailingCache), Duration::from_secs(60));
        let result = cache.remember("k", || async { Ok(None) }).await;
        assert!(result.is_err());
    }
}
