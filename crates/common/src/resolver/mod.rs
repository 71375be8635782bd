//! Per-request session resolution
//!
//! Decides whether, and under which session, a request is captured:
//! an explicit debug token first, then a global session, then the most
//! recent session matching the request's tenant and/or user. Every step
//! goes through the session cache. Faults resolve to "not captured".

use crate::config::{RouteSettings, TenancySettings};
use crate::db::filters;
use crate::db::models::DebugSession;
use crate::db::Repository;
use crate::errors::{AppError, Result};
use crate::metrics;
use crate::sessions::{keys, SessionCache};
use axum::extract::Query;
use axum::http::{request, HeaderName};
use chrono::Utc;
use regex_lite::Regex;
use sea_orm::Condition;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Header carrying an explicit debug token
pub const TOKEN_HEADER: &str = "x-debug-token";

/// Query parameter carrying an explicit debug token
pub const TOKEN_QUERY_PARAM: &str = "_debug_token";

/// Authenticated user id, inserted as a request extension by the auth layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthenticatedUser(pub i64);

/// Finds the tenant a request belongs to
pub trait TenancyDetector: Send + Sync {
    fn detect(&self, parts: &request::Parts) -> Option<String>;
}

/// Reads the tenant id from a request header
#[derive(Debug, Clone)]
pub struct HeaderTenancyDetector {
    header: HeaderName,
}

impl HeaderTenancyDetector {
    pub fn new(header: &str) -> Result<Self> {
        let header = HeaderName::from_bytes(header.as_bytes()).map_err(|e| {
            AppError::Configuration {
                message: format!("Invalid tenancy header '{}': {}", header, e),
            }
        })?;
        Ok(Self { header })
    }
}

impl TenancyDetector for HeaderTenancyDetector {
    fn detect(&self, parts: &request::Parts) -> Option<String> {
        parts
            .headers
            .get(&self.header)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    }
}

/// Always reports the same tenant
#[derive(Debug, Clone, Default)]
pub struct StaticTenancyDetector(pub Option<String>);

impl TenancyDetector for StaticTenancyDetector {
    fn detect(&self, _parts: &request::Parts) -> Option<String> {
        self.0.clone()
    }
}

/// Build the configured detector; `None` when tenancy is switched off
pub fn tenancy_detector(settings: &TenancySettings) -> Result<Option<Arc<dyn TenancyDetector>>> {
    if !settings.enabled {
        return Ok(None);
    }
    Ok(Some(Arc::new(HeaderTenancyDetector::new(&settings.header)?)))
}

/// Identifiers a request presents for session matching
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestContext {
    pub token: Option<String>,
    pub tenant_id: Option<String>,
    pub user_id: Option<i64>,
}

impl RequestContext {
    /// Token from header or query (header wins), tenant from the detector,
    /// user from the `AuthenticatedUser` extension
    pub fn from_parts(parts: &request::Parts, detector: Option<&dyn TenancyDetector>) -> Self {
        let header_token = parts
            .headers
            .get(TOKEN_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string);

        let token = header_token.or_else(|| {
            Query::<HashMap<String, String>>::try_from_uri(&parts.uri)
                .ok()
                .and_then(|Query(mut params)| params.remove(TOKEN_QUERY_PARAM))
                .filter(|t| !t.is_empty())
        });

        Self {
            token,
            tenant_id: detector.and_then(|d| d.detect(parts)),
            user_id: parts.extensions.get::<AuthenticatedUser>().map(|u| u.0),
        }
    }
}

#[derive(Clone)]
pub struct SessionResolver {
    repo: Repository,
    cache: SessionCache,
}

impl SessionResolver {
    pub fn new(repo: Repository, cache: SessionCache) -> Self {
        Self { repo, cache }
    }

    /// The session this request should be captured under, if any
    pub async fn resolve(&self, ctx: &RequestContext) -> Option<DebugSession> {
        match self.try_resolve(ctx).await {
            Ok(Some((step, session))) => {
                metrics::record_resolution(step);
                debug!(session_id = session.id, step, "Request matched debug session");
                Some(session)
            }
            Ok(None) => {
                metrics::record_resolution("none");
                None
            }
            Err(e) => {
                metrics::record_resolution("error");
                warn!(error = %e, "Session resolution failed, request not captured");
                None
            }
        }
    }

    async fn try_resolve(
        &self,
        ctx: &RequestContext,
    ) -> Result<Option<(&'static str, DebugSession)>> {
        let now = Utc::now();

        if let Some(token) = ctx.token.as_deref() {
            let condition = Condition::all()
                .add(filters::session_with_token(token))
                .add(filters::session_active_at(now));
            let found = self
                .cache
                .remember(&keys::token(token), || self.repo.first_session(condition))
                .await?;
            if let Some(session) = found.filter(|s| s.is_active_at(now)) {
                return Ok(Some(("token", session)));
            }
        }

        let condition = Condition::all()
            .add(filters::session_global())
            .add(filters::session_active_at(now));
        let found = self
            .cache
            .remember(&keys::global(), || self.repo.first_session(condition))
            .await?;
        if let Some(session) = found.filter(|s| s.is_active_at(now)) {
            return Ok(Some(("global", session)));
        }

        let tenant = ctx.tenant_id.as_deref();
        let Some(context) = filters::session_context_match(tenant, ctx.user_id) else {
            return Ok(None);
        };

        let epoch = self.cache.context_epoch().await?;
        let condition = Condition::all()
            .add(context)
            .add(filters::session_active_at(now));
        let found = self
            .cache
            .remember(&keys::context(epoch, tenant, ctx.user_id), || {
                self.repo.first_session(condition)
            })
            .await?;

        Ok(found
            .filter(|s| s.is_active_at(now))
            .map(|session| ("context", session)))
    }
}

/// Path globs deciding which requests are eligible for capture.
///
/// `*` matches any run of characters; everything else is literal. Matching
/// is anchored and case-insensitive, against the path without its leading
/// slash.
#[derive(Debug, Clone)]
pub struct RouteFilter {
    include: Vec<Regex>,
    exclude: Vec<Regex>,
}

impl RouteFilter {
    pub fn new(settings: &RouteSettings) -> Result<Self> {
        Ok(Self {
            include: compile_all(&settings.include)?,
            exclude: compile_all(&settings.exclude)?,
        })
    }

    /// Exclusions win; a non-empty include list must also match
    pub fn allows(&self, path: &str) -> bool {
        let path = path.trim_start_matches('/');

        if self.exclude.iter().any(|re| re.is_match(path)) {
            return false;
        }
        self.include.is_empty() || self.include.iter().any(|re| re.is_match(path))
    }
}

fn compile_all(patterns: &[String]) -> Result<Vec<Regex>> {
    patterns.iter().map(|p| compile_glob(p)).collect()
}

fn compile_glob(pattern: &str) -> Result<Regex> {
    let body = pattern
        .trim_start_matches('/')
        .split('*')
        .map(regex_lite::escape)
        .collect::<Vec<_>>()
        .join(".*");

    Regex::new(&format!("(?i)^{}$", body)).map_err(|e| AppError::Configuration {
        message: format!("Invalid route pattern '{}': {}", pattern, e),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sessions::Selector;
    use crate::test_support::{session_model, FailingCache, TestEnv};
    use axum::http::Request;
    use chrono::Duration;
    use std::time::Duration as StdDuration;

    fn resolver(env: &TestEnv) -> SessionResolver {
        SessionResolver::new(env.repo.clone(), env.cache.clone())
    }

    fn ctx(token: Option<&str>, tenant: Option<&str>, user: Option<i64>) -> RequestContext {
        RequestContext {
            token: token.map(str::to_string),
            tenant_id: tenant.map(str::to_string),
            user_id: user,
        }
    }

    #[tokio::test]
    async fn test_token_wins_over_global() {
        let env = TestEnv::new().await;
        env.sessions.enable_global(None, None).await.unwrap();
        let scoped = env.sessions.enable_for_user(42, None, None).await.unwrap();

        let found = resolver(&env)
            .resolve(&ctx(Some(&scoped.token), None, None))
            .await
            .unwrap();
        assert_eq!(found.id, scoped.id);
    }

    #[tokio::test]
    async fn test_token_wins_over_context_match_on_another_tenant() {
        let env = TestEnv::new().await;
        let acme = env.sessions.enable_for_tenant("acme", None, None).await.unwrap();
        let beta = env.sessions.enable_for_tenant("beta", None, None).await.unwrap();
        let resolver = resolver(&env);

        let found = resolver
            .resolve(&ctx(Some(&acme.token), Some("beta"), None))
            .await
            .unwrap();
        assert_eq!(found.id, acme.id);

        let found = resolver.resolve(&ctx(None, Some("beta"), None)).await.unwrap();
        assert_eq!(found.id, beta.id);
    }

    #[tokio::test]
    async fn test_unknown_token_falls_through() {
        let env = TestEnv::new().await;
        let global = env.sessions.enable_global(None, None).await.unwrap();

        let found = resolver(&env)
            .resolve(&ctx(Some("nope"), None, None))
            .await
            .unwrap();
        assert_eq!(found.id, global.id);
    }

    #[tokio::test]
    async fn test_context_prefers_newest_match() {
        let env = TestEnv::new().await;
        let resolver = resolver(&env);
        let tenant = env.sessions.enable_for_tenant("acme", None, None).await.unwrap();

        let found = resolver.resolve(&ctx(None, Some("acme"), Some(7))).await.unwrap();
        assert_eq!(found.id, tenant.id);

        tokio::time::sleep(StdDuration::from_millis(5)).await;
        let pair = env
            .sessions
            .enable_for_tenant_user("acme", 7, None, None)
            .await
            .unwrap();

        let found = resolver.resolve(&ctx(None, Some("acme"), Some(7))).await.unwrap();
        assert_eq!(found.id, pair.id);

        assert!(resolver.resolve(&ctx(None, Some("beta"), Some(8))).await.is_none());
    }

    #[tokio::test]
    async fn test_user_only_session_ignores_tenant_of_request() {
        let env = TestEnv::new().await;
        let user = env.sessions.enable_for_user(7, None, None).await.unwrap();

        let found = resolver(&env)
            .resolve(&ctx(None, Some("anything"), Some(7)))
            .await
            .unwrap();
        assert_eq!(found.id, user.id);
    }

    #[tokio::test]
    async fn test_stop_is_visible_immediately() {
        let env = TestEnv::new().await;
        let resolver = resolver(&env);
        let session = env.sessions.enable_for_tenant("acme", None, None).await.unwrap();

        assert!(resolver.resolve(&ctx(None, Some("acme"), None)).await.is_some());
        assert!(resolver.resolve(&ctx(None, Some("acme"), Some(3))).await.is_some());

        env.sessions.stop(session.id).await.unwrap();

        assert!(resolver.resolve(&ctx(None, Some("acme"), None)).await.is_none());
        assert!(resolver.resolve(&ctx(None, Some("acme"), Some(3))).await.is_none());
    }

    #[tokio::test]
    async fn test_expired_but_unswept_never_matches() {
        let env = TestEnv::new().await;
        let session = env
            .repo
            .upsert_session(
                &Selector::Global,
                Utc::now() - Duration::minutes(1),
                None,
                None,
            )
            .await
            .unwrap();
        assert!(session.active);

        assert!(resolver(&env).resolve(&RequestContext::default()).await.is_none());
    }

    #[tokio::test]
    async fn test_cached_session_rechecked_for_expiry() {
        let env = TestEnv::new().await;
        let mut stale = session_model(9, None, None);
        stale.expires_at = Utc::now() - Duration::seconds(1);

        env.cache
            .remember(&keys::global(), move || async move { Ok(Some(stale)) })
            .await
            .unwrap();

        assert!(resolver(&env).resolve(&RequestContext::default()).await.is_none());
    }

    #[tokio::test]
    async fn test_empty_context_skips_context_lookup() {
        let env = TestEnv::new().await;
        assert!(resolver(&env).resolve(&RequestContext::default()).await.is_none());

        // Only the negative global entry was written
        assert_eq!(env.store.len(), 1);
    }

    #[tokio::test]
    async fn test_cache_fault_fails_closed() {
        let env = TestEnv::new().await;
        env.sessions.enable_global(None, None).await.unwrap();

        let broken = SessionCache::new(Arc::new(FailingCache), StdDuration::from_secs(60));
        let resolver = SessionResolver::new(env.repo.clone(), broken);

        assert!(resolver.resolve(&RequestContext::default()).await.is_none());
    }

    #[test]
    fn test_context_from_parts() {
        let (mut parts, _) = Request::builder()
            .uri("/api/orders?_debug_token=fromquery")
            .header("X-Debug-Token", "fromheader")
            .header("X-Tenant-ID", "acme")
            .body(())
            .unwrap()
            .into_parts();
        parts.extensions.insert(AuthenticatedUser(5));

        let detector = HeaderTenancyDetector::new("X-Tenant-ID").unwrap();
        let ctx = RequestContext::from_parts(&parts, Some(&detector));

        assert_eq!(ctx.token.as_deref(), Some("fromheader"));
        assert_eq!(ctx.tenant_id.as_deref(), Some("acme"));
        assert_eq!(ctx.user_id, Some(5));

        let without_tenancy = RequestContext::from_parts(&parts, None);
        assert_eq!(without_tenancy.tenant_id, None);
    }

    #[test]
    fn test_empty_header_token_uses_query() {
        let (parts, _) = Request::builder()
            .uri("/api/orders?_debug_token=fromquery")
            .header("X-Debug-Token", "")
            .body(())
            .unwrap()
            .into_parts();

        let ctx = RequestContext::from_parts(&parts, None);
        assert_eq!(ctx.token.as_deref(), Some("fromquery"));
        assert_eq!(ctx.user_id, None);
    }

    #[test]
    fn test_static_detector() {
        let (parts, _) = Request::builder().uri("/").body(()).unwrap().into_parts();
        let detector = StaticTenancyDetector(Some("fixed".to_string()));
        assert_eq!(detector.detect(&parts).as_deref(), Some("fixed"));
    }

    #[test]
    fn test_default_route_exclusions() {
        let filter = RouteFilter::new(&RouteSettings::default()).unwrap();

        assert!(!filter.allows("/health"));
        assert!(!filter.allows("debug/sessions/1"));
        assert!(!filter.allows("/DEBUG/status"));
        assert!(filter.allows("/api/orders"));
        assert!(filter.allows("/healthz"));
    }

    #[test]
    fn test_include_list_limits_capture() {
        let filter = RouteFilter::new(&RouteSettings {
            include: vec!["api/*".to_string()],
            exclude: vec!["api/internal/*".to_string()],
        })
        .unwrap();

        assert!(filter.allows("/api/orders"));
        assert!(!filter.allows("/web/home"));
        assert!(!filter.allows("/api/internal/jobs"));
    }

    #[test]
    fn test_glob_escapes_regex_characters() {
        let filter = RouteFilter::new(&RouteSettings {
            include: vec!["v1.0/*".to_string()],
            exclude: Vec::new(),
        })
        .unwrap();

        assert!(filter.allows("v1.0/users"));
        assert!(!filter.allows("v1x0/users"));
    }
}
