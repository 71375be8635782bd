//! Demo identity layer
//!
//! Stands in for a real authentication layer: a numeric `X-User-Id` header
//! becomes an `AuthenticatedUser` extension, which is what the capture
//! pipeline reads to match user-scoped sessions.

use axum::{extract::Request, middleware::Next, response::Response};
use debugtap_common::AuthenticatedUser;

pub const USER_HEADER: &str = "x-user-id";

/// Attach the caller's user id when the header carries one
pub async fn identify_user(mut request: Request, next: Next) -> Response {
    let user = request
        .headers()
        .get(USER_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<i64>().ok());

    match user {
        Some(id) => {
            request.extensions_mut().insert(AuthenticatedUser(id));
        }
        None if request.headers().contains_key(USER_HEADER) => {
            tracing::debug!("Ignoring malformed X-User-Id header");
        }
        None => {}
    }

    next.run(request).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Body, middleware::from_fn, routing::get, Extension, Router};
    use tower::ServiceExt;

    async fn whoami(user: Option<Extension<AuthenticatedUser>>) -> String {
        match user {
            Some(Extension(AuthenticatedUser(id))) => id.to_string(),
            None => "anonymous".to_string(),
        }
    }

    async fn call(header: Option<&str>) -> String {
        let app = Router::new()
            .route("/", get(whoami))
            .layer(from_fn(identify_user));

        let mut request = Request::builder().uri("/");
        if let Some(value) = header {
            request = request.header(USER_HEADER, value);
        }

        let response = app
            .oneshot(request.body(Body::empty()).unwrap())
            .await
            .unwrap();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_numeric_header_sets_user() {
        assert_eq!(call(Some(" 42 ")).await, "42");
    }

    #[tokio::test]
    async fn test_missing_or_malformed_header_is_anonymous() {
        assert_eq!(call(None).await, "anonymous");
        assert_eq!(call(Some("alice")).await, "anonymous");
    }
}
