//! Capture middleware
//!
//! Wraps downstream handlers. For requests matched to a debug session it
//! keeps a bounded copy of both bodies, snapshots the exchange and persists
//! it, inline or via a job queue. The client always gets the handler's own
//! response, and a handler panic is resumed unchanged after being recorded.
//!
//! Response bodies of a small known length are already in memory and are
//! persisted before the response is returned. Anything else is streamed to
//! the client as it is produced and persisted once the body ends or is
//! dropped.

mod body;

use crate::capture::{
    build_record, capture_failure, capture_request, capture_response,
    synthetic_failure_response, CaptureTiming, CapturedBody, ExceptionSnapshot,
    RequestSnapshot, ResponseSnapshot,
};
use crate::config::{CaptureDriver, DebuggerConfig};
use crate::db::Repository;
use crate::errors::{HandlerFailure, Result};
use crate::metrics;
use crate::queue::{CaptureJob, JobQueue};
use crate::redact::Redactor;
use crate::resolver::{RequestContext, RouteFilter, SessionResolver, TenancyDetector};
use axum::body::{Body, Bytes};
use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;
use body::{read_prefix, TeeBody};
use futures::FutureExt;
use http_body::Body as _;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, warn};

/// Largest known-length response body that is read in full before returning
const BUFFERED_RESPONSE_LIMIT: u64 = 1024 * 1024;

/// Where captured exchanges go
#[derive(Clone)]
pub enum CaptureSink {
    /// Insert before the response is returned
    Inline(Repository),
    /// Hand off to a queue consumer
    Queue(Arc<dyn JobQueue>),
}

impl CaptureSink {
    fn driver(&self) -> &'static str {
        match self {
            CaptureSink::Inline(_) => CaptureDriver::Inline.as_str(),
            CaptureSink::Queue(_) => CaptureDriver::Queue.as_str(),
        }
    }
}

struct CaptureInner {
    enabled: bool,
    resolver: SessionResolver,
    routes: RouteFilter,
    redactor: Redactor,
    detector: Option<Arc<dyn TenancyDetector>>,
    sink: CaptureSink,
}

/// Middleware state, cheap to clone
#[derive(Clone)]
pub struct CaptureState {
    inner: Arc<CaptureInner>,
}

impl CaptureState {
    pub fn new(
        config: &DebuggerConfig,
        resolver: SessionResolver,
        detector: Option<Arc<dyn TenancyDetector>>,
        sink: CaptureSink,
    ) -> Result<Self> {
        Ok(Self {
            inner: Arc::new(CaptureInner {
                enabled: config.enabled,
                resolver,
                routes: RouteFilter::new(&config.routes)?,
                redactor: Redactor::new(&config.redact, &config.body),
                detector,
                sink,
            }),
        })
    }

    async fn persist(
        &self,
        session_id: i64,
        request: RequestSnapshot,
        response: ResponseSnapshot,
        exception: Option<ExceptionSnapshot>,
    ) {
        let started = Instant::now();
        let sink = &self.inner.sink;

        let result = match sink {
            CaptureSink::Inline(repo) => {
                match build_record(session_id, &request, &response, exception.as_ref()) {
                    Ok(record) => repo.insert_record(record).await.map(|_| ()),
                    Err(e) => Err(e),
                }
            }
            CaptureSink::Queue(queue) => {
                queue
                    .enqueue(CaptureJob {
                        session_id,
                        request,
                        response,
                        exception,
                    })
                    .await
            }
        };

        let elapsed = started.elapsed().as_secs_f64();
        match result {
            Ok(()) => {
                metrics::record_capture(sink.driver(), true, elapsed);
                debug!(session_id, driver = sink.driver(), "Exchange captured");
            }
            Err(e) => {
                metrics::record_capture(sink.driver(), false, elapsed);
                error!(session_id, driver = sink.driver(), error = %e, "Failed to store captured exchange");
            }
        }
    }
}

/// Body that fails with `err` on first poll
fn failing_body(err: axum::Error) -> Body {
    Body::from_stream(futures::stream::once(async move { Err::<Bytes, _>(err) }))
}

/// `axum::middleware::from_fn_with_state` entry point
pub async fn capture_middleware(
    State(state): State<CaptureState>,
    request: Request,
    next: Next,
) -> Response {
    let timing = CaptureTiming::start();
    let inner = &state.inner;
    if !inner.enabled || !inner.routes.allows(request.uri().path()) {
        return next.run(request).await;
    }

    let (parts, body) = request.into_parts();
    let ctx = RequestContext::from_parts(&parts, inner.detector.as_deref());
    let Some(session) = inner.resolver.resolve(&ctx).await else {
        return next.run(Request::from_parts(parts, body)).await;
    };

    let limit = inner.redactor.capture_limit();
    let (captured, body) = match read_prefix(body, limit, &parts.headers).await {
        Ok(read) => read,
        Err(e) => {
            warn!(session_id = session.id, error = %e, "Unreadable request body, not capturing");
            return next.run(Request::from_parts(parts, failing_body(e))).await;
        }
    };

    let request_snapshot = capture_request(&parts, &captured, &ctx, &inner.redactor, &timing);
    let request = Request::from_parts(parts, body);

    match AssertUnwindSafe(next.run(request)).catch_unwind().await {
        Ok(response) => {
            let (parts, body) = response.into_parts();
            let exception = parts.extensions.get::<HandlerFailure>().map(capture_failure);

            let buffered = body
                .size_hint()
                .exact()
                .is_some_and(|len| len <= BUFFERED_RESPONSE_LIMIT);
            if !buffered {
                let (tee, done) = TeeBody::new(body, limit);
                let status = parts.status;
                let headers = parts.headers.clone();
                let state = state.clone();
                let session_id = session.id;

                tokio::spawn(async move {
                    let Ok(captured) = done.await else {
                        return;
                    };
                    let response_snapshot = capture_response(
                        status,
                        &headers,
                        &captured,
                        &timing,
                        &state.inner.redactor,
                    );
                    state
                        .persist(session_id, request_snapshot, response_snapshot, exception)
                        .await;
                });

                return Response::from_parts(parts, Body::new(tee));
            }

            let bytes = match axum::body::to_bytes(body, usize::MAX).await {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!(session_id = session.id, error = %e, "Unreadable response body, not capturing");
                    return Response::from_parts(parts, failing_body(e));
                }
            };

            let response_snapshot = capture_response(
                parts.status,
                &parts.headers,
                &CapturedBody::full(bytes.clone()),
                &timing,
                &inner.redactor,
            );
            state
                .persist(session.id, request_snapshot, response_snapshot, exception)
                .await;

            Response::from_parts(parts, Body::from(bytes))
        }
        Err(payload) => {
            let failure = HandlerFailure::from_panic(&*payload);
            warn!(session_id = session.id, message = %failure.message, "Handler panicked during capture");

            state
                .persist(
                    session.id,
                    request_snapshot,
                    synthetic_failure_response(&timing),
                    Some(capture_failure(&failure)),
                )
                .await;

            std::panic::resume_unwind(payload)
        }
    }
}
