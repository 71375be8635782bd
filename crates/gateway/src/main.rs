//! debugtap Gateway
//!
//! Hosts the captured API and the operator surface.
//! Handles:
//! - Capture middleware over the demo API
//! - JSON admin API for debug sessions and captured records
//! - Lifecycle scheduler (expiry and retention)
//! - In-process capture worker when the queue driver has no external queue
//!
//! `gateway prune` runs a single lifecycle pass and exits.

mod handlers;
mod middleware;

use anyhow::Context;
use axum::{
    middleware::{from_fn, from_fn_with_state},
    routing::{get, patch, post},
    Router,
};
use debugtap_common::{
    cache,
    config::{AppConfig, CaptureDriver, ObservabilityConfig},
    db::{self, DbPool, Repository},
    metrics,
    queue::{ChannelJobQueue, SqsJobQueue, SqsQueueConfig},
    resolver::tenancy_detector,
    capture_middleware, CaptureSink, CaptureState, CaptureWorker, LifecycleManager,
    SessionCache, SessionResolver, SessionService,
};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tower_http::{
    cors::{Any, CorsLayer},
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub db: DbPool,
    pub sessions: SessionService,
    pub lifecycle: LifecycleManager,
}

impl AppState {
    pub fn repository(&self) -> &Repository {
        self.sessions.repository()
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let config = AppConfig::load().context("failed to load configuration")?;
    init_tracing(&config.observability);

    config.validate().map_err(|e| {
        error!(error = %e, "Invalid configuration");
        e
    })?;
    let config = Arc::new(config);
    let debugger = Arc::new(config.debugger.clone());

    info!("Starting debugtap gateway v{}", debugtap_common::VERSION);

    metrics::register_metrics();
    install_metrics_exporter(config.observability.metrics_port)?;

    info!("Connecting to database...");
    let db = DbPool::new(&config.database).await?;
    if config.database.auto_migrate {
        db::migrate(db.write()).await?;
        info!("Database schema is up to date");
    }

    let session_cache = SessionCache::new(cache::connect(&config.redis).await?, debugger.cache_ttl());
    let repo = Repository::new(db.clone());
    let sessions = SessionService::new(repo.clone(), session_cache.clone(), debugger.clone());
    let lifecycle = LifecycleManager::new(repo.clone(), session_cache.clone(), debugger.clone());

    if std::env::args().nth(1).as_deref() == Some("prune") {
        let report = lifecycle.run_once().await;
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    let (sink, worker) = capture_sink(&config, repo.clone()).await?;
    let capture = CaptureState::new(
        &debugger,
        SessionResolver::new(repo, session_cache),
        tenancy_detector(&debugger.tenancy)?,
        sink,
    )?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scheduler = tokio::spawn(
        lifecycle
            .clone()
            .run(debugger.sweep_interval(), wait_for_shutdown(shutdown_rx)),
    );

    let state = AppState {
        config: config.clone(),
        db,
        sessions,
        lifecycle,
    };
    let app = create_router(state, capture).layer(TimeoutLayer::new(config.request_timeout()));

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .context("invalid server address")?;
    info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    // The router (and with it every queue sender) is gone; let background tasks finish
    let _ = shutdown_tx.send(true);
    let drain = async {
        if let Err(e) = scheduler.await {
            warn!(error = %e, "Lifecycle scheduler ended abnormally");
        }
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                warn!(error = %e, "Capture worker ended abnormally");
            }
        }
    };
    if tokio::time::timeout(config.shutdown_timeout(), drain).await.is_err() {
        warn!("Background tasks did not finish before the shutdown timeout");
    }

    info!("Server shutdown complete");
    Ok(())
}

/// Create the main application router
fn create_router(state: AppState, capture: CaptureState) -> Router {
    // CORS configuration
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // Request ID propagation
    let request_id = SetRequestIdLayer::x_request_id(MakeRequestUuid);
    let propagate_id = PropagateRequestIdLayer::x_request_id();

    // Demo API, the traffic debug sessions record
    let api_routes = Router::new()
        .route("/api/login", post(handlers::demo::login))
        .route(
            "/api/orders",
            get(handlers::demo::list_orders).post(handlers::demo::create_order),
        )
        .route("/api/orders/{id}", get(handlers::demo::get_order))
        .route_layer(from_fn_with_state(capture, capture_middleware));

    // Admin API
    let debug_routes = Router::new()
        .route(
            "/sessions",
            get(handlers::sessions::list_sessions).post(handlers::sessions::create_session),
        )
        .route("/sessions/disable", post(handlers::sessions::disable_sessions))
        .route(
            "/sessions/{id}",
            get(handlers::sessions::get_session).delete(handlers::sessions::delete_session),
        )
        .route("/sessions/{id}/extend", patch(handlers::sessions::extend_session))
        .route("/sessions/{id}/stop", patch(handlers::sessions::stop_session))
        .route(
            "/sessions/{id}/records",
            get(handlers::records::list_records).delete(handlers::records::clear_records),
        )
        .route(
            "/records/{id}",
            get(handlers::records::get_record).delete(handlers::records::delete_record),
        )
        .route("/status", get(handlers::admin::status))
        .route("/prune", post(handlers::admin::prune));

    Router::new()
        // Health endpoints
        .route("/health", get(handlers::health::health))
        .route("/ready", get(handlers::health::ready))
        .merge(api_routes)
        .nest("/debug", debug_routes)
        .layer(from_fn(middleware::identity::identify_user))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .layer(request_id)
        .layer(propagate_id)
        .with_state(state)
}

fn init_tracing(observability: &ObservabilityConfig) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&observability.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);

    if observability.json_logging {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Serve Prometheus metrics on their own port; 0 disables the exporter
fn install_metrics_exporter(port: u16) -> anyhow::Result<()> {
    if port == 0 {
        info!("Metrics exporter disabled");
        return Ok(());
    }

    PrometheusBuilder::new()
        .with_http_listener(SocketAddr::from(([0, 0, 0, 0], port)))
        .set_buckets_for_metric(
            Matcher::Full(format!("{}_capture_persist_seconds", metrics::METRICS_PREFIX)),
            metrics::CAPTURE_BUCKETS,
        )?
        .install()
        .context("failed to install Prometheus exporter")?;

    info!(port, "Metrics exporter listening");
    Ok(())
}

/// Pick where captures go; the channel driver also starts its worker
async fn capture_sink(
    config: &AppConfig,
    repo: Repository,
) -> anyhow::Result<(CaptureSink, Option<JoinHandle<()>>)> {
    match config.debugger.driver {
        CaptureDriver::Inline => Ok((CaptureSink::Inline(repo), None)),
        CaptureDriver::Queue => match &config.queue.capture_queue_url {
            Some(url) => {
                let queue =
                    SqsJobQueue::new(SqsQueueConfig::from_app(url.clone(), &config.queue)).await?;
                info!(queue_url = %url, "Captures go to SQS");
                Ok((CaptureSink::Queue(Arc::new(queue)), None))
            }
            None => {
                let (queue, receiver) = ChannelJobQueue::new(config.queue.channel_capacity);
                let worker = CaptureWorker::new(repo, &config.debugger.worker);
                info!(
                    capacity = config.queue.channel_capacity,
                    "Captures go to the in-process worker"
                );
                Ok((
                    CaptureSink::Queue(Arc::new(queue)),
                    Some(tokio::spawn(worker.run(receiver))),
                ))
            }
        },
    }
}

async fn wait_for_shutdown(mut rx: watch::Receiver<bool>) {
    // A dropped sender also means shutdown
    let _ = rx.wait_for(|stop| *stop).await;
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, starting shutdown..."),
        _ = terminate => info!("Received SIGTERM, starting shutdown..."),
    }
}
