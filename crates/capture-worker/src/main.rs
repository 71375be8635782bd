//! debugtap Capture Worker
//!
//! Persists capture jobs from the SQS capture queue:
//! 1. Receives a batch of capture jobs
//! 2. Inserts each as a captured record (sessions deleted meanwhile are skipped)
//! 3. Deletes every handled message; jobs still failing after the worker's
//!    retries are logged and dropped

mod poller;

use crate::poller::{handle_message, CircuitBreaker, Disposition};
use anyhow::Context;
use debugtap_common::{
    config::AppConfig,
    db::{self, DbPool, Repository},
    metrics,
    queue::{SqsJobQueue, SqsQueueConfig},
    CaptureWorker, VERSION,
};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const MAX_FAILURES: u32 = 5;
const CIRCUIT_BREAK_DURATION: Duration = Duration::from_secs(30);
const RECEIVE_ERROR_DELAY: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let config = AppConfig::load().context("failed to load configuration")?;

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.observability.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);
    if config.observability.json_logging {
        builder.json().init();
    } else {
        builder.init();
    }

    info!("Starting debugtap capture worker v{}", VERSION);

    config.validate().map_err(|e| {
        error!(error = %e, "Invalid configuration");
        e
    })?;

    metrics::register_metrics();
    if config.observability.metrics_port != 0 {
        PrometheusBuilder::new()
            .with_http_listener(SocketAddr::from((
                [0, 0, 0, 0],
                config.observability.metrics_port,
            )))
            .install()
            .context("failed to install Prometheus exporter")?;
    }

    let Some(url) = config.queue.capture_queue_url.clone() else {
        warn!("queue.capture_queue_url not set, waiting for shutdown signal...");
        tokio::signal::ctrl_c().await?;
        info!("Capture worker shutting down");
        return Ok(());
    };

    // Initialize database connection
    info!("Connecting to database...");
    let db = DbPool::new(&config.database).await?;
    if config.database.auto_migrate {
        db::migrate(db.write()).await?;
    }

    let worker = CaptureWorker::new(Repository::new(db), &config.debugger.worker);

    info!(url = %url, "Connecting to capture queue...");
    let queue = SqsJobQueue::new(SqsQueueConfig::from_app(url, &config.queue)).await?;

    info!("Capture worker ready, starting queue polling...");
    let mut breaker = CircuitBreaker::new(MAX_FAILURES, CIRCUIT_BREAK_DURATION);

    loop {
        breaker.wait_if_open().await;

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
            result = queue.receive() => {
                match result {
                    Ok(messages) => {
                        for message in &messages {
                            match handle_message(&worker, message).await {
                                Disposition::Done => breaker.record_success(),
                                Disposition::Abandoned => breaker.record_failure(),
                            }
                            if let Some(receipt) = message.receipt_handle() {
                                if let Err(e) = queue.delete(receipt).await {
                                    error!(error = %e, "Failed to delete message");
                                }
                            }
                        }
                    }
                    Err(e) => {
                        breaker.record_failure();
                        error!(error = %e, "Failed to receive messages from queue");
                        tokio::time::sleep(RECEIVE_ERROR_DELAY).await;
                    }
                }
            }
        }
    }

    info!("Capture worker shutting down");
    Ok(())
}
