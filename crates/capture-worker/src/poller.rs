//! SQS message handling for capture jobs

use aws_sdk_sqs::types::Message;
use debugtap_common::{
    metrics,
    queue::{CaptureJob, SqsJobQueue},
    worker::JobOutcome,
    CaptureWorker,
};
use std::time::Duration;
use tracing::{debug, error, warn};

/// How a message was handled; either way it is deleted afterwards
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Stored, discarded along with its session, or unreadable
    Done,
    /// Still failing after every attempt the worker makes
    Abandoned,
}

/// Process one message.
///
/// The worker retries a failing insert with backoff up to its configured
/// attempts. After that, and for payloads that do not parse, the job is
/// dropped with an error log instead of being redelivered.
pub async fn handle_message(worker: &CaptureWorker, message: &Message) -> Disposition {
    let job: CaptureJob = match SqsJobQueue::parse_message(message) {
        Ok(job) => job,
        Err(e) => {
            error!(
                message_id = message.message_id().unwrap_or_default(),
                error = %e,
                "Dropping unreadable capture message"
            );
            metrics::record_job(false);
            return Disposition::Done;
        }
    };

    let session_id = job.session_id;
    match worker.process(job).await {
        Ok(JobOutcome::Stored(record_id)) => {
            metrics::record_job(true);
            debug!(session_id, record_id, "Capture stored");
            Disposition::Done
        }
        Ok(JobOutcome::Discarded) => {
            metrics::record_job(true);
            debug!(session_id, "Session gone, capture discarded");
            Disposition::Done
        }
        Err(e) => {
            metrics::record_job(false);
            error!(session_id, error = %e, "Giving up on capture job after retries");
            Disposition::Abandoned
        }
    }
}

/// Pauses polling after a run of consecutive failures
#[derive(Debug)]
pub struct CircuitBreaker {
    failures: u32,
    max_failures: u32,
    pause: Duration,
}

impl CircuitBreaker {
    pub fn new(max_failures: u32, pause: Duration) -> Self {
        Self {
            failures: 0,
            max_failures: max_failures.max(1),
            pause,
        }
    }

    pub fn record_success(&mut self) {
        self.failures = 0;
    }

    pub fn record_failure(&mut self) {
        self.failures += 1;
    }

    pub fn is_open(&self) -> bool {
        self.failures >= self.max_failures
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Sleep out the pause if open, then close
    pub async fn wait_if_open(&mut self) {
        if self.is_open() {
            warn!(failures = self.failures, "Circuit breaker open, pausing...");
            tokio::time::sleep(self.pause).await;
            self.failures = 0;
            debug!("Circuit breaker reset, resuming...");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use debugtap_common::capture::{synthetic_failure_response, CaptureTiming, RequestSnapshot};
    use debugtap_common::{DbPool, Repository, Selector};

    async fn worker() -> (CaptureWorker, Repository) {
        let repo = Repository::new(DbPool::in_memory().await.unwrap());
        (
            CaptureWorker::with_backoff(repo.clone(), 2, Duration::from_millis(1)),
            repo,
        )
    }

    fn job(session_id: i64) -> CaptureJob {
        CaptureJob {
            session_id,
            request: RequestSnapshot {
                request_id: uuid::Uuid::new_v4().to_string(),
                method: "DELETE".to_string(),
                url: "api/orders/3".to_string(),
                full_url: "http://localhost/api/orders/3".to_string(),
                route_name: Some("/api/orders/{id}".to_string()),
                route_action: Some("DELETE /api/orders/{id}".to_string()),
                request_headers: Default::default(),
                request_query: Default::default(),
                request_body: None,
                request_content_type: None,
                request_size: 0,
                ip_address: Some("10.0.0.8".to_string()),
                user_agent: None,
                tenant_id: Some("acme".to_string()),
                user_id: None,
                requested_at: Utc::now(),
            },
            response: synthetic_failure_response(&CaptureTiming::start()),
            exception: None,
        }
    }

    fn message(body: &str) -> Message {
        Message::builder()
            .message_id("m-1")
            .receipt_handle("r-1")
            .body(body)
            .build()
    }

    #[tokio::test]
    async fn test_stored_message_is_deleted() {
        let (worker, repo) = worker().await;
        let session = repo
            .upsert_session(
                &Selector::tenant("acme").unwrap(),
                Utc::now() + chrono::Duration::minutes(10),
                None,
                None,
            )
            .await
            .unwrap();

        let body = serde_json::to_string(&job(session.id)).unwrap();
        assert_eq!(handle_message(&worker, &message(&body)).await, Disposition::Done);

        let (records, total) = repo.list_records(session.id, 0, 10).await.unwrap();
        assert_eq!(total, 1);
        assert_eq!(records[0].ip_address.as_deref(), Some("10.0.0.8"));
    }

    #[tokio::test]
    async fn test_orphaned_and_malformed_messages_are_deleted() {
        let (worker, _repo) = worker().await;

        let orphan = serde_json::to_string(&job(404)).unwrap();
        assert_eq!(handle_message(&worker, &message(&orphan)).await, Disposition::Done);
        assert_eq!(handle_message(&worker, &message("not json")).await, Disposition::Done);
    }

    #[tokio::test]
    async fn test_insert_that_keeps_failing_is_abandoned() {
        let (worker, repo) = worker().await;
        let session = repo
            .upsert_session(
                &Selector::Global,
                Utc::now() + chrono::Duration::minutes(10),
                None,
                None,
            )
            .await
            .unwrap();

        // Same request id twice violates the unique index on every attempt
        let body = serde_json::to_string(&job(session.id)).unwrap();
        assert_eq!(handle_message(&worker, &message(&body)).await, Disposition::Done);
        assert_eq!(handle_message(&worker, &message(&body)).await, Disposition::Abandoned);

        let (_, total) = repo.list_records(session.id, 0, 10).await.unwrap();
        assert_eq!(total, 1);
    }

    #[tokio::test]
    async fn test_circuit_breaker() {
        let mut breaker = CircuitBreaker::new(2, Duration::from_millis(1));
        breaker.record_failure();
        assert!(!breaker.is_open());
        breaker.record_failure();
        assert!(breaker.is_open());

        breaker.wait_if_open().await;
        assert!(!breaker.is_open());
        assert_eq!(breaker.failures(), 0);

        breaker.record_failure();
        breaker.record_success();
        assert_eq!(breaker.failures(), 0);
    }
}
