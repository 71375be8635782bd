//! Capture job processor
//!
//! Persists queued captures. A job whose session has been deleted in the
//! meantime is dropped without error; a failing insert is retried with
//! exponential backoff up to the configured attempt count.

use crate::capture::build_record;
use crate::config::WorkerSettings;
use crate::db::Repository;
use crate::errors::{AppError, Result};
use crate::metrics;
use crate::queue::CaptureJob;
use backoff::future::retry;
use backoff::ExponentialBackoffBuilder;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, instrument, warn};

/// What happened to a processed job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    /// Inserted as the record with this id
    Stored(i64),
    /// Session no longer exists
    Discarded,
}

#[derive(Clone)]
pub struct CaptureWorker {
    repo: Repository,
    max_attempts: u32,
    initial_backoff: Duration,
}

impl CaptureWorker {
    pub fn new(repo: Repository, settings: &WorkerSettings) -> Self {
        Self::with_backoff(
            repo,
            settings.max_attempts,
            Duration::from_secs(settings.backoff_secs),
        )
    }

    pub fn with_backoff(repo: Repository, max_attempts: u32, initial_backoff: Duration) -> Self {
        Self {
            repo,
            max_attempts: max_attempts.max(1),
            initial_backoff,
        }
    }

    /// Persist one job, retrying transient failures
    #[instrument(skip(self, job), fields(session_id = job.session_id, request_id = %job.request.request_id))]
    pub async fn process(&self, job: CaptureJob) -> Result<JobOutcome> {
        let record = build_record(
            job.session_id,
            &job.request,
            &job.response,
            job.exception.as_ref(),
        )?;

        let policy = ExponentialBackoffBuilder::new()
            .with_initial_interval(self.initial_backoff)
            .with_max_elapsed_time(None)
            .build();
        let session_id = job.session_id;
        let attempts = AtomicU32::new(0);
        let attempts = &attempts;

        retry(policy, || {
            let record = record.clone();
            async move {
                let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
                let give_up = attempt >= self.max_attempts;
                let classify = |e: AppError| {
                    if give_up {
                        backoff::Error::permanent(e)
                    } else {
                        warn!(attempt, error = %e, "Capture insert failed, retrying");
                        backoff::Error::transient(e)
                    }
                };

                if self
                    .repo
                    .find_session(session_id)
                    .await
                    .map_err(classify)?
                    .is_none()
                {
                    debug!("Session gone, discarding capture job");
                    return Ok(JobOutcome::Discarded);
                }

                let stored = self.repo.insert_record(record).await.map_err(classify)?;
                Ok(JobOutcome::Stored(stored.id))
            }
        })
        .await
    }

    /// Drain an in-process channel until every sender is dropped
    pub async fn run(self, mut receiver: mpsc::Receiver<CaptureJob>) {
        info!("Capture worker started");

        while let Some(job) = receiver.recv().await {
            let session_id = job.session_id;
            match self.process(job).await {
                Ok(outcome) => {
                    metrics::record_job(true);
                    debug!(session_id, ?outcome, "Capture job processed");
                }
                Err(e) => {
                    metrics::record_job(false);
                    error!(session_id, error = %e, "Giving up on capture job");
                }
            }
        }

        info!("Capture worker stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{synthetic_failure_response, CaptureTiming, RequestSnapshot};
    use crate::queue::{ChannelJobQueue, JobQueue};
    use crate::test_support::TestEnv;
    use chrono::Utc;
    use sea_orm::Condition;

    fn job(session_id: i64) -> CaptureJob {
        CaptureJob {
            session_id,
            request: RequestSnapshot {
                request_id: uuid::Uuid::new_v4().to_string(),
                method: "POST".to_string(),
                url: "api/orders".to_string(),
                full_url: "http://localhost/api/orders".to_string(),
                route_name: Some("/api/orders".to_string()),
                route_action: None,
                request_headers: Default::default(),
                request_query: Default::default(),
                request_body: Some("{}".to_string()),
                request_content_type: Some("application/json".to_string()),
                request_size: 2,
                ip_address: None,
                user_agent: None,
                tenant_id: None,
                user_id: None,
                requested_at: Utc::now(),
            },
            response: synthetic_failure_response(&CaptureTiming::start()),
            exception: None,
        }
    }

    fn worker(env: &TestEnv) -> CaptureWorker {
        CaptureWorker::with_backoff(env.repo.clone(), 3, Duration::from_millis(1))
    }

    #[tokio::test]
    async fn test_process_stores_record() {
        let env = TestEnv::new().await;
        let session = env.sessions.enable_global(None, None).await.unwrap();

        let outcome = worker(&env).process(job(session.id)).await.unwrap();

        let JobOutcome::Stored(id) = outcome else {
            panic!("expected a stored record, got {:?}", outcome);
        };
        let record = env.repo.find_record(id).await.unwrap().unwrap();
        assert_eq!(record.session_id, session.id);
        assert_eq!(record.status_code, 500);
        assert_eq!(record.request_body.as_deref(), Some("{}"));
    }

    #[tokio::test]
    async fn test_missing_session_is_discarded() {
        let env = TestEnv::new().await;

        let outcome = worker(&env).process(job(999)).await.unwrap();

        assert_eq!(outcome, JobOutcome::Discarded);
        assert_eq!(env.repo.count_records(Condition::all()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_request_gives_up_after_attempts() {
        let env = TestEnv::new().await;
        let session = env.sessions.enable_global(None, None).await.unwrap();
        let worker = worker(&env);
        let first = job(session.id);

        worker.process(first.clone()).await.unwrap();
        assert!(worker.process(first).await.is_err());
        assert_eq!(env.repo.count_records(Condition::all()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_run_drains_channel() {
        let env = TestEnv::new().await;
        let session = env.sessions.enable_global(None, None).await.unwrap();
        let (queue, receiver) = ChannelJobQueue::new(8);

        queue.enqueue(job(session.id)).await.unwrap();
        queue.enqueue(job(session.id)).await.unwrap();
        drop(queue);

        worker(&env).run(receiver).await;
        assert_eq!(env.repo.count_records(Condition::all()).await.unwrap(), 2);
    }
}
