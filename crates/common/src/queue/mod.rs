//! Capture job hand-off
//!
//! Provides:
//! - The `CaptureJob` message
//! - SQS client wrapper for multi-process deployments
//! - In-process channel for single-node deployments and tests

use crate::capture::{ExceptionSnapshot, RequestSnapshot, ResponseSnapshot};
use crate::errors::{AppError, Result};
use async_trait::async_trait;
use aws_sdk_sqs::types::Message;
use aws_sdk_sqs::Client as SqsClient;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;

/// One captured exchange waiting to be persisted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureJob {
    pub session_id: i64,
    pub request: RequestSnapshot,
    pub response: ResponseSnapshot,
    pub exception: Option<ExceptionSnapshot>,
}

/// Destination for capture jobs
#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(&self, job: CaptureJob) -> Result<()>;
}

/// SQS queue configuration
#[derive(Debug, Clone)]
pub struct SqsQueueConfig {
    /// Queue URL
    pub url: String,
    /// Visibility timeout in seconds
    pub visibility_timeout: i32,
    /// Wait time for long polling (seconds)
    pub wait_time_seconds: i32,
    /// Maximum number of messages per poll
    pub max_messages: i32,
}

impl SqsQueueConfig {
    pub fn from_app(url: String, config: &crate::config::QueueConfig) -> Self {
        Self {
            url,
            visibility_timeout: config.visibility_timeout_secs,
            wait_time_seconds: config.poll_timeout_secs,
            max_messages: config.batch_size,
        }
    }
}

/// SQS Queue client wrapper
pub struct SqsJobQueue {
    client: SqsClient,
    config: SqsQueueConfig,
}

impl SqsJobQueue {
    /// Create a new queue client
    pub async fn new(config: SqsQueueConfig) -> Result<Self> {
        let aws_config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
        let client = SqsClient::new(&aws_config);

        Ok(Self { client, config })
    }

    /// Create with existing AWS client
    pub fn with_client(client: SqsClient, config: SqsQueueConfig) -> Self {
        Self { client, config }
    }

    /// Send a message to the queue
    pub async fn send<T: Serialize>(&self, message: &T) -> Result<String> {
        let body = serde_json::to_string(message).map_err(|e| AppError::QueueError {
            message: format!("Failed to serialize message: {}", e),
        })?;

        let result = self
            .client
            .send_message()
            .queue_url(&self.config.url)
            .message_body(&body)
            .send()
            .await
            .map_err(|e| AppError::QueueError {
                message: format!("Failed to send message: {}", e),
            })?;

        let message_id = result.message_id.unwrap_or_default();
        debug!(message_id = %message_id, "Message sent to queue");

        Ok(message_id)
    }

    /// Receive messages from the queue
    pub async fn receive(&self) -> Result<Vec<Message>> {
        let result = self
            .client
            .receive_message()
            .queue_url(&self.config.url)
            .max_number_of_messages(self.config.max_messages)
            .visibility_timeout(self.config.visibility_timeout)
            .wait_time_seconds(self.config.wait_time_seconds)
            .send()
            .await
            .map_err(|e| AppError::QueueError {
                message: format!("Failed to receive messages: {}", e),
            })?;

        let messages = result.messages.unwrap_or_default();
        debug!(count = messages.len(), "Received messages from queue");

        Ok(messages)
    }

    /// Delete a message after processing
    pub async fn delete(&self, receipt_handle: &str) -> Result<()> {
        self.client
            .delete_message()
            .queue_url(&self.config.url)
            .receipt_handle(receipt_handle)
            .send()
            .await
            .map_err(|e| AppError::QueueError {
                message: format!("Failed to delete message: {}", e),
            })?;

        debug!("Message deleted from queue");
        Ok(())
    }

    /// Parse message body as JSON
    pub fn parse_message<T: DeserializeOwned>(message: &Message) -> Result<T> {
        let body = message.body.as_ref().ok_or_else(|| AppError::QueueError {
            message: "Message has no body".to_string(),
        })?;

        serde_json::from_str(body).map_err(|e| AppError::QueueError {
            message: format!("Failed to parse message: {}", e),
        })
    }
}

#[async_trait]
impl JobQueue for SqsJobQueue {
    async fn enqueue(&self, job: CaptureJob) -> Result<()> {
        self.send(&job).await.map(|_| ())
    }
}

/// Bounded in-process queue; a full channel rejects instead of waiting
#[derive(Clone)]
pub struct ChannelJobQueue {
    sender: mpsc::Sender<CaptureJob>,
}

impl ChannelJobQueue {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<CaptureJob>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (Self { sender }, receiver)
    }
}

#[async_trait]
impl JobQueue for ChannelJobQueue {
    async fn enqueue(&self, job: CaptureJob) -> Result<()> {
        self.sender.try_send(job).map_err(|e| AppError::QueueError {
            message: format!("Failed to enqueue capture job: {}", e),
        })
    }
}
