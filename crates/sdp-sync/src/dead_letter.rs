//! Dead-letter queue and the operator-triggered reprocessor.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sdp_core::{causation, DocumentCreated, IntegrationEvent, MAX_ATTEMPTS};
use sdp_storage::StoreError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::bus::{DeliveryMode, Envelope, MessageBus};
use crate::config::DEFAULT_DEAD_LETTER_QUEUE;
use crate::store::{JobKind, JobQueue};

pub const MAX_REPROCESS_COUNT: u32 = 1_000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterMessage {
    pub message_type: String,
    /// The envelope exactly as it failed, possibly wrapped as `{ "message": ... }`.
    pub envelope: Value,
    pub error: String,
    pub attempt_count: u32,
    pub failed_utc: DateTime<Utc>,
}

impl DeadLetterMessage {
    pub fn from_envelope(envelope: &Envelope, error: impl Into<String>, attempt_count: u32) -> Self {
        Self {
            message_type: envelope.message_type.clone(),
            envelope: serde_json::to_value(envelope).unwrap_or(Value::Null),
            error: error.into(),
            attempt_count,
            failed_utc: Utc::now(),
        }
    }

    /// The original envelope, unwrapping a `message` wrapper when present.
    pub fn original(&self) -> Result<Envelope, serde_json::Error> {
        let inner = match self.envelope.get("message") {
            Some(message) if message.is_object() => message.clone(),
            _ => self.envelope.clone(),
        };
        serde_json::from_value(inner)
    }
}

#[async_trait]
pub trait DeadLetterQueue: Send + Sync {
    async fn push(&self, queue: &str, message: DeadLetterMessage) -> Result<(), StoreError>;

    /// Removes and returns at most `max` messages, oldest first.
    async fn pull(&self, queue: &str, max: usize) -> Result<Vec<DeadLetterMessage>, StoreError>;

    async fn depth(&self, queue: &str) -> Result<usize, StoreError>;
}

#[derive(Clone, Default)]
pub struct MemoryDeadLetterQueue {
    queues: Arc<Mutex<HashMap<String, Vec<DeadLetterMessage>>>>,
}

impl MemoryDeadLetterQueue {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DeadLetterQueue for MemoryDeadLetterQueue {
    async fn push(&self, queue: &str, message: DeadLetterMessage) -> Result<(), StoreError> {
        self.queues
            .lock()
            .await
            .entry(queue.to_string())
            .or_default()
            .push(message);
        Ok(())
    }

    async fn pull(&self, queue: &str, max: usize) -> Result<Vec<DeadLetterMessage>, StoreError> {
        let mut queues = self.queues.lock().await;
        let Some(messages) = queues.get_mut(queue) else {
            return Ok(Vec::new());
        };
        let take = max.min(messages.len());
        Ok(messages.drain(..take).collect())
    }

    async fn depth(&self, queue: &str) -> Result<usize, StoreError> {
        Ok(self.queues.lock().await.get(queue).map_or(0, Vec::len))
    }
}

#[derive(Debug, Error)]
pub enum ReprocessError {
    #[error("count must be between 1 and {MAX_REPROCESS_COUNT}, got {0}")]
    InvalidCount(u32),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReprocessRequest {
    pub count: u32,
    #[serde(default)]
    pub queue_name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReprocessReport {
    pub queue_name: String,
    pub requested: u32,
    pub requeued: usize,
    /// Messages that could neither be republished nor returned to the queue.
    pub unreturned: usize,
    pub errors: Vec<String>,
}

pub struct DeadLetterReprocessor {
    dlq: Arc<dyn DeadLetterQueue>,
    bus: Arc<dyn MessageBus>,
    jobs: Arc<dyn JobQueue>,
    default_queue: String,
}

impl DeadLetterReprocessor {
    pub fn new(
        dlq: Arc<dyn DeadLetterQueue>,
        bus: Arc<dyn MessageBus>,
        jobs: Arc<dyn JobQueue>,
        default_queue: Option<String>,
    ) -> Self {
        Self {
            dlq,
            bus,
            jobs,
            default_queue: default_queue
                .filter(|q| !q.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_DEAD_LETTER_QUEUE.to_string()),
        }
    }

    pub fn queue_name(&self, requested: Option<&str>) -> String {
        requested
            .map(str::trim)
            .filter(|q| !q.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| self.default_queue.clone())
    }

    /// Validates the request and queues the drain; returns the job id immediately.
    pub async fn reprocess(&self, request: ReprocessRequest) -> Result<Uuid, ReprocessError> {
        if request.count == 0 || request.count > MAX_REPROCESS_COUNT {
            return Err(ReprocessError::InvalidCount(request.count));
        }
        let queue_name = self.queue_name(request.queue_name.as_deref());
        let job_id = self
            .jobs
            .enqueue(
                JobKind::ReprocessDeadLetters {
                    count: request.count,
                    queue_name: Some(queue_name.clone()),
                },
                Utc::now(),
            )
            .await?;
        info!(%job_id, queue = %queue_name, count = request.count, "dead-letter reprocess queued");
        Ok(job_id)
    }

    /// Pulls at most `count` messages and republishes each directly to the bus.
    ///
    /// Only the pull can fail the drain, and nothing has moved by then, so a retried
    /// drain never republishes more than `count`. Messages whose republish fails go
    /// back to the queue once the whole batch has been tried.
    pub async fn drain(&self, count: u32, queue_name: Option<&str>) -> Result<ReprocessReport, StoreError> {
        let queue_name = self.queue_name(queue_name);
        let span = info_span!("dead_letter_drain", queue = %queue_name, count);
        async {
            let messages = self.dlq.pull(&queue_name, count as usize).await?;
            let mut report = ReprocessReport {
                queue_name: queue_name.clone(),
                requested: count,
                ..Default::default()
            };

            let mut unsent = Vec::new();
            for message in messages {
                match self.republish(&message).await {
                    Ok(()) => report.requeued += 1,
                    Err(err) => {
                        warn!(error = %err, message_type = %message.message_type, "dead-letter republish failed");
                        report.errors.push(err);
                        unsent.push(message);
                    }
                }
            }
            for message in unsent {
                if let Err(err) = self.dlq.push(&queue_name, message.clone()).await {
                    error!(
                        error = %err,
                        message_type = %message.message_type,
                        envelope = %message.envelope,
                        "dead-letter message could not be returned to its queue"
                    );
                    report.errors.push(err.to_string());
                    report.unreturned += 1;
                }
            }
            info!(
                requeued = report.requeued,
                unreturned = report.unreturned,
                errors = report.errors.len(),
                "dead-letter drain finished"
            );
            Ok(report)
        }
        .instrument(span)
        .await
    }

    async fn republish(&self, message: &DeadLetterMessage) -> Result<(), String> {
        let mut envelope = message.original().map_err(|e| e.to_string())?;
        if envelope.message_type == DocumentCreated::MESSAGE_TYPE {
            if let Some(body) = envelope.body.as_object_mut() {
                body.insert("attemptCount".into(), Value::from(MAX_ATTEMPTS - 1));
            }
        }
        envelope.message_id = Uuid::new_v4();
        envelope.causation_id = causation::DEAD_LETTER_REPROCESSOR;
        envelope.delivery = DeliveryMode::Direct;
        envelope.published_utc = Utc::now();
        self.bus.publish(envelope).await.map_err(|e| e.to_string())
    }
}
