//! Bus consumer: runs processors for `DocumentCreated`, turns `DocumentRequested`
//! into on-demand crawls, and owns retry and dead-lettering.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use sdp_core::{
    causation, DocumentCreated, DocumentRequested, IntegrationEvent, ProcessImageResponse,
    MAX_ATTEMPTS,
};
use sdp_processors::{
    ImageOutcome, ProcessDocumentCommand, ProcessOutcome, ProcessingError, ProcessorRouter,
};
use sdp_storage::StoreError;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::bus::{BusError, DeliveryMode, Envelope, MessageBus};
use crate::dead_letter::{DeadLetterMessage, DeadLetterQueue};
use crate::store::{CrawlTask, JobKind, JobQueue, ON_DEMAND_RESOURCE_INDEX};

#[derive(Debug, Error)]
pub enum ConsumerError {
    #[error(transparent)]
    Bus(#[from] BusError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Processing(#[from] ProcessingError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsumeOutcome {
    Processed(ProcessOutcome),
    ImageApplied(ImageOutcome),
    Retried { attempt: u32 },
    DeadLettered,
    CrawlQueued(Uuid),
    Ignored,
}

pub struct DocumentConsumer {
    router: ProcessorRouter,
    bus: Arc<dyn MessageBus>,
    dlq: Arc<dyn DeadLetterQueue>,
    jobs: Arc<dyn JobQueue>,
    queue_name: String,
    max_depth: u32,
}

impl DocumentConsumer {
    pub fn new(
        router: ProcessorRouter,
        bus: Arc<dyn MessageBus>,
        dlq: Arc<dyn DeadLetterQueue>,
        jobs: Arc<dyn JobQueue>,
        queue_name: impl Into<String>,
        max_depth: u32,
    ) -> Self {
        Self {
            router,
            bus,
            dlq,
            jobs,
            queue_name: queue_name.into(),
            max_depth,
        }
    }

    pub async fn handle(&self, envelope: Envelope) -> Result<ConsumeOutcome, ConsumerError> {
        let span = info_span!(
            "consume",
            message_type = %envelope.message_type,
            message_id = %envelope.message_id,
            correlation_id = %envelope.correlation_id
        );
        async {
            if envelope.is::<DocumentCreated>() {
                self.document_created(envelope).await
            } else if envelope.is::<DocumentRequested>() {
                self.document_requested(envelope).await
            } else if envelope.is::<ProcessImageResponse>() {
                self.image_response(envelope).await
            } else {
                debug!("no handler for message type");
                Ok(ConsumeOutcome::Ignored)
            }
        }
        .instrument(span)
        .await
    }

    /// Handles one received message and settles its lease: acked once handling
    /// succeeds, nacked otherwise so it is delivered again.
    pub async fn consume(&self, envelope: Envelope) -> Result<ConsumeOutcome, ConsumerError> {
        let message_id = envelope.message_id;
        match self.handle(envelope).await {
            Ok(outcome) => {
                self.bus.ack(message_id).await?;
                Ok(outcome)
            }
            Err(err) => {
                if let Err(nack) = self.bus.nack(message_id).await {
                    warn!(%message_id, error = %nack, "nack failed; message returns when its lease lapses");
                }
                Err(err)
            }
        }
    }

    async fn document_created(&self, envelope: Envelope) -> Result<ConsumeOutcome, ConsumerError> {
        let event: DocumentCreated = match envelope.decode() {
            Ok(event) => event,
            Err(err) => return self.dead_letter(&envelope, err.to_string(), 0).await,
        };

        let command = ProcessDocumentCommand::from(&event);
        let result = match self
            .router
            .resolve(command.source_data_provider, command.sport, command.document_type)
        {
            Ok(processor) => processor.process(&command).await,
            Err(err) => Err(err),
        };

        match result {
            Ok(outcome) => {
                info!(
                    entity_id = %outcome.entity_id,
                    created = outcome.created,
                    events = outcome.events_staged,
                    "document processed"
                );
                Ok(ConsumeOutcome::Processed(outcome))
            }
            Err(err) if err.is_fatal() => {
                warn!(error = %err, "fatal processing error");
                self.dead_letter(&envelope, err.to_string(), event.attempt_count + 1)
                    .await
            }
            Err(err) => {
                let attempt = event.attempt_count + 1;
                if attempt >= MAX_ATTEMPTS {
                    warn!(error = %err, attempt, "retries exhausted");
                    return self.dead_letter(&envelope, err.to_string(), attempt).await;
                }
                warn!(error = %err, attempt, "processing failed; retrying");
                let mut retry = envelope.clone();
                if let Some(body) = retry.body.as_object_mut() {
                    body.insert("attemptCount".into(), Value::from(attempt));
                }
                retry.message_id = Uuid::new_v4();
                retry.causation_id = causation::DOCUMENT_CONSUMER_RETRY;
                retry.delivery = DeliveryMode::Direct;
                retry.published_utc = Utc::now();
                self.bus.publish(retry).await?;
                Ok(ConsumeOutcome::Retried { attempt })
            }
        }
    }

    /// Transient failures surface as errors so the message is nacked and redelivered.
    async fn image_response(&self, envelope: Envelope) -> Result<ConsumeOutcome, ConsumerError> {
        let response: ProcessImageResponse = match envelope.decode() {
            Ok(response) => response,
            Err(err) => return self.dead_letter(&envelope, err.to_string(), 0).await,
        };

        match self.router.image_responses(response.sport).apply(&response).await {
            Ok(outcome) => Ok(ConsumeOutcome::ImageApplied(outcome)),
            Err(err) if err.is_fatal() => {
                warn!(error = %err, "image response cannot be applied");
                self.dead_letter(&envelope, err.to_string(), 1).await
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn document_requested(&self, envelope: Envelope) -> Result<ConsumeOutcome, ConsumerError> {
        let event: DocumentRequested = match envelope.decode() {
            Ok(event) => event,
            Err(err) => return self.dead_letter(&envelope, err.to_string(), 0).await,
        };

        // One level deep: the requested document itself plus nothing it links to.
        let task = CrawlTask {
            resource_index_id: ON_DEMAND_RESOURCE_INDEX,
            url: event.href.clone(),
            parent_item_id: None,
            parent_url: None,
            depth: self.max_depth.saturating_sub(1),
            provider: event.source_data_provider,
            sport: event.sport,
            document_type: event.document_type,
            season_year: event.season_year,
            scheduled_job_id: None,
            correlation_id: event.correlation_id,
            bypass_cache: false,
        };
        let job_id = self.jobs.enqueue(JobKind::Crawl(task), Utc::now()).await?;
        info!(%job_id, href = %event.href, document_type = %event.document_type, "dependency crawl queued");
        Ok(ConsumeOutcome::CrawlQueued(job_id))
    }

    async fn dead_letter(
        &self,
        envelope: &Envelope,
        error: String,
        attempt_count: u32,
    ) -> Result<ConsumeOutcome, ConsumerError> {
        let message = DeadLetterMessage::from_envelope(envelope, error, attempt_count);
        self.dlq.push(&self.queue_name, message).await?;
        warn!(queue = %self.queue_name, "message dead-lettered");
        Ok(ConsumeOutcome::DeadLettered)
    }

    /// Receives and handles messages until shutdown is signalled.
    pub async fn run(&self, batch_size: usize, idle: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(
            queue = %self.queue_name,
            created = DocumentCreated::MESSAGE_TYPE,
            requested = DocumentRequested::MESSAGE_TYPE,
            "document consumer started"
        );
        loop {
            if *shutdown.borrow() {
                break;
            }
            let batch = match self.bus.receive(batch_size).await {
                Ok(batch) => batch,
                Err(err) => {
                    error!(error = %err, "bus receive failed");
                    Vec::new()
                }
            };
            let mut idle_next = batch.is_empty();
            for envelope in batch {
                if let Err(err) = self.consume(envelope).await {
                    error!(error = %err, "message handling failed; will be redelivered");
                    idle_next = true;
                }
            }
            if idle_next {
                tokio::select! {
                    _ = tokio::time::sleep(idle) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
        }
        info!("document consumer stopped");
    }
}
