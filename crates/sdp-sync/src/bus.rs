//! Message bus contract and the in-process bus.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sdp_core::IntegrationEvent;
use sdp_storage::{OutboxMessage, StoreError};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("message bus unavailable: {0}")]
    Unavailable(String),
    #[error("message body is not a valid {message_type}: {source}")]
    Decode {
        message_type: String,
        #[source]
        source: serde_json::Error,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// How a message reached the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeliveryMode {
    /// Staged in a unit of work and relayed by the outbox dispatcher.
    Outbox,
    /// Published straight to the bus by the crawler or the dead-letter reprocessor.
    Direct,
}

impl DeliveryMode {
    pub fn as_str(self) -> &'static str {
        match self {
            DeliveryMode::Outbox => "Outbox",
            DeliveryMode::Direct => "Direct",
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw {
            "Outbox" => DeliveryMode::Outbox,
            _ => DeliveryMode::Direct,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub message_id: Uuid,
    pub message_type: String,
    pub body: Value,
    pub correlation_id: Uuid,
    pub causation_id: Uuid,
    pub delivery: DeliveryMode,
    pub published_utc: DateTime<Utc>,
}

impl Envelope {
    pub fn direct<E: IntegrationEvent>(event: &E) -> Result<Self, BusError> {
        let body = serde_json::to_value(event).map_err(|source| BusError::Decode {
            message_type: E::MESSAGE_TYPE.to_string(),
            source,
        })?;
        Ok(Self {
            message_id: Uuid::new_v4(),
            message_type: E::MESSAGE_TYPE.to_string(),
            body,
            correlation_id: event.correlation_id(),
            causation_id: event.causation_id(),
            delivery: DeliveryMode::Direct,
            published_utc: Utc::now(),
        })
    }

    pub fn from_outbox(message: &OutboxMessage) -> Self {
        Self {
            message_id: message.message_id,
            message_type: message.message_type.clone(),
            body: message.body.clone(),
            correlation_id: message.correlation_id,
            causation_id: message.causation_id,
            delivery: DeliveryMode::Outbox,
            published_utc: Utc::now(),
        }
    }

    pub fn is<E: IntegrationEvent>(&self) -> bool {
        self.message_type == E::MESSAGE_TYPE
    }

    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, BusError> {
        serde_json::from_value(self.body.clone()).map_err(|source| BusError::Decode {
            message_type: self.message_type.clone(),
            source,
        })
    }
}

/// How long a received message stays hidden before it is offered again.
pub const DEFAULT_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(30);

#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Returns only after the bus has durably accepted the message.
    async fn publish(&self, envelope: Envelope) -> Result<(), BusError>;

    /// Leases up to `max` visible messages in publish order. A leased message is
    /// hidden until it is acked or nacked, or until its visibility timeout lapses.
    async fn receive(&self, max: usize) -> Result<Vec<Envelope>, BusError>;

    /// Removes a leased message for good.
    async fn ack(&self, message_id: Uuid) -> Result<(), BusError>;

    /// Makes a leased message visible again straight away.
    async fn nack(&self, message_id: Uuid) -> Result<(), BusError>;
}

struct Lease {
    envelope: Envelope,
    until: Instant,
}

#[derive(Default)]
struct MemoryBusState {
    queue: VecDeque<Envelope>,
    leased: Vec<Lease>,
}

impl MemoryBusState {
    /// Puts lapsed leases back at the head of the queue, oldest first.
    fn reclaim(&mut self, now: Instant) {
        let (lapsed, live): (Vec<_>, Vec<_>) =
            std::mem::take(&mut self.leased).into_iter().partition(|l| l.until <= now);
        self.leased = live;
        for lease in lapsed.into_iter().rev() {
            self.queue.push_front(lease.envelope);
        }
    }
}

/// In-process bus. Can be switched offline to exercise outbox recovery.
#[derive(Clone)]
pub struct MemoryBus {
    state: Arc<Mutex<MemoryBusState>>,
    published: Arc<Mutex<Vec<Envelope>>>,
    offline: Arc<AtomicBool>,
    visibility: Duration,
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self {
            state: Arc::default(),
            published: Arc::default(),
            offline: Arc::default(),
            visibility: DEFAULT_VISIBILITY_TIMEOUT,
        }
    }
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_visibility_timeout(mut self, visibility: Duration) -> Self {
        self.visibility = visibility;
        self
    }

    /// Gates `publish` only; leases already handed out can still be settled.
    pub fn set_online(&self, online: bool) {
        self.offline.store(!online, Ordering::SeqCst);
    }

    /// Every message ever accepted, including those already received.
    pub async fn published(&self) -> Vec<Envelope> {
        self.published.lock().await.clone()
    }

    /// Messages visible to the next `receive`.
    pub async fn pending(&self) -> usize {
        let mut state = self.state.lock().await;
        state.reclaim(Instant::now());
        state.queue.len()
    }

    /// Messages received but neither acked nor nacked yet.
    pub async fn in_flight(&self) -> usize {
        let mut state = self.state.lock().await;
        state.reclaim(Instant::now());
        state.leased.len()
    }
}

#[async_trait]
impl MessageBus for MemoryBus {
    async fn publish(&self, envelope: Envelope) -> Result<(), BusError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(BusError::Unavailable("memory bus is offline".into()));
        }
        self.published.lock().await.push(envelope.clone());
        self.state.lock().await.queue.push_back(envelope);
        Ok(())
    }

    async fn receive(&self, max: usize) -> Result<Vec<Envelope>, BusError> {
        let now = Instant::now();
        let mut state = self.state.lock().await;
        state.reclaim(now);
        let take = max.min(state.queue.len());
        let batch: Vec<Envelope> = state.queue.drain(..take).collect();
        let until = now + self.visibility;
        state.leased.extend(batch.iter().map(|envelope| Lease {
            envelope: envelope.clone(),
            until,
        }));
        Ok(batch)
    }

    async fn ack(&self, message_id: Uuid) -> Result<(), BusError> {
        let mut state = self.state.lock().await;
        state.leased.retain(|l| l.envelope.message_id != message_id);
        Ok(())
    }

    async fn nack(&self, message_id: Uuid) -> Result<(), BusError> {
        let mut state = self.state.lock().await;
        let (returned, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut state.leased)
            .into_iter()
            .partition(|l| l.envelope.message_id == message_id);
        state.leased = kept;
        for lease in returned.into_iter().rev() {
            state.queue.push_front(lease.envelope);
        }
        Ok(())
    }
}
