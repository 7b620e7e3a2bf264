//! Persistence capabilities handed to document processors.
//!
//! A [`DataContext`] owns one schema per sport family. Processors open a
//! [`UnitOfWork`], read and upsert canonical entities, stage integration events,
//! and commit; entity rows and outbox rows land in the same transaction.

use std::marker::PhantomData;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sdp_core::{CanonicalEntity, IntegrationEvent, SourceDataProvider, SportFamily};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("{kind} external id {provider}:{value} already belongs to {existing}")]
    ExternalIdConflict {
        kind: &'static str,
        provider: SourceDataProvider,
        value: String,
        existing: Uuid,
    },
    #[error("{0}")]
    Invalid(String),
}

/// Equality filter over top-level entity fields.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Query {
    conditions: Map<String, Value>,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq(mut self, field: &str, value: Value) -> Self {
        self.conditions.insert(field.to_string(), value);
        self
    }

    pub fn matches(&self, body: &Value) -> bool {
        self.conditions
            .iter()
            .all(|(field, expected)| body.get(field) == Some(expected))
    }

    /// JSON object suitable for a `@>` containment check.
    pub fn as_json(&self) -> Value {
        Value::Object(self.conditions.clone())
    }
}

/// An event staged inside a unit of work, not yet assigned a sequence number.
#[derive(Debug, Clone, PartialEq)]
pub struct StagedEvent {
    pub message_id: Uuid,
    pub message_type: String,
    pub body: Value,
    pub correlation_id: Uuid,
    pub causation_id: Uuid,
}

impl StagedEvent {
    pub fn from_event<E: IntegrationEvent>(event: &E) -> Result<Self, serde_json::Error> {
        Ok(Self {
            message_id: Uuid::new_v4(),
            message_type: E::MESSAGE_TYPE.to_string(),
            body: serde_json::to_value(event)?,
            correlation_id: event.correlation_id(),
            causation_id: event.causation_id(),
        })
    }
}

/// A committed outbox row. `sent_time` is set only after the bus acknowledged delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxMessage {
    pub sequence_number: i64,
    pub message_id: Uuid,
    pub message_type: String,
    pub body: Value,
    pub correlation_id: Uuid,
    pub causation_id: Uuid,
    pub enqueue_time: DateTime<Utc>,
    pub sent_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommitReceipt {
    pub entities_written: usize,
    pub events_staged: usize,
}

#[async_trait]
pub trait UnitOfWork: Send {
    async fn find<T: CanonicalEntity>(&mut self, id: Uuid) -> Result<Option<T>, StoreError>;

    async fn find_by_external_id<T: CanonicalEntity>(
        &mut self,
        provider: SourceDataProvider,
        value: &str,
    ) -> Result<Option<T>, StoreError>;

    async fn query<T: CanonicalEntity>(&mut self, query: &Query) -> Result<Vec<T>, StoreError>;

    async fn upsert<T: CanonicalEntity>(&mut self, entity: &T) -> Result<(), StoreError>;

    fn stage<E: IntegrationEvent>(&mut self, event: &E) -> Result<(), StoreError>;

    fn staged_count(&self) -> usize;

    /// Writes entities and staged events atomically. Dropping without committing discards both.
    async fn commit(self) -> Result<CommitReceipt, StoreError>;
}

#[async_trait]
pub trait DataContext: Send + Sync + 'static {
    type Work: UnitOfWork;

    fn family(&self) -> SportFamily;

    async fn begin(&self) -> Result<Self::Work, StoreError>;
}

/// Contexts whose schema carries franchises, groups and team seasons.
pub trait TeamSportContext: DataContext {}

#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Unsent rows in commit order.
    async fn fetch_unsent(&self, limit: usize) -> Result<Vec<OutboxMessage>, StoreError>;

    async fn mark_sent(
        &self,
        sequence_number: i64,
        sent_time: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn purge_sent(&self, older_than: DateTime<Utc>) -> Result<u64, StoreError>;
}

/// Compile-time marker selecting the schema a context is bound to.
pub trait SchemaFamily: Send + Sync + 'static {
    const FAMILY: SportFamily;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TeamSportSchema;

#[derive(Debug, Clone, Copy, Default)]
pub struct IndividualSportSchema;

impl SchemaFamily for TeamSportSchema {
    const FAMILY: SportFamily = SportFamily::TeamSports;
}

impl SchemaFamily for IndividualSportSchema {
    const FAMILY: SportFamily = SportFamily::IndividualSports;
}

pub(crate) type FamilyMarker<F> = PhantomData<fn() -> F>;
