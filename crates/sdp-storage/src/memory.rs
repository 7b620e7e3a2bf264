//! In-process persistence context used by tests and single-process runs.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sdp_core::{CanonicalEntity, ExternalId, IntegrationEvent, SourceDataProvider, SportFamily};
use serde_json::Value;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::context::{
    CommitReceipt, DataContext, FamilyMarker, IndividualSportSchema, OutboxMessage, OutboxStore,
    Query, SchemaFamily, StagedEvent, StoreError, TeamSportContext, TeamSportSchema, UnitOfWork,
};

type ExternalKey = (&'static str, SourceDataProvider, String);

#[derive(Debug, Default)]
struct MemoryState {
    entities: HashMap<Uuid, (&'static str, Value)>,
    external_ids: HashMap<ExternalKey, Uuid>,
    outbox: Vec<OutboxMessage>,
    next_sequence: i64,
}

pub struct MemoryContext<F> {
    state: Arc<Mutex<MemoryState>>,
    _family: FamilyMarker<F>,
}

impl<F> Clone for MemoryContext<F> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
            _family: Default::default(),
        }
    }
}

impl<F: SchemaFamily> Default for MemoryContext<F> {
    fn default() -> Self {
        Self::new()
    }
}

impl<F: SchemaFamily> MemoryContext<F> {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MemoryState::default())),
            _family: Default::default(),
        }
    }

    /// Every committed entity of type `T`.
    pub async fn entities<T: CanonicalEntity>(&self) -> Result<Vec<T>, StoreError> {
        let state = self.state.lock().await;
        state
            .entities
            .values()
            .filter(|(kind, _)| *kind == T::KIND)
            .map(|(_, body)| serde_json::from_value(body.clone()).map_err(StoreError::from))
            .collect()
    }

    /// Every outbox row, sent or not, in sequence order.
    pub async fn outbox(&self) -> Vec<OutboxMessage> {
        self.state.lock().await.outbox.clone()
    }
}

#[async_trait]
impl<F: SchemaFamily> DataContext for MemoryContext<F> {
    type Work = MemoryUnitOfWork;

    fn family(&self) -> SportFamily {
        F::FAMILY
    }

    async fn begin(&self) -> Result<Self::Work, StoreError> {
        Ok(MemoryUnitOfWork {
            state: self.state.clone(),
            pending: Vec::new(),
            staged: Vec::new(),
        })
    }
}

impl TeamSportContext for MemoryContext<TeamSportSchema> {}

pub type TeamSportMemoryContext = MemoryContext<TeamSportSchema>;
pub type IndividualSportMemoryContext = MemoryContext<IndividualSportSchema>;

#[derive(Debug, Clone)]
struct PendingWrite {
    kind: &'static str,
    id: Uuid,
    body: Value,
    external_ids: Vec<ExternalId>,
}

pub struct MemoryUnitOfWork {
    state: Arc<Mutex<MemoryState>>,
    pending: Vec<PendingWrite>,
    staged: Vec<StagedEvent>,
}

impl MemoryUnitOfWork {
    fn pending_body(&self, kind: &str, id: Uuid) -> Option<&Value> {
        self.pending
            .iter()
            .rev()
            .find(|w| w.kind == kind && w.id == id)
            .map(|w| &w.body)
    }
}

#[async_trait]
impl UnitOfWork for MemoryUnitOfWork {
    async fn find<T: CanonicalEntity>(&mut self, id: Uuid) -> Result<Option<T>, StoreError> {
        if let Some(body) = self.pending_body(T::KIND, id) {
            return Ok(Some(serde_json::from_value(body.clone())?));
        }
        let state = self.state.lock().await;
        match state.entities.get(&id) {
            Some((kind, body)) if *kind == T::KIND => Ok(Some(serde_json::from_value(body.clone())?)),
            _ => Ok(None),
        }
    }

    async fn find_by_external_id<T: CanonicalEntity>(
        &mut self,
        provider: SourceDataProvider,
        value: &str,
    ) -> Result<Option<T>, StoreError> {
        let pending = self.pending.iter().rev().find(|w| {
            w.kind == T::KIND
                && w.external_ids
                    .iter()
                    .any(|e| e.provider == provider && e.value == value)
        });
        if let Some(write) = pending {
            return Ok(Some(serde_json::from_value(write.body.clone())?));
        }

        let id = {
            let state = self.state.lock().await;
            state
                .external_ids
                .get(&(T::KIND, provider, value.to_string()))
                .copied()
        };
        match id {
            Some(id) => self.find(id).await,
            None => Ok(None),
        }
    }

    async fn query<T: CanonicalEntity>(&mut self, query: &Query) -> Result<Vec<T>, StoreError> {
        let mut bodies: HashMap<Uuid, Value> = {
            let state = self.state.lock().await;
            state
                .entities
                .iter()
                .filter(|(_, (kind, _))| *kind == T::KIND)
                .map(|(id, (_, body))| (*id, body.clone()))
                .collect()
        };
        for write in self.pending.iter().filter(|w| w.kind == T::KIND) {
            bodies.insert(write.id, write.body.clone());
        }

        bodies
            .into_values()
            .filter(|body| query.matches(body))
            .map(|body| serde_json::from_value(body).map_err(StoreError::from))
            .collect()
    }

    async fn upsert<T: CanonicalEntity>(&mut self, entity: &T) -> Result<(), StoreError> {
        self.pending.push(PendingWrite {
            kind: T::KIND,
            id: entity.id(),
            body: serde_json::to_value(entity)?,
            external_ids: entity.external_ids().to_vec(),
        });
        Ok(())
    }

    fn stage<E: IntegrationEvent>(&mut self, event: &E) -> Result<(), StoreError> {
        self.staged.push(StagedEvent::from_event(event)?);
        Ok(())
    }

    fn staged_count(&self) -> usize {
        self.staged.len()
    }

    async fn commit(self) -> Result<CommitReceipt, StoreError> {
        let mut state = self.state.lock().await;

        for write in &self.pending {
            for ext in &write.external_ids {
                let key = (write.kind, ext.provider, ext.value.clone());
                if let Some(existing) = state.external_ids.get(&key) {
                    if *existing != write.id {
                        return Err(StoreError::ExternalIdConflict {
                            kind: write.kind,
                            provider: ext.provider,
                            value: ext.value.clone(),
                            existing: *existing,
                        });
                    }
                }
            }
        }

        let receipt = CommitReceipt {
            entities_written: self.pending.len(),
            events_staged: self.staged.len(),
        };
        for write in self.pending {
            for ext in &write.external_ids {
                state
                    .external_ids
                    .insert((write.kind, ext.provider, ext.value.clone()), write.id);
            }
            state.entities.insert(write.id, (write.kind, write.body));
        }

        let now = Utc::now();
        for event in self.staged {
            state.next_sequence += 1;
            let sequence_number = state.next_sequence;
            state.outbox.push(OutboxMessage {
                sequence_number,
                message_id: event.message_id,
                message_type: event.message_type,
                body: event.body,
                correlation_id: event.correlation_id,
                causation_id: event.causation_id,
                enqueue_time: now,
                sent_time: None,
            });
        }

        Ok(receipt)
    }
}

#[async_trait]
impl<F: SchemaFamily> OutboxStore for MemoryContext<F> {
    async fn fetch_unsent(&self, limit: usize) -> Result<Vec<OutboxMessage>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .outbox
            .iter()
            .filter(|m| m.sent_time.is_none())
            .take(limit)
            .cloned()
            .collect())
    }

    async fn mark_sent(
        &self,
        sequence_number: i64,
        sent_time: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        match state
            .outbox
            .iter_mut()
            .find(|m| m.sequence_number == sequence_number)
        {
            Some(message) => {
                message.sent_time = Some(sent_time);
                Ok(())
            }
            None => Err(StoreError::Invalid(format!(
                "outbox message {sequence_number} not found"
            ))),
        }
    }

    async fn purge_sent(&self, older_than: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut state = self.state.lock().await;
        let before = state.outbox.len();
        state
            .outbox
            .retain(|m| m.sent_time.map_or(true, |sent| sent >= older_than));
        Ok((before - state.outbox.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sdp_core::{Audit, Venue, VenueCreated};

    fn venue(external: &str) -> Venue {
        Venue {
            id: Uuid::new_v4(),
            name: "Kyle Field".into(),
            short_name: None,
            slug: "kyle-field".into(),
            is_grass: true,
            is_indoor: false,
            capacity: Some(102_733),
            address: None,
            images: Vec::new(),
            external_ids: vec![ExternalId::new(SourceDataProvider::Espn, external)],
            audit: Audit::created(Utc::now(), Uuid::nil()),
        }
    }

    #[tokio::test]
    async fn commit_writes_entities_and_outbox_rows_together() {
        let ctx = TeamSportMemoryContext::new();
        let mut work = ctx.begin().await.expect("begin");
        let v = venue("3958");
        work.upsert(&v).await.expect("upsert");
        work.stage(&VenueCreated {
            venue: v.clone(),
            correlation_id: Uuid::nil(),
            causation_id: Uuid::nil(),
        })
        .expect("stage");

        let found: Option<Venue> = work
            .find_by_external_id(SourceDataProvider::Espn, "3958")
            .await
            .expect("read own write");
        assert_eq!(found.map(|f| f.id), Some(v.id));

        let receipt = work.commit().await.expect("commit");
        assert_eq!(receipt.events_staged, 1);
        assert_eq!(ctx.entities::<Venue>().await.expect("venues").len(), 1);
        let outbox = ctx.outbox().await;
        assert_eq!(outbox.len(), 1);
        assert_eq!(outbox[0].message_type, "VenueCreated");
        assert!(outbox[0].sent_time.is_none());
    }

    #[tokio::test]
    async fn dropped_unit_of_work_leaves_no_trace() {
        let ctx = IndividualSportMemoryContext::new();
        {
            let mut work = ctx.begin().await.expect("begin");
            let v = venue("1");
            work.upsert(&v).await.expect("upsert");
            work.stage(&VenueCreated {
                venue: v,
                correlation_id: Uuid::nil(),
                causation_id: Uuid::nil(),
            })
            .expect("stage");
        }
        assert!(ctx.entities::<Venue>().await.expect("venues").is_empty());
        assert!(ctx.outbox().await.is_empty());
        assert_eq!(ctx.family(), SportFamily::IndividualSports);
    }

    #[tokio::test]
    async fn second_entity_for_same_external_id_is_rejected() {
        let ctx = TeamSportMemoryContext::new();
        let mut first = ctx.begin().await.expect("begin");
        first.upsert(&venue("v-42")).await.expect("upsert");
        first.commit().await.expect("commit");

        let mut second = ctx.begin().await.expect("begin");
        second.upsert(&venue("v-42")).await.expect("upsert");
        let err = second.commit().await.expect_err("conflict");
        assert!(matches!(err, StoreError::ExternalIdConflict { .. }));
        assert_eq!(ctx.entities::<Venue>().await.expect("venues").len(), 1);
    }

    #[tokio::test]
    async fn outbox_rows_are_marked_and_purged() {
        let ctx = TeamSportMemoryContext::new();
        let mut work = ctx.begin().await.expect("begin");
        let v = venue("9");
        work.stage(&VenueCreated {
            venue: v,
            correlation_id: Uuid::nil(),
            causation_id: Uuid::nil(),
        })
        .expect("stage");
        work.commit().await.expect("commit");

        let unsent = ctx.fetch_unsent(10).await.expect("unsent");
        assert_eq!(unsent.len(), 1);
        let sent_at = Utc::now();
        ctx.mark_sent(unsent[0].sequence_number, sent_at)
            .await
            .expect("mark");
        assert!(ctx.fetch_unsent(10).await.expect("unsent").is_empty());

        let purged = ctx
            .purge_sent(sent_at + chrono::Duration::seconds(1))
            .await
            .expect("purge");
        assert_eq!(purged, 1);
    }
}
