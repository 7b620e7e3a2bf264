//! Durable sourcing state: catalog, scheduled jobs, the crawl frontier and the job queue.
//!
//! [`MemorySourcingStore`] backs tests and `--in-memory` runs; the Postgres
//! implementation lives in [`crate::pg`].

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sdp_core::{DocumentType, SourceDataProvider, Sport};
use sdp_storage::StoreError;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::catalog::ResourceCatalogEntry;

/// Resource index used for documents requested outside a scheduled crawl.
pub const ON_DEMAND_RESOURCE_INDEX: Uuid = Uuid::nil();

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionMode {
    OneTime,
    PollUntilConditionMet,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    Active,
    Completed,
    Expired,
}

macro_rules! text_enum {
    ($ty:ident { $($variant:ident),+ $(,)? }) => {
        impl $ty {
            pub fn as_str(self) -> &'static str {
                match self {
                    $($ty::$variant => stringify!($variant),)+
                }
            }

            pub fn parse(raw: &str) -> Result<Self, StoreError> {
                match raw {
                    $(stringify!($variant) => Ok($ty::$variant),)+
                    other => Err(StoreError::Invalid(format!(
                        "unknown {} '{other}'",
                        stringify!($ty)
                    ))),
                }
            }
        }
    };
}

text_enum!(ExecutionMode { OneTime, PollUntilConditionMet });
text_enum!(JobStatus { Active, Completed, Expired });

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledJob {
    pub id: Uuid,
    pub catalog_entry_id: Option<Uuid>,
    pub href: String,
    pub provider: SourceDataProvider,
    pub sport: Sport,
    pub document_type: DocumentType,
    pub season_year: Option<i32>,
    pub execution_mode: ExecutionMode,
    pub start_utc: DateTime<Utc>,
    pub end_utc: Option<DateTime<Utc>>,
    pub polling_interval_secs: Option<i64>,
    pub max_attempts: Option<i32>,
    pub attempt_count: i32,
    pub status: JobStatus,
    pub last_enqueued_utc: Option<DateTime<Utc>>,
    pub last_completed_utc: Option<DateTime<Utc>>,
    pub page_cursor: Option<i32>,
    pub timeout_after_utc: Option<DateTime<Utc>>,
    pub resource_index_id: Uuid,
    pub correlation_id: Uuid,
    pub bypass_cache: bool,
}

impl ScheduledJob {
    pub fn is_active(&self) -> bool {
        self.status == JobStatus::Active
    }

    /// The per-season tier slot this job occupies, if it is seasonal.
    pub fn season_slot(&self) -> Option<(SourceDataProvider, Sport, i32, DocumentType)> {
        self.season_year
            .map(|year| (self.provider, self.sport, year, self.document_type))
    }

    pub fn timed_out(&self, now: DateTime<Utc>) -> bool {
        self.timeout_after_utc.is_some_and(|t| now >= t)
    }

    /// Whether a polling job has run its course.
    pub fn polling_finished(&self, now: DateTime<Utc>) -> bool {
        self.end_utc.is_some_and(|end| now >= end)
            || self
                .max_attempts
                .is_some_and(|max| self.attempt_count >= max)
    }
}

/// One unit of crawl work carried by the job queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrawlTask {
    pub resource_index_id: Uuid,
    pub url: String,
    pub parent_item_id: Option<Uuid>,
    pub parent_url: Option<String>,
    pub depth: u32,
    pub provider: SourceDataProvider,
    pub sport: Sport,
    pub document_type: DocumentType,
    pub season_year: Option<i32>,
    pub scheduled_job_id: Option<Uuid>,
    pub correlation_id: Uuid,
    pub bypass_cache: bool,
}

impl CrawlTask {
    pub fn child(&self, url: String, document_type: DocumentType, parent_item_id: Uuid) -> Self {
        Self {
            url,
            parent_item_id: Some(parent_item_id),
            parent_url: Some(self.url.clone()),
            depth: self.depth + 1,
            document_type,
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceIndexItem {
    pub id: Uuid,
    pub resource_index_id: Uuid,
    pub url: String,
    pub url_hash: String,
    pub parent_item_id: Option<Uuid>,
    pub depth: u32,
    pub document_type: DocumentType,
    pub created_utc: DateTime<Utc>,
    pub last_accessed_utc: DateTime<Utc>,
    pub completed_utc: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VisitOutcome {
    New(ResourceIndexItem),
    Revisited(ResourceIndexItem),
}

impl VisitOutcome {
    pub fn item(&self) -> &ResourceIndexItem {
        match self {
            VisitOutcome::New(item) | VisitOutcome::Revisited(item) => item,
        }
    }

    /// A revisit of an item whose crawl already finished.
    pub fn is_done(&self) -> bool {
        matches!(self, VisitOutcome::Revisited(item) if item.completed_utc.is_some())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobKind {
    FireScheduledJob { scheduled_job_id: Uuid },
    Crawl(CrawlTask),
    ReprocessDeadLetters {
        count: u32,
        queue_name: Option<String>,
    },
}

impl JobKind {
    pub fn label(&self) -> &'static str {
        match self {
            JobKind::FireScheduledJob { .. } => "fire_scheduled_job",
            JobKind::Crawl(_) => "crawl",
            JobKind::ReprocessDeadLetters { .. } => "reprocess_dead_letters",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedJob {
    pub id: Uuid,
    pub kind: JobKind,
    pub run_at: DateTime<Utc>,
    pub attempts: u32,
}

#[async_trait]
pub trait SourcingStore: Send + Sync {
    /// Inserts entries not yet present by natural key; returns how many were new.
    async fn upsert_catalog(&self, entries: &[ResourceCatalogEntry]) -> Result<usize, StoreError>;

    async fn catalog(
        &self,
        provider: SourceDataProvider,
        sport: Sport,
    ) -> Result<Vec<ResourceCatalogEntry>, StoreError>;

    async fn touch_catalog(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), StoreError>;

    async fn jobs_for_season(
        &self,
        provider: SourceDataProvider,
        sport: Sport,
        season_year: i32,
    ) -> Result<Vec<ScheduledJob>, StoreError>;

    /// Catalog entries, scheduled jobs and one queue entry per job at `start_utc`,
    /// written all-or-nothing. Existing jobs with the same id are replaced.
    async fn save_schedule(
        &self,
        entries: &[ResourceCatalogEntry],
        jobs: &[ScheduledJob],
    ) -> Result<(), StoreError>;

    /// Like [`SourcingStore::save_schedule`] for a season with no jobs yet, but
    /// atomic against concurrent callers: if any job's `(provider, sport,
    /// season_year, document_type)` slot is already taken nothing is written and
    /// the occupant's correlation id is returned.
    async fn create_season_schedule(
        &self,
        entries: &[ResourceCatalogEntry],
        jobs: &[ScheduledJob],
    ) -> Result<Option<Uuid>, StoreError>;

    async fn job(&self, id: Uuid) -> Result<Option<ScheduledJob>, StoreError>;

    async fn update_job(&self, job: &ScheduledJob) -> Result<(), StoreError>;

    /// Inserts `(resource_index_id, url_hash)` or touches `last_accessed_utc` if present.
    async fn record_visit(&self, item: ResourceIndexItem) -> Result<VisitOutcome, StoreError>;

    async fn complete_visit(
        &self,
        resource_index_id: Uuid,
        url_hash: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn index_items(&self, resource_index_id: Uuid) -> Result<Vec<ResourceIndexItem>, StoreError>;
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(&self, kind: JobKind, run_at: DateTime<Utc>) -> Result<Uuid, StoreError>;

    /// Leases the earliest due job, if any.
    async fn dequeue(&self, now: DateTime<Utc>) -> Result<Option<QueuedJob>, StoreError>;

    async fn complete(&self, id: Uuid) -> Result<(), StoreError>;

    /// Returns the job to the queue at `run_at`, counting the failed attempt.
    async fn reschedule(&self, id: Uuid, run_at: DateTime<Utc>, error: &str) -> Result<(), StoreError>;

    /// Returns a leased job untouched, e.g. on shutdown.
    async fn requeue(&self, id: Uuid) -> Result<(), StoreError>;

    async fn fail(&self, id: Uuid, error: &str) -> Result<(), StoreError>;

    async fn pending(&self) -> Result<usize, StoreError>;
}

/// Non-blocking mutual exclusion for forced sourcing runs.
#[async_trait]
pub trait SourcingLock: Send + Sync {
    async fn try_acquire(&self, key: i64) -> Result<bool, StoreError>;

    async fn release(&self, key: i64) -> Result<(), StoreError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum QueueState {
    Pending,
    Leased,
    Done,
    Failed,
}

#[derive(Debug, Clone)]
struct QueueRow {
    job: QueuedJob,
    state: QueueState,
    last_error: Option<String>,
}

#[derive(Default)]
struct MemorySourcingState {
    catalog: Vec<ResourceCatalogEntry>,
    jobs: HashMap<Uuid, ScheduledJob>,
    items: HashMap<(Uuid, String), ResourceIndexItem>,
    queue: Vec<QueueRow>,
    locks: HashSet<i64>,
}

impl MemorySourcingState {
    fn insert_catalog(&mut self, entries: &[ResourceCatalogEntry]) -> usize {
        let mut inserted = 0;
        for entry in entries {
            let exists = self
                .catalog
                .iter()
                .any(|e| e.natural_key() == entry.natural_key());
            if !exists {
                self.catalog.push(entry.clone());
                inserted += 1;
            }
        }
        inserted
    }

    fn push_job(&mut self, kind: JobKind, run_at: DateTime<Utc>) -> Uuid {
        let id = Uuid::new_v4();
        self.queue.push(QueueRow {
            job: QueuedJob {
                id,
                kind,
                run_at,
                attempts: 0,
            },
            state: QueueState::Pending,
            last_error: None,
        });
        id
    }

    fn write_schedule(&mut self, entries: &[ResourceCatalogEntry], jobs: &[ScheduledJob]) {
        self.insert_catalog(entries);
        for job in jobs {
            self.jobs.insert(job.id, job.clone());
            self.push_job(
                JobKind::FireScheduledJob {
                    scheduled_job_id: job.id,
                },
                job.start_utc,
            );
        }
    }

    fn row_mut(&mut self, id: Uuid) -> Result<&mut QueueRow, StoreError> {
        self.queue
            .iter_mut()
            .find(|row| row.job.id == id)
            .ok_or_else(|| StoreError::Invalid(format!("unknown queued job {id}")))
    }
}

/// In-process implementation of [`SourcingStore`], [`JobQueue`] and [`SourcingLock`].
#[derive(Clone, Default)]
pub struct MemorySourcingStore {
    state: Arc<Mutex<MemorySourcingState>>,
}

impl MemorySourcingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn all_jobs(&self) -> Vec<ScheduledJob> {
        let state = self.state.lock().await;
        let mut jobs: Vec<_> = state.jobs.values().cloned().collect();
        jobs.sort_by_key(|j| j.start_utc);
        jobs
    }

    pub async fn queued(&self) -> Vec<QueuedJob> {
        let state = self.state.lock().await;
        state
            .queue
            .iter()
            .filter(|row| row.state == QueueState::Pending)
            .map(|row| row.job.clone())
            .collect()
    }

    pub async fn failed_jobs(&self) -> Vec<(QueuedJob, Option<String>)> {
        let state = self.state.lock().await;
        state
            .queue
            .iter()
            .filter(|row| row.state == QueueState::Failed)
            .map(|row| (row.job.clone(), row.last_error.clone()))
            .collect()
    }
}

#[async_trait]
impl SourcingStore for MemorySourcingStore {
    async fn upsert_catalog(&self, entries: &[ResourceCatalogEntry]) -> Result<usize, StoreError> {
        let mut state = self.state.lock().await;
        Ok(state.insert_catalog(entries))
    }

    async fn catalog(
        &self,
        provider: SourceDataProvider,
        sport: Sport,
    ) -> Result<Vec<ResourceCatalogEntry>, StoreError> {
        let state = self.state.lock().await;
        let mut entries: Vec<_> = state
            .catalog
            .iter()
            .filter(|e| e.provider == provider && e.sport == sport)
            .cloned()
            .collect();
        entries.sort_by_key(|e| e.ordinal);
        Ok(entries)
    }

    async fn touch_catalog(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if let Some(entry) = state.catalog.iter_mut().find(|e| e.id == id) {
            entry.last_accessed_utc = Some(at);
        }
        Ok(())
    }

    async fn jobs_for_season(
        &self,
        provider: SourceDataProvider,
        sport: Sport,
        season_year: i32,
    ) -> Result<Vec<ScheduledJob>, StoreError> {
        let state = self.state.lock().await;
        let mut jobs: Vec<_> = state
            .jobs
            .values()
            .filter(|j| {
                j.provider == provider && j.sport == sport && j.season_year == Some(season_year)
            })
            .cloned()
            .collect();
        jobs.sort_by_key(|j| j.start_utc);
        Ok(jobs)
    }

    async fn save_schedule(
        &self,
        entries: &[ResourceCatalogEntry],
        jobs: &[ScheduledJob],
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.write_schedule(entries, jobs);
        Ok(())
    }

    async fn create_season_schedule(
        &self,
        entries: &[ResourceCatalogEntry],
        jobs: &[ScheduledJob],
    ) -> Result<Option<Uuid>, StoreError> {
        let mut state = self.state.lock().await;
        let occupant = state.jobs.values().find(|existing| {
            existing.season_slot().is_some()
                && jobs.iter().any(|job| job.season_slot() == existing.season_slot())
        });
        if let Some(occupant) = occupant {
            return Ok(Some(occupant.correlation_id));
        }
        state.write_schedule(entries, jobs);
        Ok(None)
    }

    async fn job(&self, id: Uuid) -> Result<Option<ScheduledJob>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.jobs.get(&id).cloned())
    }

    async fn update_job(&self, job: &ScheduledJob) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn record_visit(&self, item: ResourceIndexItem) -> Result<VisitOutcome, StoreError> {
        let mut state = self.state.lock().await;
        match state.items.entry((item.resource_index_id, item.url_hash.clone())) {
            Entry::Occupied(mut occupied) => {
                let existing = occupied.get_mut();
                existing.last_accessed_utc = item.last_accessed_utc;
                Ok(VisitOutcome::Revisited(existing.clone()))
            }
            Entry::Vacant(vacant) => {
                vacant.insert(item.clone());
                Ok(VisitOutcome::New(item))
            }
        }
    }

    async fn complete_visit(
        &self,
        resource_index_id: Uuid,
        url_hash: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if let Some(item) = state.items.get_mut(&(resource_index_id, url_hash.to_string())) {
            item.completed_utc = Some(at);
        }
        Ok(())
    }

    async fn index_items(&self, resource_index_id: Uuid) -> Result<Vec<ResourceIndexItem>, StoreError> {
        let state = self.state.lock().await;
        let mut items: Vec<_> = state
            .items
            .values()
            .filter(|i| i.resource_index_id == resource_index_id)
            .cloned()
            .collect();
        items.sort_by(|a, b| a.depth.cmp(&b.depth).then(a.created_utc.cmp(&b.created_utc)));
        Ok(items)
    }
}

#[async_trait]
impl JobQueue for MemorySourcingStore {
    async fn enqueue(&self, kind: JobKind, run_at: DateTime<Utc>) -> Result<Uuid, StoreError> {
        let mut state = self.state.lock().await;
        Ok(state.push_job(kind, run_at))
    }

    async fn dequeue(&self, now: DateTime<Utc>) -> Result<Option<QueuedJob>, StoreError> {
        let mut state = self.state.lock().await;
        let next = state
            .queue
            .iter_mut()
            .filter(|row| row.state == QueueState::Pending && row.job.run_at <= now)
            .min_by_key(|row| row.job.run_at);
        Ok(next.map(|row| {
            row.state = QueueState::Leased;
            row.job.clone()
        }))
    }

    async fn complete(&self, id: Uuid) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.row_mut(id)?.state = QueueState::Done;
        Ok(())
    }

    async fn reschedule(&self, id: Uuid, run_at: DateTime<Utc>, error: &str) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let row = state.row_mut(id)?;
        row.state = QueueState::Pending;
        row.job.run_at = run_at;
        row.job.attempts += 1;
        row.last_error = Some(error.to_string());
        Ok(())
    }

    async fn requeue(&self, id: Uuid) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.row_mut(id)?.state = QueueState::Pending;
        Ok(())
    }

    async fn fail(&self, id: Uuid, error: &str) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let row = state.row_mut(id)?;
        row.state = QueueState::Failed;
        row.job.attempts += 1;
        row.last_error = Some(error.to_string());
        Ok(())
    }

    async fn pending(&self) -> Result<usize, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .queue
            .iter()
            .filter(|row| row.state == QueueState::Pending)
            .count())
    }
}

#[async_trait]
impl SourcingLock for MemorySourcingStore {
    async fn try_acquire(&self, key: i64) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        Ok(state.locks.insert(key))
    }

    async fn release(&self, key: i64) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.locks.remove(&key);
        Ok(())
    }
}
