//! Job execution: scheduled-job firing, crawl tasks and dead-letter drains,
//! plus the worker pool and cron registration that drive them.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use anyhow::Context;
use chrono::{DateTime, Duration, Utc};
use sdp_storage::{BackoffPolicy, StoreError};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::catalog::ResourceCatalogEntry;
use crate::crawl::Crawler;
use crate::dead_letter::DeadLetterReprocessor;
use crate::store::{
    CrawlTask, ExecutionMode, JobKind, JobQueue, JobStatus, QueuedJob, ScheduledJob, SourcingStore,
};

/// Re-fire interval for polling jobs that do not carry their own.
pub const DEFAULT_POLL_INTERVAL_SECS: i64 = 60 * 60;
/// Polls a recurring catalog entry gets per cron trigger.
pub const RECURRING_MAX_ATTEMPTS: i32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    Rescheduled { run_at: DateTime<Utc> },
    Failed,
}

pub struct JobRunner {
    store: Arc<dyn SourcingStore>,
    jobs: Arc<dyn JobQueue>,
    crawler: Crawler,
    reprocessor: Arc<DeadLetterReprocessor>,
    backoff: BackoffPolicy,
}

impl JobRunner {
    pub fn new(
        store: Arc<dyn SourcingStore>,
        jobs: Arc<dyn JobQueue>,
        crawler: Crawler,
        reprocessor: Arc<DeadLetterReprocessor>,
    ) -> Self {
        Self {
            store,
            jobs,
            crawler,
            reprocessor,
            backoff: BackoffPolicy::default(),
        }
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn jobs(&self) -> &Arc<dyn JobQueue> {
        &self.jobs
    }

    /// Leases and runs the next due job. `None` when the queue has nothing due.
    pub async fn run_next(&self) -> Result<Option<JobOutcome>, StoreError> {
        match self.jobs.dequeue(Utc::now()).await? {
            Some(job) => self.execute(job).await.map(Some),
            None => Ok(None),
        }
    }

    /// Runs due jobs until the queue is drained of due work; returns how many ran.
    pub async fn drain(&self) -> Result<usize, StoreError> {
        let mut ran = 0;
        while self.run_next().await?.is_some() {
            ran += 1;
        }
        Ok(ran)
    }

    pub async fn execute(&self, job: QueuedJob) -> Result<JobOutcome, StoreError> {
        let span = info_span!("job", job_id = %job.id, kind = job.kind.label(), attempts = job.attempts);
        async {
            let result: Result<(), (String, bool)> = match &job.kind {
                JobKind::FireScheduledJob { scheduled_job_id } => self
                    .fire(*scheduled_job_id)
                    .await
                    .map_err(|e| (e.to_string(), true)),
                JobKind::Crawl(task) => self
                    .crawler
                    .run(task)
                    .await
                    .map(|_| ())
                    .map_err(|e| (e.to_string(), e.retryable())),
                JobKind::ReprocessDeadLetters { count, queue_name } => self
                    .reprocessor
                    .drain(*count, queue_name.as_deref())
                    .await
                    .map(|_| ())
                    .map_err(|e| (e.to_string(), true)),
            };

            match result {
                Ok(()) => {
                    self.jobs.complete(job.id).await?;
                    Ok(JobOutcome::Completed)
                }
                Err((message, true)) if (job.attempts as usize) < self.backoff.max_retries => {
                    let delay = self.backoff.delay_for_attempt(job.attempts as usize);
                    let run_at = Utc::now()
                        + Duration::from_std(delay).unwrap_or_else(|_| Duration::minutes(30));
                    warn!(error = %message, %run_at, "job failed; rescheduled");
                    self.jobs.reschedule(job.id, run_at, &message).await?;
                    Ok(JobOutcome::Rescheduled { run_at })
                }
                Err((message, _)) => {
                    error!(error = %message, "job failed permanently");
                    self.jobs.fail(job.id, &message).await?;
                    Ok(JobOutcome::Failed)
                }
            }
        }
        .instrument(span)
        .await
    }

    /// Starts the crawl for a scheduled job and advances its lifecycle.
    async fn fire(&self, scheduled_job_id: Uuid) -> Result<(), StoreError> {
        let now = Utc::now();
        let Some(mut job) = self.store.job(scheduled_job_id).await? else {
            warn!(%scheduled_job_id, "scheduled job no longer exists");
            return Ok(());
        };
        if !job.is_active() {
            debug!(status = job.status.as_str(), "scheduled job is not active");
            return Ok(());
        }
        if job.timed_out(now) {
            job.status = JobStatus::Expired;
            self.store.update_job(&job).await?;
            info!(%scheduled_job_id, "scheduled job expired");
            return Ok(());
        }
        // Queue entries written before a re-arm outlive it; only the current arming fires.
        if job.start_utc > now {
            debug!(start_utc = %job.start_utc, "scheduled job re-armed for later; skipping");
            return Ok(());
        }

        let polling = job.execution_mode == ExecutionMode::PollUntilConditionMet;
        if !polling && job.last_enqueued_utc.is_some() {
            debug!("one-time job already fired for this arming");
            return Ok(());
        }
        if polling && job.attempt_count > 0 {
            // Each poll crawls afresh under its own resource index.
            job.resource_index_id = Uuid::new_v4();
            job.bypass_cache = true;
            job.page_cursor = None;
        }

        if let Some(entry_id) = job.catalog_entry_id {
            self.store.touch_catalog(entry_id, now).await?;
        }
        self.jobs
            .enqueue(JobKind::Crawl(root_task(&job)), now)
            .await?;
        job.last_enqueued_utc = Some(now);

        if polling {
            job.attempt_count += 1;
            if job.polling_finished(now) {
                job.status = JobStatus::Completed;
            } else {
                let interval = job.polling_interval_secs.unwrap_or(DEFAULT_POLL_INTERVAL_SECS);
                self.jobs
                    .enqueue(
                        JobKind::FireScheduledJob { scheduled_job_id },
                        now + Duration::seconds(interval),
                    )
                    .await?;
            }
        } else {
            // Completed by the crawler once the root document lands.
            job.attempt_count += 1;
        }

        self.store.update_job(&job).await?;
        info!(
            %scheduled_job_id,
            href = %job.href,
            document_type = %job.document_type,
            status = job.status.as_str(),
            "scheduled job fired"
        );
        Ok(())
    }
}

fn root_task(job: &ScheduledJob) -> CrawlTask {
    CrawlTask {
        resource_index_id: job.resource_index_id,
        url: job.href.clone(),
        parent_item_id: None,
        parent_url: None,
        depth: 0,
        provider: job.provider,
        sport: job.sport,
        document_type: job.document_type,
        season_year: job.season_year,
        scheduled_job_id: Some(job.id),
        correlation_id: job.correlation_id,
        bypass_cache: job.bypass_cache,
    }
}

/// Runs `workers` job loops until shutdown. A job interrupted by shutdown goes back to the queue.
pub async fn run_workers(
    runner: Arc<JobRunner>,
    workers: usize,
    idle: StdDuration,
    shutdown: watch::Receiver<bool>,
) {
    let mut set = JoinSet::new();
    for worker in 0..workers.max(1) {
        let runner = runner.clone();
        let mut shutdown = shutdown.clone();
        set.spawn(async move {
            debug!(worker, "job worker started");
            loop {
                if *shutdown.borrow() {
                    break;
                }
                let job = match runner.jobs().dequeue(Utc::now()).await {
                    Ok(job) => job,
                    Err(err) => {
                        error!(worker, error = %err, "dequeue failed");
                        None
                    }
                };
                let Some(job) = job else {
                    tokio::select! {
                        _ = tokio::time::sleep(idle) => {}
                        changed = shutdown.changed() => {
                            if changed.is_err() {
                                break;
                            }
                        }
                    }
                    continue;
                };

                let job_id = job.id;
                tokio::select! {
                    result = runner.execute(job) => {
                        if let Err(err) = result {
                            error!(worker, %job_id, error = %err, "job bookkeeping failed");
                        }
                    }
                    _ = shutdown.changed() => {
                        if let Err(err) = runner.jobs().requeue(job_id).await {
                            error!(worker, %job_id, error = %err, "failed to requeue interrupted job");
                        }
                        break;
                    }
                }
            }
            debug!(worker, "job worker stopped");
        });
    }
    while set.join_next().await.is_some() {}
}

/// A polling job for one trigger of a recurring catalog entry.
pub fn recurring_job(entry: &ResourceCatalogEntry, now: DateTime<Utc>) -> ScheduledJob {
    ScheduledJob {
        id: Uuid::new_v4(),
        catalog_entry_id: Some(entry.id),
        href: entry.endpoint.clone(),
        provider: entry.provider,
        sport: entry.sport,
        document_type: entry.document_type,
        season_year: entry.season_year,
        execution_mode: ExecutionMode::PollUntilConditionMet,
        start_utc: now,
        end_utc: Some(now + Duration::days(1)),
        polling_interval_secs: Some(DEFAULT_POLL_INTERVAL_SECS),
        max_attempts: Some(RECURRING_MAX_ATTEMPTS),
        attempt_count: 0,
        status: JobStatus::Active,
        last_enqueued_utc: None,
        last_completed_utc: None,
        page_cursor: None,
        timeout_after_utc: Some(now + Duration::days(2)),
        resource_index_id: Uuid::new_v4(),
        correlation_id: Uuid::new_v4(),
        bypass_cache: true,
    }
}

/// Registers one cron job per enabled recurring catalog entry. Not started.
pub async fn build_cron_scheduler(
    store: Arc<dyn SourcingStore>,
    entries: Vec<ResourceCatalogEntry>,
) -> anyhow::Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    for entry in entries
        .into_iter()
        .filter(|e| e.is_recurring && e.is_enabled)
    {
        let Some(cron) = entry.cron_expression.clone() else {
            continue;
        };
        let store = store.clone();
        let job = Job::new_async(cron.as_str(), move |_uuid, _lock| {
            let store = store.clone();
            let entry = entry.clone();
            Box::pin(async move {
                let job = recurring_job(&entry, Utc::now());
                match store.save_schedule(&[], std::slice::from_ref(&job)).await {
                    Ok(()) => info!(
                        scheduled_job_id = %job.id,
                        endpoint = %entry.endpoint,
                        "recurring catalog entry scheduled"
                    ),
                    Err(err) => error!(endpoint = %entry.endpoint, error = %err, "recurring schedule failed"),
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
    }
    Ok(sched)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MemoryBus;
    use crate::dead_letter::MemoryDeadLetterQueue;
    use crate::store::MemorySourcingStore;
    use async_trait::async_trait;
    use sdp_core::{DocumentType, SourceDataProvider, Sport};
    use sdp_storage::{DocumentFetcher, DocumentSource, FetchError, FetchedResponse, RawDocumentStore};
    use tempfile::TempDir;

    struct Unavailable;

    #[async_trait]
    impl DocumentSource for Unavailable {
        async fn fetch(
            &self,
            _provider: SourceDataProvider,
            url: &str,
        ) -> Result<FetchedResponse, FetchError> {
            Err(FetchError::SourceUnavailable {
                status: 503,
                url: url.to_string(),
            })
        }
    }

    fn runner(dir: &TempDir, store: &MemorySourcingStore) -> JobRunner {
        let bus = MemoryBus::new();
        let crawler = Crawler::new(
            DocumentFetcher::new(RawDocumentStore::new(dir.path()), Arc::new(Unavailable)),
            Arc::new(store.clone()),
            Arc::new(store.clone()),
            Arc::new(bus.clone()),
            2,
        );
        let reprocessor = DeadLetterReprocessor::new(
            Arc::new(MemoryDeadLetterQueue::new()),
            Arc::new(bus),
            Arc::new(store.clone()),
            None,
        );
        JobRunner::new(
            Arc::new(store.clone()),
            Arc::new(store.clone()),
            crawler,
            Arc::new(reprocessor),
        )
    }

    fn entry() -> ResourceCatalogEntry {
        crate::catalog::seed_catalog(Sport::FootballNfl)
            .into_iter()
            .find(|e| e.is_recurring)
            .expect("recurring venue entry")
    }

    #[tokio::test]
    async fn polling_job_refires_until_max_attempts() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = MemorySourcingStore::new();
        let runner = runner(&dir, &store);
        let mut job = recurring_job(&entry(), Utc::now());
        job.polling_interval_secs = Some(0);
        store.save_schedule(&[], std::slice::from_ref(&job)).await.expect("save");

        let mut fired = 0;
        while let Some(queued) = store.dequeue(Utc::now()).await.expect("dequeue") {
            if matches!(queued.kind, JobKind::FireScheduledJob { .. }) {
                fired += 1;
                runner.execute(queued).await.expect("execute");
            } else {
                store.complete(queued.id).await.expect("skip crawl");
            }
        }

        assert_eq!(fired, RECURRING_MAX_ATTEMPTS);
        let saved = store.job(job.id).await.expect("job").expect("exists");
        assert_eq!(saved.status, JobStatus::Completed);
        assert_eq!(saved.attempt_count, RECURRING_MAX_ATTEMPTS);
        assert_ne!(saved.resource_index_id, job.resource_index_id);
    }

    #[tokio::test]
    async fn timed_out_job_expires_without_crawling() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = MemorySourcingStore::new();
        let runner = runner(&dir, &store);
        let mut job = recurring_job(&entry(), Utc::now());
        job.timeout_after_utc = Some(Utc::now() - Duration::minutes(1));
        store.save_schedule(&[], std::slice::from_ref(&job)).await.expect("save");

        assert_eq!(runner.drain().await.expect("drain"), 1);
        let saved = store.job(job.id).await.expect("job").expect("exists");
        assert_eq!(saved.status, JobStatus::Expired);
        assert!(store.queued().await.is_empty());
    }

    #[tokio::test]
    async fn retryable_crawl_failure_is_rescheduled_with_backoff() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = MemorySourcingStore::new();
        let runner = runner(&dir, &store);
        let mut job = recurring_job(&entry(), Utc::now());
        job.execution_mode = ExecutionMode::OneTime;
        store.save_schedule(&[], std::slice::from_ref(&job)).await.expect("save");

        runner.run_next().await.expect("fire");
        let outcome = runner.run_next().await.expect("crawl").expect("a job ran");

        assert!(matches!(outcome, JobOutcome::Rescheduled { .. }));
        let queued = store.queued().await;
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].attempts, 1);
        assert!(queued[0].run_at > Utc::now());
        let saved = store.job(job.id).await.expect("job").expect("exists");
        assert!(saved.last_completed_utc.is_none());
        assert_eq!(saved.status, JobStatus::Active);
        assert!(saved.last_enqueued_utc.is_some());
        assert_eq!(job.document_type, DocumentType::Venue);
    }

    #[tokio::test]
    async fn fire_entry_ahead_of_start_is_skipped() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = MemorySourcingStore::new();
        let runner = runner(&dir, &store);
        let mut job = recurring_job(&entry(), Utc::now());
        job.execution_mode = ExecutionMode::OneTime;
        store.save_schedule(&[], std::slice::from_ref(&job)).await.expect("save");

        // Re-armed after its original fire entry was queued.
        job.start_utc = Utc::now() + Duration::minutes(10);
        store.update_job(&job).await.expect("re-arm");

        assert_eq!(runner.drain().await.expect("drain"), 1);
        let saved = store.job(job.id).await.expect("job").expect("exists");
        assert_eq!(saved.attempt_count, 0);
        assert!(saved.last_enqueued_utc.is_none());
        assert!(store.queued().await.is_empty());
    }
}
