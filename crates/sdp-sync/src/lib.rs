//! Sourcing, crawl and delivery pipeline.
//!
//! [`SyncPipeline`] wires the pieces together: the sourcing scheduler writes
//! scheduled jobs, workers fire them into crawl tasks, crawled documents go
//! onto the bus, the consumer runs processors, and outbox dispatchers relay
//! what processors committed.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use sdp_core::{SourceDataProvider, Sport};
use sdp_processors::{ProcessorFactory, ProcessorRouter};
use sdp_storage::memory::{IndividualSportMemoryContext, TeamSportMemoryContext};
use sdp_storage::{
    DataContext, DocumentFetcher, DocumentSource, HttpFetcher,
    IndividualSportSchema, OutboxStore, PgContext, RawDocumentStore, TeamSportContext,
    TeamSportSchema,
};
use sqlx::postgres::PgPoolOptions;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{info, warn};

pub mod bus;
pub mod catalog;
pub mod config;
pub mod consumer;
pub mod crawl;
pub mod dead_letter;
pub mod outbox;
pub mod pg;
pub mod scheduler;
pub mod store;
pub mod worker;

pub use bus::{DeliveryMode, Envelope, MemoryBus, MessageBus};
pub use config::{PipelineConfig, TierDelayOverrides, TierDelayTable, TierDelays};
pub use dead_letter::{DeadLetterReprocessor, ReprocessRequest};
pub use scheduler::{SourceSeasonRequest, SourcingError, SourcingScheduler};
pub use store::{JobQueue, MemorySourcingStore, SourcingLock, SourcingStore};

use crate::consumer::DocumentConsumer;
use crate::crawl::Crawler;
use crate::dead_letter::{DeadLetterQueue, MemoryDeadLetterQueue};
use crate::outbox::OutboxDispatcher;
use crate::pg::{PgBus, PgDeadLetterQueue, PgSourcingStore};
use crate::worker::{build_cron_scheduler, JobRunner};

pub const CRATE_NAME: &str = "sdp-sync";

const BUS_BATCH: usize = 100;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PumpReport {
    pub relayed: usize,
    pub consumed: usize,
    pub jobs_run: usize,
}

pub struct SyncPipeline {
    config: PipelineConfig,
    store: Arc<dyn SourcingStore>,
    jobs: Arc<dyn JobQueue>,
    bus: Arc<dyn MessageBus>,
    dispatchers: Vec<Arc<OutboxDispatcher>>,
    scheduler: Arc<SourcingScheduler>,
    reprocessor: Arc<DeadLetterReprocessor>,
    runner: Arc<JobRunner>,
    consumer: Arc<DocumentConsumer>,
}

/// Backends a pipeline is assembled from.
pub struct PipelineParts<S, T, I> {
    pub sourcing: Arc<S>,
    pub bus: Arc<dyn MessageBus>,
    pub dlq: Arc<dyn DeadLetterQueue>,
    pub team_sports: Arc<T>,
    pub individual_sports: Arc<I>,
    pub source: Arc<dyn DocumentSource>,
}

impl SyncPipeline {
    pub fn from_parts<S, T, I>(config: PipelineConfig, parts: PipelineParts<S, T, I>) -> Result<Self>
    where
        S: SourcingStore + JobQueue + SourcingLock + 'static,
        T: TeamSportContext + OutboxStore,
        I: DataContext + OutboxStore,
    {
        let store: Arc<dyn SourcingStore> = parts.sourcing.clone();
        let jobs: Arc<dyn JobQueue> = parts.sourcing.clone();
        let lock: Arc<dyn SourcingLock> = parts.sourcing.clone();
        let delays = config.tier_delay_table()?;

        let team_outbox: Arc<dyn OutboxStore> = parts.team_sports.clone();
        let individual_outbox: Arc<dyn OutboxStore> = parts.individual_sports.clone();
        let poll = Duration::from_millis(config.outbox_poll_ms);
        let dispatchers = [team_outbox, individual_outbox]
            .into_iter()
            .map(|outbox| {
                Arc::new(OutboxDispatcher::new(outbox, parts.bus.clone()).with_poll_interval(poll))
            })
            .collect();

        let router = ProcessorRouter::new(
            Arc::new(ProcessorFactory::team_sports(parts.team_sports)),
            Arc::new(ProcessorFactory::individual_sports(parts.individual_sports)),
        );
        let reprocessor = Arc::new(DeadLetterReprocessor::new(
            parts.dlq.clone(),
            parts.bus.clone(),
            jobs.clone(),
            Some(config.dead_letter_queue.clone()),
        ));
        let crawler = Crawler::new(
            DocumentFetcher::new(RawDocumentStore::new(config.documents_dir.clone()), parts.source),
            store.clone(),
            jobs.clone(),
            parts.bus.clone(),
            config.max_crawl_depth,
        );
        let runner = Arc::new(JobRunner::new(
            store.clone(),
            jobs.clone(),
            crawler,
            reprocessor.clone(),
        ));
        let consumer = Arc::new(DocumentConsumer::new(
            router,
            parts.bus.clone(),
            parts.dlq,
            jobs.clone(),
            config.dead_letter_queue.clone(),
            config.max_crawl_depth,
        ));

        Ok(Self {
            scheduler: Arc::new(SourcingScheduler::new(store.clone(), lock, delays)),
            config,
            store,
            jobs,
            bus: parts.bus,
            dispatchers,
            reprocessor,
            runner,
            consumer,
        })
    }

    /// Everything in process; documents still come from `source`.
    pub fn in_memory(config: PipelineConfig, source: Arc<dyn DocumentSource>) -> Result<Self> {
        Self::from_parts(
            config,
            PipelineParts {
                sourcing: Arc::new(MemorySourcingStore::new()),
                bus: Arc::new(MemoryBus::new()),
                dlq: Arc::new(MemoryDeadLetterQueue::new()),
                team_sports: Arc::new(TeamSportMemoryContext::new()),
                individual_sports: Arc::new(IndividualSportMemoryContext::new()),
                source,
            },
        )
    }

    /// Postgres-backed pipeline fetching over HTTP. Runs migrations first.
    pub async fn connect(config: PipelineConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections((config.workers as u32 + 4).max(8))
            .connect(&config.database_url)
            .await
            .context("connecting to postgres")?;
        pg::migrate(&pool).await.context("running migrations")?;

        let http = http_source(&config)?;

        Self::from_parts(
            config,
            PipelineParts {
                sourcing: Arc::new(PgSourcingStore::new(pool.clone())),
                bus: Arc::new(PgBus::new(pool.clone())),
                dlq: Arc::new(PgDeadLetterQueue::new(pool.clone())),
                team_sports: Arc::new(PgContext::<TeamSportSchema>::new(pool.clone())),
                individual_sports: Arc::new(PgContext::<IndividualSportSchema>::new(pool)),
                source: http,
            },
        )
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn SourcingStore> {
        &self.store
    }

    pub fn jobs(&self) -> &Arc<dyn JobQueue> {
        &self.jobs
    }

    pub fn bus(&self) -> &Arc<dyn MessageBus> {
        &self.bus
    }

    pub fn scheduler(&self) -> Arc<SourcingScheduler> {
        self.scheduler.clone()
    }

    pub fn reprocessor(&self) -> Arc<DeadLetterReprocessor> {
        self.reprocessor.clone()
    }

    /// Seeds the non-seasonal catalog for every sport.
    pub async fn seed_all(&self, provider: SourceDataProvider) -> Result<usize> {
        let mut inserted = 0;
        for sport in Sport::ALL {
            inserted += self
                .scheduler
                .seed_catalog(sport, provider)
                .await
                .with_context(|| format!("seeding catalog for {sport}"))?;
        }
        Ok(inserted)
    }

    /// Relays, consumes and runs due jobs on the calling task until nothing moves.
    pub async fn run_until_idle(&self) -> Result<PumpReport> {
        let mut report = PumpReport::default();
        loop {
            let mut progressed = false;
            for dispatcher in &self.dispatchers {
                let sent = dispatcher.dispatch_once().await?.sent;
                report.relayed += sent;
                progressed |= sent > 0;
            }

            let batch = self.bus.receive(BUS_BATCH).await?;
            progressed |= !batch.is_empty();
            for envelope in batch {
                self.consumer.consume(envelope).await?;
                report.consumed += 1;
            }

            if self.runner.run_next().await?.is_some() {
                report.jobs_run += 1;
                progressed = true;
            }

            if !progressed {
                return Ok(report);
            }
        }
    }

    /// Long-running mode: workers, consumer, outbox dispatchers and, when
    /// enabled, the cron scheduler. Returns once `shutdown` flips to true.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> Result<()> {
        for dispatcher in &self.dispatchers {
            dispatcher.recover().await.context("outbox start-up recovery")?;
        }

        let mut cron = if self.config.scheduler_enabled {
            let mut entries = Vec::new();
            for sport in Sport::ALL {
                entries.extend(self.store.catalog(SourceDataProvider::Espn, sport).await?);
            }
            let sched = build_cron_scheduler(self.store.clone(), entries).await?;
            sched.start().await.context("starting scheduler")?;
            Some(sched)
        } else {
            None
        };

        let idle = Duration::from_millis(self.config.outbox_poll_ms);
        let mut tasks = JoinSet::new();
        tasks.spawn(worker::run_workers(
            self.runner.clone(),
            self.config.workers,
            idle,
            shutdown.clone(),
        ));
        let consumer = self.consumer.clone();
        let consumer_shutdown = shutdown.clone();
        tasks.spawn(async move { consumer.run(BUS_BATCH, idle, consumer_shutdown).await });
        for dispatcher in &self.dispatchers {
            let dispatcher = dispatcher.clone();
            let shutdown = shutdown.clone();
            tasks.spawn(async move { dispatcher.run(shutdown).await });
        }
        info!(workers = self.config.workers, "pipeline running");

        while let Some(joined) = tasks.join_next().await {
            if let Err(err) = joined {
                warn!(error = %err, "pipeline task ended abnormally");
            }
        }
        if let Some(sched) = cron.as_mut() {
            sched.shutdown().await.context("stopping scheduler")?;
        }
        info!("pipeline stopped");
        Ok(())
    }
}

/// The live provider source, throttled per `config`.
pub fn http_source(config: &PipelineConfig) -> Result<Arc<dyn DocumentSource>> {
    let http = HttpFetcher::new(config.http_client_config()).context("building http client")?;
    Ok(Arc::new(http))
}

/// Applies pending migrations and returns.
pub async fn run_migrations(config: &PipelineConfig) -> Result<()> {
    let pool = PgPoolOptions::new()
        .max_connections(1)
        .connect(&config.database_url)
        .await
        .context("connecting to postgres")?;
    pg::migrate(&pool).await.context("running migrations")?;
    info!("migrations applied");
    Ok(())
}

pub async fn connect_from_env() -> Result<SyncPipeline> {
    SyncPipeline::connect(PipelineConfig::from_env()).await
}
