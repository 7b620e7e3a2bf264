mod common;

use std::sync::Arc;

use sdp_core::{SourceDataProvider, Sport};
use sdp_storage::{DocumentFetcher, RawDocumentStore};
use sdp_sync::crawl::Crawler;
use sdp_sync::dead_letter::MemoryDeadLetterQueue;
use sdp_sync::scheduler::lock_key;
use sdp_sync::store::JobStatus;
use sdp_sync::worker::JobRunner;
use sdp_sync::{
    DeadLetterReprocessor, MemoryBus, MemorySourcingStore, SourceSeasonRequest, SourcingError,
    SourcingLock, SourcingScheduler, SourcingStore, TierDelayOverrides, TierDelayTable,
};

use common::StaticSource;

fn scheduler(store: &Arc<MemorySourcingStore>) -> SourcingScheduler {
    SourcingScheduler::new(store.clone(), store.clone(), TierDelayTable::default())
}

fn request(force: bool) -> SourceSeasonRequest {
    SourceSeasonRequest {
        sport: Sport::BasketballNba,
        provider: SourceDataProvider::Espn,
        season_year: 2023,
        tier_delays: None,
        force,
    }
}

#[tokio::test]
async fn unforced_requests_reuse_the_first_correlation() {
    let store = Arc::new(MemorySourcingStore::new());
    let scheduler = scheduler(&store);

    let first = scheduler.source_season(request(false)).await.expect("first");
    let catalog = store
        .catalog(SourceDataProvider::Espn, Sport::BasketballNba)
        .await
        .expect("catalog");
    let second = scheduler.source_season(request(false)).await.expect("second");

    assert_eq!(first, second);
    assert!(!catalog.is_empty());
    assert_eq!(
        store
            .catalog(SourceDataProvider::Espn, Sport::BasketballNba)
            .await
            .expect("catalog")
            .len(),
        catalog.len()
    );
    assert_eq!(store.all_jobs().await.len(), 4);
    assert_eq!(store.queued().await.len(), 4);
    let jobs = store
        .jobs_for_season(SourceDataProvider::Espn, Sport::BasketballNba, 2023)
        .await
        .expect("jobs");
    assert_eq!(jobs.len(), 4);
}

#[tokio::test]
async fn negative_delay_writes_nothing() {
    let store = Arc::new(MemorySourcingStore::new());
    let err = scheduler(&store)
        .source_season(SourceSeasonRequest {
            tier_delays: Some(TierDelayOverrides {
                athlete_season: Some(-5),
                ..Default::default()
            }),
            ..request(false)
        })
        .await
        .expect_err("negative delay");

    assert!(matches!(err, SourcingError::Validation(_)));
    assert!(store.all_jobs().await.is_empty());
    assert!(store.queued().await.is_empty());
}

#[tokio::test]
async fn forced_request_refuses_while_another_holds_the_lock() {
    let store = Arc::new(MemorySourcingStore::new());
    let key = lock_key(Sport::BasketballNba, 2023);
    assert!(store.try_acquire(key).await.expect("acquire"));

    let err = scheduler(&store)
        .source_season(request(true))
        .await
        .expect_err("lock held");
    assert!(matches!(
        err,
        SourcingError::AlreadyRunning { sport: Sport::BasketballNba, season_year: 2023 }
    ));
    assert!(store.all_jobs().await.is_empty());

    store.release(key).await.expect("release");
    scheduler(&store)
        .source_season(request(true))
        .await
        .expect("forced after release");
    assert_eq!(store.all_jobs().await.len(), 4);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_unforced_requests_settle_on_one_schedule() {
    let store = Arc::new(MemorySourcingStore::new());
    let scheduler = Arc::new(scheduler(&store));

    let mut handles = Vec::new();
    for _ in 0..8 {
        let scheduler = scheduler.clone();
        handles.push(tokio::spawn(async move {
            scheduler.source_season(request(false)).await
        }));
    }
    let mut ids = Vec::new();
    for handle in handles {
        ids.push(handle.await.expect("join").expect("scheduled"));
    }

    assert!(ids.iter().all(|id| *id == ids[0]));
    assert_eq!(store.all_jobs().await.len(), 4);
    assert_eq!(store.queued().await.len(), 4);
}

fn delays(minutes: i64) -> Option<TierDelayOverrides> {
    Some(TierDelayOverrides {
        season: Some(minutes),
        venue: Some(minutes),
        team_season: Some(minutes),
        athlete_season: Some(minutes),
    })
}

#[tokio::test]
async fn rearmed_season_ignores_fire_entries_from_before() {
    let documents = tempfile::tempdir().expect("tempdir");
    let store = Arc::new(MemorySourcingStore::new());
    let bus = MemoryBus::new();
    let scheduler = scheduler(&store);
    scheduler
        .source_season(SourceSeasonRequest {
            tier_delays: delays(0),
            ..request(false)
        })
        .await
        .expect("first");
    scheduler
        .source_season(SourceSeasonRequest {
            tier_delays: delays(600),
            ..request(true)
        })
        .await
        .expect("forced");

    let crawler = Crawler::new(
        DocumentFetcher::new(
            RawDocumentStore::new(documents.path().to_path_buf()),
            Arc::new(StaticSource::default()),
        ),
        store.clone(),
        store.clone(),
        Arc::new(bus.clone()),
        2,
    );
    let reprocessor = DeadLetterReprocessor::new(
        Arc::new(MemoryDeadLetterQueue::new()),
        Arc::new(bus.clone()),
        store.clone(),
        None,
    );
    let runner = JobRunner::new(store.clone(), store.clone(), crawler, Arc::new(reprocessor));

    // Only the four entries from the first arming are due, and each is a no-op.
    assert_eq!(runner.drain().await.expect("drain"), 4);
    for job in store.all_jobs().await {
        assert_eq!(job.status, JobStatus::Active);
        assert_eq!(job.attempt_count, 0);
        assert!(job.last_enqueued_utc.is_none());
    }
    assert_eq!(store.queued().await.len(), 4);
    assert!(bus.published().await.is_empty());
}
