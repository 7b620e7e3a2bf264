mod common;

use std::sync::Arc;

use chrono::Utc;
use sdp_core::{
    causation, DocumentCreated, DocumentType, IntegrationEvent, SourceDataProvider, Sport,
    VenueCreated, MAX_ATTEMPTS,
};
use sdp_processors::{ProcessDocumentCommand, ProcessorFactory, ProcessorRouter};
use sdp_storage::memory::{IndividualSportMemoryContext, TeamSportMemoryContext};
use sdp_storage::{DocumentFetcher, RawDocumentStore};
use sdp_sync::crawl::Crawler;
use sdp_sync::dead_letter::{DeadLetterMessage, DeadLetterQueue, MemoryDeadLetterQueue};
use sdp_sync::outbox::OutboxDispatcher;
use sdp_sync::worker::{JobOutcome, JobRunner};
use sdp_sync::{
    DeadLetterReprocessor, Envelope, MemoryBus, MemorySourcingStore, MessageBus, ReprocessRequest,
};
use uuid::Uuid;

use common::{venue, StaticSource, NFL};

const QUEUE: &str = "document-dead-letter";

fn created(n: usize) -> DocumentCreated {
    DocumentCreated {
        id: format!("hash-{n}"),
        parent_id: None,
        name: format!("venue {n}"),
        href: format!("{NFL}/venues/{n}"),
        source_ref: format!("{NFL}/venues/{n}"),
        document_json: venue(n as u32, "Arrowhead Stadium"),
        source_url_hash: format!("hash-{n}"),
        sport: Sport::FootballNfl,
        season_year: None,
        document_type: DocumentType::Venue,
        source_data_provider: SourceDataProvider::Espn,
        correlation_id: Uuid::new_v4(),
        causation_id: causation::PROVIDER_RESOURCE_INDEX_ITEM,
        attempt_count: MAX_ATTEMPTS,
        include_linked_document_types: None,
        requested_dependencies: None,
    }
}

#[tokio::test]
async fn committed_events_survive_a_bus_outage() {
    let team = Arc::new(TeamSportMemoryContext::new());
    let bus = MemoryBus::new();
    let router = ProcessorRouter::new(
        Arc::new(ProcessorFactory::team_sports(team.clone())),
        Arc::new(ProcessorFactory::individual_sports(Arc::new(
            IndividualSportMemoryContext::new(),
        ))),
    );
    let command = ProcessDocumentCommand::from(&created(7));
    router
        .resolve(command.source_data_provider, command.sport, command.document_type)
        .expect("venue processor")
        .process(&command)
        .await
        .expect("process");

    bus.set_online(false);
    let dispatcher = OutboxDispatcher::new(team.clone(), Arc::new(bus.clone()));
    let report = dispatcher.dispatch_once().await.expect("dispatch");
    assert!(report.interrupted);
    assert_eq!(bus.pending().await, 0);

    // Process restarts with the bus back.
    bus.set_online(true);
    let restarted = OutboxDispatcher::new(team.clone(), Arc::new(bus.clone()));
    assert_eq!(restarted.recover().await.expect("recover"), 1);

    let delivered = bus.receive(10).await.expect("receive");
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].message_type, VenueCreated::MESSAGE_TYPE);
    assert_eq!(delivered[0].correlation_id, command.correlation_id);
    assert!(team.outbox().await.iter().all(|m| m.sent_time.is_some()));
}

#[tokio::test]
async fn reprocess_moves_at_most_the_requested_count() {
    let documents = tempfile::tempdir().expect("tempdir");
    let store = Arc::new(MemorySourcingStore::new());
    let bus = MemoryBus::new();
    let dlq = MemoryDeadLetterQueue::new();
    for n in 0..10 {
        let envelope = Envelope::direct(&created(n)).expect("envelope");
        dlq.push(QUEUE, DeadLetterMessage::from_envelope(&envelope, "boom", MAX_ATTEMPTS))
            .await
            .expect("push");
    }

    let reprocessor = Arc::new(DeadLetterReprocessor::new(
        Arc::new(dlq.clone()),
        Arc::new(bus.clone()),
        store.clone(),
        None,
    ));
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
    let runner = JobRunner::new(store.clone(), store.clone(), crawler, reprocessor.clone());

    let job_id = reprocessor
        .reprocess(ReprocessRequest {
            count: 5,
            queue_name: None,
        })
        .await
        .expect("queued");
    assert_ne!(job_id, Uuid::nil());
    // Nothing moves until the job runs.
    assert_eq!(dlq.depth(QUEUE).await.expect("depth"), 10);

    assert_eq!(runner.run_next().await.expect("run"), Some(JobOutcome::Completed));

    assert_eq!(dlq.depth(QUEUE).await.expect("depth"), 5);
    let republished = bus.receive(10).await.expect("receive");
    assert_eq!(republished.len(), 5);
    for envelope in &republished {
        assert_eq!(envelope.causation_id, causation::DEAD_LETTER_REPROCESSOR);
        let event: DocumentCreated = envelope.decode().expect("decode");
        assert_eq!(event.attempt_count, MAX_ATTEMPTS - 1);
        assert!(envelope.published_utc <= Utc::now());
    }
}
