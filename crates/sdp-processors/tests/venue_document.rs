use std::sync::Arc;

use sdp_core::{DocumentType, SourceDataProvider, Sport, Venue};
use sdp_processors::{ProcessDocumentCommand, ProcessorFactory, ProcessorRouter};
use sdp_storage::memory::{IndividualSportMemoryContext, TeamSportMemoryContext};
use uuid::Uuid;

fn venue_command(correlation_id: Uuid) -> ProcessDocumentCommand {
    ProcessDocumentCommand {
        source_data_provider: SourceDataProvider::Espn,
        sport: Sport::FootballNfl,
        season: None,
        document_type: DocumentType::Venue,
        document: r#"{"id":"v-42","fullName":"Lambeau Field","capacity":81441,"grass":true}"#.into(),
        href: "http://sports.core.api.espn.com/v2/sports/football/leagues/nfl/venues/v-42".into(),
        url_hash: "c0ffee".into(),
        parent_id: None,
        correlation_id,
        causation_id: Uuid::nil(),
    }
}

#[tokio::test]
async fn redelivered_venue_document_is_idempotent() {
    let team = Arc::new(TeamSportMemoryContext::new());
    let router = ProcessorRouter::new(
        Arc::new(ProcessorFactory::team_sports(team.clone())),
        Arc::new(ProcessorFactory::individual_sports(Arc::new(
            IndividualSportMemoryContext::new(),
        ))),
    );

    let first_cmd = venue_command(Uuid::new_v4());
    let processor = router
        .resolve(first_cmd.source_data_provider, first_cmd.sport, first_cmd.document_type)
        .expect("venue processor");
    let first = processor.process(&first_cmd).await.expect("first delivery");
    let second = processor
        .process(&venue_command(Uuid::new_v4()))
        .await
        .expect("second delivery");

    assert!(first.created);
    assert!(!second.created);
    assert_eq!(first.entity_id, second.entity_id);

    let venues = team.entities::<Venue>().await.expect("venues");
    assert_eq!(venues.len(), 1);
    assert_eq!(venues[0].name, "Lambeau Field");
    assert!(venues[0].audit.modified_utc.is_some());

    let created: Vec<_> = team
        .outbox()
        .await
        .into_iter()
        .filter(|m| m.message_type == "VenueCreated")
        .collect();
    assert_eq!(created.len(), 1);
    assert_eq!(team.outbox().await.len(), 1);
}
