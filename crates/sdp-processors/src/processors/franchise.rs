use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use sdp_core::{
    causation, slugify, Audit, DocumentType, ExternalId, Franchise, FranchiseCreated, Venue,
};
use sdp_storage::{TeamSportContext, UnitOfWork};
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

use crate::dto::EspnFranchiseDto;
use crate::processors::{dependency_request, image_requests};
use crate::{DocumentProcessor, ProcessDocumentCommand, ProcessOutcome, ProcessingError};

pub struct FranchiseDocumentProcessor<C> {
    context: Arc<C>,
}

impl<C: TeamSportContext> FranchiseDocumentProcessor<C> {
    pub fn new(context: Arc<C>) -> Self {
        Self { context }
    }

    fn apply(franchise: &mut Franchise, dto: &EspnFranchiseDto) {
        franchise.slug = dto
            .slug
            .clone()
            .unwrap_or_else(|| slugify(&dto.display_name));
        franchise.name = dto.name.clone();
        franchise.nickname = dto.nickname.clone();
        franchise.abbreviation = dto.abbreviation.clone();
        franchise.display_name = dto.display_name.clone();
        franchise.display_name_short = dto.short_display_name.clone();
        franchise.color_code_hex = dto.color.clone();
        franchise.alt_color_code_hex = dto.alternate_color.clone();
        franchise.is_active = dto.is_active;
    }

    async fn process_internal(
        &self,
        command: &ProcessDocumentCommand,
    ) -> Result<ProcessOutcome, ProcessingError> {
        let dto: EspnFranchiseDto = command.parse()?;
        let now = Utc::now();
        let mut work = self.context.begin().await?;

        // A missing venue does not block the franchise; request it and link on a later pass.
        let mut venue_id = None;
        if let Some(venue_ref) = &dto.venue {
            let venue: Option<Venue> = match venue_ref.id() {
                Some(value) => {
                    work.find_by_external_id(command.source_data_provider, &value)
                        .await?
                }
                None => None,
            };
            match venue {
                Some(venue) => venue_id = Some(venue.id),
                None => {
                    if let Some(request) = dependency_request(
                        command,
                        venue_ref,
                        DocumentType::Venue,
                        causation::FRANCHISE_DOCUMENT_PROCESSOR,
                    ) {
                        debug!(href = %venue_ref.href, "venue not yet processed; requesting");
                        work.stage(&request)?;
                    }
                }
            }
        }

        let existing: Option<Franchise> = work
            .find_by_external_id(command.source_data_provider, &dto.id)
            .await?;

        if let Some(mut franchise) = existing {
            Self::apply(&mut franchise, &dto);
            franchise.venue_id = venue_id.or(franchise.venue_id);
            franchise.audit.touch(now, command.correlation_id);
            work.upsert(&franchise).await?;
            let receipt = work.commit().await?;
            return Ok(ProcessOutcome {
                entity_id: franchise.id,
                created: false,
                events_staged: receipt.events_staged,
            });
        }

        let mut franchise = Franchise {
            id: Uuid::new_v4(),
            slug: String::new(),
            name: String::new(),
            nickname: None,
            abbreviation: None,
            display_name: String::new(),
            display_name_short: None,
            color_code_hex: None,
            alt_color_code_hex: None,
            is_active: false,
            venue_id,
            images: Vec::new(),
            external_ids: vec![ExternalId::new(command.source_data_provider, dto.id.clone())
                .with_url_hash(command.url_hash.clone())],
            audit: Audit::created(now, command.correlation_id),
        };
        Self::apply(&mut franchise, &dto);
        work.upsert(&franchise).await?;

        for request in image_requests(
            command,
            franchise.id,
            &dto.logos,
            causation::FRANCHISE_DOCUMENT_PROCESSOR,
        ) {
            work.stage(&request)?;
        }
        work.stage(&FranchiseCreated {
            franchise: franchise.clone(),
            correlation_id: command.correlation_id,
            causation_id: causation::FRANCHISE_DOCUMENT_PROCESSOR,
        })?;
        let receipt = work.commit().await?;

        Ok(ProcessOutcome {
            entity_id: franchise.id,
            created: true,
            events_staged: receipt.events_staged,
        })
    }
}

#[async_trait]
impl<C: TeamSportContext> DocumentProcessor for FranchiseDocumentProcessor<C> {
    fn name(&self) -> &'static str {
        "FranchiseDocumentProcessor"
    }

    async fn process(
        &self,
        command: &ProcessDocumentCommand,
    ) -> Result<ProcessOutcome, ProcessingError> {
        let span = info_span!("process_franchise", correlation_id = %command.correlation_id);
        self.process_internal(command).instrument(span).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processors::test_support::command;
    use crate::VenueDocumentProcessor;
    use sdp_storage::memory::TeamSportMemoryContext;

    const FRANCHISE: &str = r#"{
        "id": "245",
        "slug": "texas-a-m-aggies",
        "location": "Texas A&M",
        "name": "Aggies",
        "abbreviation": "TA&M",
        "displayName": "Texas A&M Aggies",
        "color": "500000",
        "isActive": true,
        "logos": [{ "href": "https://a.espncdn.com/i/teamlogos/ncaa/500/245.png", "width": 500, "height": 500 }],
        "venue": { "$ref": "http://sports.core.api.espn.com/v2/sports/football/leagues/college-football/venues/3958?lang=en" }
    }"#;

    #[tokio::test]
    async fn unknown_venue_is_requested() {
        let ctx = Arc::new(TeamSportMemoryContext::new());
        let processor = FranchiseDocumentProcessor::new(ctx.clone());

        let outcome = processor
            .process(&command(DocumentType::Franchise, None, FRANCHISE))
            .await
            .expect("process");

        let franchises = ctx.entities::<Franchise>().await.expect("franchises");
        assert_eq!(franchises[0].venue_id, None);
        let types: Vec<_> = ctx.outbox().await.into_iter().map(|m| m.message_type).collect();
        assert_eq!(
            types,
            vec!["DocumentRequested", "ProcessImageRequest", "FranchiseCreated"]
        );
        assert_eq!(outcome.events_staged, 3);
    }

    #[tokio::test]
    async fn known_venue_is_linked() {
        let ctx = Arc::new(TeamSportMemoryContext::new());
        let venue = VenueDocumentProcessor::new(ctx.clone())
            .process(&command(
                DocumentType::Venue,
                None,
                r#"{"id":"3958","fullName":"Kyle Field"}"#,
            ))
            .await
            .expect("venue");

        FranchiseDocumentProcessor::new(ctx.clone())
            .process(&command(DocumentType::Franchise, None, FRANCHISE))
            .await
            .expect("franchise");

        let franchises = ctx.entities::<Franchise>().await.expect("franchises");
        assert_eq!(franchises[0].venue_id, Some(venue.entity_id));
    }
}
