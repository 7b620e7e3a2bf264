use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use sdp_core::{causation, slugify, Athlete, AthleteCreated, Audit, ExternalId};
use sdp_storage::{DataContext, UnitOfWork};
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

use crate::dto::EspnAthleteDto;
use crate::processors::image_requests;
use crate::{DocumentProcessor, ProcessDocumentCommand, ProcessOutcome, ProcessingError};

/// Handles both athlete and athlete-season documents; the season view carries the same identity.
pub struct AthleteDocumentProcessor<C> {
    context: Arc<C>,
}

impl<C: DataContext> AthleteDocumentProcessor<C> {
    pub fn new(context: Arc<C>) -> Self {
        Self { context }
    }

    fn apply(athlete: &mut Athlete, dto: &EspnAthleteDto) {
        athlete.first_name = dto.first_name.clone();
        athlete.last_name = dto.last_name.clone();
        athlete.display_name = dto.display_name.clone();
        athlete.short_name = dto.short_name.clone();
        athlete.slug = dto
            .slug
            .clone()
            .unwrap_or_else(|| slugify(&dto.display_name));
        athlete.position = dto
            .position
            .as_ref()
            .and_then(|p| p.abbreviation.clone().or_else(|| p.display_name.clone()));
        athlete.height_in = dto.height;
        athlete.weight_lb = dto.weight;
        athlete.is_active = dto.active;
    }

    async fn process_internal(
        &self,
        command: &ProcessDocumentCommand,
    ) -> Result<ProcessOutcome, ProcessingError> {
        let dto: EspnAthleteDto = command.parse()?;
        let now = Utc::now();
        let mut work = self.context.begin().await?;

        let existing: Option<Athlete> = work
            .find_by_external_id(command.source_data_provider, &dto.id)
            .await?;

        if let Some(mut athlete) = existing {
            Self::apply(&mut athlete, &dto);
            athlete.audit.touch(now, command.correlation_id);
            work.upsert(&athlete).await?;
            let receipt = work.commit().await?;
            return Ok(ProcessOutcome {
                entity_id: athlete.id,
                created: false,
                events_staged: receipt.events_staged,
            });
        }

        let mut athlete = Athlete {
            id: Uuid::new_v4(),
            first_name: String::new(),
            last_name: String::new(),
            display_name: String::new(),
            short_name: None,
            slug: String::new(),
            position: None,
            height_in: None,
            weight_lb: None,
            is_active: false,
            images: Vec::new(),
            external_ids: vec![ExternalId::new(command.source_data_provider, dto.id.clone())
                .with_url_hash(command.url_hash.clone())],
            audit: Audit::created(now, command.correlation_id),
        };
        Self::apply(&mut athlete, &dto);
        work.upsert(&athlete).await?;

        let headshots: Vec<_> = dto.headshot.iter().cloned().collect();
        for request in image_requests(
            command,
            athlete.id,
            &headshots,
            causation::ATHLETE_DOCUMENT_PROCESSOR,
        ) {
            work.stage(&request)?;
        }
        work.stage(&AthleteCreated {
            athlete: athlete.clone(),
            correlation_id: command.correlation_id,
            causation_id: causation::ATHLETE_DOCUMENT_PROCESSOR,
        })?;
        let receipt = work.commit().await?;
        debug!(athlete_id = %athlete.id, "athlete created");

        Ok(ProcessOutcome {
            entity_id: athlete.id,
            created: true,
            events_staged: receipt.events_staged,
        })
    }
}

#[async_trait]
impl<C: DataContext> DocumentProcessor for AthleteDocumentProcessor<C> {
    fn name(&self) -> &'static str {
        "AthleteDocumentProcessor"
    }

    async fn process(
        &self,
        command: &ProcessDocumentCommand,
    ) -> Result<ProcessOutcome, ProcessingError> {
        let span = info_span!("process_athlete", correlation_id = %command.correlation_id);
        self.process_internal(command).instrument(span).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processors::test_support::command;
    use sdp_core::{CanonicalEntity, DocumentType, SourceDataProvider};
    use sdp_storage::memory::IndividualSportMemoryContext;

    #[tokio::test]
    async fn athlete_with_headshot_requests_one_image() {
        let ctx = Arc::new(IndividualSportMemoryContext::new());
        let processor = AthleteDocumentProcessor::new(ctx.clone());
        let doc = r#"{
            "id": 9478,
            "firstName": "Scottie",
            "lastName": "Scheffler",
            "displayName": "Scottie Scheffler",
            "active": true,
            "headshot": { "href": "https://a.espncdn.com/i/headshots/golf/players/full/9478.png", "width": 350, "height": 254 }
        }"#;

        let outcome = processor
            .process(&command(DocumentType::Athlete, None, doc))
            .await
            .expect("process");

        assert!(outcome.created);
        let athletes = ctx.entities::<Athlete>().await.expect("athletes");
        assert_eq!(athletes[0].slug, "scottie-scheffler");
        assert!(athletes[0].has_external_id(SourceDataProvider::Espn, "9478"));
        let outbox = ctx.outbox().await;
        assert_eq!(outbox.len(), 2);
        assert_eq!(outbox[0].body["name"], format!("{}-0.png", outcome.entity_id));
    }
}
