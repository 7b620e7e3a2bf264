use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use sdp_core::{
    causation, slugify, Address, Audit, ExternalId, Venue, VenueCreated, VenueUpdated,
};
use sdp_storage::{DataContext, UnitOfWork};
use tracing::{info, info_span, Instrument};
use uuid::Uuid;

use crate::dto::EspnVenueDto;
use crate::processors::image_requests;
use crate::{DocumentProcessor, ProcessDocumentCommand, ProcessOutcome, ProcessingError};

pub struct VenueDocumentProcessor<C> {
    context: Arc<C>,
}

impl<C: DataContext> VenueDocumentProcessor<C> {
    pub fn new(context: Arc<C>) -> Self {
        Self { context }
    }

    fn apply(venue: &mut Venue, dto: &EspnVenueDto) {
        venue.name = dto.full_name.clone();
        venue.short_name = dto.short_name.clone();
        venue.slug = slugify(&dto.full_name);
        venue.is_grass = dto.grass;
        venue.is_indoor = dto.indoor;
        venue.capacity = dto.capacity;
        venue.address = dto.address.as_ref().map(|a| Address {
            city: a.city.clone(),
            state: a.state.clone(),
            zip_code: a.zip_code.clone(),
            country: a.country.clone(),
        });
    }

    async fn process_internal(
        &self,
        command: &ProcessDocumentCommand,
    ) -> Result<ProcessOutcome, ProcessingError> {
        let dto: EspnVenueDto = command.parse()?;
        let mut work = self.context.begin().await?;
        let now = Utc::now();

        // The document's own "new" flag is never trusted; the external id decides.
        let existing: Option<Venue> = work
            .find_by_external_id(command.source_data_provider, &dto.id)
            .await?;

        if let Some(mut venue) = existing {
            let before = venue.clone();
            Self::apply(&mut venue, &dto);
            let changed = venue != before;
            venue.audit.touch(now, command.correlation_id);
            work.upsert(&venue).await?;
            if changed {
                work.stage(&VenueUpdated {
                    venue: venue.clone(),
                    correlation_id: command.correlation_id,
                    causation_id: causation::VENUE_DOCUMENT_PROCESSOR,
                })?;
            }
            let receipt = work.commit().await?;
            return Ok(ProcessOutcome {
                entity_id: venue.id,
                created: false,
                events_staged: receipt.events_staged,
            });
        }

        let mut venue = Venue {
            id: Uuid::new_v4(),
            name: String::new(),
            short_name: None,
            slug: String::new(),
            is_grass: false,
            is_indoor: false,
            capacity: None,
            address: None,
            images: Vec::new(),
            external_ids: vec![ExternalId::new(command.source_data_provider, dto.id.clone())
                .with_url_hash(command.url_hash.clone())],
            audit: Audit::created(now, command.correlation_id),
        };
        Self::apply(&mut venue, &dto);
        work.upsert(&venue).await?;

        let images = image_requests(
            command,
            venue.id,
            &dto.images,
            causation::VENUE_DOCUMENT_PROCESSOR,
        );
        if !images.is_empty() {
            info!(count = images.len(), "requesting venue images");
        }
        for request in &images {
            work.stage(request)?;
        }

        work.stage(&VenueCreated {
            venue: venue.clone(),
            correlation_id: command.correlation_id,
            causation_id: causation::VENUE_DOCUMENT_PROCESSOR,
        })?;
        let receipt = work.commit().await?;
        info!(venue_id = %venue.id, "venue created");

        Ok(ProcessOutcome {
            entity_id: venue.id,
            created: true,
            events_staged: receipt.events_staged,
        })
    }
}

#[async_trait]
impl<C: DataContext> DocumentProcessor for VenueDocumentProcessor<C> {
    fn name(&self) -> &'static str {
        "VenueDocumentProcessor"
    }

    async fn process(
        &self,
        command: &ProcessDocumentCommand,
    ) -> Result<ProcessOutcome, ProcessingError> {
        let span = info_span!("process_venue", correlation_id = %command.correlation_id);
        self.process_internal(command).instrument(span).await
    }
}
