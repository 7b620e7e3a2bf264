use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use sdp_core::{causation, Audit, ExternalId, Season, SeasonCreated};
use sdp_storage::{DataContext, UnitOfWork};
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

use crate::dto::EspnSeasonDto;
use crate::{DocumentProcessor, ProcessDocumentCommand, ProcessOutcome, ProcessingError};

pub struct SeasonDocumentProcessor<C> {
    context: Arc<C>,
}

impl<C: DataContext> SeasonDocumentProcessor<C> {
    pub fn new(context: Arc<C>) -> Self {
        Self { context }
    }

    async fn process_internal(
        &self,
        command: &ProcessDocumentCommand,
    ) -> Result<ProcessOutcome, ProcessingError> {
        let dto: EspnSeasonDto = command.parse()?;
        let external_value = dto.year.to_string();
        let name = dto
            .display_name
            .clone()
            .unwrap_or_else(|| external_value.clone());
        let now = Utc::now();
        let mut work = self.context.begin().await?;

        let existing: Option<Season> = work
            .find_by_external_id(command.source_data_provider, &external_value)
            .await?;

        let (season, created) = match existing {
            Some(mut season) => {
                season.name = name;
                season.start_utc = dto.start_date.or(season.start_utc);
                season.end_utc = dto.end_date.or(season.end_utc);
                season.audit.touch(now, command.correlation_id);
                (season, false)
            }
            None => (
                Season {
                    id: Uuid::new_v4(),
                    year: dto.year,
                    name,
                    start_utc: dto.start_date,
                    end_utc: dto.end_date,
                    external_ids: vec![ExternalId::new(
                        command.source_data_provider,
                        external_value,
                    )
                    .with_url_hash(command.url_hash.clone())],
                    audit: Audit::created(now, command.correlation_id),
                },
                true,
            ),
        };

        work.upsert(&season).await?;
        if created {
            work.stage(&SeasonCreated {
                season: season.clone(),
                correlation_id: command.correlation_id,
                causation_id: causation::SEASON_DOCUMENT_PROCESSOR,
            })?;
        }
        let receipt = work.commit().await?;
        debug!(season_id = %season.id, year = season.year, created, "season processed");

        Ok(ProcessOutcome {
            entity_id: season.id,
            created,
            events_staged: receipt.events_staged,
        })
    }
}

#[async_trait]
impl<C: DataContext> DocumentProcessor for SeasonDocumentProcessor<C> {
    fn name(&self) -> &'static str {
        "SeasonDocumentProcessor"
    }

    async fn process(
        &self,
        command: &ProcessDocumentCommand,
    ) -> Result<ProcessOutcome, ProcessingError> {
        let span = info_span!("process_season", correlation_id = %command.correlation_id);
        self.process_internal(command).instrument(span).await
    }
}
