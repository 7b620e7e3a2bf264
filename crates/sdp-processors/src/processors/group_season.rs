use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use sdp_core::{
    causation, slugify, Audit, ConferenceCreated, ConferenceSeasonCreated, ExternalId, Group,
    GroupSeason,
};
use sdp_storage::{Query, TeamSportContext, UnitOfWork};
use serde_json::json;
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

use crate::dto::EspnGroupBySeasonDto;
use crate::processors::image_requests;
use crate::{DocumentProcessor, ProcessDocumentCommand, ProcessOutcome, ProcessingError};

/// Conferences and divisions as seen within one season. Produces the group once and a
/// group-season row per year.
pub struct GroupBySeasonDocumentProcessor<C> {
    context: Arc<C>,
}

impl<C: TeamSportContext> GroupBySeasonDocumentProcessor<C> {
    pub fn new(context: Arc<C>) -> Self {
        Self { context }
    }

    async fn process_internal(
        &self,
        command: &ProcessDocumentCommand,
    ) -> Result<ProcessOutcome, ProcessingError> {
        let dto: EspnGroupBySeasonDto = command.parse()?;
        let season_year = command.require_season()?;
        let provider = command.source_data_provider;
        let now = Utc::now();
        let mut work = self.context.begin().await?;

        let parent_group_id = match dto.parent.as_ref().and_then(|p| p.id()) {
            Some(value) => work
                .find_by_external_id::<Group>(provider, &value)
                .await?
                .map(|g| g.id),
            None => None,
        };

        let existing: Option<Group> = work.find_by_external_id(provider, &dto.id).await?;
        let mut created = false;
        let group = match existing {
            Some(mut group) => {
                group.name = dto.name.clone();
                group.short_name = dto.short_name.clone();
                group.abbreviation = dto.abbreviation.clone();
                group.is_conference = dto.is_conference;
                group.parent_group_id = parent_group_id.or(group.parent_group_id);
                group.audit.touch(now, command.correlation_id);
                work.upsert(&group).await?;
                group
            }
            None => {
                let group = Group {
                    id: Uuid::new_v4(),
                    name: dto.name.clone(),
                    short_name: dto.short_name.clone(),
                    abbreviation: dto.abbreviation.clone(),
                    slug: slugify(&dto.name),
                    is_conference: dto.is_conference,
                    parent_group_id,
                    images: Vec::new(),
                    external_ids: vec![ExternalId::new(provider, dto.id.clone())
                        .with_url_hash(command.url_hash.clone())],
                    audit: Audit::created(now, command.correlation_id),
                };
                work.upsert(&group).await?;
                for request in image_requests(
                    command,
                    group.id,
                    &dto.logos,
                    causation::GROUP_BY_SEASON_DOCUMENT_PROCESSOR,
                ) {
                    work.stage(&request)?;
                }
                work.stage(&ConferenceCreated {
                    group: group.clone(),
                    correlation_id: command.correlation_id,
                    causation_id: causation::GROUP_BY_SEASON_DOCUMENT_PROCESSOR,
                })?;
                created = true;
                group
            }
        };

        let seasons: Vec<GroupSeason> = work
            .query(
                &Query::new()
                    .eq("group_id", json!(group.id))
                    .eq("season_year", json!(season_year)),
            )
            .await?;
        if seasons.is_empty() {
            let group_season = GroupSeason {
                id: Uuid::new_v4(),
                group_id: group.id,
                season_year,
                external_ids: vec![ExternalId::new(
                    provider,
                    format!("{}:{}", dto.id, season_year),
                )],
                audit: Audit::created(now, command.correlation_id),
            };
            work.upsert(&group_season).await?;
            work.stage(&ConferenceSeasonCreated {
                group_season,
                correlation_id: command.correlation_id,
                causation_id: causation::GROUP_BY_SEASON_DOCUMENT_PROCESSOR,
            })?;
            created = true;
        }

        let receipt = work.commit().await?;
        debug!(group_id = %group.id, season_year, created, "group season processed");

        Ok(ProcessOutcome {
            entity_id: group.id,
            created,
            events_staged: receipt.events_staged,
        })
    }
}

#[async_trait]
impl<C: TeamSportContext> DocumentProcessor for GroupBySeasonDocumentProcessor<C> {
    fn name(&self) -> &'static str {
        "GroupBySeasonDocumentProcessor"
    }

    async fn process(
        &self,
        command: &ProcessDocumentCommand,
    ) -> Result<ProcessOutcome, ProcessingError> {
        let span = info_span!("process_group_season", correlation_id = %command.correlation_id);
        self.process_internal(command).instrument(span).await
    }
}
