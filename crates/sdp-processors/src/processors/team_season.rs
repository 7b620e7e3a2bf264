use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use sdp_core::{
    causation, slugify, Audit, CanonicalEntity, DocumentType, ExternalId, Franchise,
    FranchiseSeason, FranchiseSeasonCreated, Group, SourceDataProvider, Venue,
};
use sdp_storage::{StoreError, TeamSportContext, UnitOfWork};
use tracing::{info_span, warn, Instrument};
use uuid::Uuid;

use crate::dto::{EspnRef, EspnTeamSeasonDto};
use crate::processors::{dependency_request, image_requests};
use crate::{DocumentProcessor, ProcessDocumentCommand, ProcessOutcome, ProcessingError};

pub struct TeamSeasonDocumentProcessor<C> {
    context: Arc<C>,
}

async fn resolve_ref<T, W>(
    work: &mut W,
    provider: SourceDataProvider,
    reference: Option<&EspnRef>,
) -> Result<Option<T>, StoreError>
where
    T: CanonicalEntity,
    W: UnitOfWork,
{
    match reference.and_then(EspnRef::id) {
        Some(value) => work.find_by_external_id(provider, &value).await,
        None => Ok(None),
    }
}

impl<C: TeamSportContext> TeamSeasonDocumentProcessor<C> {
    pub fn new(context: Arc<C>) -> Self {
        Self { context }
    }

    fn apply(season: &mut FranchiseSeason, dto: &EspnTeamSeasonDto) {
        season.slug = dto
            .slug
            .clone()
            .unwrap_or_else(|| slugify(&dto.display_name));
        season.display_name = dto.display_name.clone();
        season.abbreviation = dto.abbreviation.clone();
        season.color_code_hex = dto.color.clone();
        season.is_active = dto.is_active;
    }

    async fn process_internal(
        &self,
        command: &ProcessDocumentCommand,
    ) -> Result<ProcessOutcome, ProcessingError> {
        let dto: EspnTeamSeasonDto = command.parse()?;
        let season_year = command.require_season()?;
        let franchise_ref = dto.franchise.as_ref().ok_or(ProcessingError::MissingField {
            document_type: DocumentType::TeamSeason,
            field: "franchise",
        })?;
        let provider = command.source_data_provider;
        let now = Utc::now();
        let mut work = self.context.begin().await?;

        let franchise: Option<Franchise> = resolve_ref(&mut work, provider, Some(franchise_ref)).await?;
        let Some(franchise) = franchise else {
            // Commit only the request so the franchise gets sourced, then let the caller retry.
            if let Some(request) = dependency_request(
                command,
                franchise_ref,
                DocumentType::Franchise,
                causation::TEAM_SEASON_DOCUMENT_PROCESSOR,
            ) {
                work.stage(&request)?;
                work.commit().await?;
            }
            warn!(href = %franchise_ref.href, "franchise not yet processed");
            return Err(ProcessingError::MissingDependency {
                document_type: DocumentType::TeamSeason,
                dependency: DocumentType::Franchise,
                value: franchise_ref.id().unwrap_or_else(|| franchise_ref.href.clone()),
            });
        };

        let group: Option<Group> = resolve_ref(&mut work, provider, dto.groups.as_ref()).await?;
        let venue: Option<Venue> = resolve_ref(&mut work, provider, dto.venue.as_ref()).await?;
        let external_value = format!("{}:{}", dto.id, season_year);

        let existing: Option<FranchiseSeason> =
            work.find_by_external_id(provider, &external_value).await?;

        if let Some(mut season) = existing {
            Self::apply(&mut season, &dto);
            season.group_id = group.map(|g| g.id).or(season.group_id);
            season.venue_id = venue.map(|v| v.id).or(season.venue_id);
            season.audit.touch(now, command.correlation_id);
            work.upsert(&season).await?;
            let receipt = work.commit().await?;
            return Ok(ProcessOutcome {
                entity_id: season.id,
                created: false,
                events_staged: receipt.events_staged,
            });
        }

        let mut season = FranchiseSeason {
            id: Uuid::new_v4(),
            franchise_id: franchise.id,
            season_year,
            slug: String::new(),
            display_name: String::new(),
            abbreviation: None,
            color_code_hex: None,
            is_active: false,
            group_id: group.map(|g| g.id),
            venue_id: venue.map(|v| v.id),
            images: Vec::new(),
            external_ids: vec![ExternalId::new(provider, external_value)
                .with_url_hash(command.url_hash.clone())],
            audit: Audit::created(now, command.correlation_id),
        };
        Self::apply(&mut season, &dto);
        work.upsert(&season).await?;

        for request in image_requests(
            command,
            season.id,
            &dto.logos,
            causation::TEAM_SEASON_DOCUMENT_PROCESSOR,
        ) {
            work.stage(&request)?;
        }
        work.stage(&FranchiseSeasonCreated {
            franchise_season: season.clone(),
            correlation_id: command.correlation_id,
            causation_id: causation::TEAM_SEASON_DOCUMENT_PROCESSOR,
        })?;
        let receipt = work.commit().await?;

        Ok(ProcessOutcome {
            entity_id: season.id,
            created: true,
            events_staged: receipt.events_staged,
        })
    }
}

#[async_trait]
impl<C: TeamSportContext> DocumentProcessor for TeamSeasonDocumentProcessor<C> {
    fn name(&self) -> &'static str {
        "TeamSeasonDocumentProcessor"
    }

    async fn process(
        &self,
        command: &ProcessDocumentCommand,
    ) -> Result<ProcessOutcome, ProcessingError> {
        let span = info_span!(
            "process_team_season",
            correlation_id = %command.correlation_id,
            season = ?command.season
        );
        self.process_internal(command).instrument(span).await
    }
}
