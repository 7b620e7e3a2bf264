//! Attaches stored images to their parent entities once the image service responds.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use sdp_core::{
    Athlete, CanonicalEntity, DocumentType, EntityImage, Franchise, FranchiseSeason, Group,
    HasImages, ProcessImageResponse, SportFamily, Venue,
};
use sdp_storage::{DataContext, UnitOfWork};
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::{ProcessingError, ProcessorKey};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageOutcome {
    Attached { entity_id: Uuid },
    AlreadyAttached,
    /// The parent entity is unknown; the response is dropped.
    MissingParent,
}

#[async_trait]
pub trait ApplyImageResponse: Send + Sync {
    async fn apply(&self, response: &ProcessImageResponse) -> Result<ImageOutcome, ProcessingError>;
}

pub struct ImageResponseProcessor<C> {
    context: Arc<C>,
}

impl<C: DataContext> ImageResponseProcessor<C> {
    pub fn new(context: Arc<C>) -> Self {
        Self { context }
    }

    async fn attach<T: HasImages>(
        &self,
        response: &ProcessImageResponse,
    ) -> Result<ImageOutcome, ProcessingError> {
        let mut work = self.context.begin().await?;
        let Some(mut entity) = work.find::<T>(response.parent_entity_id).await? else {
            warn!(
                kind = T::KIND,
                parent_entity_id = %response.parent_entity_id,
                "image response for an unknown parent"
            );
            return Ok(ImageOutcome::MissingParent);
        };

        if entity
            .images()
            .iter()
            .any(|image| image.original_url_hash == response.original_url_hash)
        {
            debug!(kind = T::KIND, "image already attached");
            return Ok(ImageOutcome::AlreadyAttached);
        }

        let now = Utc::now();
        entity.images_mut().push(EntityImage {
            id: response.image_id,
            url: response.uri.clone(),
            original_url_hash: response.original_url_hash.clone(),
            height: response.height,
            width: response.width,
            rel: response.rel.clone(),
            created_utc: now,
            created_by: response.correlation_id,
        });
        entity.audit_mut().touch(now, response.correlation_id);
        work.upsert(&entity).await?;
        work.commit().await?;

        let entity_id = entity.id();
        info!(kind = T::KIND, %entity_id, "image attached");
        Ok(ImageOutcome::Attached { entity_id })
    }

    fn require_team_family(&self, response: &ProcessImageResponse) -> Result<(), ProcessingError> {
        if self.context.family() == SportFamily::TeamSports {
            return Ok(());
        }
        Err(ProcessingError::UnregisteredProcessor(ProcessorKey::new(
            response.source_data_provider,
            response.sport,
            response.document_type,
        )))
    }

    async fn apply_internal(
        &self,
        response: &ProcessImageResponse,
    ) -> Result<ImageOutcome, ProcessingError> {
        match response.document_type {
            DocumentType::Venue | DocumentType::VenueImage => self.attach::<Venue>(response).await,
            DocumentType::Athlete | DocumentType::AthleteImage | DocumentType::AthleteSeason => {
                self.attach::<Athlete>(response).await
            }
            DocumentType::Franchise | DocumentType::FranchiseLogo => {
                self.require_team_family(response)?;
                self.attach::<Franchise>(response).await
            }
            DocumentType::TeamSeason | DocumentType::TeamSeasonLogo => {
                self.require_team_family(response)?;
                self.attach::<FranchiseSeason>(response).await
            }
            DocumentType::GroupSeason | DocumentType::GroupSeasonLogo => {
                self.require_team_family(response)?;
                self.attach::<Group>(response).await
            }
            other => Err(ProcessingError::UnregisteredProcessor(ProcessorKey::new(
                response.source_data_provider,
                response.sport,
                other,
            ))),
        }
    }
}

#[async_trait]
impl<C: DataContext> ApplyImageResponse for ImageResponseProcessor<C> {
    async fn apply(&self, response: &ProcessImageResponse) -> Result<ImageOutcome, ProcessingError> {
        let span = info_span!(
            "apply_image_response",
            document_type = %response.document_type,
            correlation_id = %response.correlation_id
        );
        self.apply_internal(response).instrument(span).await
    }
}
