//! ESPN document processors.

use sdp_core::hashing::url_hash;
use sdp_core::{DocumentRequested, DocumentType, ProcessImageRequest};
use uuid::Uuid;

use crate::dto::{EspnImage, EspnRef};
use crate::ProcessDocumentCommand;

mod athlete;
mod franchise;
mod group_season;
mod season;
mod team_season;
mod venue;

pub use athlete::AthleteDocumentProcessor;
pub use franchise::FranchiseDocumentProcessor;
pub use group_season::GroupBySeasonDocumentProcessor;
pub use season::SeasonDocumentProcessor;
pub use team_season::TeamSeasonDocumentProcessor;
pub use venue::VenueDocumentProcessor;

/// One `ProcessImageRequest` per image; the image service resolves storage independently.
pub(crate) fn image_requests(
    command: &ProcessDocumentCommand,
    parent_entity_id: Uuid,
    images: &[EspnImage],
    causation_id: Uuid,
) -> Vec<ProcessImageRequest> {
    images
        .iter()
        .enumerate()
        .map(|(index, image)| ProcessImageRequest {
            url: image.href.clone(),
            image_id: Uuid::new_v4(),
            parent_entity_id,
            name: format!("{parent_entity_id}-{index}.png"),
            sport: command.sport,
            season_year: command.season,
            document_type: command.document_type,
            source_data_provider: command.source_data_provider,
            height: image.height,
            width: image.width,
            rel: (!image.rel.is_empty()).then(|| image.rel.clone()),
            correlation_id: command.correlation_id,
            causation_id,
        })
        .collect()
}

/// Follow-on request for a referenced document this processor could not find.
pub(crate) fn dependency_request(
    command: &ProcessDocumentCommand,
    reference: &EspnRef,
    document_type: DocumentType,
    causation_id: Uuid,
) -> Option<DocumentRequested> {
    let id = url_hash(&reference.href).ok()?;
    Some(DocumentRequested {
        id,
        parent_id: Some(command.url_hash.clone()),
        href: reference.href.clone(),
        sport: command.sport,
        season_year: command.season,
        document_type,
        source_data_provider: command.source_data_provider,
        correlation_id: command.correlation_id,
        causation_id,
    })
}

#[cfg(test)]
pub(crate) mod test_support {
    use sdp_core::{DocumentType, SourceDataProvider, Sport};
    use uuid::Uuid;

    use crate::ProcessDocumentCommand;

    pub fn command(document_type: DocumentType, season: Option<i32>, document: &str) -> ProcessDocumentCommand {
        ProcessDocumentCommand {
            source_data_provider: SourceDataProvider::Espn,
            sport: Sport::FootballNcaa,
            season,
            document_type,
            document: document.to_string(),
            href: "http://sports.core.api.espn.com/v2/test".into(),
            url_hash: "hash".into(),
            parent_id: None,
            correlation_id: Uuid::new_v4(),
            causation_id: Uuid::nil(),
        }
    }
}
