//! Bus contracts: document events, image requests and integration events.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::entities::{Athlete, Franchise, FranchiseSeason, Group, GroupSeason, Season, Venue};
use crate::{DocumentType, SourceDataProvider, Sport};

/// A message that can be staged in the outbox or published on the bus.
pub trait IntegrationEvent: Serialize + Send + Sync {
    const MESSAGE_TYPE: &'static str;

    fn correlation_id(&self) -> Uuid;
    fn causation_id(&self) -> Uuid;
}

macro_rules! integration_event {
    ($ty:ty, $name:literal) => {
        impl IntegrationEvent for $ty {
            const MESSAGE_TYPE: &'static str = $name;

            fn correlation_id(&self) -> Uuid {
                self.correlation_id
            }

            fn causation_id(&self) -> Uuid {
                self.causation_id
            }
        }
    };
}

/// A dependency a processor needs fetched before it can complete its own document.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestedDependency {
    #[serde(rename = "type")]
    pub document_type: DocumentType,
    pub url_hash: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentCreated {
    pub id: String,
    #[serde(default)]
    pub parent_id: Option<String>,
    pub name: String,
    #[serde(rename = "ref")]
    pub href: String,
    pub source_ref: String,
    pub document_json: String,
    pub source_url_hash: String,
    pub sport: Sport,
    #[serde(default)]
    pub season_year: Option<i32>,
    pub document_type: DocumentType,
    pub source_data_provider: SourceDataProvider,
    pub correlation_id: Uuid,
    pub causation_id: Uuid,
    #[serde(default)]
    pub attempt_count: u32,
    #[serde(default)]
    pub include_linked_document_types: Option<Vec<DocumentType>>,
    #[serde(default)]
    pub requested_dependencies: Option<BTreeSet<RequestedDependency>>,
}

integration_event!(DocumentCreated, "DocumentCreated");

/// Asks the sourcing side to fetch a single document outside a scheduled crawl.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentRequested {
    pub id: String,
    #[serde(default)]
    pub parent_id: Option<String>,
    pub href: String,
    pub sport: Sport,
    #[serde(default)]
    pub season_year: Option<i32>,
    pub document_type: DocumentType,
    pub source_data_provider: SourceDataProvider,
    pub correlation_id: Uuid,
    pub causation_id: Uuid,
}

integration_event!(DocumentRequested, "DocumentRequested");

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessImageRequest {
    pub url: String,
    pub image_id: Uuid,
    pub parent_entity_id: Uuid,
    pub name: String,
    pub sport: Sport,
    #[serde(default)]
    pub season_year: Option<i32>,
    pub document_type: DocumentType,
    pub source_data_provider: SourceDataProvider,
    pub height: u32,
    pub width: u32,
    #[serde(default)]
    pub rel: Option<Vec<String>>,
    pub correlation_id: Uuid,
    pub causation_id: Uuid,
}

integration_event!(ProcessImageRequest, "ProcessImageRequest");

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessImageResponse {
    pub uri: String,
    pub image_id: Uuid,
    pub original_url_hash: String,
    pub parent_entity_id: Uuid,
    pub name: String,
    pub height: u32,
    pub width: u32,
    pub sport: Sport,
    #[serde(default)]
    pub season_year: Option<i32>,
    pub document_type: DocumentType,
    pub source_data_provider: SourceDataProvider,
    #[serde(default)]
    pub rel: Option<Vec<String>>,
    pub correlation_id: Uuid,
    pub causation_id: Uuid,
}

integration_event!(ProcessImageResponse, "ProcessImageResponse");

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VenueCreated {
    pub venue: Venue,
    pub correlation_id: Uuid,
    pub causation_id: Uuid,
}

integration_event!(VenueCreated, "VenueCreated");

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VenueUpdated {
    pub venue: Venue,
    pub correlation_id: Uuid,
    pub causation_id: Uuid,
}

integration_event!(VenueUpdated, "VenueUpdated");

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeasonCreated {
    pub season: Season,
    pub correlation_id: Uuid,
    pub causation_id: Uuid,
}

integration_event!(SeasonCreated, "SeasonCreated");

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AthleteCreated {
    pub athlete: Athlete,
    pub correlation_id: Uuid,
    pub causation_id: Uuid,
}

integration_event!(AthleteCreated, "AthleteCreated");

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FranchiseCreated {
    pub franchise: Franchise,
    pub correlation_id: Uuid,
    pub causation_id: Uuid,
}

integration_event!(FranchiseCreated, "FranchiseCreated");

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FranchiseSeasonCreated {
    pub franchise_season: FranchiseSeason,
    pub correlation_id: Uuid,
    pub causation_id: Uuid,
}

integration_event!(FranchiseSeasonCreated, "FranchiseSeasonCreated");

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConferenceCreated {
    pub group: Group,
    pub correlation_id: Uuid,
    pub causation_id: Uuid,
}

integration_event!(ConferenceCreated, "ConferenceCreated");

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConferenceSeasonCreated {
    pub group_season: GroupSeason,
    pub correlation_id: Uuid,
    pub causation_id: Uuid,
}

integration_event!(ConferenceSeasonCreated, "ConferenceSeasonCreated");
