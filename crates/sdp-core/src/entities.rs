//! Canonical entities produced by document processing.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::SourceDataProvider;

/// Provider-side identity of a canonical entity. `(provider, value)` is unique per entity kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalId {
    pub provider: SourceDataProvider,
    pub value: String,
    #[serde(default)]
    pub source_url_hash: Option<String>,
}

impl ExternalId {
    pub fn new(provider: SourceDataProvider, value: impl Into<String>) -> Self {
        Self {
            provider,
            value: value.into(),
            source_url_hash: None,
        }
    }

    pub fn with_url_hash(mut self, url_hash: impl Into<String>) -> Self {
        self.source_url_hash = Some(url_hash.into());
        self
    }
}

/// Creation and modification stamps shared by every canonical entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Audit {
    pub created_utc: DateTime<Utc>,
    pub created_by: Uuid,
    pub modified_utc: Option<DateTime<Utc>>,
    pub modified_by: Option<Uuid>,
}

impl Audit {
    pub fn created(at: DateTime<Utc>, by: Uuid) -> Self {
        Self {
            created_utc: at,
            created_by: by,
            modified_utc: None,
            modified_by: None,
        }
    }

    pub fn touch(&mut self, at: DateTime<Utc>, by: Uuid) {
        self.modified_utc = Some(at);
        self.modified_by = Some(by);
    }
}

/// A persisted, provider-independent entity.
pub trait CanonicalEntity: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Stable discriminator used as the storage kind.
    const KIND: &'static str;

    fn id(&self) -> Uuid;
    fn external_ids(&self) -> &[ExternalId];
    fn audit_mut(&mut self) -> &mut Audit;

    fn has_external_id(&self, provider: SourceDataProvider, value: &str) -> bool {
        self.external_ids()
            .iter()
            .any(|e| e.provider == provider && e.value == value)
    }
}

/// A stored copy of a provider image attached to its entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityImage {
    pub id: Uuid,
    pub url: String,
    /// Hash of the provider URL the image was fetched from; one image per hash.
    pub original_url_hash: String,
    pub height: u32,
    pub width: u32,
    #[serde(default)]
    pub rel: Option<Vec<String>>,
    pub created_utc: DateTime<Utc>,
    pub created_by: Uuid,
}

/// Entities that carry images or logos.
pub trait HasImages: CanonicalEntity {
    fn images(&self) -> &[EntityImage];
    fn images_mut(&mut self) -> &mut Vec<EntityImage>;
}

macro_rules! has_images {
    ($($ty:ty),+) => {
        $(impl HasImages for $ty {
            fn images(&self) -> &[EntityImage] {
                &self.images
            }

            fn images_mut(&mut self) -> &mut Vec<EntityImage> {
                &mut self.images
            }
        })+
    };
}

macro_rules! canonical_entity {
    ($ty:ty, $kind:literal) => {
        impl CanonicalEntity for $ty {
            const KIND: &'static str = $kind;

            fn id(&self) -> Uuid {
                self.id
            }

            fn external_ids(&self) -> &[ExternalId] {
                &self.external_ids
            }

            fn audit_mut(&mut self) -> &mut Audit {
                &mut self.audit
            }
        }
    };
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Address {
    pub city: Option<String>,
    pub state: Option<String>,
    pub zip_code: Option<String>,
    pub country: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Venue {
    pub id: Uuid,
    pub name: String,
    pub short_name: Option<String>,
    pub slug: String,
    pub is_grass: bool,
    pub is_indoor: bool,
    pub capacity: Option<i32>,
    pub address: Option<Address>,
    #[serde(default)]
    pub images: Vec<EntityImage>,
    pub external_ids: Vec<ExternalId>,
    pub audit: Audit,
}

canonical_entity!(Venue, "venue");

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Season {
    pub id: Uuid,
    pub year: i32,
    pub name: String,
    pub start_utc: Option<DateTime<Utc>>,
    pub end_utc: Option<DateTime<Utc>>,
    pub external_ids: Vec<ExternalId>,
    pub audit: Audit,
}

canonical_entity!(Season, "season");

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Athlete {
    pub id: Uuid,
    pub first_name: String,
    pub last_name: String,
    pub display_name: String,
    pub short_name: Option<String>,
    pub slug: String,
    pub position: Option<String>,
    pub height_in: Option<f64>,
    pub weight_lb: Option<f64>,
    pub is_active: bool,
    #[serde(default)]
    pub images: Vec<EntityImage>,
    pub external_ids: Vec<ExternalId>,
    pub audit: Audit,
}

canonical_entity!(Athlete, "athlete");

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Franchise {
    pub id: Uuid,
    pub slug: String,
    pub name: String,
    pub nickname: Option<String>,
    pub abbreviation: Option<String>,
    pub display_name: String,
    pub display_name_short: Option<String>,
    pub color_code_hex: Option<String>,
    pub alt_color_code_hex: Option<String>,
    pub is_active: bool,
    pub venue_id: Option<Uuid>,
    #[serde(default)]
    pub images: Vec<EntityImage>,
    pub external_ids: Vec<ExternalId>,
    pub audit: Audit,
}

canonical_entity!(Franchise, "franchise");

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FranchiseSeason {
    pub id: Uuid,
    pub franchise_id: Uuid,
    pub season_year: i32,
    pub slug: String,
    pub display_name: String,
    pub abbreviation: Option<String>,
    pub color_code_hex: Option<String>,
    pub is_active: bool,
    pub group_id: Option<Uuid>,
    pub venue_id: Option<Uuid>,
    #[serde(default)]
    pub images: Vec<EntityImage>,
    pub external_ids: Vec<ExternalId>,
    pub audit: Audit,
}

canonical_entity!(FranchiseSeason, "franchise_season");

/// A conference or division.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Group {
    pub id: Uuid,
    pub name: String,
    pub short_name: Option<String>,
    pub abbreviation: Option<String>,
    pub slug: String,
    pub is_conference: bool,
    pub parent_group_id: Option<Uuid>,
    #[serde(default)]
    pub images: Vec<EntityImage>,
    pub external_ids: Vec<ExternalId>,
    pub audit: Audit,
}

canonical_entity!(Group, "group");

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupSeason {
    pub id: Uuid,
    pub group_id: Uuid,
    pub season_year: i32,
    pub external_ids: Vec<ExternalId>,
    pub audit: Audit,
}

canonical_entity!(GroupSeason, "group_season");

has_images!(Venue, Athlete, Franchise, FranchiseSeason, Group);

/// Lowercased, dash-separated slug built from display text.
pub fn slugify(input: &str) -> String {
    input
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("-")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slugify_collapses_punctuation() {
        assert_eq!(slugify("Texas A&M  Aggies"), "texas-a-m-aggies");
        assert_eq!(slugify("  Lambeau Field "), "lambeau-field");
    }

    #[test]
    fn external_id_lookup_matches_provider_and_value() {
        let venue = Venue {
            id: Uuid::new_v4(),
            name: "Stadium".into(),
            short_name: None,
            slug: "stadium".into(),
            is_grass: true,
            is_indoor: false,
            capacity: None,
            address: None,
            images: Vec::new(),
            external_ids: vec![ExternalId::new(SourceDataProvider::Espn, "v-42")],
            audit: Audit::created(Utc::now(), Uuid::nil()),
        };
        assert!(venue.has_external_id(SourceDataProvider::Espn, "v-42"));
        assert!(!venue.has_external_id(SourceDataProvider::Cbs, "v-42"));
    }
}
