//! ESPN core API document shapes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer};
use url::Url;

fn string_or_number<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Number(i64),
    }

    Ok(match Raw::deserialize(deserializer)? {
        Raw::Text(text) => text,
        Raw::Number(n) => n.to_string(),
    })
}

#[derive(Debug, Clone, Deserialize)]
pub struct EspnRef {
    #[serde(rename = "$ref")]
    pub href: String,
}

impl EspnRef {
    /// Provider id of the referenced document: the last path segment.
    pub fn id(&self) -> Option<String> {
        let url = Url::parse(&self.href).ok()?;
        url.path_segments()?
            .filter(|s| !s.is_empty())
            .last()
            .map(str::to_string)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct EspnImage {
    pub href: String,
    #[serde(default)]
    pub width: u32,
    #[serde(default)]
    pub height: u32,
    #[serde(default)]
    pub rel: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EspnAddress {
    pub city: Option<String>,
    pub state: Option<String>,
    pub zip_code: Option<String>,
    pub country: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EspnVenueDto {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    pub full_name: String,
    #[serde(default)]
    pub short_name: Option<String>,
    #[serde(default)]
    pub address: Option<EspnAddress>,
    #[serde(default)]
    pub capacity: Option<i32>,
    #[serde(default)]
    pub grass: bool,
    #[serde(default)]
    pub indoor: bool,
    #[serde(default)]
    pub images: Vec<EspnImage>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EspnSeasonDto {
    pub year: i32,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub start_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_date: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EspnPosition {
    #[serde(default)]
    pub abbreviation: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EspnAthleteDto {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    pub display_name: String,
    #[serde(default)]
    pub short_name: Option<String>,
    #[serde(default)]
    pub slug: Option<String>,
    #[serde(default)]
    pub position: Option<EspnPosition>,
    #[serde(default)]
    pub height: Option<f64>,
    #[serde(default)]
    pub weight: Option<f64>,
    #[serde(default)]
    pub active: bool,
    #[serde(default)]
    pub headshot: Option<EspnImage>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EspnFranchiseDto {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    #[serde(default)]
    pub slug: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    pub name: String,
    #[serde(default)]
    pub nickname: Option<String>,
    #[serde(default)]
    pub abbreviation: Option<String>,
    pub display_name: String,
    #[serde(default)]
    pub short_display_name: Option<String>,
    #[serde(default)]
    pub color: Option<String>,
    #[serde(default)]
    pub alternate_color: Option<String>,
    #[serde(default)]
    pub is_active: bool,
    #[serde(default)]
    pub logos: Vec<EspnImage>,
    #[serde(default)]
    pub venue: Option<EspnRef>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EspnTeamSeasonDto {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    #[serde(default)]
    pub slug: Option<String>,
    pub display_name: String,
    #[serde(default)]
    pub abbreviation: Option<String>,
    #[serde(default)]
    pub color: Option<String>,
    #[serde(default)]
    pub is_active: bool,
    #[serde(default)]
    pub logos: Vec<EspnImage>,
    #[serde(default)]
    pub franchise: Option<EspnRef>,
    #[serde(default)]
    pub groups: Option<EspnRef>,
    #[serde(default)]
    pub venue: Option<EspnRef>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EspnGroupBySeasonDto {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub abbreviation: Option<String>,
    #[serde(default)]
    pub short_name: Option<String>,
    #[serde(default)]
    pub is_conference: bool,
    #[serde(default)]
    pub logos: Vec<EspnImage>,
    #[serde(default)]
    pub parent: Option<EspnRef>,
}
