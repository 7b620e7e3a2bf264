//! Core domain model for the sports document pipeline.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

pub mod entities;
pub mod events;
pub mod hashing;
pub mod refs;

pub use entities::*;
pub use events::*;

pub const CRATE_NAME: &str = "sdp-core";

/// Upper bound on delivery attempts for a `DocumentCreated` message before it is dead-lettered.
pub const MAX_ATTEMPTS: u32 = 3;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown {kind} '{value}'")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

fn fold_name(raw: &str) -> String {
    raw.chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SportFamily {
    TeamSports,
    IndividualSports,
}

impl SportFamily {
    /// Database schema that holds canonical state for this family.
    pub fn schema(self) -> &'static str {
        match self {
            SportFamily::TeamSports => "team_sports",
            SportFamily::IndividualSports => "individual_sports",
        }
    }
}

/// Serialized as the variant name; deserialized from any spelling [`FromStr`] accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String")]
pub enum Sport {
    FootballNcaa,
    FootballNfl,
    BaseballMlb,
    BasketballNba,
    GolfPga,
}

impl Sport {
    pub const ALL: [Sport; 5] = [
        Sport::FootballNcaa,
        Sport::FootballNfl,
        Sport::BaseballMlb,
        Sport::BasketballNba,
        Sport::GolfPga,
    ];

    pub fn family(self) -> SportFamily {
        match self {
            Sport::GolfPga => SportFamily::IndividualSports,
            _ => SportFamily::TeamSports,
        }
    }

    pub fn is_team_sport(self) -> bool {
        self.family() == SportFamily::TeamSports
    }

    /// `(sport, league)` path pair used by the ESPN core API.
    pub fn espn_path(self) -> (&'static str, &'static str) {
        match self {
            Sport::FootballNcaa => ("football", "college-football"),
            Sport::FootballNfl => ("football", "nfl"),
            Sport::BaseballMlb => ("baseball", "mlb"),
            Sport::BasketballNba => ("basketball", "nba"),
            Sport::GolfPga => ("golf", "pga"),
        }
    }

    pub fn slug(self) -> &'static str {
        match self {
            Sport::FootballNcaa => "ncaa-football",
            Sport::FootballNfl => "nfl-football",
            Sport::BaseballMlb => "mlb-baseball",
            Sport::BasketballNba => "nba-basketball",
            Sport::GolfPga => "pga-golf",
        }
    }
}

impl fmt::Display for Sport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl FromStr for Sport {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match fold_name(s).as_str() {
            "footballncaa" | "ncaafootball" | "collegefootball" => Ok(Sport::FootballNcaa),
            "footballnfl" | "nflfootball" | "nfl" => Ok(Sport::FootballNfl),
            "baseballmlb" | "mlbbaseball" | "mlb" => Ok(Sport::BaseballMlb),
            "basketballnba" | "nbabasketball" | "nba" => Ok(Sport::BasketballNba),
            "golfpga" | "pgagolf" | "pga" => Ok(Sport::GolfPga),
            _ => Err(ParseEnumError {
                kind: "sport",
                value: s.to_string(),
            }),
        }
    }
}

impl TryFrom<String> for Sport {
    type Error = ParseEnumError;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        raw.parse()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String")]
pub enum SourceDataProvider {
    Espn,
    SportsDataIo,
    Cbs,
    Yahoo,
}

impl SourceDataProvider {
    pub fn as_str(self) -> &'static str {
        match self {
            SourceDataProvider::Espn => "Espn",
            SourceDataProvider::SportsDataIo => "SportsDataIo",
            SourceDataProvider::Cbs => "Cbs",
            SourceDataProvider::Yahoo => "Yahoo",
        }
    }
}

impl fmt::Display for SourceDataProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceDataProvider {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match fold_name(s).as_str() {
            "espn" => Ok(SourceDataProvider::Espn),
            "sportsdataio" => Ok(SourceDataProvider::SportsDataIo),
            "cbs" => Ok(SourceDataProvider::Cbs),
            "yahoo" => Ok(SourceDataProvider::Yahoo),
            _ => Err(ParseEnumError {
                kind: "provider",
                value: s.to_string(),
            }),
        }
    }
}

impl TryFrom<String> for SourceDataProvider {
    type Error = ParseEnumError;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        raw.parse()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DocumentType {
    Athlete,
    AthleteImage,
    AthleteSeason,
    Award,
    Coach,
    CoachSeason,
    Event,
    Franchise,
    FranchiseLogo,
    GroupSeason,
    GroupSeasonLogo,
    Position,
    Season,
    Seasons,
    TeamSeason,
    TeamSeasonLogo,
    Venue,
    VenueImage,
}

impl DocumentType {
    /// Infers the document type of an ESPN core API reference from its path shape.
    ///
    /// Returns `None` for shapes the pipeline does not crawl (records, statistics, ...).
    pub fn infer_from_url(href: &str) -> Option<DocumentType> {
        let url = Url::parse(href).ok()?;
        let segments: Vec<&str> = url
            .path_segments()?
            .filter(|s| !s.is_empty())
            .collect();
        let start = segments
            .iter()
            .position(|s| *s == "leagues")
            .map(|i| i + 2)
            .unwrap_or(0)
            .min(segments.len());

        match &segments[start..] {
            ["seasons"] => Some(DocumentType::Seasons),
            ["seasons", year] if year.parse::<i32>().is_ok() => Some(DocumentType::Season),
            ["seasons", _, "teams", _] => Some(DocumentType::TeamSeason),
            ["seasons", _, "athletes", _] => Some(DocumentType::AthleteSeason),
            ["seasons", _, "coaches", _] => Some(DocumentType::CoachSeason),
            ["seasons", _, "awards", _] => Some(DocumentType::Award),
            ["seasons", _, "types", _, "groups", _] => Some(DocumentType::GroupSeason),
            ["venues", _] => Some(DocumentType::Venue),
            ["franchises", _] => Some(DocumentType::Franchise),
            ["positions", _] => Some(DocumentType::Position),
            ["athletes", _] => Some(DocumentType::Athlete),
            ["coaches", _] => Some(DocumentType::Coach),
            ["events", _] => Some(DocumentType::Event),
            _ => None,
        }
    }
}

impl fmt::Display for DocumentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl FromStr for DocumentType {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        const ALL: [DocumentType; 18] = [
            DocumentType::Athlete,
            DocumentType::AthleteImage,
            DocumentType::AthleteSeason,
            DocumentType::Award,
            DocumentType::Coach,
            DocumentType::CoachSeason,
            DocumentType::Event,
            DocumentType::Franchise,
            DocumentType::FranchiseLogo,
            DocumentType::GroupSeason,
            DocumentType::GroupSeasonLogo,
            DocumentType::Position,
            DocumentType::Season,
            DocumentType::Seasons,
            DocumentType::TeamSeason,
            DocumentType::TeamSeasonLogo,
            DocumentType::Venue,
            DocumentType::VenueImage,
        ];
        let folded = fold_name(s);
        ALL.into_iter()
            .find(|t| fold_name(&t.to_string()) == folded)
            .ok_or_else(|| ParseEnumError {
                kind: "document type",
                value: s.to_string(),
            })
    }
}

/// Name of the raw-document collection a fetched document belongs to.
pub fn collection_name(
    provider: SourceDataProvider,
    sport: Sport,
    document_type: DocumentType,
    season_year: Option<i32>,
) -> String {
    match season_year {
        Some(year) => format!("{provider}{sport}{document_type}{year}"),
        None => format!("{provider}{sport}{document_type}"),
    }
}

/// Fixed causation ids identifying which component produced a message.
pub mod causation {
    use uuid::Uuid;

    pub const PROVIDER_RESOURCE_INDEX_ITEM: Uuid =
        Uuid::from_u128(0x2000_0000_0000_0000_0000_0000_0000_0001);
    pub const PROVIDER_DOCUMENT_REQUESTED: Uuid =
        Uuid::from_u128(0x2000_0000_0000_0000_0000_0000_0000_0002);

    pub const FRANCHISE_DOCUMENT_PROCESSOR: Uuid =
        Uuid::from_u128(0x1000_0000_0000_0000_0000_0000_0000_0010);
    pub const TEAM_SEASON_DOCUMENT_PROCESSOR: Uuid =
        Uuid::from_u128(0x1000_0000_0000_0000_0000_0000_0000_0011);
    pub const GROUP_BY_SEASON_DOCUMENT_PROCESSOR: Uuid =
        Uuid::from_u128(0x1000_0000_0000_0000_0000_0000_0000_0012);
    pub const SEASON_DOCUMENT_PROCESSOR: Uuid =
        Uuid::from_u128(0x1000_0000_0000_0000_0000_0000_0000_0013);
    pub const ATHLETE_DOCUMENT_PROCESSOR: Uuid =
        Uuid::from_u128(0x1000_0000_0000_0000_0000_0000_0000_0014);
    pub const VENUE_DOCUMENT_PROCESSOR: Uuid =
        Uuid::from_u128(0x1000_0000_0000_0000_0000_0000_0000_001E);

    pub const DOCUMENT_CONSUMER_RETRY: Uuid =
        Uuid::from_u128(0x3000_0000_0000_0000_0000_0000_0000_0001);
    pub const DEAD_LETTER_REPROCESSOR: Uuid =
        Uuid::from_u128(0x3000_0000_0000_0000_0000_0000_0000_0002);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sport_parses_common_spellings() {
        assert_eq!("ncaa-football".parse::<Sport>(), Ok(Sport::FootballNcaa));
        assert_eq!("FootballNcaa".parse::<Sport>(), Ok(Sport::FootballNcaa));
        assert_eq!("pga".parse::<Sport>(), Ok(Sport::GolfPga));
        assert!("cricket".parse::<Sport>().is_err());
        assert_eq!(Sport::GolfPga.family(), SportFamily::IndividualSports);
    }

    #[test]
    fn wire_names_accept_display_and_slug_spellings() {
        let sports: Vec<Sport> =
            serde_json::from_str(r#"["FootballNfl","nfl-football","football-nfl","NBA"]"#)
                .expect("sports");
        assert_eq!(
            sports,
            vec![Sport::FootballNfl, Sport::FootballNfl, Sport::FootballNfl, Sport::BasketballNba]
        );
        let provider: SourceDataProvider = serde_json::from_str(r#""ESPN""#).expect("provider");
        assert_eq!(provider, SourceDataProvider::Espn);
        assert_eq!(
            serde_json::to_string(&Sport::BaseballMlb).expect("serialize"),
            format!("\"{}\"", Sport::BaseballMlb)
        );
        assert!(serde_json::from_str::<Sport>(r#""cricket""#).is_err());
    }

    #[test]
    fn document_type_is_inferred_from_reference_shape() {
        let base = "http://sports.core.api.espn.com/v2/sports/football/leagues/college-football";
        assert_eq!(
            DocumentType::infer_from_url(&format!("{base}/venues/3958")),
            Some(DocumentType::Venue)
        );
        assert_eq!(
            DocumentType::infer_from_url(&format!("{base}/seasons/2024/teams/99")),
            Some(DocumentType::TeamSeason)
        );
        assert_eq!(
            DocumentType::infer_from_url(&format!("{base}/seasons/2024/types/2/groups/8")),
            Some(DocumentType::GroupSeason)
        );
        assert_eq!(
            DocumentType::infer_from_url(&format!("{base}/seasons/2024")),
            Some(DocumentType::Season)
        );
        assert_eq!(
            DocumentType::infer_from_url(&format!("{base}/seasons/2024/teams/99/record")),
            None
        );
    }

    #[test]
    fn collection_name_concatenates_parts() {
        assert_eq!(
            collection_name(
                SourceDataProvider::Espn,
                Sport::FootballNcaa,
                DocumentType::Venue,
                None
            ),
            "EspnFootballNcaaVenue"
        );
        assert_eq!(
            collection_name(
                SourceDataProvider::Espn,
                Sport::FootballNcaa,
                DocumentType::TeamSeason,
                Some(2024)
            ),
            "EspnFootballNcaaTeamSeason2024"
        );
        assert_eq!("teamseason".parse::<DocumentType>(), Ok(DocumentType::TeamSeason));
    }
}
