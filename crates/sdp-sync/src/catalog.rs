//! Declarative resource catalog: which provider documents exist per sport.

use chrono::{DateTime, Utc};
use sdp_core::{DocumentType, SourceDataProvider, Sport, SportFamily};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Weekly refresh for recurring entries (seconds-resolution cron).
pub const RECURRING_CRON: &str = "0 0 6 * * Sun";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceCatalogEntry {
    pub id: Uuid,
    pub provider: SourceDataProvider,
    pub sport: Sport,
    pub document_type: DocumentType,
    pub endpoint: String,
    pub season_year: Option<i32>,
    pub is_season_specific: bool,
    pub is_recurring: bool,
    pub is_enabled: bool,
    pub ordinal: i64,
    pub cron_expression: Option<String>,
    pub last_accessed_utc: Option<DateTime<Utc>>,
    pub created_utc: DateTime<Utc>,
}

impl ResourceCatalogEntry {
    /// Identity used for idempotent re-seeding.
    pub fn natural_key(&self) -> (SourceDataProvider, Sport, DocumentType, &str, bool) {
        (
            self.provider,
            self.sport,
            self.document_type,
            self.endpoint.as_str(),
            self.is_recurring,
        )
    }
}

pub fn espn_base_url(sport: Sport) -> String {
    let (sport_path, league) = sport.espn_path();
    format!("https://sports.core.api.espn.com/v2/sports/{sport_path}/leagues/{league}")
}

struct EntryTemplate {
    document_type: DocumentType,
    path: String,
    is_season_specific: bool,
    is_recurring: bool,
}

impl EntryTemplate {
    fn fixed(document_type: DocumentType, path: &str) -> Self {
        Self {
            document_type,
            path: path.to_string(),
            is_season_specific: false,
            is_recurring: false,
        }
    }

    fn recurring(document_type: DocumentType, path: &str) -> Self {
        Self {
            is_recurring: true,
            ..Self::fixed(document_type, path)
        }
    }

    fn seasonal(document_type: DocumentType, path: String) -> Self {
        Self {
            document_type,
            path,
            is_season_specific: true,
            is_recurring: false,
        }
    }
}

/// Ordinal base `yyyyMMddHHmmssfff`; entries append their index so declaration order sorts.
fn ordinal_base(at: DateTime<Utc>) -> i64 {
    at.format("%Y%m%d%H%M%S%3f")
        .to_string()
        .parse::<i64>()
        .unwrap_or_default()
}

fn build_entries(
    sport: Sport,
    provider: SourceDataProvider,
    season_year: Option<i32>,
    templates: Vec<EntryTemplate>,
) -> Vec<ResourceCatalogEntry> {
    let now = Utc::now();
    let base = ordinal_base(now).saturating_mul(100);
    let root = espn_base_url(sport);

    let mut entries = Vec::new();
    for template in templates {
        let entry = ResourceCatalogEntry {
            id: Uuid::new_v4(),
            provider,
            sport,
            document_type: template.document_type,
            endpoint: format!("{root}/{}", template.path),
            season_year: if template.is_season_specific { season_year } else { None },
            is_season_specific: template.is_season_specific,
            is_recurring: template.is_recurring,
            is_enabled: true,
            ordinal: 0,
            cron_expression: template.is_recurring.then(|| RECURRING_CRON.to_string()),
            last_accessed_utc: None,
            created_utc: now,
        };
        // A recurring entry also gets a one-time twin so a fresh deploy fetches immediately.
        if entry.is_recurring {
            entries.push(ResourceCatalogEntry {
                id: Uuid::new_v4(),
                is_recurring: false,
                cron_expression: None,
                ..entry.clone()
            });
        }
        entries.push(entry);
    }

    for (index, entry) in entries.iter_mut().enumerate() {
        entry.ordinal = base + index as i64;
    }
    entries
}

pub trait CatalogSeeder: Send + Sync {
    fn family(&self) -> SportFamily;

    /// Entries for `sport`; seasonal entries are only produced when `season_year` is given.
    fn seed(
        &self,
        sport: Sport,
        provider: SourceDataProvider,
        season_year: Option<i32>,
    ) -> Vec<ResourceCatalogEntry>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TeamSportSeeder;

impl CatalogSeeder for TeamSportSeeder {
    fn family(&self) -> SportFamily {
        SportFamily::TeamSports
    }

    fn seed(
        &self,
        sport: Sport,
        provider: SourceDataProvider,
        season_year: Option<i32>,
    ) -> Vec<ResourceCatalogEntry> {
        let mut templates = vec![
            EntryTemplate::recurring(DocumentType::Venue, "venues"),
            EntryTemplate::fixed(DocumentType::Franchise, "franchises"),
            EntryTemplate::fixed(DocumentType::Position, "positions"),
            EntryTemplate::fixed(DocumentType::Athlete, "athletes"),
            EntryTemplate::fixed(DocumentType::Seasons, "seasons"),
        ];
        if let Some(year) = season_year {
            templates.extend([
                EntryTemplate::seasonal(DocumentType::Season, format!("seasons/{year}")),
                EntryTemplate::seasonal(DocumentType::TeamSeason, format!("seasons/{year}/teams")),
                EntryTemplate::seasonal(
                    DocumentType::GroupSeason,
                    format!("seasons/{year}/types/2/groups"),
                ),
                EntryTemplate::seasonal(DocumentType::Award, format!("seasons/{year}/awards")),
                EntryTemplate::seasonal(
                    DocumentType::AthleteSeason,
                    format!("seasons/{year}/athletes"),
                ),
            ]);
        }
        build_entries(sport, provider, season_year, templates)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct IndividualSportSeeder;

impl CatalogSeeder for IndividualSportSeeder {
    fn family(&self) -> SportFamily {
        SportFamily::IndividualSports
    }

    fn seed(
        &self,
        sport: Sport,
        provider: SourceDataProvider,
        season_year: Option<i32>,
    ) -> Vec<ResourceCatalogEntry> {
        let mut templates = vec![
            EntryTemplate::recurring(DocumentType::Venue, "venues"),
            EntryTemplate::fixed(DocumentType::Seasons, "seasons"),
        ];
        if let Some(year) = season_year {
            templates.extend([
                EntryTemplate::seasonal(DocumentType::Season, format!("seasons/{year}")),
                EntryTemplate::seasonal(
                    DocumentType::AthleteSeason,
                    format!("seasons/{year}/athletes"),
                ),
            ]);
        }
        build_entries(sport, provider, season_year, templates)
    }
}

pub fn seeder_for(sport: Sport) -> Box<dyn CatalogSeeder> {
    match sport.family() {
        SportFamily::TeamSports => Box::new(TeamSportSeeder),
        SportFamily::IndividualSports => Box::new(IndividualSportSeeder),
    }
}

/// The non-seasonal catalog for `sport` as published by ESPN.
pub fn seed_catalog(sport: Sport) -> Vec<ResourceCatalogEntry> {
    seeder_for(sport).seed(sport, SourceDataProvider::Espn, None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn team_sports_carry_franchises_and_seasonal_tiers() {
        let entries = TeamSportSeeder.seed(Sport::FootballNcaa, SourceDataProvider::Espn, Some(2024));
        let types: Vec<_> = entries.iter().map(|e| e.document_type).collect();
        assert!(types.contains(&DocumentType::Franchise));
        assert!(types.contains(&DocumentType::GroupSeason));
        assert!(entries.iter().any(|e| e.endpoint
            == "https://sports.core.api.espn.com/v2/sports/football/leagues/college-football/seasons/2024/teams"));
        assert!(entries
            .iter()
            .filter(|e| e.is_season_specific)
            .all(|e| e.season_year == Some(2024)));
    }

    #[test]
    fn individual_sports_skip_team_entries() {
        let entries = seeder_for(Sport::GolfPga).seed(Sport::GolfPga, SourceDataProvider::Espn, Some(2024));
        assert!(entries
            .iter()
            .all(|e| !matches!(e.document_type, DocumentType::Franchise | DocumentType::TeamSeason)));
        assert!(entries.iter().any(|e| e.document_type == DocumentType::AthleteSeason));
    }

    #[test]
    fn recurring_entries_get_a_one_time_twin_and_ordered_ordinals() {
        let entries = seed_catalog(Sport::FootballNfl);
        let venues: Vec<_> = entries
            .iter()
            .filter(|e| e.document_type == DocumentType::Venue)
            .collect();
        assert_eq!(venues.len(), 2);
        assert_eq!(venues.iter().filter(|e| e.is_recurring).count(), 1);
        assert!(venues
            .iter()
            .any(|e| e.cron_expression.as_deref() == Some(RECURRING_CRON)));
        assert!(entries.windows(2).all(|w| w[0].ordinal < w[1].ordinal));
        assert!(entries.iter().all(|e| e.season_year.is_none()));
    }
}
