//! Historical season sourcing: tiered scheduled jobs per `(provider, sport, season)`.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use sdp_core::{DocumentType, SourceDataProvider, Sport, SportFamily};
use sdp_storage::StoreError;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::catalog::{espn_base_url, seeder_for, ResourceCatalogEntry};
use crate::config::{TierDelayOverrides, TierDelayTable, TierDelays};
use crate::store::{ExecutionMode, JobStatus, ScheduledJob, SourcingLock, SourcingStore};

pub const MIN_SEASON_YEAR: i32 = 1869;
pub const MAX_SEASON_YEAR: i32 = 2100;

#[derive(Debug, Error)]
pub enum SourcingError {
    #[error("invalid sourcing request: {0}")]
    Validation(String),
    #[error("a forced sourcing run for {sport} {season_year} is already in progress")]
    AlreadyRunning { sport: Sport, season_year: i32 },
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceSeasonRequest {
    pub sport: Sport,
    pub provider: SourceDataProvider,
    pub season_year: i32,
    #[serde(default)]
    pub tier_delays: Option<TierDelayOverrides>,
    #[serde(default)]
    pub force: bool,
}

/// Advisory-lock key guarding forced runs for one sport and season.
pub fn lock_key(sport: Sport, season_year: i32) -> i64 {
    let digest = Sha256::digest(format!("HistoricalSeasonForce:{sport}:{season_year}").as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    let key = i64::from_le_bytes(bytes);
    if key == i64::MIN {
        i64::MAX
    } else {
        key.abs()
    }
}

/// The sourcing tiers in the order they fire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Season,
    Venue,
    TeamSeason,
    AthleteSeason,
}

impl Tier {
    pub fn for_family(family: SportFamily) -> &'static [Tier] {
        match family {
            SportFamily::TeamSports => &[Tier::Season, Tier::Venue, Tier::TeamSeason, Tier::AthleteSeason],
            SportFamily::IndividualSports => &[Tier::Season, Tier::Venue, Tier::AthleteSeason],
        }
    }

    pub fn document_type(self) -> DocumentType {
        match self {
            Tier::Season => DocumentType::Season,
            Tier::Venue => DocumentType::Venue,
            Tier::TeamSeason => DocumentType::TeamSeason,
            Tier::AthleteSeason => DocumentType::AthleteSeason,
        }
    }

    fn path(self, season_year: i32) -> String {
        match self {
            Tier::Season => format!("seasons/{season_year}"),
            Tier::Venue => "venues".to_string(),
            Tier::TeamSeason => format!("seasons/{season_year}/teams"),
            Tier::AthleteSeason => format!("seasons/{season_year}/athletes"),
        }
    }

    fn delay(self, delays: &TierDelays) -> i64 {
        match self {
            Tier::Season => delays.season,
            Tier::Venue => delays.venue,
            Tier::TeamSeason => delays.team_season,
            Tier::AthleteSeason => delays.athlete_season,
        }
    }
}

pub struct SourcingScheduler {
    store: Arc<dyn SourcingStore>,
    lock: Arc<dyn SourcingLock>,
    delays: TierDelayTable,
}

impl SourcingScheduler {
    pub fn new(
        store: Arc<dyn SourcingStore>,
        lock: Arc<dyn SourcingLock>,
        delays: TierDelayTable,
    ) -> Self {
        Self { store, lock, delays }
    }

    /// Persists the non-seasonal catalog for `sport`; returns how many entries were new.
    pub async fn seed_catalog(
        &self,
        sport: Sport,
        provider: SourceDataProvider,
    ) -> Result<usize, SourcingError> {
        let entries = seeder_for(sport).seed(sport, provider, None);
        let inserted = self.store.upsert_catalog(&entries).await?;
        info!(%sport, %provider, inserted, total = entries.len(), "catalog seeded");
        Ok(inserted)
    }

    pub async fn source_season(&self, request: SourceSeasonRequest) -> Result<Uuid, SourcingError> {
        let span = info_span!(
            "source_season",
            sport = %request.sport,
            provider = %request.provider,
            season_year = request.season_year,
            force = request.force
        );
        self.source_season_inner(request).instrument(span).await
    }

    async fn source_season_inner(&self, request: SourceSeasonRequest) -> Result<Uuid, SourcingError> {
        let delays = self.resolve_delays(&request)?;

        let existing = self
            .store
            .jobs_for_season(request.provider, request.sport, request.season_year)
            .await?;
        let season_job = existing
            .iter()
            .find(|j| j.document_type == DocumentType::Season);

        if !request.force {
            if let Some(job) = season_job {
                info!(correlation_id = %job.correlation_id, "season already scheduled");
                return Ok(job.correlation_id);
            }
            return self.schedule(&request, &delays, &existing).await;
        }

        let key = lock_key(request.sport, request.season_year);
        if !self.lock.try_acquire(key).await? {
            return Err(SourcingError::AlreadyRunning {
                sport: request.sport,
                season_year: request.season_year,
            });
        }
        let result = self.schedule(&request, &delays, &existing).await;
        if let Err(err) = self.lock.release(key).await {
            warn!(error = %err, lock_key = key, "failed to release sourcing lock");
        }
        result
    }

    fn resolve_delays(&self, request: &SourceSeasonRequest) -> Result<TierDelays, SourcingError> {
        if !(MIN_SEASON_YEAR..=MAX_SEASON_YEAR).contains(&request.season_year) {
            return Err(SourcingError::Validation(format!(
                "season year {} is outside {MIN_SEASON_YEAR}..={MAX_SEASON_YEAR}",
                request.season_year
            )));
        }
        let base = self.delays.delays_for(request.sport, request.provider);
        let delays = match &request.tier_delays {
            Some(overrides) => base.apply(overrides),
            None => base,
        };
        if let Some((tier, minutes)) = delays.iter().into_iter().find(|(_, m)| *m < 0) {
            return Err(SourcingError::Validation(format!(
                "{tier} delay must not be negative, got {minutes}"
            )));
        }
        Ok(delays)
    }

    /// Builds one job per tier, re-arming any that already exist, and writes them together.
    async fn schedule(
        &self,
        request: &SourceSeasonRequest,
        delays: &TierDelays,
        existing: &[ScheduledJob],
    ) -> Result<Uuid, SourcingError> {
        let now = Utc::now();
        let correlation_id = Uuid::new_v4();
        let entries = self.seasonal_entries(request).await?;

        let mut jobs = Vec::new();
        for tier in Tier::for_family(request.sport.family()) {
            let href = format!("{}/{}", espn_base_url(request.sport), tier.path(request.season_year));
            let start_utc = now + Duration::minutes(tier.delay(delays));
            let catalog_entry_id = entries
                .iter()
                .find(|e| e.endpoint == href && !e.is_recurring)
                .map(|e| e.id);

            let job = match existing.iter().find(|j| j.document_type == tier.document_type()) {
                Some(job) => rearm(job.clone(), start_utc, correlation_id),
                None => new_job(request, *tier, href, catalog_entry_id, start_utc, correlation_id),
            };
            jobs.push(job);
        }

        if existing.is_empty() {
            if let Some(winner) = self.store.create_season_schedule(&entries, &jobs).await? {
                info!(correlation_id = %winner, "season scheduled concurrently; reusing it");
                return Ok(winner);
            }
        } else {
            self.store.save_schedule(&entries, &jobs).await?;
        }
        info!(%correlation_id, jobs = jobs.len(), "season sourcing scheduled");
        Ok(correlation_id)
    }

    /// Seasonal catalog entries, reusing ids of entries already persisted.
    async fn seasonal_entries(
        &self,
        request: &SourceSeasonRequest,
    ) -> Result<Vec<ResourceCatalogEntry>, SourcingError> {
        let persisted = self.store.catalog(request.provider, request.sport).await?;
        let mut entries = seeder_for(request.sport).seed(
            request.sport,
            request.provider,
            Some(request.season_year),
        );
        for entry in &mut entries {
            if let Some(found) = persisted.iter().find(|p| p.natural_key() == entry.natural_key()) {
                *entry = found.clone();
            }
        }
        Ok(entries)
    }
}

fn new_job(
    request: &SourceSeasonRequest,
    tier: Tier,
    href: String,
    catalog_entry_id: Option<Uuid>,
    start_utc: DateTime<Utc>,
    correlation_id: Uuid,
) -> ScheduledJob {
    ScheduledJob {
        id: Uuid::new_v4(),
        catalog_entry_id,
        href,
        provider: request.provider,
        sport: request.sport,
        document_type: tier.document_type(),
        season_year: Some(request.season_year),
        execution_mode: ExecutionMode::OneTime,
        start_utc,
        end_utc: None,
        polling_interval_secs: None,
        max_attempts: None,
        attempt_count: 0,
        status: JobStatus::Active,
        last_enqueued_utc: None,
        last_completed_utc: None,
        page_cursor: None,
        timeout_after_utc: None,
        resource_index_id: Uuid::new_v4(),
        correlation_id,
        bypass_cache: request.force,
    }
}

fn rearm(job: ScheduledJob, start_utc: DateTime<Utc>, correlation_id: Uuid) -> ScheduledJob {
    ScheduledJob {
        start_utc,
        status: JobStatus::Active,
        attempt_count: 0,
        last_enqueued_utc: None,
        page_cursor: None,
        resource_index_id: Uuid::new_v4(),
        correlation_id,
        bypass_cache: true,
        ..job
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemorySourcingStore;

    fn scheduler(store: &MemorySourcingStore) -> SourcingScheduler {
        SourcingScheduler::new(
            Arc::new(store.clone()),
            Arc::new(store.clone()),
            TierDelayTable::default(),
        )
    }

    fn request(force: bool) -> SourceSeasonRequest {
        SourceSeasonRequest {
            sport: Sport::FootballNcaa,
            provider: SourceDataProvider::Espn,
            season_year: 2024,
            tier_delays: None,
            force,
        }
    }

    #[test]
    fn lock_key_is_stable_and_non_negative() {
        let a = lock_key(Sport::FootballNcaa, 2024);
        assert_eq!(a, lock_key(Sport::FootballNcaa, 2024));
        assert_ne!(a, lock_key(Sport::FootballNcaa, 2023));
        assert!(a >= 0);
    }

    #[test]
    fn request_accepts_display_spellings() {
        let request: SourceSeasonRequest = serde_json::from_str(
            r#"{"sport":"ncaa-football","provider":"espn","seasonYear":2024}"#,
        )
        .expect("request");
        assert_eq!(request.sport, Sport::FootballNcaa);
        assert_eq!(request.provider, SourceDataProvider::Espn);
        assert!(!request.force);
        assert!(request.tier_delays.is_none());
    }

    #[tokio::test]
    async fn tiers_start_at_their_delays() {
        let store = MemorySourcingStore::new();
        let before = Utc::now();
        scheduler(&store).source_season(request(false)).await.expect("source");

        let jobs = store.all_jobs().await;
        let types: Vec<_> = jobs.iter().map(|j| j.document_type).collect();
        assert_eq!(
            types,
            vec![
                DocumentType::Season,
                DocumentType::Venue,
                DocumentType::TeamSeason,
                DocumentType::AthleteSeason
            ]
        );
        let venue = &jobs[1];
        assert!(venue.start_utc >= before + Duration::minutes(30));
        assert!(venue.start_utc < before + Duration::minutes(31));
        assert!(jobs.iter().all(|j| j.catalog_entry_id.is_some()));
        assert_eq!(store.queued().await.len(), 4);
    }

    #[tokio::test]
    async fn individual_sports_skip_the_team_tier() {
        let store = MemorySourcingStore::new();
        scheduler(&store)
            .source_season(SourceSeasonRequest {
                sport: Sport::GolfPga,
                ..request(false)
            })
            .await
            .expect("source");

        assert!(store
            .all_jobs()
            .await
            .iter()
            .all(|j| j.document_type != DocumentType::TeamSeason));
    }

    #[tokio::test]
    async fn out_of_range_year_is_rejected() {
        let store = MemorySourcingStore::new();
        let err = scheduler(&store)
            .source_season(SourceSeasonRequest {
                season_year: 1700,
                ..request(false)
            })
            .await
            .expect_err("invalid year");
        assert!(matches!(err, SourcingError::Validation(_)));
    }

    #[tokio::test]
    async fn forced_run_rearms_existing_jobs() {
        let store = MemorySourcingStore::new();
        let scheduler = scheduler(&store);
        let first = scheduler.source_season(request(false)).await.expect("first");
        let ids: Vec<_> = store.all_jobs().await.iter().map(|j| j.id).collect();
        let indexes: Vec<_> = store
            .all_jobs()
            .await
            .iter()
            .map(|j| j.resource_index_id)
            .collect();

        let forced = scheduler.source_season(request(true)).await.expect("forced");

        assert_ne!(first, forced);
        let jobs = store.all_jobs().await;
        assert_eq!(jobs.len(), 4);
        assert!(jobs.iter().all(|j| ids.contains(&j.id)));
        assert!(jobs.iter().all(|j| j.bypass_cache && !indexes.contains(&j.resource_index_id)));
        assert!(jobs.iter().all(|j| j.correlation_id == forced));
        // Lock released afterwards.
        assert!(store.try_acquire(lock_key(Sport::FootballNcaa, 2024)).await.expect("lock"));
    }
}
