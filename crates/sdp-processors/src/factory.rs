//! Start-up registry mapping `(provider, sport, document type)` to processor constructors.

use std::collections::HashMap;
use std::sync::Arc;

use sdp_core::{DocumentType, SourceDataProvider, Sport, SportFamily};
use sdp_storage::{DataContext, TeamSportContext};
use tracing::warn;

use crate::images::{ApplyImageResponse, ImageResponseProcessor};
use crate::processors::{
    AthleteDocumentProcessor, FranchiseDocumentProcessor, GroupBySeasonDocumentProcessor,
    SeasonDocumentProcessor, TeamSeasonDocumentProcessor, VenueDocumentProcessor,
};
use crate::{DocumentProcessor, ProcessingError, ProcessorKey};

pub type ProcessorConstructor<C> = fn(Arc<C>) -> Box<dyn DocumentProcessor>;

/// Anything that can turn a key into a processor instance.
pub trait ResolveProcessor: Send + Sync {
    fn resolve(&self, key: ProcessorKey) -> Result<Box<dyn DocumentProcessor>, ProcessingError>;
    fn image_responses(&self) -> Box<dyn ApplyImageResponse>;
    fn family(&self) -> SportFamily;
}

/// Processors bound to one sport family's persistence context.
pub struct ProcessorFactory<C> {
    context: Arc<C>,
    registry: HashMap<ProcessorKey, ProcessorConstructor<C>>,
}

impl<C: DataContext> ProcessorFactory<C> {
    pub fn new(context: Arc<C>) -> Self {
        Self {
            context,
            registry: HashMap::new(),
        }
    }

    pub fn register(&mut self, key: ProcessorKey, constructor: ProcessorConstructor<C>) -> &mut Self {
        if key.sport.family() != self.context.family() {
            warn!(%key, family = ?self.context.family(), "processor key does not belong to this sport family; skipped");
            return self;
        }
        if self.registry.insert(key, constructor).is_some() {
            warn!(%key, "processor registration replaced an existing entry");
        }
        self
    }

    pub fn keys(&self) -> impl Iterator<Item = &ProcessorKey> {
        self.registry.keys()
    }

    pub fn len(&self) -> usize {
        self.registry.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registry.is_empty()
    }

    fn family_sports(&self) -> Vec<Sport> {
        let family = self.context.family();
        Sport::ALL
            .into_iter()
            .filter(|sport| sport.family() == family)
            .collect()
    }

    /// Processors every sport family supports.
    pub fn with_common_processors(mut self) -> Self {
        for sport in self.family_sports() {
            let espn = |document_type| ProcessorKey::new(SourceDataProvider::Espn, sport, document_type);
            self.register(espn(DocumentType::Venue), |ctx| {
                Box::new(VenueDocumentProcessor::new(ctx))
            })
            .register(espn(DocumentType::Season), |ctx| {
                Box::new(SeasonDocumentProcessor::new(ctx))
            })
            .register(espn(DocumentType::Athlete), |ctx| {
                Box::new(AthleteDocumentProcessor::new(ctx))
            })
            .register(espn(DocumentType::AthleteSeason), |ctx| {
                Box::new(AthleteDocumentProcessor::new(ctx))
            });
        }
        self
    }

    pub fn individual_sports(context: Arc<C>) -> Self {
        Self::new(context).with_common_processors()
    }
}

impl<C: TeamSportContext> ProcessorFactory<C> {
    pub fn team_sports(context: Arc<C>) -> Self {
        let mut factory = Self::new(context).with_common_processors();
        for sport in factory.family_sports() {
            let espn = |document_type| ProcessorKey::new(SourceDataProvider::Espn, sport, document_type);
            factory
                .register(espn(DocumentType::Franchise), |ctx| {
                    Box::new(FranchiseDocumentProcessor::new(ctx))
                })
                .register(espn(DocumentType::TeamSeason), |ctx| {
                    Box::new(TeamSeasonDocumentProcessor::new(ctx))
                })
                .register(espn(DocumentType::GroupSeason), |ctx| {
                    Box::new(GroupBySeasonDocumentProcessor::new(ctx))
                });
        }
        factory
    }
}

impl<C: DataContext> ResolveProcessor for ProcessorFactory<C> {
    fn resolve(&self, key: ProcessorKey) -> Result<Box<dyn DocumentProcessor>, ProcessingError> {
        self.registry
            .get(&key)
            .map(|constructor| constructor(self.context.clone()))
            .ok_or(ProcessingError::UnregisteredProcessor(key))
    }

    fn image_responses(&self) -> Box<dyn ApplyImageResponse> {
        Box::new(ImageResponseProcessor::new(self.context.clone()))
    }

    fn family(&self) -> SportFamily {
        self.context.family()
    }
}

/// Dispatches to the factory of the sport's family.
#[derive(Clone)]
pub struct ProcessorRouter {
    team_sports: Arc<dyn ResolveProcessor>,
    individual_sports: Arc<dyn ResolveProcessor>,
}

impl ProcessorRouter {
    pub fn new(
        team_sports: Arc<dyn ResolveProcessor>,
        individual_sports: Arc<dyn ResolveProcessor>,
    ) -> Self {
        Self {
            team_sports,
            individual_sports,
        }
    }

    pub fn resolve(
        &self,
        provider: SourceDataProvider,
        sport: Sport,
        document_type: DocumentType,
    ) -> Result<Box<dyn DocumentProcessor>, ProcessingError> {
        let key = ProcessorKey::new(provider, sport, document_type);
        match sport.family() {
            SportFamily::TeamSports => self.team_sports.resolve(key),
            SportFamily::IndividualSports => self.individual_sports.resolve(key),
        }
    }

    pub fn image_responses(&self, sport: Sport) -> Box<dyn ApplyImageResponse> {
        match sport.family() {
            SportFamily::TeamSports => self.team_sports.image_responses(),
            SportFamily::IndividualSports => self.individual_sports.image_responses(),
        }
    }
}
