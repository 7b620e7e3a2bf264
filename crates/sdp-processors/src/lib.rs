//! Document processor contracts, the processor registry and provider processors.

use std::fmt;

use async_trait::async_trait;
use sdp_core::{DocumentCreated, DocumentType, SourceDataProvider, Sport};
use sdp_storage::StoreError;
use serde::de::DeserializeOwned;
use thiserror::Error;
use uuid::Uuid;

pub mod dto;
pub mod factory;
pub mod images;
pub mod processors;

pub use factory::{ProcessorConstructor, ProcessorFactory, ProcessorRouter, ResolveProcessor};
pub use images::{ApplyImageResponse, ImageOutcome, ImageResponseProcessor};
pub use processors::{
    AthleteDocumentProcessor, FranchiseDocumentProcessor, GroupBySeasonDocumentProcessor,
    SeasonDocumentProcessor, TeamSeasonDocumentProcessor, VenueDocumentProcessor,
};

pub const CRATE_NAME: &str = "sdp-processors";

/// The three-part dispatch key a processor is registered under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProcessorKey {
    pub provider: SourceDataProvider,
    pub sport: Sport,
    pub document_type: DocumentType,
}

impl ProcessorKey {
    pub fn new(provider: SourceDataProvider, sport: Sport, document_type: DocumentType) -> Self {
        Self {
            provider,
            sport,
            document_type,
        }
    }
}

impl fmt::Display for ProcessorKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.provider, self.sport, self.document_type)
    }
}

#[derive(Debug, Error)]
pub enum ProcessingError {
    #[error("no processor registered for {0}")]
    UnregisteredProcessor(ProcessorKey),
    #[error("failed to deserialize {document_type} document: {source}")]
    Deserialization {
        document_type: DocumentType,
        #[source]
        source: serde_json::Error,
    },
    #[error("{document_type} document is missing {field}")]
    MissingField {
        document_type: DocumentType,
        field: &'static str,
    },
    #[error("{document_type} document depends on {dependency} {value}, which has not been processed yet")]
    MissingDependency {
        document_type: DocumentType,
        dependency: DocumentType,
        value: String,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ProcessingError {
    /// Fatal errors go straight to the dead-letter queue; the rest are retried.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ProcessingError::UnregisteredProcessor(_)
                | ProcessingError::Deserialization { .. }
                | ProcessingError::MissingField { .. }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessDocumentCommand {
    pub source_data_provider: SourceDataProvider,
    pub sport: Sport,
    pub season: Option<i32>,
    pub document_type: DocumentType,
    pub document: String,
    pub href: String,
    pub url_hash: String,
    pub parent_id: Option<String>,
    pub correlation_id: Uuid,
    pub causation_id: Uuid,
}

impl ProcessDocumentCommand {
    pub fn key(&self) -> ProcessorKey {
        ProcessorKey::new(self.source_data_provider, self.sport, self.document_type)
    }

    pub fn parse<T: DeserializeOwned>(&self) -> Result<T, ProcessingError> {
        serde_json::from_str(&self.document).map_err(|source| ProcessingError::Deserialization {
            document_type: self.document_type,
            source,
        })
    }

    pub fn require_season(&self) -> Result<i32, ProcessingError> {
        self.season.ok_or(ProcessingError::MissingField {
            document_type: self.document_type,
            field: "season year",
        })
    }
}

impl From<&DocumentCreated> for ProcessDocumentCommand {
    fn from(evt: &DocumentCreated) -> Self {
        Self {
            source_data_provider: evt.source_data_provider,
            sport: evt.sport,
            season: evt.season_year,
            document_type: evt.document_type,
            document: evt.document_json.clone(),
            href: evt.href.clone(),
            url_hash: evt.source_url_hash.clone(),
            parent_id: evt.parent_id.clone(),
            correlation_id: evt.correlation_id,
            causation_id: evt.causation_id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessOutcome {
    pub entity_id: Uuid,
    pub created: bool,
    pub events_staged: usize,
}

#[async_trait]
pub trait DocumentProcessor: Send + Sync {
    fn name(&self) -> &'static str;

    async fn process(
        &self,
        command: &ProcessDocumentCommand,
    ) -> Result<ProcessOutcome, ProcessingError>;
}
