#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use sdp_core::SourceDataProvider;
use sdp_storage::{DocumentSource, FetchError, FetchedResponse, StatusCode};

pub const NFL: &str = "https://sports.core.api.espn.com/v2/sports/football/leagues/nfl";

/// Serves canned documents by exact URL; anything else is a 404.
#[derive(Default)]
pub struct StaticSource {
    documents: Mutex<HashMap<String, String>>,
    calls: AtomicUsize,
}

impl StaticSource {
    pub fn with(mut self, url: impl Into<String>, body: impl Into<String>) -> Self {
        self.documents
            .get_mut()
            .expect("documents lock")
            .insert(url.into(), body.into());
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DocumentSource for StaticSource {
    async fn fetch(
        &self,
        _provider: SourceDataProvider,
        url: &str,
    ) -> Result<FetchedResponse, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let body = self.documents.lock().expect("documents lock").get(url).cloned();
        match body {
            Some(body) => Ok(FetchedResponse {
                status: StatusCode::OK,
                final_url: url.to_string(),
                body: body.into_bytes(),
            }),
            None => Err(FetchError::SourceUnavailable {
                status: 404,
                url: url.to_string(),
            }),
        }
    }
}

pub fn venue_index() -> String {
    format!(
        r#"{{"count":2,"pageIndex":1,"pageSize":25,"pageCount":1,
            "items":[{{"$ref":"{NFL}/venues/1"}},{{"$ref":"{NFL}/venues/2"}}]}}"#
    )
}

pub fn venue(id: u32, name: &str) -> String {
    format!(r#"{{"$ref":"{NFL}/venues/{id}","id":"{id}","fullName":"{name}","capacity":70000}}"#)
}

/// A source carrying the NFL venue index and both venues.
pub fn nfl_venues() -> StaticSource {
    StaticSource::default()
        .with(format!("{NFL}/venues"), venue_index())
        .with(format!("{NFL}/venues/1"), venue(1, "Lambeau Field"))
        .with(format!("{NFL}/venues/2"), venue(2, "Soldier Field"))
}
