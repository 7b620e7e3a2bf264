//! URL normalization, content hashes and routing keys.
//!
//! Every dedup decision in the pipeline keys off these functions; changing the
//! normalization rules invalidates persisted resource indexes and document caches.

use sha2::{Digest, Sha256};
use thiserror::Error;
use url::Url;

use crate::SourceDataProvider;

#[derive(Debug, Error)]
pub enum HashingError {
    #[error("invalid url '{url}': {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },
    #[error("url '{0}' has no host")]
    MissingHost(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryMode {
    Strip,
    /// Keep the query with its pairs sorted by key then value.
    Keep,
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

fn parse(raw: &str) -> Result<Url, HashingError> {
    let url = Url::parse(raw.trim()).map_err(|source| HashingError::InvalidUrl {
        url: raw.to_string(),
        source,
    })?;
    if url.host_str().is_none() {
        return Err(HashingError::MissingHost(raw.to_string()));
    }
    Ok(url)
}

fn sorted_query(url: &Url) -> Option<String> {
    let mut pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
    if pairs.is_empty() {
        return None;
    }
    pairs.sort();
    Some(
        url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(pairs)
            .finish(),
    )
}

pub fn normalize_url(raw: &str, mode: QueryMode) -> Result<String, HashingError> {
    let mut url = parse(raw)?;
    url.set_fragment(None);
    let query = match mode {
        QueryMode::Strip => None,
        QueryMode::Keep => sorted_query(&url),
    };
    url.set_query(query.as_deref());

    let path = url.path().to_string();
    if path.len() > 1 && path.ends_with('/') {
        url.set_path(path.trim_end_matches('/'));
    }
    Ok(url.to_string())
}

/// Case-insensitive hash of the query-stripped URL.
pub fn url_hash(raw: &str) -> Result<String, HashingError> {
    let normalized = normalize_url(raw, QueryMode::Strip)?;
    Ok(sha256_hex(normalized.to_ascii_lowercase().as_bytes()))
}

/// Like [`url_hash`] but distinguishes query strings, e.g. index page cursors.
pub fn url_hash_with_query(raw: &str) -> Result<String, HashingError> {
    let normalized = normalize_url(raw, QueryMode::Keep)?;
    Ok(sha256_hex(normalized.to_ascii_lowercase().as_bytes()))
}

/// Human-readable key derived from the path, used as the raw document file stem.
///
/// A query string, when present, contributes a short hash suffix so paged
/// index documents never share a key with their first page.
pub fn routing_key(provider: SourceDataProvider, raw: &str) -> Result<String, HashingError> {
    let url = parse(raw)?;
    let mut parts = vec![provider.as_str().to_ascii_lowercase()];
    for segment in url.path_segments().into_iter().flatten() {
        if segment.is_empty() {
            continue;
        }
        parts.push(
            segment
                .to_ascii_lowercase()
                .chars()
                .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
                .collect(),
        );
    }
    if let Some(query) = sorted_query(&url) {
        let digest = sha256_hex(query.to_ascii_lowercase().as_bytes());
        parts.push(format!("q{}", &digest[..12]));
    }
    Ok(parts.join("."))
}

/// A URL together with its normalized form and dedup hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrlIdentity {
    pub href: String,
    pub clean_url: String,
    pub url_hash: String,
}

impl UrlIdentity {
    pub fn parse(raw: &str) -> Result<Self, HashingError> {
        let clean_url = normalize_url(raw, QueryMode::Strip)?;
        let url_hash = sha256_hex(clean_url.to_ascii_lowercase().as_bytes());
        Ok(Self {
            href: raw.trim().to_string(),
            clean_url,
            url_hash,
        })
    }
}
