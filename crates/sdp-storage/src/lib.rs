//! Raw document storage, rate-limited HTTP fetch and canonical persistence contexts.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
pub use reqwest::StatusCode;
use sdp_core::hashing::{routing_key, sha256_hex, HashingError, UrlIdentity};
use sdp_core::SourceDataProvider;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

pub mod context;
pub mod memory;
pub mod postgres;

pub use context::{
    CommitReceipt, DataContext, IndividualSportSchema, OutboxMessage, OutboxStore, Query,
    SchemaFamily, StagedEvent, StoreError, TeamSportContext, TeamSportSchema, UnitOfWork,
};
pub use memory::MemoryContext;
pub use postgres::PgContext;

pub const CRATE_NAME: &str = "sdp-storage";

/// Sidecar metadata written next to every stored document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentMeta {
    pub source_url: String,
    pub url_hash: String,
    pub content_hash: String,
    pub fetched_utc: DateTime<Utc>,
    pub byte_size: usize,
}

#[derive(Debug, Clone)]
pub struct StoredDocument {
    pub meta: DocumentMeta,
    pub body: Vec<u8>,
    pub path: PathBuf,
}

/// Durable raw payloads keyed by provider and routing key.
#[derive(Debug, Clone)]
pub struct RawDocumentStore {
    root: PathBuf,
}

impl RawDocumentStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn document_path(&self, provider: SourceDataProvider, routing_key: &str) -> PathBuf {
        self.root
            .join(provider.as_str().to_ascii_lowercase())
            .join(format!("{routing_key}.json"))
    }

    fn meta_path(document_path: &Path) -> PathBuf {
        document_path.with_extension("meta.json")
    }

    pub async fn load(
        &self,
        provider: SourceDataProvider,
        routing_key: &str,
    ) -> anyhow::Result<Option<StoredDocument>> {
        let path = self.document_path(provider, routing_key);
        let meta_path = Self::meta_path(&path);
        if !fs::try_exists(&meta_path)
            .await
            .with_context(|| format!("checking document metadata {}", meta_path.display()))?
        {
            return Ok(None);
        }

        let meta_bytes = fs::read(&meta_path)
            .await
            .with_context(|| format!("reading document metadata {}", meta_path.display()))?;
        let meta: DocumentMeta = serde_json::from_slice(&meta_bytes)
            .with_context(|| format!("parsing document metadata {}", meta_path.display()))?;
        let body = match fs::read(&path).await {
            Ok(body) => body,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err).with_context(|| format!("reading document {}", path.display()))
            }
        };

        Ok(Some(StoredDocument { meta, body, path }))
    }

    /// Store bytes with an atomic temp-file rename; the body lands before its metadata so a
    /// metadata file always points at a complete body.
    pub async fn store(
        &self,
        provider: SourceDataProvider,
        routing_key: &str,
        source_url: &str,
        url_hash: &str,
        fetched_utc: DateTime<Utc>,
        bytes: &[u8],
    ) -> anyhow::Result<StoredDocument> {
        let path = self.document_path(provider, routing_key);
        let parent = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());
        fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("creating document directory {}", parent.display()))?;

        let meta = DocumentMeta {
            source_url: source_url.to_string(),
            url_hash: url_hash.to_string(),
            content_hash: sha256_hex(bytes),
            fetched_utc,
            byte_size: bytes.len(),
        };
        let meta_bytes = serde_json::to_vec_pretty(&meta).context("serializing document metadata")?;

        write_atomically(&parent, &path, bytes).await?;
        write_atomically(&parent, &Self::meta_path(&path), &meta_bytes).await?;

        Ok(StoredDocument {
            meta,
            body: bytes.to_vec(),
            path,
        })
    }
}

async fn write_atomically(dir: &Path, target: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let temp_path = dir.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp document file {}", temp_path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing temp document file {}", temp_path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing temp document file {}", temp_path.display()))?;
    drop(file);

    if let Err(err) = fs::rename(&temp_path, target).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| {
            format!(
                "atomically renaming temp document {} -> {}",
                temp_path.display(),
                target.display()
            )
        });
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
    {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// Delay before a failed job is re-queued. Retries happen through the job queue, never inline.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(30 * 60),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub per_provider_concurrency: usize,
    pub token_bucket: Option<TokenBucketConfig>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            global_concurrency: 16,
            per_provider_concurrency: 4,
            token_bucket: None,
        }
    }
}

/// Request budget shared by every provider: `capacity` tokens, one back per `refill_every`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenBucketConfig {
    pub capacity: u32,
    pub refill_every: Duration,
}

impl TokenBucketConfig {
    /// A bucket allowing bursts of `rate` and `rate` requests per second after that.
    pub fn per_second(rate: u32) -> Option<Self> {
        (rate > 0).then(|| Self {
            capacity: rate,
            refill_every: Duration::from_secs(1) / rate,
        })
    }
}

#[derive(Debug)]
pub struct SimpleTokenBucket {
    capacity: u32,
    refill_every: Duration,
    state: Mutex<TokenBucketState>,
}

#[derive(Debug, Clone, Copy)]
struct TokenBucketState {
    tokens: u32,
    last_refill: Instant,
}

impl SimpleTokenBucket {
    pub fn new(capacity: u32, refill_every: Duration) -> Self {
        Self {
            capacity,
            refill_every,
            state: Mutex::new(TokenBucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    pub async fn take(&self) {
        loop {
            let mut state = self.state.lock().await;
            let elapsed = state.last_refill.elapsed();
            if elapsed >= self.refill_every && self.refill_every.as_millis() > 0 {
                let refills = (elapsed.as_millis() / self.refill_every.as_millis()) as u32;
                state.tokens = (state.tokens.saturating_add(refills)).min(self.capacity);
                state.last_refill = Instant::now();
            }

            if state.tokens > 0 {
                state.tokens -= 1;
                return;
            }

            let sleep_for = self.refill_every;
            drop(state);
            tokio::time::sleep(sleep_for).await;
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("source unavailable: http status {status} for {url}")]
    SourceUnavailable { status: u16, url: String },
    #[error("request failed for {url}: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error(transparent)]
    Url(#[from] HashingError),
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
    #[error("fetcher is shutting down")]
    Closed,
}

impl FetchError {
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            FetchError::SourceUnavailable { status, .. } => StatusCode::from_u16(*status)
                .map(classify_status)
                .unwrap_or(RetryDisposition::Retryable),
            FetchError::Request { source, .. } => classify_reqwest_error(source),
            FetchError::Storage(_) | FetchError::Closed => RetryDisposition::Retryable,
            FetchError::Url(_) => RetryDisposition::NonRetryable,
        }
    }
}

/// Where raw documents come from; the HTTP implementation is [`HttpFetcher`].
#[async_trait]
pub trait DocumentSource: Send + Sync {
    async fn fetch(
        &self,
        provider: SourceDataProvider,
        url: &str,
    ) -> Result<FetchedResponse, FetchError>;
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_provider_limit: usize,
    per_provider: Mutex<HashMap<SourceDataProvider, Arc<Semaphore>>>,
    token_bucket: Option<Arc<SimpleTokenBucket>>,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        let token_bucket = config
            .token_bucket
            .map(|c| Arc::new(SimpleTokenBucket::new(c.capacity, c.refill_every)));

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_provider_limit: config.per_provider_concurrency.max(1),
            per_provider: Mutex::new(HashMap::new()),
            token_bucket,
        })
    }

    async fn per_provider_semaphore(&self, provider: SourceDataProvider) -> Arc<Semaphore> {
        let mut map = self.per_provider.lock().await;
        map.entry(provider)
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_provider_limit)))
            .clone()
    }
}

#[async_trait]
impl DocumentSource for HttpFetcher {
    async fn fetch(
        &self,
        provider: SourceDataProvider,
        url: &str,
    ) -> Result<FetchedResponse, FetchError> {
        let _global = self
            .global_limit
            .acquire()
            .await
            .map_err(|_| FetchError::Closed)?;
        let per_provider = self.per_provider_semaphore(provider).await;
        let _provider = per_provider.acquire().await.map_err(|_| FetchError::Closed)?;

        if let Some(bucket) = &self.token_bucket {
            bucket.take().await;
        }

        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|source| FetchError::Request {
                url: url.to_string(),
                source,
            })?;
        let status = resp.status();
        let final_url = resp.url().to_string();
        if !status.is_success() {
            return Err(FetchError::SourceUnavailable {
                status: status.as_u16(),
                url: final_url,
            });
        }

        let body = resp
            .bytes()
            .await
            .map_err(|source| FetchError::Request {
                url: final_url.clone(),
                source,
            })?
            .to_vec();
        Ok(FetchedResponse {
            status,
            final_url,
            body,
        })
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FetchOptions {
    pub bypass_cache: bool,
}

#[derive(Debug, Clone)]
pub struct RawDocument {
    pub url: String,
    pub url_hash: String,
    pub routing_key: String,
    pub content_hash: String,
    pub body: Vec<u8>,
    pub fetched_utc: DateTime<Utc>,
    pub from_cache: bool,
}

impl RawDocument {
    pub fn text(&self) -> Result<&str, std::str::Utf8Error> {
        std::str::from_utf8(&self.body)
    }

    pub fn json(&self) -> serde_json::Result<serde_json::Value> {
        serde_json::from_slice(&self.body)
    }
}

/// Cache-first document retrieval backed by a [`RawDocumentStore`].
#[derive(Clone)]
pub struct DocumentFetcher {
    store: RawDocumentStore,
    source: Arc<dyn DocumentSource>,
}

impl DocumentFetcher {
    pub fn new(store: RawDocumentStore, source: Arc<dyn DocumentSource>) -> Self {
        Self { store, source }
    }

    pub fn store(&self) -> &RawDocumentStore {
        &self.store
    }

    pub async fn fetch_and_store(
        &self,
        url: &str,
        provider: SourceDataProvider,
        options: FetchOptions,
    ) -> Result<RawDocument, FetchError> {
        let identity = UrlIdentity::parse(url)?;
        let key = routing_key(provider, url)?;

        if !options.bypass_cache {
            if let Some(stored) = self.store.load(provider, &key).await? {
                debug!(routing_key = %key, "document served from cache");
                return Ok(RawDocument {
                    url: identity.href,
                    url_hash: identity.url_hash,
                    routing_key: key,
                    content_hash: stored.meta.content_hash,
                    body: stored.body,
                    fetched_utc: stored.meta.fetched_utc,
                    from_cache: true,
                });
            }
        }

        let span = info_span!("fetch_document", %provider, url_hash = %identity.url_hash);
        let response = self.source.fetch(provider, url).instrument(span).await?;
        let fetched_utc = Utc::now();
        let stored = self
            .store
            .store(
                provider,
                &key,
                &identity.href,
                &identity.url_hash,
                fetched_utc,
                &response.body,
            )
            .await?;

        Ok(RawDocument {
            url: identity.href,
            url_hash: identity.url_hash,
            routing_key: key,
            content_hash: stored.meta.content_hash,
            body: stored.body,
            fetched_utc,
            from_cache: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    struct CountingSource {
        calls: AtomicUsize,
        status: StatusCode,
    }

    #[async_trait]
    impl DocumentSource for CountingSource {
        async fn fetch(
            &self,
            _provider: SourceDataProvider,
            url: &str,
        ) -> Result<FetchedResponse, FetchError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.status.is_success() {
                return Err(FetchError::SourceUnavailable {
                    status: self.status.as_u16(),
                    url: url.to_string(),
                });
            }
            Ok(FetchedResponse {
                status: self.status,
                final_url: url.to_string(),
                body: format!(r#"{{"id":"3958","fetch":{n}}}"#).into_bytes(),
            })
        }
    }

    fn fetcher(dir: &Path, status: StatusCode) -> (DocumentFetcher, Arc<CountingSource>) {
        let source = Arc::new(CountingSource {
            calls: AtomicUsize::new(0),
            status,
        });
        (
            DocumentFetcher::new(RawDocumentStore::new(dir), source.clone()),
            source,
        )
    }

    const VENUE_URL: &str =
        "http://sports.core.api.espn.com/v2/sports/football/leagues/college-football/venues/3958";

    #[tokio::test]
    async fn second_fetch_is_served_from_cache() {
        let dir = tempdir().expect("tempdir");
        let (fetcher, source) = fetcher(dir.path(), StatusCode::OK);

        let first = fetcher
            .fetch_and_store(VENUE_URL, SourceDataProvider::Espn, FetchOptions::default())
            .await
            .expect("first fetch");
        let second = fetcher
            .fetch_and_store(
                &format!("{VENUE_URL}/"),
                SourceDataProvider::Espn,
                FetchOptions::default(),
            )
            .await
            .expect("second fetch");

        assert!(!first.from_cache);
        assert!(second.from_cache);
        assert_eq!(first.body, second.body);
        assert_eq!(first.url_hash, second.url_hash);
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
        assert_eq!(second.json().expect("json")["id"], "3958");
    }

    #[tokio::test]
    async fn bypassing_the_cache_refetches_and_overwrites() {
        let dir = tempdir().expect("tempdir");
        let (fetcher, source) = fetcher(dir.path(), StatusCode::OK);

        fetcher
            .fetch_and_store(VENUE_URL, SourceDataProvider::Espn, FetchOptions::default())
            .await
            .expect("first fetch");
        let refreshed = fetcher
            .fetch_and_store(
                VENUE_URL,
                SourceDataProvider::Espn,
                FetchOptions { bypass_cache: true },
            )
            .await
            .expect("refetch");

        assert!(!refreshed.from_cache);
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
        let cached = fetcher
            .store()
            .load(SourceDataProvider::Espn, &refreshed.routing_key)
            .await
            .expect("load")
            .expect("present");
        assert_eq!(cached.body, refreshed.body);
    }

    #[tokio::test]
    async fn non_success_status_surfaces_source_unavailable() {
        let dir = tempdir().expect("tempdir");
        let (fetcher, source) = fetcher(dir.path(), StatusCode::SERVICE_UNAVAILABLE);

        let err = fetcher
            .fetch_and_store(VENUE_URL, SourceDataProvider::Espn, FetchOptions::default())
            .await
            .expect_err("should fail");
        assert!(matches!(err, FetchError::SourceUnavailable { status: 503, .. }));
        assert_eq!(err.disposition(), RetryDisposition::Retryable);
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
        assert!(!dir.path().join("espn").exists());
    }

    #[test]
    fn not_found_is_not_retryable() {
        let err = FetchError::SourceUnavailable {
            status: 404,
            url: VENUE_URL.into(),
        };
        assert_eq!(err.disposition(), RetryDisposition::NonRetryable);
    }

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }

    #[tokio::test(start_paused = true)]
    async fn token_bucket_spaces_requests_past_the_burst() {
        let config = TokenBucketConfig::per_second(2).expect("rate");
        assert_eq!(config.refill_every, Duration::from_millis(500));
        let bucket = SimpleTokenBucket::new(config.capacity, config.refill_every);

        let start = Instant::now();
        bucket.take().await;
        bucket.take().await;
        assert_eq!(start.elapsed(), Duration::ZERO);

        for _ in 0..3 {
            bucket.take().await;
        }
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(1_500), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(2_000), "{elapsed:?}");
        assert!(TokenBucketConfig::per_second(0).is_none());
    }
}
