//! Recursive resource-index crawl. Each task fetches one URL; fan-out goes
//! back through the job queue.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sdp_core::hashing::{url_hash, url_hash_with_query, HashingError};
use sdp_core::refs::{classify_value, extract_refs_from_value, DocumentShape, ResourceIndexPage};
use sdp_core::{causation, DocumentCreated, DocumentType};
use sdp_storage::{DocumentFetcher, FetchError, FetchOptions, RawDocument, RetryDisposition, StoreError};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, info_span, Instrument};
use uuid::Uuid;

use crate::bus::{BusError, Envelope, MessageBus};
use crate::store::{
    CrawlTask, ExecutionMode, JobKind, JobQueue, JobStatus, ResourceIndexItem, SourcingStore,
};

#[derive(Debug, Error)]
pub enum CrawlError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Url(#[from] HashingError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Bus(#[from] BusError),
    #[error("document at {url} is not valid json: {source}")]
    Json {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

impl CrawlError {
    pub fn retryable(&self) -> bool {
        match self {
            CrawlError::Fetch(err) => err.disposition() == RetryDisposition::Retryable,
            CrawlError::Store(_) | CrawlError::Bus(_) => true,
            CrawlError::Url(_) | CrawlError::Json { .. } => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CrawlOutcome {
    /// Visited and completed under this resource index before.
    AlreadyCompleted,
    Content { url_hash: String, children: usize },
    Index { items: usize, next_page: bool },
}

pub struct Crawler {
    fetcher: DocumentFetcher,
    store: Arc<dyn SourcingStore>,
    jobs: Arc<dyn JobQueue>,
    bus: Arc<dyn MessageBus>,
    max_depth: u32,
}

impl Crawler {
    pub fn new(
        fetcher: DocumentFetcher,
        store: Arc<dyn SourcingStore>,
        jobs: Arc<dyn JobQueue>,
        bus: Arc<dyn MessageBus>,
        max_depth: u32,
    ) -> Self {
        Self {
            fetcher,
            store,
            jobs,
            bus,
            max_depth,
        }
    }

    pub fn max_depth(&self) -> u32 {
        self.max_depth
    }

    pub async fn run(&self, task: &CrawlTask) -> Result<CrawlOutcome, CrawlError> {
        let visit_hash = url_hash_with_query(&task.url)?;
        let span = info_span!(
            "crawl",
            url_hash = %visit_hash,
            depth = task.depth,
            document_type = %task.document_type,
            correlation_id = %task.correlation_id
        );
        self.run_inner(task, visit_hash).instrument(span).await
    }

    async fn run_inner(&self, task: &CrawlTask, visit_hash: String) -> Result<CrawlOutcome, CrawlError> {
        let now = Utc::now();
        let visit = self
            .store
            .record_visit(ResourceIndexItem {
                id: Uuid::new_v4(),
                resource_index_id: task.resource_index_id,
                url: task.url.clone(),
                url_hash: visit_hash.clone(),
                parent_item_id: task.parent_item_id,
                depth: task.depth,
                document_type: task.document_type,
                created_utc: now,
                last_accessed_utc: now,
                completed_utc: None,
            })
            .await?;
        if visit.is_done() {
            debug!("already crawled under this resource index");
            return Ok(CrawlOutcome::AlreadyCompleted);
        }
        let outcome = self.visit(task, visit.item().id).await?;

        let now = Utc::now();
        self.store
            .complete_visit(task.resource_index_id, &visit_hash, now)
            .await?;
        let last_root_page = !matches!(outcome, CrawlOutcome::Index { next_page: true, .. });
        if task.depth == 0 && last_root_page {
            if let Some(job_id) = task.scheduled_job_id {
                self.finish_scheduled_job(job_id, now).await?;
            }
        }
        Ok(outcome)
    }

    async fn visit(&self, task: &CrawlTask, item_id: Uuid) -> Result<CrawlOutcome, CrawlError> {
        let options = FetchOptions {
            bypass_cache: task.bypass_cache,
        };
        let mut document = self.fetcher.fetch_and_store(&task.url, task.provider, options).await?;
        let mut value = parse(&document)?;

        // Index pages change as the provider adds items; never trust a cached copy.
        if classify_value(&value) == DocumentShape::Index && document.from_cache {
            document = self
                .fetcher
                .fetch_and_store(&task.url, task.provider, FetchOptions { bypass_cache: true })
                .await?;
            value = parse(&document)?;
        }

        match classify_value(&value) {
            DocumentShape::Content => self.content(task, item_id, &document, &value).await,
            DocumentShape::Index => self.index(task, item_id, &document, &value).await,
        }
    }

    /// The root of a scheduled crawl has landed: stamp the job, and close it out
    /// unless it polls.
    async fn finish_scheduled_job(&self, job_id: Uuid, at: DateTime<Utc>) -> Result<(), StoreError> {
        let Some(mut job) = self.store.job(job_id).await? else {
            return Ok(());
        };
        job.last_completed_utc = Some(at);
        if job.execution_mode == ExecutionMode::OneTime {
            job.status = JobStatus::Completed;
        }
        self.store.update_job(&job).await?;
        info!(scheduled_job_id = %job_id, status = job.status.as_str(), "scheduled crawl completed");
        Ok(())
    }

    async fn content(
        &self,
        task: &CrawlTask,
        item_id: Uuid,
        document: &RawDocument,
        value: &Value,
    ) -> Result<CrawlOutcome, CrawlError> {
        let parent_id = match &task.parent_url {
            Some(parent) => Some(url_hash(parent)?),
            None => None,
        };
        let event = DocumentCreated {
            id: document.url_hash.clone(),
            parent_id,
            name: format!("{}:{}", task.document_type, document.url_hash),
            href: document.url.clone(),
            source_ref: task.url.clone(),
            document_json: String::from_utf8_lossy(&document.body).into_owned(),
            source_url_hash: document.url_hash.clone(),
            sport: task.sport,
            season_year: task.season_year,
            document_type: task.document_type,
            source_data_provider: task.provider,
            correlation_id: task.correlation_id,
            causation_id: causation::PROVIDER_RESOURCE_INDEX_ITEM,
            attempt_count: 0,
            include_linked_document_types: None,
            requested_dependencies: None,
        };
        self.bus.publish(Envelope::direct(&event)?).await?;

        let mut children = 0;
        if task.depth + 1 < self.max_depth {
            for href in extract_refs_from_value(value) {
                if url_hash(&href)? == document.url_hash {
                    continue;
                }
                let Some(document_type) = DocumentType::infer_from_url(&href) else {
                    continue;
                };
                self.jobs
                    .enqueue(JobKind::Crawl(task.child(href, document_type, item_id)), Utc::now())
                    .await?;
                children += 1;
            }
        }
        info!(children, from_cache = document.from_cache, "document published");
        Ok(CrawlOutcome::Content {
            url_hash: document.url_hash.clone(),
            children,
        })
    }

    async fn index(
        &self,
        task: &CrawlTask,
        item_id: Uuid,
        document: &RawDocument,
        value: &Value,
    ) -> Result<CrawlOutcome, CrawlError> {
        let page: ResourceIndexPage =
            serde_json::from_value(value.clone()).map_err(|source| CrawlError::Json {
                url: document.url.clone(),
                source,
            })?;

        let mut items = 0;
        if task.depth + 1 < self.max_depth {
            for href in page.item_refs() {
                let document_type = DocumentType::infer_from_url(&href).unwrap_or(task.document_type);
                self.jobs
                    .enqueue(JobKind::Crawl(task.child(href, document_type, item_id)), Utc::now())
                    .await?;
                items += 1;
            }
        }

        let next = page.next_page_url(&task.url);
        if let Some(url) = &next {
            let next_task = CrawlTask {
                url: url.clone(),
                ..task.clone()
            };
            self.jobs.enqueue(JobKind::Crawl(next_task), Utc::now()).await?;
        }

        if let Some(job_id) = task.scheduled_job_id {
            if let Some(mut job) = self.store.job(job_id).await? {
                job.page_cursor = Some(page.page_index as i32);
                self.store.update_job(&job).await?;
            }
        }

        info!(items, page = page.page_index, pages = page.page_count, "index page crawled");
        Ok(CrawlOutcome::Index {
            items,
            next_page: next.is_some(),
        })
    }
}

fn parse(document: &RawDocument) -> Result<Value, CrawlError> {
    document.json().map_err(|source| CrawlError::Json {
        url: document.url.clone(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MemoryBus;
    use crate::store::{MemorySourcingStore, ScheduledJob};
    use async_trait::async_trait;
    use sdp_core::{SourceDataProvider, Sport};
    use sdp_storage::{DocumentSource, FetchedResponse, RawDocumentStore, StatusCode};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    const ROOT: &str = "http://api.test/v2/sports/football/leagues/nfl";

    #[derive(Default)]
    struct StaticSource {
        documents: HashMap<String, String>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl DocumentSource for StaticSource {
        async fn fetch(
            &self,
            _provider: SourceDataProvider,
            url: &str,
        ) -> Result<FetchedResponse, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.documents.get(url) {
                Some(body) => Ok(FetchedResponse {
                    status: StatusCode::OK,
                    final_url: url.to_string(),
                    body: body.clone().into_bytes(),
                }),
                None => Err(FetchError::SourceUnavailable {
                    status: 404,
                    url: url.to_string(),
                }),
            }
        }
    }

    fn task(url: &str, document_type: DocumentType) -> CrawlTask {
        CrawlTask {
            resource_index_id: Uuid::new_v4(),
            url: url.to_string(),
            parent_item_id: None,
            parent_url: None,
            depth: 0,
            provider: SourceDataProvider::Espn,
            sport: Sport::FootballNfl,
            document_type,
            season_year: None,
            scheduled_job_id: None,
            correlation_id: Uuid::new_v4(),
            bypass_cache: false,
        }
    }

    fn crawler(
        source: StaticSource,
        dir: &std::path::Path,
        store: &MemorySourcingStore,
        bus: &MemoryBus,
    ) -> Crawler {
        Crawler::new(
            DocumentFetcher::new(RawDocumentStore::new(dir), Arc::new(source)),
            Arc::new(store.clone()),
            Arc::new(store.clone()),
            Arc::new(bus.clone()),
            2,
        )
    }

    #[tokio::test]
    async fn index_fans_out_items_and_next_page() {
        let dir = tempdir().expect("tempdir");
        let mut source = StaticSource::default();
        source.documents.insert(
            format!("{ROOT}/venues"),
            format!(
                r#"{{"count":3,"pageIndex":1,"pageSize":2,"pageCount":2,
                    "items":[{{"$ref":"{ROOT}/venues/1?lang=en"}},{{"$ref":"{ROOT}/venues/2"}}]}}"#
            ),
        );
        let store = MemorySourcingStore::new();
        let bus = MemoryBus::new();
        let crawler = crawler(source, dir.path(), &store, &bus);

        let outcome = crawler
            .run(&task(&format!("{ROOT}/venues"), DocumentType::Venue))
            .await
            .expect("crawl");

        assert_eq!(outcome, CrawlOutcome::Index { items: 2, next_page: true });
        let queued = store.queued().await;
        assert_eq!(queued.len(), 3);
        assert!(queued.iter().any(|job| matches!(
            &job.kind,
            JobKind::Crawl(t) if t.url.ends_with("page=2") && t.depth == 0
        )));
        assert!(bus.published().await.is_empty());
    }

    #[tokio::test]
    async fn content_is_published_once_per_resource_index() {
        let dir = tempdir().expect("tempdir");
        let mut source = StaticSource::default();
        source.documents.insert(
            format!("{ROOT}/venues/42"),
            format!(r#"{{"id":"42","fullName":"Stadium","$ref":"{ROOT}/venues/42"}}"#),
        );
        let store = MemorySourcingStore::new();
        let bus = MemoryBus::new();
        let crawler = crawler(source, dir.path(), &store, &bus);
        let task = task(&format!("{ROOT}/venues/42"), DocumentType::Venue);

        let first = crawler.run(&task).await.expect("first");
        let second = crawler.run(&task).await.expect("second");

        assert!(matches!(first, CrawlOutcome::Content { children: 0, .. }));
        assert_eq!(second, CrawlOutcome::AlreadyCompleted);
        let published = bus.published().await;
        assert_eq!(published.len(), 1);
        let event: DocumentCreated = published[0].decode().expect("decode");
        assert_eq!(event.causation_id, causation::PROVIDER_RESOURCE_INDEX_ITEM);
        assert_eq!(event.document_type, DocumentType::Venue);
    }

    #[tokio::test]
    async fn content_refs_are_followed_below_max_depth() {
        let dir = tempdir().expect("tempdir");
        let mut source = StaticSource::default();
        source.documents.insert(
            format!("{ROOT}/franchises/9"),
            format!(
                r#"{{"id":"9","venue":{{"$ref":"{ROOT}/venues/3?lang=en"}},
                    "record":{{"$ref":"{ROOT}/franchises/9/record"}}}}"#
            ),
        );
        let store = MemorySourcingStore::new();
        let bus = MemoryBus::new();
        let crawler = crawler(source, dir.path(), &store, &bus);

        let outcome = crawler
            .run(&task(&format!("{ROOT}/franchises/9"), DocumentType::Franchise))
            .await
            .expect("crawl");

        assert!(matches!(outcome, CrawlOutcome::Content { children: 1, .. }));
        let queued = store.queued().await;
        let JobKind::Crawl(child) = &queued[0].kind else {
            panic!("expected crawl task");
        };
        assert_eq!(child.document_type, DocumentType::Venue);
        assert_eq!(child.depth, 1);
        assert_eq!(child.parent_url.as_deref(), Some(format!("{ROOT}/franchises/9").as_str()));
    }

    #[tokio::test]
    async fn missing_document_is_not_retryable() {
        let dir = tempdir().expect("tempdir");
        let store = MemorySourcingStore::new();
        let bus = MemoryBus::new();
        let crawler = crawler(StaticSource::default(), dir.path(), &store, &bus);

        let task = task(&format!("{ROOT}/venues/404"), DocumentType::Venue);
        let err = crawler.run(&task).await.expect_err("missing");
        assert!(!err.retryable());

        // Visited but not completed, so a later run resumes instead of skipping.
        let items = store.index_items(task.resource_index_id).await.expect("items");
        assert_eq!(items.len(), 1);
        assert!(items[0].completed_utc.is_none());
    }

    #[tokio::test]
    async fn root_document_completes_its_one_time_job() {
        let dir = tempdir().expect("tempdir");
        let mut source = StaticSource::default();
        for id in ["42", "43"] {
            source.documents.insert(
                format!("{ROOT}/venues/{id}"),
                format!(r#"{{"id":"{id}","fullName":"Stadium {id}"}}"#),
            );
        }
        let store = MemorySourcingStore::new();
        let bus = MemoryBus::new();
        let crawler = crawler(source, dir.path(), &store, &bus);
        let entry = crate::catalog::seed_catalog(Sport::FootballNfl)
            .into_iter()
            .find(|e| e.is_recurring)
            .expect("recurring entry");
        let mut root_job = crate::worker::recurring_job(&entry, Utc::now());
        root_job.execution_mode = ExecutionMode::OneTime;
        let child_job = ScheduledJob {
            id: Uuid::new_v4(),
            ..root_job.clone()
        };
        store.update_job(&root_job).await.expect("root job");
        store.update_job(&child_job).await.expect("child job");

        let mut root = task(&format!("{ROOT}/venues/42"), DocumentType::Venue);
        root.scheduled_job_id = Some(root_job.id);
        let mut child = task(&format!("{ROOT}/venues/43"), DocumentType::Venue);
        child.depth = 1;
        child.scheduled_job_id = Some(child_job.id);
        crawler.run(&root).await.expect("root");
        crawler.run(&child).await.expect("child");

        let root_job = store.job(root_job.id).await.expect("job").expect("exists");
        assert_eq!(root_job.status, JobStatus::Completed);
        assert!(root_job.last_completed_utc.is_some());
        let child_job = store.job(child_job.id).await.expect("job").expect("exists");
        assert_eq!(child_job.status, JobStatus::Active);
        assert!(child_job.last_completed_utc.is_none());
    }
}
