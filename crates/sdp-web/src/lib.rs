//! Operator HTTP surface: start historical sourcing, reprocess dead letters,
//! and inspect a season's sourcing jobs.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use sdp_core::{SourceDataProvider, Sport};
use sdp_sync::dead_letter::ReprocessError;
use sdp_sync::store::ScheduledJob;
use sdp_sync::{
    DeadLetterReprocessor, ReprocessRequest, SourceSeasonRequest, SourcingError,
    SourcingScheduler, SourcingStore, SyncPipeline,
};
use serde::Serialize;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};
use uuid::Uuid;

pub const CRATE_NAME: &str = "sdp-web";

#[derive(Clone)]
pub struct AppState {
    pub scheduler: Arc<SourcingScheduler>,
    pub reprocessor: Arc<DeadLetterReprocessor>,
    pub store: Arc<dyn SourcingStore>,
}

impl AppState {
    pub fn new(
        scheduler: Arc<SourcingScheduler>,
        reprocessor: Arc<DeadLetterReprocessor>,
        store: Arc<dyn SourcingStore>,
    ) -> Self {
        Self {
            scheduler,
            reprocessor,
            store,
        }
    }

    pub fn from_pipeline(pipeline: &SyncPipeline) -> Self {
        Self::new(
            pipeline.scheduler(),
            pipeline.reprocessor(),
            pipeline.store().clone(),
        )
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SourcingAccepted {
    correlation_id: Uuid,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ReprocessAccepted {
    job_id: Uuid,
    queue_name: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SeasonProgress {
    sport: Sport,
    provider: SourceDataProvider,
    season_year: i32,
    jobs: Vec<ScheduledJob>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/api/sourcing/historical", post(source_season_handler))
        .route("/api/sourcing/{sport}/{provider}/{year}", get(season_progress_handler))
        .route("/api/dead-letter/reprocess", post(reprocess_handler))
        .with_state(Arc::new(state))
}

/// Serves until `shutdown` flips to true.
pub async fn serve(state: AppState, bind: &str, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
    let listener = TcpListener::bind(bind).await?;
    info!(addr = %listener.local_addr()?, "operator api listening");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(async move {
            while !*shutdown.borrow() {
                if shutdown.changed().await.is_err() {
                    break;
                }
            }
        })
        .await?;
    Ok(())
}

async fn healthz_handler() -> Response {
    Json(json!({ "status": "ok", "service": CRATE_NAME })).into_response()
}

async fn source_season_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<SourceSeasonRequest>,
) -> Response {
    match state.scheduler.source_season(request).await {
        Ok(correlation_id) => (
            StatusCode::ACCEPTED,
            Json(SourcingAccepted { correlation_id }),
        )
            .into_response(),
        Err(err @ SourcingError::Validation(_)) => problem(StatusCode::BAD_REQUEST, &err),
        Err(err @ SourcingError::AlreadyRunning { .. }) => problem(StatusCode::CONFLICT, &err),
        Err(err) => server_error(&err),
    }
}

async fn reprocess_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ReprocessRequest>,
) -> Response {
    let queue_name = state.reprocessor.queue_name(request.queue_name.as_deref());
    match state.reprocessor.reprocess(request).await {
        Ok(job_id) => (
            StatusCode::ACCEPTED,
            Json(ReprocessAccepted { job_id, queue_name }),
        )
            .into_response(),
        Err(err @ ReprocessError::InvalidCount(_)) => problem(StatusCode::BAD_REQUEST, &err),
        Err(err) => server_error(&err),
    }
}

async fn season_progress_handler(
    State(state): State<Arc<AppState>>,
    Path((sport, provider, year)): Path<(String, String, i32)>,
) -> Response {
    let sport: Sport = match sport.parse() {
        Ok(sport) => sport,
        Err(err) => return problem(StatusCode::BAD_REQUEST, &err),
    };
    let provider: SourceDataProvider = match provider.parse() {
        Ok(provider) => provider,
        Err(err) => return problem(StatusCode::BAD_REQUEST, &err),
    };
    match state.store.jobs_for_season(provider, sport, year).await {
        Ok(jobs) => Json(SeasonProgress {
            sport,
            provider,
            season_year: year,
            jobs,
        })
        .into_response(),
        Err(err) => server_error(&err),
    }
}

fn problem(status: StatusCode, err: &dyn std::error::Error) -> Response {
    (status, Json(json!({ "error": err.to_string() }))).into_response()
}

fn server_error(err: &dyn std::error::Error) -> Response {
    error!(error = %err, "request failed");
    problem(StatusCode::INTERNAL_SERVER_ERROR, err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{header, Request};
    use http_body_util::BodyExt;
    use sdp_sync::dead_letter::MemoryDeadLetterQueue;
    use sdp_sync::scheduler::lock_key;
    use sdp_sync::{MemoryBus, MemorySourcingStore, SourcingLock, TierDelayTable};
    use serde_json::Value;
    use tower::ServiceExt;

    fn state(store: &Arc<MemorySourcingStore>) -> AppState {
        AppState::new(
            Arc::new(SourcingScheduler::new(
                store.clone(),
                store.clone(),
                TierDelayTable::default(),
            )),
            Arc::new(DeadLetterReprocessor::new(
                Arc::new(MemoryDeadLetterQueue::new()),
                Arc::new(MemoryBus::new()),
                store.clone(),
                None,
            )),
            store.clone(),
        )
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn json_body(resp: Response) -> Value {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn historical_sourcing_is_accepted_then_visible() {
        let store = Arc::new(MemorySourcingStore::new());
        let app = app(state(&store));

        let resp = app
            .clone()
            .oneshot(post_json(
                "/api/sourcing/historical",
                json!({ "sport": "FootballNfl", "provider": "Espn", "seasonYear": 2024 }),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
        let accepted = json_body(resp).await;
        assert!(accepted["correlationId"].is_string());

        let progress = app
            .oneshot(
                Request::builder()
                    .uri("/api/sourcing/FootballNfl/Espn/2024")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(progress.status(), StatusCode::OK);
        let progress = json_body(progress).await;
        assert_eq!(progress["jobs"].as_array().unwrap().len(), 4);
        assert_eq!(progress["jobs"][0]["correlationId"], accepted["correlationId"]);
    }

    #[tokio::test]
    async fn invalid_sourcing_requests_are_rejected() {
        let store = Arc::new(MemorySourcingStore::new());
        let resp = app(state(&store))
            .oneshot(post_json(
                "/api/sourcing/historical",
                json!({
                    "sport": "FootballNfl",
                    "provider": "Espn",
                    "seasonYear": 2024,
                    "tierDelays": { "venue": -1 }
                }),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert!(store.all_jobs().await.is_empty());
    }

    #[tokio::test]
    async fn concurrent_forced_run_conflicts() {
        let store = Arc::new(MemorySourcingStore::new());
        assert!(store
            .try_acquire(lock_key(Sport::FootballNfl, 2024))
            .await
            .unwrap());

        let resp = app(state(&store))
            .oneshot(post_json(
                "/api/sourcing/historical",
                json!({ "sport": "FootballNfl", "provider": "Espn", "seasonYear": 2024, "force": true }),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn reprocess_validates_count_and_queues_a_job() {
        let store = Arc::new(MemorySourcingStore::new());
        let app = app(state(&store));

        let bad = app
            .clone()
            .oneshot(post_json("/api/dead-letter/reprocess", json!({ "count": 0 })))
            .await
            .unwrap();
        assert_eq!(bad.status(), StatusCode::BAD_REQUEST);

        let ok = app
            .oneshot(post_json("/api/dead-letter/reprocess", json!({ "count": 25 })))
            .await
            .unwrap();
        assert_eq!(ok.status(), StatusCode::ACCEPTED);
        let body = json_body(ok).await;
        assert_eq!(body["queueName"], "document-dead-letter");
        assert_eq!(store.queued().await.len(), 1);
    }

    #[tokio::test]
    async fn unknown_sport_in_path_is_a_bad_request() {
        let store = Arc::new(MemorySourcingStore::new());
        let resp = app(state(&store))
            .oneshot(
                Request::builder()
                    .uri("/api/sourcing/Curling/Espn/2024")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn healthz_reports_ok() {
        let store = Arc::new(MemorySourcingStore::new());
        let resp = app(state(&store))
            .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(json_body(resp).await["status"], "ok");
    }
}
