use std::sync::Arc;

use axum::Router;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use uuid::Uuid;

use carve_core::error::AppError;
use carve_core::evaluation::{EvaluationService, config_jobs, profile_jobs, summarize};
use carve_core::models::SystemState;
use carve_core::profile::GeneratorProfile;
use carve_core::queue::{WorkQueue, prefixes_needing_config};
use carve_core::synthesis::TracingSynthesisReporter;
use carve_core::traits::{ConfigStore, EvaluationRunStore, ExtractionStore};
use carve_core::urls::normalize_url;

use crate::dto::{
    ClearRunsResponse, ConfigListResponse, DeadLetterListResponse, EnqueueRequest,
    EnqueueResponse, ErrorResponse, EvaluationRequest, EvaluationResponse, HealthResponse,
    LimitQuery, ListConfigsQuery, MissingConfigsResponse, QueueStatsResponse, RunDetailResponse,
    RunListResponse, SetStateRequest, SetStateResponse, StateResponse, UrlQuery,
};
use crate::error::ApiError;
use crate::state::AppState;

const DEFAULT_LIMIT: usize = 20;
const MAX_LIMIT: usize = 100;
const MISSING_CONFIG_SCAN: usize = 1000;

/// Build the full router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/v1/state", get(get_state).put(set_state))
        .route("/v1/queue", get(queue_stats).post(enqueue))
        .route("/v1/dead-letters", get(list_dead_letters))
        .route("/v1/dead-letters/{id}/requeue", post(requeue_dead_letter))
        .route("/v1/missing-configs", get(list_missing_configs))
        .route("/v1/configs", get(list_configs))
        .route("/v1/configs/{id}", get(get_config))
        .route("/v1/configs/{id}/promote", post(promote_config))
        .route("/v1/production", get(production_for_url))
        .route("/v1/extractions", get(get_extraction))
        .route("/v1/evaluations", post(run_evaluation))
        .route("/v1/runs", get(list_runs).delete(clear_runs))
        .route("/v1/runs/{id}", get(get_run).delete(delete_run))
        .with_state(state)
}

fn limit(query: &LimitQuery) -> usize {
    query.limit.unwrap_or(DEFAULT_LIMIT).min(MAX_LIMIT)
}

fn bad_request(message: impl Into<String>) -> axum::response::Response {
    let body = ErrorResponse {
        error: "validation_error".to_string(),
        message: message.into(),
    };
    (StatusCode::BAD_REQUEST, axum::Json(body)).into_response()
}

// ---------------------------------------------------------------------------
// System state
// ---------------------------------------------------------------------------

pub async fn get_state(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    axum::Json(StateResponse {
        state: state.control.state(),
    })
}

/// Pausing takes effect before each worker's next dequeue; in-flight items
/// finish.
pub async fn set_state(
    State(state): State<Arc<AppState>>,
    axum::Json(body): axum::Json<SetStateRequest>,
) -> impl IntoResponse {
    let requested: SystemState = match body.state.parse() {
        Ok(s) => s,
        Err(message) => return bad_request(message),
    };
    let previous = state.control.set(requested);

    axum::Json(SetStateResponse {
        state: requested,
        previous,
    })
    .into_response()
}

// ---------------------------------------------------------------------------
// Queue
// ---------------------------------------------------------------------------

pub async fn enqueue(
    State(state): State<Arc<AppState>>,
    axum::Json(body): axum::Json<EnqueueRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if body.urls.is_empty() {
        return Ok(bad_request("urls must not be empty"));
    }

    // Validate everything before writing anything.
    let urls = body
        .urls
        .iter()
        .map(|u| normalize_url(u))
        .collect::<Result<Vec<_>, _>>()?;

    let queue = state.db.queue_repo();
    let mut items = Vec::with_capacity(urls.len());
    for url in &urls {
        items.push(queue.enqueue(url).await?);
    }
    tracing::info!(count = items.len(), "URLs enqueued");

    Ok((StatusCode::ACCEPTED, axum::Json(EnqueueResponse { items })).into_response())
}

pub async fn queue_stats(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse, ApiError> {
    let queue = state.db.queue_repo();
    Ok(axum::Json(QueueStatsResponse {
        pending: queue.pending_count().await?,
        claimed: queue.claimed_count().await?,
    }))
}

pub async fn list_dead_letters(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LimitQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let dead_letters = state.db.queue_repo().dead_letters(limit(&query)).await?;
    let total = dead_letters.len();
    Ok(axum::Json(DeadLetterListResponse {
        dead_letters,
        total,
    }))
}

pub async fn requeue_dead_letter(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let item = state.db.queue_repo().requeue_dead(id).await?;
    Ok((StatusCode::ACCEPTED, axum::Json(item)))
}

/// Prefixes whose URLs were dead-lettered for lack of a production config,
/// from the most recent dead letters.
pub async fn list_missing_configs(
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, ApiError> {
    let dead = state.db.queue_repo().dead_letters(MISSING_CONFIG_SCAN).await?;
    Ok(axum::Json(MissingConfigsResponse {
        prefixes: prefixes_needing_config(&dead),
    }))
}

// ---------------------------------------------------------------------------
// Configs
// ---------------------------------------------------------------------------

pub async fn list_configs(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListConfigsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let prefix = query.prefix.as_deref().map(normalize_url).transpose()?;
    let limit = query.limit.unwrap_or(DEFAULT_LIMIT).min(MAX_LIMIT);
    let configs = state.db.config_repo().list(prefix.as_deref(), limit).await?;
    let total = configs.len();
    Ok(axum::Json(ConfigListResponse { configs, total }))
}

pub async fn get_config(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let config = state
        .db
        .config_repo()
        .get_by_id(id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("parser config {id}")))?;
    Ok(axum::Json(config))
}

pub async fn promote_config(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let config = state.db.config_repo().promote(id).await?;
    Ok(axum::Json(config))
}

/// The production config a worker would use for `url`.
pub async fn production_for_url(
    State(state): State<Arc<AppState>>,
    Query(query): Query<UrlQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let url = normalize_url(&query.url)?;
    let config = state
        .db
        .config_repo()
        .production_for_url(&url)
        .await?
        .ok_or(AppError::ConfigNotFound(url))?;
    Ok(axum::Json(config))
}

// ---------------------------------------------------------------------------
// Extractions
// ---------------------------------------------------------------------------

pub async fn get_extraction(
    State(state): State<Arc<AppState>>,
    Query(query): Query<UrlQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let url = normalize_url(&query.url)?;
    let record = state
        .db
        .extraction_repo()
        .get(&url)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("extraction for {url}")))?;
    Ok(axum::Json(record))
}

// ---------------------------------------------------------------------------
// Evaluation runs
// ---------------------------------------------------------------------------

/// Score profiles and/or stored configs and persist the run. Runs
/// synchronously; the response carries the summary.
pub async fn run_evaluation(
    State(state): State<Arc<AppState>>,
    axum::Json(body): axum::Json<EvaluationRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if body.profiles.is_empty() && body.config_ids.is_empty() {
        return Ok(bad_request("Pass at least one profile or config id"));
    }

    let mut jobs = Vec::new();
    if !body.profiles.is_empty() {
        let factory = state.proposers.as_ref().ok_or_else(|| {
            AppError::ConfigError("CARVE_API_KEY must be set for profile evaluations".to_string())
        })?;
        let profiles = body
            .profiles
            .iter()
            .map(|name| GeneratorProfile::load(&state.profiles_dir, name))
            .collect::<Result<Vec<_>, _>>()?;
        jobs.extend(
            profile_jobs(
                factory,
                &profiles,
                &state.library,
                &body.domains,
                &state.scoring,
                &state.shutdown,
                &TracingSynthesisReporter,
            )
            .await?,
        );
    }
    if !body.config_ids.is_empty() {
        jobs.extend(
            config_jobs(
                &state.db.config_repo(),
                &body.config_ids,
                &state.library,
                &body.domains,
            )
            .await?,
        );
    }

    let run = EvaluationService::new(state.db.evaluation_repo(), state.scoring)
        .run(&jobs, &state.shutdown)
        .await?;

    let response = EvaluationResponse {
        run_id: run.id,
        datetime: run.datetime,
        result_count: run.results.len(),
        summary: summarize(&run),
    };
    Ok((StatusCode::CREATED, axum::Json(response)).into_response())
}

pub async fn list_runs(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LimitQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let runs = state.db.evaluation_repo().list_runs(limit(&query)).await?;
    let total = runs.len();
    Ok(axum::Json(RunListResponse { runs, total }))
}

pub async fn get_run(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let run = state
        .db
        .evaluation_repo()
        .get_run(id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("evaluation run {id}")))?;
    let summary = summarize(&run);
    Ok(axum::Json(RunDetailResponse { run, summary }))
}

pub async fn delete_run(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    if !state.db.evaluation_repo().delete_run(id).await? {
        return Err(AppError::NotFound(format!("evaluation run {id}")).into());
    }
    Ok(StatusCode::NO_CONTENT)
}

pub async fn clear_runs(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse, ApiError> {
    let deleted = state.db.evaluation_repo().clear_runs().await?;
    Ok(axum::Json(ClearRunsResponse { deleted }))
}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

pub async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let db_status = match state.db.health_check().await {
        Ok(()) => "ok",
        Err(_) => "error",
    };

    let status = if db_status == "ok" {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    let response = HealthResponse {
        status: if db_status == "ok" {
            "healthy"
        } else {
            "unhealthy"
        },
        database: db_status,
        state: state.control.state(),
    };

    (status, axum::Json(response))
}
