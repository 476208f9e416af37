use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use carve_core::evaluation::EvaluationSummary;
use carve_core::models::{EvaluationRun, ParserConfig, RunHeader, SystemState};
use carve_core::queue::{DeadLetter, MissingConfig, QueueItem};

// ---------------------------------------------------------------------------
// System state
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct StateResponse {
    pub state: SystemState,
}

#[derive(Debug, Deserialize)]
pub struct SetStateRequest {
    /// `RUNNING` or `PAUSE`
    pub state: String,
}

#[derive(Debug, Serialize)]
pub struct SetStateResponse {
    pub state: SystemState,
    pub previous: SystemState,
}

// ---------------------------------------------------------------------------
// Queue
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct EnqueueRequest {
    pub urls: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct EnqueueResponse {
    pub items: Vec<QueueItem>,
}

#[derive(Debug, Serialize)]
pub struct QueueStatsResponse {
    pub pending: u64,
    pub claimed: u64,
}

#[derive(Debug, Deserialize)]
pub struct LimitQuery {
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct DeadLetterListResponse {
    pub dead_letters: Vec<DeadLetter>,
    pub total: usize,
}

#[derive(Debug, Serialize)]
pub struct MissingConfigsResponse {
    pub prefixes: Vec<MissingConfig>,
}

// ---------------------------------------------------------------------------
// Configs
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct ListConfigsQuery {
    pub prefix: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct ConfigListResponse {
    pub configs: Vec<ParserConfig>,
    pub total: usize,
}

#[derive(Debug, Deserialize)]
pub struct UrlQuery {
    pub url: String,
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
pub struct EvaluationRequest {
    /// Generator profiles to synthesize and score
    #[serde(default)]
    pub profiles: Vec<String>,
    /// Stored configs to score on validation samples
    #[serde(default)]
    pub config_ids: Vec<Uuid>,
    /// Sample domains (empty = all)
    #[serde(default)]
    pub domains: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct EvaluationResponse {
    pub run_id: Uuid,
    pub datetime: DateTime<Utc>,
    pub result_count: usize,
    pub summary: EvaluationSummary,
}

#[derive(Debug, Serialize)]
pub struct RunListResponse {
    pub runs: Vec<RunHeader>,
    pub total: usize,
}

#[derive(Debug, Serialize)]
pub struct RunDetailResponse {
    pub run: EvaluationRun,
    pub summary: EvaluationSummary,
}

#[derive(Debug, Serialize)]
pub struct ClearRunsResponse {
    pub deleted: u64,
}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub database: &'static str,
    pub state: SystemState,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}
