use std::future::Future;

use uuid::Uuid;

use crate::error::AppError;
use crate::models::{EvaluationRun, ExtractionRecord, ParserConfig, RunHeader};
use crate::profile::GeneratorProfile;
use crate::proposal::ProposalRequest;

/// Fetches raw HTML content from a URL.
pub trait Fetcher: Send + Sync + Clone {
    fn fetch(&self, url: &str) -> impl Future<Output = Result<String, AppError>> + Send;
}

/// Proposes a selector set for a prefix from labeled samples.
///
/// The returned JSON is untrusted and must go through
/// [`crate::proposal::validate_proposal`] before use.
pub trait ConfigProposer: Send + Sync + Clone {
    fn propose(
        &self,
        request: &ProposalRequest,
    ) -> impl Future<Output = Result<serde_json::Value, AppError>> + Send;
}

/// Builds proposers from generator profiles, so one evaluation can compare
/// several models or prompts.
pub trait ConfigProposerFactory: Send + Sync + Clone {
    type Proposer: ConfigProposer;

    fn create(&self, profile: &GeneratorProfile) -> Result<Self::Proposer, AppError>;
}

/// Versioned parser configs plus the production pointer per prefix.
pub trait ConfigStore: Send + Sync + Clone {
    /// Store a new config. Configs are immutable: a second `put` with the
    /// same id fails with `AlreadyExists`.
    fn put(&self, config: &ParserConfig) -> impl Future<Output = Result<(), AppError>> + Send;

    fn get_by_id(
        &self,
        id: Uuid,
    ) -> impl Future<Output = Result<Option<ParserConfig>, AppError>> + Send;

    /// Most recently stored config for an exact prefix.
    fn get(
        &self,
        prefix: &str,
    ) -> impl Future<Output = Result<Option<ParserConfig>, AppError>> + Send;

    /// All configs, newest first, optionally restricted to one prefix.
    fn list(
        &self,
        prefix: Option<&str>,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<ParserConfig>, AppError>> + Send;

    /// Make `id` the production config for its prefix. Replaces the previous
    /// production config in one step; unknown ids yield `NotFound`.
    fn promote(&self, id: Uuid) -> impl Future<Output = Result<ParserConfig, AppError>> + Send;

    fn current_production(
        &self,
        prefix: &str,
    ) -> impl Future<Output = Result<Option<ParserConfig>, AppError>> + Send;

    /// Production config with the longest prefix covering `url`.
    fn production_for_url(
        &self,
        url: &str,
    ) -> impl Future<Output = Result<Option<ParserConfig>, AppError>> + Send;
}

/// Persists the parsed form of production URLs. One record per URL.
pub trait ExtractionStore: Send + Sync + Clone {
    /// Insert or replace the record for `record.url`.
    fn save(&self, record: &ExtractionRecord) -> impl Future<Output = Result<(), AppError>> + Send;

    fn get(
        &self,
        url: &str,
    ) -> impl Future<Output = Result<Option<ExtractionRecord>, AppError>> + Send;

    fn exists(&self, url: &str) -> impl Future<Output = Result<bool, AppError>> + Send;

    /// Number of stored extractions under a prefix.
    fn count_for_prefix(&self, prefix: &str)
    -> impl Future<Output = Result<u64, AppError>> + Send;
}

/// Stores evaluation runs. A run is written whole or not at all.
pub trait EvaluationRunStore: Send + Sync + Clone {
    /// Fails with `AlreadyExists` if a run with this id was stored before.
    fn save_run(&self, run: &EvaluationRun) -> impl Future<Output = Result<(), AppError>> + Send;

    fn get_run(
        &self,
        id: Uuid,
    ) -> impl Future<Output = Result<Option<EvaluationRun>, AppError>> + Send;

    /// Run headers, newest first.
    fn list_runs(
        &self,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<RunHeader>, AppError>> + Send;

    /// Returns false if no run had that id.
    fn delete_run(&self, id: Uuid) -> impl Future<Output = Result<bool, AppError>> + Send;

    /// Delete every run; returns how many were removed.
    fn clear_runs(&self) -> impl Future<Output = Result<u64, AppError>> + Send;
}
