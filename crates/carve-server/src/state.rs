use std::path::PathBuf;

use tokio_util::sync::CancellationToken;

use carve_client::OpenAiProposerFactory;
use carve_core::SystemControl;
use carve_core::samples::SampleLibrary;
use carve_core::scoring::ScoringConfig;
use carve_db::Database;

/// Shared application state, available to all route handlers via `State<Arc<AppState>>`.
pub struct AppState {
    pub db: Database,
    /// Run/pause switch shared with the in-process workers.
    pub control: SystemControl,
    pub library: SampleLibrary,
    pub profiles_dir: PathBuf,
    /// Proposal service factory (None = profile evaluations disabled).
    pub proposers: Option<OpenAiProposerFactory>,
    pub scoring: ScoringConfig,
    /// Cancelled on shutdown; long evaluations observe it.
    pub shutdown: CancellationToken,
}
