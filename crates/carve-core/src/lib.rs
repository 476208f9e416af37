pub mod control;
pub mod diff;
pub mod error;
pub mod evaluation;
pub mod memory;
pub mod models;
pub mod profile;
pub mod proposal;
pub mod queue;
pub mod samples;
pub mod scoring;
pub mod selector;
pub mod synthesis;
pub mod traits;
pub mod urls;
pub mod worker;

#[cfg(test)]
pub(crate) mod testutil;

pub use control::SystemControl;
pub use error::AppError;
pub use models::{
    EvaluationResult, EvaluationRun, ExtractionRecord, ExtractionResult, ParserConfig, RunHeader,
    SampleCase, SelectorSet, SystemState, compute_hash,
};
pub use queue::{DeadLetter, QueueItem, RetryConfig, WorkQueue, WorkerConfig};
pub use scoring::{Metrics, ScoringConfig};
pub use traits::{
    ConfigProposer, ConfigProposerFactory, ConfigStore, EvaluationRunStore, ExtractionStore,
    Fetcher,
};
