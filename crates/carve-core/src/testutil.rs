//! Test utilities: mock implementations of the core traits.
//!
//! All mocks use `Arc<Mutex<_>>` for interior mutability, allowing
//! test assertions on recorded calls.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::AppError;
use crate::memory::MemoryQueue;
use crate::models::{ExtractionRecord, SampleCase};
use crate::profile::GeneratorProfile;
use crate::proposal::ProposalRequest;
use crate::queue::{DeadLetter, QueueItem, WorkQueue};
use crate::synthesis::{SynthesisEvent, SynthesisReporter};
use crate::traits::{ConfigProposer, ConfigProposerFactory, ExtractionStore, Fetcher};
use crate::worker::{WorkerEvent, WorkerReporter};

pub fn labeled_case(url: &str, html: &str, expected: &str) -> SampleCase {
    SampleCase {
        url: url.to_string(),
        raw_content: html.to_string(),
        expected_content: expected.to_string(),
    }
}

// ---------------------------------------------------------------------------
// MockFetcher
// ---------------------------------------------------------------------------

/// Mock fetcher. Scripted responses are popped first; afterwards every call
/// returns the fallback HTML.
#[derive(Clone)]
pub struct MockFetcher {
    responses: Arc<Mutex<Vec<Result<String, AppError>>>>,
    fallback: String,
    calls: Arc<Mutex<Vec<String>>>,
}

impl MockFetcher {
    pub fn new(html: &str) -> Self {
        Self {
            responses: Arc::new(Mutex::new(vec![])),
            fallback: html.to_string(),
            calls: Arc::new(Mutex::new(vec![])),
        }
    }

    pub fn with_error(error: AppError) -> Self {
        Self::with_responses(vec![Err(error)])
    }

    pub fn with_responses(responses: Vec<Result<String, AppError>>) -> Self {
        Self {
            responses: Arc::new(Mutex::new(responses)),
            fallback: "<html><body>default</body></html>".to_string(),
            calls: Arc::new(Mutex::new(vec![])),
        }
    }

    /// URLs fetched so far, in call order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

impl Fetcher for MockFetcher {
    async fn fetch(&self, url: &str) -> Result<String, AppError> {
        self.calls.lock().unwrap().push(url.to_string());
        let mut responses = self.responses.lock().unwrap();
        if responses.is_empty() {
            Ok(self.fallback.clone())
        } else {
            responses.remove(0)
        }
    }
}

// ---------------------------------------------------------------------------
// MockProposer
// ---------------------------------------------------------------------------

/// Mock proposer that replays scripted responses and records requests.
#[derive(Clone)]
pub struct MockProposer {
    responses: Arc<Mutex<Vec<Result<serde_json::Value, AppError>>>>,
    fallback: Option<serde_json::Value>,
    requests: Arc<Mutex<Vec<ProposalRequest>>>,
}

impl MockProposer {
    /// Always answers with `value`.
    pub fn new(value: serde_json::Value) -> Self {
        Self {
            responses: Arc::new(Mutex::new(vec![])),
            fallback: Some(value),
            requests: Arc::new(Mutex::new(vec![])),
        }
    }

    /// Answers with `responses` in order, then rejects every further call.
    pub fn with_responses(responses: Vec<Result<serde_json::Value, AppError>>) -> Self {
        Self {
            responses: Arc::new(Mutex::new(responses)),
            fallback: None,
            requests: Arc::new(Mutex::new(vec![])),
        }
    }

    pub fn requests(&self) -> Vec<ProposalRequest> {
        self.requests.lock().unwrap().clone()
    }
}

impl ConfigProposer for MockProposer {
    async fn propose(&self, request: &ProposalRequest) -> Result<serde_json::Value, AppError> {
        self.requests.lock().unwrap().push(request.clone());
        let mut responses = self.responses.lock().unwrap();
        if !responses.is_empty() {
            return responses.remove(0);
        }
        self.fallback
            .clone()
            .ok_or_else(|| AppError::ProposalError("no scripted response left".into()))
    }
}

// ---------------------------------------------------------------------------
// MockProposerFactory
// ---------------------------------------------------------------------------

/// Factory whose proposers all answer with the same selector set.
#[derive(Clone)]
pub struct MockProposerFactory {
    value: serde_json::Value,
    created: Arc<Mutex<Vec<String>>>,
}

impl MockProposerFactory {
    pub fn new(value: serde_json::Value) -> Self {
        Self {
            value,
            created: Arc::new(Mutex::new(vec![])),
        }
    }

    /// Names of the profiles proposers were built for.
    pub fn created(&self) -> Vec<String> {
        self.created.lock().unwrap().clone()
    }
}

impl ConfigProposerFactory for MockProposerFactory {
    type Proposer = MockProposer;

    fn create(&self, profile: &GeneratorProfile) -> Result<MockProposer, AppError> {
        self.created.lock().unwrap().push(profile.name.clone());
        Ok(MockProposer::new(self.value.clone()))
    }
}

// ---------------------------------------------------------------------------
// FailingExtractionStore
// ---------------------------------------------------------------------------

/// Extraction store whose writes always fail.
#[derive(Clone)]
pub struct FailingExtractionStore;

impl ExtractionStore for FailingExtractionStore {
    async fn save(&self, _record: &ExtractionRecord) -> Result<(), AppError> {
        Err(AppError::DatabaseError("connection reset".into()))
    }

    async fn get(&self, _url: &str) -> Result<Option<ExtractionRecord>, AppError> {
        Ok(None)
    }

    async fn exists(&self, _url: &str) -> Result<bool, AppError> {
        Ok(false)
    }

    async fn count_for_prefix(&self, _prefix: &str) -> Result<u64, AppError> {
        Ok(0)
    }
}

// ---------------------------------------------------------------------------
// AckFailingQueue
// ---------------------------------------------------------------------------

/// In-memory queue whose acknowledgements always fail.
#[derive(Clone, Default)]
pub struct AckFailingQueue {
    pub inner: MemoryQueue,
}

impl WorkQueue for AckFailingQueue {
    async fn enqueue(&self, url: &str) -> Result<QueueItem, AppError> {
        self.inner.enqueue(url).await
    }

    async fn dequeue(&self, worker_id: &str) -> Result<Option<QueueItem>, AppError> {
        self.inner.dequeue(worker_id).await
    }

    async fn ack(&self, _id: Uuid) -> Result<(), AppError> {
        Err(AppError::DatabaseError("connection reset".into()))
    }

    async fn retry(&self, id: Uuid, error: &str, available_at: DateTime<Utc>) -> Result<(), AppError> {
        self.inner.retry(id, error, available_at).await
    }

    async fn dead_letter(&self, id: Uuid, reason: &str) -> Result<(), AppError> {
        self.inner.dead_letter(id, reason).await
    }

    async fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetter>, AppError> {
        self.inner.dead_letters(limit).await
    }

    async fn requeue_dead(&self, id: Uuid) -> Result<QueueItem, AppError> {
        self.inner.requeue_dead(id).await
    }

    async fn pending_count(&self) -> Result<u64, AppError> {
        self.inner.pending_count().await
    }

    async fn release(&self, id: Uuid) -> Result<(), AppError> {
        self.inner.release(id).await
    }

    async fn reclaim_expired(&self, lease: Duration) -> Result<u64, AppError> {
        self.inner.reclaim_expired(lease).await
    }

    async fn release_worker(&self, worker_id: &str) -> Result<u64, AppError> {
        self.inner.release_worker(worker_id).await
    }
}

// ---------------------------------------------------------------------------
// Reporters
// ---------------------------------------------------------------------------

/// Records worker events by name.
#[derive(Clone, Default)]
pub struct MockWorkerReporter {
    events: Arc<Mutex<Vec<String>>>,
}

impl MockWorkerReporter {
    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    pub fn count(&self, name: &str) -> usize {
        self.events().iter().filter(|e| *e == name).count()
    }
}

impl WorkerReporter for MockWorkerReporter {
    fn report(&self, event: WorkerEvent<'_>) {
        let name = match event {
            WorkerEvent::Started { .. } => "started",
            WorkerEvent::Paused { .. } => "paused",
            WorkerEvent::Resumed { .. } => "resumed",
            WorkerEvent::Polling => return,
            WorkerEvent::ClaimsReclaimed { .. } => "reclaimed",
            WorkerEvent::ItemClaimed { .. } => "claimed",
            WorkerEvent::ItemCompleted { .. } => "completed",
            WorkerEvent::ItemSkipped { .. } => "skipped",
            WorkerEvent::LinksDiscovered { .. } => "links",
            WorkerEvent::ItemFailed { .. } => "failed",
            WorkerEvent::DeadLettered { .. } => "dead_lettered",
            WorkerEvent::ShuttingDown { .. } => "shutting_down",
            WorkerEvent::Stopped { .. } => "stopped",
        };
        self.events.lock().unwrap().push(name.to_string());
    }
}

/// Records synthesis events as short strings, e.g. `"scored 2 0.75"`.
#[derive(Clone, Default)]
pub struct MockSynthesisReporter {
    events: Arc<Mutex<Vec<String>>>,
}

impl MockSynthesisReporter {
    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }
}

impl SynthesisReporter for MockSynthesisReporter {
    fn report(&self, event: SynthesisEvent<'_>) {
        let line = match event {
            SynthesisEvent::Started { cases, .. } => format!("started {cases}"),
            SynthesisEvent::Proposing {
                iteration,
                reflecting,
                ..
            } => format!("proposing {iteration} {reflecting}"),
            SynthesisEvent::Rejected { iteration, .. } => format!("rejected {iteration}"),
            SynthesisEvent::PromptShrunk { prompt_samples, .. } => {
                format!("shrunk {prompt_samples}")
            }
            SynthesisEvent::Scored {
                iteration, accuracy, ..
            } => format!("scored {iteration} {accuracy:.2}"),
            SynthesisEvent::Accepted { promoted, .. } => format!("accepted {promoted}"),
            SynthesisEvent::Exhausted { best_accuracy, .. } => {
                format!("exhausted {best_accuracy:?}")
            }
        };
        self.events.lock().unwrap().push(line);
    }
}
