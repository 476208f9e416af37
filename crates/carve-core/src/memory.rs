//! In-process implementations of the store and queue traits.
//!
//! Used by the CLI for one-off runs and by tests. All state sits behind one
//! mutex per store, so every operation is atomic with respect to the others.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use tokio::sync::Notify;
use uuid::Uuid;

use crate::error::AppError;
use crate::models::{EvaluationRun, ExtractionRecord, ParserConfig, RunHeader};
use crate::queue::{DeadLetter, QueueItem, WorkQueue};
use crate::traits::{ConfigStore, EvaluationRunStore, ExtractionStore};
use crate::urls::candidate_prefixes;

/// Acquires a mutex, recovering from poison if necessary.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| {
        tracing::warn!("Recovered from poisoned mutex");
        poisoned.into_inner()
    })
}

// ---------------------------------------------------------------------------
// Configs
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct ConfigState {
    configs: Vec<ParserConfig>,
    production: HashMap<String, Uuid>,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryConfigStore {
    state: Arc<Mutex<ConfigState>>,
}

impl ConfigStore for MemoryConfigStore {
    async fn put(&self, config: &ParserConfig) -> Result<(), AppError> {
        let mut state = lock(&self.state);
        if state.configs.iter().any(|c| c.id == config.id) {
            return Err(AppError::AlreadyExists(format!("parser config {}", config.id)));
        }
        state.configs.push(config.clone());
        Ok(())
    }

    async fn get_by_id(&self, id: Uuid) -> Result<Option<ParserConfig>, AppError> {
        let state = lock(&self.state);
        Ok(state.configs.iter().find(|c| c.id == id).cloned())
    }

    async fn get(&self, prefix: &str) -> Result<Option<ParserConfig>, AppError> {
        let state = lock(&self.state);
        // max_by_key keeps the last maximum, so later insertions win ties.
        Ok(state
            .configs
            .iter()
            .filter(|c| c.prefix == prefix)
            .max_by_key(|c| c.created_at)
            .cloned())
    }

    async fn list(&self, prefix: Option<&str>, limit: usize) -> Result<Vec<ParserConfig>, AppError> {
        let state = lock(&self.state);
        let mut configs: Vec<ParserConfig> = state
            .configs
            .iter()
            .filter(|c| prefix.is_none_or(|p| c.prefix == p))
            .cloned()
            .collect();
        configs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        configs.truncate(limit);
        Ok(configs)
    }

    async fn promote(&self, id: Uuid) -> Result<ParserConfig, AppError> {
        let mut state = lock(&self.state);
        let config = state
            .configs
            .iter()
            .find(|c| c.id == id)
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("parser config {id}")))?;
        state.production.insert(config.prefix.clone(), id);
        Ok(config)
    }

    async fn current_production(&self, prefix: &str) -> Result<Option<ParserConfig>, AppError> {
        let state = lock(&self.state);
        Ok(state
            .production
            .get(prefix)
            .and_then(|id| state.configs.iter().find(|c| c.id == *id))
            .cloned())
    }

    async fn production_for_url(&self, url: &str) -> Result<Option<ParserConfig>, AppError> {
        let Ok(candidates) = candidate_prefixes(url) else {
            return Ok(None);
        };
        let state = lock(&self.state);
        Ok(candidates
            .iter()
            .find_map(|prefix| state.production.get(prefix))
            .and_then(|id| state.configs.iter().find(|c| c.id == *id))
            .cloned())
    }
}

// ---------------------------------------------------------------------------
// Extractions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct MemoryExtractionStore {
    records: Arc<Mutex<HashMap<String, ExtractionRecord>>>,
}

impl MemoryExtractionStore {
    pub fn len(&self) -> usize {
        lock(&self.records).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ExtractionStore for MemoryExtractionStore {
    async fn save(&self, record: &ExtractionRecord) -> Result<(), AppError> {
        lock(&self.records).insert(record.url.clone(), record.clone());
        Ok(())
    }

    async fn get(&self, url: &str) -> Result<Option<ExtractionRecord>, AppError> {
        Ok(lock(&self.records).get(url).cloned())
    }

    async fn exists(&self, url: &str) -> Result<bool, AppError> {
        Ok(lock(&self.records).contains_key(url))
    }

    async fn count_for_prefix(&self, prefix: &str) -> Result<u64, AppError> {
        Ok(lock(&self.records)
            .values()
            .filter(|r| r.prefix == prefix)
            .count() as u64)
    }
}

// ---------------------------------------------------------------------------
// Queue
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct Claim {
    worker_id: String,
    claimed_at: DateTime<Utc>,
    item: QueueItem,
}

#[derive(Debug, Default)]
struct QueueState {
    pending: VecDeque<QueueItem>,
    claimed: HashMap<Uuid, Claim>,
    dead: Vec<DeadLetter>,
}

/// Work queue that wakes idle workers as soon as something is enqueued.
#[derive(Debug, Clone, Default)]
pub struct MemoryQueue {
    state: Arc<Mutex<QueueState>>,
    notify: Arc<Notify>,
}

impl MemoryQueue {
    fn push(&self, item: QueueItem) {
        lock(&self.state).pending.push_back(item);
        self.notify.notify_one();
    }

    fn take_claimed(&self, id: Uuid) -> Result<QueueItem, AppError> {
        lock(&self.state)
            .claimed
            .remove(&id)
            .map(|claim| claim.item)
            .ok_or_else(|| AppError::NotFound(format!("claimed queue item {id}")))
    }

    /// Move every claim matching `pred` back to pending.
    fn release_where(&self, pred: impl Fn(&Claim) -> bool) -> u64 {
        let released: Vec<QueueItem> = {
            let mut state = lock(&self.state);
            let ids: Vec<Uuid> = state
                .claimed
                .iter()
                .filter(|(_, claim)| pred(claim))
                .map(|(id, _)| *id)
                .collect();
            ids.iter()
                .filter_map(|id| state.claimed.remove(id).map(|claim| claim.item))
                .collect()
        };
        let count = released.len() as u64;
        for item in released {
            self.push(item);
        }
        count
    }

    /// Number of items currently held by workers.
    pub fn claimed_count(&self) -> usize {
        lock(&self.state).claimed.len()
    }
}

impl WorkQueue for MemoryQueue {
    async fn enqueue(&self, url: &str) -> Result<QueueItem, AppError> {
        let item = QueueItem::new(url);
        self.push(item.clone());
        Ok(item)
    }

    async fn dequeue(&self, worker_id: &str) -> Result<Option<QueueItem>, AppError> {
        let now = Utc::now();
        let mut state = lock(&self.state);
        let next = state
            .pending
            .iter()
            .enumerate()
            .filter(|(_, item)| item.available_at <= now)
            .min_by_key(|(_, item)| (item.available_at, item.enqueued_at))
            .map(|(idx, _)| idx);

        let Some(item) = next.and_then(|idx| state.pending.remove(idx)) else {
            return Ok(None);
        };
        state.claimed.insert(
            item.id,
            Claim {
                worker_id: worker_id.to_string(),
                claimed_at: now,
                item: item.clone(),
            },
        );
        Ok(Some(item))
    }

    async fn ack(&self, id: Uuid) -> Result<(), AppError> {
        self.take_claimed(id).map(|_| ())
    }

    async fn retry(&self, id: Uuid, error: &str, available_at: DateTime<Utc>) -> Result<(), AppError> {
        let mut item = self.take_claimed(id)?;
        item.attempt_count += 1;
        item.last_error = Some(error.to_string());
        item.available_at = available_at;
        self.push(item);
        Ok(())
    }

    async fn dead_letter(&self, id: Uuid, reason: &str) -> Result<(), AppError> {
        let item = self.take_claimed(id)?;
        lock(&self.state).dead.push(DeadLetter {
            id: item.id,
            url: item.url,
            enqueued_at: item.enqueued_at,
            attempt_count: item.attempt_count + 1,
            reason: reason.to_string(),
            dead_at: Utc::now(),
        });
        Ok(())
    }

    async fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetter>, AppError> {
        let state = lock(&self.state);
        Ok(state.dead.iter().rev().take(limit).cloned().collect())
    }

    async fn requeue_dead(&self, id: Uuid) -> Result<QueueItem, AppError> {
        let dead = {
            let mut state = lock(&self.state);
            let idx = state
                .dead
                .iter()
                .position(|d| d.id == id)
                .ok_or_else(|| AppError::NotFound(format!("dead letter {id}")))?;
            state.dead.remove(idx)
        };
        let item = QueueItem {
            id: dead.id,
            ..QueueItem::new(dead.url)
        };
        self.push(item.clone());
        Ok(item)
    }

    async fn pending_count(&self) -> Result<u64, AppError> {
        Ok(lock(&self.state).pending.len() as u64)
    }

    async fn release(&self, id: Uuid) -> Result<(), AppError> {
        let item = self.take_claimed(id)?;
        self.push(item);
        Ok(())
    }

    async fn reclaim_expired(&self, lease: Duration) -> Result<u64, AppError> {
        let Some(cutoff) = TimeDelta::from_std(lease)
            .ok()
            .and_then(|lease| Utc::now().checked_sub_signed(lease))
        else {
            return Ok(0);
        };
        Ok(self.release_where(|claim| claim.claimed_at <= cutoff))
    }

    async fn release_worker(&self, worker_id: &str) -> Result<u64, AppError> {
        Ok(self.release_where(|claim| claim.worker_id == worker_id))
    }

    async fn wait_for_work(&self, timeout: Duration) {
        let _ = tokio::time::timeout(timeout, self.notify.notified()).await;
    }
}

// ---------------------------------------------------------------------------
// Evaluation runs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct MemoryRunStore {
    runs: Arc<Mutex<Vec<EvaluationRun>>>,
}

impl EvaluationRunStore for MemoryRunStore {
    async fn save_run(&self, run: &EvaluationRun) -> Result<(), AppError> {
        let mut runs = lock(&self.runs);
        if runs.iter().any(|r| r.id == run.id) {
            return Err(AppError::AlreadyExists(format!("evaluation run {}", run.id)));
        }
        runs.push(run.clone());
        Ok(())
    }

    async fn get_run(&self, id: Uuid) -> Result<Option<EvaluationRun>, AppError> {
        Ok(lock(&self.runs).iter().find(|r| r.id == id).cloned())
    }

    async fn list_runs(&self, limit: usize) -> Result<Vec<RunHeader>, AppError> {
        let mut headers: Vec<RunHeader> = lock(&self.runs)
            .iter()
            .map(|r| RunHeader {
                id: r.id,
                datetime: r.datetime,
                result_count: r.results.len(),
            })
            .collect();
        headers.sort_by(|a, b| b.datetime.cmp(&a.datetime));
        headers.truncate(limit);
        Ok(headers)
    }

    async fn delete_run(&self, id: Uuid) -> Result<bool, AppError> {
        let mut runs = lock(&self.runs);
        let before = runs.len();
        runs.retain(|r| r.id != id);
        Ok(runs.len() != before)
    }

    async fn clear_runs(&self) -> Result<u64, AppError> {
        let mut runs = lock(&self.runs);
        let count = runs.len() as u64;
        runs.clear();
        Ok(count)
    }
}
