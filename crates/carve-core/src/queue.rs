use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppError;
use crate::urls::deepest_prefix;

/// A URL waiting to be extracted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueItem {
    pub id: Uuid,
    pub url: String,
    pub enqueued_at: DateTime<Utc>,
    /// Failed attempts so far.
    pub attempt_count: u32,
    /// The item is not handed out before this instant.
    pub available_at: DateTime<Utc>,
    pub last_error: Option<String>,
}

impl QueueItem {
    pub fn new(url: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            url: url.into(),
            enqueued_at: now,
            attempt_count: 0,
            available_at: now,
            last_error: None,
        }
    }
}

/// An item that exhausted its retry budget or failed permanently.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub id: Uuid,
    pub url: String,
    pub enqueued_at: DateTime<Utc>,
    pub attempt_count: u32,
    pub reason: String,
    pub dead_at: DateTime<Utc>,
}

/// A prefix whose URLs were dead-lettered for lack of a production config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MissingConfig {
    pub prefix: String,
    pub dead_letters: usize,
}

/// Group dead letters that had no production config by the deepest prefix
/// of their URL. Most affected prefix first.
pub fn prefixes_needing_config(dead: &[DeadLetter]) -> Vec<MissingConfig> {
    let mut out: Vec<MissingConfig> = Vec::new();
    for letter in dead {
        if !letter.reason.starts_with("config_not_found") {
            continue;
        }
        let Ok(prefix) = deepest_prefix(&letter.url) else {
            continue;
        };
        match out.iter_mut().find(|m| m.prefix == prefix) {
            Some(m) => m.dead_letters += 1,
            None => out.push(MissingConfig {
                prefix,
                dead_letters: 1,
            }),
        }
    }
    out.sort_by(|a, b| {
        b.dead_letters
            .cmp(&a.dead_letters)
            .then_with(|| a.prefix.cmp(&b.prefix))
    });
    out
}

/// Retry budget with exponential backoff.
///
/// Delay for failed attempt `n` (1-indexed) is `base_delay * 2^(n-1)`,
/// capped at `max_delay`. With the defaults: 30s, 1min, 2min, 4min, then
/// the item is dead-lettered on its fifth failure.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay: TimeDelta,
    pub max_delay: TimeDelta,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: TimeDelta::seconds(30),
            max_delay: TimeDelta::minutes(10),
        }
    }
}

impl RetryConfig {
    pub fn delay_for_attempt(&self, attempt: u32) -> TimeDelta {
        let exponent = attempt.saturating_sub(1).min(20);
        let delay = self
            .base_delay
            .checked_mul(1i32 << exponent)
            .unwrap_or(self.max_delay);
        std::cmp::min(delay, self.max_delay)
    }

    /// Whether an item that has now failed `attempts` times may run again.
    pub fn can_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}

/// Configuration for one pipeline worker.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub worker_id: String,
    /// Upper bound on how long an idle worker sleeps before polling again.
    pub idle_timeout: Duration,
    pub retry: RetryConfig,
    /// Enqueue same-prefix links found on extracted pages.
    pub follow_links: bool,
    /// Stop extracting under a prefix once it has this many extractions.
    pub max_urls_per_prefix: Option<u64>,
    /// Claims older than this are handed out again. Must exceed the time a
    /// single item takes to process.
    pub claim_lease: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", &Uuid::new_v4().to_string()[..8]),
            idle_timeout: Duration::from_secs(5),
            retry: RetryConfig::default(),
            follow_links: false,
            max_urls_per_prefix: None,
            claim_lease: Duration::from_secs(600),
        }
    }
}

impl WorkerConfig {
    pub fn with_worker_id(mut self, id: impl Into<String>) -> Self {
        self.worker_id = id.into();
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_follow_links(mut self, follow: bool) -> Self {
        self.follow_links = follow;
        self
    }

    pub fn with_max_urls_per_prefix(mut self, cap: Option<u64>) -> Self {
        self.max_urls_per_prefix = cap;
        self
    }

    pub fn with_claim_lease(mut self, lease: Duration) -> Self {
        self.claim_lease = lease;
        self
    }
}

/// Durable FIFO of URLs with a dead set.
///
/// `dequeue` must never hand the same item to two workers; the Postgres
/// implementation uses `SELECT ... FOR UPDATE SKIP LOCKED`.
pub trait WorkQueue: Send + Sync + Clone {
    fn enqueue(&self, url: &str) -> impl Future<Output = Result<QueueItem, AppError>> + Send;

    /// Claim the oldest item that is due. `None` if nothing is due.
    fn dequeue(
        &self,
        worker_id: &str,
    ) -> impl Future<Output = Result<Option<QueueItem>, AppError>> + Send;

    /// Remove a claimed item after its result was persisted.
    fn ack(&self, id: Uuid) -> impl Future<Output = Result<(), AppError>> + Send;

    /// Record a failure and make the item due again at `available_at`.
    /// Increments `attempt_count`.
    fn retry(
        &self,
        id: Uuid,
        error: &str,
        available_at: DateTime<Utc>,
    ) -> impl Future<Output = Result<(), AppError>> + Send;

    /// Move a claimed item to the dead set. Counts the final attempt.
    fn dead_letter(
        &self,
        id: Uuid,
        reason: &str,
    ) -> impl Future<Output = Result<(), AppError>> + Send;

    /// Dead items, most recent first.
    fn dead_letters(
        &self,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<DeadLetter>, AppError>> + Send;

    /// Put a dead item back in the queue with a fresh retry budget.
    fn requeue_dead(&self, id: Uuid) -> impl Future<Output = Result<QueueItem, AppError>> + Send;

    fn pending_count(&self) -> impl Future<Output = Result<u64, AppError>> + Send;

    /// Return a claimed item to the queue without counting an attempt.
    fn release(&self, id: Uuid) -> impl Future<Output = Result<(), AppError>> + Send;

    /// Return every item claimed longer than `lease` ago to the queue, so
    /// claims of a crashed process are not lost.
    fn reclaim_expired(
        &self,
        lease: Duration,
    ) -> impl Future<Output = Result<u64, AppError>> + Send;

    /// Return every item claimed by `worker_id` to the queue (graceful
    /// shutdown).
    fn release_worker(
        &self,
        worker_id: &str,
    ) -> impl Future<Output = Result<u64, AppError>> + Send;

    /// Suspend until work may be available or `timeout` elapses.
    ///
    /// The default just sleeps; queues that can observe enqueues wake early.
    fn wait_for_work(&self, timeout: Duration) -> impl Future<Output = ()> + Send {
        tokio::time::sleep(timeout)
    }
}
