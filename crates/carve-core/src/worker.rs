use std::sync::Arc;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::control::SystemControl;
use crate::error::AppError;
use crate::models::{ExtractionRecord, ExtractionResult, SystemState};
use crate::queue::{QueueItem, WorkQueue, WorkerConfig};
use crate::selector::{CompiledConfig, extract_raw};
use crate::traits::{ConfigStore, ExtractionStore, Fetcher};
use crate::urls::{deepest_prefix, discover_links};

/// Events emitted by the worker for monitoring/logging.
#[derive(Debug, Clone)]
pub enum WorkerEvent<'a> {
    Started {
        worker_id: &'a str,
    },
    Paused {
        worker_id: &'a str,
    },
    Resumed {
        worker_id: &'a str,
    },
    Polling,
    ClaimsReclaimed {
        count: u64,
    },
    ItemClaimed {
        item: &'a QueueItem,
    },
    ItemCompleted {
        item_id: Uuid,
        url: &'a str,
        config_id: Uuid,
        chars: usize,
    },
    ItemSkipped {
        item_id: Uuid,
        url: &'a str,
        reason: &'a str,
    },
    LinksDiscovered {
        url: &'a str,
        enqueued: usize,
    },
    ItemFailed {
        item_id: Uuid,
        url: &'a str,
        error: &'a str,
        attempt: u32,
        will_retry: bool,
    },
    DeadLettered {
        item_id: Uuid,
        url: &'a str,
        reason: &'a str,
    },
    ShuttingDown {
        worker_id: &'a str,
        items_released: u64,
    },
    Stopped {
        worker_id: &'a str,
    },
}

/// Trait for receiving worker events (decoupled logging).
pub trait WorkerReporter: Send + Sync {
    fn report(&self, event: WorkerEvent<'_>) {
        let _ = event;
    }
}

/// Reporter that uses the `tracing` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingWorkerReporter;

impl WorkerReporter for TracingWorkerReporter {
    fn report(&self, event: WorkerEvent<'_>) {
        match event {
            WorkerEvent::Started { worker_id } => {
                tracing::info!(%worker_id, "Worker started");
            }
            WorkerEvent::Paused { worker_id } => {
                tracing::info!(%worker_id, "System paused, worker waiting");
            }
            WorkerEvent::Resumed { worker_id } => {
                tracing::info!(%worker_id, "System running, worker resumed");
            }
            WorkerEvent::Polling => {
                tracing::debug!("Polling for work");
            }
            WorkerEvent::ClaimsReclaimed { count } => {
                tracing::warn!(%count, "Returned expired claims to the queue");
            }
            WorkerEvent::ItemClaimed { item } => {
                tracing::info!(item_id = %item.id, url = %item.url, attempt = item.attempt_count + 1, "Item claimed");
            }
            WorkerEvent::ItemCompleted {
                item_id,
                url,
                config_id,
                chars,
            } => {
                tracing::info!(%item_id, %url, %config_id, %chars, "Item extracted");
            }
            WorkerEvent::ItemSkipped {
                item_id,
                url,
                reason,
            } => {
                tracing::info!(%item_id, %url, %reason, "Item skipped");
            }
            WorkerEvent::LinksDiscovered { url, enqueued } => {
                tracing::debug!(%url, %enqueued, "Enqueued discovered links");
            }
            WorkerEvent::ItemFailed {
                item_id,
                url,
                error,
                attempt,
                will_retry,
            } => {
                tracing::warn!(%item_id, %url, %error, %attempt, %will_retry, "Item failed");
            }
            WorkerEvent::DeadLettered {
                item_id,
                url,
                reason,
            } => {
                tracing::warn!(%item_id, %url, %reason, "Item moved to dead letters");
            }
            WorkerEvent::ShuttingDown {
                worker_id,
                items_released,
            } => {
                tracing::info!(%worker_id, %items_released, "Worker shutting down");
            }
            WorkerEvent::Stopped { worker_id } => {
                tracing::info!(%worker_id, "Worker stopped");
            }
        }
    }
}

struct ParsedPage {
    raw: String,
    content: String,
    /// Same-prefix links, empty unless link following is on.
    links: Vec<String>,
}

/// Extract text (and links) on the blocking pool; HTML parsing and selector
/// matching are CPU-bound.
async fn parse_page(
    raw: String,
    compiled: CompiledConfig,
    url: String,
    follow_links: bool,
) -> Result<ParsedPage, AppError> {
    tokio::task::spawn_blocking(move || {
        let content = extract_raw(&raw, compiled.selectors())?;
        let links = if follow_links {
            discover_links(&raw, &url, &compiled.prefix)
        } else {
            Vec::new()
        };
        Ok(ParsedPage {
            raw,
            content,
            links,
        })
    })
    .await
    .map_err(|e| AppError::Generic(format!("Extraction task failed: {e}")))?
}

enum Processed {
    Extracted {
        config_id: Uuid,
        chars: usize,
        links: usize,
    },
    Skipped(String),
}

/// Worker that drains the queue: fetch, resolve the production config,
/// extract, persist, acknowledge.
pub struct WorkerService<Q, F, C, S>
where
    Q: WorkQueue,
    F: Fetcher,
    C: ConfigStore,
    S: ExtractionStore,
{
    queue: Q,
    fetcher: F,
    configs: C,
    store: S,
    control: SystemControl,
    config: WorkerConfig,
}

impl<Q, F, C, S> WorkerService<Q, F, C, S>
where
    Q: WorkQueue,
    F: Fetcher,
    C: ConfigStore,
    S: ExtractionStore,
{
    pub fn new(
        queue: Q,
        fetcher: F,
        configs: C,
        store: S,
        control: SystemControl,
        config: WorkerConfig,
    ) -> Self {
        Self {
            queue,
            fetcher,
            configs,
            store,
            control,
            config,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.config.worker_id
    }

    /// Run the worker loop until cancellation.
    pub async fn run<WR: WorkerReporter>(
        &self,
        cancel_token: CancellationToken,
        reporter: &WR,
    ) -> Result<(), AppError> {
        let worker_id = self.config.worker_id.as_str();
        reporter.report(WorkerEvent::Started { worker_id });

        loop {
            if cancel_token.is_cancelled() {
                break;
            }

            if self.control.state() == SystemState::Pause {
                reporter.report(WorkerEvent::Paused { worker_id });
                tokio::select! {
                    () = self.control.wait_until_running() => {
                        reporter.report(WorkerEvent::Resumed { worker_id });
                    }
                    () = cancel_token.cancelled() => break,
                }
                continue;
            }

            match self.process_next(reporter).await {
                Ok(true) => {}
                Ok(false) => {
                    tokio::select! {
                        () = self.queue.wait_for_work(self.config.idle_timeout) => {}
                        () = cancel_token.cancelled() => break,
                    }
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to dequeue");
                    tokio::select! {
                        () = tokio::time::sleep(self.config.idle_timeout) => {}
                        () = cancel_token.cancelled() => break,
                    }
                }
            }
        }

        // Graceful shutdown: hand claimed items back to the queue
        let released = self.queue.release_worker(worker_id).await.unwrap_or(0);

        reporter.report(WorkerEvent::ShuttingDown {
            worker_id,
            items_released: released,
        });
        reporter.report(WorkerEvent::Stopped { worker_id });

        Ok(())
    }

    /// Claim and process one due item. Returns `false` if nothing was due.
    ///
    /// Ignores the system state; [`Self::run`] checks it before each call.
    pub async fn process_next<WR: WorkerReporter>(&self, reporter: &WR) -> Result<bool, AppError> {
        reporter.report(WorkerEvent::Polling);
        match self.queue.reclaim_expired(self.config.claim_lease).await {
            Ok(0) => {}
            Ok(count) => reporter.report(WorkerEvent::ClaimsReclaimed { count }),
            Err(e) => tracing::warn!(error = %e, "Failed to reclaim expired claims"),
        }
        let Some(item) = self.queue.dequeue(&self.config.worker_id).await? else {
            return Ok(false);
        };
        reporter.report(WorkerEvent::ItemClaimed { item: &item });
        self.process_item(&item, reporter).await;
        Ok(true)
    }

    async fn process_item<WR: WorkerReporter>(&self, item: &QueueItem, reporter: &WR) {
        match self.handle(item).await {
            Ok(processed) => {
                // Acknowledge only after the result is persisted.
                if let Err(e) = self.queue.ack(item.id).await {
                    tracing::error!(item_id = %item.id, error = %e, "Failed to acknowledge item");
                    // The result is stored; a second run overwrites it.
                    if let Err(e) = self.queue.release(item.id).await {
                        tracing::error!(item_id = %item.id, error = %e, "Failed to release item, its claim will expire");
                    }
                    return;
                }
                match processed {
                    Processed::Extracted {
                        config_id,
                        chars,
                        links,
                    } => {
                        reporter.report(WorkerEvent::ItemCompleted {
                            item_id: item.id,
                            url: &item.url,
                            config_id,
                            chars,
                        });
                        if links > 0 {
                            reporter.report(WorkerEvent::LinksDiscovered {
                                url: &item.url,
                                enqueued: links,
                            });
                        }
                    }
                    Processed::Skipped(reason) => {
                        reporter.report(WorkerEvent::ItemSkipped {
                            item_id: item.id,
                            url: &item.url,
                            reason: &reason,
                        });
                    }
                }
            }
            Err(e) => self.fail(item, &e, reporter).await,
        }
    }

    async fn handle(&self, item: &QueueItem) -> Result<Processed, AppError> {
        let raw = self.fetcher.fetch(&item.url).await?;

        // Read once per attempt; a promotion after this point applies to the
        // next attempt only.
        let config = self
            .configs
            .production_for_url(&item.url)
            .await?
            .ok_or_else(|| AppError::ConfigNotFound(item.url.clone()))?;

        if let Some(cap) = self.config.max_urls_per_prefix
            && self.store.count_for_prefix(&config.prefix).await? >= cap
            && !self.store.exists(&item.url).await?
        {
            return Ok(Processed::Skipped(format!(
                "prefix {} reached its cap of {cap} URLs",
                config.prefix
            )));
        }

        let compiled = CompiledConfig::compile(&config)?;
        let page = parse_page(raw, compiled, item.url.clone(), self.config.follow_links).await?;
        let chars = page.content.chars().count();

        let record = ExtractionRecord::new(
            ExtractionResult {
                url: item.url.clone(),
                config_id: config.id,
                parsed_content: page.content,
            },
            config.prefix.as_str(),
            &page.raw,
        );
        self.store.save(&record).await?;

        let links = self.enqueue_links(page.links).await;

        Ok(Processed::Extracted {
            config_id: config.id,
            chars,
            links,
        })
    }

    /// Enqueue discovered links that have no extraction yet. Failures are
    /// logged and do not fail the item.
    async fn enqueue_links(&self, links: Vec<String>) -> usize {
        let mut enqueued = 0;
        for link in links {
            match self.store.exists(&link).await {
                Ok(true) => continue,
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(%link, error = %e, "Could not check discovered link");
                    continue;
                }
            }
            match self.queue.enqueue(&link).await {
                Ok(_) => enqueued += 1,
                Err(e) => tracing::warn!(%link, error = %e, "Could not enqueue discovered link"),
            }
        }
        enqueued
    }

    async fn fail<WR: WorkerReporter>(&self, item: &QueueItem, error: &AppError, reporter: &WR) {
        let attempt = item.attempt_count + 1;
        let message = error.to_string();
        let will_retry = !error.is_permanent() && self.config.retry.can_retry(attempt);

        reporter.report(WorkerEvent::ItemFailed {
            item_id: item.id,
            url: &item.url,
            error: &message,
            attempt,
            will_retry,
        });

        if will_retry {
            let available_at = Utc::now() + self.config.retry.delay_for_attempt(attempt);
            if let Err(e) = self.queue.retry(item.id, &message, available_at).await {
                tracing::error!(item_id = %item.id, error = %e, "Failed to reschedule item");
            }
            return;
        }

        let reason = match error {
            AppError::ConfigNotFound(url) => match deepest_prefix(url) {
                Ok(prefix) => format!("{}: {message}; needs a config for {prefix}", error.kind()),
                Err(_) => format!("{}: {message}", error.kind()),
            },
            _ => format!("{}: {message}", error.kind()),
        };
        reporter.report(WorkerEvent::DeadLettered {
            item_id: item.id,
            url: &item.url,
            reason: &reason,
        });
        if let Err(e) = self.queue.dead_letter(item.id, &reason).await {
            tracing::error!(item_id = %item.id, error = %e, "Failed to dead-letter item");
        }
    }
}

/// Start `count` workers sharing one queue, store and system control. Worker
/// ids are `<base id>-<n>`.
#[allow(clippy::too_many_arguments)]
pub fn spawn_workers<Q, F, C, S, WR>(
    count: usize,
    queue: Q,
    fetcher: F,
    configs: C,
    store: S,
    control: SystemControl,
    base: WorkerConfig,
    cancel_token: CancellationToken,
    reporter: Arc<WR>,
) -> Vec<JoinHandle<Result<(), AppError>>>
where
    Q: WorkQueue + 'static,
    F: Fetcher + 'static,
    C: ConfigStore + 'static,
    S: ExtractionStore + 'static,
    WR: WorkerReporter + 'static,
{
    (1..=count)
        .map(|n| {
            let worker = WorkerService::new(
                queue.clone(),
                fetcher.clone(),
                configs.clone(),
                store.clone(),
                control.clone(),
                base.clone().with_worker_id(format!("{}-{n}", base.worker_id)),
            );
            let cancel_token = cancel_token.clone();
            let reporter = Arc::clone(&reporter);
            tokio::spawn(async move { worker.run(cancel_token, reporter.as_ref()).await })
        })
        .collect()
}
