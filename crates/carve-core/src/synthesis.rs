//! Config synthesis: propose a selector set from labeled samples, score it,
//! reflect on the failures and try again until it is good enough or the
//! iteration budget runs out.

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::diff::{Granularity, diff, render_inline};
use crate::error::AppError;
use crate::evaluation::evaluate_case;
use crate::models::{EvaluationResult, ParserConfig, SampleCase, SelectorSet};
use crate::proposal::{FailureCase, ProposalRequest, PromptSample, Reflection, validate_proposal};
use crate::scoring::ScoringConfig;
use crate::selector::CompiledSelectors;
use crate::traits::{ConfigProposer, ConfigStore};

/// Diffs in reflection payloads are cut to this many characters.
const MAX_DIFF_CHARS: usize = 2_000;

/// Synthesis tunables.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SynthesisConfig {
    /// Minimum mean accuracy over the validation set to accept a candidate.
    pub acceptance_threshold: f64,
    /// Proposal rounds, including rounds whose answer was rejected.
    pub max_iterations: u32,
    /// Samples included in a prompt. Shrinks when the prompt is too large.
    pub max_prompt_samples: usize,
    /// Promote an accepted config to production right away.
    pub promote_on_accept: bool,
    pub scoring: ScoringConfig,
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            acceptance_threshold: 0.9,
            max_iterations: 5,
            max_prompt_samples: 3,
            promote_on_accept: true,
            scoring: ScoringConfig::default(),
        }
    }
}

/// Samples and validation cases for one prefix.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SynthesisRequest {
    pub prefix: String,
    /// Shown to the proposal service and scored.
    pub samples: Vec<SampleCase>,
    /// Scored only.
    #[serde(default)]
    pub validation: Vec<SampleCase>,
    /// Selectors merged into every candidate.
    #[serde(default)]
    pub seed: Option<SelectorSet>,
}

impl SynthesisRequest {
    pub fn new(prefix: impl Into<String>, samples: Vec<SampleCase>) -> Self {
        Self {
            prefix: prefix.into(),
            samples,
            validation: Vec::new(),
            seed: None,
        }
    }

    pub fn with_validation(mut self, validation: Vec<SampleCase>) -> Self {
        self.validation = validation;
        self
    }

    pub fn with_seed(mut self, seed: SelectorSet) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Samples followed by validation cases, first occurrence per URL.
    fn validation_set(&self) -> Vec<&SampleCase> {
        let mut out: Vec<&SampleCase> = Vec::with_capacity(self.samples.len() + self.validation.len());
        for case in self.samples.iter().chain(&self.validation) {
            if !out.iter().any(|c| c.url == case.url) {
                out.push(case);
            }
        }
        out
    }
}

/// A candidate and how it scored on the validation set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoredCandidate {
    pub selectors: SelectorSet,
    pub iteration: u32,
    pub accuracy: f64,
    pub missing_count: usize,
    pub results: Vec<EvaluationResult>,
}

impl ScoredCandidate {
    /// Higher accuracy wins; ties go to fewer missing-content flags.
    fn beats(&self, other: &ScoredCandidate) -> bool {
        self.accuracy > other.accuracy
            || (self.accuracy == other.accuracy && self.missing_count < other.missing_count)
    }

    fn reflection(&self, limit: usize) -> Reflection {
        let mut failing: Vec<&EvaluationResult> =
            self.results.iter().filter(|r| !r.exact_match).collect();
        failing.sort_by(|a, b| a.accuracy().total_cmp(&b.accuracy()));

        Reflection {
            candidate: self.selectors.clone(),
            accuracy: self.accuracy,
            failures: failing
                .into_iter()
                .take(limit.max(1))
                .map(|r| FailureCase {
                    url: r.url.clone(),
                    accuracy: r.accuracy(),
                    missing_content: r.missing_content,
                    extra_content: r.extra_content,
                    diff: truncate_chars(
                        &render_inline(&diff(
                            &r.expected_content,
                            &r.parsed_content,
                            Granularity::Word,
                        )),
                        MAX_DIFF_CHARS,
                    ),
                })
                .collect(),
        }
    }
}

/// Why synthesis gave up.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FailureReport {
    pub iterations: u32,
    /// Rejected or failed proposal rounds, in order.
    pub errors: Vec<String>,
    /// Worst cases of the best candidate.
    pub failures: Vec<FailureCase>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SynthesisOutcome {
    Accepted {
        config: ParserConfig,
        accuracy: f64,
        iterations: u32,
        promoted: bool,
    },
    /// Budget spent without reaching the threshold. Nothing was stored.
    Exhausted {
        best: Option<ScoredCandidate>,
        report: FailureReport,
    },
}

impl SynthesisOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, SynthesisOutcome::Accepted { .. })
    }

    /// The accepted selectors, or the best rejected ones.
    pub fn best_selectors(&self) -> Option<&SelectorSet> {
        match self {
            SynthesisOutcome::Accepted { config, .. } => Some(&config.selectors),
            SynthesisOutcome::Exhausted { best, .. } => best.as_ref().map(|b| &b.selectors),
        }
    }
}

/// Events emitted by the synthesis loop.
#[derive(Debug, Clone)]
pub enum SynthesisEvent<'a> {
    Started {
        prefix: &'a str,
        cases: usize,
    },
    Proposing {
        prefix: &'a str,
        iteration: u32,
        prompt_samples: usize,
        reflecting: bool,
    },
    Rejected {
        prefix: &'a str,
        iteration: u32,
        error: &'a str,
    },
    PromptShrunk {
        prefix: &'a str,
        prompt_samples: usize,
    },
    Scored {
        prefix: &'a str,
        iteration: u32,
        accuracy: f64,
        missing: usize,
    },
    Accepted {
        prefix: &'a str,
        config_id: Uuid,
        accuracy: f64,
        promoted: bool,
    },
    Exhausted {
        prefix: &'a str,
        best_accuracy: Option<f64>,
    },
}

pub trait SynthesisReporter: Send + Sync {
    fn report(&self, event: SynthesisEvent<'_>) {
        let _ = event;
    }
}

/// Reporter that uses the `tracing` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSynthesisReporter;

impl SynthesisReporter for TracingSynthesisReporter {
    fn report(&self, event: SynthesisEvent<'_>) {
        match event {
            SynthesisEvent::Started { prefix, cases } => {
                tracing::info!(%prefix, %cases, "Synthesis started");
            }
            SynthesisEvent::Proposing {
                prefix,
                iteration,
                prompt_samples,
                reflecting,
            } => {
                tracing::info!(%prefix, %iteration, %prompt_samples, %reflecting, "Requesting proposal");
            }
            SynthesisEvent::Rejected {
                prefix,
                iteration,
                error,
            } => {
                tracing::warn!(%prefix, %iteration, %error, "Proposal rejected");
            }
            SynthesisEvent::PromptShrunk {
                prefix,
                prompt_samples,
            } => {
                tracing::warn!(%prefix, %prompt_samples, "Prompt too large, using fewer samples");
            }
            SynthesisEvent::Scored {
                prefix,
                iteration,
                accuracy,
                missing,
            } => {
                tracing::info!(%prefix, %iteration, %accuracy, %missing, "Candidate scored");
            }
            SynthesisEvent::Accepted {
                prefix,
                config_id,
                accuracy,
                promoted,
            } => {
                tracing::info!(%prefix, %config_id, %accuracy, %promoted, "Candidate accepted");
            }
            SynthesisEvent::Exhausted {
                prefix,
                best_accuracy,
            } => {
                tracing::warn!(%prefix, ?best_accuracy, "Synthesis budget exhausted");
            }
        }
    }
}

/// A config store that keeps nothing. Used when synthesized configs are
/// only needed in memory, as in profile evaluation.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullConfigStore;

impl ConfigStore for NullConfigStore {
    async fn put(&self, _config: &ParserConfig) -> Result<(), AppError> {
        Ok(())
    }

    async fn get_by_id(&self, _id: Uuid) -> Result<Option<ParserConfig>, AppError> {
        Ok(None)
    }

    async fn get(&self, _prefix: &str) -> Result<Option<ParserConfig>, AppError> {
        Ok(None)
    }

    async fn list(
        &self,
        _prefix: Option<&str>,
        _limit: usize,
    ) -> Result<Vec<ParserConfig>, AppError> {
        Ok(vec![])
    }

    async fn promote(&self, id: Uuid) -> Result<ParserConfig, AppError> {
        Err(AppError::NotFound(format!("parser config {id}")))
    }

    async fn current_production(&self, _prefix: &str) -> Result<Option<ParserConfig>, AppError> {
        Ok(None)
    }

    async fn production_for_url(&self, _url: &str) -> Result<Option<ParserConfig>, AppError> {
        Ok(None)
    }
}

/// Drives the propose/validate/decide loop for one prefix at a time.
pub struct SynthesisService<P: ConfigProposer, S: ConfigStore> {
    proposer: P,
    store: S,
    config: SynthesisConfig,
}

impl<P: ConfigProposer, S: ConfigStore> SynthesisService<P, S> {
    pub fn new(proposer: P, store: S, config: SynthesisConfig) -> Self {
        Self {
            proposer,
            store,
            config,
        }
    }

    pub async fn synthesize<R: SynthesisReporter>(
        &self,
        request: &SynthesisRequest,
        cancel: &CancellationToken,
        reporter: &R,
    ) -> Result<SynthesisOutcome, AppError> {
        if request.samples.is_empty() {
            return Err(AppError::SampleError(format!(
                "No labeled samples for prefix {}",
                request.prefix
            )));
        }
        if let Some(seed) = &request.seed {
            CompiledSelectors::compile(seed)?;
        }

        let prefix = request.prefix.as_str();
        let cases = request.validation_set();
        reporter.report(SynthesisEvent::Started {
            prefix,
            cases: cases.len(),
        });

        let mut prompt_samples = self.config.max_prompt_samples.clamp(1, request.samples.len());
        let mut best: Option<ScoredCandidate> = None;
        let mut rejection: Option<String> = None;
        let mut report = FailureReport::default();

        for iteration in 1..=self.config.max_iterations {
            if cancel.is_cancelled() {
                return Err(AppError::Cancelled);
            }
            report.iterations = iteration;

            let proposal_request = ProposalRequest {
                prefix: request.prefix.clone(),
                samples: request.samples[..prompt_samples]
                    .iter()
                    .map(|c| PromptSample {
                        url: c.url.clone(),
                        html: c.raw_content.clone(),
                        expected_content: c.expected_content.clone(),
                    })
                    .collect(),
                reflection: best
                    .as_ref()
                    .map(|b| b.reflection(self.config.max_prompt_samples)),
                rejection: rejection.take(),
            };
            reporter.report(SynthesisEvent::Proposing {
                prefix,
                iteration,
                prompt_samples,
                reflecting: proposal_request.reflection.is_some(),
            });

            let proposed = tokio::select! {
                result = self.proposer.propose(&proposal_request) => result,
                () = cancel.cancelled() => return Err(AppError::Cancelled),
            };

            let selectors = match proposed.and_then(|value| validate_proposal(&value)) {
                Ok(selectors) => selectors,
                Err(AppError::ContextWindowExceeded(message)) => {
                    report.errors.push(format!("iteration {iteration}: {message}"));
                    if prompt_samples > 1 {
                        prompt_samples -= 1;
                        reporter.report(SynthesisEvent::PromptShrunk {
                            prefix,
                            prompt_samples,
                        });
                    }
                    continue;
                }
                Err(AppError::ProposalError(message)) => {
                    reporter.report(SynthesisEvent::Rejected {
                        prefix,
                        iteration,
                        error: &message,
                    });
                    report.errors.push(format!("iteration {iteration}: {message}"));
                    rejection = Some(message);
                    continue;
                }
                Err(e) if e.is_retryable() => {
                    let message = e.to_string();
                    reporter.report(SynthesisEvent::Rejected {
                        prefix,
                        iteration,
                        error: &message,
                    });
                    report.errors.push(format!("iteration {iteration}: {message}"));
                    continue;
                }
                Err(e) => return Err(e),
            };

            let selectors = match &request.seed {
                Some(seed) => seed.merge(&selectors),
                None => selectors,
            };
            let candidate = self.score(&selectors, &cases, iteration)?;
            reporter.report(SynthesisEvent::Scored {
                prefix,
                iteration,
                accuracy: candidate.accuracy,
                missing: candidate.missing_count,
            });

            if candidate.accuracy >= self.config.acceptance_threshold {
                return self.accept(prefix, candidate, reporter).await;
            }

            if best.as_ref().is_none_or(|b| candidate.beats(b)) {
                best = Some(candidate);
            }
        }

        reporter.report(SynthesisEvent::Exhausted {
            prefix,
            best_accuracy: best.as_ref().map(|b| b.accuracy),
        });
        if let Some(b) = &best {
            report.failures = b.reflection(self.config.max_prompt_samples).failures;
        }
        Ok(SynthesisOutcome::Exhausted { best, report })
    }

    fn score(
        &self,
        selectors: &SelectorSet,
        cases: &[&SampleCase],
        iteration: u32,
    ) -> Result<ScoredCandidate, AppError> {
        let compiled = CompiledSelectors::compile(selectors)?;
        let results: Vec<EvaluationResult> = cases
            .iter()
            .map(|case| evaluate_case(&compiled, case, "", "candidate", &self.config.scoring))
            .collect();

        let accuracy = if results.is_empty() {
            0.0
        } else {
            results.iter().map(EvaluationResult::accuracy).sum::<f64>() / results.len() as f64
        };
        let missing_count = results.iter().filter(|r| r.missing_content).count();

        Ok(ScoredCandidate {
            selectors: selectors.clone(),
            iteration,
            accuracy,
            missing_count,
            results,
        })
    }

    async fn accept<R: SynthesisReporter>(
        &self,
        prefix: &str,
        candidate: ScoredCandidate,
        reporter: &R,
    ) -> Result<SynthesisOutcome, AppError> {
        let config = ParserConfig::new(prefix, candidate.selectors);
        self.store.put(&config).await?;

        let promoted = if self.config.promote_on_accept {
            self.store.promote(config.id).await?;
            true
        } else {
            false
        };

        reporter.report(SynthesisEvent::Accepted {
            prefix,
            config_id: config.id,
            accuracy: candidate.accuracy,
            promoted,
        });

        Ok(SynthesisOutcome::Accepted {
            config,
            accuracy: candidate.accuracy,
            iterations: candidate.iteration,
            promoted,
        })
    }
}

fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}
