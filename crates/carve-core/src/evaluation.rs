use std::collections::BTreeMap;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::AppError;
use crate::models::{EvaluationResult, EvaluationRun, SampleCase, SelectorSet};
use crate::profile::GeneratorProfile;
use crate::samples::{SampleLibrary, SampleSet};
use crate::scoring::{ScoringConfig, score};
use crate::selector::{CompiledSelectors, extract_raw};
use crate::synthesis::{NullConfigStore, SynthesisReporter, SynthesisRequest, SynthesisService};
use crate::traits::{ConfigProposerFactory, ConfigStore, EvaluationRunStore};

/// One config applied to the labeled cases of one domain.
#[derive(Debug, Clone)]
pub struct EvaluationJob {
    pub config_name: String,
    pub domain: String,
    pub selectors: SelectorSet,
    pub cases: Vec<SampleCase>,
}

/// Extract and score one case.
///
/// Content that cannot be parsed counts as an empty extraction, so a broken
/// sample lowers the score instead of aborting the batch.
pub fn evaluate_case(
    selectors: &CompiledSelectors,
    case: &SampleCase,
    domain: &str,
    config_name: &str,
    scoring: &ScoringConfig,
) -> EvaluationResult {
    let parsed_content = match extract_raw(&case.raw_content, selectors) {
        Ok(text) => text,
        Err(e) => {
            tracing::warn!(url = %case.url, error = %e, "Sample content not parseable, scoring as empty");
            String::new()
        }
    };
    let metrics = score(&case.expected_content, &parsed_content, scoring);

    EvaluationResult {
        url: case.url.clone(),
        domain: domain.to_string(),
        config_name: config_name.to_string(),
        expected_content: case.expected_content.clone(),
        parsed_content,
        abs_levenshtein_distance_norm: metrics.abs_levenshtein_distance_norm,
        exact_match: metrics.exact_match,
        missing_content: metrics.missing_content,
        extra_content: metrics.extra_content,
    }
}

/// Evaluate every job and assemble a run. Nothing is persisted.
///
/// All selector sets are compiled before any case is scored, so an invalid
/// config fails the batch up front.
pub fn evaluate_jobs(
    jobs: &[EvaluationJob],
    scoring: &ScoringConfig,
    cancel: &CancellationToken,
) -> Result<EvaluationRun, AppError> {
    let compiled = jobs
        .iter()
        .map(|job| CompiledSelectors::compile(&job.selectors))
        .collect::<Result<Vec<_>, _>>()?;

    let mut results = Vec::with_capacity(jobs.iter().map(|j| j.cases.len()).sum());
    for (job, selectors) in jobs.iter().zip(&compiled) {
        for case in &job.cases {
            if cancel.is_cancelled() {
                return Err(AppError::Cancelled);
            }
            results.push(evaluate_case(
                selectors,
                case,
                &job.domain,
                &job.config_name,
                scoring,
            ));
        }
    }

    Ok(EvaluationRun {
        id: Uuid::new_v4(),
        datetime: Utc::now(),
        results,
    })
}

/// Runs evaluation batches and persists complete runs.
pub struct EvaluationService<S: EvaluationRunStore> {
    store: S,
    scoring: ScoringConfig,
}

impl<S: EvaluationRunStore> EvaluationService<S> {
    pub fn new(store: S, scoring: ScoringConfig) -> Self {
        Self { store, scoring }
    }

    /// Evaluate and store the run in one write. A failed or cancelled batch
    /// leaves no trace in the store.
    ///
    /// Scoring runs on the blocking pool.
    pub async fn run(
        &self,
        jobs: &[EvaluationJob],
        cancel: &CancellationToken,
    ) -> Result<EvaluationRun, AppError> {
        let run = evaluate_blocking(jobs.to_vec(), self.scoring, cancel).await?;
        self.store.save_run(&run).await?;
        tracing::info!(run_id = %run.id, results = run.results.len(), "Evaluation run saved");
        Ok(run)
    }
}

/// Profile evaluation without persistence.
pub async fn evaluate_profiles<F, R>(
    factory: &F,
    profiles: &[GeneratorProfile],
    library: &SampleLibrary,
    domains: &[String],
    scoring: &ScoringConfig,
    cancel: &CancellationToken,
    reporter: &R,
) -> Result<EvaluationRun, AppError>
where
    F: ConfigProposerFactory,
    R: SynthesisReporter,
{
    let jobs = profile_jobs(factory, profiles, library, domains, scoring, cancel, reporter).await?;
    evaluate_blocking(jobs, *scoring, cancel).await
}

/// `evaluate_jobs` on the blocking pool.
async fn evaluate_blocking(
    jobs: Vec<EvaluationJob>,
    scoring: ScoringConfig,
    cancel: &CancellationToken,
) -> Result<EvaluationRun, AppError> {
    let cancel = cancel.clone();
    tokio::task::spawn_blocking(move || evaluate_jobs(&jobs, &scoring, &cancel))
        .await
        .map_err(|e| AppError::Generic(format!("Evaluation task failed: {e}")))?
}

/// Synthesize one selector set per profile and domain from the domain's
/// input samples, paired with the domain's validation samples.
pub async fn profile_jobs<F, R>(
    factory: &F,
    profiles: &[GeneratorProfile],
    library: &SampleLibrary,
    domains: &[String],
    scoring: &ScoringConfig,
    cancel: &CancellationToken,
    reporter: &R,
) -> Result<Vec<EvaluationJob>, AppError>
where
    F: ConfigProposerFactory,
    R: SynthesisReporter,
{
    let domains = library.resolve_domains(domains)?;
    let mut jobs = Vec::new();

    for profile in profiles {
        let proposer = factory.create(profile)?;
        let mut synthesis_config = profile.synthesis_config(false);
        synthesis_config.scoring = *scoring;
        let synthesizer = SynthesisService::new(proposer, NullConfigStore, synthesis_config);

        for domain in &domains {
            let input = library.load(domain, SampleSet::Input)?;
            let validation = library.load(domain, SampleSet::Validation)?;
            for url in input.unlabeled.iter().chain(&validation.unlabeled) {
                tracing::warn!(%domain, %url, "Skipping unlabeled sample");
            }
            if input.cases.is_empty() {
                return Err(AppError::SampleError(format!(
                    "Domain '{domain}' has no labeled input samples"
                )));
            }

            let request = SynthesisRequest::new(domain.clone(), input.cases);
            let outcome = synthesizer.synthesize(&request, cancel, reporter).await?;
            let selectors = match outcome.best_selectors() {
                Some(selectors) => selectors.clone(),
                None => {
                    tracing::warn!(
                        profile = %profile.name,
                        %domain,
                        "No usable candidate, scoring validation samples as empty extractions"
                    );
                    // Matches nothing, so every case extracts to "".
                    SelectorSet::default().with_root(&[":not(*)"])
                }
            };

            jobs.push(EvaluationJob {
                config_name: profile.name.clone(),
                domain: domain.clone(),
                selectors,
                cases: validation.cases,
            });
        }
    }

    Ok(jobs)
}

/// Pair stored configs with the validation samples of each domain. The
/// config id is the `config_name` of its results.
pub async fn config_jobs<C: ConfigStore>(
    configs: &C,
    ids: &[Uuid],
    library: &SampleLibrary,
    domains: &[String],
) -> Result<Vec<EvaluationJob>, AppError> {
    let domains = library.resolve_domains(domains)?;
    let mut jobs = Vec::with_capacity(ids.len() * domains.len());

    for id in ids {
        let config = configs
            .get_by_id(*id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("parser config {id}")))?;
        for domain in &domains {
            let validation = library.load(domain, SampleSet::Validation)?;
            for url in &validation.unlabeled {
                tracing::warn!(%domain, %url, "Skipping unlabeled sample");
            }
            jobs.push(EvaluationJob {
                config_name: id.to_string(),
                domain: domain.clone(),
                selectors: config.selectors.clone(),
                cases: validation.cases,
            });
        }
    }

    Ok(jobs)
}

/// Aggregates over a group of results.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GroupStats {
    pub count: usize,
    pub mean_accuracy: f64,
    pub mean_distance: f64,
    pub exact_match_rate: f64,
    pub missing_content_rate: f64,
    pub extra_content_rate: f64,
    /// Number of missing plus extra flags, used to break accuracy ties.
    pub flag_count: usize,
}

impl GroupStats {
    fn from_results<'a>(results: impl IntoIterator<Item = &'a EvaluationResult>) -> Self {
        let mut stats = GroupStats::default();
        let (mut distance, mut exact, mut missing, mut extra) = (0.0, 0usize, 0usize, 0usize);
        for r in results {
            stats.count += 1;
            distance += r.abs_levenshtein_distance_norm;
            exact += usize::from(r.exact_match);
            missing += usize::from(r.missing_content);
            extra += usize::from(r.extra_content);
        }
        if stats.count == 0 {
            return stats;
        }

        let n = stats.count as f64;
        stats.mean_distance = distance / n;
        stats.mean_accuracy = 1.0 - stats.mean_distance;
        stats.exact_match_rate = exact as f64 / n;
        stats.missing_content_rate = missing as f64 / n;
        stats.extra_content_rate = extra as f64 / n;
        stats.flag_count = missing + extra;
        stats
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainConfigStats {
    pub domain: String,
    pub config_name: String,
    pub stats: GroupStats,
}

/// Roll-up of an evaluation run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationSummary {
    pub run_id: Uuid,
    pub overall: GroupStats,
    pub per_config: BTreeMap<String, GroupStats>,
    pub per_domain: BTreeMap<String, GroupStats>,
    pub per_domain_config: Vec<DomainConfigStats>,
    /// Highest mean accuracy; ties go to the fewest missing + extra flags,
    /// then to the name that sorts first.
    pub best_config: Option<String>,
}

pub fn summarize(run: &EvaluationRun) -> EvaluationSummary {
    let mut by_config: BTreeMap<&str, Vec<&EvaluationResult>> = BTreeMap::new();
    let mut by_domain: BTreeMap<&str, Vec<&EvaluationResult>> = BTreeMap::new();
    let mut by_pair: BTreeMap<(&str, &str), Vec<&EvaluationResult>> = BTreeMap::new();
    for r in &run.results {
        by_config.entry(r.config_name.as_str()).or_default().push(r);
        by_domain.entry(r.domain.as_str()).or_default().push(r);
        by_pair
            .entry((r.domain.as_str(), r.config_name.as_str()))
            .or_default()
            .push(r);
    }

    let per_config: BTreeMap<String, GroupStats> = by_config
        .into_iter()
        .map(|(name, results)| (name.to_string(), GroupStats::from_results(results)))
        .collect();

    let best_config = per_config
        .iter()
        .fold(None::<(&String, &GroupStats)>, |best, (name, stats)| match best {
            Some((_, b))
                if b.mean_accuracy > stats.mean_accuracy
                    || (b.mean_accuracy == stats.mean_accuracy
                        && b.flag_count <= stats.flag_count) =>
            {
                best
            }
            _ => Some((name, stats)),
        })
        .map(|(name, _)| name.clone());

    EvaluationSummary {
        run_id: run.id,
        overall: GroupStats::from_results(&run.results),
        per_config,
        per_domain: by_domain
            .into_iter()
            .map(|(name, results)| (name.to_string(), GroupStats::from_results(results)))
            .collect(),
        per_domain_config: by_pair
            .into_iter()
            .map(|((domain, config_name), results)| DomainConfigStats {
                domain: domain.to_string(),
                config_name: config_name.to_string(),
                stats: GroupStats::from_results(results),
            })
            .collect(),
        best_config,
    }
}
