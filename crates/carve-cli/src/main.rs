use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use carve_client::{OpenAiProposer, OpenAiProposerFactory, ReqwestFetcher};
use carve_core::diff::{Granularity, diff, render_inline};
use carve_core::evaluation::{
    EvaluationService, EvaluationSummary, config_jobs, evaluate_jobs, profile_jobs, summarize,
};
use carve_core::models::{
    EvaluationRun, ExtractionRecord, ExtractionResult, ParserConfig, SampleCase, SelectorSet,
};
use carve_core::profile::{DEFAULT_PROFILE, GeneratorProfile};
use carve_core::proposal::validate_proposal;
use carve_core::queue::{WorkQueue, prefixes_needing_config};
use carve_core::samples::{SampleFile, SampleLibrary, SampleSet};
use carve_core::scoring::ScoringConfig;
use carve_core::selector::{CompiledConfig, extract_raw};
use carve_core::synthesis::{
    NullConfigStore, SynthesisConfig, SynthesisOutcome, SynthesisRequest, SynthesisService,
    TracingSynthesisReporter,
};
use carve_core::traits::{ConfigStore, EvaluationRunStore, ExtractionStore, Fetcher};
use carve_core::urls::{domain_of, normalize_url};
use carve_db::{Database, DatabaseConfig};

#[derive(Parser)]
#[command(
    name = "carve",
    version,
    about = "Adaptive content extraction: learn CSS selector configs per URL prefix"
)]
struct Cli {
    /// Root of the sample library
    #[arg(long, global = true, env = "CARVE_EVALS_DIR", default_value = "evals")]
    evals_dir: PathBuf,

    /// Directory holding generator profiles (<name>.json)
    #[arg(long, global = true, env = "CARVE_PROFILES_DIR", default_value = "profiles")]
    profiles_dir: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch pages and store them as unlabeled samples
    AddSamples {
        /// Sample domain (defaults to each URL's host)
        #[arg(short, long)]
        domain: Option<String>,

        #[arg(short, long, value_enum, default_value_t = SetArg::Input)]
        set: SetArg,

        #[arg(required = true)]
        urls: Vec<String>,
    },

    /// Synthesize a parser config for a prefix from a domain's labeled samples
    Synthesize {
        /// URL prefix the config will serve
        #[arg(short, long)]
        prefix: String,

        /// Sample domain: input samples are prompted, validation samples scored
        #[arg(short, long)]
        domain: String,

        #[arg(long, default_value = DEFAULT_PROFILE)]
        profile: String,

        /// JSON selector set merged into every candidate
        #[arg(long)]
        seed: Option<PathBuf>,

        /// Store an accepted config without promoting it
        #[arg(long, default_value_t = false)]
        no_promote: bool,

        /// Print the outcome without touching the database
        #[arg(long, default_value_t = false)]
        dry_run: bool,

        #[command(flatten)]
        llm: LlmArgs,
    },

    /// Score profiles and/or stored configs against sample domains
    Evaluate {
        /// Generator profile to synthesize and score (repeatable)
        #[arg(long = "profile")]
        profiles: Vec<String>,

        /// Stored config id to score on validation samples (repeatable)
        #[arg(long = "config")]
        configs: Vec<Uuid>,

        /// Restrict to these domains (repeatable; default: all)
        #[arg(short, long = "domain")]
        domains: Vec<String>,

        /// Persist the run (requires DATABASE_URL)
        #[arg(long, default_value_t = false)]
        save: bool,

        /// Print the summary as JSON
        #[arg(long, default_value_t = false)]
        json: bool,

        #[arg(long, env = "CARVE_API_KEY", hide_env_values = true)]
        api_key: Option<String>,
    },

    /// Inspect and manage stored evaluation runs
    Runs {
        #[command(subcommand)]
        command: RunsCommand,
    },

    /// Inspect, import and promote parser configs
    Configs {
        #[command(subcommand)]
        command: ConfigsCommand,
    },

    /// List generator profiles
    Profiles,

    /// Add URLs to the work queue
    Enqueue {
        #[arg(required = true)]
        urls: Vec<String>,
    },

    /// Inspect and requeue failed work items
    DeadLetters {
        #[command(subcommand)]
        command: DeadLettersCommand,
    },

    /// Extract one URL with its production config
    Extract {
        url: String,

        /// Store the result like a worker would
        #[arg(long, default_value_t = false)]
        save: bool,
    },

    /// Show the stored extraction for a URL
    Lookup { url: String },

    /// Diff expected against parsed content for a result of a stored run
    Diff {
        #[arg(long)]
        run: Uuid,

        #[arg(long)]
        url: String,

        /// Only results of this config name
        #[arg(long)]
        config: Option<String>,

        #[arg(long, default_value = "word")]
        granularity: Granularity,
    },
}

#[derive(Args)]
struct LlmArgs {
    /// API key (reads from CARVE_API_KEY env var if not provided)
    #[arg(long, env = "CARVE_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// Override the profile's model
    #[arg(long, env = "CARVE_MODEL")]
    model: Option<String>,

    /// Override the profile's OpenAI-compatible API base URL
    #[arg(long, env = "CARVE_BASE_URL")]
    base_url: Option<String>,
}

#[derive(Subcommand)]
enum RunsCommand {
    /// List runs, newest first
    List {
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },
    /// Show the summary of a run
    Show {
        id: Uuid,
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    Delete { id: Uuid },
    /// Delete every run
    Clear {
        #[arg(long, default_value_t = false)]
        yes: bool,
    },
    /// Export a run's results as CSV
    Export {
        id: Uuid,
        /// Output file (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum ConfigsCommand {
    /// List stored configs, newest first
    List {
        #[arg(short, long)]
        prefix: Option<String>,
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },
    /// List the production config of every prefix
    Production,
    Show { id: Uuid },
    /// Make a config the production config of its prefix
    Promote { id: Uuid },
    /// Store a hand-written selector set
    Import {
        #[arg(short, long)]
        prefix: String,
        file: PathBuf,
        #[arg(long, default_value_t = false)]
        promote: bool,
    },
}

#[derive(Subcommand)]
enum DeadLettersCommand {
    List {
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },
    /// Put a dead item back in the queue with a fresh retry budget
    Requeue { id: Uuid },
    /// Prefixes whose URLs died without a production config
    MissingConfigs {
        /// Dead letters to scan, newest first
        #[arg(short, long, default_value_t = 1000)]
        scan: usize,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum SetArg {
    Input,
    Validation,
}

impl From<SetArg> for SampleSet {
    fn from(set: SetArg) -> Self {
        match set {
            SetArg::Input => SampleSet::Input,
            SetArg::Validation => SampleSet::Validation,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("carve=info".parse()?))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let library = SampleLibrary::new(&cli.evals_dir);

    match cli.command {
        Commands::AddSamples { domain, set, urls } => {
            cmd_add_samples(&library, domain.as_deref(), set.into(), &urls).await?;
        }
        Commands::Synthesize {
            prefix,
            domain,
            profile,
            seed,
            no_promote,
            dry_run,
            llm,
        } => {
            let mut profile = GeneratorProfile::load(&cli.profiles_dir, &profile)?;
            if let Some(model) = llm.model {
                profile.model = model;
            }
            if let Some(base_url) = llm.base_url {
                profile.base_url = base_url;
            }
            let api_key = require_api_key(llm.api_key)?;
            let proposer = OpenAiProposer::from_profile(&api_key, &profile)?;

            let prefix = normalize_url(&prefix)?;
            let mut request = SynthesisRequest::new(
                prefix,
                load_labeled(&library, &domain, SampleSet::Input)?,
            )
            .with_validation(load_labeled(&library, &domain, SampleSet::Validation)?);
            if let Some(path) = seed {
                request = request.with_seed(read_selector_set(&path)?);
            }
            if request.samples.is_empty() {
                bail!("Domain '{domain}' has no labeled input samples");
            }

            let config = profile.synthesis_config(!no_promote);
            let outcome = if dry_run {
                synthesize_with(proposer, NullConfigStore, config, &request).await?
            } else {
                let db = connect_db().await?;
                synthesize_with(proposer, db.config_repo(), config, &request).await?
            };

            println!("{}", serde_json::to_string_pretty(&outcome)?);
            if !outcome.is_accepted() {
                bail!("No candidate reached the acceptance threshold");
            }
        }
        Commands::Evaluate {
            profiles,
            configs,
            domains,
            save,
            json,
            api_key,
        } => {
            if profiles.is_empty() && configs.is_empty() {
                bail!("Pass at least one --profile or --config");
            }
            let db = if save || !configs.is_empty() {
                Some(connect_db().await?)
            } else {
                None
            };
            let cancel = ctrl_c_token();
            let scoring = ScoringConfig::default();
            let mut jobs = Vec::new();

            if !profiles.is_empty() {
                let factory = OpenAiProposerFactory::new(require_api_key(api_key)?);
                let profiles = profiles
                    .iter()
                    .map(|name| GeneratorProfile::load(&cli.profiles_dir, name))
                    .collect::<Result<Vec<_>, _>>()?;
                jobs.extend(
                    profile_jobs(
                        &factory,
                        &profiles,
                        &library,
                        &domains,
                        &scoring,
                        &cancel,
                        &TracingSynthesisReporter,
                    )
                    .await?,
                );
            }
            if let Some(db) = &db
                && !configs.is_empty()
            {
                jobs.extend(config_jobs(&db.config_repo(), &configs, &library, &domains).await?);
            }

            let run = match db.as_ref().filter(|_| save) {
                Some(db) => {
                    EvaluationService::new(db.evaluation_repo(), scoring)
                        .run(&jobs, &cancel)
                        .await?
                }
                None => evaluate_jobs(&jobs, &scoring, &cancel)?,
            };
            print_summary(&summarize(&run), json)?;
        }
        Commands::Runs { command } => {
            let repo = connect_db().await?.evaluation_repo();
            match command {
                RunsCommand::List { limit } => {
                    let runs = repo.list_runs(limit).await?;
                    if runs.is_empty() {
                        println!("No evaluation runs");
                    }
                    for run in runs {
                        println!(
                            "{}  {}  {} results",
                            run.id,
                            run.datetime.format("%Y-%m-%d %H:%M:%S UTC"),
                            run.result_count
                        );
                    }
                }
                RunsCommand::Show { id, json } => {
                    let run = get_run(&repo, id).await?;
                    print_summary(&summarize(&run), json)?;
                }
                RunsCommand::Delete { id } => {
                    if !repo.delete_run(id).await? {
                        bail!("No run with id {id}");
                    }
                    println!("Deleted run {id}");
                }
                RunsCommand::Clear { yes } => {
                    if !yes {
                        bail!("Refusing to delete every run without --yes");
                    }
                    println!("Deleted {} runs", repo.clear_runs().await?);
                }
                RunsCommand::Export { id, output } => {
                    let run = get_run(&repo, id).await?;
                    match output {
                        Some(path) => {
                            let file = std::fs::File::create(&path)
                                .with_context(|| format!("Failed to create {}", path.display()))?;
                            write_csv(&run, file)?;
                            tracing::info!(path = %path.display(), rows = run.results.len(), "CSV written");
                        }
                        None => write_csv(&run, io::stdout())?,
                    }
                }
            }
        }
        Commands::Configs { command } => {
            let repo = connect_db().await?.config_repo();
            match command {
                ConfigsCommand::List { prefix, limit } => {
                    let prefix = prefix.map(|p| normalize_url(&p)).transpose()?;
                    for config in repo.list(prefix.as_deref(), limit).await? {
                        print_config_line(&config);
                    }
                }
                ConfigsCommand::Production => {
                    for config in repo.list_production().await? {
                        print_config_line(&config);
                    }
                }
                ConfigsCommand::Show { id } => {
                    let config = repo
                        .get_by_id(id)
                        .await?
                        .with_context(|| format!("No config with id {id}"))?;
                    println!("{}", serde_json::to_string_pretty(&config)?);
                }
                ConfigsCommand::Promote { id } => {
                    let config = repo.promote(id).await?;
                    println!("Promoted {} for {}", config.id, config.prefix);
                }
                ConfigsCommand::Import {
                    prefix,
                    file,
                    promote,
                } => {
                    let config = ParserConfig::new(normalize_url(&prefix)?, read_selector_set(&file)?);
                    repo.put(&config).await?;
                    if promote {
                        repo.promote(config.id).await?;
                    }
                    println!("{}", config.id);
                }
            }
        }
        Commands::Profiles => {
            for name in GeneratorProfile::list(&cli.profiles_dir)? {
                match GeneratorProfile::load(&cli.profiles_dir, &name) {
                    Ok(profile) => println!("{name}  model={}  threshold={}", profile.model, profile.acceptance_threshold),
                    Err(e) => println!("{name}  (invalid: {e})"),
                }
            }
        }
        Commands::Enqueue { urls } => {
            let queue = connect_db().await?.queue_repo();
            for url in urls {
                let url = normalize_url(&url)?;
                let item = queue.enqueue(&url).await?;
                println!("{}  {}", item.id, item.url);
            }
        }
        Commands::DeadLetters { command } => {
            let queue = connect_db().await?.queue_repo();
            match command {
                DeadLettersCommand::List { limit } => {
                    let dead = queue.dead_letters(limit).await?;
                    if dead.is_empty() {
                        println!("No dead letters");
                    }
                    for item in dead {
                        println!(
                            "{}  {}  attempts={}  {}  {}",
                            item.id,
                            item.dead_at.format("%Y-%m-%d %H:%M:%S UTC"),
                            item.attempt_count,
                            item.url,
                            item.reason
                        );
                    }
                }
                DeadLettersCommand::Requeue { id } => {
                    let item = queue.requeue_dead(id).await?;
                    println!("Requeued {} ({})", item.id, item.url);
                }
                DeadLettersCommand::MissingConfigs { scan } => {
                    let missing = prefixes_needing_config(&queue.dead_letters(scan).await?);
                    if missing.is_empty() {
                        println!("Every dead-lettered URL had a production config");
                    }
                    for m in missing {
                        println!("{:>5}  {}", m.dead_letters, m.prefix);
                    }
                }
            }
        }
        Commands::Extract { url, save } => {
            let db = connect_db().await?;
            cmd_extract(&db, &url, save).await?;
        }
        Commands::Lookup { url } => {
            let repo = connect_db().await?.extraction_repo();
            let url = normalize_url(&url)?;
            match repo.get(&url).await? {
                Some(record) => println!("{}", serde_json::to_string_pretty(&record)?),
                None => bail!("No extraction stored for {url}"),
            }
        }
        Commands::Diff {
            run,
            url,
            config,
            granularity,
        } => {
            let repo = connect_db().await?.evaluation_repo();
            let run = get_run(&repo, run).await?;
            let matching: Vec<_> = run
                .results
                .iter()
                .filter(|r| r.url == url && config.as_ref().is_none_or(|c| &r.config_name == c))
                .collect();
            if matching.is_empty() {
                bail!("No result for {url} in run {}", run.id);
            }
            for result in matching {
                println!(
                    "== {} [{}] accuracy {:.3}",
                    result.config_name,
                    result.domain,
                    result.accuracy()
                );
                let segments = diff(&result.expected_content, &result.parsed_content, granularity);
                println!("{}\n", render_inline(&segments));
            }
        }
    }

    Ok(())
}

/// Connect to PostgreSQL using DATABASE_URL and run migrations.
async fn connect_db() -> Result<Database> {
    let config = DatabaseConfig::from_env().map_err(|e| anyhow::anyhow!(e))?;
    let db = Database::connect(&config)
        .await
        .context("Failed to connect to database")?;
    db.migrate().await.map_err(|e| anyhow::anyhow!(e))?;
    Ok(db)
}

fn require_api_key(api_key: Option<String>) -> Result<String> {
    api_key
        .filter(|k| !k.trim().is_empty())
        .context("CARVE_API_KEY not set. Required to call the proposal model.")
}

/// Cancelled on Ctrl-C so long synthesis or evaluation stops between steps.
fn ctrl_c_token() -> CancellationToken {
    let token = CancellationToken::new();
    let child = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, cancelling");
            child.cancel();
        }
    });
    token
}

async fn cmd_add_samples(
    library: &SampleLibrary,
    domain: Option<&str>,
    set: SampleSet,
    urls: &[String],
) -> Result<()> {
    let fetcher = ReqwestFetcher::new()
        .context("Failed to create HTTP client")?
        .allow_private_urls();

    for url in urls {
        let url = normalize_url(url)?;
        let domain = match domain {
            Some(d) => d.to_string(),
            None => domain_of(&url)?,
        };
        tracing::info!(%url, %domain, "Fetching sample");
        let raw = fetcher.fetch(&url).await.map_err(|e| anyhow::anyhow!(e))?;
        let path = library.save(&domain, set, &SampleFile::unlabeled(url.clone(), raw))?;
        println!("{}", path.display());
    }
    println!("Add a \"label\": {{\"content\": \"...\"}} to each file before using it.");
    Ok(())
}

fn load_labeled(
    library: &SampleLibrary,
    domain: &str,
    set: SampleSet,
) -> Result<Vec<SampleCase>> {
    let loaded = library.load(domain, set)?;
    for url in &loaded.unlabeled {
        tracing::warn!(%domain, %set, %url, "Skipping unlabeled sample");
    }
    Ok(loaded.cases)
}

fn read_selector_set(path: &Path) -> Result<SelectorSet> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read selector file: {}", path.display()))?;
    let value: serde_json::Value =
        serde_json::from_str(&raw).context("Invalid JSON in selector file")?;
    validate_proposal(&value).map_err(|e| anyhow::anyhow!(e))
}

async fn synthesize_with<S: ConfigStore>(
    proposer: OpenAiProposer,
    store: S,
    config: SynthesisConfig,
    request: &SynthesisRequest,
) -> Result<SynthesisOutcome> {
    let service = SynthesisService::new(proposer, store, config);
    let outcome = service
        .synthesize(request, &ctrl_c_token(), &TracingSynthesisReporter)
        .await?;
    Ok(outcome)
}

async fn get_run<S: EvaluationRunStore>(store: &S, id: Uuid) -> Result<EvaluationRun> {
    store
        .get_run(id)
        .await?
        .with_context(|| format!("No run with id {id}"))
}

async fn cmd_extract(db: &Database, url: &str, save: bool) -> Result<()> {
    let url = normalize_url(url)?;
    let config = db
        .config_repo()
        .production_for_url(&url)
        .await?
        .with_context(|| format!("No production config covers {url}"))?;

    let fetcher = ReqwestFetcher::new()
        .context("Failed to create HTTP client")?
        .allow_private_urls();
    let raw = fetcher.fetch(&url).await.map_err(|e| anyhow::anyhow!(e))?;

    let parsed_content = {
        let compiled = CompiledConfig::compile(&config)?;
        extract_raw(&raw, compiled.selectors())?
    };
    tracing::info!(%url, config_id = %config.id, prefix = %config.prefix, chars = parsed_content.len(), "Extracted");

    if save {
        let record = ExtractionRecord::new(
            ExtractionResult {
                url: url.clone(),
                config_id: config.id,
                parsed_content: parsed_content.clone(),
            },
            config.prefix.as_str(),
            &raw,
        );
        db.extraction_repo().save(&record).await?;
    }

    println!("{parsed_content}");
    Ok(())
}

fn print_config_line(config: &ParserConfig) {
    println!(
        "{}  {}  {}  root={:?} drop={}",
        config.id,
        config.created_at.format("%Y-%m-%d %H:%M:%S UTC"),
        config.prefix,
        config.selectors.root,
        config.selectors.drop.len()
    );
}

fn print_summary(summary: &EvaluationSummary, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(summary)?);
        return Ok(());
    }

    println!("Run {}\n", summary.run_id);
    println!(
        "{:<38} {:<24} {:>5} {:>8} {:>6} {:>8} {:>6}",
        "config", "domain", "cases", "accuracy", "exact", "missing", "extra"
    );
    for row in &summary.per_domain_config {
        let s = &row.stats;
        println!(
            "{:<38} {:<24} {:>5} {:>8.3} {:>6.2} {:>8.2} {:>6.2}",
            row.config_name,
            row.domain,
            s.count,
            s.mean_accuracy,
            s.exact_match_rate,
            s.missing_content_rate,
            s.extra_content_rate
        );
    }
    println!();
    for (name, s) in &summary.per_config {
        println!(
            "{:<38} {:<24} {:>5} {:>8.3} {:>6.2} {:>8.2} {:>6.2}",
            name, "(all)", s.count, s.mean_accuracy, s.exact_match_rate, s.missing_content_rate, s.extra_content_rate
        );
    }
    if let Some(best) = &summary.best_config {
        println!("\nBest: {best}");
    }
    Ok(())
}

fn write_csv<W: io::Write>(run: &EvaluationRun, writer: W) -> Result<()> {
    let mut csv = csv::Writer::from_writer(writer);
    for result in &run.results {
        csv.serialize(result)?;
    }
    csv.flush()?;
    Ok(())
}
