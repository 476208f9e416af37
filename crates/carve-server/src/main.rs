use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use carve_client::{OpenAiProposerFactory, ReqwestFetcher};
use carve_core::SystemControl;
use carve_core::queue::WorkerConfig;
use carve_core::samples::SampleLibrary;
use carve_core::scoring::ScoringConfig;
use carve_core::worker::{TracingWorkerReporter, spawn_workers};
use carve_db::{Database, DatabaseConfig};
use carve_server::routes;
use carve_server::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("carve=info".parse()?))
        .with_target(false)
        .init();

    let port: u16 = env_or("CARVE_SERVER_PORT", 3000)?;
    let worker_count: usize = env_or("CARVE_WORKERS", 2)?;
    let follow_links: bool = env_or("CARVE_FOLLOW_LINKS", false)?;
    let claim_lease_secs: u64 = env_or("CARVE_CLAIM_LEASE_SECS", 600)?;
    let max_urls_per_prefix = std::env::var("CARVE_MAX_URLS_PER_PREFIX")
        .ok()
        .map(|v| v.parse::<u64>())
        .transpose()
        .context("CARVE_MAX_URLS_PER_PREFIX must be a positive integer")?;
    let evals_dir: PathBuf = env_or("CARVE_EVALS_DIR", PathBuf::from("evals"))?;
    let profiles_dir: PathBuf = env_or("CARVE_PROFILES_DIR", PathBuf::from("profiles"))?;
    let proposers = std::env::var("CARVE_API_KEY")
        .ok()
        .filter(|k| !k.trim().is_empty())
        .map(OpenAiProposerFactory::new);
    if proposers.is_none() {
        tracing::warn!("CARVE_API_KEY not set, profile evaluations are disabled");
    }

    let db = Database::connect(&DatabaseConfig::from_env()?).await?;
    db.migrate().await?;

    let control = SystemControl::default();
    let shutdown = CancellationToken::new();

    let worker_config = WorkerConfig::default()
        .with_follow_links(follow_links)
        .with_max_urls_per_prefix(max_urls_per_prefix)
        .with_claim_lease(Duration::from_secs(claim_lease_secs));
    let workers = spawn_workers(
        worker_count,
        db.queue_repo(),
        ReqwestFetcher::new()?,
        db.config_repo(),
        db.extraction_repo(),
        control.clone(),
        worker_config,
        shutdown.clone(),
        Arc::new(TracingWorkerReporter),
    );
    tracing::info!(workers = worker_count, follow_links, "Worker pool started");

    let state = Arc::new(AppState {
        db,
        control,
        library: SampleLibrary::new(evals_dir),
        profiles_dir,
        proposers,
        scoring: ScoringConfig::default(),
        shutdown: shutdown.clone(),
    });

    let app = routes::router(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let addr = format!("0.0.0.0:{port}");
    tracing::info!("Starting server on {addr}");
    let listener = TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await?;

    // The server may also stop on its own; make sure workers see it.
    shutdown.cancel();
    for handle in workers {
        match handle.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::error!(error = %e, "Worker exited with error"),
            Err(e) => tracing::error!(error = %e, "Worker task panicked"),
        }
    }
    tracing::info!("Shutdown complete");

    Ok(())
}

fn env_or<T>(key: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid {key}={raw}: {e}")),
        Err(_) => Ok(default),
    }
}

async fn shutdown_signal(shutdown: CancellationToken) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to install CTRL+C handler");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
    shutdown.cancel();
}
