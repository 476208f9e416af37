use std::sync::Arc;

use axum::Router;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tempfile::TempDir;
use testcontainers::core::{ContainerPort, WaitFor};
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, GenericImage, ImageExt};
use tokio_util::sync::CancellationToken;

use carve_core::SystemControl;
use carve_core::samples::SampleLibrary;
use carve_core::scoring::ScoringConfig;
use carve_db::Database;
use carve_server::routes;
use carve_server::state::AppState;

/// Test harness: the router plus handles the tests use to seed data.
///
/// The container and temp dir must stay alive for the test duration.
pub struct TestApp {
    pub router: Router,
    pub db: Database,
    pub library: SampleLibrary,
    _evals_dir: TempDir,
    _container: ContainerAsync<GenericImage>,
}

/// Spin up a PostgreSQL container and build the router on top of it.
/// Profile evaluations are disabled (no API key).
pub async fn setup_test_app() -> TestApp {
    let container = GenericImage::new("postgres", "16")
        .with_exposed_port(ContainerPort::Tcp(5432))
        .with_wait_for(WaitFor::message_on_stderr(
            "database system is ready to accept connections",
        ))
        .with_env_var("POSTGRES_PASSWORD", "postgres")
        .with_env_var("POSTGRES_DB", "carve_test")
        .start()
        .await
        .expect("Failed to start PostgreSQL container");

    let host = container.get_host().await.expect("Failed to get host");
    let port = container
        .get_host_port_ipv4(5432)
        .await
        .expect("Failed to get port");

    let url = format!("postgresql://postgres:postgres@{host}:{port}/carve_test");
    let pool = retry_connect(&url).await;

    let db = Database::from_pool(pool);
    db.migrate().await.expect("Failed to run migrations");

    let evals_dir = tempfile::tempdir().expect("Failed to create evals dir");
    let library = SampleLibrary::new(evals_dir.path());

    let state = Arc::new(AppState {
        db: db.clone(),
        control: SystemControl::default(),
        library: library.clone(),
        profiles_dir: evals_dir.path().join("profiles"),
        proposers: None,
        scoring: ScoringConfig::default(),
        shutdown: CancellationToken::new(),
    });

    TestApp {
        router: routes::router(state),
        db,
        library,
        _evals_dir: evals_dir,
        _container: container,
    }
}

async fn retry_connect(url: &str) -> PgPool {
    for _ in 0..30 {
        if let Ok(pool) = PgPoolOptions::new().max_connections(5).connect(url).await {
            return pool;
        }
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    }
    panic!("Failed to connect to test database");
}
