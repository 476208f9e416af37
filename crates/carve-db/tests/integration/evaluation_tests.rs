use carve_core::error::AppError;
use carve_core::models::{EvaluationResult, EvaluationRun};
use carve_core::traits::EvaluationRunStore;
use carve_db::EvaluationRepository;
use chrono::{TimeDelta, Utc};
use uuid::Uuid;

use crate::integration::common::setup_test_db;

fn result(url: &str, config: &str, distance: f64) -> EvaluationResult {
    EvaluationResult {
        url: url.to_string(),
        domain: "a.test".to_string(),
        config_name: config.to_string(),
        expected_content: "Hello world".to_string(),
        parsed_content: "Hello there world".to_string(),
        abs_levenshtein_distance_norm: distance,
        exact_match: distance == 0.0,
        missing_content: false,
        extra_content: distance > 0.0,
    }
}

fn run(results: Vec<EvaluationResult>) -> EvaluationRun {
    EvaluationRun {
        id: Uuid::new_v4(),
        datetime: Utc::now(),
        results,
    }
}

#[tokio::test]
async fn save_and_get_run_preserves_order() {
    let (pool, _container) = setup_test_db().await;
    let repo = EvaluationRepository::new(pool);

    let stored = run(vec![
        result("https://a.test/2", "b", 0.5),
        result("https://a.test/1", "a", 0.0),
    ]);
    repo.save_run(&stored).await.unwrap();

    let loaded = repo.get_run(stored.id).await.unwrap().unwrap();
    assert_eq!(loaded.results, stored.results);
    assert!(repo.get_run(Uuid::new_v4()).await.unwrap().is_none());
}

#[tokio::test]
async fn list_runs_newest_first_with_counts() {
    let (pool, _container) = setup_test_db().await;
    let repo = EvaluationRepository::new(pool);

    let mut older = run(vec![result("https://a.test/1", "a", 0.0)]);
    older.datetime = Utc::now() - TimeDelta::hours(1);
    let newer = run(vec![
        result("https://a.test/1", "a", 0.0),
        result("https://a.test/2", "a", 0.25),
    ]);
    repo.save_run(&older).await.unwrap();
    repo.save_run(&newer).await.unwrap();
    repo.save_run(&run(vec![])).await.unwrap();

    let headers = repo.list_runs(10).await.unwrap();
    assert_eq!(headers.len(), 3);
    assert_eq!(headers.last().unwrap().id, older.id);
    let newer_header = headers.iter().find(|h| h.id == newer.id).unwrap();
    assert_eq!(newer_header.result_count, 2);
}

#[tokio::test]
async fn delete_and_clear_runs() {
    let (pool, _container) = setup_test_db().await;
    let repo = EvaluationRepository::new(pool);

    let first = run(vec![result("https://a.test/1", "a", 0.0)]);
    let second = run(vec![result("https://a.test/1", "a", 0.0)]);
    repo.save_run(&first).await.unwrap();
    repo.save_run(&second).await.unwrap();

    assert!(repo.delete_run(first.id).await.unwrap());
    assert!(!repo.delete_run(first.id).await.unwrap());
    assert!(repo.get_run(first.id).await.unwrap().is_none());

    assert_eq!(repo.clear_runs().await.unwrap(), 1);
    assert!(repo.list_runs(10).await.unwrap().is_empty());
}

#[tokio::test]
async fn stored_runs_cannot_be_rewritten() {
    let (pool, _container) = setup_test_db().await;
    let repo = EvaluationRepository::new(pool);

    let stored = run(vec![result("https://a.test/1", "a", 0.0)]);
    repo.save_run(&stored).await.unwrap();

    let rewritten = EvaluationRun {
        results: vec![result("https://a.test/1", "a", 1.0)],
        ..stored.clone()
    };
    let err = repo.save_run(&rewritten).await.unwrap_err();
    assert!(matches!(err, AppError::AlreadyExists(_)));
    assert_eq!(repo.get_run(stored.id).await.unwrap().unwrap().results, stored.results);
}
