use chrono::{TimeDelta, Utc};
use carve_core::queue::WorkQueue;
use carve_db::QueueRepository;

use crate::integration::common::setup_test_db;

#[tokio::test]
async fn enqueue_dequeue_ack() {
    let (pool, _container) = setup_test_db().await;
    let repo = QueueRepository::new(pool);

    let item = repo.enqueue("https://a.test/1").await.unwrap();
    assert_eq!(item.attempt_count, 0);
    assert_eq!(repo.pending_count().await.unwrap(), 1);

    let claimed = repo.dequeue("worker-1").await.unwrap().unwrap();
    assert_eq!(claimed.id, item.id);
    assert_eq!(repo.pending_count().await.unwrap(), 0);
    assert_eq!(repo.claimed_count().await.unwrap(), 1);
    assert!(repo.dequeue("worker-2").await.unwrap().is_none());

    repo.ack(claimed.id).await.unwrap();
    assert_eq!(repo.claimed_count().await.unwrap(), 0);
    assert!(repo.ack(claimed.id).await.is_err());
}

#[tokio::test]
async fn dequeue_is_fifo() {
    let (pool, _container) = setup_test_db().await;
    let repo = QueueRepository::new(pool);

    for i in 0..3 {
        repo.enqueue(&format!("https://a.test/{i}")).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }
    for i in 0..3 {
        let item = repo.dequeue("w").await.unwrap().unwrap();
        assert_eq!(item.url, format!("https://a.test/{i}"));
    }
}

#[tokio::test]
async fn retry_delays_and_counts_attempts() {
    let (pool, _container) = setup_test_db().await;
    let repo = QueueRepository::new(pool);

    repo.enqueue("https://a.test/1").await.unwrap();
    let item = repo.dequeue("w").await.unwrap().unwrap();
    repo.retry(item.id, "HTTP 503", Utc::now() + TimeDelta::minutes(10))
        .await
        .unwrap();

    assert_eq!(repo.pending_count().await.unwrap(), 1);
    assert!(repo.dequeue("w").await.unwrap().is_none());

    repo.enqueue("https://a.test/2").await.unwrap();
    let other = repo.dequeue("w").await.unwrap().unwrap();
    repo.retry(other.id, "timeout", Utc::now() - TimeDelta::seconds(1))
        .await
        .unwrap();
    let again = repo.dequeue("w").await.unwrap().unwrap();
    assert_eq!(again.id, other.id);
    assert_eq!(again.attempt_count, 1);
    assert_eq!(again.last_error.as_deref(), Some("timeout"));
}

#[tokio::test]
async fn dead_letter_and_requeue() {
    let (pool, _container) = setup_test_db().await;
    let repo = QueueRepository::new(pool);

    repo.enqueue("https://a.test/gone").await.unwrap();
    let item = repo.dequeue("w").await.unwrap().unwrap();
    repo.dead_letter(item.id, "fetch_error: HTTP 404").await.unwrap();

    assert_eq!(repo.pending_count().await.unwrap(), 0);
    let dead = repo.dead_letters(10).await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].attempt_count, 1);
    assert_eq!(dead[0].reason, "fetch_error: HTTP 404");

    let requeued = repo.requeue_dead(item.id).await.unwrap();
    assert_eq!(requeued.attempt_count, 0);
    assert!(repo.dead_letters(10).await.unwrap().is_empty());
    assert_eq!(repo.dequeue("w").await.unwrap().unwrap().id, item.id);
    assert!(repo.requeue_dead(item.id).await.is_err());
}

#[tokio::test]
async fn release_worker_returns_claimed_items() {
    let (pool, _container) = setup_test_db().await;
    let repo = QueueRepository::new(pool);

    repo.enqueue("https://a.test/1").await.unwrap();
    repo.enqueue("https://a.test/2").await.unwrap();
    repo.dequeue("worker-1").await.unwrap().unwrap();
    repo.dequeue("worker-2").await.unwrap().unwrap();

    assert_eq!(repo.release_worker("worker-1").await.unwrap(), 1);
    assert_eq!(repo.pending_count().await.unwrap(), 1);
    assert_eq!(repo.claimed_count().await.unwrap(), 1);
}

#[tokio::test]
async fn expired_claims_are_reclaimed() {
    let (pool, _container) = setup_test_db().await;
    let repo = QueueRepository::new(pool);

    let item = repo.enqueue("https://a.test/1").await.unwrap();
    repo.dequeue("crashed-worker").await.unwrap().unwrap();

    let lease = std::time::Duration::from_secs(600);
    assert_eq!(repo.reclaim_expired(lease).await.unwrap(), 0);
    assert_eq!(repo.claimed_count().await.unwrap(), 1);

    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    let short = std::time::Duration::from_millis(10);
    assert_eq!(repo.reclaim_expired(short).await.unwrap(), 1);
    assert_eq!(repo.claimed_count().await.unwrap(), 0);

    let again = repo.dequeue("w").await.unwrap().unwrap();
    assert_eq!(again.id, item.id);
    assert_eq!(again.attempt_count, 0);
}

#[tokio::test]
async fn release_returns_a_single_item() {
    let (pool, _container) = setup_test_db().await;
    let repo = QueueRepository::new(pool);

    let item = repo.enqueue("https://a.test/1").await.unwrap();
    repo.dequeue("w").await.unwrap().unwrap();
    repo.release(item.id).await.unwrap();

    assert_eq!(repo.pending_count().await.unwrap(), 1);
    assert!(repo.release(item.id).await.is_err());
    assert_eq!(repo.dequeue("w").await.unwrap().unwrap().attempt_count, 0);
}

#[tokio::test]
async fn concurrent_dequeues_never_share_an_item() {
    let (pool, _container) = setup_test_db().await;
    let repo = QueueRepository::new(pool);

    for i in 0..20 {
        repo.enqueue(&format!("https://a.test/{i}")).await.unwrap();
    }

    let handles: Vec<_> = (0..4)
        .map(|w| {
            let repo = repo.clone();
            tokio::spawn(async move {
                let mut ids = Vec::new();
                while let Some(item) = repo.dequeue(&format!("w{w}")).await.unwrap() {
                    ids.push(item.id);
                }
                ids
            })
        })
        .collect();

    let mut all = Vec::new();
    for handle in handles {
        all.extend(handle.await.unwrap());
    }
    let total = all.len();
    all.sort();
    all.dedup();
    assert_eq!(total, 20);
    assert_eq!(all.len(), 20);
}
