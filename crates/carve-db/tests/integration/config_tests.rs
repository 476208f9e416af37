use carve_core::error::AppError;
use carve_core::models::{ParserConfig, SelectorSet};
use carve_core::traits::ConfigStore;
use carve_db::ConfigRepository;

use crate::integration::common::setup_test_db;

fn config(prefix: &str, root: &str) -> ParserConfig {
    ParserConfig::new(prefix, SelectorSet::default().with_root(&[root]))
}

#[tokio::test]
async fn put_and_get_round_trip() {
    let (pool, _container) = setup_test_db().await;
    let repo = ConfigRepository::new(pool);

    let stored = config("https://a.test/blog", "article");
    repo.put(&stored).await.unwrap();

    let by_id = repo.get_by_id(stored.id).await.unwrap().unwrap();
    assert_eq!(by_id.prefix, "https://a.test/blog");
    assert_eq!(by_id.selectors, stored.selectors);

    let latest = repo.get("https://a.test/blog").await.unwrap().unwrap();
    assert_eq!(latest.id, stored.id);
    assert!(repo.get("https://a.test/other").await.unwrap().is_none());
}

#[tokio::test]
async fn stored_configs_cannot_be_rewritten() {
    let (pool, _container) = setup_test_db().await;
    let repo = ConfigRepository::new(pool);

    let stored = config("https://a.test/blog", "article");
    repo.put(&stored).await.unwrap();
    repo.promote(stored.id).await.unwrap();

    let rewritten = ParserConfig {
        selectors: SelectorSet::default().with_root(&["body"]),
        ..stored.clone()
    };
    let err = repo.put(&rewritten).await.unwrap_err();
    assert!(matches!(err, AppError::AlreadyExists(_)));

    let production = repo.current_production("https://a.test/blog").await.unwrap().unwrap();
    assert_eq!(production.selectors, stored.selectors);
}

#[tokio::test]
async fn list_is_newest_first_and_filterable() {
    let (pool, _container) = setup_test_db().await;
    let repo = ConfigRepository::new(pool);

    let first = config("https://a.test/blog", "article");
    repo.put(&first).await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    let second = config("https://a.test/blog", "main");
    repo.put(&second).await.unwrap();
    repo.put(&config("https://b.test", "main")).await.unwrap();

    let blog = repo.list(Some("https://a.test/blog"), 10).await.unwrap();
    assert_eq!(blog.len(), 2);
    assert_eq!(blog[0].id, second.id);
    assert_eq!(repo.list(None, 10).await.unwrap().len(), 3);
    assert_eq!(repo.list(None, 1).await.unwrap().len(), 1);
}

#[tokio::test]
async fn promote_replaces_production_config() {
    let (pool, _container) = setup_test_db().await;
    let repo = ConfigRepository::new(pool);

    let old = config("https://a.test/blog", "article");
    let new = config("https://a.test/blog", "main");
    repo.put(&old).await.unwrap();
    repo.put(&new).await.unwrap();

    repo.promote(old.id).await.unwrap();
    assert_eq!(
        repo.current_production("https://a.test/blog").await.unwrap().unwrap().id,
        old.id
    );

    let promoted = repo.promote(new.id).await.unwrap();
    assert_eq!(promoted.id, new.id);
    assert_eq!(
        repo.current_production("https://a.test/blog").await.unwrap().unwrap().id,
        new.id
    );
    assert_eq!(repo.list_production().await.unwrap().len(), 1);
}

#[tokio::test]
async fn promote_unknown_id_is_not_found() {
    let (pool, _container) = setup_test_db().await;
    let repo = ConfigRepository::new(pool);

    let err = repo.promote(uuid::Uuid::new_v4()).await.unwrap_err();
    assert!(matches!(err, carve_core::AppError::NotFound(_)));
}

#[tokio::test]
async fn production_for_url_uses_longest_prefix() {
    let (pool, _container) = setup_test_db().await;
    let repo = ConfigRepository::new(pool);

    let site = config("https://a.test", "body");
    let blog = config("https://a.test/blog", "article");
    for c in [&site, &blog] {
        repo.put(c).await.unwrap();
        repo.promote(c.id).await.unwrap();
    }

    let hit = repo.production_for_url("https://a.test/blog/post-1").await.unwrap();
    assert_eq!(hit.unwrap().id, blog.id);
    let hit = repo.production_for_url("https://a.test/blogroll").await.unwrap();
    assert_eq!(hit.unwrap().id, site.id);
    assert!(repo.production_for_url("https://b.test/x").await.unwrap().is_none());
}

#[tokio::test]
async fn concurrent_promotions_leave_one_winner() {
    let (pool, _container) = setup_test_db().await;
    let repo = ConfigRepository::new(pool);

    let configs: Vec<ParserConfig> = (0..8)
        .map(|i| config("https://a.test/blog", &format!("div.v{i}")))
        .collect();
    for c in &configs {
        repo.put(c).await.unwrap();
    }

    let handles: Vec<_> = configs
        .iter()
        .map(|c| {
            let repo = repo.clone();
            let id = c.id;
            tokio::spawn(async move { repo.promote(id).await })
        })
        .collect();
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let production = repo
        .current_production("https://a.test/blog")
        .await
        .unwrap()
        .unwrap();
    assert!(configs.iter().any(|c| c.id == production.id));
    assert_eq!(repo.list_production().await.unwrap().len(), 1);
}
