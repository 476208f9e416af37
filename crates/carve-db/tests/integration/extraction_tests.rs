use carve_core::models::{ExtractionRecord, ExtractionResult, ParserConfig, SelectorSet};
use carve_core::traits::{ConfigStore, ExtractionStore};
use carve_db::{ConfigRepository, ExtractionRepository};
use sqlx::PgPool;

use crate::integration::common::setup_test_db;

async fn stored_config(pool: &PgPool) -> ParserConfig {
    let config = ParserConfig::new(
        "https://a.test/blog",
        SelectorSet::default().with_root(&["article"]),
    );
    ConfigRepository::new(pool.clone()).put(&config).await.unwrap();
    config
}

fn record(config: &ParserConfig, url: &str, text: &str) -> ExtractionRecord {
    ExtractionRecord::new(
        ExtractionResult {
            url: url.to_string(),
            config_id: config.id,
            parsed_content: text.to_string(),
        },
        config.prefix.as_str(),
        "<article>raw</article>",
    )
}

#[tokio::test]
async fn save_and_get_extraction() {
    let (pool, _container) = setup_test_db().await;
    let config = stored_config(&pool).await;
    let repo = ExtractionRepository::new(pool);

    repo.save(&record(&config, "https://a.test/blog/1", "Hello"))
        .await
        .unwrap();

    let got = repo.get("https://a.test/blog/1").await.unwrap().unwrap();
    assert_eq!(got.parsed_content, "Hello");
    assert_eq!(got.config_id, config.id);
    assert_eq!(got.content_hash.len(), 64);
    assert!(repo.exists("https://a.test/blog/1").await.unwrap());
    assert!(!repo.exists("https://a.test/blog/2").await.unwrap());
    assert!(repo.get("https://a.test/blog/2").await.unwrap().is_none());
}

#[tokio::test]
async fn save_overwrites_per_url() {
    let (pool, _container) = setup_test_db().await;
    let config = stored_config(&pool).await;
    let repo = ExtractionRepository::new(pool);

    repo.save(&record(&config, "https://a.test/blog/1", "First"))
        .await
        .unwrap();
    repo.save(&record(&config, "https://a.test/blog/1", "Second"))
        .await
        .unwrap();

    let got = repo.get("https://a.test/blog/1").await.unwrap().unwrap();
    assert_eq!(got.parsed_content, "Second");
    assert_eq!(repo.count_for_prefix("https://a.test/blog").await.unwrap(), 1);
}

#[tokio::test]
async fn counts_and_lists_by_prefix() {
    let (pool, _container) = setup_test_db().await;
    let config = stored_config(&pool).await;
    let repo = ExtractionRepository::new(pool);

    for i in 0..3 {
        repo.save(&record(&config, &format!("https://a.test/blog/{i}"), "x"))
            .await
            .unwrap();
    }

    assert_eq!(repo.count_for_prefix("https://a.test/blog").await.unwrap(), 3);
    assert_eq!(repo.count_for_prefix("https://a.test/news").await.unwrap(), 0);
    assert_eq!(
        repo.list_for_prefix("https://a.test/blog", 2).await.unwrap().len(),
        2
    );
}
