use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use tower::ServiceExt;

use carve_core::models::{
    ExtractionRecord, ExtractionResult, ParserConfig, SampleCase, SelectorSet,
};
use carve_core::queue::WorkQueue;
use carve_core::samples::SampleSet;
use carve_core::traits::{ConfigStore, ExtractionStore};

use crate::integration::common::setup_test_app;

async fn send(router: &Router, request: Request<Body>) -> (StatusCode, serde_json::Value) {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let json = if body.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&body).unwrap()
    };
    (status, json)
}

fn get(uri: &str) -> Request<Body> {
    Request::get(uri).body(Body::empty()).unwrap()
}

fn json_request(method: &str, uri: &str, body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_vec(&body).unwrap()))
        .unwrap()
}

#[tokio::test]
async fn health_returns_200() {
    let app = setup_test_app().await;

    let (status, json) = send(&app.router, get("/health")).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "healthy");
    assert_eq!(json["database"], "ok");
    assert_eq!(json["state"], "RUNNING");
}

#[tokio::test]
async fn state_can_be_paused_and_resumed() {
    let app = setup_test_app().await;

    let (status, json) = send(
        &app.router,
        json_request("PUT", "/v1/state", serde_json::json!({"state": "PAUSE"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["state"], "PAUSE");
    assert_eq!(json["previous"], "RUNNING");

    let (_, json) = send(&app.router, get("/v1/state")).await;
    assert_eq!(json["state"], "PAUSE");

    let (_, json) = send(
        &app.router,
        json_request("PUT", "/v1/state", serde_json::json!({"state": "running"})),
    )
    .await;
    assert_eq!(json["state"], "RUNNING");
    assert_eq!(json["previous"], "PAUSE");
}

#[tokio::test]
async fn unknown_state_is_rejected() {
    let app = setup_test_app().await;

    let (status, json) = send(
        &app.router,
        json_request("PUT", "/v1/state", serde_json::json!({"state": "STOPPED"})),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["error"], "validation_error");

    let (_, json) = send(&app.router, get("/v1/state")).await;
    assert_eq!(json["state"], "RUNNING");
}

#[tokio::test]
async fn enqueue_normalizes_urls() {
    let app = setup_test_app().await;

    let (status, json) = send(
        &app.router,
        json_request(
            "POST",
            "/v1/queue",
            serde_json::json!({"urls": ["https://WWW.Example.com/blog/post/?utm_source=x", "example.com/a"]}),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::ACCEPTED);
    let items = json["items"].as_array().unwrap();
    assert_eq!(items.len(), 2);
    assert_eq!(items[0]["url"], "https://example.com/blog/post");
    assert_eq!(items[1]["url"], "https://example.com/a");
    assert_eq!(items[0]["attempt_count"], 0);

    let (_, json) = send(&app.router, get("/v1/queue")).await;
    assert_eq!(json["pending"], 2);
    assert_eq!(json["claimed"], 0);
}

#[tokio::test]
async fn enqueue_with_an_invalid_url_writes_nothing() {
    let app = setup_test_app().await;

    let (status, json) = send(
        &app.router,
        json_request(
            "POST",
            "/v1/queue",
            serde_json::json!({"urls": ["https://a.test/ok", "ftp://a.test/file"]}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["error"], "invalid_url");

    let (status, _) = send(
        &app.router,
        json_request("POST", "/v1/queue", serde_json::json!({"urls": []})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (_, json) = send(&app.router, get("/v1/queue")).await;
    assert_eq!(json["pending"], 0);
}

#[tokio::test]
async fn dead_letters_start_empty_and_unknown_requeue_is_404() {
    let app = setup_test_app().await;

    let (status, json) = send(&app.router, get("/v1/dead-letters")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["total"], 0);

    let (status, json) = send(
        &app.router,
        Request::post(format!("/v1/dead-letters/{}/requeue", uuid::Uuid::new_v4()))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(json["error"], "not_found");
}

#[tokio::test]
async fn missing_configs_are_listed_by_prefix() {
    let app = setup_test_app().await;
    let queue = app.db.queue_repo();
    for url in ["https://a.test/blog/1", "https://a.test/blog/2", "https://a.test/gone"] {
        queue.enqueue(url).await.unwrap();
        let item = queue.dequeue("w").await.unwrap().unwrap();
        let reason = if url.ends_with("gone") {
            "fetch_error: HTTP 404 for https://a.test/gone"
        } else {
            "config_not_found: No production parser config"
        };
        queue.dead_letter(item.id, reason).await.unwrap();
    }

    let (status, json) = send(&app.router, get("/v1/missing-configs")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        json["prefixes"],
        serde_json::json!([{"prefix": "https://a.test/blog", "dead_letters": 2}])
    );
}

#[tokio::test]
async fn promote_then_resolve_longest_prefix() {
    let app = setup_test_app().await;
    let repo = app.db.config_repo();

    let site = ParserConfig::new("https://a.test", SelectorSet::default().with_root(&["main"]));
    let blog = ParserConfig::new(
        "https://a.test/blog",
        SelectorSet::default().with_root(&["article"]),
    );
    repo.put(&site).await.unwrap();
    repo.put(&blog).await.unwrap();

    for config in [&site, &blog] {
        let (status, json) = send(
            &app.router,
            Request::post(format!("/v1/configs/{}/promote", config.id))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["id"], config.id.to_string());
    }

    let (status, json) = send(
        &app.router,
        get("/v1/production?url=https://a.test/blog/2024/post"),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["id"], blog.id.to_string());

    let (_, json) = send(&app.router, get("/v1/production?url=https://a.test/about")).await;
    assert_eq!(json["id"], site.id.to_string());

    let (status, json) = send(&app.router, get("/v1/production?url=https://b.test/x")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(json["error"], "config_not_found");
}

#[tokio::test]
async fn promoting_unknown_config_is_404() {
    let app = setup_test_app().await;

    let (status, _) = send(
        &app.router,
        Request::post(format!("/v1/configs/{}/promote", uuid::Uuid::new_v4()))
            .body(Body::empty())
            .unwrap(),
    )
    .await;

    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn config_listing_filters_by_prefix() {
    let app = setup_test_app().await;
    let repo = app.db.config_repo();
    let blog = ParserConfig::new(
        "https://a.test/blog",
        SelectorSet::default().with_root(&["article"]),
    );
    repo.put(&blog).await.unwrap();
    repo.put(&ParserConfig::new("https://b.test", SelectorSet::default()))
        .await
        .unwrap();

    let (_, json) = send(&app.router, get("/v1/configs")).await;
    assert_eq!(json["total"], 2);

    let (_, json) = send(&app.router, get("/v1/configs?prefix=https://a.test/blog/")).await;
    assert_eq!(json["total"], 1);
    assert_eq!(json["configs"][0]["id"], blog.id.to_string());

    let (status, json) = send(&app.router, get(&format!("/v1/configs/{}", blog.id))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["selectors"]["root"][0], "article");
}

#[tokio::test]
async fn extraction_lookup() {
    let app = setup_test_app().await;
    let config = ParserConfig::new("https://a.test/blog", SelectorSet::default());
    app.db.config_repo().put(&config).await.unwrap();
    let record = ExtractionRecord::new(
        ExtractionResult {
            url: "https://a.test/blog/post".into(),
            config_id: config.id,
            parsed_content: "Hello world".into(),
        },
        "https://a.test/blog",
        "<p>Hello world</p>",
    );
    app.db.extraction_repo().save(&record).await.unwrap();

    let (status, json) = send(
        &app.router,
        get("/v1/extractions?url=https://www.a.test/blog/post/"),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["parsed_content"], "Hello world");
    assert_eq!(json["config_id"], config.id.to_string());

    let (status, _) = send(&app.router, get("/v1/extractions?url=https://a.test/missing")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn config_evaluation_is_stored_and_manageable() {
    let app = setup_test_app().await;

    let html = "<html><body><nav>Menu</nav><article><p>Alpha beta</p></article></body></html>";
    app.library
        .save_labeled(
            "a.test",
            SampleSet::Validation,
            &SampleCase {
                url: "https://a.test/blog/one".into(),
                raw_content: html.into(),
                expected_content: "Alpha beta".into(),
            },
        )
        .unwrap();
    let config = ParserConfig::new(
        "https://a.test/blog",
        SelectorSet::default().with_root(&["article"]),
    );
    app.db.config_repo().put(&config).await.unwrap();

    let (status, json) = send(
        &app.router,
        json_request(
            "POST",
            "/v1/evaluations",
            serde_json::json!({"config_ids": [config.id]}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(json["result_count"], 1);
    assert_eq!(json["summary"]["best_config"], config.id.to_string());
    assert_eq!(json["summary"]["overall"]["exact_match_rate"], 1.0);
    let run_id = json["run_id"].as_str().unwrap().to_string();

    let (_, json) = send(&app.router, get("/v1/runs")).await;
    assert_eq!(json["total"], 1);
    assert_eq!(json["runs"][0]["id"], run_id);
    assert_eq!(json["runs"][0]["result_count"], 1);

    let (status, json) = send(&app.router, get(&format!("/v1/runs/{run_id}"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["run"]["results"][0]["parsed_content"], "Alpha beta");
    assert_eq!(json["run"]["results"][0]["domain"], "a.test");

    let (status, _) = send(
        &app.router,
        Request::delete(format!("/v1/runs/{run_id}"))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, _) = send(&app.router, get(&format!("/v1/runs/{run_id}"))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn clearing_runs_reports_count() {
    let app = setup_test_app().await;
    app.library
        .save_labeled(
            "a.test",
            SampleSet::Validation,
            &SampleCase {
                url: "https://a.test/p".into(),
                raw_content: "<p>x</p>".into(),
                expected_content: "x".into(),
            },
        )
        .unwrap();
    let config = ParserConfig::new("https://a.test", SelectorSet::default());
    app.db.config_repo().put(&config).await.unwrap();

    for _ in 0..2 {
        let (status, _) = send(
            &app.router,
            json_request(
                "POST",
                "/v1/evaluations",
                serde_json::json!({"config_ids": [config.id], "domains": ["a.test"]}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
    }

    let (status, json) = send(
        &app.router,
        Request::delete("/v1/runs").body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["deleted"], 2);
}

#[tokio::test]
async fn evaluation_request_errors() {
    let app = setup_test_app().await;

    let (status, _) = send(
        &app.router,
        json_request("POST", "/v1/evaluations", serde_json::json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    // No API key configured in the test app.
    let (status, json) = send(
        &app.router,
        json_request(
            "POST",
            "/v1/evaluations",
            serde_json::json!({"profiles": ["default"]}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(json["error"], "config_error");

    let (status, json) = send(
        &app.router,
        json_request(
            "POST",
            "/v1/evaluations",
            serde_json::json!({"config_ids": [uuid::Uuid::new_v4()], "domains": ["nowhere.test"]}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["error"], "sample_error");
}
