// tests/api_http.rs
//
// HTTP-level tests for the service Router without opening sockets.
// State lives in a temp dir; requests go through tower::ServiceExt::oneshot.
//
// Covered:
// - GET /health
// - POST /enqueue (queued + duplicate)
// - POST /batch/enqueue, /batch/retry-failed
// - POST /recover
// - GET /stats

use axum::{
    body::{self, Body},
    http::{Request, StatusCode},
    Router,
};
use serde_json::{json, Value as Json};
use std::sync::Arc;
use tower::ServiceExt as _; // for `oneshot`

use feed_pipeline::config::PipelineConfig;
use feed_pipeline::{api, build_state, SystemClock};

const BODY_LIMIT: usize = 1024 * 1024;

async fn test_router(dir: &tempfile::TempDir) -> Router {
    let cfg = PipelineConfig {
        state_dir: dir.path().to_path_buf(),
        ..PipelineConfig::default()
    };
    let state = build_state(&cfg, Arc::new(SystemClock))
        .await
        .expect("build state");
    api::router(state)
}

async fn send(app: &Router, method: &str, uri: &str, body: Option<Json>) -> (StatusCode, Json) {
    let builder = Request::builder().method(method).uri(uri);
    let req = match body {
        Some(b) => builder
            .header("content-type", "application/json")
            .body(Body::from(b.to_string())),
        None => builder.body(Body::empty()),
    }
    .expect("build request");

    let resp = app.clone().oneshot(req).await.expect("oneshot");
    let status = resp.status();
    let bytes = body::to_bytes(resp.into_body(), BODY_LIMIT)
        .await
        .expect("read body");
    let v = serde_json::from_slice(&bytes).unwrap_or(Json::Null);
    (status, v)
}

#[tokio::test]
async fn health_returns_ok() {
    let dir = tempfile::tempdir().unwrap();
    let app = test_router(&dir).await;

    let req = Request::builder()
        .method("GET")
        .uri("/health")
        .body(Body::empty())
        .expect("build GET /health");
    let resp = app.oneshot(req).await.expect("oneshot /health");
    assert_eq!(resp.status(), StatusCode::OK);
    let bytes = body::to_bytes(resp.into_body(), BODY_LIMIT).await.unwrap();
    assert_eq!(String::from_utf8(bytes.to_vec()).unwrap(), "ok");
}

#[tokio::test]
async fn enqueue_dedups_and_stats_reflect_it() {
    let dir = tempfile::tempdir().unwrap();
    let app = test_router(&dir).await;

    let (s1, first) = send(
        &app,
        "POST",
        "/enqueue",
        Some(json!({ "id": "a", "title": "Fed holds rates", "link": "https://x/1" })),
    )
    .await;
    assert_eq!(s1, StatusCode::OK);
    assert_eq!(first["enqueued"], json!(true));

    let (_, second) = send(
        &app,
        "POST",
        "/enqueue",
        Some(json!({ "id": "b", "title": "Fed  holds rates", "link": "https://x/1" })),
    )
    .await;
    assert_eq!(second["enqueued"], json!(false));

    let (s, stats) = send(&app, "GET", "/stats", None).await;
    assert_eq!(s, StatusCode::OK);
    assert_eq!(stats["content"]["pending"], json!(1));
    assert_eq!(stats["images"]["pending"], json!(0));
    // The content queue is not throttled, so it carries no wait estimate.
    assert_eq!(stats["content"]["estimated_time_remaining_secs"], json!(0));
}

#[tokio::test]
async fn batch_enqueue_and_retry_endpoints() {
    let dir = tempfile::tempdir().unwrap();
    let app = test_router(&dir).await;

    let (s, out) = send(
        &app,
        "POST",
        "/batch/enqueue",
        Some(json!([
            { "title": "A", "link": "https://x/a" },
            { "title": "B", "link": "https://x/b", "generated_image": "https://img/b.png" }
        ])),
    )
    .await;
    assert_eq!(s, StatusCode::OK);
    assert_eq!(out, json!({ "added": 1, "skipped": 1 }));

    let (s, retry) = send(&app, "POST", "/batch/retry-failed", None).await;
    assert_eq!(s, StatusCode::OK);
    assert_eq!(retry, json!({ "readded": 0 }));

    let (_, stats) = send(&app, "GET", "/stats", None).await;
    assert_eq!(stats["images"]["pending"], json!(1));
    // 1 item * 2s + 1 batch * 60s at the default throttle
    assert_eq!(stats["images"]["estimated_time_remaining_secs"], json!(62));
}

#[tokio::test]
async fn recover_reports_per_queue_counts() {
    let dir = tempfile::tempdir().unwrap();
    let app = test_router(&dir).await;

    let (s, out) = send(&app, "POST", "/recover", None).await;
    assert_eq!(s, StatusCode::OK);
    assert_eq!(
        out,
        json!({
            "content_requeued": 0,
            "content_errored": 0,
            "images_requeued": 0,
            "images_errored": 0
        })
    );
}

#[tokio::test]
async fn enqueue_rejects_non_json_body() {
    let dir = tempfile::tempdir().unwrap();
    let app = test_router(&dir).await;

    let req = Request::builder()
        .method("POST")
        .uri("/enqueue")
        .header("content-type", "application/json")
        .body(Body::from("not json"))
        .unwrap();
    let resp = app.oneshot(req).await.unwrap();
    assert!(resp.status().is_client_error());
}

#[tokio::test]
async fn queue_state_survives_a_restart() {
    let dir = tempfile::tempdir().unwrap();
    {
        let app = test_router(&dir).await;
        send(
            &app,
            "POST",
            "/enqueue",
            Some(json!({ "title": "Persisted", "link": "https://x/p" })),
        )
        .await;
    }

    let app = test_router(&dir).await;
    let (_, again) = send(
        &app,
        "POST",
        "/enqueue",
        Some(json!({ "title": "Persisted", "link": "https://x/p" })),
    )
    .await;
    assert_eq!(again["enqueued"], json!(false));

    let (_, stats) = send(&app, "GET", "/stats", None).await;
    assert_eq!(stats["content"]["pending"], json!(1));
}
