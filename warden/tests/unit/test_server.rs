//! Control API routes driven through the router without a socket

use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use chrono::{TimeZone, Utc};
use secrecy::SecretString;
use serde_json::Value;
use tower::ServiceExt;

use warden::collect::store::{LogStore, SourceCursor};
use warden::errors::FetchError;
use warden::models::event::{EventType, Outcome};
use warden::models::log_entry::{LogRecord, LogStream, Severity};
use warden::server::handlers::WEBHOOK_TOKEN_HEADER;
use warden::server::serve::router;
use warden::server::state::ServerState;

use crate::common::Harness;

async fn app(harness: &Harness, secret: Option<&str>) -> (Router, Arc<LogStore>) {
    let logs = Arc::new(
        LogStore::open(harness.dir.file("logs.json"), 100)
            .await
            .unwrap(),
    );
    let state = ServerState::new(
        harness.surface.clone(),
        logs.clone(),
        secret.map(|s| SecretString::from(s.to_string())),
    );
    (router(Arc::new(state)), logs)
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, body)
}

fn get(uri: &str) -> Request<Body> {
    Request::get(uri).body(Body::empty()).unwrap()
}

fn post(uri: &str) -> Request<Body> {
    Request::post(uri).body(Body::empty()).unwrap()
}

#[tokio::test]
async fn test_health_and_status() {
    let harness = Harness::new("warden-server").await;
    let (app, _) = app(&harness, None).await;

    let (status, body) = send(&app, get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["service"], "warden");
    assert_eq!(body["status"], "healthy");

    let (status, body) = send(&app, get("/status")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state"], "stopped");
    assert_eq!(body["health"]["freshness"], "unknown");
    assert!(body["process"].is_null());

    harness.cleanup().await;
}

#[tokio::test]
async fn test_control_actions() {
    let harness = Harness::new("warden-server").await;
    let (app, _) = app(&harness, None).await;

    let (status, body) = send(&app, post("/control/rebuild")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("rebuild"));

    let (status, body) = send(&app, post("/control/stop")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["event"]["event_type"], "stop");

    // no artifact has been fetched yet
    let (status, body) = send(&app, post("/control/start")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], false);
    assert_eq!(body["outcome"], "failed");
    assert_eq!(body["state"], "stopped");

    let (_, body) = send(&app, get("/status?events=1")).await;
    let events = body["events"].as_array().unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0]["event_type"], "start");

    let (status, _) = send(&app, get("/control/start")).await;
    assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);

    harness.cleanup().await;
}

#[tokio::test]
async fn test_webhook_requires_token() {
    let harness = Harness::new("warden-server").await;
    harness
        .fetcher
        .fail_with(Some(FetchError::Network("registry offline".to_string())));
    let (app, _) = app(&harness, Some("hook-secret")).await;

    let (status, _) = send(&app, post("/webhook")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let request = Request::post("/webhook")
        .header(WEBHOOK_TOKEN_HEADER, "wrong")
        .body(Body::empty())
        .unwrap();
    let (status, _) = send(&app, request).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert!(harness.surface.journal().is_empty());

    let request = Request::post("/webhook")
        .header(WEBHOOK_TOKEN_HEADER, "hook-secret")
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(&app, request).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["accepted"], true);

    // the redeploy runs in the background
    let mut recorded = Vec::new();
    for _ in 0..50 {
        recorded = harness.surface.journal().recent(10);
        if !recorded.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(recorded.len(), 1);
    assert_eq!(recorded[0].event_type, EventType::Rebuild);
    assert_eq!(recorded[0].outcome, Outcome::Failure);
    assert!(recorded[0].detail.starts_with("webhook"));
    assert!(recorded[0].detail.contains("registry offline"));

    harness.cleanup().await;
}

#[tokio::test]
async fn test_logs_pagination_and_range() {
    let harness = Harness::new("warden-server").await;
    let (app, logs) = app(&harness, None).await;

    let records = (0..5)
        .map(|i| LogRecord {
            timestamp: Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, i).unwrap(),
            stream: if i % 2 == 0 { LogStream::Stdout } else { LogStream::Stderr },
            severity: Severity::Info,
            message: format!("line {}", i),
        })
        .collect();
    logs.commit("stdout", records, SourceCursor::Offset { offset: 35, file_id: None });

    let (status, body) = send(&app, get("/logs?per_page=2&page=2")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total"], 5);
    assert_eq!(body["total_pages"], 3);
    let messages: Vec<&str> = body["entries"]
        .as_array()
        .unwrap()
        .iter()
        .map(|e| e["message"].as_str().unwrap())
        .collect();
    assert_eq!(messages, vec!["line 2", "line 3"]);

    let (_, body) = send(
        &app,
        get("/logs?from=2026-03-01T12:00:01Z&to=2026-03-01T12:00:03Z"),
    )
    .await;
    assert_eq!(body["total"], 2);

    let (_, body) = send(&app, get("/logs?stream=stderr")).await;
    assert_eq!(body["total"], 2);

    let (status, _) = send(&app, get("/logs?from=yesterday")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    harness.cleanup().await;
}
