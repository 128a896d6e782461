//! Remote log collection against a stub application endpoint

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::{extract::Query, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use serde_json::{json, Value};
use url::Url;

use warden::collect::aggregator::LogAggregator;
use warden::collect::source::{FileTailSource, HttpLogSource, LogSource};
use warden::collect::store::{LogQuery, LogStore};
use warden::filesys::dir::Dir;
use warden::models::log_entry::{LogStream, Severity};

use crate::common::serve_stub;

#[derive(Clone, Default)]
struct StubState {
    since: Arc<Mutex<Vec<Option<String>>>>,
    failing: Arc<AtomicBool>,
}

fn remote_logs() -> Value {
    json!([
        {"timestamp": "2026-01-01T10:00:00Z", "level": "info", "message": "booted"},
        {"timestamp": "2026-01-01T10:00:05Z", "level": "WARN", "message": "cache cold"},
        {"timestamp": "2026-01-01T10:00:05Z", "message": "ERROR lost connection"},
    ])
}

async fn stub_endpoint(state: StubState, wrapped: bool) -> Url {
    let router = Router::new().route(
        "/logs",
        get(move |Query(params): Query<HashMap<String, String>>| {
            let state = state.clone();
            async move {
                state.since.lock().unwrap().push(params.get("since").cloned());
                if state.failing.load(Ordering::SeqCst) {
                    return (StatusCode::INTERNAL_SERVER_ERROR, "boom").into_response();
                }
                // ignores `since` on purpose, like a naive application would
                let body = if wrapped {
                    json!({ "logs": remote_logs() })
                } else {
                    remote_logs()
                };
                Json(body).into_response()
            }
        }),
    );
    let addr = serve_stub(router).await;
    Url::parse(&format!("http://{}/logs", addr)).unwrap()
}

async fn aggregator(dir: &Dir, url: Url) -> LogAggregator {
    let store = Arc::new(LogStore::open(dir.file("logs.json"), 100).await.unwrap());
    let source: Arc<dyn LogSource> =
        Arc::new(HttpLogSource::new(url, Duration::from_secs(2)).unwrap());
    LogAggregator::new(vec![source], store)
}

#[tokio::test]
async fn test_repeated_polls_do_not_duplicate() {
    let state = StubState::default();
    let url = stub_endpoint(state.clone(), false).await;
    let dir = Dir::create_temp_dir("warden-logs").await.unwrap();
    let aggregator = aggregator(&dir, url).await;

    let first = aggregator.poll().await.unwrap();
    assert_eq!(first.len(), 3);
    let second = aggregator.poll().await.unwrap();
    assert!(second.is_empty());
    assert_eq!(aggregator.store().len(), 3);

    let page = aggregator.store().query(&LogQuery::default());
    let severities: Vec<Severity> = page.entries.iter().map(|e| e.severity).collect();
    assert_eq!(severities, vec![Severity::Info, Severity::Warn, Severity::Error]);
    assert!(page.entries.iter().all(|e| e.stream == LogStream::Remote));

    let since = state.since.lock().unwrap().clone();
    assert_eq!(since.len(), 2);
    assert_eq!(since[0], None);
    assert!(since[1].as_deref().unwrap().starts_with("2026-01-01T10:00:05"));

    dir.delete().await.unwrap();
}

#[tokio::test]
async fn test_wrapped_payload_is_accepted() {
    let url = stub_endpoint(StubState::default(), true).await;
    let dir = Dir::create_temp_dir("warden-logs").await.unwrap();
    let aggregator = aggregator(&dir, url).await;

    assert_eq!(aggregator.poll().await.unwrap().len(), 3);
    dir.delete().await.unwrap();
}

#[tokio::test]
async fn test_failing_endpoint_keeps_existing_entries() {
    let state = StubState::default();
    let url = stub_endpoint(state.clone(), false).await;
    let dir = Dir::create_temp_dir("warden-logs").await.unwrap();
    let aggregator = aggregator(&dir, url).await;

    aggregator.poll().await.unwrap();
    state.failing.store(true, Ordering::SeqCst);

    assert!(aggregator.poll().await.is_err());
    assert_eq!(aggregator.store().len(), 3);

    // recovers without replaying what it already has
    state.failing.store(false, Ordering::SeqCst);
    assert!(aggregator.poll().await.unwrap().is_empty());
    dir.delete().await.unwrap();
}

#[tokio::test]
async fn test_one_failing_source_does_not_fail_the_poll() {
    let state = StubState {
        failing: Arc::new(AtomicBool::new(true)),
        ..Default::default()
    };
    let url = stub_endpoint(state, false).await;
    let dir = Dir::create_temp_dir("warden-logs").await.unwrap();
    dir.file("service.out.log")
        .write_atomic(b"started\nERROR bad config\n")
        .await
        .unwrap();

    let store = Arc::new(LogStore::open(dir.file("logs.json"), 100).await.unwrap());
    let sources: Vec<Arc<dyn LogSource>> = vec![
        Arc::new(FileTailSource::new(LogStream::Stdout, dir.file("service.out.log"))),
        Arc::new(HttpLogSource::new(url, Duration::from_secs(2)).unwrap()),
    ];
    let aggregator = LogAggregator::new(sources, store);

    let added = aggregator.poll().await.unwrap();
    assert_eq!(added.len(), 2);
    assert_eq!(added[1].severity, Severity::Error);

    // the snapshot survives a reopen
    let reopened = LogStore::open(dir.file("logs.json"), 100).await.unwrap();
    assert_eq!(reopened.len(), 2);
    dir.delete().await.unwrap();
}

#[cfg(unix)]
mod rotation {
    use super::*;

    use chrono::Utc;
    use warden::deploy::identity::IdentityRecord;
    use warden::deploy::supervisor::{OutputFiles, ProcessSupervisor, SupervisorOptions};
    use warden::models::artifact::DeploymentArtifact;

    async fn artifact_printing(dir: &Dir, version: &str, text: &str) -> DeploymentArtifact {
        let file = dir.subdir(version).file("banner.txt");
        file.write_atomic(text.as_bytes()).await.unwrap();
        DeploymentArtifact {
            version: version.to_string(),
            source: "test".to_string(),
            path: file.path().to_path_buf(),
            sha256: String::new(),
            fetched_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_lines_written_before_rotation_are_kept() {
        let dir = Dir::create_temp_dir("warden-logs").await.unwrap();
        let supervisor = ProcessSupervisor::new(
            SupervisorOptions {
                command: "sh".to_string(),
                args: vec!["-c".to_string(), "cat '{artifact}'; exec sleep 30".to_string()],
                stop_timeout: Duration::from_secs(2),
                startup_grace: Duration::from_millis(200),
                max_output_bytes: 8,
                ..Default::default()
            },
            IdentityRecord::new(dir.file("identity.json")),
            OutputFiles {
                stdout: dir.file("service.out.log"),
                stderr: dir.file("service.err.log"),
            },
        );

        let store = Arc::new(LogStore::open(dir.file("logs.json"), 100).await.unwrap());
        let source: Arc<dyn LogSource> = Arc::new(FileTailSource::new(
            LogStream::Stdout,
            dir.file("service.out.log"),
        ));
        let aggregator = LogAggregator::new(vec![source], store.clone());

        let first = artifact_printing(&dir.subdir("artifacts"), "v1", "first run\n").await;
        supervisor.start(&first).await.unwrap();
        assert_eq!(aggregator.poll().await.unwrap().len(), 1);

        // output of the old process that no poll has seen yet
        let mut out = tokio::fs::OpenOptions::new()
            .append(true)
            .open(dir.file("service.out.log").path())
            .await
            .unwrap();
        tokio::io::AsyncWriteExt::write_all(&mut out, b"shutting down\n")
            .await
            .unwrap();
        drop(out);
        supervisor.stop().await.unwrap();

        let second = artifact_printing(&dir.subdir("artifacts"), "v2", "second run\n").await;
        supervisor.start(&second).await.unwrap();
        assert!(dir.file("service.out.log.1").exists().await);

        aggregator.poll().await.unwrap();
        aggregator.poll().await.unwrap();
        let messages: Vec<String> = store
            .query(&LogQuery::default())
            .entries
            .into_iter()
            .map(|e| e.message)
            .collect();
        assert_eq!(messages, vec!["first run", "shutting down", "second run"]);

        supervisor.stop().await.unwrap();
        dir.delete().await.unwrap();
    }
}
