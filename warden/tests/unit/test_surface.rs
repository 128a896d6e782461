//! Control surface behavior over real `sleep` processes

use std::time::Duration;

use futures::future::join;

use warden::control::surface::SurfaceOptions;
use warden::deploy::fsm::ServiceState;
use warden::errors::FetchError;
use warden::models::artifact::TriggerSource;
use warden::models::event::{EventType, Outcome};
use warden::filesys::dir::Dir;
use warden::models::status::{Freshness, Operation, OutcomeKind};

use crate::common::{checking_supervisor, fake_artifact, kill_pid, Harness};

async fn running_pid(harness: &Harness) -> u32 {
    harness
        .supervisor
        .identity()
        .await
        .unwrap()
        .expect("identity recorded")
        .pid
}

#[tokio::test]
async fn test_start_records_one_event() {
    let harness = Harness::with_artifact("warden-surface").await;

    let outcome = harness.surface.request_start().await;
    assert!(outcome.success, "{}", outcome.detail);
    assert_eq!(outcome.operation, Operation::Start);
    assert_eq!(outcome.state, ServiceState::Running);
    assert_eq!(outcome.event.event_type, EventType::Start);
    assert_eq!(outcome.event.outcome, Outcome::Success);
    assert!(harness.surface.is_running().await);

    let status = harness.surface.status(10);
    assert_eq!(status.events.len(), 1);
    assert_eq!(status.process.map(|p| p.artifact_version), Some("v1".to_string()));
    assert!(status.in_flight.is_none());

    harness.cleanup().await;
}

#[tokio::test]
async fn test_start_without_artifact_fails() {
    let harness = Harness::new("warden-surface").await;

    let outcome = harness.surface.request_start().await;
    assert!(!outcome.success);
    assert_eq!(outcome.outcome, OutcomeKind::Failed);
    assert_eq!(outcome.event.outcome, Outcome::Failure);
    assert_eq!(harness.surface.state(), ServiceState::Stopped);
    assert!(!harness.surface.is_running().await);

    harness.cleanup().await;
}

#[tokio::test]
async fn test_double_start_is_rejected() {
    let harness = Harness::with_artifact("warden-surface").await;
    assert!(harness.surface.request_start().await.success);
    let pid = running_pid(&harness).await;

    let outcome = harness.surface.request_start().await;
    assert_eq!(outcome.outcome, OutcomeKind::Rejected);
    assert!(!outcome.success);
    assert_eq!(outcome.state, ServiceState::Running);
    assert_eq!(running_pid(&harness).await, pid);
    assert_eq!(harness.surface.journal().len(), 2);

    harness.cleanup().await;
}

#[tokio::test]
async fn test_stop_is_idempotent() {
    let harness = Harness::with_artifact("warden-surface").await;
    assert!(harness.surface.request_start().await.success);

    let first = harness.surface.request_stop().await;
    assert!(first.success, "{}", first.detail);
    assert_eq!(first.state, ServiceState::Stopped);
    assert!(!harness.surface.is_running().await);

    let second = harness.surface.request_stop().await;
    assert!(second.success);
    assert_eq!(second.state, ServiceState::Stopped);
    assert_eq!(second.event.event_type, EventType::Stop);

    harness.cleanup().await;
}

#[tokio::test]
async fn test_failed_fetch_keeps_service_running() {
    let harness = Harness::with_artifact("warden-surface").await;
    assert!(harness.surface.request_start().await.success);
    let pid = running_pid(&harness).await;

    harness
        .fetcher
        .fail_with(Some(FetchError::Auth("token expired".to_string())));
    let outcome = harness.surface.request_redeploy(TriggerSource::Manual).await;

    assert!(!outcome.success);
    assert_eq!(outcome.event.event_type, EventType::Rebuild);
    assert!(outcome.detail.starts_with("manual:"));
    assert!(outcome.detail.contains("token expired"));
    assert_eq!(harness.surface.state(), ServiceState::Running);
    assert_eq!(running_pid(&harness).await, pid);

    harness.cleanup().await;
}

#[tokio::test]
async fn test_redeploy_replaces_process() {
    let harness = Harness::with_artifact("warden-surface").await;
    assert!(harness.surface.request_start().await.success);
    let old_pid = running_pid(&harness).await;

    harness.fetcher.set_version("v2");
    let outcome = harness.surface.request_redeploy(TriggerSource::Manual).await;
    assert!(outcome.success, "{}", outcome.detail);
    assert_eq!(outcome.state, ServiceState::Running);

    let identity = harness.supervisor.identity().await.unwrap().unwrap();
    assert_ne!(identity.pid, old_pid);
    assert_eq!(identity.artifact_version, "v2");
    assert_eq!(
        harness.surface.current_artifact().map(|a| a.version),
        Some("v2".to_string())
    );

    // one event per operation
    let events = harness.surface.journal().recent(10);
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].event_type, EventType::Rebuild);

    harness.cleanup().await;
}

#[tokio::test]
async fn test_concurrent_operation_is_rejected() {
    let harness = Harness::with_artifact("warden-surface").await;
    harness.fetcher.set_delay(Duration::from_millis(500));

    let surface = harness.surface.clone();
    let redeploy = async move { surface.request_redeploy(TriggerSource::Manual).await };
    let stop = async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        harness.surface.request_stop().await
    };
    let (redeployed, stopped) = join(redeploy, stop).await;

    assert!(redeployed.success, "{}", redeployed.detail);
    assert_eq!(stopped.outcome, OutcomeKind::Rejected);
    assert!(stopped.detail.contains("redeploy"));
    assert_eq!(harness.surface.state(), ServiceState::Running);
    assert_eq!(harness.surface.journal().len(), 2);

    harness.cleanup().await;
}

#[tokio::test]
async fn test_fetch_timeout_does_not_fail_service() {
    let dir = warden::filesys::dir::Dir::create_temp_dir("warden-surface")
        .await
        .unwrap();
    let harness = Harness::in_dir(
        dir,
        SurfaceOptions {
            redeploy_timeout: Duration::from_millis(200),
            health_interval: Duration::from_secs(1),
        },
    )
    .await;
    harness.fetcher.set_delay(Duration::from_secs(2));

    let outcome = harness.surface.request_redeploy(TriggerSource::Poll).await;
    assert!(!outcome.success);
    assert_eq!(outcome.outcome, OutcomeKind::Failed);
    assert_eq!(harness.surface.state(), ServiceState::Stopped);

    harness.cleanup().await;
}

#[tokio::test]
async fn test_crash_is_detected_by_health_check() {
    let harness = Harness::with_artifact("warden-surface").await;
    assert!(harness.surface.request_start().await.success);
    let pid = running_pid(&harness).await;

    let report = harness.surface.check_health().await.unwrap();
    assert!(report.is_healthy());
    assert_eq!(harness.surface.journal().len(), 2);

    kill_pid(pid);
    tokio::time::sleep(Duration::from_millis(200)).await;

    let report = harness.surface.check_health().await.unwrap();
    assert!(!report.process_alive());
    assert_eq!(harness.surface.state(), ServiceState::Stopped);

    let latest = &harness.surface.journal().recent(1)[0];
    assert_eq!(latest.event_type, EventType::Health);
    assert_eq!(latest.outcome, Outcome::Failure);

    // a stopped service is checked without recording anything
    harness.surface.check_health().await.unwrap();
    assert_eq!(harness.surface.journal().len(), 3);

    harness.cleanup().await;
}

#[tokio::test]
async fn test_unreadable_identity_requires_reconcile() {
    let harness = Harness::with_artifact("warden-surface").await;
    assert!(harness.surface.request_start().await.success);
    let pid = running_pid(&harness).await;

    harness
        .dir
        .file("identity.json")
        .write_atomic(b"{ not json")
        .await
        .unwrap();

    harness.surface.check_health().await.unwrap();
    assert_eq!(harness.surface.state(), ServiceState::Failed);

    let start = harness.surface.request_start().await;
    assert_eq!(start.outcome, OutcomeKind::Rejected);
    let stop = harness.surface.request_stop().await;
    assert_eq!(stop.outcome, OutcomeKind::Rejected);

    let reconciled = harness.surface.reconcile().await;
    assert!(reconciled.success, "{}", reconciled.detail);
    assert_eq!(reconciled.event.event_type, EventType::Reconcile);
    assert_eq!(harness.surface.state(), ServiceState::Stopped);

    kill_pid(pid);
    harness.cleanup().await;
}

#[tokio::test]
async fn test_reconcile_adopts_running_process() {
    let first = Harness::with_artifact("warden-surface").await;
    assert!(first.surface.request_start().await.success);
    let pid = running_pid(&first).await;

    // a restarted controller over the same state directory
    let second = Harness::in_dir(
        first.dir.clone(),
        SurfaceOptions {
            redeploy_timeout: Duration::from_secs(10),
            health_interval: Duration::from_secs(1),
        },
    )
    .await;
    assert_eq!(second.surface.state(), ServiceState::Stopped);

    let outcome = second.surface.reconcile().await;
    assert!(outcome.success, "{}", outcome.detail);
    assert_eq!(second.surface.state(), ServiceState::Running);
    assert_eq!(second.surface.status(0).process.map(|p| p.pid), Some(pid));

    let stopped = second.surface.request_stop().await;
    assert!(stopped.success, "{}", stopped.detail);
    assert!(!first.supervisor.is_running().await);

    first.cleanup().await;
}

#[tokio::test]
async fn test_check_for_update() {
    let harness = Harness::with_artifact("warden-surface").await;
    assert!(harness.surface.request_start().await.success);

    assert!(harness.surface.check_for_update().await.unwrap().is_none());
    assert_eq!(harness.fetcher.fetch_count(), 0);

    harness.fetcher.set_version("v2");
    let outcome = harness.surface.check_for_update().await.unwrap().unwrap();
    assert!(outcome.success, "{}", outcome.detail);
    assert!(outcome.detail.starts_with("poll:"));
    assert_eq!(harness.fetcher.fetch_count(), 1);

    harness
        .fetcher
        .fail_with(Some(FetchError::Network("offline".to_string())));
    assert!(harness.surface.check_for_update().await.is_err());

    harness.cleanup().await;
}

#[tokio::test]
async fn test_crash_found_by_operation_is_recorded() {
    let harness = Harness::with_artifact("warden-surface").await;
    assert!(harness.surface.request_start().await.success);
    let pid = running_pid(&harness).await;

    kill_pid(pid);
    tokio::time::sleep(Duration::from_millis(200)).await;

    let outcome = harness.surface.request_start().await;
    assert!(outcome.success, "{}", outcome.detail);
    assert!(outcome.detail.contains("exited unexpectedly"), "{}", outcome.detail);
    assert!(outcome.detail.contains("started v1"));
    assert_ne!(running_pid(&harness).await, pid);

    // still one event per operation
    assert_eq!(harness.surface.journal().len(), 2);

    harness.cleanup().await;
}

#[tokio::test]
async fn test_failed_start_of_new_version_is_retried() {
    let dir = Dir::create_temp_dir("warden-surface").await.unwrap();
    let current = fake_artifact(&dir.subdir("artifacts"), "v1").await;
    dir.file("artifact.json").write_json(&current).await.unwrap();
    let supervisor = checking_supervisor(&dir);
    let harness = Harness::with_supervisor(
        dir,
        supervisor,
        SurfaceOptions {
            redeploy_timeout: Duration::from_secs(10),
            health_interval: Duration::from_secs(1),
        },
    )
    .await;
    assert!(harness.surface.request_start().await.success);

    harness.fetcher.set_version("v2");
    harness.fetcher.set_broken(true);
    let outcome = harness.surface.check_for_update().await.unwrap().unwrap();
    assert!(!outcome.success);
    assert_eq!(
        harness.surface.current_artifact().map(|a| a.version),
        Some("v1".to_string())
    );

    // the broken build is not what a plain start runs
    let restarted = harness.surface.request_start().await;
    assert!(restarted.success, "{}", restarted.detail);
    assert_eq!(
        harness.supervisor.identity().await.unwrap().unwrap().artifact_version,
        "v1"
    );

    // a fixed build of the same version is picked up by the next check
    harness.fetcher.set_broken(false);
    let retried = harness.surface.check_for_update().await.unwrap().unwrap();
    assert!(retried.success, "{}", retried.detail);
    assert_eq!(
        harness.surface.current_artifact().map(|a| a.version),
        Some("v2".to_string())
    );
    assert_eq!(harness.fetcher.fetch_count(), 2);

    harness.cleanup().await;
}

#[tokio::test]
async fn test_old_health_report_is_stale() {
    let dir = Dir::create_temp_dir("warden-surface").await.unwrap();
    let harness = Harness::in_dir(
        dir,
        SurfaceOptions {
            redeploy_timeout: Duration::from_secs(10),
            health_interval: Duration::from_millis(50),
        },
    )
    .await;
    assert_eq!(harness.surface.status(0).health.freshness, Freshness::Unknown);

    harness.surface.check_health().await.unwrap();
    assert_eq!(harness.surface.status(0).health.freshness, Freshness::Fresh);

    tokio::time::sleep(Duration::from_millis(300)).await;
    let status = harness.surface.status(0);
    assert_eq!(status.health.freshness, Freshness::Stale);
    assert!(status.health.report.is_some());

    harness.cleanup().await;
}
