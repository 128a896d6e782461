//! Service state machine tests

use warden::deploy::fsm::{ServiceEvent, ServiceFsm, ServiceState};
use warden::errors::WardenError;

#[test]
fn test_fsm_initial_state() {
    let fsm = ServiceFsm::new();
    assert_eq!(fsm.state(), ServiceState::Stopped);
    assert!(fsm.error().is_none());
    assert!(fsm.accepts_operations());
}

#[test]
fn test_fsm_start_stop_cycle() {
    let mut fsm = ServiceFsm::new();

    // Stopped -> Starting -> Running
    fsm.process(ServiceEvent::Start).unwrap();
    assert_eq!(fsm.state(), ServiceState::Starting);
    fsm.process(ServiceEvent::Started).unwrap();
    assert_eq!(fsm.state(), ServiceState::Running);

    // Running -> Stopping -> Stopped
    fsm.process(ServiceEvent::Stop).unwrap();
    assert_eq!(fsm.state(), ServiceState::Stopping);
    fsm.process(ServiceEvent::Stopped).unwrap();
    assert_eq!(fsm.state(), ServiceState::Stopped);
}

#[test]
fn test_fsm_clean_start_failure() {
    let mut fsm = ServiceFsm::new();

    fsm.process(ServiceEvent::Start).unwrap();
    fsm.process(ServiceEvent::StartFailed("binary missing".to_string()))
        .unwrap();

    assert_eq!(fsm.state(), ServiceState::Stopped);
    assert_eq!(fsm.error(), Some("binary missing"));
    assert!(fsm.accepts_operations());
}

#[test]
fn test_fsm_crash_path() {
    let mut fsm = ServiceFsm::new();
    fsm.process(ServiceEvent::Start).unwrap();
    fsm.process(ServiceEvent::Started).unwrap();

    fsm.process(ServiceEvent::Crash("exit status: 137".to_string()))
        .unwrap();
    assert_eq!(fsm.state(), ServiceState::Crashed);

    fsm.process(ServiceEvent::Stopped).unwrap();
    assert_eq!(fsm.state(), ServiceState::Stopped);
    // the crash stays visible until the next clean transition
    assert_eq!(fsm.error(), Some("exit status: 137"));

    fsm.process(ServiceEvent::Start).unwrap();
    fsm.process(ServiceEvent::Started).unwrap();
    assert!(fsm.error().is_none());
}

#[test]
fn test_fsm_failed_requires_reconcile() {
    let mut fsm = ServiceFsm::new();
    fsm.process(ServiceEvent::Start).unwrap();
    fsm.process(ServiceEvent::Fail("identity write failed".to_string()))
        .unwrap();

    assert_eq!(fsm.state(), ServiceState::Failed);
    assert!(!fsm.accepts_operations());
    assert!(matches!(
        fsm.process(ServiceEvent::Start),
        Err(WardenError::InvalidTransition(_))
    ));

    fsm.process(ServiceEvent::Reconciled { running: true })
        .unwrap();
    assert_eq!(fsm.state(), ServiceState::Running);
    assert!(fsm.error().is_none());
    assert!(fsm.accepts_operations());
}

#[test]
fn test_fsm_invalid_transition() {
    let mut fsm = ServiceFsm::new();

    // Cannot stop what never started
    assert!(fsm.process(ServiceEvent::Stop).is_err());
    assert!(fsm.process(ServiceEvent::Started).is_err());

    // Reconciliation is not accepted mid-operation
    fsm.process(ServiceEvent::Start).unwrap();
    assert!(fsm
        .process(ServiceEvent::Reconciled { running: false })
        .is_err());
    assert_eq!(fsm.state(), ServiceState::Starting);
}

#[test]
fn test_fsm_since_moves_on_transition() {
    let mut fsm = ServiceFsm::new();
    let created = fsm.since();

    std::thread::sleep(std::time::Duration::from_millis(5));
    fsm.process(ServiceEvent::Start).unwrap();
    assert!(fsm.since() > created);
}
