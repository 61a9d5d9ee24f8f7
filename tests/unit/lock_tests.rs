//! Single-instance lock token behaviour.

use botfleet::harness::lock::{read_pid, LockToken};
use botfleet::AppError;

#[test]
fn second_acquire_reports_existing_pid() {
    let dir = tempfile::tempdir().expect("tempdir");
    let token = LockToken::acquire(dir.path(), "testd").expect("first acquire");

    match LockToken::acquire(dir.path(), "testd") {
        Err(AppError::AlreadyRunning(pid)) => assert_eq!(pid, std::process::id()),
        other => panic!("expected AlreadyRunning, got {other:?}"),
    }

    drop(token);
    assert!(read_pid(dir.path(), "testd").is_none());
}

#[test]
fn release_allows_reacquire() {
    let dir = tempfile::tempdir().expect("tempdir");
    let token = LockToken::acquire(dir.path(), "testd").expect("first");
    drop(token);
    LockToken::acquire(dir.path(), "testd").expect("second acquire after release");
}

#[test]
fn different_daemon_names_do_not_contend() {
    let dir = tempfile::tempdir().expect("tempdir");
    let _slack = LockToken::acquire(dir.path(), "slack").expect("slack lock");
    let _meet = LockToken::acquire(dir.path(), "meet").expect("meet lock");

    assert_eq!(read_pid(dir.path(), "slack"), Some(std::process::id()));
    assert_eq!(read_pid(dir.path(), "meet"), Some(std::process::id()));
}
