#[path = "common/mod.rs"]
mod common;

use std::{sync::Arc, time::{Duration, Instant}};

use common::{is_process_alive, wait_for_process_exit};
use genworker::{
    config::ServiceSpec,
    error::WorkerError,
    process::{ManagedProcess, OsLauncher, ProcessState},
};
use tempfile::tempdir;

fn shell_spec(name: &str, script: &str) -> ServiceSpec {
    ServiceSpec::new(name, "sh", "http://127.0.0.1:9/unused").with_args(["-c", script])
}

#[test]
fn second_start_is_rejected_while_alive() {
    let process = ManagedProcess::new("sleeper", Arc::new(OsLauncher));
    let spec = shell_spec("sleeper", "sleep 30");

    process.start(&spec).unwrap();
    let pid = process.pid().unwrap();
    let err = process.start(&spec).unwrap_err();

    assert!(matches!(err, WorkerError::AlreadyRunning { .. }));
    assert_eq!(process.pid(), Some(pid));
    assert!(is_process_alive(pid));

    process.terminate(Duration::from_secs(2)).unwrap();
    wait_for_process_exit(pid);
    assert_eq!(process.state(), ProcessState::Terminated);
}

#[test]
fn graceful_exit_within_grace_period() {
    let process = ManagedProcess::new("sleeper", Arc::new(OsLauncher));
    process.start(&shell_spec("sleeper", "exec sleep 30")).unwrap();
    let pid = process.pid().unwrap();

    let started = Instant::now();
    process.terminate(Duration::from_secs(5)).unwrap();

    assert!(started.elapsed() < Duration::from_secs(3));
    assert_eq!(process.state(), ProcessState::Terminated);
    assert_eq!(process.last_exit().and_then(|outcome| outcome.signal), Some(15));
    assert!(!is_process_alive(pid));
}

#[test]
fn sigterm_ignoring_child_is_killed_after_grace() {
    let process = ManagedProcess::new("stubborn", Arc::new(OsLauncher));
    process
        .start(&shell_spec(
            "stubborn",
            "trap '' TERM; while true; do sleep 0.1; done",
        ))
        .unwrap();
    let pid = process.pid().unwrap();
    // Give the shell time to install its trap.
    std::thread::sleep(Duration::from_millis(300));

    let grace = Duration::from_millis(500);
    let started = Instant::now();
    process.terminate(grace).unwrap();
    assert!(started.elapsed() >= grace);

    let outcome = process
        .wait_for_exit(Duration::from_secs(5))
        .expect("child should die after SIGKILL");
    assert_eq!(outcome.signal, Some(9));
    assert_eq!(process.state(), ProcessState::Terminated);
    wait_for_process_exit(pid);
}

#[test]
fn exit_code_is_observed_without_terminate() {
    let process = ManagedProcess::new("short", Arc::new(OsLauncher));
    process.start(&shell_spec("short", "exit 3")).unwrap();

    let outcome = process.wait_for_exit(Duration::from_secs(5)).unwrap();

    assert_eq!(outcome.code, Some(3));
    assert!(!outcome.success());
    assert_eq!(process.state(), ProcessState::Exited);
    assert!(!process.is_running());

    // Nothing left to stop.
    process.terminate(Duration::from_millis(100)).unwrap();
    assert_eq!(process.state(), ProcessState::Exited);
}

#[test]
fn working_dir_and_env_reach_the_child() {
    let dir = tempdir().unwrap();
    let mut spec = shell_spec("writer", "printf '%s' \"$GREETING\" > out.txt")
        .with_working_dir(dir.path());
    spec.env = vec![("GREETING".into(), "hello".into())];
    let process = ManagedProcess::new("writer", Arc::new(OsLauncher));

    process.start(&spec).unwrap();
    let outcome = process.wait_for_exit(Duration::from_secs(5)).unwrap();

    assert!(outcome.success());
    assert_eq!(
        std::fs::read_to_string(dir.path().join("out.txt")).unwrap(),
        "hello"
    );
}

#[test]
fn missing_executable_fails_to_start() {
    let process = ManagedProcess::new("ghost", Arc::new(OsLauncher));
    let spec = ServiceSpec::new("ghost", "/nonexistent/binary", "http://127.0.0.1:9/");

    let err = process.start(&spec).unwrap_err();

    assert!(matches!(err, WorkerError::ServiceStartError { .. }));
    assert_eq!(process.state(), ProcessState::Idle);
}
