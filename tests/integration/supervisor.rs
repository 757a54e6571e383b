#[path = "common/mod.rs"]
mod common;

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use common::{StubHealthServer, is_process_alive, wait_for_process_exit};
use genworker::{
    config::ServiceSpec,
    error::WorkerError,
    probe::HealthProbe,
    process::{OsLauncher, ProcessState},
    supervisor::{ServiceSupervisor, SupervisorSettings},
};

fn supervisor() -> ServiceSupervisor {
    ServiceSupervisor::new(
        Arc::new(OsLauncher),
        Arc::new(HealthProbe::new().unwrap()),
        SupervisorSettings {
            poll_interval: Duration::from_millis(200),
            shutdown_grace: Duration::from_secs(2),
        },
    )
}

fn sleeper(name: &str, readiness_url: &str, startup_timeout: Duration) -> ServiceSpec {
    ServiceSpec::new(name, "sh", readiness_url)
        .with_args(["-c", "exec sleep 60"])
        .with_timeouts(startup_timeout, Duration::from_millis(500))
}

#[test]
fn startup_times_out_when_endpoint_is_late() {
    let endpoint = StubHealthServer::start(Duration::from_secs(3));
    let supervisor = supervisor();

    let started = Instant::now();
    let err = supervisor
        .start_all(&[sleeper("python", endpoint.url(), Duration::from_secs(1))])
        .unwrap_err();

    assert!(
        matches!(err, WorkerError::StartupTimeout { ref service, .. } if service == "python"),
        "unexpected error: {err:?}"
    );
    assert!(started.elapsed() < Duration::from_secs(3));
    assert!(supervisor.status().values().all(|running| !running));

    let pid = supervisor.process("python").unwrap().pid().unwrap();
    wait_for_process_exit(pid);
}

#[test]
fn startup_succeeds_soon_after_endpoint_turns_healthy() {
    let python = StubHealthServer::start(Duration::from_secs(1));
    let comfy = StubHealthServer::start(Duration::ZERO);
    let supervisor = supervisor();

    let started = Instant::now();
    supervisor
        .start_all(&[
            sleeper("python", python.url(), Duration::from_secs(5)),
            sleeper("comfyui", comfy.url(), Duration::from_secs(5)),
        ])
        .unwrap();
    let elapsed = started.elapsed();

    assert!(elapsed >= Duration::from_millis(800), "ready too early: {elapsed:?}");
    assert!(elapsed < Duration::from_secs(3), "ready too late: {elapsed:?}");
    assert!(python.requests() >= 2);

    let status = supervisor.status();
    assert_eq!(status.get("python"), Some(&true));
    assert_eq!(status.get("comfyui"), Some(&true));
    assert_eq!(
        supervisor.process("comfyui").unwrap().state(),
        ProcessState::Running
    );

    let health = supervisor.check_health().unwrap();
    assert!(health.values().all(|health| health.healthy));

    supervisor.shutdown_all(Duration::from_secs(2));
}

#[test]
fn shutdown_all_twice_stops_everything_once() {
    let endpoint = StubHealthServer::start(Duration::ZERO);
    let supervisor = supervisor();
    supervisor
        .start_all(&[sleeper("python", endpoint.url(), Duration::from_secs(5))])
        .unwrap();
    let process = supervisor.process("python").unwrap();
    let pid = process.pid().unwrap();
    assert!(is_process_alive(pid));

    supervisor.shutdown_all(Duration::from_secs(2));
    supervisor.shutdown_all(Duration::from_secs(2));

    assert_eq!(process.state(), ProcessState::Terminated);
    assert_eq!(supervisor.status().get("python"), Some(&false));
    wait_for_process_exit(pid);

    let health = supervisor.check_health().unwrap();
    assert!(!health["python"].healthy);
}

#[test]
fn crashing_service_fails_startup() {
    let endpoint = StubHealthServer::start(Duration::from_secs(30));
    let supervisor = supervisor();
    let spec = ServiceSpec::new("python", "sh", endpoint.url())
        .with_args(["-c", "sleep 0.3; exit 2"])
        .with_timeouts(Duration::from_secs(20), Duration::from_millis(500));

    let started = Instant::now();
    let err = supervisor.start_all(&[spec]).unwrap_err();

    match err {
        WorkerError::ServiceExited { service, outcome } => {
            assert_eq!(service, "python");
            assert_eq!(outcome, "exit code 2");
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(started.elapsed() < Duration::from_secs(5));
}
