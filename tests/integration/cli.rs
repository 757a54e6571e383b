#[path = "common/mod.rs"]
mod common;

use assert_cmd::Command;
use common::{StubHealthServer, is_process_alive, wait_for_process_exit};
use nix::{
    sys::signal::{Signal, kill},
    unistd::Pid,
};
use predicates::boolean::PredicateBooleanExt;
use predicates::str::{contains, ends_with};
use std::{
    fs, thread,
    time::{Duration, Instant},
};
use tempfile::tempdir;

fn genworker() -> Command {
    Command::new(assert_cmd::cargo::cargo_bin!("genworker"))
}

fn write_directory_config(dir: &std::path::Path) {
    fs::write(
        dir.join("genworker.yaml"),
        r#"
version: "1"
services: {}
object_store:
  kind: directory
  root: "${BUCKET_DIR:-bucket}"
assets:
  input_dir: "input"
"#,
    )
    .unwrap();
}

#[test]
fn help_lists_commands() {
    genworker()
        .arg("--help")
        .assert()
        .success()
        .stdout(contains("run").and(contains("relay")));
}

#[test]
fn relay_prints_the_provisioned_name() {
    let temp = tempdir().unwrap();
    let dir = temp.path();
    fs::create_dir_all(dir.join("bucket/users/u1/images")).unwrap();
    fs::write(dir.join("bucket/users/u1/images/face.webp"), b"webp").unwrap();
    write_directory_config(dir);

    let assert = genworker()
        .current_dir(dir)
        .env_remove("BUCKET_DIR")
        .args([
            "relay",
            "--uid",
            "u1",
            "--file-name",
            "face.webp",
            "--task-type",
            "img2vid",
        ])
        .assert()
        .success()
        .stdout(ends_with(".webp\n"));

    let name = String::from_utf8(assert.get_output().stdout.clone()).unwrap();
    assert_eq!(
        fs::read(dir.join("input").join(name.trim())).unwrap(),
        b"webp"
    );
}

#[test]
fn relay_rejects_unknown_task_type() {
    let temp = tempdir().unwrap();
    write_directory_config(temp.path());

    genworker()
        .current_dir(temp.path())
        .args([
            "relay",
            "--uid",
            "u1",
            "--file-name",
            "face.webp",
            "--task-type",
            "upscale",
        ])
        .assert()
        .failure()
        .stderr(contains("upscale"));
}

#[test]
fn run_fails_when_a_service_cannot_start() {
    let temp = tempdir().unwrap();
    fs::write(
        temp.path().join("genworker.yaml"),
        r#"
version: "1"
server:
  port: 0
services:
  python:
    executable: "/nonexistent/python"
    url: "http://127.0.0.1:9"
    readiness_url: "http://127.0.0.1:9/health"
    startup_timeout: "2s"
object_store:
  kind: directory
  root: "."
"#,
    )
    .unwrap();

    genworker()
        .current_dir(temp.path())
        .arg("run")
        .timeout(std::time::Duration::from_secs(30))
        .assert()
        .failure()
        .stderr(contains("python"));
}

#[test]
fn sigterm_stops_children_and_exits_cleanly() {
    let temp = tempdir().unwrap();
    let dir = temp.path();
    let stub = StubHealthServer::start(Duration::ZERO);
    fs::write(
        dir.join("genworker.yaml"),
        format!(
            r#"
version: "1"
server:
  port: 0
shutdown_grace: "2s"
readiness_poll_interval: "100ms"
services:
  python:
    executable: "sh"
    args: ["-c", "echo $$ > child.pid; exec sleep 60"]
    url: "{url}"
    readiness_url: "{url}"
    startup_timeout: "10s"
object_store:
  kind: directory
  root: "."
"#,
            url = stub.url()
        ),
    )
    .unwrap();

    let mut worker = std::process::Command::new(assert_cmd::cargo::cargo_bin!("genworker"))
        .current_dir(dir)
        .arg("run")
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .spawn()
        .unwrap();

    let pid_file = dir.join("child.pid");
    let deadline = Instant::now() + Duration::from_secs(10);
    let child_pid = loop {
        let pid = fs::read_to_string(&pid_file)
            .ok()
            .and_then(|contents| contents.trim().parse::<u32>().ok());
        match pid {
            Some(pid) if stub.requests() > 0 => break pid,
            _ => {}
        }
        assert!(Instant::now() < deadline, "service never became ready");
        thread::sleep(Duration::from_millis(50));
    };
    thread::sleep(Duration::from_millis(300));
    assert!(is_process_alive(child_pid));

    kill(Pid::from_raw(worker.id() as i32), Signal::SIGTERM).unwrap();

    let deadline = Instant::now() + Duration::from_secs(15);
    let status = loop {
        if let Some(status) = worker.try_wait().unwrap() {
            break status;
        }
        if Instant::now() >= deadline {
            let _ = worker.kill();
            panic!("genworker did not exit after SIGTERM");
        }
        thread::sleep(Duration::from_millis(50));
    };

    assert_eq!(status.code(), Some(0));
    wait_for_process_exit(child_pid);
}
