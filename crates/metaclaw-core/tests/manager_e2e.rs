//! Container-backed lifecycle scenarios.
//!
//! These need a working podman or docker install plus image pulls, so
//! they are ignored by default; run them with `cargo test -- --ignored`
//! on a host with a container runtime.

use std::fs;
use std::path::{Path, PathBuf};

use metaclaw_core::manager::{Manager, RunOptions};
use metaclaw_core::runtime::{Adapter, Resolver};
use metaclaw_core::store::RunStatus;

const IMAGE: &str =
    "alpine:3.20@sha256:77726ef25f24bcc9d8e059309a8929574b2f13f0707cde656d2d7b82f83049c4";

fn backend_name() -> Option<String> {
    Resolver::new()
        .resolve(None, None)
        .ok()
        .map(|adapter| adapter.name().to_string())
}

fn write_clawfile(dir: &Path, lifecycle: &str, command: &str) -> PathBuf {
    let body = format!(
        "\
apiVersion: metaclaw/v1
kind: Agent
agent:
  name: e2e-agent
  species: nano
  lifecycle: {lifecycle}
  habitat:
    network:
      mode: none
  runtime:
    image: {IMAGE}
  command:
    - sh
    - -lc
    - {command}
"
    );
    let path = dir.join("agent.claw");
    fs::write(&path, body).unwrap();
    path
}

#[test]
#[ignore = "requires a container runtime and image pulls"]
fn ephemeral_run_succeeds_and_captures_stdout() {
    let Some(_backend) = backend_name() else {
        eprintln!("no container runtime installed; nothing to exercise");
        return;
    };
    let dir = tempfile::tempdir().unwrap();
    let clawfile = write_clawfile(dir.path(), "ephemeral", "echo E2E_OK");
    let manager = Manager::open(&dir.path().join(".metaclaw")).unwrap();

    let record = manager
        .run(&RunOptions {
            input_path: clawfile,
            ..Default::default()
        })
        .unwrap();
    assert_eq!(record.status, RunStatus::Succeeded);
    assert_eq!(record.exit_code, Some(0));

    let stdout = fs::read_to_string(manager.run_log_path(&record.run_id, "stdout.log")).unwrap();
    assert!(stdout.contains("E2E_OK"), "stdout was {stdout:?}");

    let events = manager.read_events(&record.run_id).unwrap();
    assert!(events.iter().any(|e| e.contains("runtime.resolve")));
    assert!(events.iter().any(|e| e.contains("runtime.exit")));
}

#[test]
#[ignore = "requires a container runtime and image pulls"]
fn detached_run_reports_running_with_container_id() {
    let Some(_backend) = backend_name() else {
        eprintln!("no container runtime installed; nothing to exercise");
        return;
    };
    let dir = tempfile::tempdir().unwrap();
    let clawfile = write_clawfile(dir.path(), "ephemeral", "sleep 30");
    let manager = Manager::open(&dir.path().join(".metaclaw")).unwrap();

    let record = manager
        .run(&RunOptions {
            input_path: clawfile,
            detach: true,
            ..Default::default()
        })
        .unwrap();
    assert_eq!(record.status, RunStatus::Running);
    assert!(!record.container_id.is_empty());

    // The container keeps running until we remove it; ps-style reads keep
    // reconciling it as non-terminal in the meantime.
    let listed = manager.list_runs(10).unwrap();
    assert_eq!(listed[0].run_id, record.run_id);

    let adapter = Resolver::new()
        .adapter(record.runtime_target.parse().unwrap())
        .unwrap()
        .clone();
    adapter.remove(&record.container_id).unwrap();
}

#[test]
#[ignore = "requires a container runtime and image pulls"]
fn debug_lifecycle_preserves_failed_container() {
    let Some(_backend) = backend_name() else {
        eprintln!("no container runtime installed; nothing to exercise");
        return;
    };
    let dir = tempfile::tempdir().unwrap();
    let clawfile = write_clawfile(dir.path(), "debug", "echo X && exit 17");
    let manager = Manager::open(&dir.path().join(".metaclaw")).unwrap();

    let record = manager
        .run(&RunOptions {
            input_path: clawfile,
            ..Default::default()
        })
        .unwrap();
    assert_eq!(record.status, RunStatus::FailedPaused);
    assert_eq!(record.exit_code, Some(17));

    let events = manager.read_events(&record.run_id).unwrap();
    assert!(events.iter().any(|e| e.contains("runtime.pause")));

    // Clean the preserved container up ourselves.
    let adapter = Resolver::new()
        .adapter(record.runtime_target.parse().unwrap())
        .unwrap()
        .clone();
    adapter.remove(&record.container_id).unwrap();
}
