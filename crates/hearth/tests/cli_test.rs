//! Integration tests for the `hearth` CLI binary.
//!
//! Config commands run against temporary files; store and shell commands
//! against snapshots written by the in-memory store.
#![allow(clippy::unwrap_used)]

use std::path::Path;

use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;

use hearth_core::storage::{DeviceRow, ParameterRow, PeerRow};
use hearth_core::{MemoryStore, ParameterSetType, Storage};

// ── Helpers ─────────────────────────────────────────────────────────

/// Build a [`Command`] for the `hearth` binary with env isolation.
///
/// Clears all `HEARTH_*` env vars and points config directories at a
/// nonexistent path so tests never touch the user's real configuration.
fn hearth_cmd() -> assert_cmd::Command {
    let mut cmd = cargo_bin_cmd!("hearth");
    cmd.env("HOME", "/tmp/hearth-cli-test-nonexistent")
        .env("XDG_CONFIG_HOME", "/tmp/hearth-cli-test-nonexistent")
        .env_remove("HEARTH_CONFIG")
        .env_remove("HEARTH_PIPELINE__CAPACITY")
        .env_remove("HEARTH_LOGGING__FORMAT")
        .env_remove("HEARTH_LOGGING__LEVEL")
        .env_remove("RUST_LOG");
    cmd
}

/// Concatenate stdout + stderr from a command output for flexible matching.
fn combined_output(output: &std::process::Output) -> String {
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    format!("{stdout}{stderr}")
}

/// Snapshot with one device and one peer; returns `(device_id, peer_id)`.
fn write_snapshot(path: &Path) -> (u64, u64) {
    let store = MemoryStore::new();
    let device_id = store
        .save_device(&DeviceRow {
            id: 0,
            family: 1,
            address: 0x1,
            serial: "CENTRAL001".into(),
            device_type: 0xFFFD,
        })
        .unwrap();
    let peer_id = store
        .save_peer(&PeerRow {
            id: 0,
            parent_id: device_id,
            address: 0x10,
            serial: "PEER000001".into(),
        })
        .unwrap();
    store
        .save_peer_parameter(&ParameterRow {
            row_id: None,
            peer_id,
            kind: ParameterSetType::Values,
            channel: 1,
            remote_address: 0,
            remote_channel: None,
            name: "STATE".into(),
            value: vec![0x01],
        })
        .unwrap();
    store.save_to(path).unwrap();
    (device_id, peer_id)
}

// ── Basic invocation ────────────────────────────────────────────────

#[test]
fn test_no_args_shows_help() {
    let output = hearth_cmd().output().unwrap();
    assert_eq!(output.status.code(), Some(2), "Expected exit code 2");
    let text = combined_output(&output);
    assert!(text.contains("Usage"), "Expected 'Usage' in output:\n{text}");
}

#[test]
fn test_help_lists_commands() {
    hearth_cmd().arg("--help").assert().success().stdout(
        predicate::str::contains("config")
            .and(predicate::str::contains("store"))
            .and(predicate::str::contains("shell")),
    );
}

// ── Config ──────────────────────────────────────────────────────────

#[test]
fn test_config_path_honours_flag() {
    hearth_cmd()
        .args(["config", "path", "--config", "/tmp/hearth-elsewhere.toml"])
        .assert()
        .success()
        .stdout(predicate::str::contains("/tmp/hearth-elsewhere.toml"));
}

#[test]
fn test_config_show_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.toml");
    hearth_cmd()
        .args(["config", "show", "--config"])
        .arg(&path)
        .assert()
        .success()
        .stdout(predicate::str::contains("capacity = 1000").and(predicate::str::contains("[logging]")));
}

#[test]
fn test_config_show_reads_environment() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.toml");
    hearth_cmd()
        .env("HEARTH_PIPELINE__CAPACITY", "42")
        .args(["config", "show", "-o", "json", "--config"])
        .arg(&path)
        .assert()
        .success()
        .stdout(predicate::str::contains("\"capacity\": 42"));
}

#[test]
fn test_config_init_refuses_to_overwrite() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("hearth").join("config.toml");

    hearth_cmd()
        .args(["config", "init", "--config"])
        .arg(&path)
        .assert()
        .success();
    assert!(path.is_file());

    let output = hearth_cmd()
        .args(["config", "init", "--config"])
        .arg(&path)
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(6));
    assert!(combined_output(&output).contains("--force"));

    hearth_cmd()
        .args(["config", "init", "--force", "--config"])
        .arg(&path)
        .assert()
        .success();
}

#[test]
fn test_invalid_config_is_a_usage_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.toml");
    std::fs::write(&path, "[pipeline]\ncapacity = 1\n").unwrap();

    let output = hearth_cmd()
        .args(["config", "show", "--config"])
        .arg(&path)
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(2));
    assert!(combined_output(&output).contains("pipeline.capacity"));
}

// ── Store ───────────────────────────────────────────────────────────

#[test]
fn test_store_summary_counts_rows() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("store.json");
    write_snapshot(&path);

    hearth_cmd()
        .args(["store", "summary"])
        .arg(&path)
        .assert()
        .success()
        .stdout(predicate::str::is_match(r"peers\s+1").unwrap())
        .stdout(predicate::str::is_match(r"parameters\s+1").unwrap());

    hearth_cmd()
        .args(["-o", "json", "store", "summary"])
        .arg(&path)
        .assert()
        .success()
        .stdout(predicate::str::contains("\"devices\": 1"));
}

#[test]
fn test_store_summary_missing_file() {
    let output = hearth_cmd()
        .args(["store", "summary", "/tmp/hearth-cli-test-nonexistent/store.json"])
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(4));
    assert!(combined_output(&output).contains("not found"));
}

// ── Shell ───────────────────────────────────────────────────────────

#[test]
fn test_shell_walks_device_and_peer() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("store.json");
    let (device_id, peer_id) = write_snapshot(&path);

    hearth_cmd()
        .arg("shell")
        .arg(&path)
        .arg("devices list")
        .arg(format!("devices select {device_id}"))
        .arg("peers list")
        .arg(format!("peers select {peer_id}"))
        .arg("values 1")
        .assert()
        .success()
        .stdout(
            predicate::str::contains("CENTRAL001")
                .and(predicate::str::contains("PEER000001"))
                .and(predicate::str::contains(format!("Peer with id {peer_id} selected.")))
                .and(predicate::str::contains("STATE"))
                .and(predicate::str::contains("01")),
        );
}

#[test]
fn test_shell_unknown_family_has_no_devices() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("store.json");
    write_snapshot(&path);

    hearth_cmd()
        .args(["shell", "--family", "9"])
        .arg(&path)
        .arg("devices list")
        .assert()
        .success()
        .stdout(predicate::str::contains("No devices."));
}
