//! Fast CLI tests using assert_cmd.
//! These test the binary directly without needing a Docker engine.

#![allow(deprecated)] // assert_cmd::Command::cargo_bin is deprecated but works fine

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

/// The binary with config and data directories isolated in `tmp`
fn devlaunch(tmp: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("devlaunch").unwrap();
    cmd.env("DEVLAUNCH_CONFIG_DIR", tmp.path().join("config"))
        .env("DEVLAUNCH_DATA_DIR", tmp.path().join("data"))
        .env_remove("DEVLAUNCH_PASSWORD");
    cmd
}

#[test]
fn test_help_flag() {
    let tmp = TempDir::new().unwrap();
    devlaunch(&tmp)
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Remote Environment Orchestrator"));
}

#[test]
fn test_version_flag() {
    let tmp = TempDir::new().unwrap();
    devlaunch(&tmp).arg("--version").assert().success();
}

#[test]
fn test_subcommand_help() {
    let tmp = TempDir::new().unwrap();
    for subcmd in &["start", "stop", "status", "repos", "config"] {
        devlaunch(&tmp)
            .args([subcmd, "--help"])
            .assert()
            .success()
            .stdout(predicate::str::is_empty().not());
    }
}

#[test]
fn test_unknown_subcommand_fails() {
    let tmp = TempDir::new().unwrap();
    devlaunch(&tmp)
        .arg("nonexistent-subcommand")
        .assert()
        .failure();
}

#[test]
fn test_config_shows_defaults() {
    let tmp = TempDir::new().unwrap();
    devlaunch(&tmp)
        .arg("config")
        .assert()
        .success()
        .stdout(predicate::str::contains("not created yet"))
        .stdout(predicate::str::contains("[docker]"))
        .stdout(predicate::str::contains("default_port = 8788"));
}

#[test]
fn test_config_reads_explicit_file() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("custom.toml");
    std::fs::write(&path, "[remote]\nhost = \"10.0.0.5\"\ndefault_port = 9001\n").unwrap();
    devlaunch(&tmp)
        .args(["config", "--config"])
        .arg(&path)
        .assert()
        .success()
        .stdout(predicate::str::contains("host = \"10.0.0.5\""))
        .stdout(predicate::str::contains("default_port = 9001"));
}

#[test]
fn test_invalid_config_fails() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("broken.toml");
    std::fs::write(&path, "[docker\n").unwrap();
    devlaunch(&tmp)
        .args(["config", "--config"])
        .arg(&path)
        .assert()
        .failure()
        .stderr(predicate::str::starts_with("Error:"));
}

#[test]
fn test_start_requires_repository() {
    let tmp = TempDir::new().unwrap();
    devlaunch(&tmp)
        .args(["start", "--user", "alice", "--local"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("No repository given"));
}

#[test]
fn test_privileged_port_rejected() {
    let tmp = TempDir::new().unwrap();
    devlaunch(&tmp)
        .args(["start", "--repo", "Foo", "--port", "80"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("--port"));
}

#[test]
fn test_remote_and_local_conflict() {
    let tmp = TempDir::new().unwrap();
    devlaunch(&tmp)
        .args(["repos", "--remote", "10.0.0.5", "--local"])
        .assert()
        .failure();
}
