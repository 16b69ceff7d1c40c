// file: tests/cli_test.rs
// version: 1.0.0
// guid: 9e285b17-3917-4dd9-862c-b3fdcb5766e0

//! Binary-level tests that never touch the running host

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

fn cli(dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("container-host-setup").unwrap();
    cmd.arg("--log-file").arg(dir.path().join("run.log"));
    cmd
}

#[test]
fn test_help_lists_subcommands() {
    let dir = TempDir::new().unwrap();
    cli(&dir)
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("setup"))
        .stdout(predicate::str::contains("check"))
        .stdout(predicate::str::contains("ports"));
}

#[test]
fn test_unattended_setup_without_admin_is_usage_error() {
    let dir = TempDir::new().unwrap();
    cli(&dir)
        .args(["setup", "--yes", "--dry-run", "--ports-file"])
        .arg(dir.path().join("ports.conf"))
        .assert()
        .code(2)
        .stderr(predicate::str::contains("admin"));
    assert!(!dir.path().join("ports.conf").exists());
}

#[test]
fn test_ports_list_shows_defaults() {
    let dir = TempDir::new().unwrap();
    cli(&dir)
        .args(["ports", "list", "--ports-file"])
        .arg(dir.path().join("ports.conf"))
        .assert()
        .success()
        .stdout(predicate::str::is_match(r"ssh\s+22\s").unwrap())
        .stdout(predicate::str::contains("kube-api"));
}

#[test]
fn test_ports_set_persists_assignment() {
    let dir = TempDir::new().unwrap();
    let ports_file = dir.path().join("ports.conf");
    cli(&dir)
        .args(["ports", "set", "ssh", "42222", "--ports-file"])
        .arg(&ports_file)
        .assert()
        .success()
        .stdout(predicate::str::contains("42222"));

    let contents = fs::read_to_string(&ports_file).unwrap();
    assert!(contents.contains("SSH_PORT=42222"));

    cli(&dir)
        .args(["ports", "list", "--json", "--ports-file"])
        .arg(&ports_file)
        .assert()
        .success()
        .stdout(predicate::str::contains("42222"));
}

#[test]
fn test_ports_set_rejects_out_of_range() {
    let dir = TempDir::new().unwrap();
    let ports_file = dir.path().join("ports.conf");
    cli(&dir)
        .args(["ports", "set", "ssh", "70000", "--ports-file"])
        .arg(&ports_file)
        .assert()
        .failure();
    assert!(!ports_file.exists());
}
