//! Smoke tests -- verify the binary runs and key commands work end to end.

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

/// A config file pointing the database into `dir`.
fn config_in(dir: &TempDir) -> String {
    let path = dir.path().join("hostsync.toml");
    let db = dir.path().join("hostsync.db");
    std::fs::write(
        &path,
        format!(
            "[database]\npath = {:?}\n\n[logging]\nlevel = \"warn\"\n",
            db.display().to_string()
        ),
    )
    .unwrap();
    path.display().to_string()
}

fn hostsync(config: &str) -> Command {
    let mut cmd = Command::cargo_bin("hostsync").unwrap();
    cmd.env_remove("RUST_LOG").args(["--config", config]);
    cmd
}

#[test]
fn test_cli_help() {
    Command::cargo_bin("hostsync")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Host pool inventory"));
}

#[test]
fn test_cli_version() {
    Command::cargo_bin("hostsync")
        .unwrap()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("hostsync"));
}

#[test]
fn test_subcommands_exist() {
    for args in [
        vec!["serve", "--help"],
        vec!["sync", "hosts", "--help"],
        vec!["sync", "file", "--help"],
        vec!["sync", "group", "--help"],
        vec!["task", "add", "--help"],
        vec!["task", "dry-run", "--help"],
        vec!["executions", "list", "--help"],
        vec!["hosts", "show", "--help"],
        vec!["source", "check", "--help"],
        vec!["location", "list", "--help"],
    ] {
        Command::cargo_bin("hostsync")
            .unwrap()
            .args(&args)
            .assert()
            .success();
    }
}

#[test]
fn test_unknown_source_is_rejected() {
    Command::cargo_bin("hostsync")
        .unwrap()
        .args(["sync", "hosts", "--source", "zabbix", "10.0.0.1"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("unknown source kind"));
}

#[test]
fn test_task_add_list_and_dry_run() {
    let dir = TempDir::new().unwrap();
    let config = config_in(&dir);

    hostsync(&config)
        .args([
            "task", "add", "--name", "nightly", "--source", "es", "--cron", "0 0 3 * * *", "--group",
            "payments",
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains("Task 'nightly' added"));

    hostsync(&config)
        .args(["task", "add", "--name", "bad", "--source", "cmsys", "--cron", "0 3 * * *", "--hosts", "10.0.0.1"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("expected 6 fields"));

    hostsync(&config)
        .args(["task", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("nightly").and(predicate::str::contains("elasticsearch")));

    hostsync(&config)
        .args(["task", "dry-run", "--hours", "48"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Upcoming runs"));
}

#[test]
fn test_location_add_and_list() {
    let dir = TempDir::new().unwrap();
    let config = config_in(&dir);

    hostsync(&config)
        .args(["location", "add", "--name", "dc1", "--pattern", "10.1.0.0/16", "--priority", "5"])
        .assert()
        .success();

    hostsync(&config)
        .args(["location", "add", "--name", "broken", "--pattern", "10.0.0.0/99"])
        .assert()
        .failure();

    hostsync(&config)
        .args(["--json", "location", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"name\": \"dc1\""));
}

#[test]
fn test_sync_against_unreachable_source_records_failures() {
    let dir = TempDir::new().unwrap();
    let config = config_in(&dir);

    hostsync(&config)
        .args([
            "--json",
            "sync",
            "hosts",
            "--source",
            "cmsys",
            "--endpoint",
            "http://127.0.0.1:9",
            "10.0.0.1",
            "10.0.0.2",
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"status\": \"failed\"").and(predicate::str::contains("\"failed\": 2")));

    hostsync(&config)
        .args(["--json", "executions", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"source_kind\": \"cmsys\""));
}
