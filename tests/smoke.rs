//! Smoke tests -- verify the binary runs and key subcommands load.

use assert_cmd::Command;
use std::io::Write;

#[test]
fn test_cli_help() {
    Command::cargo_bin("signalward")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicates::str::contains(
            "Streaming metric aggregation and ensemble anomaly detection",
        ));
}

#[test]
fn test_cli_version() {
    Command::cargo_bin("signalward")
        .unwrap()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicates::str::contains("signalward"));
}

#[test]
fn test_replay_subcommand_exists() {
    Command::cargo_bin("signalward")
        .unwrap()
        .args(["replay", "--help"])
        .assert()
        .success();
}

#[test]
fn test_simulate_subcommand_exists() {
    Command::cargo_bin("signalward")
        .unwrap()
        .args(["simulate", "--help"])
        .assert()
        .success();
}

#[test]
fn test_check_config_defaults() {
    Command::cargo_bin("signalward")
        .unwrap()
        .arg("check-config")
        .assert()
        .success()
        .stdout(predicates::str::contains("config ok"));
}

#[test]
fn test_check_config_accepts_valid_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(
        file,
        r#"
            window_size_ms = 30000

            [[detectors]]
            method = "zscore"
            weight = 1.0
        "#
    )
    .unwrap();

    Command::cargo_bin("signalward")
        .unwrap()
        .args(["--config", file.path().to_str().unwrap(), "check-config"])
        .assert()
        .success()
        .stdout(predicates::str::contains("window_size_ms=30000"));
}

#[test]
fn test_check_config_rejects_invalid_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(file, "window_size_ms = -1").unwrap();

    Command::cargo_bin("signalward")
        .unwrap()
        .args(["--config", file.path().to_str().unwrap(), "check-config"])
        .assert()
        .failure();
}
