use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use std::path::{Path, PathBuf};

/// 임시 데이터 디렉토리를 쓰는 설정 파일
fn write_config(dir: &Path) -> PathBuf {
    let path = dir.join("config.toml");
    fs::write(
        &path,
        format!("data_dir = {:?}\n", dir.join("data").display().to_string()),
    )
    .unwrap();
    path
}

fn cmdguard(config: &Path) -> Command {
    let mut cmd = Command::cargo_bin("cmdguard").unwrap();
    cmd.env("NO_COLOR", "1").arg("--config").arg(config);
    cmd
}

#[test]
fn test_cli_help() {
    let mut cmd = Command::cargo_bin("cmdguard").unwrap();
    cmd.arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Sandboxed command execution with undo"))
        .stdout(predicate::str::contains("Usage:"));
}

#[test]
fn test_cli_version() {
    let mut cmd = Command::cargo_bin("cmdguard").unwrap();
    cmd.arg("--version").assert().success();
}

#[test]
fn test_missing_subcommand() {
    let mut cmd = Command::cargo_bin("cmdguard").unwrap();
    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("Usage:"));
}

#[test]
fn test_check_reports_risk_without_executing() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path());
    let plan = dir.path().join("plan.json");
    fs::write(
        &plan,
        r#"[
            {"kind": "shell", "command": "rm -rf /"},
            {"kind": "list_directory", "target_path": "."}
        ]"#,
    )
    .unwrap();

    cmdguard(&config)
        .arg("check")
        .arg(&plan)
        .assert()
        .success()
        .stdout(predicate::str::contains("Critical"))
        .stdout(predicate::str::contains("confirmation required"))
        .stdout(predicate::str::contains("Low"));

    // 점검만으로는 데이터 디렉토리를 만들지 않음
    assert!(!dir.path().join("data").exists());
}

#[test]
fn test_check_fails_on_invalid_step() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path());
    let plan = dir.path().join("plan.json");
    fs::write(&plan, r#"[{"kind": "file_delete", "target_path": "../escape.txt"}]"#).unwrap();

    cmdguard(&config)
        .arg("check")
        .arg(&plan)
        .assert()
        .failure()
        .stdout(predicate::str::contains("invalid"))
        .stdout(predicate::str::contains("traversal"));
}

#[test]
fn test_run_in_validation_mode_then_verify_audit() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path());
    let plan = dir.path().join("plan.json");
    fs::write(&plan, r#"{"steps": [{"kind": "shell", "command": "echo hi"}]}"#).unwrap();

    cmdguard(&config)
        .args(["--mode", "validation", "--yes", "run"])
        .arg(&plan)
        .assert()
        .success()
        .stdout(predicate::str::contains("syntax ok"));

    cmdguard(&config)
        .args(["audit", "verify"])
        .assert()
        .success()
        .stderr(predicate::str::contains("chain intact"));
}

#[test]
fn test_undo_with_empty_stack_fails() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path());

    cmdguard(&config)
        .args(["--session", "empty", "undo"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Nothing to undo"));
}

#[test]
fn test_rejects_unknown_mode() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path());

    cmdguard(&config)
        .args(["--mode", "yolo", "check", "plan.json"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("unknown mode"));
}
