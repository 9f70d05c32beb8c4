//! CLI tests for the validate subcommand

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

const VALID_SPEC: &str = r#"
version: 0.2
env:
  variables:
    STAGE: dev
phases:
  post_build:
    commands:
      - echo done
  build:
    on-failure: CONTINUE
    commands:
      - make
      - make test
artifacts:
  files:
    - dist/**/*
"#;

fn cli() -> Command {
    let mut cmd = Command::cargo_bin("codebuild-local").unwrap();
    cmd.env_remove("CODEBUILD_LOCAL_LOG")
        .env_remove("CODEBUILD_LOCAL_LOG_FORMAT");
    cmd
}

#[test]
fn test_help_output() {
    cli()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains(
            "Run build specifications locally in a container",
        ))
        .stdout(predicate::str::contains("run"))
        .stdout(predicate::str::contains("validate"));
}

#[test]
fn test_version_output() {
    cli()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains(format!(
            "codebuild-local {}",
            env!("CARGO_PKG_VERSION")
        )));
}

#[test]
fn test_valid_spec_prints_plan_in_execution_order() {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("buildspec.yml"), VALID_SPEC).unwrap();

    let assert = cli()
        .args(["validate", "--source"])
        .arg(dir.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("version 0.2"))
        .stdout(predicate::str::contains("build: 2 commands"))
        .stdout(predicate::str::contains("on-failure: CONTINUE"))
        .stdout(predicate::str::contains("artifacts: dist/**/*"));

    let stdout = String::from_utf8(assert.get_output().stdout.clone()).unwrap();
    let build = stdout.find("build:").unwrap();
    let post_build = stdout.find("post_build:").unwrap();
    assert!(build < post_build);
}

#[test]
fn test_json_output_is_pure() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("ci.yml");
    fs::write(&path, VALID_SPEC).unwrap();

    let assert = cli()
        .args(["validate", "--output", "json", "--buildspec"])
        .arg(&path)
        .assert()
        .success();

    let json: serde_json::Value = serde_json::from_slice(&assert.get_output().stdout).unwrap();
    assert_eq!(json["version"], "0.2");
    assert_eq!(json["phases"][0]["name"], "build");
    assert_eq!(json["phases"][0]["on_failure"], "CONTINUE");
    assert_eq!(json["phases"][1]["name"], "post_build");
    assert_eq!(json["variables"], 1);
}

#[test]
fn test_unknown_phase_exits_with_spec_error() {
    let dir = TempDir::new().unwrap();
    fs::write(
        dir.path().join("buildspec.yml"),
        "version: 0.2\nphases:\n  compile:\n    commands: [make]\n",
    )
    .unwrap();

    cli()
        .args(["validate", "--source"])
        .arg(dir.path())
        .assert()
        .code(2)
        .stderr(predicate::str::contains("phases.compile"))
        .stderr(predicate::str::contains("unknown phase 'compile'"));
}

#[test]
fn test_missing_spec_exits_with_spec_error() {
    let dir = TempDir::new().unwrap();

    cli()
        .args(["validate", "--source"])
        .arg(dir.path())
        .assert()
        .code(2)
        .stderr(predicate::str::contains("buildspec.yml"));
}

#[test]
fn test_unsupported_version_exits_with_spec_error() {
    let dir = TempDir::new().unwrap();
    fs::write(
        dir.path().join("buildspec.yml"),
        "version: 1.0\nphases:\n  build:\n    commands: [make]\n",
    )
    .unwrap();

    cli()
        .args(["validate", "-s"])
        .arg(dir.path())
        .assert()
        .code(2)
        .stderr(predicate::str::contains("version"));
}
