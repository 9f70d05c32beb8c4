//! Environment layering through a full run
//!
//! Values come from env files, `--env` style overrides, plaintext variables
//! and file-backed parameter/secret stores; the container must see the merged
//! result on every exec.

mod common;

use codebuild_local_core::buildspec::parse_buildspec;
use codebuild_local_core::environment::InheritedEnvironment;
use codebuild_local_core::errors::{exit_codes, BuildError, EnvResolutionError, EnvSource};
use codebuild_local_core::store::FileStore;
use common::Harness;
use std::sync::Arc;
use tempfile::TempDir;

fn env_of_first_exec(harness: &Harness) -> Vec<(String, String)> {
    harness.runtime.exec_calls()[0].1.env.clone()
}

fn value<'a>(env: &'a [(String, String)], key: &str) -> Option<&'a str> {
    env.iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.as_str())
}

#[tokio::test]
async fn test_highest_layer_wins() {
    let dir = TempDir::new().unwrap();
    let env_file = dir.path().join("build.env");
    let params = dir.path().join("params.env");
    let secrets = dir.path().join("secrets.env");
    std::fs::write(&env_file, "FOO=1\nONLY_INHERITED=yes\n").unwrap();
    std::fs::write(&params, "/app/foo=3\n").unwrap();
    std::fs::write(&secrets, "app/foo=4\n").unwrap();

    let harness = Harness::new();
    let spec = parse_buildspec(
        r#"
version: 0.2
env:
  variables:
    FOO: "2"
  parameter-store:
    FOO: /app/foo
  secrets-manager:
    FOO: app/foo
phases:
  build:
    commands: ["echo $FOO"]
"#,
    )
    .unwrap();
    let mut request = harness.request();
    request.inherited = InheritedEnvironment::from_env_files(&[&env_file]).unwrap();

    let report = harness
        .runner()
        .with_parameter_store(Arc::new(FileStore::load("parameter-store", &[&params]).unwrap()))
        .with_secrets_store(Arc::new(FileStore::load("secrets-manager", &[&secrets]).unwrap()))
        .run(&spec, request)
        .await
        .unwrap();

    assert!(report.succeeded());
    let env = env_of_first_exec(&harness);
    assert_eq!(value(&env, "FOO"), Some("4"));
    assert_eq!(value(&env, "ONLY_INHERITED"), Some("yes"));
    assert_eq!(env.iter().filter(|(k, _)| k == "FOO").count(), 1);
}

#[tokio::test]
async fn test_builtin_variables_are_visible() {
    let harness = Harness::new();
    let spec = parse_buildspec("version: 0.2\nphases:\n  build:\n    commands: [env]\n").unwrap();
    let mut request = harness.request();
    request.build_id = Some("local-00000000beef".to_string());

    harness.runner().run(&spec, request).await.unwrap();

    let env = env_of_first_exec(&harness);
    assert_eq!(value(&env, "CODEBUILD_BUILD_ID"), Some("local-00000000beef"));
    assert_eq!(value(&env, "CODEBUILD_SRC_DIR"), Some("/codebuild/output/src"));
    assert_eq!(value(&env, "CODEBUILD_INITIATOR"), Some("codebuild-local"));
    assert_eq!(value(&env, "CODEBUILD_BUILD_SUCCEEDING"), Some("1"));
    assert!(value(&env, "CODEBUILD_START_TIME").is_some());
}

#[tokio::test]
async fn test_overrides_apply_after_env_files() {
    let dir = TempDir::new().unwrap();
    let env_file = dir.path().join("ci.env");
    std::fs::write(&env_file, "STAGE=dev\nREGION=eu-west-1\n").unwrap();

    let harness = Harness::new();
    let spec = parse_buildspec("version: 0.2\nphases:\n  build:\n    commands: [env]\n").unwrap();
    let mut request = harness.request();
    request.inherited = InheritedEnvironment::from_env_files(&[&env_file]).unwrap();
    request
        .inherited
        .apply_overrides(&["STAGE=prod"])
        .unwrap();

    harness.runner().run(&spec, request).await.unwrap();

    let env = env_of_first_exec(&harness);
    assert_eq!(value(&env, "STAGE"), Some("prod"));
    assert_eq!(value(&env, "REGION"), Some("eu-west-1"));
}

#[tokio::test]
async fn test_unresolved_secret_aborts_before_container() {
    let dir = TempDir::new().unwrap();
    let secrets = dir.path().join("secrets.env");
    std::fs::write(&secrets, "prod/db={\"username\":\"admin\"}\n").unwrap();

    let harness = Harness::new();
    let spec = parse_buildspec(
        r#"
version: 0.2
env:
  secrets-manager:
    DB_PASSWORD: prod/db:password
phases:
  build:
    commands: [make]
"#,
    )
    .unwrap();

    let error = harness
        .runner()
        .with_secrets_store(Arc::new(FileStore::load("secrets-manager", &[&secrets]).unwrap()))
        .run(&spec, harness.request())
        .await
        .unwrap_err();

    assert_eq!(error.exit_code(), exit_codes::ENV_RESOLUTION);
    match error {
        BuildError::Env(EnvResolutionError::Unresolved {
            key, source_kind, ..
        }) => {
            assert_eq!(key, "DB_PASSWORD");
            assert_eq!(source_kind, EnvSource::SecretsManager);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(harness.runtime.calls().is_empty());
}

#[tokio::test]
async fn test_json_key_secret_is_extracted_and_masked() {
    let dir = TempDir::new().unwrap();
    let secrets = dir.path().join("secrets.env");
    std::fs::write(
        &secrets,
        "prod/db={\"username\":\"admin\",\"password\":\"correct-horse-battery\"}\n",
    )
    .unwrap();

    let harness = Harness::new();
    harness.runtime.set_exec_response(
        "./migrate.sh",
        codebuild_local_core::docker::mock::MockExecResponse::exit(0)
            .with_stdout(&["connecting with correct-horse-battery"]),
    );
    let spec = parse_buildspec(
        r#"
version: 0.2
env:
  secrets-manager:
    DB_PASSWORD: prod/db:password
phases:
  build:
    commands: [./migrate.sh]
"#,
    )
    .unwrap();

    harness
        .runner()
        .with_secrets_store(Arc::new(FileStore::load("secrets-manager", &[&secrets]).unwrap()))
        .run(&spec, harness.request())
        .await
        .unwrap();

    let env = env_of_first_exec(&harness);
    assert_eq!(value(&env, "DB_PASSWORD"), Some("correct-horse-battery"));
    let output = harness.output.contents();
    assert!(output.contains("[build:0] connecting with ****"));
    assert!(!output.contains("correct-horse-battery"));
}
