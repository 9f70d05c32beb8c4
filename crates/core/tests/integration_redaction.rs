//! Integration tests for secret redaction in build output
//!
//! Resolved parameter-store and secrets-manager values must be masked in the
//! streamed command output and in failure tails, unless redaction is disabled.

mod common;

use codebuild_local_core::build::BuildRunner;
use codebuild_local_core::buildspec::parse_buildspec;
use codebuild_local_core::docker::mock::{MockExecResponse, MockRuntime};
use codebuild_local_core::redaction::{RedactingWriter, RedactionConfig, SecretRegistry};
use codebuild_local_core::store::StaticStore;
use codebuild_local_core::stream::{OutputStreamer, SharedBuffer};
use common::Harness;
use std::io::Write;
use std::sync::Arc;

const SPEC: &str = r#"
version: 0.2
env:
  parameter-store:
    DEPLOY_KEY: /ci/deploy-key
  secrets-manager:
    NPM_TOKEN: ci/npm
phases:
  build:
    commands:
      - ./publish.sh
"#;

fn with_stores(runner: BuildRunner<MockRuntime>) -> BuildRunner<MockRuntime> {
    runner
        .with_parameter_store(Arc::new(
            StaticStore::new().with("/ci/deploy-key", "deploy-key-0f9e8d7c"),
        ))
        .with_secrets_store(Arc::new(StaticStore::new().with("ci/npm", "npm_tok_abcdef123456")))
}

#[tokio::test]
async fn test_store_values_are_masked_in_streamed_output() {
    let harness = Harness::new();
    harness.runtime.set_exec_response(
        "./publish.sh",
        MockExecResponse::exit(0)
            .with_stdout(&["using key deploy-key-0f9e8d7c"])
            .with_stderr(&["npm notice token npm_tok_abcdef123456 accepted"]),
    );
    let spec = parse_buildspec(SPEC).unwrap();

    let report = with_stores(harness.runner())
        .run(&spec, harness.request())
        .await
        .unwrap();

    assert!(report.succeeded());
    let output = harness.output.contents();
    assert!(output.contains("[build:0] using key ****"));
    assert!(output.contains("[build:0][stderr] npm notice token **** accepted"));
    assert!(!output.contains("deploy-key-0f9e8d7c"));
    assert!(!output.contains("npm_tok_abcdef123456"));
}

#[tokio::test]
async fn test_failure_tail_is_masked() {
    let harness = Harness::new();
    harness.runtime.set_exec_response(
        "./publish.sh",
        MockExecResponse::exit(1).with_stderr(&["401 for token npm_tok_abcdef123456"]),
    );
    let spec = parse_buildspec(SPEC).unwrap();

    let report = with_stores(harness.runner())
        .run(&spec, harness.request())
        .await
        .unwrap();

    let failure = report.phases[0].failure.as_ref().unwrap();
    assert_eq!(failure.output_tail, vec!["401 for token ****"]);
    let json = serde_json::to_string(&report).unwrap();
    assert!(!json.contains("npm_tok_abcdef123456"));
}

#[tokio::test]
async fn test_disabled_redaction_prints_values() {
    let harness = Harness::new();
    harness.runtime.set_exec_response(
        "./publish.sh",
        MockExecResponse::exit(0).with_stdout(&["token npm_tok_abcdef123456"]),
    );
    let spec = parse_buildspec(SPEC).unwrap();
    let output = SharedBuffer::new();
    let registry = SecretRegistry::new();
    let streamer = OutputStreamer::new(output.clone(), RedactionConfig::disabled(), &registry);

    with_stores(BuildRunner::new(harness.runtime.clone()).with_output(streamer, registry.clone()))
        .run(&spec, harness.request())
        .await
        .unwrap();

    assert!(output.contents().contains("token npm_tok_abcdef123456"));
    // Values are still registered, only printing is unmasked
    assert_eq!(registry.secret_count(), 2);
}

#[tokio::test]
async fn test_plaintext_variables_are_not_masked() {
    let harness = Harness::new();
    harness.runtime.set_exec_response(
        "echo $STAGE",
        MockExecResponse::exit(0).with_stdout(&["production-eu"]),
    );

    harness
        .run(
            r#"
version: 0.2
env:
  variables:
    STAGE: production-eu
phases:
  build:
    commands: ['echo $STAGE']
"#,
        )
        .await;

    assert!(harness.output.contents().contains("[build:0] production-eu"));
    assert_eq!(harness.registry.secret_count(), 0);
}

#[test]
fn test_writer_masks_secret_split_across_writes() {
    let registry = SecretRegistry::new();
    registry.add_secret("split-secret-value");
    let mut output = Vec::new();
    {
        let mut writer = RedactingWriter::new(&mut output, RedactionConfig::default(), &registry);
        write!(writer, "value: split-sec").unwrap();
        write!(writer, "ret-value\nnext line\n").unwrap();
        writer.flush().unwrap();
    }

    assert_eq!(String::from_utf8(output).unwrap(), "value: ****\nnext line\n");
}
