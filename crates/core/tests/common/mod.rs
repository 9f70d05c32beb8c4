//! Shared test helpers for core integration tests.
#![allow(dead_code)]

use codebuild_local_core::build::{BuildRequest, BuildRunner, RunReport};
use codebuild_local_core::buildspec::{parse_buildspec, PhaseName};
use codebuild_local_core::docker::mock::MockRuntime;
use codebuild_local_core::redaction::{RedactionConfig, SecretRegistry};
use codebuild_local_core::stream::{OutputStreamer, SharedBuffer};
use tempfile::TempDir;

/// Mock runtime, captured output and a scratch artifact directory
pub struct Harness {
    pub runtime: MockRuntime,
    pub output: SharedBuffer,
    pub registry: SecretRegistry,
    pub artifacts: TempDir,
}

impl Harness {
    pub fn new() -> Self {
        Self {
            runtime: MockRuntime::new(),
            output: SharedBuffer::new(),
            registry: SecretRegistry::new(),
            artifacts: TempDir::new().expect("temp dir"),
        }
    }

    /// Runner wired to the mock runtime and the captured output
    pub fn runner(&self) -> BuildRunner<MockRuntime> {
        let streamer = OutputStreamer::new(
            self.output.clone(),
            RedactionConfig::default(),
            &self.registry,
        );
        BuildRunner::new(self.runtime.clone()).with_output(streamer, self.registry.clone())
    }

    pub fn request(&self) -> BuildRequest {
        BuildRequest::new("public.ecr.aws/docker/library/alpine:3", self.artifacts.path())
    }

    /// Parse `spec` and run it with default settings
    pub async fn run(&self, spec: &str) -> RunReport {
        let spec = parse_buildspec(spec).expect("valid build specification");
        self.runner()
            .run(&spec, self.request())
            .await
            .expect("run reaches the container")
    }
}

/// `(phase, exit code, finalization)` of each recorded phase
pub fn phase_summary(report: &RunReport) -> Vec<(PhaseName, Option<i32>, bool)> {
    report
        .phases
        .iter()
        .map(|result| (result.phase, result.exit_code, result.finalization))
        .collect()
}
