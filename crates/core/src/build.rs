//! Run orchestration
//!
//! [`BuildRunner`] drives one build end to end:
//!
//! 1. resolve the environment (no container exists yet, failures abort)
//! 2. open the container session
//! 3. run the phase state machine to a terminal state
//! 4. collect artifacts, unless the run was cancelled
//! 5. close the session
//!
//! Once step 2 succeeds, step 5 runs exactly once on every path. A run
//! future dropped in between still removes the container.

use crate::artifacts::{ArtifactCollector, ArtifactRule, CollectedFile};
use crate::buildspec::BuildSpec;
use crate::environment::{BuiltinVariables, EnvironmentResolver, InheritedEnvironment};
use crate::errors::{exit_codes, ArtifactError, Result, SessionError};
use crate::executor::{PhaseExecutor, PhaseResult, RunState};
use crate::redaction::{RedactionConfig, SecretRegistry};
use crate::runtime::ContainerRuntime;
use crate::session::SessionManager;
use crate::store::{EmptyStore, ValueStore};
use crate::stream::OutputStreamer;
use bytesize::ByteSize;
use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{info, instrument, warn};

/// Default container working directory
pub const DEFAULT_WORKING_DIR: &str = "/codebuild/output/src";

/// Generate an identifier for a run, e.g. `local-1a2b3c4d5e6f`
pub fn generate_build_id() -> String {
    format!("local-{:012x}", fastrand::u64(..) & 0xffff_ffff_ffff)
}

/// Inputs of one run
#[derive(Debug, Clone)]
pub struct BuildRequest {
    pub image: String,
    /// Local directory staged into the working directory
    pub source_dir: Option<PathBuf>,
    pub working_dir: String,
    pub artifacts_dir: PathBuf,
    pub inherited: InheritedEnvironment,
    /// Fixed build id; generated when `None`
    pub build_id: Option<String>,
}

impl BuildRequest {
    pub fn new(image: impl Into<String>, artifacts_dir: impl Into<PathBuf>) -> Self {
        Self {
            image: image.into(),
            source_dir: None,
            working_dir: DEFAULT_WORKING_DIR.to_string(),
            artifacts_dir: artifacts_dir.into(),
            inherited: InheritedEnvironment::new(),
            build_id: None,
        }
    }
}

/// Result of a run that reached the container
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub build_id: String,
    pub image: String,
    pub state: RunState,
    pub cancelled: bool,
    pub phases: Vec<PhaseResult>,
    pub artifacts: Vec<CollectedFile>,
    #[serde(serialize_with = "serialize_displayed")]
    pub artifact_errors: Vec<ArtifactError>,
    #[serde(serialize_with = "serialize_displayed_opt")]
    pub teardown_error: Option<SessionError>,
    pub started_at: DateTime<Utc>,
    #[serde(rename = "duration_ms", serialize_with = "serialize_millis")]
    pub duration: Duration,
}

impl RunReport {
    pub fn succeeded(&self) -> bool {
        self.state == RunState::Succeeded
    }

    /// Total size of the collected artifact files
    pub fn artifact_size(&self) -> ByteSize {
        ByteSize::b(self.artifacts.iter().map(|file| file.size).sum())
    }

    /// Process exit code for this run
    ///
    /// Teardown and artifact failures only surface when the phases succeeded.
    pub fn exit_code(&self) -> i32 {
        if self.cancelled {
            exit_codes::CANCELLED
        } else if !self.succeeded() {
            exit_codes::PHASE_FAILED
        } else if self.teardown_error.is_some() {
            exit_codes::SESSION
        } else if !self.artifact_errors.is_empty() {
            exit_codes::ARTIFACT
        } else {
            exit_codes::SUCCESS
        }
    }
}

#[allow(clippy::ptr_arg)]
fn serialize_displayed<S: Serializer, E: std::fmt::Display>(
    errors: &Vec<E>,
    s: S,
) -> std::result::Result<S::Ok, S::Error> {
    s.collect_seq(errors.iter().map(|e| e.to_string()))
}

fn serialize_displayed_opt<S: Serializer, E: std::fmt::Display>(
    error: &Option<E>,
    s: S,
) -> std::result::Result<S::Ok, S::Error> {
    match error {
        Some(e) => s.serialize_some(&e.to_string()),
        None => s.serialize_none(),
    }
}

fn serialize_millis<S: Serializer>(
    duration: &Duration,
    s: S,
) -> std::result::Result<S::Ok, S::Error> {
    s.serialize_u64(duration.as_millis() as u64)
}

/// Executes builds against a container runtime
pub struct BuildRunner<R> {
    runtime: R,
    parameter_store: Arc<dyn ValueStore>,
    secrets_store: Arc<dyn ValueStore>,
    registry: SecretRegistry,
    streamer: OutputStreamer,
    cancel: watch::Receiver<bool>,
    command_timeout: Option<Duration>,
    stop_timeout: Option<u32>,
    extra_args: Vec<String>,
}

impl<R: ContainerRuntime> BuildRunner<R> {
    /// Runner printing build output to stdout with redaction enabled
    pub fn new(runtime: R) -> Self {
        let registry = SecretRegistry::new();
        let streamer = OutputStreamer::stdout(RedactionConfig::default(), &registry);
        Self {
            runtime,
            parameter_store: Arc::new(EmptyStore),
            secrets_store: Arc::new(EmptyStore),
            registry,
            streamer,
            cancel: watch::channel(false).1,
            command_timeout: None,
            stop_timeout: None,
            extra_args: Vec::new(),
        }
    }

    pub fn with_parameter_store(mut self, store: Arc<dyn ValueStore>) -> Self {
        self.parameter_store = store;
        self
    }

    pub fn with_secrets_store(mut self, store: Arc<dyn ValueStore>) -> Self {
        self.secrets_store = store;
        self
    }

    /// Use `streamer` for build output; `registry` must be the one it masks with
    pub fn with_output(mut self, streamer: OutputStreamer, registry: SecretRegistry) -> Self {
        self.streamer = streamer;
        self.registry = registry;
        self
    }

    pub fn with_cancel(mut self, cancel: watch::Receiver<bool>) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_command_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.command_timeout = timeout;
        self
    }

    pub fn with_stop_timeout(mut self, timeout: Option<u32>) -> Self {
        self.stop_timeout = timeout;
        self
    }

    pub fn with_extra_args(mut self, extra_args: Vec<String>) -> Self {
        self.extra_args = extra_args;
        self
    }

    /// Run `spec` to completion
    ///
    /// Returns `Err` only for failures before the phases could start
    /// (environment resolution, container start). Phase failures, artifact
    /// errors and teardown errors are part of the [`RunReport`].
    #[instrument(skip_all, fields(image = %request.image))]
    pub async fn run(self, spec: &BuildSpec, request: BuildRequest) -> Result<RunReport>
    where
        R: 'static,
    {
        let started_at = Utc::now();
        let start = Instant::now();
        let build_id = request.build_id.clone().unwrap_or_else(generate_build_id);
        info!("Starting build {}", build_id);

        let builtins = BuiltinVariables {
            build_id: build_id.clone(),
            image: request.image.clone(),
            source_dir: request.working_dir.clone(),
            start_time_millis: started_at.timestamp_millis(),
        };
        let env = EnvironmentResolver::new(self.parameter_store, self.secrets_store)
            .with_registry(self.registry.clone())
            .with_builtins(&builtins)
            .resolve(&spec.env, &request.inherited)
            .await?;

        let rules = ArtifactRule::from_groups(&spec.artifacts, &request.artifacts_dir)?;
        let collector = ArtifactCollector::new(rules);

        let mut sessions = SessionManager::new(self.runtime)
            .with_build_id(&build_id)
            .with_extra_args(self.extra_args)
            .with_command_timeout(self.command_timeout)
            .with_stop_timeout(self.stop_timeout);
        if let Some(source_dir) = &request.source_dir {
            sessions = sessions.with_source_dir(source_dir.clone());
        }

        let mut session = sessions.open(&request.image, &request.working_dir).await?;

        let execution = PhaseExecutor::new(&sessions, &session, &env, &self.streamer)
            .with_cancel(self.cancel.clone())
            .run(spec)
            .await;

        let artifacts = if execution.cancelled {
            info!("Skipping artifact collection for cancelled build");
            Default::default()
        } else {
            collector.collect(&sessions, &session).await
        };
        for error in &artifacts.errors {
            warn!("{}", error);
        }

        let teardown_error = match sessions.close(&mut session).await {
            Ok(()) => None,
            Err(e) => {
                warn!("{}", e);
                Some(e)
            }
        };

        let report = RunReport {
            build_id,
            image: request.image,
            state: execution.state,
            cancelled: execution.cancelled,
            phases: execution.results,
            artifacts: artifacts.collected,
            artifact_errors: artifacts.errors,
            teardown_error,
            started_at,
            duration: start.elapsed(),
        };
        info!(
            "Build {} finished: {} (exit code {})",
            report.build_id,
            report.state,
            report.exit_code()
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buildspec::{parse_buildspec, PhaseName};
    use crate::docker::mock::{MockExecResponse, MockFailures, MockRuntime};
    use crate::store::StaticStore;
    use crate::stream::SharedBuffer;
    use tempfile::TempDir;

    fn runner(runtime: &MockRuntime) -> (BuildRunner<MockRuntime>, SharedBuffer) {
        let registry = SecretRegistry::new();
        let buffer = SharedBuffer::new();
        let streamer = OutputStreamer::new(buffer.clone(), RedactionConfig::default(), &registry);
        let runner = BuildRunner::new(runtime.clone()).with_output(streamer, registry);
        (runner, buffer)
    }

    #[test]
    fn test_generated_build_ids_are_container_name_safe() {
        let id = generate_build_id();
        assert!(id.starts_with("local-"));
        assert_eq!(id.len(), "local-".len() + 12);
        assert!(id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-'));
        assert_ne!(generate_build_id(), generate_build_id());
    }

    #[test]
    fn test_exit_code_priority() {
        let mut report = RunReport {
            build_id: "b".to_string(),
            image: "img".to_string(),
            state: RunState::Succeeded,
            cancelled: false,
            phases: Vec::new(),
            artifacts: Vec::new(),
            artifact_errors: vec![ArtifactError::Archive {
                reason: "x".to_string(),
            }],
            teardown_error: None,
            started_at: Utc::now(),
            duration: Duration::ZERO,
        };
        assert_eq!(report.exit_code(), exit_codes::ARTIFACT);

        report.teardown_error = Some(SessionError::Runtime("x".to_string()));
        assert_eq!(report.exit_code(), exit_codes::SESSION);

        report.state = RunState::Failed;
        assert_eq!(report.exit_code(), exit_codes::PHASE_FAILED);

        report.cancelled = true;
        assert_eq!(report.exit_code(), exit_codes::CANCELLED);
    }

    #[tokio::test]
    async fn test_secret_values_are_masked_in_output() {
        let runtime = MockRuntime::new();
        runtime.set_exec_response(
            "echo $TOKEN",
            MockExecResponse::exit(0).with_stdout(&["hunter2-hunter2"]),
        );
        let (runner, buffer) = runner(&runtime);
        let runner = runner.with_secrets_store(Arc::new(
            StaticStore::new().with("ci/token", "hunter2-hunter2"),
        ));
        let spec = parse_buildspec(
            "version: 0.2\nenv:\n  secrets-manager:\n    TOKEN: ci/token\nphases:\n  build:\n    commands:\n      - echo $TOKEN\n",
        )
        .unwrap();
        let dest = TempDir::new().unwrap();

        let report = runner
            .run(&spec, BuildRequest::new("alpine:3", dest.path()))
            .await
            .unwrap();

        assert!(report.succeeded());
        assert!(buffer.contents().contains("[build:0] ****"));
        assert!(!buffer.contents().contains("hunter2-hunter2"));
    }

    #[tokio::test]
    async fn test_env_failure_never_creates_container() {
        let runtime = MockRuntime::new();
        let (runner, _) = runner(&runtime);
        let spec = parse_buildspec(
            "version: 0.2\nenv:\n  parameter-store:\n    DB: /missing\nphases:\n  build:\n    commands: [make]\n",
        )
        .unwrap();

        let error = runner
            .run(&spec, BuildRequest::new("alpine:3", "artifacts"))
            .await
            .unwrap_err();

        assert_eq!(error.exit_code(), exit_codes::ENV_RESOLUTION);
        assert!(runtime.calls().is_empty());
    }

    #[tokio::test]
    async fn test_teardown_failure_after_success() {
        let runtime = MockRuntime::new();
        runtime.set_failures(MockFailures {
            remove: Some("device busy".to_string()),
            ..Default::default()
        });
        let (runner, _) = runner(&runtime);
        let spec = parse_buildspec("version: 0.2\nphases:\n  build:\n    commands: [make]\n").unwrap();

        let report = runner
            .run(&spec, BuildRequest::new("alpine:3", "artifacts"))
            .await
            .unwrap();

        assert_eq!(report.state, RunState::Succeeded);
        assert!(report.teardown_error.is_some());
        assert_eq!(report.exit_code(), exit_codes::SESSION);
        assert_eq!(runtime.remove_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_run_removes_container() {
        let runtime = MockRuntime::new();
        runtime.set_exec_response(
            "make",
            MockExecResponse::exit(0).with_delay(Duration::from_secs(3600)),
        );
        let (runner, _) = runner(&runtime);
        let spec = parse_buildspec("version: 0.2\nphases:\n  build:\n    commands: [make]\n").unwrap();

        let abandoned = tokio::time::timeout(
            Duration::from_secs(5),
            runner.run(&spec, BuildRequest::new("alpine:3", "artifacts")),
        )
        .await;
        assert!(abandoned.is_err());

        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
        assert_eq!(runtime.executed_commands(), vec!["make"]);
        assert_eq!(runtime.remove_count(), 1);
    }

    #[tokio::test]
    async fn test_report_serializes_to_json() {
        let runtime = MockRuntime::new();
        let (runner, _) = runner(&runtime);
        let spec = parse_buildspec("version: 0.2\nphases:\n  install:\n    commands: [make]\n").unwrap();

        let report = runner
            .run(
                &spec,
                BuildRequest {
                    build_id: Some("local-000000000001".to_string()),
                    ..BuildRequest::new("alpine:3", "artifacts")
                },
            )
            .await
            .unwrap();

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["build_id"], "local-000000000001");
        assert_eq!(json["state"]["state"], "SUCCEEDED");
        assert_eq!(json["phases"][0]["phase"], PhaseName::Install.as_str());
        assert!(json["duration_ms"].is_u64());
        assert!(json["teardown_error"].is_null());
    }
}
