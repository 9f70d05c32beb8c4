//! Run command implementation
//!
//! Implements the `codebuild-local run` subcommand: resolve configuration,
//! load the build specification and environment inputs, then hand the build to
//! the core runner and print its summary.

use crate::cli::{CliContext, OutputFormat};
use crate::ui::summary;
use anyhow::Result;
use codebuild_local_core::build::{BuildRequest, BuildRunner};
use codebuild_local_core::buildspec::load_buildspec;
use codebuild_local_core::config::{ConfigOverrides, RunnerConfig};
use codebuild_local_core::environment::InheritedEnvironment;
use codebuild_local_core::errors::{BuildError, EnvResolutionError};
use codebuild_local_core::redaction::{redact_with_registry, RedactionConfig};
use codebuild_local_core::runtime::RuntimeFactory;
use codebuild_local_core::store::{FileStore, ValueStore};
use codebuild_local_core::stream::OutputStreamer;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, instrument};

/// Exit status of a run that finished and printed its summary
#[derive(Debug)]
pub struct RunExitCode(pub i32);

impl std::fmt::Display for RunExitCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "build finished with exit code {}", self.0)
    }
}

impl std::error::Error for RunExitCode {}

/// Run command arguments
#[derive(Debug, Clone)]
pub struct RunArgs {
    pub image: Option<String>,
    pub source: Option<PathBuf>,
    pub buildspec: Option<PathBuf>,
    pub artifacts: Option<PathBuf>,
    pub working_dir: Option<String>,
    /// `KEY=VALUE` or bare `KEY` entries
    pub env: Vec<String>,
    pub env_files: Vec<PathBuf>,
    pub parameter_files: Vec<PathBuf>,
    pub secret_files: Vec<PathBuf>,
    pub command_timeout: Option<u64>,
    pub stop_timeout: Option<u32>,
    pub run_args: Option<String>,
    pub runtime_path: Option<String>,
    pub output: OutputFormat,
}

/// Execute the run command
#[instrument(skip_all)]
pub async fn execute_run(args: RunArgs, context: CliContext) -> Result<()> {
    debug!("Run args: {:?}", args);

    let config = RunnerConfig::resolve(ConfigOverrides {
        config_path: context.config.clone(),
        image: args.image,
        source_dir: args.source,
        buildspec: args.buildspec,
        working_dir: args.working_dir,
        artifacts_dir: args.artifacts,
        runtime: context.runtime.map(Into::into),
        runtime_path: args.runtime_path,
        command_timeout: args.command_timeout,
        stop_timeout: args.stop_timeout,
        env_files: args.env_files,
        parameter_files: args.parameter_files,
        secret_files: args.secret_files,
        env: args.env,
        run_args: args.run_args,
        redact: if context.no_redact { Some(false) } else { None },
    })?;
    if let Some(path) = &config.config_file {
        info!("Using configuration file {}", path.display());
    }

    let spec = load_buildspec(&config.buildspec).map_err(BuildError::from)?;
    debug!(
        "Loaded {} with {} phases",
        config.buildspec.display(),
        spec.phase_count()
    );

    let mut inherited =
        InheritedEnvironment::from_env_files(&config.env_files).map_err(BuildError::from)?;
    inherited
        .apply_overrides(&config.env_overrides)
        .map_err(BuildError::from)?;

    let parameter_store = load_store("parameter-store", &config.parameter_files)?;
    let secrets_store = load_store("secrets-manager", &config.secret_files)?;

    let redaction = if config.redact {
        RedactionConfig::default()
    } else {
        RedactionConfig::disabled()
    };
    let registry = context.registry.clone();
    // Keep stdout for the JSON document
    let streamer = match args.output {
        OutputFormat::Text => OutputStreamer::stdout(redaction.clone(), &registry),
        OutputFormat::Json => OutputStreamer::new(std::io::stderr(), redaction.clone(), &registry),
    };

    let runtime = RuntimeFactory::create_runtime(config.runtime, config.runtime_path.clone());
    runtime
        .check_runtime_installed()
        .await
        .map_err(BuildError::from)?;

    let (cancel_tx, cancel_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, cancelling build");
            let _ = cancel_tx.send(true);
        }
    });

    let request = BuildRequest {
        image: config.image.clone(),
        source_dir: Some(config.source_dir.clone()),
        working_dir: config.working_dir.clone(),
        artifacts_dir: config.artifacts_dir.clone(),
        inherited,
        build_id: None,
    };

    let report = BuildRunner::new(runtime)
        .with_parameter_store(parameter_store)
        .with_secrets_store(secrets_store)
        .with_output(streamer, registry.clone())
        .with_cancel(cancel_rx)
        .with_command_timeout(config.command_timeout)
        .with_stop_timeout(config.stop_timeout)
        .with_extra_args(config.extra_args.clone())
        .run(&spec, request)
        .await?;

    match args.output {
        OutputFormat::Text => {
            let rendered = summary::render_text(&report);
            print!("\n{}", redact_with_registry(&rendered, &redaction, &registry));
        }
        OutputFormat::Json => {
            let rendered = serde_json::to_string_pretty(&report)?;
            println!("{}", redact_with_registry(&rendered, &redaction, &registry));
        }
    }

    match report.exit_code() {
        0 => Ok(()),
        code => Err(RunExitCode(code).into()),
    }
}

/// File-backed store over `files`; empty when none are given
fn load_store(name: &str, files: &[PathBuf]) -> Result<Arc<dyn ValueStore>> {
    let store = FileStore::load(name, files).map_err(|e| {
        BuildError::from(EnvResolutionError::Inherited {
            origin: format!("{} files", name),
            reason: e.to_string(),
        })
    })?;
    debug!("{} store holds {} values", name, store.len());
    Ok(Arc::new(store))
}
