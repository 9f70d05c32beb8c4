use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use codebuild_local_core::redaction::SecretRegistry;
use std::path::PathBuf;

/// Runtime selection options
#[derive(Debug, Clone, Copy, ValueEnum, PartialEq)]
pub enum RuntimeOption {
    /// Docker runtime
    Docker,
    /// Podman runtime
    Podman,
}

impl From<RuntimeOption> for codebuild_local_core::runtime::RuntimeKind {
    fn from(runtime: RuntimeOption) -> Self {
        match runtime {
            RuntimeOption::Docker => codebuild_local_core::runtime::RuntimeKind::Docker,
            RuntimeOption::Podman => codebuild_local_core::runtime::RuntimeKind::Podman,
        }
    }
}

/// Output format options
#[derive(Debug, Clone, Copy, ValueEnum, PartialEq, Eq)]
pub enum OutputFormat {
    /// Human-readable text format
    Text,
    /// JSON structured format
    Json,
}

/// Log format options
#[derive(Debug, Clone, ValueEnum)]
pub enum LogFormat {
    /// Human-readable text format
    Text,
    /// JSON structured format
    Json,
}

/// Log level options
#[derive(Debug, Clone, ValueEnum)]
pub enum LogLevel {
    /// Error messages only
    Error,
    /// Warning and error messages
    Warn,
    /// Informational messages and above
    Info,
    /// Debug messages and above
    Debug,
    /// All messages including trace
    Trace,
}

impl LogLevel {
    fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

/// Global options shared by all subcommands
#[derive(Debug, Clone)]
pub struct CliContext {
    pub config: Option<PathBuf>,
    pub runtime: Option<RuntimeOption>,
    pub no_redact: bool,
    pub registry: SecretRegistry,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a build specification inside a fresh container
    #[command(long_about = "Run a build specification inside a fresh container\n\n\
        Phases run in the order install, pre_build, build, post_build. When a phase fails \
        under the default on-failure policy, post_build still runs before the build is \
        marked failed. Artifacts are copied to the artifact directory after the phases \
        finish, and the container is always removed.\n\n\
        Exit codes: 0 succeeded, 1 internal error, 2 invalid build specification, \
        3 environment resolution failed, 4 container error, 5 phase failed, \
        6 artifact collection failed, 130 cancelled.")]
    Run {
        /// Build image
        #[arg(long, short = 'i')]
        image: Option<String>,

        /// Local source directory staged into the container
        #[arg(long, short = 's', value_name = "PATH")]
        source: Option<PathBuf>,

        /// Build specification file (default: <source>/buildspec.yml)
        #[arg(long, short = 'b', value_name = "PATH")]
        buildspec: Option<PathBuf>,

        /// Directory receiving artifacts (default: <source>/artifacts)
        #[arg(long, short = 'a', value_name = "PATH")]
        artifacts: Option<PathBuf>,

        /// Working directory inside the container
        #[arg(long, value_name = "PATH")]
        working_dir: Option<String>,

        /// Environment variable for the build (KEY=VALUE, or KEY to pass through; repeatable)
        #[arg(long, short = 'e', value_name = "KEY[=VALUE]", action = clap::ArgAction::Append)]
        env: Vec<String>,

        /// File of KEY=VALUE variables for the build (repeatable)
        #[arg(long, value_name = "PATH", action = clap::ArgAction::Append)]
        env_file: Vec<PathBuf>,

        /// File of parameter-store values, KEY=VALUE per line (repeatable)
        #[arg(long, value_name = "PATH", action = clap::ArgAction::Append)]
        parameter_file: Vec<PathBuf>,

        /// File of secrets-manager values, KEY=VALUE per line (repeatable)
        #[arg(long, value_name = "PATH", action = clap::ArgAction::Append)]
        secret_file: Vec<PathBuf>,

        /// Kill any command running longer than this many seconds
        #[arg(long, value_name = "SECONDS")]
        command_timeout: Option<u64>,

        /// Grace period in seconds when stopping the container
        #[arg(long, value_name = "SECONDS")]
        stop_timeout: Option<u32>,

        /// Extra arguments for the container create command (shell-quoted)
        #[arg(long, value_name = "ARGS", allow_hyphen_values = true)]
        run_args: Option<String>,

        /// Path to the container runtime executable
        #[arg(long, value_name = "PATH")]
        runtime_path: Option<String>,

        /// Summary format
        #[arg(long, value_enum, default_value = "text")]
        output: OutputFormat,
    },

    /// Validate a build specification without running it
    Validate {
        /// Build specification file (default: <source>/buildspec.yml)
        #[arg(long, short = 'b', value_name = "PATH")]
        buildspec: Option<PathBuf>,

        /// Source directory holding the build specification
        #[arg(long, short = 's', value_name = "PATH")]
        source: Option<PathBuf>,

        /// Output format
        #[arg(long, value_enum, default_value = "text")]
        output: OutputFormat,
    },
}

#[derive(Parser, Debug)]
#[command(
    name = env!("CARGO_PKG_NAME"),
    version,
    about = "Run build specifications locally in a container",
    long_about = "Run build specifications locally in a container\n\nExecutes the phases of a buildspec.yml inside a disposable Docker or Podman container, streaming output and collecting artifacts.",
    color = clap::ColorChoice::Auto
)]
pub struct Cli {
    /// Log format (text or json, defaults to text, can be set via CODEBUILD_LOCAL_LOG_FORMAT env var)
    #[arg(long, global = true, value_enum)]
    pub log_format: Option<LogFormat>,

    /// Log level
    #[arg(long, global = true, value_enum, default_value = "warn")]
    pub log_level: LogLevel,

    /// Configuration file path (TOML)
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Container runtime to use (docker or podman, can be set via CODEBUILD_LOCAL_RUNTIME env var)
    #[arg(long, global = true, value_enum)]
    pub runtime: Option<RuntimeOption>,

    /// Disable secret redaction in output (debugging only - WARNING: may expose secrets)
    #[arg(long, global = true)]
    pub no_redact: bool,

    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    pub async fn dispatch(self) -> Result<()> {
        let log_format = match self.log_format {
            Some(LogFormat::Text) => Some("text"),
            Some(LogFormat::Json) => Some("json"),
            None => None,
        };

        let log_level = self.log_level.as_str();
        if std::env::var_os(codebuild_local_core::logging::LOG_FILTER_ENV).is_none()
            && std::env::var_os("RUST_LOG").is_none()
        {
            std::env::set_var(
                "RUST_LOG",
                format!(
                    "codebuild_local={},codebuild_local_core={}",
                    log_level, log_level
                ),
            );
        }
        codebuild_local_core::logging::init(log_format)?;
        tracing::debug!("CLI initialized with log level: {}", log_level);

        if self.no_redact {
            tracing::warn!("Secret redaction is DISABLED via --no-redact flag. Resolved secrets will appear in build output. Use only for debugging purposes!");
        }

        let context = CliContext {
            config: self.config,
            runtime: self.runtime,
            no_redact: self.no_redact,
            registry: SecretRegistry::new(),
        };

        match self.command {
            Commands::Run {
                image,
                source,
                buildspec,
                artifacts,
                working_dir,
                env,
                env_file,
                parameter_file,
                secret_file,
                command_timeout,
                stop_timeout,
                run_args,
                runtime_path,
                output,
            } => {
                use crate::commands::run::{execute_run, RunArgs};

                let args = RunArgs {
                    image,
                    source,
                    buildspec,
                    artifacts,
                    working_dir,
                    env,
                    env_files: env_file,
                    parameter_files: parameter_file,
                    secret_files: secret_file,
                    command_timeout,
                    stop_timeout,
                    run_args,
                    runtime_path,
                    output,
                };
                execute_run(args, context).await
            }
            Commands::Validate {
                buildspec,
                source,
                output,
            } => {
                use crate::commands::validate::{execute_validate, ValidateArgs};

                execute_validate(ValidateArgs {
                    buildspec,
                    source,
                    output,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_run_flags_parse() {
        let cli = Cli::try_parse_from([
            "codebuild-local",
            "--runtime",
            "podman",
            "run",
            "-i",
            "node:20",
            "-e",
            "STAGE=prod",
            "-e",
            "HOME",
            "--env-file",
            "a.env",
            "--run-args",
            "--network host",
            "--output",
            "json",
        ])
        .unwrap();

        assert_eq!(cli.runtime, Some(RuntimeOption::Podman));
        match cli.command {
            Commands::Run {
                image,
                env,
                env_file,
                run_args,
                output,
                ..
            } => {
                assert_eq!(image.as_deref(), Some("node:20"));
                assert_eq!(env, vec!["STAGE=prod", "HOME"]);
                assert_eq!(env_file, vec![PathBuf::from("a.env")]);
                assert_eq!(run_args.as_deref(), Some("--network host"));
                assert_eq!(output, OutputFormat::Json);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["codebuild-local", "validate", "--no-redact"]).unwrap();
        assert!(cli.no_redact);
        assert!(matches!(cli.command, Commands::Validate { .. }));
    }
}
