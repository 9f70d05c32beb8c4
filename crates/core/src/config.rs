//! Runner configuration
//!
//! Settings come from four layers, highest precedence first:
//!
//! 1. command line flags ([`ConfigOverrides`])
//! 2. `CODEBUILD_LOCAL_*` environment variables
//! 3. a TOML config file: `--config`, else `<source>/.codebuild-local.toml`,
//!    else `codebuild-local/config.toml` in the user config directory
//! 4. built-in defaults
//!
//! List settings (env files, store files, `--env` overrides) are not replaced
//! by higher layers: the file's entries come first and the command line's are
//! appended, so later entries win where order matters.

use crate::build::DEFAULT_WORKING_DIR;
use crate::buildspec::DEFAULT_BUILDSPEC_FILE;
use crate::errors::{BuildError, ConfigError, Result};
use crate::runtime::RuntimeKind;
use directories_next::ProjectDirs;
use indexmap::IndexMap;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, instrument};

/// Config file looked up in the source directory
pub const CONFIG_FILE_NAME: &str = ".codebuild-local.toml";

/// Prefix of the environment variable layer
pub const ENV_PREFIX: &str = "CODEBUILD_LOCAL_";

/// Image used when none is configured
pub const DEFAULT_IMAGE: &str = "public.ecr.aws/codebuild/amazonlinux2-x86_64-standard:5.0";

/// Artifact directory (relative to the source directory) when none is configured
pub const DEFAULT_ARTIFACTS_DIR: &str = "artifacts";

/// Contents of a TOML config file
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct ConfigFile {
    pub image: Option<String>,
    pub buildspec: Option<PathBuf>,
    pub working_dir: Option<String>,
    pub artifacts_dir: Option<PathBuf>,
    pub runtime: Option<String>,
    pub runtime_path: Option<String>,
    /// Per-command timeout in seconds
    pub command_timeout: Option<u64>,
    /// Container stop grace period in seconds
    pub stop_timeout: Option<u32>,
    #[serde(default)]
    pub env_files: Vec<PathBuf>,
    #[serde(default)]
    pub parameter_files: Vec<PathBuf>,
    #[serde(default)]
    pub secret_files: Vec<PathBuf>,
    #[serde(default)]
    pub env: IndexMap<String, String>,
    /// Extra container create arguments, shell-quoted
    pub run_args: Option<String>,
    pub redact: Option<bool>,
}

/// Values given on the command line
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub config_path: Option<PathBuf>,
    pub image: Option<String>,
    pub source_dir: Option<PathBuf>,
    pub buildspec: Option<PathBuf>,
    pub working_dir: Option<String>,
    pub artifacts_dir: Option<PathBuf>,
    pub runtime: Option<RuntimeKind>,
    pub runtime_path: Option<String>,
    pub command_timeout: Option<u64>,
    pub stop_timeout: Option<u32>,
    pub env_files: Vec<PathBuf>,
    pub parameter_files: Vec<PathBuf>,
    pub secret_files: Vec<PathBuf>,
    /// `KEY=VALUE` or bare `KEY` entries
    pub env: Vec<String>,
    pub run_args: Option<String>,
    /// `Some(false)` for `--no-redact`
    pub redact: Option<bool>,
}

/// Fully resolved settings of a run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunnerConfig {
    pub image: String,
    pub source_dir: PathBuf,
    pub buildspec: PathBuf,
    pub working_dir: String,
    pub artifacts_dir: PathBuf,
    pub runtime: RuntimeKind,
    pub runtime_path: Option<String>,
    pub command_timeout: Option<Duration>,
    pub stop_timeout: Option<u32>,
    pub env_files: Vec<PathBuf>,
    pub parameter_files: Vec<PathBuf>,
    pub secret_files: Vec<PathBuf>,
    pub env_overrides: Vec<String>,
    pub extra_args: Vec<String>,
    pub redact: bool,
    /// Config file that contributed, if any
    pub config_file: Option<PathBuf>,
}

impl RunnerConfig {
    /// Resolve against the process environment and the discovered config file
    #[instrument(skip_all)]
    pub fn resolve(overrides: ConfigOverrides) -> Result<Self> {
        let source_dir = overrides
            .source_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from("."));
        let file = match &overrides.config_path {
            Some(path) => Some((path.clone(), ConfigLoader::load_from_path(path)?)),
            None => ConfigLoader::discover(&source_dir)?,
        };
        Self::resolve_with(overrides, file, |key| std::env::var(key).ok())
    }

    /// Resolve from explicit layers
    pub fn resolve_with<F>(
        overrides: ConfigOverrides,
        file: Option<(PathBuf, ConfigFile)>,
        env: F,
    ) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let (config_file, file) = match file {
            Some((path, file)) => (Some(path), file),
            None => (None, ConfigFile::default()),
        };
        let var = |name: &str| env(&format!("{}{}", ENV_PREFIX, name)).filter(|v| !v.is_empty());

        let source_dir = overrides
            .source_dir
            .unwrap_or_else(|| PathBuf::from("."));

        let image = overrides
            .image
            .or_else(|| var("IMAGE"))
            .or(file.image)
            .unwrap_or_else(|| DEFAULT_IMAGE.to_string());

        let buildspec = overrides
            .buildspec
            .or_else(|| var("BUILDSPEC").map(PathBuf::from))
            .or(file.buildspec)
            .map(|path| relative_to(&source_dir, path))
            .unwrap_or_else(|| source_dir.join(DEFAULT_BUILDSPEC_FILE));

        let working_dir = overrides
            .working_dir
            .or_else(|| var("WORKING_DIR"))
            .or(file.working_dir)
            .unwrap_or_else(|| DEFAULT_WORKING_DIR.to_string());
        if !working_dir.starts_with('/') {
            return Err(validation(format!(
                "working directory must be an absolute container path, got '{}'",
                working_dir
            )));
        }

        let artifacts_dir = overrides
            .artifacts_dir
            .or_else(|| var("ARTIFACTS_DIR").map(PathBuf::from))
            .or(file.artifacts_dir)
            .map(|path| relative_to(&source_dir, path))
            .unwrap_or_else(|| source_dir.join(DEFAULT_ARTIFACTS_DIR));

        let configured_runtime = file
            .runtime
            .as_deref()
            .map(str::parse::<RuntimeKind>)
            .transpose()
            .map_err(|e| validation(e.to_string()))?;
        let runtime = match (overrides.runtime, var("RUNTIME")) {
            (Some(runtime), _) => runtime,
            (None, Some(value)) => value.parse().map_err(|e: crate::errors::SessionError| {
                validation(format!("{}RUNTIME: {}", ENV_PREFIX, e))
            })?,
            (None, None) => configured_runtime.unwrap_or(RuntimeKind::Docker),
        };

        let runtime_path = overrides
            .runtime_path
            .or_else(|| var("RUNTIME_PATH"))
            .or(file.runtime_path);

        let command_timeout = match overrides.command_timeout {
            Some(secs) => Some(secs),
            None => parse_number::<u64>(var("COMMAND_TIMEOUT"), "COMMAND_TIMEOUT")?
                .or(file.command_timeout),
        };
        if command_timeout == Some(0) {
            return Err(validation("command timeout must be greater than zero"));
        }

        let stop_timeout = match overrides.stop_timeout {
            Some(secs) => Some(secs),
            None => parse_number::<u32>(var("STOP_TIMEOUT"), "STOP_TIMEOUT")?.or(file.stop_timeout),
        };

        let run_args = overrides
            .run_args
            .or_else(|| var("RUN_ARGS"))
            .or(file.run_args);
        let extra_args = match run_args {
            Some(args) => shell_words::split(&args)
                .map_err(|e| validation(format!("invalid run arguments '{}': {}", args, e)))?,
            None => Vec::new(),
        };

        let redact = match overrides.redact {
            Some(redact) => redact,
            None => match var("REDACT") {
                Some(value) => parse_bool(&value)
                    .ok_or_else(|| validation(format!("{}REDACT: expected a boolean", ENV_PREFIX)))?,
                None => file.redact.unwrap_or(true),
            },
        };

        let mut env_overrides: Vec<String> = file
            .env
            .iter()
            .map(|(key, value)| format!("{}={}", key, value))
            .collect();
        env_overrides.extend(overrides.env);

        let config = Self {
            image,
            buildspec,
            working_dir,
            artifacts_dir,
            runtime,
            runtime_path,
            command_timeout: command_timeout.map(Duration::from_secs),
            stop_timeout,
            env_files: concat(file.env_files, overrides.env_files),
            parameter_files: concat(file.parameter_files, overrides.parameter_files),
            secret_files: concat(file.secret_files, overrides.secret_files),
            env_overrides,
            extra_args,
            redact,
            config_file,
            source_dir,
        };
        debug!("Resolved runner configuration: {:?}", config);
        Ok(config)
    }
}

fn validation(message: impl Into<String>) -> BuildError {
    BuildError::Config(ConfigError::Validation {
        message: message.into(),
    })
}

fn relative_to(base: &Path, path: PathBuf) -> PathBuf {
    if path.is_absolute() {
        path
    } else {
        base.join(path)
    }
}

fn concat(mut first: Vec<PathBuf>, second: Vec<PathBuf>) -> Vec<PathBuf> {
    first.extend(second);
    first
}

fn parse_number<T: std::str::FromStr>(value: Option<String>, name: &str) -> Result<Option<T>> {
    value
        .map(|v| {
            v.trim()
                .parse::<T>()
                .map_err(|_| validation(format!("{}{}: expected a number, got '{}'", ENV_PREFIX, name, v)))
        })
        .transpose()
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Finds and reads config files
pub struct ConfigLoader;

impl ConfigLoader {
    /// Read and parse a TOML config file
    #[instrument(skip_all, fields(path = %path.display()))]
    pub fn load_from_path(path: &Path) -> Result<ConfigFile> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        let file: ConfigFile = toml::from_str(&content).map_err(|e| ConfigError::Parsing {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        debug!("Loaded configuration from {}", path.display());
        Ok(file)
    }

    /// The source directory's config file, else the user's
    pub fn discover(source_dir: &Path) -> Result<Option<(PathBuf, ConfigFile)>> {
        let candidates = std::iter::once(source_dir.join(CONFIG_FILE_NAME)).chain(
            Self::user_config_path(),
        );
        for path in candidates {
            if path.is_file() {
                let file = Self::load_from_path(&path)?;
                return Ok(Some((path, file)));
            }
        }
        debug!("No configuration file found");
        Ok(None)
    }

    /// `config.toml` in the platform's user config directory
    pub fn user_config_path() -> Option<PathBuf> {
        ProjectDirs::from("", "", "codebuild-local").map(|dirs| dirs.config_dir().join("config.toml"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = RunnerConfig::resolve_with(
            ConfigOverrides {
                source_dir: Some(PathBuf::from("/src")),
                ..Default::default()
            },
            None,
            no_env,
        )
        .unwrap();

        assert_eq!(config.image, DEFAULT_IMAGE);
        assert_eq!(config.buildspec, PathBuf::from("/src/buildspec.yml"));
        assert_eq!(config.artifacts_dir, PathBuf::from("/src/artifacts"));
        assert_eq!(config.working_dir, DEFAULT_WORKING_DIR);
        assert_eq!(config.runtime, RuntimeKind::Docker);
        assert_eq!(config.command_timeout, None);
        assert!(config.redact);
        assert!(config.extra_args.is_empty());
    }

    #[test]
    fn test_layer_precedence() {
        let file = ConfigFile {
            image: Some("from-file".to_string()),
            stop_timeout: Some(3),
            command_timeout: Some(60),
            runtime: Some("podman".to_string()),
            ..Default::default()
        };
        let env = env_of(&[
            ("CODEBUILD_LOCAL_IMAGE", "from-env"),
            ("CODEBUILD_LOCAL_COMMAND_TIMEOUT", "30"),
        ]);

        let config = RunnerConfig::resolve_with(
            ConfigOverrides::default(),
            Some((PathBuf::from("cfg.toml"), file.clone())),
            &env,
        )
        .unwrap();
        assert_eq!(config.image, "from-env");
        assert_eq!(config.command_timeout, Some(Duration::from_secs(30)));
        assert_eq!(config.stop_timeout, Some(3));
        assert_eq!(config.runtime, RuntimeKind::Podman);
        assert_eq!(config.config_file, Some(PathBuf::from("cfg.toml")));

        let config = RunnerConfig::resolve_with(
            ConfigOverrides {
                image: Some("from-cli".to_string()),
                runtime: Some(RuntimeKind::Docker),
                ..Default::default()
            },
            Some((PathBuf::from("cfg.toml"), file)),
            &env,
        )
        .unwrap();
        assert_eq!(config.image, "from-cli");
        assert_eq!(config.runtime, RuntimeKind::Docker);
    }

    #[test]
    fn test_lists_accumulate_file_then_cli() {
        let mut file = ConfigFile {
            env_files: vec![PathBuf::from("base.env")],
            ..Default::default()
        };
        file.env.insert("STAGE".to_string(), "dev".to_string());

        let config = RunnerConfig::resolve_with(
            ConfigOverrides {
                env_files: vec![PathBuf::from("local.env")],
                env: vec!["STAGE=prod".to_string()],
                ..Default::default()
            },
            Some((PathBuf::from("cfg.toml"), file)),
            no_env,
        )
        .unwrap();

        assert_eq!(
            config.env_files,
            vec![PathBuf::from("base.env"), PathBuf::from("local.env")]
        );
        assert_eq!(config.env_overrides, vec!["STAGE=dev", "STAGE=prod"]);
    }

    #[test]
    fn test_run_args_are_shell_split() {
        let config = RunnerConfig::resolve_with(
            ConfigOverrides {
                run_args: Some("--network host -e 'GREETING=hello world'".to_string()),
                ..Default::default()
            },
            None,
            no_env,
        )
        .unwrap();
        assert_eq!(
            config.extra_args,
            vec!["--network", "host", "-e", "GREETING=hello world"]
        );

        let error = RunnerConfig::resolve_with(
            ConfigOverrides {
                run_args: Some("--label 'unterminated".to_string()),
                ..Default::default()
            },
            None,
            no_env,
        )
        .unwrap_err();
        assert!(error.to_string().contains("invalid run arguments"));
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let bad_timeout = env_of(&[("CODEBUILD_LOCAL_COMMAND_TIMEOUT", "soon")]);
        assert!(RunnerConfig::resolve_with(ConfigOverrides::default(), None, bad_timeout).is_err());

        let zero = ConfigOverrides {
            command_timeout: Some(0),
            ..Default::default()
        };
        assert!(RunnerConfig::resolve_with(zero, None, no_env).is_err());

        let relative = ConfigOverrides {
            working_dir: Some("src".to_string()),
            ..Default::default()
        };
        assert!(RunnerConfig::resolve_with(relative, None, no_env).is_err());

        let redact = env_of(&[("CODEBUILD_LOCAL_REDACT", "off")]);
        let config = RunnerConfig::resolve_with(ConfigOverrides::default(), None, redact).unwrap();
        assert!(!config.redact);
    }

    #[test]
    fn test_load_and_discover_config_file() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join(CONFIG_FILE_NAME),
            r#"
image = "node:20"
command-timeout = 120
env-files = ["ci.env"]
run-args = "--memory 2g"

[env]
NODE_ENV = "test"
"#,
        )
        .unwrap();

        let (path, file) = ConfigLoader::discover(dir.path()).unwrap().unwrap();
        assert_eq!(path, dir.path().join(CONFIG_FILE_NAME));
        assert_eq!(file.image.as_deref(), Some("node:20"));
        assert_eq!(file.command_timeout, Some(120));
        assert_eq!(file.env.get("NODE_ENV").map(String::as_str), Some("test"));

        std::fs::write(dir.path().join("bad.toml"), "imagee = \"typo\"\n").unwrap();
        let error = ConfigLoader::load_from_path(&dir.path().join("bad.toml")).unwrap_err();
        assert!(matches!(
            error,
            BuildError::Config(ConfigError::Parsing { .. })
        ));
    }
}
