//! Error types and handling
//!
//! The error taxonomy mirrors the stages of a run: specification errors,
//! environment resolution errors, container session errors and artifact
//! errors each get a domain enum, and [`BuildError`] wraps them for unified
//! propagation. Command failures inside a phase are not errors at this level;
//! they are recorded by the phase executor as [`crate::executor::PhaseResult`]s.

use thiserror::Error;

/// Process exit codes for each failure class
pub mod exit_codes {
    /// The run reached `SUCCEEDED`
    pub const SUCCESS: i32 = 0;
    /// Unexpected or internal error
    pub const INTERNAL: i32 = 1;
    /// The build specification failed to parse or validate
    pub const SPEC: i32 = 2;
    /// An environment variable reference could not be resolved
    pub const ENV_RESOLUTION: i32 = 3;
    /// The container engine failed to create, start, stop or remove the session
    pub const SESSION: i32 = 4;
    /// A phase failed and the run ended `FAILED`
    pub const PHASE_FAILED: i32 = 5;
    /// Artifact collection failed on an otherwise successful run
    pub const ARTIFACT: i32 = 6;
    /// The run was interrupted
    pub const CANCELLED: i32 = 130;
}

/// Build specification errors
///
/// Always carries the location inside the document (a dotted key path such as
/// `phases.build.commands[2]`, or a line/column for syntax errors) so the user
/// can find the offending entry.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SpecError {
    /// The document is not well-formed YAML
    #[error("Failed to parse build specification at {location}: {reason}")]
    Syntax { location: String, reason: String },

    /// The document parsed but violates a validation rule
    #[error("Invalid build specification at {location}: {reason}")]
    Invalid { location: String, reason: String },
}

impl SpecError {
    pub(crate) fn invalid(location: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Invalid {
            location: location.into(),
            reason: reason.into(),
        }
    }

    /// Location inside the document the error refers to
    pub fn location(&self) -> &str {
        match self {
            Self::Syntax { location, .. } | Self::Invalid { location, .. } => location,
        }
    }
}

/// Where an environment variable value was supposed to come from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvSource {
    /// Inherited from the invoking process (env files and `--env` flags)
    Inherited,
    /// Plaintext `env.variables`
    Plaintext,
    /// `env.parameter-store`
    ParameterStore,
    /// `env.secrets-manager`
    SecretsManager,
}

impl std::fmt::Display for EnvSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Inherited => "inherited",
            Self::Plaintext => "variables",
            Self::ParameterStore => "parameter-store",
            Self::SecretsManager => "secrets-manager",
        };
        write!(f, "{}", name)
    }
}

/// Environment resolution errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EnvResolutionError {
    /// A referenced external value could not be resolved
    #[error("Unable to resolve {key} from {source_kind} reference '{reference}': {reason}")]
    Unresolved {
        key: String,
        source_kind: EnvSource,
        reference: String,
        reason: String,
    },

    /// An inherited variable could not be loaded
    #[error("Unable to load inherited environment from {origin}: {reason}")]
    Inherited { origin: String, reason: String },
}

/// Container session errors (create, start, exec, stop, remove, copy)
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// The container runtime binary is missing or not accessible
    #[error("Container runtime '{runtime}' is not installed or not accessible")]
    NotInstalled { runtime: String },

    /// The runtime CLI reported an error
    #[error("Container runtime error: {0}")]
    Runtime(String),

    /// The container could not be created or started from the image
    #[error("Failed to start container from image '{image}': {reason}")]
    StartFailed { image: String, reason: String },

    /// The session was already closed
    #[error("Container session {id} is already closed")]
    Closed { id: String },

    /// Executing a command inside the container failed (not a non-zero exit)
    #[error("Failed to execute command in container {id}: {reason}")]
    ExecFailed { id: String, reason: String },

    /// Tearing down the container failed
    #[error("Failed to remove container {id}: {reason}")]
    TeardownFailed { id: String, reason: String },
}

/// Artifact collection errors
///
/// Non-fatal: reported next to the run result without changing its outcome.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ArtifactError {
    /// A pattern matched no file in the container
    #[error("Artifact pattern '{pattern}' matched no files under '{base}'")]
    NoMatch { pattern: String, base: String },

    /// The local destination could not be written
    #[error("Artifact destination '{destination}' is not writable: {reason}")]
    Destination { destination: String, reason: String },

    /// The archive copied out of the container could not be read
    #[error("Failed to read artifacts from container: {reason}")]
    Archive { reason: String },
}

/// Configuration-related errors (config file, CLI values)
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Configuration file parsing error
    #[error("Failed to parse configuration file {path}: {message}")]
    Parsing { path: String, message: String },

    /// Configuration validation error
    #[error("Configuration validation error: {message}")]
    Validation { message: String },

    /// Configuration file I/O error
    #[error("Failed to read configuration file")]
    Io(#[from] std::io::Error),
}

/// Main error enum wrapping all domain-specific errors
#[derive(Error, Debug)]
pub enum BuildError {
    /// Build specification errors
    #[error("Build specification error: {0}")]
    Spec(#[from] SpecError),

    /// Environment resolution errors
    #[error("Environment error: {0}")]
    Env(#[from] EnvResolutionError),

    /// Container session errors
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    /// Artifact errors surfaced directly (outside of a run report)
    #[error("Artifact error: {0}")]
    Artifact(#[from] ArtifactError),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Internal/generic errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl BuildError {
    /// Process exit code for this error class
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Spec(_) => exit_codes::SPEC,
            Self::Env(_) => exit_codes::ENV_RESOLUTION,
            Self::Session(_) => exit_codes::SESSION,
            Self::Artifact(_) => exit_codes::ARTIFACT,
            Self::Config(_) | Self::Internal(_) => exit_codes::INTERNAL,
        }
    }
}

/// Convenience type alias for Results with BuildError
pub type Result<T> = std::result::Result<T, BuildError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;

    #[test]
    fn test_spec_error_display() {
        let error = SpecError::invalid("phases.compile", "unknown phase name");
        assert_eq!(
            format!("{}", error),
            "Invalid build specification at phases.compile: unknown phase name"
        );
        assert_eq!(error.location(), "phases.compile");

        let error = SpecError::Syntax {
            location: "line 3 column 5".to_string(),
            reason: "mapping values are not allowed here".to_string(),
        };
        assert!(format!("{}", error).starts_with("Failed to parse build specification at line 3"));
    }

    #[test]
    fn test_env_error_names_key_and_source() {
        let error = EnvResolutionError::Unresolved {
            key: "DB_PASSWORD".to_string(),
            source_kind: EnvSource::SecretsManager,
            reference: "prod/db".to_string(),
            reason: "not found".to_string(),
        };
        let message = format!("{}", error);
        assert!(message.contains("DB_PASSWORD"));
        assert!(message.contains("secrets-manager"));
        assert!(message.contains("prod/db"));
    }

    #[test]
    fn test_exit_codes_per_class() {
        let spec: BuildError = SpecError::invalid("version", "missing").into();
        assert_eq!(spec.exit_code(), exit_codes::SPEC);

        let env: BuildError = EnvResolutionError::Inherited {
            origin: "vars.env".to_string(),
            reason: "missing".to_string(),
        }
        .into();
        assert_eq!(env.exit_code(), exit_codes::ENV_RESOLUTION);

        let session: BuildError = SessionError::Runtime("boom".to_string()).into();
        assert_eq!(session.exit_code(), exit_codes::SESSION);

        let artifact: BuildError = ArtifactError::Archive {
            reason: "truncated".to_string(),
        }
        .into();
        assert_eq!(artifact.exit_code(), exit_codes::ARTIFACT);

        assert_eq!(
            BuildError::Internal("x".to_string()).exit_code(),
            exit_codes::INTERNAL
        );
    }

    #[test]
    fn test_anyhow_conversions() {
        let error = BuildError::Session(SessionError::NotInstalled {
            runtime: "docker".to_string(),
        });
        let anyhow_error = anyhow::Error::from(error);
        assert!(anyhow_error.to_string().contains("Session error"));
        assert!(anyhow_error.downcast_ref::<BuildError>().is_some());
    }

    #[test]
    fn test_error_source_chain() {
        let io_error = std::io::Error::new(std::io::ErrorKind::NotFound, "File not found");
        let build_error = BuildError::Config(ConfigError::Io(io_error));

        assert!(build_error.source().is_some());
        if let Some(source) = build_error.source() {
            assert!(source.source().is_some());
        }
    }
}
