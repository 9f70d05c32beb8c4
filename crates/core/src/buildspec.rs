//! Build specification model and validation
//!
//! A build specification is a YAML document declaring environment variables,
//! up to four phases of shell commands and the artifacts to collect:
//!
//! ```yaml
//! version: 0.2
//! env:
//!   variables:
//!     STAGE: test
//!   secrets-manager:
//!     DB_PASSWORD: prod/db:password
//! phases:
//!   install:
//!     commands:
//!       - apt-get update
//!   build:
//!     on-failure: ABORT
//!     commands:
//!       - make
//!     finally:
//!       - make clean-tmp
//! artifacts:
//!   files:
//!     - target/**/*.jar
//! ```
//!
//! [`parse_buildspec`] is pure: it either returns a fully validated
//! [`BuildSpec`] or a [`SpecError`] naming the offending location.

use crate::errors::SpecError;
use indexmap::IndexMap;
use serde::Serialize;
use serde_yaml::{Mapping, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use tracing::{debug, instrument};

/// Default build specification file name inside the source directory
pub const DEFAULT_BUILDSPEC_FILE: &str = "buildspec.yml";

/// Prefix reserved for variables the runner itself injects
pub const RESERVED_ENV_PREFIX: &str = "CODEBUILD_";

const SUPPORTED_VERSIONS: &[&str] = &["0.1", "0.2"];

/// Recognized phase names, ordered by execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseName {
    Install,
    PreBuild,
    Build,
    PostBuild,
}

impl PhaseName {
    /// All phases in execution order
    pub const ORDER: [PhaseName; 4] = [
        PhaseName::Install,
        PhaseName::PreBuild,
        PhaseName::Build,
        PhaseName::PostBuild,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Install => "install",
            Self::PreBuild => "pre_build",
            Self::Build => "build",
            Self::PostBuild => "post_build",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        Self::ORDER.into_iter().find(|phase| phase.as_str() == name)
    }

    /// Whether the phase still runs after an earlier phase failed
    pub fn is_finalization(&self) -> bool {
        matches!(self, Self::PostBuild)
    }
}

impl fmt::Display for PhaseName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What happens when a command in a phase exits non-zero
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OnFailure {
    /// Fail the phase and skip to finalization
    #[default]
    Abort,
    /// Record the failure and move on to the next phase
    Continue,
}

/// Shell used to run each command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Shell {
    #[default]
    Sh,
    Bash,
}

impl Shell {
    pub fn program(&self) -> &'static str {
        match self {
            Self::Sh => "sh",
            Self::Bash => "bash",
        }
    }

    /// Argument vector running `command` through this shell
    pub fn argv(&self, command: &str) -> Vec<String> {
        vec![
            self.program().to_string(),
            "-c".to_string(),
            command.to_string(),
        ]
    }
}

/// One declared phase
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Phase {
    pub name: PhaseName,
    pub commands: Vec<String>,
    pub on_failure: OnFailure,
    /// Commands that run after `commands` whether or not they succeeded
    pub finally: Vec<String>,
}

/// Parsed `secrets-manager` reference
///
/// Written as `secret-id[:json-key[:version-stage[:version-id]]]`. A secret id
/// given as an ARN keeps its own colons (the first seven segments).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretReference {
    pub secret_id: String,
    pub json_key: Option<String>,
    pub version_stage: Option<String>,
    pub version_id: Option<String>,
}

impl SecretReference {
    pub fn parse(raw: &str) -> Result<Self, String> {
        let raw = raw.trim();
        let segments: Vec<&str> = raw.split(':').collect();

        let (secret_id, rest) = if raw.starts_with("arn:") {
            if segments.len() < 7 {
                return Err(format!("'{}' is not a complete secret ARN", raw));
            }
            (segments[..7].join(":"), &segments[7..])
        } else {
            (segments[0].to_string(), &segments[1..])
        };

        if secret_id.is_empty() {
            return Err("secret id is empty".to_string());
        }
        if rest.len() > 3 {
            return Err(format!(
                "'{}' has too many segments (expected secret-id[:json-key[:version-stage[:version-id]]])",
                raw
            ));
        }

        let segment = |idx: usize| {
            rest.get(idx)
                .map(|s| s.trim())
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };

        Ok(Self {
            secret_id,
            json_key: segment(0),
            version_stage: segment(1),
            version_id: segment(2),
        })
    }
}

impl fmt::Display for SecretReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.secret_id)?;
        if let Some(key) = &self.json_key {
            write!(f, ":{}", key)?;
        }
        Ok(())
    }
}

/// Environment declarations of a build specification
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvDeclarations {
    pub shell: Shell,
    pub variables: IndexMap<String, String>,
    /// Variable name to parameter name
    pub parameter_store: IndexMap<String, String>,
    pub secrets_manager: IndexMap<String, SecretReference>,
}

/// A group of artifact patterns sharing a destination
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactGroup {
    /// `None` for the primary `artifacts` group, the key for secondary groups
    pub identifier: Option<String>,
    pub files: Vec<String>,
    /// Directory inside the working directory patterns are relative to
    pub base_directory: Option<String>,
    pub discard_paths: bool,
    pub name: Option<String>,
}

/// A validated build specification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildSpec {
    pub version: String,
    pub env: EnvDeclarations,
    phases: BTreeMap<PhaseName, Phase>,
    /// Primary group first, then secondary groups in document order
    pub artifacts: Vec<ArtifactGroup>,
}

impl BuildSpec {
    pub fn phase(&self, name: PhaseName) -> Option<&Phase> {
        self.phases.get(&name)
    }

    /// Declared phases in execution order, regardless of document order
    pub fn phases(&self) -> impl Iterator<Item = &Phase> {
        self.phases.values()
    }

    pub fn phase_count(&self) -> usize {
        self.phases.len()
    }
}

/// Read and parse a build specification file
pub fn load_buildspec(path: &Path) -> Result<BuildSpec, SpecError> {
    let text = std::fs::read_to_string(path).map_err(|e| SpecError::Syntax {
        location: path.display().to_string(),
        reason: format!("cannot read file: {}", e),
    })?;
    parse_buildspec(&text)
}

/// Parse and validate a build specification document
#[instrument(skip_all)]
pub fn parse_buildspec(text: &str) -> Result<BuildSpec, SpecError> {
    let document: Value = serde_yaml::from_str(text).map_err(|e| SpecError::Syntax {
        location: e
            .location()
            .map(|loc| format!("line {} column {}", loc.line(), loc.column()))
            .unwrap_or_else(|| "document".to_string()),
        reason: e.to_string(),
    })?;

    let root = match &document {
        Value::Mapping(map) => map,
        Value::Null => return Err(SpecError::invalid("document", "document is empty")),
        _ => return Err(SpecError::invalid("document", "expected a mapping at the top level")),
    };

    let mut version = None;
    let mut env = EnvDeclarations::default();
    let mut phases = BTreeMap::new();
    let mut artifacts = Vec::new();
    let mut secondary = Vec::new();

    for (key, value) in root {
        let key = key_str(key, "document")?;
        match key {
            "version" => version = Some(parse_version(value)?),
            "env" => env = parse_env(value)?,
            "phases" => phases = parse_phases(value)?,
            "artifacts" => {
                if !value.is_null() {
                    artifacts.push(parse_artifact_group(value, None, "artifacts")?);
                }
            }
            "secondary-artifacts" => secondary = parse_secondary_artifacts(value)?,
            other => debug!("Ignoring unsupported top-level key '{}'", other),
        }
    }

    let version = version.ok_or_else(|| SpecError::invalid("version", "version is required"))?;
    artifacts.extend(secondary);

    debug!(
        "Parsed build specification version {} with {} phases and {} artifact groups",
        version,
        phases.len(),
        artifacts.len()
    );

    Ok(BuildSpec {
        version,
        env,
        phases,
        artifacts,
    })
}

fn key_str<'a>(key: &'a Value, location: &str) -> Result<&'a str, SpecError> {
    key.as_str()
        .ok_or_else(|| SpecError::invalid(location, "keys must be strings"))
}

fn mapping<'a>(value: &'a Value, location: &str) -> Result<&'a Mapping, SpecError> {
    value
        .as_mapping()
        .ok_or_else(|| SpecError::invalid(location, "expected a mapping"))
}

/// Stringify a scalar; sequences, mappings and null are rejected
fn scalar_string(value: &Value, location: &str) -> Result<String, SpecError> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        Value::Tagged(tagged) => scalar_string(&tagged.value, location),
        _ => Err(SpecError::invalid(location, "expected a scalar value")),
    }
}

fn parse_version(value: &Value) -> Result<String, SpecError> {
    let version = scalar_string(value, "version")?;
    if SUPPORTED_VERSIONS.contains(&version.as_str()) {
        Ok(version)
    } else {
        Err(SpecError::invalid(
            "version",
            format!(
                "unsupported version '{}' (supported: {})",
                version,
                SUPPORTED_VERSIONS.join(", ")
            ),
        ))
    }
}

fn parse_env(value: &Value) -> Result<EnvDeclarations, SpecError> {
    let mut env = EnvDeclarations::default();
    if value.is_null() {
        return Ok(env);
    }

    for (key, section) in mapping(value, "env")? {
        let key = key_str(key, "env")?;
        let location = format!("env.{}", key);
        match key {
            "shell" => {
                env.shell = match scalar_string(section, &location)?.as_str() {
                    "sh" => Shell::Sh,
                    "bash" => Shell::Bash,
                    other => {
                        return Err(SpecError::invalid(
                            location,
                            format!("unsupported shell '{}' (expected sh or bash)", other),
                        ))
                    }
                }
            }
            "variables" => {
                for (name, value) in env_entries(section, &location)? {
                    let entry = format!("{}.{}", location, name);
                    env.variables
                        .insert(name.to_string(), scalar_string(value, &entry)?);
                }
            }
            "parameter-store" => {
                for (name, value) in env_entries(section, &location)? {
                    let entry = format!("{}.{}", location, name);
                    let reference = scalar_string(value, &entry)?;
                    if reference.is_empty() || reference.chars().any(char::is_whitespace) {
                        return Err(SpecError::invalid(
                            entry,
                            "parameter name must be non-empty and contain no whitespace",
                        ));
                    }
                    env.parameter_store.insert(name.to_string(), reference);
                }
            }
            "secrets-manager" => {
                for (name, value) in env_entries(section, &location)? {
                    let entry = format!("{}.{}", location, name);
                    let reference = SecretReference::parse(&scalar_string(value, &entry)?)
                        .map_err(|reason| SpecError::invalid(&entry, reason))?;
                    env.secrets_manager.insert(name.to_string(), reference);
                }
            }
            other => debug!("Ignoring unsupported env key '{}'", other),
        }
    }

    Ok(env)
}

/// Entries of an env section with validated variable names
fn env_entries<'a>(
    section: &'a Value,
    location: &str,
) -> Result<Vec<(&'a str, &'a Value)>, SpecError> {
    if section.is_null() {
        return Ok(Vec::new());
    }

    let mut entries = Vec::new();
    for (key, value) in mapping(section, location)? {
        let name = key_str(key, location)?;
        let entry = format!("{}.{}", location, name);
        if !is_valid_env_name(name) {
            return Err(SpecError::invalid(
                entry,
                "variable names must match [A-Za-z_][A-Za-z0-9_]*",
            ));
        }
        if name.starts_with(RESERVED_ENV_PREFIX) {
            return Err(SpecError::invalid(
                entry,
                format!("the {} prefix is reserved", RESERVED_ENV_PREFIX),
            ));
        }
        entries.push((name, value));
    }
    Ok(entries)
}

pub(crate) fn is_valid_env_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn parse_phases(value: &Value) -> Result<BTreeMap<PhaseName, Phase>, SpecError> {
    let mut phases = BTreeMap::new();
    if value.is_null() {
        return Ok(phases);
    }

    for (key, body) in mapping(value, "phases")? {
        let key = key_str(key, "phases")?;
        let location = format!("phases.{}", key);
        let name = PhaseName::parse(key).ok_or_else(|| {
            SpecError::invalid(
                &location,
                format!(
                    "unknown phase '{}' (expected one of install, pre_build, build, post_build)",
                    key
                ),
            )
        })?;
        phases.insert(name, parse_phase(name, body, &location)?);
    }

    Ok(phases)
}

fn parse_phase(name: PhaseName, body: &Value, location: &str) -> Result<Phase, SpecError> {
    let mut phase = Phase {
        name,
        commands: Vec::new(),
        on_failure: OnFailure::default(),
        finally: Vec::new(),
    };

    for (key, value) in mapping(body, location)? {
        let key = key_str(key, location)?;
        let field = format!("{}.{}", location, key);
        match key {
            "commands" => phase.commands = command_list(value, &field)?,
            "finally" => phase.finally = command_list(value, &field)?,
            "on-failure" => {
                phase.on_failure = match scalar_string(value, &field)?.to_uppercase().as_str() {
                    "ABORT" => OnFailure::Abort,
                    "CONTINUE" => OnFailure::Continue,
                    other => {
                        return Err(SpecError::invalid(
                            field,
                            format!("unsupported policy '{}' (expected ABORT or CONTINUE)", other),
                        ))
                    }
                }
            }
            other => debug!("Ignoring unsupported key '{}' in phase {}", other, name),
        }
    }

    if phase.commands.is_empty() && phase.finally.is_empty() {
        return Err(SpecError::invalid(
            format!("{}.commands", location),
            "phase declares no commands",
        ));
    }

    Ok(phase)
}

fn command_list(value: &Value, location: &str) -> Result<Vec<String>, SpecError> {
    if value.is_null() {
        return Ok(Vec::new());
    }
    let items = value
        .as_sequence()
        .ok_or_else(|| SpecError::invalid(location, "expected a list of commands"))?;

    items
        .iter()
        .enumerate()
        .map(|(idx, item)| {
            let entry = format!("{}[{}]", location, idx);
            let command = scalar_string(item, &entry)?;
            if command.trim().is_empty() {
                Err(SpecError::invalid(entry, "command is empty"))
            } else {
                Ok(command)
            }
        })
        .collect()
}

fn parse_secondary_artifacts(value: &Value) -> Result<Vec<ArtifactGroup>, SpecError> {
    if value.is_null() {
        return Ok(Vec::new());
    }

    let mut groups = Vec::new();
    for (key, body) in mapping(value, "secondary-artifacts")? {
        let identifier = key_str(key, "secondary-artifacts")?;
        let location = format!("secondary-artifacts.{}", identifier);
        let valid = !identifier.is_empty()
            && identifier
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if !valid {
            return Err(SpecError::invalid(
                location,
                "artifact identifiers must consist of letters, digits, '_' and '-'",
            ));
        }
        groups.push(parse_artifact_group(
            body,
            Some(identifier.to_string()),
            &location,
        )?);
    }
    Ok(groups)
}

fn parse_artifact_group(
    value: &Value,
    identifier: Option<String>,
    location: &str,
) -> Result<ArtifactGroup, SpecError> {
    let mut group = ArtifactGroup {
        identifier,
        files: Vec::new(),
        base_directory: None,
        discard_paths: false,
        name: None,
    };

    for (key, field_value) in mapping(value, location)? {
        let key = key_str(key, location)?;
        let field = format!("{}.{}", location, key);
        match key {
            "files" => {
                let items = field_value
                    .as_sequence()
                    .ok_or_else(|| SpecError::invalid(&field, "expected a list of patterns"))?;
                for (idx, item) in items.iter().enumerate() {
                    let entry = format!("{}[{}]", field, idx);
                    let pattern = scalar_string(item, &entry)?;
                    validate_relative_path(&pattern, &entry)?;
                    group.files.push(pattern);
                }
            }
            "base-directory" => {
                let dir = scalar_string(field_value, &field)?;
                validate_relative_path(&dir, &field)?;
                group.base_directory = Some(dir.trim_end_matches('/').to_string());
            }
            "discard-paths" => group.discard_paths = parse_yes_no(field_value, &field)?,
            "name" => group.name = Some(scalar_string(field_value, &field)?),
            other => debug!("Ignoring unsupported artifact key '{}'", other),
        }
    }

    if group.files.is_empty() {
        return Err(SpecError::invalid(
            format!("{}.files", location),
            "at least one file pattern is required",
        ));
    }

    Ok(group)
}

fn validate_relative_path(path: &str, location: &str) -> Result<(), SpecError> {
    if path.trim().is_empty() {
        return Err(SpecError::invalid(location, "pattern is empty"));
    }
    if path.starts_with('/') {
        return Err(SpecError::invalid(
            location,
            "must be relative to the working directory",
        ));
    }
    if path.split('/').any(|segment| segment == "..") {
        return Err(SpecError::invalid(location, "must not contain '..'"));
    }
    Ok(())
}

fn parse_yes_no(value: &Value, location: &str) -> Result<bool, SpecError> {
    match value {
        Value::Bool(b) => Ok(*b),
        _ => match scalar_string(value, location)?.to_lowercase().as_str() {
            "yes" | "true" => Ok(true),
            "no" | "false" => Ok(false),
            other => Err(SpecError::invalid(
                location,
                format!("expected yes or no, got '{}'", other),
            )),
        },
    }
}
