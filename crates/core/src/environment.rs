//! Environment resolution
//!
//! Builds the single environment mapping applied to every command of a run.
//! Layers are merged eagerly, lowest precedence first:
//!
//! 0. built-in `CODEBUILD_*` variables supplied by the runner
//! 1. the inherited environment (env files and `--env` flags)
//! 2. plaintext `env.variables`
//! 3. `env.parameter-store` values
//! 4. `env.secrets-manager` values
//!
//! The order is fixed regardless of declaration order in the document. Any
//! unresolved reference fails the whole resolution; no partial mapping is
//! ever returned.

use crate::buildspec::{EnvDeclarations, SecretReference};
use crate::errors::{EnvResolutionError, EnvSource};
use crate::redaction::SecretRegistry;
use crate::store::{parse_key_value_lines, StoreReference, ValueStore};
use indexmap::IndexMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, instrument, warn};

/// Variable the executor overlays on each command with `1` or `0`
pub const BUILD_SUCCEEDING_VAR: &str = "CODEBUILD_BUILD_SUCCEEDING";

/// Initiator reported to builds run locally
pub const LOCAL_INITIATOR: &str = "codebuild-local";

/// Ordered, immutable key/value mapping applied to every exec
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvironmentMapping {
    vars: IndexMap<String, String>,
}

impl EnvironmentMapping {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    /// Copy of the mapping with `overlay` applied on top
    ///
    /// The mapping itself is never changed.
    pub fn with_overlay(&self, overlay: &[(&str, &str)]) -> Vec<(String, String)> {
        let mut merged = self.vars.clone();
        for (key, value) in overlay {
            merged.insert((*key).to_string(), (*value).to_string());
        }
        merged.into_iter().collect()
    }
}

impl FromIterator<(String, String)> for EnvironmentMapping {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self {
            vars: iter.into_iter().collect(),
        }
    }
}

/// Built-in variables describing the run
#[derive(Debug, Clone)]
pub struct BuiltinVariables {
    pub build_id: String,
    pub image: String,
    pub source_dir: String,
    pub start_time_millis: i64,
}

impl BuiltinVariables {
    pub fn to_layer(&self) -> Vec<(String, String)> {
        vec![
            ("CODEBUILD_BUILD_ID".to_string(), self.build_id.clone()),
            ("CODEBUILD_BUILD_IMAGE".to_string(), self.image.clone()),
            ("CODEBUILD_SRC_DIR".to_string(), self.source_dir.clone()),
            (
                "CODEBUILD_INITIATOR".to_string(),
                LOCAL_INITIATOR.to_string(),
            ),
            (
                "CODEBUILD_START_TIME".to_string(),
                self.start_time_millis.to_string(),
            ),
        ]
    }
}

/// Variables inherited from the invoking process
#[derive(Debug, Clone, Default)]
pub struct InheritedEnvironment {
    vars: IndexMap<String, String>,
}

impl InheritedEnvironment {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load KEY=VALUE env files in order; later files win
    #[instrument(skip_all)]
    pub fn from_env_files<P: AsRef<Path>>(paths: &[P]) -> Result<Self, EnvResolutionError> {
        let mut inherited = Self::new();
        for path in paths {
            let path = path.as_ref();
            let content =
                std::fs::read_to_string(path).map_err(|e| EnvResolutionError::Inherited {
                    origin: path.display().to_string(),
                    reason: e.to_string(),
                })?;
            let entries = parse_key_value_lines(&content, &path.display().to_string());
            debug!("Loaded {} variables from {}", entries.len(), path.display());
            inherited.vars.extend(entries);
        }
        Ok(inherited)
    }

    /// Apply `KEY=VALUE` or `KEY` overrides
    ///
    /// A bare `KEY` copies the value from the host environment and is skipped
    /// with a warning when the host does not define it.
    pub fn apply_overrides<S: AsRef<str>>(
        &mut self,
        overrides: &[S],
    ) -> Result<(), EnvResolutionError> {
        for raw in overrides {
            let raw = raw.as_ref();
            match raw.split_once('=') {
                Some((key, value)) => {
                    let key = key.trim();
                    if key.is_empty() {
                        return Err(EnvResolutionError::Inherited {
                            origin: format!("--env {}", raw),
                            reason: "empty variable name".to_string(),
                        });
                    }
                    self.vars.insert(key.to_string(), value.to_string());
                }
                None => match std::env::var(raw.trim()) {
                    Ok(value) => {
                        self.vars.insert(raw.trim().to_string(), value);
                    }
                    Err(_) => warn!("Host variable {} is not set; not passing it", raw.trim()),
                },
            }
        }
        Ok(())
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.vars.insert(key.into(), value.into());
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }
}

/// Merges the environment layers of a run
pub struct EnvironmentResolver {
    parameter_store: Arc<dyn ValueStore>,
    secrets_store: Arc<dyn ValueStore>,
    registry: SecretRegistry,
    builtins: Vec<(String, String)>,
}

impl EnvironmentResolver {
    pub fn new(parameter_store: Arc<dyn ValueStore>, secrets_store: Arc<dyn ValueStore>) -> Self {
        Self {
            parameter_store,
            secrets_store,
            registry: SecretRegistry::new(),
            builtins: Vec::new(),
        }
    }

    /// Register resolved external values with `registry` for redaction
    pub fn with_registry(mut self, registry: SecretRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_builtins(mut self, builtins: &BuiltinVariables) -> Self {
        self.builtins = builtins.to_layer();
        self
    }

    /// Resolve all layers into one mapping
    #[instrument(skip_all)]
    pub async fn resolve(
        &self,
        decls: &EnvDeclarations,
        inherited: &InheritedEnvironment,
    ) -> Result<EnvironmentMapping, EnvResolutionError> {
        let mut parameters = Vec::with_capacity(decls.parameter_store.len());
        for (key, name) in &decls.parameter_store {
            let value = self
                .parameter_store
                .resolve(&StoreReference::named(name))
                .await
                .map_err(|e| EnvResolutionError::Unresolved {
                    key: key.clone(),
                    source_kind: EnvSource::ParameterStore,
                    reference: name.clone(),
                    reason: e.to_string(),
                })?;
            parameters.push((key.clone(), value));
        }

        let mut secrets = Vec::with_capacity(decls.secrets_manager.len());
        for (key, reference) in &decls.secrets_manager {
            secrets.push((key.clone(), self.resolve_secret(key, reference).await?));
        }

        // Only register once the whole resolution succeeded
        self.registry.add_secrets(
            parameters
                .iter()
                .chain(secrets.iter())
                .map(|(_, value)| value.clone()),
        );

        let mut vars: IndexMap<String, String> = IndexMap::new();
        vars.extend(self.builtins.iter().cloned());
        vars.extend(inherited.vars.iter().map(|(k, v)| (k.clone(), v.clone())));
        vars.extend(
            decls
                .variables
                .iter()
                .map(|(k, v)| (k.clone(), v.clone())),
        );
        vars.extend(parameters);
        vars.extend(secrets);

        debug!(
            "Resolved {} environment variables ({} from parameter store, {} from secrets manager)",
            vars.len(),
            decls.parameter_store.len(),
            decls.secrets_manager.len()
        );

        Ok(EnvironmentMapping { vars })
    }

    async fn resolve_secret(
        &self,
        key: &str,
        reference: &SecretReference,
    ) -> Result<String, EnvResolutionError> {
        let unresolved = |reason: String| EnvResolutionError::Unresolved {
            key: key.to_string(),
            source_kind: EnvSource::SecretsManager,
            reference: reference.to_string(),
            reason,
        };

        let lookup = StoreReference {
            name: reference.secret_id.clone(),
            version_stage: reference.version_stage.clone(),
            version_id: reference.version_id.clone(),
        };
        let raw = self
            .secrets_store
            .resolve(&lookup)
            .await
            .map_err(|e| unresolved(e.to_string()))?;

        let Some(json_key) = &reference.json_key else {
            return Ok(raw);
        };

        let document: serde_json::Value = serde_json::from_str(&raw)
            .map_err(|_| unresolved("secret value is not a JSON object".to_string()))?;
        let object = document
            .as_object()
            .ok_or_else(|| unresolved("secret value is not a JSON object".to_string()))?;

        match object.get(json_key) {
            Some(serde_json::Value::String(value)) => Ok(value.clone()),
            Some(other) => Ok(other.to_string()),
            None => Err(unresolved(format!(
                "JSON key '{}' not present in secret",
                json_key
            ))),
        }
    }
}
