//! External value stores for parameter-store and secrets-manager references
//!
//! The environment resolver looks up `env.parameter-store` and
//! `env.secrets-manager` references through the [`ValueStore`] trait. The
//! local runner ships file-backed stores; library users can plug in their own.
//!
//! ## File Format
//!
//! File-backed stores read KEY=VALUE files:
//! - one entry per line, key and value trimmed
//! - empty lines and lines starting with `#` are ignored
//! - values are taken literally (no quote processing)
//! - when several files are loaded, later files win on conflicting keys
//!
//! ```text
//! # parameters
//! /app/db/host=db.internal
//! prod/db={"username":"admin","password":"hunter2-hunter2"}
//! ```

use async_trait::async_trait;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use thiserror::Error;
use tracing::{debug, instrument, warn};

/// A lookup request against a store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreReference {
    /// Parameter name or secret id
    pub name: String,
    /// Secret version stage (e.g. `AWSCURRENT`)
    pub version_stage: Option<String>,
    /// Secret version id
    pub version_id: Option<String>,
}

impl StoreReference {
    /// A reference without version qualifiers
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version_stage: None,
            version_id: None,
        }
    }

    fn has_version(&self) -> bool {
        self.version_stage.is_some() || self.version_id.is_some()
    }
}

/// Store lookup failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// No value exists under the reference
    #[error("no value stored under '{name}'")]
    NotFound { name: String },

    /// The store exists but could not be read
    #[error("access denied: {reason}")]
    AccessDenied { reason: String },

    /// Any other backend failure
    #[error("store backend error: {0}")]
    Backend(String),
}

/// Source of externally stored values
#[async_trait]
pub trait ValueStore: Send + Sync {
    /// Human-readable store name used in logs
    fn name(&self) -> &str;

    /// Resolve a reference to its value
    async fn resolve(&self, reference: &StoreReference) -> Result<String, StoreError>;
}

/// Store where every lookup fails with `NotFound`
#[derive(Debug, Clone, Default)]
pub struct EmptyStore;

#[async_trait]
impl ValueStore for EmptyStore {
    fn name(&self) -> &str {
        "empty"
    }

    async fn resolve(&self, reference: &StoreReference) -> Result<String, StoreError> {
        Err(StoreError::NotFound {
            name: reference.name.clone(),
        })
    }
}

/// In-memory store
#[derive(Debug, Clone, Default)]
pub struct StaticStore {
    values: HashMap<String, String>,
}

impl StaticStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert
    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(name.into(), value.into());
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.values.insert(name.into(), value.into());
    }
}

#[async_trait]
impl ValueStore for StaticStore {
    fn name(&self) -> &str {
        "static"
    }

    async fn resolve(&self, reference: &StoreReference) -> Result<String, StoreError> {
        self.values
            .get(&reference.name)
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                name: reference.name.clone(),
            })
    }
}

/// Store backed by KEY=VALUE files
#[derive(Debug, Clone)]
pub struct FileStore {
    name: String,
    values: HashMap<String, String>,
}

impl FileStore {
    /// Load a store from multiple files
    ///
    /// Missing files are skipped with a warning; a file that exists but cannot
    /// be read fails with `AccessDenied`.
    #[instrument(skip(file_paths), fields(store = %name))]
    pub fn load<P: AsRef<Path>>(name: &str, file_paths: &[P]) -> Result<Self, StoreError> {
        let mut values = HashMap::new();

        for file_path in file_paths {
            let path = file_path.as_ref();
            if !path.exists() {
                warn!("Store file not found: {}", path.display());
                continue;
            }

            let content = fs::read_to_string(path).map_err(|e| StoreError::AccessDenied {
                reason: format!("{}: {}", path.display(), e),
            })?;
            let entries = parse_key_value_lines(&content, &path.display().to_string());
            debug!("Loaded {} entries from {}", entries.len(), path.display());
            values.extend(entries);
        }

        Ok(Self {
            name: name.to_string(),
            values,
        })
    }

    /// Number of loaded entries
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[async_trait]
impl ValueStore for FileStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn resolve(&self, reference: &StoreReference) -> Result<String, StoreError> {
        if reference.has_version() {
            warn!(
                store = %self.name,
                "Version qualifiers for '{}' are ignored by file-backed stores",
                reference.name
            );
        }
        self.values
            .get(&reference.name)
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                name: reference.name.clone(),
            })
    }
}

/// Parse KEY=VALUE lines, skipping blanks, comments and malformed lines
///
/// `origin` is only used in warnings. Later duplicates win.
pub fn parse_key_value_lines(content: &str, origin: &str) -> Vec<(String, String)> {
    let mut entries: Vec<(String, String)> = Vec::new();

    for (line_num, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some((key, value)) = line.split_once('=') else {
            warn!(
                "Invalid line format at {}:{} (expected KEY=VALUE)",
                origin,
                line_num + 1
            );
            continue;
        };

        let key = key.trim();
        if key.is_empty() {
            warn!("Empty key found at {}:{}", origin, line_num + 1);
            continue;
        }

        entries.retain(|(existing, _)| existing != key);
        entries.push((key.to_string(), value.trim().to_string()));
    }

    entries
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_file(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{}", content).unwrap();
        file
    }

    #[test]
    fn test_parse_key_value_lines() {
        let entries = parse_key_value_lines(
            "# comment\n\nA=1\nB = two words \nbad line\n=novalue\nA=3\nURL=https://x?a=b\n",
            "test",
        );
        assert_eq!(
            entries,
            vec![
                ("B".to_string(), "two words".to_string()),
                ("A".to_string(), "3".to_string()),
                ("URL".to_string(), "https://x?a=b".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_file_store_later_file_wins() {
        let first = write_file("/app/key=first\n/app/other=kept\n");
        let second = write_file("/app/key=second\n");

        let store = FileStore::load("parameter-store", &[first.path(), second.path()]).unwrap();
        assert_eq!(store.len(), 2);
        assert_eq!(
            store.resolve(&StoreReference::named("/app/key")).await.unwrap(),
            "second"
        );
        assert_eq!(
            store.resolve(&StoreReference::named("/app/other")).await.unwrap(),
            "kept"
        );
    }

    #[tokio::test]
    async fn test_file_store_missing_file_is_empty() {
        let store = FileStore::load("secrets-manager", &["/nonexistent/secrets.env"]).unwrap();
        assert!(store.is_empty());
        let err = store
            .resolve(&StoreReference::named("anything"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_file_store_ignores_version_qualifiers() {
        let file = write_file("prod/db=value\n");
        let store = FileStore::load("secrets-manager", &[file.path()]).unwrap();
        let reference = StoreReference {
            name: "prod/db".to_string(),
            version_stage: Some("AWSPREVIOUS".to_string()),
            version_id: None,
        };
        assert_eq!(store.resolve(&reference).await.unwrap(), "value");
    }

    #[tokio::test]
    async fn test_static_and_empty_stores() {
        let store = StaticStore::new().with("a", "1");
        assert_eq!(store.resolve(&StoreReference::named("a")).await.unwrap(), "1");
        assert!(store.resolve(&StoreReference::named("b")).await.is_err());

        let err = EmptyStore
            .resolve(&StoreReference::named("a"))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "no value stored under 'a'");
    }
}
