//! Secret redaction for build output
//!
//! Values resolved from the parameter store and secrets manager are registered
//! here when the environment is resolved. The output streamer and the run
//! summary pass everything they print through [`RedactingWriter`] or
//! [`redact_with_registry`], so registered values never reach the terminal.

use std::collections::HashSet;
use std::io::{self, Write};
use std::sync::{Arc, RwLock};

/// Minimum length for a value to be considered for redaction
const MIN_REDACTION_LENGTH: usize = 8;

/// Replacement text for redacted secrets
pub const REDACTION_PLACEHOLDER: &str = "****";

/// Thread-safe registry of values that must not be printed
#[derive(Debug, Clone, Default)]
pub struct SecretRegistry {
    inner: Arc<RwLock<SecretRegistryInner>>,
}

#[derive(Debug, Default)]
struct SecretRegistryInner {
    /// Exact secret strings to redact
    exact_secrets: HashSet<String>,
    /// SHA-256 hex digests of secrets; builds commonly print checksums of credentials
    secret_hashes: HashSet<String>,
}

impl SecretRegistry {
    /// Create a new empty secret registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a secret value to the registry
    ///
    /// Values shorter than the minimum length are ignored to avoid masking
    /// ordinary words and numbers.
    pub fn add_secret(&self, secret: &str) {
        if secret.len() < MIN_REDACTION_LENGTH {
            return;
        }

        if let Ok(mut inner) = self.inner.write() {
            inner.exact_secrets.insert(secret.to_string());
            inner.secret_hashes.insert(sha256_hash(secret));
        }
    }

    /// Add multiple secrets to the registry
    pub fn add_secrets<I>(&self, secrets: I)
    where
        I: IntoIterator<Item = String>,
    {
        for secret in secrets {
            self.add_secret(&secret);
        }
    }

    /// Replace every registered secret (and its digest) in `text`
    pub fn redact_text(&self, text: &str) -> String {
        let Ok(inner) = self.inner.read() else {
            return text.to_string();
        };

        // Longest first so a secret containing another secret is masked whole
        let mut secrets: Vec<&String> = inner
            .exact_secrets
            .iter()
            .chain(inner.secret_hashes.iter())
            .collect();
        secrets.sort_by_key(|s| std::cmp::Reverse(s.len()));

        let mut result = text.to_string();
        for secret in secrets {
            if result.contains(secret.as_str()) {
                result = result.replace(secret.as_str(), REDACTION_PLACEHOLDER);
            }
        }
        result
    }

    /// Number of registered secrets
    pub fn secret_count(&self) -> usize {
        self.inner
            .read()
            .map(|inner| inner.exact_secrets.len())
            .unwrap_or(0)
    }
}

/// Configuration for redaction behavior
#[derive(Debug, Clone)]
pub struct RedactionConfig {
    /// Whether redaction is enabled
    pub enabled: bool,
    /// Custom redaction placeholder (if different from default)
    pub placeholder: Option<String>,
}

impl Default for RedactionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            placeholder: None,
        }
    }
}

impl RedactionConfig {
    /// Create config with redaction disabled
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            placeholder: None,
        }
    }

    /// Create config with custom placeholder
    pub fn with_placeholder(placeholder: String) -> Self {
        Self {
            enabled: true,
            placeholder: Some(placeholder),
        }
    }
}

/// Redact text using a specific registry if redaction is enabled
pub fn redact_with_registry(
    text: &str,
    config: &RedactionConfig,
    registry: &SecretRegistry,
) -> String {
    if !config.enabled {
        return text.to_string();
    }

    let redacted = registry.redact_text(text);
    match &config.placeholder {
        Some(custom) => redacted.replace(REDACTION_PLACEHOLDER, custom),
        None => redacted,
    }
}

/// A writer that applies redaction at line boundaries
///
/// Partial lines are buffered until a newline arrives (or the writer is
/// flushed) so a secret split across two `write` calls is still masked.
///
/// ```
/// use std::io::Write;
/// use codebuild_local_core::redaction::{RedactingWriter, RedactionConfig, SecretRegistry};
///
/// let registry = SecretRegistry::new();
/// registry.add_secret("my-secret-123");
///
/// let mut output = Vec::new();
/// let mut writer = RedactingWriter::new(&mut output, RedactionConfig::default(), &registry);
/// write!(writer, "token my-secret-").unwrap();
/// write!(writer, "123 used\n").unwrap();
/// drop(writer);
///
/// assert_eq!(String::from_utf8(output).unwrap(), "token **** used\n");
/// ```
#[derive(Debug)]
pub struct RedactingWriter<W> {
    inner: W,
    buffer: Vec<u8>,
    config: RedactionConfig,
    registry: SecretRegistry,
}

impl<W: Write> RedactingWriter<W> {
    /// Create a new RedactingWriter
    pub fn new(writer: W, config: RedactionConfig, registry: &SecretRegistry) -> Self {
        Self {
            inner: writer,
            buffer: Vec::new(),
            config,
            registry: registry.clone(),
        }
    }

    /// Write a complete line with redaction applied, then flush
    pub fn write_line(&mut self, line: &str) -> io::Result<()> {
        self.write_all(line.as_bytes())?;
        self.write_all(b"\n")?;
        self.flush()
    }

    fn emit(&mut self, bytes: Vec<u8>) -> io::Result<()> {
        match String::from_utf8(bytes) {
            Ok(text) => {
                let redacted = redact_with_registry(&text, &self.config, &self.registry);
                self.inner.write_all(redacted.as_bytes())
            }
            Err(err) => {
                let lossy = String::from_utf8_lossy(err.as_bytes()).into_owned();
                let redacted = redact_with_registry(&lossy, &self.config, &self.registry);
                self.inner.write_all(redacted.as_bytes())
            }
        }
    }

    fn process_complete_lines(&mut self) -> io::Result<()> {
        while let Some(newline_pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=newline_pos).collect();
            self.emit(line)?;
        }
        Ok(())
    }
}

impl<W: Write> Write for RedactingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buffer.extend_from_slice(buf);
        self.process_complete_lines()?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if !self.buffer.is_empty() {
            let remaining: Vec<u8> = self.buffer.drain(..).collect();
            self.emit(remaining)?;
        }
        self.inner.flush()
    }
}

impl<W> Drop for RedactingWriter<W> {
    fn drop(&mut self) {
        // Flushing needs `W: Write`, which Drop cannot require; pending bytes
        // are only emitted through `flush`. See the Write impl.
        if !self.buffer.is_empty() {
            tracing::trace!(
                "RedactingWriter dropped with {} unflushed bytes",
                self.buffer.len()
            );
        }
    }
}

fn sha256_hash(input: &str) -> String {
    use sha2::{Digest, Sha256};

    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    format!("{:x}", hasher.finalize())
}
