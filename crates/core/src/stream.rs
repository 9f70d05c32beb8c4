//! Output streaming
//!
//! Relays command output to the invoking process as it is produced. Each line
//! is tagged with its phase and command index (`[build:2] ...`), stderr lines
//! are additionally marked, and everything passes through a
//! [`RedactingWriter`] before reaching the terminal.

use crate::buildspec::PhaseName;
use crate::redaction::{redact_with_registry, RedactingWriter, RedactionConfig, SecretRegistry};
use crate::runtime::{OutputLine, OutputStream};
use std::collections::VecDeque;
use std::io::{self, Write};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::warn;

/// Default number of trailing lines kept for failure details
pub const DEFAULT_TAIL_LINES: usize = 20;

type SharedWriter = Arc<Mutex<RedactingWriter<Box<dyn Write + Send>>>>;

/// Writes tagged, redacted command output
#[derive(Clone)]
pub struct OutputStreamer {
    writer: SharedWriter,
    config: RedactionConfig,
    registry: SecretRegistry,
    tail_lines: usize,
}

impl std::fmt::Debug for OutputStreamer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputStreamer")
            .field("tail_lines", &self.tail_lines)
            .field("redaction", &self.config.enabled)
            .finish()
    }
}

impl OutputStreamer {
    pub fn new<W>(writer: W, config: RedactionConfig, registry: &SecretRegistry) -> Self
    where
        W: Write + Send + 'static,
    {
        let boxed: Box<dyn Write + Send> = Box::new(writer);
        Self {
            writer: Arc::new(Mutex::new(RedactingWriter::new(
                boxed,
                config.clone(),
                registry,
            ))),
            config,
            registry: registry.clone(),
            tail_lines: DEFAULT_TAIL_LINES,
        }
    }

    /// Streamer writing to the process's stdout
    pub fn stdout(config: RedactionConfig, registry: &SecretRegistry) -> Self {
        Self::new(io::stdout(), config, registry)
    }

    pub fn with_tail_lines(mut self, tail_lines: usize) -> Self {
        self.tail_lines = tail_lines;
        self
    }

    /// Write an untagged line (phase banners, command echo)
    pub fn write_line(&self, line: &str) {
        if let Ok(mut writer) = self.writer.lock() {
            if let Err(e) = writer.write_line(line) {
                warn!("Failed to write build output: {}", e);
            }
        }
    }

    /// Echo the command about to run
    pub fn announce(&self, phase: PhaseName, command_index: usize, command: &str) {
        self.write_line(&format!(
            "{} Running command: {}",
            tag(phase, command_index),
            command
        ));
    }

    /// Relay `output` until the command's streams close
    ///
    /// The returned task resolves to the last `tail_lines` lines (redacted),
    /// for use in failure details. Await it before starting the next command
    /// so output stays strictly sequential.
    pub fn relay(
        &self,
        phase: PhaseName,
        command_index: usize,
        mut output: mpsc::Receiver<OutputLine>,
    ) -> JoinHandle<Vec<String>> {
        let writer = Arc::clone(&self.writer);
        let config = self.config.clone();
        let registry = self.registry.clone();
        let tail_lines = self.tail_lines;
        let prefix = tag(phase, command_index);

        tokio::spawn(async move {
            let mut tail: VecDeque<String> = VecDeque::with_capacity(tail_lines);
            while let Some(line) = output.recv().await {
                let rendered = match line.stream {
                    OutputStream::Stdout => format!("{} {}", prefix, line.text),
                    OutputStream::Stderr => format!("{}[stderr] {}", prefix, line.text),
                };

                if let Ok(mut writer) = writer.lock() {
                    if let Err(e) = writer.write_line(&rendered) {
                        warn!("Failed to write build output: {}", e);
                    }
                }

                if tail_lines > 0 {
                    if tail.len() == tail_lines {
                        tail.pop_front();
                    }
                    tail.push_back(redact_with_registry(&line.text, &config, &registry));
                }
            }
            tail.into_iter().collect()
        })
    }
}

fn tag(phase: PhaseName, command_index: usize) -> String {
    format!("[{}:{}]", phase, command_index)
}

/// Clonable in-memory writer, for capturing build output
#[derive(Debug, Clone, Default)]
pub struct SharedBuffer {
    inner: Arc<Mutex<Vec<u8>>>,
}

impl SharedBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Captured output as text
    pub fn contents(&self) -> String {
        self.inner
            .lock()
            .map(|buf| String::from_utf8_lossy(&buf).into_owned())
            .unwrap_or_default()
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "output buffer poisoned"))?
            .extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
