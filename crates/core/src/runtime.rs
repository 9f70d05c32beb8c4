//! Container runtime abstraction
//!
//! The session manager drives the container engine only through the
//! [`ContainerRuntime`] trait. [`crate::docker::CliRuntime`] implements it on
//! top of the docker or podman CLI; [`crate::docker::mock::MockRuntime`]
//! implements it in memory for tests.
//!
//! Command execution is streaming: [`ContainerRuntime::exec`] returns an
//! [`ExecHandle`] as soon as the command is running. The handle yields output
//! lines while the command runs, resolves to an [`ExecStatus`] when it exits,
//! and can kill it.

use crate::errors::SessionError;
use std::io::Read;
use std::path::Path;
use tokio::sync::{mpsc, oneshot};

/// Tar stream copied out of a container
///
/// Reading blocks; consume it on a blocking thread. Runtime failures that
/// only show once the stream ends surface as read errors.
pub type ArchiveReader = Box<dyn Read + Send>;

/// Exit code reported for commands killed by the per-command timeout
pub const TIMEOUT_EXIT_CODE: i32 = 124;

/// Exit code reported for commands killed on request
pub const KILLED_EXIT_CODE: i32 = 137;

const OUTPUT_CHANNEL_CAPACITY: usize = 1024;

/// Options for creating the build container
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CreateOptions {
    pub image: String,
    pub name: Option<String>,
    pub working_dir: String,
    pub labels: Vec<(String, String)>,
    /// Extra arguments passed verbatim to the runtime's create command
    pub extra_args: Vec<String>,
}

/// Options for one exec
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOptions {
    pub env: Vec<(String, String)>,
    pub working_dir: Option<String>,
}

/// Which stream a line came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// One line of command output, without its line terminator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLine {
    pub stream: OutputStream,
    pub text: String,
}

impl OutputLine {
    pub fn stdout(text: impl Into<String>) -> Self {
        Self {
            stream: OutputStream::Stdout,
            text: text.into(),
        }
    }

    pub fn stderr(text: impl Into<String>) -> Self {
        Self {
            stream: OutputStream::Stderr,
            text: text.into(),
        }
    }
}

/// Final status of an exec
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecStatus {
    pub exit_code: i32,
    /// Killed by the per-command timeout
    pub timed_out: bool,
    /// Killed on request (cancellation)
    pub killed: bool,
}

impl ExecStatus {
    pub fn exited(exit_code: i32) -> Self {
        Self {
            exit_code,
            timed_out: false,
            killed: false,
        }
    }

    pub fn timed_out() -> Self {
        Self {
            exit_code: TIMEOUT_EXIT_CODE,
            timed_out: true,
            killed: false,
        }
    }

    pub fn killed(exit_code: Option<i32>) -> Self {
        Self {
            exit_code: exit_code.unwrap_or(KILLED_EXIT_CODE),
            timed_out: false,
            killed: true,
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0 && !self.timed_out && !self.killed
    }
}

/// Completion half of an exec: its status and its kill switch
#[derive(Debug)]
pub struct ExecCompletion {
    status: oneshot::Receiver<Result<ExecStatus, SessionError>>,
    kill: Option<oneshot::Sender<()>>,
}

impl ExecCompletion {
    /// Wait for the command to exit
    pub async fn wait(&mut self) -> Result<ExecStatus, SessionError> {
        match (&mut self.status).await {
            Ok(result) => result,
            Err(_) => Err(SessionError::Runtime(
                "exec task ended without reporting a status".to_string(),
            )),
        }
    }

    /// Ask the runtime to kill the command; later calls are no-ops
    pub fn kill(&mut self) {
        if let Some(kill) = self.kill.take() {
            let _ = kill.send(());
        }
    }
}

/// Live handle on a running command
#[derive(Debug)]
pub struct ExecHandle {
    output: mpsc::Receiver<OutputLine>,
    completion: ExecCompletion,
}

impl ExecHandle {
    /// Split into the output receiver and the completion half
    ///
    /// The output receiver yields `None` once the command's streams are
    /// closed; runtimes close them before reporting the status.
    pub fn into_parts(self) -> (mpsc::Receiver<OutputLine>, ExecCompletion) {
        (self.output, self.completion)
    }

    pub fn from_parts(output: mpsc::Receiver<OutputLine>, completion: ExecCompletion) -> Self {
        Self { output, completion }
    }

    /// Drain all output and wait for the exit status
    pub async fn collect(self) -> Result<(Vec<OutputLine>, ExecStatus), SessionError> {
        let (mut output, mut completion) = self.into_parts();
        let mut lines = Vec::new();
        while let Some(line) = output.recv().await {
            lines.push(line);
        }
        let status = completion.wait().await?;
        Ok((lines, status))
    }
}

/// Producer side of an [`ExecHandle`], held by runtime implementations
#[derive(Debug)]
pub struct ExecChannels {
    pub lines: mpsc::Sender<OutputLine>,
    pub status: oneshot::Sender<Result<ExecStatus, SessionError>>,
    /// Resolves when the consumer asked for a kill or dropped the handle
    pub kill: oneshot::Receiver<()>,
}

/// Create a connected producer/consumer pair for one exec
pub fn exec_channel() -> (ExecChannels, ExecHandle) {
    let (lines_tx, lines_rx) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);
    let (status_tx, status_rx) = oneshot::channel();
    let (kill_tx, kill_rx) = oneshot::channel();

    (
        ExecChannels {
            lines: lines_tx,
            status: status_tx,
            kill: kill_rx,
        },
        ExecHandle {
            output: lines_rx,
            completion: ExecCompletion {
                status: status_rx,
                kill: Some(kill_tx),
            },
        },
    )
}

/// Operations the session manager needs from a container engine
#[allow(async_fn_in_trait)]
pub trait ContainerRuntime: Send + Sync {
    /// Name of this runtime (e.g. "docker", "podman", "mock")
    fn runtime_name(&self) -> &str;

    /// Create (but do not start) a container running a keep-alive command
    async fn create_container(&self, options: &CreateOptions) -> Result<String, SessionError>;

    /// Copy the contents of a local directory into a container directory
    async fn copy_into(
        &self,
        container_id: &str,
        local_dir: &Path,
        container_path: &str,
    ) -> Result<(), SessionError>;

    async fn start_container(&self, container_id: &str) -> Result<(), SessionError>;

    /// Start `argv` inside the container and return a live handle
    async fn exec(
        &self,
        container_id: &str,
        argv: &[String],
        options: ExecOptions,
    ) -> Result<ExecHandle, SessionError>;

    async fn stop_container(
        &self,
        container_id: &str,
        timeout: Option<u32>,
    ) -> Result<(), SessionError>;

    /// Force-remove a container
    ///
    /// The future is `Send` so removal can run on a detached task.
    fn remove_container(
        &self,
        container_id: &str,
    ) -> impl std::future::Future<Output = Result<(), SessionError>> + Send;

    /// Tar stream of a container path; entries are prefixed with the path's
    /// final component, as `docker cp <id>:<path> -` does
    async fn copy_from_container(
        &self,
        container_id: &str,
        path: &str,
    ) -> Result<ArchiveReader, SessionError>;
}

/// Runtime selection options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeKind {
    Docker,
    Podman,
}

impl RuntimeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Docker => "docker",
            Self::Podman => "podman",
        }
    }
}

impl std::str::FromStr for RuntimeKind {
    type Err = SessionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "docker" => Ok(Self::Docker),
            "podman" => Ok(Self::Podman),
            _ => Err(SessionError::Runtime(format!(
                "Unknown runtime: {}. Supported runtimes: docker, podman",
                s
            ))),
        }
    }
}

impl std::fmt::Display for RuntimeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Runtime factory for creating container runtime instances
pub struct RuntimeFactory;

impl RuntimeFactory {
    /// Create a CLI runtime, optionally with a custom binary path
    pub fn create_runtime(
        kind: RuntimeKind,
        runtime_path: Option<String>,
    ) -> crate::docker::CliRuntime {
        match runtime_path {
            Some(path) => crate::docker::CliRuntime::with_runtime_path(path),
            None => match kind {
                RuntimeKind::Docker => crate::docker::CliRuntime::docker(),
                RuntimeKind::Podman => crate::docker::CliRuntime::podman(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_runtime_kind_parse() {
        assert_eq!("Docker".parse::<RuntimeKind>().unwrap(), RuntimeKind::Docker);
        assert_eq!("podman".parse::<RuntimeKind>().unwrap(), RuntimeKind::Podman);
        assert!("containerd".parse::<RuntimeKind>().is_err());
    }

    #[test]
    fn test_create_runtime_binary() {
        let runtime = RuntimeFactory::create_runtime(RuntimeKind::Podman, None);
        assert_eq!(runtime.runtime_path(), "podman");
        let runtime =
            RuntimeFactory::create_runtime(RuntimeKind::Docker, Some("/opt/bin/docker".into()));
        assert_eq!(runtime.runtime_path(), "/opt/bin/docker");
    }

    #[test]
    fn test_exec_status_success() {
        assert!(ExecStatus::exited(0).success());
        assert!(!ExecStatus::exited(2).success());
        assert!(!ExecStatus::timed_out().success());
        assert_eq!(ExecStatus::timed_out().exit_code, TIMEOUT_EXIT_CODE);
        assert_eq!(ExecStatus::killed(None).exit_code, KILLED_EXIT_CODE);
    }

    #[tokio::test]
    async fn test_exec_channel_roundtrip() {
        let (channels, handle) = exec_channel();
        tokio::spawn(async move {
            channels.lines.send(OutputLine::stdout("hello")).await.unwrap();
            channels.lines.send(OutputLine::stderr("oops")).await.unwrap();
            drop(channels.lines);
            let _ = channels.status.send(Ok(ExecStatus::exited(3)));
        });

        let (lines, status) = handle.collect().await.unwrap();
        assert_eq!(
            lines,
            vec![OutputLine::stdout("hello"), OutputLine::stderr("oops")]
        );
        assert_eq!(status.exit_code, 3);
    }

    #[tokio::test]
    async fn test_kill_switch_reaches_producer() {
        let (channels, handle) = exec_channel();
        let (_output, mut completion) = handle.into_parts();
        completion.kill();
        completion.kill();
        assert!(channels.kill.await.is_ok());
    }
}
