//! Docker/Podman CLI runtime
//!
//! [`CliRuntime`] drives the `docker` (or any CLI-compatible, e.g. `podman`)
//! binary through `tokio::process`. Exec output is streamed line by line
//! while the command runs.

use crate::errors::SessionError;
use crate::runtime::{
    exec_channel, ArchiveReader, ContainerRuntime, CreateOptions, ExecHandle, ExecOptions,
    ExecStatus, OutputLine, OutputStream,
};
use std::io::Read;
use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, instrument, warn};

/// Keep-alive command run as the container's main process
///
/// `sleep infinity` needs GNU coreutils; BusyBox/Alpine images fall back to tail.
const KEEP_ALIVE: &str = "sleep infinity || tail -f /dev/null";

/// Sequence number naming each exec's pid file
static EXEC_SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Variables the runtime client itself reads; these stay on its command line
/// so a build cannot redirect or break the client
fn client_reads(key: &str) -> bool {
    matches!(
        key,
        "PATH" | "HOME" | "TMPDIR" | "CONTAINER_HOST" | "CONTAINER_CONNECTION"
    ) || key.starts_with("DOCKER_")
        || key.starts_with("CONTAINERS_")
        || key.starts_with("XDG_")
        || key.to_ascii_lowercase().ends_with("_proxy")
}

/// Generic CLI-based container runtime implementation
///
/// Works for both Docker and Podman since they share a compatible CLI.
#[derive(Debug, Clone)]
pub struct CliRuntime {
    /// Container runtime CLI binary path (e.g., "docker" or "podman")
    runtime_path: String,
}

impl CliRuntime {
    pub fn docker() -> Self {
        Self {
            runtime_path: "docker".to_string(),
        }
    }

    pub fn podman() -> Self {
        Self {
            runtime_path: "podman".to_string(),
        }
    }

    /// Create a CliRuntime with custom runtime binary path
    pub fn with_runtime_path(runtime_path: String) -> Self {
        Self { runtime_path }
    }

    pub fn runtime_path(&self) -> &str {
        &self.runtime_path
    }

    /// Check if the container runtime binary is available
    #[instrument(skip(self))]
    pub async fn check_runtime_installed(&self) -> Result<(), SessionError> {
        debug!(
            "Checking if container runtime binary is installed at: {}",
            self.runtime_path
        );
        self.run(&["--version".to_string()]).await.map(|_| ())
    }

    fn spawn_error(&self, e: std::io::Error) -> SessionError {
        if e.kind() == std::io::ErrorKind::NotFound {
            SessionError::NotInstalled {
                runtime: self.runtime_path.clone(),
            }
        } else {
            SessionError::Runtime(format!("Failed to run {}: {}", self.runtime_path, e))
        }
    }

    /// Run a runtime command to completion and return its stdout
    async fn run(&self, args: &[String]) -> Result<Vec<u8>, SessionError> {
        debug!(
            "Executing runtime command: {} {}",
            self.runtime_path,
            args.join(" ")
        );

        let output = Command::new(&self.runtime_path)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| self.spawn_error(e))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(SessionError::Runtime(format!(
                "{} {} failed: {}",
                self.runtime_path,
                args.first().map(String::as_str).unwrap_or_default(),
                stderr.trim()
            )));
        }

        Ok(output.stdout)
    }

    fn create_args(options: &CreateOptions) -> Vec<String> {
        let mut args = vec!["create".to_string()];

        if let Some(name) = &options.name {
            args.push("--name".to_string());
            args.push(name.clone());
        }

        for (key, value) in &options.labels {
            args.push("--label".to_string());
            args.push(format!("{}={}", key, value));
        }

        args.push("--workdir".to_string());
        args.push(options.working_dir.clone());
        args.push("--entrypoint".to_string());
        args.push("/bin/sh".to_string());
        args.extend(options.extra_args.iter().cloned());

        args.push(options.image.clone());
        args.push("-c".to_string());
        args.push(KEEP_ALIVE.to_string());
        args
    }

    fn exec_args(container_id: &str, argv: &[String], options: &ExecOptions) -> Vec<String> {
        let mut args = vec!["exec".to_string()];

        if let Some(workdir) = &options.working_dir {
            args.push("-w".to_string());
            args.push(workdir.clone());
        }

        // Values travel in the client's environment, out of sight of `ps`
        for (key, value) in &options.env {
            args.push("-e".to_string());
            if client_reads(key) {
                args.push(format!("{}={}", key, value));
            } else {
                args.push(key.clone());
            }
        }

        args.push(container_id.to_string());
        args.extend(argv.iter().cloned());
        args
    }

    /// Environment of the client process for an exec
    fn exec_client_env(options: &ExecOptions) -> impl Iterator<Item = (&str, &str)> {
        options
            .env
            .iter()
            .filter(|(key, _)| !client_reads(key))
            .map(|(key, value)| (key.as_str(), value.as_str()))
    }

    /// Prefix `argv` with a wrapper that records its in-container pid in
    /// `pid_file` and then replaces itself with `argv` (`$0 "$@"`)
    fn tracked_argv(argv: &[String], pid_file: &str) -> Vec<String> {
        let mut tracked = vec![
            "sh".to_string(),
            "-c".to_string(),
            format!("{{ echo $$ > {}; }} 2>/dev/null; exec \"$0\" \"$@\"", pid_file),
        ];
        tracked.extend(argv.iter().cloned());
        tracked
    }

    fn pid_file() -> String {
        format!(
            "/tmp/.codebuild-local-exec-{}.pid",
            EXEC_SEQUENCE.fetch_add(1, Ordering::Relaxed)
        )
    }

    /// Kill the process recorded in `pid_file` and its direct children
    ///
    /// Killing the local client alone leaves the command running in the
    /// container.
    async fn kill_in_container(&self, container_id: &str, pid_file: &str) {
        let script = format!(
            "pid=$(cat {file} 2>/dev/null) || exit 0; \
             pkill -KILL -P \"$pid\" 2>/dev/null; \
             kill -KILL \"$pid\" 2>/dev/null; \
             rm -f {file}",
            file = pid_file
        );
        let args = [
            "exec".to_string(),
            container_id.to_string(),
            "sh".to_string(),
            "-c".to_string(),
            script,
        ];
        if let Err(e) = self.run(&args).await {
            warn!(
                "Failed to kill process in container {}: {}",
                container_id, e
            );
        }
    }
}

impl Default for CliRuntime {
    fn default() -> Self {
        Self::docker()
    }
}

/// Forward lines from a child pipe until EOF
///
/// Keeps draining after the receiver is gone so the child never blocks on a
/// full pipe.
async fn forward_lines<R>(reader: R, stream: OutputStream, lines: mpsc::Sender<OutputLine>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                while matches!(buf.last(), Some(b'\n' | b'\r')) {
                    buf.pop();
                }
                let text = String::from_utf8_lossy(&buf).into_owned();
                let _ = lines.send(OutputLine { stream, text }).await;
            }
            Err(e) => {
                warn!("Error reading command output: {}", e);
                break;
            }
        }
    }
}

impl ContainerRuntime for CliRuntime {
    fn runtime_name(&self) -> &str {
        &self.runtime_path
    }

    #[instrument(skip(self))]
    async fn create_container(&self, options: &CreateOptions) -> Result<String, SessionError> {
        let stdout = self
            .run(&Self::create_args(options))
            .await
            .map_err(|e| match e {
                SessionError::Runtime(reason) => SessionError::StartFailed {
                    image: options.image.clone(),
                    reason,
                },
                other => other,
            })?;

        let container_id = String::from_utf8_lossy(&stdout).trim().to_string();
        if container_id.is_empty() {
            return Err(SessionError::StartFailed {
                image: options.image.clone(),
                reason: "runtime returned no container id".to_string(),
            });
        }

        debug!("Created container with ID: {}", container_id);
        Ok(container_id)
    }

    #[instrument(skip(self))]
    async fn copy_into(
        &self,
        container_id: &str,
        local_dir: &Path,
        container_path: &str,
    ) -> Result<(), SessionError> {
        // Trailing "/." copies the directory contents rather than the directory
        let source = format!("{}/.", local_dir.display());
        let destination = format!("{}:{}", container_id, container_path);
        self.run(&["cp".to_string(), source, destination])
            .await
            .map(|_| ())
    }

    #[instrument(skip(self))]
    async fn start_container(&self, container_id: &str) -> Result<(), SessionError> {
        self.run(&["start".to_string(), container_id.to_string()])
            .await
            .map(|_| ())
    }

    #[instrument(skip(self, options), fields(env_count = options.env.len()))]
    async fn exec(
        &self,
        container_id: &str,
        argv: &[String],
        options: ExecOptions,
    ) -> Result<ExecHandle, SessionError> {
        let pid_file = Self::pid_file();
        let args = Self::exec_args(container_id, &Self::tracked_argv(argv, &pid_file), &options);

        let mut child = Command::new(&self.runtime_path)
            .args(&args)
            .envs(Self::exec_client_env(&options))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| match self.spawn_error(e) {
                SessionError::Runtime(reason) => SessionError::ExecFailed {
                    id: container_id.to_string(),
                    reason,
                },
                other => other,
            })?;

        let (channels, handle) = exec_channel();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let container_id = container_id.to_string();
        let runtime = self.clone();

        tokio::spawn(async move {
            let mut readers = Vec::new();
            if let Some(stdout) = stdout {
                readers.push(tokio::spawn(forward_lines(
                    stdout,
                    OutputStream::Stdout,
                    channels.lines.clone(),
                )));
            }
            if let Some(stderr) = stderr {
                readers.push(tokio::spawn(forward_lines(
                    stderr,
                    OutputStream::Stderr,
                    channels.lines.clone(),
                )));
            }
            drop(channels.lines);

            let mut kill = channels.kill;
            let waited = tokio::select! {
                status = child.wait() => Some(status),
                _ = &mut kill => None,
            };

            let (status, killed) = match waited {
                Some(status) => (status, false),
                None => {
                    debug!("Killing exec in container {}", container_id);
                    runtime.kill_in_container(&container_id, &pid_file).await;
                    let _ = child.start_kill();
                    (child.wait().await, true)
                }
            };

            for reader in readers {
                let _ = reader.await;
            }

            let result = status
                .map(|status| {
                    if killed {
                        ExecStatus::killed(status.code())
                    } else {
                        ExecStatus::exited(status.code().unwrap_or(-1))
                    }
                })
                .map_err(|e| SessionError::ExecFailed {
                    id: container_id.clone(),
                    reason: e.to_string(),
                });
            let _ = channels.status.send(result);
        });

        Ok(handle)
    }

    #[instrument(skip(self))]
    async fn stop_container(
        &self,
        container_id: &str,
        timeout: Option<u32>,
    ) -> Result<(), SessionError> {
        let mut args = vec!["stop".to_string()];
        if let Some(timeout) = timeout {
            args.push("-t".to_string());
            args.push(timeout.to_string());
        }
        args.push(container_id.to_string());
        self.run(&args).await.map(|_| ())
    }

    #[instrument(skip(self))]
    async fn remove_container(&self, container_id: &str) -> Result<(), SessionError> {
        self.run(&[
            "rm".to_string(),
            "-f".to_string(),
            container_id.to_string(),
        ])
        .await
        .map(|_| ())
    }

    #[instrument(skip(self))]
    async fn copy_from_container(
        &self,
        container_id: &str,
        path: &str,
    ) -> Result<ArchiveReader, SessionError> {
        let source = format!("{}:{}", container_id, path);
        debug!("Executing runtime command: {} cp {} -", self.runtime_path, source);

        let mut child = std::process::Command::new(&self.runtime_path)
            .args(["cp", source.as_str(), "-"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| self.spawn_error(e))?;
        let stdout = child.stdout.take().ok_or_else(|| {
            SessionError::Runtime(format!("{} cp produced no output stream", self.runtime_path))
        })?;

        Ok(Box::new(ArchiveStream {
            runtime_path: self.runtime_path.clone(),
            child,
            stdout,
            finished: false,
        }))
    }
}

/// Stdout of a running `cp <id>:<path> -`
///
/// The exit status is checked when the stream reaches its end; a failed copy
/// turns into a read error. Dropping the stream early kills the copy.
struct ArchiveStream {
    runtime_path: String,
    child: std::process::Child,
    stdout: std::process::ChildStdout,
    finished: bool,
}

impl std::io::Read for ArchiveStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let read = self.stdout.read(buf)?;
        if read == 0 && !buf.is_empty() && !self.finished {
            self.finished = true;
            let status = self.child.wait()?;
            if !status.success() {
                let mut stderr = String::new();
                if let Some(mut pipe) = self.child.stderr.take() {
                    let _ = pipe.read_to_string(&mut stderr);
                }
                return Err(std::io::Error::other(format!(
                    "{} cp failed: {}",
                    self.runtime_path,
                    stderr.trim()
                )));
            }
        }
        Ok(read)
    }
}

impl Drop for ArchiveStream {
    fn drop(&mut self) {
        if !self.finished {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}

pub mod mock {
    //! In-memory container runtime for tests
    //!
    //! Records every call, answers execs from scripted responses keyed by the
    //! command string (the last element of the argv), and can be told to fail
    //! any lifecycle step.

    use crate::errors::SessionError;
    use crate::runtime::{
        exec_channel, ArchiveReader, ContainerRuntime, CreateOptions, ExecHandle, ExecOptions,
        ExecStatus, OutputLine,
    };
    use std::collections::HashMap;
    use std::path::{Path, PathBuf};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tracing::debug;

    /// Scripted outcome of one exec
    #[derive(Debug, Clone, Default)]
    pub struct MockExecResponse {
        pub exit_code: i32,
        pub stdout: Vec<String>,
        pub stderr: Vec<String>,
        /// Simulated run time; the exec can be killed while it elapses
        pub delay: Option<Duration>,
        /// Fail the exec itself instead of returning a status
        pub exec_error: Option<String>,
    }

    impl MockExecResponse {
        pub fn exit(exit_code: i32) -> Self {
            Self {
                exit_code,
                ..Self::default()
            }
        }

        pub fn with_stdout(mut self, lines: &[&str]) -> Self {
            self.stdout = lines.iter().map(|l| l.to_string()).collect();
            self
        }

        pub fn with_stderr(mut self, lines: &[&str]) -> Self {
            self.stderr = lines.iter().map(|l| l.to_string()).collect();
            self
        }

        pub fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = Some(delay);
            self
        }

        pub fn exec_error(reason: &str) -> Self {
            Self {
                exec_error: Some(reason.to_string()),
                ..Self::default()
            }
        }
    }

    /// Lifecycle steps that can be made to fail
    #[derive(Debug, Clone, Default)]
    pub struct MockFailures {
        pub create: Option<String>,
        pub copy_into: Option<String>,
        pub start: Option<String>,
        pub stop: Option<String>,
        pub remove: Option<String>,
        pub copy_from: Option<String>,
    }

    /// Record of one runtime call
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum MockCall {
        Create(CreateOptions),
        CopyInto {
            id: String,
            local_dir: PathBuf,
            container_path: String,
        },
        Start(String),
        Exec {
            id: String,
            argv: Vec<String>,
            options: ExecOptions,
        },
        Stop(String),
        Remove(String),
        CopyFrom {
            id: String,
            path: String,
        },
    }

    #[derive(Debug, Default)]
    struct MockState {
        calls: Vec<MockCall>,
        responses: HashMap<String, MockExecResponse>,
        default_response: MockExecResponse,
        failures: MockFailures,
        files: Vec<(String, Vec<u8>)>,
        next_id: u32,
    }

    /// Mock container runtime implementation
    #[derive(Debug, Clone, Default)]
    pub struct MockRuntime {
        state: Arc<Mutex<MockState>>,
    }

    impl MockRuntime {
        pub fn new() -> Self {
            Self::default()
        }

        /// Script the response for an exact command string
        pub fn set_exec_response(&self, command: &str, response: MockExecResponse) {
            let mut state = self.state.lock().unwrap();
            state.responses.insert(command.to_string(), response);
        }

        /// Response for commands without a scripted one
        pub fn set_default_response(&self, response: MockExecResponse) {
            self.state.lock().unwrap().default_response = response;
        }

        pub fn set_failures(&self, failures: MockFailures) {
            self.state.lock().unwrap().failures = failures;
        }

        /// Files present in the container working directory (relative paths)
        pub fn set_files(&self, files: &[(&str, &str)]) {
            let mut state = self.state.lock().unwrap();
            state.files = files
                .iter()
                .map(|(path, content)| (path.to_string(), content.as_bytes().to_vec()))
                .collect();
        }

        pub fn calls(&self) -> Vec<MockCall> {
            self.state.lock().unwrap().calls.clone()
        }

        /// Commands executed so far (last argv element of each exec)
        pub fn executed_commands(&self) -> Vec<String> {
            self.exec_calls()
                .into_iter()
                .filter_map(|(argv, _)| argv.last().cloned())
                .collect()
        }

        /// Argv and options of each exec
        pub fn exec_calls(&self) -> Vec<(Vec<String>, ExecOptions)> {
            self.calls()
                .into_iter()
                .filter_map(|call| match call {
                    MockCall::Exec { argv, options, .. } => Some((argv, options)),
                    _ => None,
                })
                .collect()
        }

        pub fn remove_count(&self) -> usize {
            self.count(|call| matches!(call, MockCall::Remove(_)))
        }

        pub fn copy_from_count(&self) -> usize {
            self.count(|call| matches!(call, MockCall::CopyFrom { .. }))
        }

        fn count(&self, predicate: impl Fn(&MockCall) -> bool) -> usize {
            self.state
                .lock()
                .unwrap()
                .calls
                .iter()
                .filter(|call| predicate(call))
                .count()
        }

        fn record(&self, call: MockCall) {
            self.state.lock().unwrap().calls.push(call);
        }

        fn failure(&self, select: impl Fn(&MockFailures) -> Option<String>) -> Option<String> {
            select(&self.state.lock().unwrap().failures)
        }

        fn build_archive(root: &str, files: &[(String, Vec<u8>)]) -> std::io::Result<Vec<u8>> {
            let mut builder = tar::Builder::new(Vec::new());
            for (path, content) in files {
                let mut header = tar::Header::new_gnu();
                header.set_size(content.len() as u64);
                header.set_mode(0o644);
                header.set_cksum();
                builder.append_data(
                    &mut header,
                    format!("{}/{}", root, path),
                    content.as_slice(),
                )?;
            }
            builder.into_inner()
        }
    }

    impl ContainerRuntime for MockRuntime {
        fn runtime_name(&self) -> &str {
            "mock"
        }

        async fn create_container(&self, options: &CreateOptions) -> Result<String, SessionError> {
            self.record(MockCall::Create(options.clone()));
            if let Some(reason) = self.failure(|f| f.create.clone()) {
                return Err(SessionError::StartFailed {
                    image: options.image.clone(),
                    reason,
                });
            }

            let mut state = self.state.lock().unwrap();
            state.next_id += 1;
            let id = format!("mock-container-{}", state.next_id);
            debug!("MockRuntime created {}", id);
            Ok(id)
        }

        async fn copy_into(
            &self,
            container_id: &str,
            local_dir: &Path,
            container_path: &str,
        ) -> Result<(), SessionError> {
            self.record(MockCall::CopyInto {
                id: container_id.to_string(),
                local_dir: local_dir.to_path_buf(),
                container_path: container_path.to_string(),
            });
            match self.failure(|f| f.copy_into.clone()) {
                Some(reason) => Err(SessionError::Runtime(reason)),
                None => Ok(()),
            }
        }

        async fn start_container(&self, container_id: &str) -> Result<(), SessionError> {
            self.record(MockCall::Start(container_id.to_string()));
            match self.failure(|f| f.start.clone()) {
                Some(reason) => Err(SessionError::Runtime(reason)),
                None => Ok(()),
            }
        }

        async fn exec(
            &self,
            container_id: &str,
            argv: &[String],
            options: ExecOptions,
        ) -> Result<ExecHandle, SessionError> {
            self.record(MockCall::Exec {
                id: container_id.to_string(),
                argv: argv.to_vec(),
                options,
            });

            let response = {
                let state = self.state.lock().unwrap();
                argv.last()
                    .and_then(|command| state.responses.get(command))
                    .cloned()
                    .unwrap_or_else(|| state.default_response.clone())
            };

            if let Some(reason) = response.exec_error {
                return Err(SessionError::ExecFailed {
                    id: container_id.to_string(),
                    reason,
                });
            }

            let (channels, handle) = exec_channel();
            tokio::spawn(async move {
                for line in &response.stdout {
                    let _ = channels.lines.send(OutputLine::stdout(line.clone())).await;
                }
                for line in &response.stderr {
                    let _ = channels.lines.send(OutputLine::stderr(line.clone())).await;
                }
                drop(channels.lines);

                let mut kill = channels.kill;
                let status = match response.delay {
                    Some(delay) => {
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => ExecStatus::exited(response.exit_code),
                            _ = &mut kill => ExecStatus::killed(None),
                        }
                    }
                    None => ExecStatus::exited(response.exit_code),
                };
                let _ = channels.status.send(Ok(status));
            });

            Ok(handle)
        }

        async fn stop_container(
            &self,
            container_id: &str,
            _timeout: Option<u32>,
        ) -> Result<(), SessionError> {
            self.record(MockCall::Stop(container_id.to_string()));
            match self.failure(|f| f.stop.clone()) {
                Some(reason) => Err(SessionError::Runtime(reason)),
                None => Ok(()),
            }
        }

        async fn remove_container(&self, container_id: &str) -> Result<(), SessionError> {
            self.record(MockCall::Remove(container_id.to_string()));
            match self.failure(|f| f.remove.clone()) {
                Some(reason) => Err(SessionError::TeardownFailed {
                    id: container_id.to_string(),
                    reason,
                }),
                None => Ok(()),
            }
        }

        async fn copy_from_container(
            &self,
            container_id: &str,
            path: &str,
        ) -> Result<ArchiveReader, SessionError> {
            self.record(MockCall::CopyFrom {
                id: container_id.to_string(),
                path: path.to_string(),
            });
            if let Some(reason) = self.failure(|f| f.copy_from.clone()) {
                return Err(SessionError::Runtime(reason));
            }

            let root = path
                .trim_end_matches('/')
                .rsplit('/')
                .next()
                .filter(|s| !s.is_empty())
                .unwrap_or("root")
                .to_string();
            let files = self.state.lock().unwrap().files.clone();
            let archive = Self::build_archive(&root, &files)
                .map_err(|e| SessionError::Runtime(e.to_string()))?;
            Ok(Box::new(std::io::Cursor::new(archive)))
        }
    }
}
