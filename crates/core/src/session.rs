//! Container session management
//!
//! A [`ContainerSession`] is the single container backing a run. The
//! [`SessionManager`] owns every interaction with it: opening (create, stage
//! source, start), executing commands, copying files out and closing. The
//! session itself is a plain owned value passed to each call; there is no
//! global container state.

use crate::errors::SessionError;
use crate::runtime::{
    exec_channel, ArchiveReader, ContainerRuntime, CreateOptions, ExecHandle, ExecOptions,
    ExecStatus,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Label marking containers created by this tool
pub const MANAGED_LABEL: &str = "codebuild-local.managed";
/// Label carrying the build id
pub const BUILD_ID_LABEL: &str = "codebuild-local.build-id";

/// Removal of a container whose session is dropped without being closed
struct OrphanCleanup(Box<dyn FnOnce() + Send>);

impl std::fmt::Debug for OrphanCleanup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("OrphanCleanup")
    }
}

/// Handle on the running build container
///
/// Dropping a session that was never closed (for example when the run is
/// abandoned mid-phase) removes the container on a background task.
#[derive(Debug)]
pub struct ContainerSession {
    id: String,
    working_dir: String,
    image: String,
    closed: bool,
    cleanup: Option<OrphanCleanup>,
}

impl ContainerSession {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn working_dir(&self) -> &str {
        &self.working_dir
    }

    pub fn image(&self) -> &str {
        &self.image
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn mark_closed(&mut self) {
        self.closed = true;
        self.cleanup = None;
    }

    fn ensure_open(&self) -> Result<(), SessionError> {
        if self.closed {
            Err(SessionError::Closed {
                id: self.id.clone(),
            })
        } else {
            Ok(())
        }
    }
}

impl Drop for ContainerSession {
    fn drop(&mut self) {
        if let Some(cleanup) = self.cleanup.take() {
            warn!("Container {} was never closed; removing it", self.id);
            (cleanup.0)();
        }
    }
}

/// Drives a [`ContainerRuntime`] on behalf of one run
#[derive(Debug)]
pub struct SessionManager<R> {
    runtime: Arc<R>,
    source_dir: Option<PathBuf>,
    container_name: Option<String>,
    labels: Vec<(String, String)>,
    extra_args: Vec<String>,
    command_timeout: Option<Duration>,
    stop_timeout: Option<u32>,
}

impl<R: ContainerRuntime> SessionManager<R> {
    pub fn new(runtime: R) -> Self {
        Self {
            runtime: Arc::new(runtime),
            source_dir: None,
            container_name: None,
            labels: vec![(MANAGED_LABEL.to_string(), "true".to_string())],
            extra_args: Vec::new(),
            command_timeout: None,
            stop_timeout: None,
        }
    }

    /// Local directory copied into the working directory on open
    pub fn with_source_dir(mut self, source_dir: PathBuf) -> Self {
        self.source_dir = Some(source_dir);
        self
    }

    /// Name and label the container after the build id
    pub fn with_build_id(mut self, build_id: &str) -> Self {
        self.container_name = Some(format!("codebuild-local-{}", build_id));
        self.labels
            .push((BUILD_ID_LABEL.to_string(), build_id.to_string()));
        self
    }

    pub fn with_extra_args(mut self, extra_args: Vec<String>) -> Self {
        self.extra_args = extra_args;
        self
    }

    /// Kill any command running longer than `timeout`
    pub fn with_command_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.command_timeout = timeout;
        self
    }

    /// Grace period in seconds given to the container on stop
    pub fn with_stop_timeout(mut self, timeout: Option<u32>) -> Self {
        self.stop_timeout = timeout;
        self
    }

    pub fn runtime(&self) -> &R {
        &self.runtime
    }

    /// Create and start the build container
    ///
    /// Failures are never retried. When staging or start fails after the
    /// container was created, the container is removed before returning.
    #[instrument(skip(self))]
    pub async fn open(&self, image: &str, working_dir: &str) -> Result<ContainerSession, SessionError>
    where
        R: 'static,
    {
        let options = CreateOptions {
            image: image.to_string(),
            name: self.container_name.clone(),
            working_dir: working_dir.to_string(),
            labels: self.labels.clone(),
            extra_args: self.extra_args.clone(),
        };

        let id = self.runtime.create_container(&options).await?;
        let mut session = ContainerSession {
            cleanup: Some(self.orphan_cleanup(&id)),
            id,
            working_dir: working_dir.to_string(),
            image: image.to_string(),
            closed: false,
        };

        if let Err(e) = self.stage_and_start(&session).await {
            warn!("Container {} failed to come up: {}", session.id, e);
            if let Err(cleanup) = self.close(&mut session).await {
                warn!("Cleanup of container {} failed: {}", session.id, cleanup);
            }
            return Err(match e {
                SessionError::Runtime(reason) => SessionError::StartFailed {
                    image: image.to_string(),
                    reason,
                },
                other => other,
            });
        }

        info!(
            "Started container {} from {} (working directory {})",
            session.id, image, working_dir
        );
        Ok(session)
    }

    fn orphan_cleanup(&self, container_id: &str) -> OrphanCleanup
    where
        R: 'static,
    {
        let runtime = Arc::clone(&self.runtime);
        let id = container_id.to_string();
        OrphanCleanup(Box::new(move || {
            let Ok(handle) = tokio::runtime::Handle::try_current() else {
                warn!("No async runtime left to remove container {}", id);
                return;
            };
            handle.spawn(async move {
                if let Err(e) = runtime.remove_container(&id).await {
                    warn!("Failed to remove abandoned container {}: {}", id, e);
                }
            });
        }))
    }

    async fn stage_and_start(&self, session: &ContainerSession) -> Result<(), SessionError> {
        if let Some(source_dir) = &self.source_dir {
            debug!(
                "Staging {} into {}:{}",
                source_dir.display(),
                session.id,
                session.working_dir
            );
            self.runtime
                .copy_into(&session.id, source_dir, &session.working_dir)
                .await?;
        }
        self.runtime.start_container(&session.id).await
    }

    /// Run one command inside the session
    ///
    /// The returned handle streams output while the command runs. With a
    /// command timeout configured, a command that outlives it is killed and
    /// reports [`ExecStatus::timed_out`].
    #[instrument(skip(self, session, env), fields(container = %session.id))]
    pub async fn exec(
        &self,
        session: &ContainerSession,
        argv: &[String],
        env: Vec<(String, String)>,
    ) -> Result<ExecHandle, SessionError> {
        session.ensure_open()?;

        let options = ExecOptions {
            env,
            working_dir: Some(session.working_dir.clone()),
        };
        let handle = self.runtime.exec(&session.id, argv, options).await?;

        Ok(match self.command_timeout {
            Some(timeout) => with_timeout(handle, timeout),
            None => handle,
        })
    }

    /// Tar stream of a path inside the session
    #[instrument(skip(self, session), fields(container = %session.id))]
    pub async fn copy_out(
        &self,
        session: &ContainerSession,
        path: &str,
    ) -> Result<ArchiveReader, SessionError> {
        session.ensure_open()?;
        self.runtime.copy_from_container(&session.id, path).await
    }

    /// Stop and remove the container
    ///
    /// Idempotent: closing an already closed session does nothing. The session
    /// counts as closed after the first attempt even when removal fails.
    #[instrument(skip(self, session), fields(container = %session.id))]
    pub async fn close(&self, session: &mut ContainerSession) -> Result<(), SessionError> {
        if session.closed {
            debug!("Container {} already closed", session.id);
            return Ok(());
        }
        session.mark_closed();

        if let Err(e) = self
            .runtime
            .stop_container(&session.id, self.stop_timeout)
            .await
        {
            warn!("Failed to stop container {}: {}", session.id, e);
        }

        self.runtime
            .remove_container(&session.id)
            .await
            .map_err(|e| match e {
                SessionError::TeardownFailed { .. } => e,
                other => SessionError::TeardownFailed {
                    id: session.id.clone(),
                    reason: other.to_string(),
                },
            })?;

        info!("Removed container {}", session.id);
        Ok(())
    }
}

enum Wake {
    Exited(Result<ExecStatus, SessionError>),
    TimedOut,
    KillRequested,
}

/// Wrap a handle so the command is killed after `timeout`
fn with_timeout(handle: ExecHandle, timeout: Duration) -> ExecHandle {
    let (output, mut inner) = handle.into_parts();
    let (channels, wrapped) = exec_channel();
    let (_, completion) = wrapped.into_parts();

    // Output flows straight from the runtime; only completion is wrapped.
    drop(channels.lines);
    let mut kill = channels.kill;

    tokio::spawn(async move {
        let wake = tokio::select! {
            result = tokio::time::timeout(timeout, inner.wait()) => match result {
                Ok(status) => Wake::Exited(status),
                Err(_) => Wake::TimedOut,
            },
            _ = &mut kill => Wake::KillRequested,
        };

        let status = match wake {
            Wake::Exited(status) => status,
            Wake::TimedOut => {
                warn!("Command exceeded timeout of {:?}; killing it", timeout);
                inner.kill();
                inner.wait().await.map(|_| ExecStatus::timed_out())
            }
            Wake::KillRequested => {
                inner.kill();
                inner.wait().await
            }
        };
        let _ = channels.status.send(status);
    });

    ExecHandle::from_parts(output, completion)
}
