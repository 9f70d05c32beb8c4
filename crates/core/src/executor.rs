//! Phase execution state machine
//!
//! Drives the declared phases in the fixed order
//! `install -> pre_build -> build -> post_build` through an explicit
//! [`RunState`] enum. Each call to [`PhaseExecutor::step`] performs one
//! transition:
//!
//! ```text
//! Pending ──────────────► Running(first declared phase) | Succeeded
//! Running(p) ──ok/CONTINUE─► Running(next declared phase) | Succeeded
//! Running(p) ──ABORT fail──► PhaseFailed(p)
//! Running(p) ──cancelled───► Failed
//! PhaseFailed(post_build) ─► Failed
//! PhaseFailed(other) ──────► Finalizing
//! Finalizing ──────────────► Failed   (post_build runs first, if declared)
//! ```
//!
//! Artifact collection and session teardown are post-conditions handled by
//! [`crate::build`], not states of this machine.

use crate::buildspec::{BuildSpec, OnFailure, Phase, PhaseName, Shell};
use crate::environment::{EnvironmentMapping, BUILD_SUCCEEDING_VAR};
use crate::runtime::{ContainerRuntime, ExecStatus};
use crate::session::{ContainerSession, SessionManager};
use crate::stream::OutputStreamer;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

/// State of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "phase", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunState {
    Pending,
    Running(PhaseName),
    PhaseFailed(PhaseName),
    Finalizing,
    Succeeded,
    Failed,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "PENDING"),
            Self::Running(phase) => write!(f, "RUNNING({})", phase),
            Self::PhaseFailed(phase) => write!(f, "PHASE_FAILED({})", phase),
            Self::Finalizing => write!(f, "FINALIZING"),
            Self::Succeeded => write!(f, "SUCCEEDED"),
            Self::Failed => write!(f, "FAILED"),
        }
    }
}

/// Why a phase failed
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailureDetail {
    /// Index of the failing command; `finally` commands continue the numbering
    pub command_index: usize,
    pub command: String,
    /// Exit code, when the command ran to an exit status
    pub exit_code: Option<i32>,
    /// Exec error or interruption message, when it did not
    pub error: Option<String>,
    pub timed_out: bool,
    pub in_finally: bool,
    /// Last lines of the command's output
    pub output_tail: Vec<String>,
}

/// Record of one executed phase
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PhaseResult {
    pub phase: PhaseName,
    /// `Some(0)` on success, the failing command's exit code otherwise;
    /// `None` when the failure was an exec error or an interruption
    pub exit_code: Option<i32>,
    pub succeeded: bool,
    pub started_at: DateTime<Utc>,
    #[serde(rename = "duration_ms", serialize_with = "serialize_millis")]
    pub duration: Duration,
    pub failure: Option<FailureDetail>,
    /// Ran under the finalization guarantee after an earlier phase failed
    pub finalization: bool,
}

fn serialize_millis<S: serde::Serializer>(duration: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(duration.as_millis() as u64)
}

/// Terminal state and execution record of a run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionReport {
    pub state: RunState,
    pub results: Vec<PhaseResult>,
    pub cancelled: bool,
}

enum CommandOutcome {
    Succeeded,
    Failed(FailureDetail),
    Cancelled(FailureDetail),
}

/// Executes the phases of one build inside an open session
pub struct PhaseExecutor<'a, R> {
    sessions: &'a SessionManager<R>,
    session: &'a ContainerSession,
    env: &'a EnvironmentMapping,
    streamer: &'a OutputStreamer,
    cancel: watch::Receiver<bool>,
    state: RunState,
    results: Vec<PhaseResult>,
    build_succeeding: bool,
    cancelled: bool,
}

impl<'a, R: ContainerRuntime> PhaseExecutor<'a, R> {
    pub fn new(
        sessions: &'a SessionManager<R>,
        session: &'a ContainerSession,
        env: &'a EnvironmentMapping,
        streamer: &'a OutputStreamer,
    ) -> Self {
        Self {
            sessions,
            session,
            env,
            streamer,
            // Sender dropped immediately: never signals
            cancel: watch::channel(false).1,
            state: RunState::Pending,
            results: Vec::new(),
            build_succeeding: true,
            cancelled: false,
        }
    }

    /// Observe `cancel`; the run is cancelled once it holds `true`
    pub fn with_cancel(mut self, cancel: watch::Receiver<bool>) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn results(&self) -> &[PhaseResult] {
        &self.results
    }

    /// Run every transition until a terminal state
    #[instrument(skip_all, fields(container = %self.session.id()))]
    pub async fn run(mut self, spec: &BuildSpec) -> ExecutionReport {
        while !self.state.is_terminal() {
            self.step(spec).await;
        }
        info!("Build finished in state {}", self.state);
        ExecutionReport {
            state: self.state,
            results: self.results,
            cancelled: self.cancelled,
        }
    }

    /// Perform one transition and return the new state
    pub async fn step(&mut self, spec: &BuildSpec) -> RunState {
        let next = match self.state {
            RunState::Pending => self.enter_after(spec, None),
            RunState::Running(name) => self.run_declared_phase(spec, name).await,
            RunState::PhaseFailed(_) if self.cancel_requested() => {
                self.cancelled = true;
                RunState::Failed
            }
            RunState::PhaseFailed(name) if name.is_finalization() => RunState::Failed,
            RunState::PhaseFailed(_) => RunState::Finalizing,
            RunState::Finalizing => {
                if let Some(post_build) = spec.phase(PhaseName::PostBuild) {
                    info!("Running {} after failure", PhaseName::PostBuild);
                    self.execute_phase(post_build, spec.env.shell, true).await;
                }
                RunState::Failed
            }
            terminal @ (RunState::Succeeded | RunState::Failed) => terminal,
        };

        if next != self.state {
            debug!("Transition {} -> {}", self.state, next);
        }
        self.state = next;
        next
    }

    /// Next declared phase after `current`, or `Succeeded`
    fn enter_after(&mut self, spec: &BuildSpec, current: Option<PhaseName>) -> RunState {
        if self.cancel_requested() {
            self.cancelled = true;
            return RunState::Failed;
        }

        spec.phases()
            .map(|phase| phase.name)
            .find(|name| current.map_or(true, |current| *name > current))
            .map(RunState::Running)
            .unwrap_or(RunState::Succeeded)
    }

    fn cancel_requested(&self) -> bool {
        self.cancelled || *self.cancel.borrow()
    }

    async fn run_declared_phase(&mut self, spec: &BuildSpec, name: PhaseName) -> RunState {
        let Some(phase) = spec.phase(name) else {
            return self.enter_after(spec, Some(name));
        };

        info!("Entering phase {}", name);
        let succeeded = self.execute_phase(phase, spec.env.shell, false).await;

        if self.cancelled {
            warn!("Build cancelled during phase {}", name);
            return RunState::Failed;
        }
        if succeeded {
            return self.enter_after(spec, Some(name));
        }

        match phase.on_failure {
            OnFailure::Abort => {
                self.build_succeeding = false;
                RunState::PhaseFailed(name)
            }
            OnFailure::Continue => {
                warn!("Phase {} failed; continuing (on-failure: CONTINUE)", name);
                self.enter_after(spec, Some(name))
            }
        }
    }

    /// Run a phase's commands then its `finally` commands and record the result
    async fn execute_phase(&mut self, phase: &Phase, shell: Shell, finalization: bool) -> bool {
        let started_at = Utc::now();
        let start = Instant::now();
        let mut failure = None;

        for (index, command) in phase.commands.iter().enumerate() {
            match self.run_command(shell, phase.name, index, command).await {
                CommandOutcome::Succeeded => {}
                CommandOutcome::Failed(detail) if phase.on_failure == OnFailure::Continue => {
                    // First failure is the one reported
                    warn!(
                        "Command {} of phase {} failed; continuing (on-failure: CONTINUE)",
                        index, phase.name
                    );
                    failure.get_or_insert(detail);
                }
                CommandOutcome::Failed(detail) => {
                    failure = Some(detail);
                    break;
                }
                CommandOutcome::Cancelled(detail) => {
                    failure = Some(detail);
                    self.cancelled = true;
                    break;
                }
            }
        }

        if !self.cancelled {
            let offset = phase.commands.len();
            for (index, command) in phase.finally.iter().enumerate() {
                match self.run_command(shell, phase.name, offset + index, command).await {
                    CommandOutcome::Succeeded => {}
                    CommandOutcome::Failed(mut detail) => {
                        detail.in_finally = true;
                        failure.get_or_insert(detail);
                        break;
                    }
                    CommandOutcome::Cancelled(mut detail) => {
                        detail.in_finally = true;
                        failure = Some(detail);
                        self.cancelled = true;
                        break;
                    }
                }
            }
        }

        let succeeded = failure.is_none();
        let exit_code = match &failure {
            None => Some(0),
            Some(detail) => detail.exit_code,
        };

        self.results.push(PhaseResult {
            phase: phase.name,
            exit_code,
            succeeded,
            started_at,
            duration: start.elapsed(),
            failure,
            finalization,
        });

        if succeeded {
            info!("Phase {} succeeded", phase.name);
        } else {
            warn!("Phase {} failed", phase.name);
        }
        succeeded
    }

    async fn run_command(
        &mut self,
        shell: Shell,
        phase: PhaseName,
        index: usize,
        command: &str,
    ) -> CommandOutcome {
        let failure = |exit_code: Option<i32>, error: Option<String>, output_tail: Vec<String>| {
            FailureDetail {
                command_index: index,
                command: command.to_string(),
                exit_code,
                error,
                timed_out: false,
                in_finally: false,
                output_tail,
            }
        };

        if self.cancel_requested() {
            return CommandOutcome::Cancelled(failure(
                None,
                Some("build cancelled before command started".to_string()),
                Vec::new(),
            ));
        }

        let succeeding = if self.build_succeeding { "1" } else { "0" };
        let env = self.env.with_overlay(&[(BUILD_SUCCEEDING_VAR, succeeding)]);

        self.streamer.announce(phase, index, command);
        let handle = match self
            .sessions
            .exec(self.session, &shell.argv(command), env)
            .await
        {
            Ok(handle) => handle,
            Err(e) => {
                warn!("Command {} of phase {} could not run: {}", index, phase, e);
                return CommandOutcome::Failed(failure(None, Some(e.to_string()), Vec::new()));
            }
        };

        let (output, mut completion) = handle.into_parts();
        let relay = self.streamer.relay(phase, index, output);

        let waited = tokio::select! {
            status = completion.wait() => Some(status),
            _ = cancelled(&mut self.cancel) => None,
        };

        let (status, interrupted) = match waited {
            Some(status) => (status, false),
            None => {
                info!("Cancelling command {} of phase {}", index, phase);
                completion.kill();
                (completion.wait().await, true)
            }
        };

        let tail = match relay.await {
            Ok(tail) => tail,
            Err(e) => {
                warn!("Output relay ended abnormally: {}", e);
                Vec::new()
            }
        };

        if interrupted {
            return CommandOutcome::Cancelled(failure(
                status.ok().map(|s| s.exit_code),
                Some("build cancelled".to_string()),
                tail,
            ));
        }

        match status {
            Ok(status) if status.success() => CommandOutcome::Succeeded,
            Ok(ExecStatus {
                exit_code,
                timed_out,
                ..
            }) => {
                let mut detail = failure(Some(exit_code), None, tail);
                detail.timed_out = timed_out;
                if timed_out {
                    detail.error = Some("command timed out".to_string());
                }
                CommandOutcome::Failed(detail)
            }
            Err(e) => CommandOutcome::Failed(failure(None, Some(e.to_string()), tail)),
        }
    }
}

/// Resolve once `cancel` holds `true`; never if its sender is gone
async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    loop {
        if *cancel.borrow_and_update() {
            return;
        }
        if cancel.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
