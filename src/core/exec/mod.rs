//! Command executors used by the job pipeline.
//!
//! Both executors share one contract: commands of a target run strictly in
//! order, their stdout/stderr is appended to a single transcript, the first
//! failing command stops the target, and a cancelled run returns
//! [`ExecError::Canceled`] together with whatever output was captured.
//!
//! - [remote]: one SSH connection per target, one session per command
//! - [local]: one child process per command, no shell involved
//! - [persistent]: a background remote command that outlives single steps

mod local;
mod persistent;
mod remote;
#[cfg(test)]
pub(crate) mod testing;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

pub use local::run_local;
pub use persistent::PersistentHandle;
pub use remote::SshShell;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Credentials {
    pub user: String,
    pub password: String,
}

/// A host reached over SSH plus the commands to run on it.
#[derive(Clone, Debug)]
pub struct RemoteTarget {
    /// Short name used in activity messages, e.g. "scheduler" or "sdvn".
    pub label: String,
    pub host: String,
    pub port: u16,
    pub credentials: Credentials,
    pub commands: Vec<String>,
    /// Long-running command for the persistent handle (log following).
    pub background_cmd: Option<String>,
}

impl RemoteTarget {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Clone, Debug)]
pub struct LocalTarget {
    pub label: String,
    pub commands: Vec<String>,
}

/// Immutable per-run description of where a step's commands execute.
#[derive(Clone, Debug)]
pub enum CommandTarget {
    Remote(RemoteTarget),
    Local(LocalTarget),
}

impl CommandTarget {
    pub fn label(&self) -> &str {
        match self {
            CommandTarget::Remote(t) => &t.label,
            CommandTarget::Local(t) => &t.label,
        }
    }
}

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("dial tcp {addr}: {reason}")]
    Connect { addr: String, reason: String },
    #[error("dial tcp {addr}: connection timed out after {secs}s")]
    ConnectTimeout { addr: String, secs: u64 },
    #[error("ssh: unable to authenticate as {user}")]
    Auth { user: String },
    #[error("failed to create session for command {index}: {reason}")]
    Session { index: usize, reason: String },
    #[error("failed to start command {command:?}: {reason}")]
    Spawn { command: String, reason: String },
    #[error("{0}")]
    CommandFailed(String),
    #[error("{scope} job stopped by user")]
    Canceled { scope: &'static str },
}

impl ExecError {
    pub fn is_cancellation(&self) -> bool {
        matches!(self, ExecError::Canceled { .. })
    }
}

/// A failed step: the error plus the transcript captured up to and including
/// the failing command.
#[derive(Debug, Error)]
#[error("{error}")]
pub struct StepFailure {
    pub output: String,
    #[source]
    pub error: ExecError,
}

impl StepFailure {
    pub fn new(output: impl Into<String>, error: ExecError) -> Self {
        Self {
            output: output.into(),
            error,
        }
    }
}

/// Aggregated output of a target's commands.
#[derive(Debug, Default)]
pub(crate) struct Transcript(String);

impl Transcript {
    pub(crate) fn push_command(&mut self, command: &str, stdout: &str, stderr: &str) {
        self.0
            .push_str(&format!("Command: {command}\nOutput:\n{stdout}{stderr}\n"));
    }

    pub(crate) fn push_canceled(&mut self, command: &str, stdout: &str, stderr: &str) {
        self.0.push_str(&format!(
            "[CANCELED] Command: {command}\nOutput:\n{stdout}{stderr}\n"
        ));
    }

    pub(crate) fn push_failure(&mut self, error: &ExecError) {
        self.0.push_str(&format!("[ERROR] Command failed: {error}\n"));
    }

    pub(crate) fn push_line(&mut self, line: &str) {
        self.0.push_str(line);
        self.0.push('\n');
    }

    pub(crate) fn fail(self, error: ExecError) -> StepFailure {
        StepFailure::new(self.0, error)
    }

    pub(crate) fn into_string(self) -> String {
        self.0
    }
}

/// Receives progress from executors; implemented by the job's shared state.
pub trait RunObserver: Send + Sync {
    fn set_activity(&self, description: String);
    /// Registers the remote session currently blocking on a command so a stop
    /// request can interrupt it directly. `None` clears the registration.
    fn set_active_session(&self, session: Option<ActiveSession>);
}

/// Everything an executor needs from the run that invoked it.
#[derive(Clone)]
pub struct ExecContext {
    pub cancel: CancellationToken,
    pub observer: Arc<dyn RunObserver>,
}

impl ExecContext {
    pub fn new(cancel: CancellationToken, observer: Arc<dyn RunObserver>) -> Self {
        Self { cancel, observer }
    }

    pub fn activity(&self, description: impl Into<String>) {
        self.observer.set_activity(description.into());
    }

    pub fn is_canceled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Handle to the in-flight remote command of the current run.
///
/// Interrupting it makes the task driving the session send SIGINT and close
/// the channel, which unblocks the wait on the remote side.
#[derive(Clone, Debug)]
pub struct ActiveSession {
    label: String,
    command: String,
    interrupt: CancellationToken,
}

impl ActiveSession {
    pub fn new(label: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            command: command.into(),
            interrupt: CancellationToken::new(),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn interrupt(&self) {
        self.interrupt.cancel();
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupt.is_cancelled()
    }

    pub fn interrupted(&self) -> WaitForCancellationFuture<'_> {
        self.interrupt.cancelled()
    }
}

/// Remote side of the pipeline. [`SshShell`] is the production implementation.
#[async_trait]
pub trait RemoteShell: Send + Sync {
    /// Runs the target's command list over one connection.
    async fn run_commands(
        &self,
        target: &RemoteTarget,
        ctx: &ExecContext,
    ) -> Result<String, StepFailure>;

    /// Starts the target's background command and returns a handle owning it.
    async fn open_persistent(
        &self,
        target: &RemoteTarget,
        ctx: &ExecContext,
    ) -> Result<PersistentHandle, ExecError>;
}
