//! In-memory stand-ins for the remote side, used by pipeline, scheduler and
//! router tests.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::{
    ActiveSession, ExecContext, ExecError, PersistentHandle, RemoteShell, RemoteTarget,
    RunObserver, StepFailure, Transcript,
};

#[derive(Default)]
pub(crate) struct RecordingObserver {
    activities: Mutex<Vec<String>>,
}

impl RecordingObserver {
    pub(crate) fn activities(&self) -> Vec<String> {
        self.activities.lock().unwrap().clone()
    }
}

impl RunObserver for RecordingObserver {
    fn set_activity(&self, description: String) {
        self.activities.lock().unwrap().push(description);
    }

    fn set_active_session(&self, _session: Option<ActiveSession>) {}
}

/// How a scripted command behaves.
#[derive(Clone, Debug)]
pub(crate) enum Behavior {
    Succeed(String),
    Fail(String),
    /// Blocks until the run is cancelled or the session interrupted.
    Hang,
    /// Finishes after the delay unless cancelled first.
    Delay(Duration, String),
}

/// A [`RemoteShell`] whose commands are answered from a script keyed by the
/// command text. Unknown commands succeed with `"<command> ok"`.
#[derive(Default)]
pub(crate) struct ScriptedRemote {
    behaviors: Mutex<HashMap<String, Behavior>>,
    connect_failures: Mutex<HashMap<String, String>>,
    executed: Mutex<Vec<String>>,
    pub(crate) tails_opened: AtomicUsize,
    pub(crate) tails_closed: Arc<AtomicUsize>,
}

impl ScriptedRemote {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn on(self: &Arc<Self>, command: &str, behavior: Behavior) -> Arc<Self> {
        self.behaviors
            .lock()
            .unwrap()
            .insert(command.to_string(), behavior);
        self.clone()
    }

    pub(crate) fn refuse(self: &Arc<Self>, label: &str, reason: &str) -> Arc<Self> {
        self.connect_failures
            .lock()
            .unwrap()
            .insert(label.to_string(), reason.to_string());
        self.clone()
    }

    pub(crate) fn executed(&self) -> Vec<String> {
        self.executed.lock().unwrap().clone()
    }

    fn behavior(&self, command: &str) -> Behavior {
        self.behaviors
            .lock()
            .unwrap()
            .get(command)
            .cloned()
            .unwrap_or_else(|| Behavior::Succeed(format!("{command} ok\n")))
    }

    fn refused(&self, target: &RemoteTarget) -> Option<ExecError> {
        self.connect_failures
            .lock()
            .unwrap()
            .get(&target.label)
            .map(|reason| ExecError::Connect {
                addr: target.address(),
                reason: reason.clone(),
            })
    }
}

#[async_trait]
impl RemoteShell for ScriptedRemote {
    async fn run_commands(
        &self,
        target: &RemoteTarget,
        ctx: &ExecContext,
    ) -> Result<String, StepFailure> {
        ctx.activity(format!(
            "Connecting to {} ({}) via SSH...",
            target.label, target.host
        ));
        if let Some(error) = self.refused(target) {
            return Err(StepFailure::new(String::new(), error));
        }

        let mut transcript = Transcript::default();
        for command in &target.commands {
            if ctx.is_canceled() {
                return Err(transcript.fail(ExecError::Canceled { scope: "remote" }));
            }
            self.executed.lock().unwrap().push(command.clone());

            let session = ActiveSession::new(&target.label, command);
            ctx.observer.set_active_session(Some(session.clone()));
            let outcome = match self.behavior(command) {
                Behavior::Succeed(out) => Ok(out),
                Behavior::Fail(reason) => Err(reason),
                Behavior::Hang => {
                    tokio::select! {
                        _ = ctx.cancel.cancelled() => {}
                        _ = session.interrupted() => {}
                    }
                    Ok(String::new())
                }
                Behavior::Delay(delay, out) => {
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = ctx.cancel.cancelled() => {}
                        _ = session.interrupted() => {}
                    }
                    Ok(out)
                }
            };
            ctx.observer.set_active_session(None);

            if session.is_interrupted() || ctx.is_canceled() {
                transcript.push_canceled(command, "", "");
                return Err(transcript.fail(ExecError::Canceled { scope: "remote" }));
            }
            match outcome {
                Ok(out) => transcript.push_command(command, &out, ""),
                Err(reason) => {
                    transcript.push_command(command, "", &reason);
                    let error = ExecError::CommandFailed("Process exited with status 1".into());
                    transcript.push_failure(&error);
                    return Err(transcript.fail(error));
                }
            }
        }
        Ok(transcript.into_string())
    }

    async fn open_persistent(
        &self,
        target: &RemoteTarget,
        ctx: &ExecContext,
    ) -> Result<PersistentHandle, ExecError> {
        if let Some(error) = self.refused(target) {
            return Err(error);
        }
        ctx.activity(format!("Following {} in the background", target.label));
        self.tails_opened.fetch_add(1, Ordering::SeqCst);
        let closed = self.tails_closed.clone();
        Ok(PersistentHandle::spawn(&target.label, move |stop| async move {
            stop.cancelled().await;
            closed.fetch_add(1, Ordering::SeqCst);
        }))
    }
}
