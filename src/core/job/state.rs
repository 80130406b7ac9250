use std::sync::{Arc, Mutex, MutexGuard};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::types::{JobResult, JobStatus, RunType, Step};
use super::JobError;
use crate::core::exec::{ActiveSession, PersistentHandle, RunObserver};

const IDLE: &str = "Idle";

struct RunState {
    running: bool,
    cancel: Option<CancellationToken>,
    active_session: Option<ActiveSession>,
    persistent: Option<Arc<PersistentHandle>>,
    activity: String,
    step: Step,
    last_result: JobResult,
}

impl Default for RunState {
    fn default() -> Self {
        Self {
            running: false,
            cancel: None,
            active_session: None,
            persistent: None,
            activity: IDLE.to_string(),
            step: Step::Idle,
            last_result: JobResult::default(),
        }
    }
}

/// The single lock-protected block behind the run gate. Every read and write
/// of gate, token, session references, activity, step and last result goes
/// through here; the lock is never held across an await.
#[derive(Clone, Default)]
pub(crate) struct SharedState(Arc<Mutex<RunState>>);

impl SharedState {
    fn lock(&self) -> MutexGuard<'_, RunState> {
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Takes the gate, returning the run's cancellation token.
    pub(crate) fn acquire(&self, run_type: RunType) -> Result<CancellationToken, JobError> {
        let mut state = self.lock();
        if state.running {
            return Err(JobError::AlreadyRunning);
        }
        let token = CancellationToken::new();
        debug!(run_type = run_type.as_str(), "Run gate acquired");
        state.running = true;
        state.cancel = Some(token.clone());
        state.activity = "Starting job".to_string();
        state.step = Step::Idle;
        Ok(token)
    }

    /// Clears the gate and every per-run reference. Runs on every exit path.
    pub(crate) fn release(&self) {
        let persistent = {
            let mut state = self.lock();
            state.running = false;
            state.cancel = None;
            state.active_session = None;
            state.activity = IDLE.to_string();
            state.step = Step::Idle;
            state.persistent.take()
        };
        if let Some(handle) = persistent {
            debug!("Closing background session on {}", handle.label());
            handle.signal_close();
        }
    }

    pub(crate) fn stop(&self) -> Result<(), JobError> {
        let mut state = self.lock();
        if !state.running {
            return Err(JobError::NotRunning);
        }
        if let Some(token) = &state.cancel {
            token.cancel();
        }
        // The blocking wait on a remote session does not observe the token.
        if let Some(session) = &state.active_session {
            warn!(
                "Interrupting {} session running: {}",
                session.label(),
                session.command()
            );
            session.interrupt();
        }
        state.activity = "Stopping job".to_string();
        Ok(())
    }

    pub(crate) fn advance(&self, description: &str, step: Step) {
        let mut state = self.lock();
        info!(step = step.as_str(), "{}", description.replace('\n', " "));
        state.activity = description.to_string();
        state.step = step;
    }

    pub(crate) fn set_persistent(&self, handle: Option<Arc<PersistentHandle>>) {
        self.lock().persistent = handle;
    }

    /// Stores the outcome of a run, stamping it with the step it ended on.
    pub(crate) fn store_result(&self, mut result: JobResult) -> JobResult {
        let mut state = self.lock();
        result.step = state.step;
        result.running = false;
        state.last_result = result.clone();
        result
    }

    pub(crate) fn is_running(&self) -> bool {
        self.lock().running
    }

    pub(crate) fn status(&self) -> JobStatus {
        let state = self.lock();
        JobStatus {
            running: state.running,
            activity: state.activity.clone(),
            step: state.step,
        }
    }

    /// The last stored result with the live gate overlaid.
    pub(crate) fn last_result(&self) -> JobResult {
        let state = self.lock();
        let mut result = state.last_result.clone();
        result.running = state.running;
        if state.running {
            result.step = state.step;
        }
        result
    }

    #[cfg(test)]
    pub(crate) fn has_run_references(&self) -> bool {
        let state = self.lock();
        state.cancel.is_some() || state.active_session.is_some() || state.persistent.is_some()
    }
}

impl RunObserver for SharedState {
    fn set_activity(&self, description: String) {
        let mut state = self.lock();
        info!("{}", description.replace('\n', " "));
        state.activity = description;
    }

    fn set_active_session(&self, session: Option<ActiveSession>) {
        self.lock().active_session = session;
    }
}
