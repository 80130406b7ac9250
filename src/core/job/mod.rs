//! The job orchestrator: one global run gate and the fixed diagnostic
//! pipeline.
//!
//! A run tails the sdvn route log in the background while the scheduler
//! script executes, stops the tail, then runs the sdvn analysis and finally
//! the local slab commands. The first failing step aborts the run; whatever
//! output was collected up to that point is kept in the result.

mod state;
mod types;

use std::sync::Arc;

use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::core::config::AppConfig;
use crate::core::exec::{
    CommandTarget, ExecContext, ExecError, RemoteShell, RemoteTarget, StepFailure, run_local,
};

pub(crate) use state::SharedState;
pub use types::{JobResult, JobStatus, RunType, Step};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum JobError {
    #[error("job already running")]
    AlreadyRunning,
    #[error("no job running")]
    NotRunning,
}

/// Targets of one run, built fresh from configuration.
#[derive(Clone, Debug)]
pub struct PipelineTargets {
    /// Host whose background command is followed during the scheduler step.
    pub log: RemoteTarget,
    pub scheduler: CommandTarget,
    pub analysis: CommandTarget,
    pub local: CommandTarget,
}

/// Proof that the gate is held. Dropping it releases the gate and every
/// per-run reference, whichever way the run ended.
pub struct RunGuard {
    state: SharedState,
    run_type: RunType,
    cancel: CancellationToken,
}

impl RunGuard {
    pub fn run_type(&self) -> RunType {
        self.run_type
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.state.release();
    }
}

/// A step that ended the run early.
struct Aborted {
    context: &'static str,
    error: ExecError,
}

impl Aborted {
    fn new(context: &'static str, error: ExecError) -> Self {
        Self { context, error }
    }
}

/// Moves a step's output into its result slot.
fn keep_output(
    slot: &mut String,
    outcome: Result<String, StepFailure>,
    context: &'static str,
) -> Result<(), Aborted> {
    match outcome {
        Ok(output) => {
            *slot = output;
            Ok(())
        }
        Err(failure) => {
            *slot = failure.output;
            Err(Aborted::new(context, failure.error))
        }
    }
}

pub struct JobRunner {
    state: SharedState,
    config: AppConfig,
    remote: Arc<dyn RemoteShell>,
}

impl JobRunner {
    pub fn new(config: AppConfig, remote: Arc<dyn RemoteShell>) -> Self {
        Self {
            state: SharedState::default(),
            config,
            remote,
        }
    }

    /// Acquires the gate without starting anything. Fails fast when another
    /// run holds it; nothing is queued.
    pub fn begin(&self, run_type: RunType) -> Result<RunGuard, JobError> {
        let cancel = self.state.acquire(run_type)?;
        Ok(RunGuard {
            state: self.state.clone(),
            run_type,
            cancel,
        })
    }

    /// Starts a run on its own task. Used for manual triggers.
    pub fn start(self: &Arc<Self>, run_type: RunType) -> Result<JoinHandle<JobResult>, JobError> {
        let guard = self.begin(run_type)?;
        let runner = Arc::clone(self);
        Ok(tokio::spawn(async move { runner.run(guard).await }))
    }

    /// Drives the pipeline to its end under an already acquired gate and
    /// stores the result as the last result.
    pub async fn run(&self, guard: RunGuard) -> JobResult {
        let run_type = guard.run_type();
        info!(run_type = run_type.as_str(), "Job started");

        let ctx = ExecContext::new(guard.cancel.clone(), Arc::new(self.state.clone()));
        let targets = self.config.pipeline_targets();
        let mut result = JobResult::new(run_type);

        match self.pipeline(&targets, &ctx, &mut result).await {
            Ok(()) => info!(run_type = run_type.as_str(), "Job completed"),
            Err(aborted) if aborted.error.is_cancellation() => {
                warn!(run_type = run_type.as_str(), "{}", aborted.error);
                result.error_message = aborted.error.to_string();
            }
            Err(aborted) => {
                error!(
                    run_type = run_type.as_str(),
                    scheduler_output = %result.scheduler_output,
                    sdvn_output = %result.sdvn_output,
                    local_output = %result.local_output,
                    "{} error: {}",
                    aborted.context,
                    aborted.error
                );
                result.error_message = format!("{} error: {}", aborted.context, aborted.error);
            }
        }

        let result = self.state.store_result(result);
        drop(guard);
        result
    }

    async fn pipeline(
        &self,
        targets: &PipelineTargets,
        ctx: &ExecContext,
        result: &mut JobResult,
    ) -> Result<(), Aborted> {
        self.state.advance("Starting log tailing", Step::TailStart);
        let tail = self
            .remote
            .open_persistent(&targets.log, ctx)
            .await
            .map(Arc::new)
            .map_err(|e| Aborted::new("Background log tail", e))?;
        self.state.set_persistent(Some(Arc::clone(&tail)));

        self.state
            .advance("Preparing to connect to scheduler", Step::SchedulerScript);
        let scheduler = self.execute(&targets.scheduler, ctx).await;

        // The tail is stopped whether or not the scheduler step succeeded.
        if scheduler.is_ok() {
            self.state.advance(
                &format!("Shutting down {} log tailing", targets.log.label),
                Step::TailStop,
            );
        }
        tail.close().await;
        self.state.set_persistent(None);
        keep_output(&mut result.scheduler_output, scheduler, "Scheduler script")?;

        self.state
            .advance("Preparing to connect to sdvn", Step::SdvnScript);
        let analysis = self.execute(&targets.analysis, ctx).await;
        keep_output(&mut result.sdvn_output, analysis, "SDVN script")?;

        self.state
            .advance("Preparing to run local script", Step::LocalScript);
        let local = self.execute(&targets.local, ctx).await;
        keep_output(&mut result.local_output, local, "Slab script")?;

        self.state.advance("Completed", Step::Complete);
        Ok(())
    }

    async fn execute(
        &self,
        target: &CommandTarget,
        ctx: &ExecContext,
    ) -> Result<String, StepFailure> {
        match target {
            CommandTarget::Remote(remote) => {
                if ctx.is_canceled() {
                    return Err(StepFailure::new("", ExecError::Canceled { scope: "remote" }));
                }
                self.remote.run_commands(remote, ctx).await
            }
            CommandTarget::Local(local) => {
                if ctx.is_canceled() {
                    return Err(StepFailure::new("", ExecError::Canceled { scope: "local" }));
                }
                run_local(local, ctx).await
            }
        }
    }

    /// Cancels the running job and interrupts its in-flight remote command.
    pub fn stop(&self) -> Result<(), JobError> {
        self.state.stop()
    }

    pub fn status(&self) -> JobStatus {
        self.state.status()
    }

    pub fn last_result(&self) -> JobResult {
        self.state.last_result()
    }

    pub fn is_running(&self) -> bool {
        self.state.is_running()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::test_config;
    use crate::core::exec::testing::{Behavior, ScriptedRemote};
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    fn runner(remote: Arc<ScriptedRemote>, sched: &[&str], sdvn: &[&str], local: &[&str]) -> Arc<JobRunner> {
        Arc::new(JobRunner::new(test_config(sched, sdvn, local), remote))
    }

    async fn wait_for_command(remote: &ScriptedRemote, command: &str) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !remote.executed().iter().any(|c| c == command) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("command never started");
    }

    #[tokio::test]
    async fn successful_run_collects_every_output() {
        let remote = ScriptedRemote::new();
        let runner = runner(
            remote.clone(),
            &["run_schedule.sh"],
            &["analyze_routes.sh"],
            &["echo slab-done"],
        );

        let result = runner.start(RunType::Manual).unwrap().await.unwrap();

        assert!(result.succeeded(), "{}", result.error_message);
        assert!(result.scheduler_output.contains("Command: run_schedule.sh"));
        assert!(result.sdvn_output.contains("analyze_routes.sh ok"));
        assert!(result.local_output.contains("slab-done"));
        assert_eq!(result.step, Step::Complete);
        assert_eq!(result.run_type, RunType::Manual);
        assert_eq!(remote.executed(), vec!["run_schedule.sh", "analyze_routes.sh"]);
        assert_eq!(remote.tails_opened.load(Ordering::SeqCst), 1);
        assert_eq!(remote.tails_closed.load(Ordering::SeqCst), 1);

        let status = runner.status();
        assert!(!status.running);
        assert_eq!(status.activity, "Idle");
        assert_eq!(status.step, Step::Idle);
        assert_eq!(runner.last_result(), result);
        assert!(!runner.state.has_run_references());
    }

    #[tokio::test]
    async fn failing_command_stops_the_rest_of_the_pipeline() {
        let remote = ScriptedRemote::new().on("b.sh", Behavior::Fail("boom".into()));
        let runner = runner(remote.clone(), &["a.sh", "b.sh", "c.sh"], &["analyze.sh"], &["echo x"]);

        let result = runner.start(RunType::Manual).unwrap().await.unwrap();

        assert!(result.scheduler_output.contains("Command: a.sh"));
        assert!(result.scheduler_output.contains("Command: b.sh"));
        assert!(result.scheduler_output.contains("boom"));
        assert!(!result.scheduler_output.contains("c.sh"));
        assert_eq!(
            result.error_message,
            "Scheduler script error: Process exited with status 1"
        );
        assert!(result.sdvn_output.is_empty());
        assert!(result.local_output.is_empty());
        assert_eq!(result.step, Step::SchedulerScript);
        assert_eq!(remote.executed(), vec!["a.sh", "b.sh"]);
        assert_eq!(remote.tails_closed.load(Ordering::SeqCst), 1);
        assert!(!runner.is_running());
    }

    #[tokio::test]
    async fn unreachable_log_host_aborts_before_any_command() {
        let remote = ScriptedRemote::new().refuse("sdvn", "connection refused");
        let runner = runner(remote.clone(), &["run.sh"], &["analyze.sh"], &["echo x"]);

        let result = runner.start(RunType::Manual).unwrap().await.unwrap();

        assert_eq!(
            result.error_message,
            "Background log tail error: dial tcp 10.0.0.5:22: connection refused"
        );
        assert_eq!(result.step, Step::TailStart);
        assert!(remote.executed().is_empty());
        assert_eq!(remote.tails_opened.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn local_failure_is_reported_with_its_prefix() {
        let remote = ScriptedRemote::new();
        let runner = runner(remote, &["run.sh"], &["analyze.sh"], &["echo first", "false", "echo never"]);

        let result = runner.start(RunType::Manual).unwrap().await.unwrap();

        assert_eq!(result.error_message, "Slab script error: exit status 1");
        assert!(result.local_output.contains("first"));
        assert!(!result.local_output.contains("never"));
        assert!(!result.sdvn_output.is_empty());
        assert_eq!(result.step, Step::LocalScript);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn stop_interrupts_the_in_flight_remote_command() {
        let remote = ScriptedRemote::new().on("analyze.sh", Behavior::Hang);
        let runner = runner(remote.clone(), &["run.sh"], &["analyze.sh", "report.sh"], &["echo x"]);

        let handle = runner.start(RunType::Manual).unwrap();
        wait_for_command(&remote, "analyze.sh").await;
        assert!(runner.last_result().running);
        assert_eq!(runner.status().step, Step::SdvnScript);

        runner.stop().unwrap();
        let result = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("run did not stop")
            .unwrap();

        assert_eq!(result.error_message, "remote job stopped by user");
        assert!(result.sdvn_output.contains("[CANCELED] Command: analyze.sh"));
        assert!(result.local_output.is_empty());
        assert_eq!(remote.executed(), vec!["run.sh", "analyze.sh"]);
        assert!(!runner.status().running);
        assert!(!runner.last_result().running);
        assert_eq!(runner.stop(), Err(JobError::NotRunning));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn stop_during_scheduler_step_still_closes_the_tail() {
        let remote = ScriptedRemote::new().on("run.sh", Behavior::Hang);
        let runner = runner(remote.clone(), &["run.sh"], &["analyze.sh"], &["echo x"]);

        let handle = runner.start(RunType::Manual).unwrap();
        wait_for_command(&remote, "run.sh").await;
        runner.stop().unwrap();
        let result = handle.await.unwrap();

        assert_eq!(result.error_message, "remote job stopped by user");
        assert_eq!(remote.tails_closed.load(Ordering::SeqCst), 1);
        assert_eq!(remote.executed(), vec!["run.sh"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_starts_admit_exactly_one_run() {
        let remote = ScriptedRemote::new().on(
            "run.sh",
            Behavior::Delay(Duration::from_millis(300), "done\n".into()),
        );
        let runner = runner(remote, &["run.sh"], &["analyze.sh"], &["echo x"]);

        let attempts: Vec<_> = (0..8)
            .map(|_| {
                let runner = runner.clone();
                tokio::spawn(async move { runner.start(RunType::Manual) })
            })
            .collect();

        let mut accepted = Vec::new();
        let mut rejected = 0;
        for attempt in attempts {
            match attempt.await.unwrap() {
                Ok(handle) => accepted.push(handle),
                Err(e) => {
                    assert_eq!(e, JobError::AlreadyRunning);
                    rejected += 1;
                }
            }
        }
        assert_eq!(accepted.len(), 1);
        assert_eq!(rejected, 7);

        let result = accepted.pop().unwrap().await.unwrap();
        assert!(result.succeeded());
        assert!(runner.start(RunType::Manual).is_ok());
    }

    #[tokio::test]
    async fn stop_without_a_run_is_rejected() {
        let runner = runner(ScriptedRemote::new(), &[], &[], &[]);
        assert_eq!(runner.stop(), Err(JobError::NotRunning));
        assert_eq!(runner.last_result(), JobResult::default());
    }

    #[tokio::test]
    async fn guard_released_without_running_frees_the_gate() {
        let runner = runner(ScriptedRemote::new(), &[], &[], &[]);
        let guard = runner.begin(RunType::Scheduled).unwrap();
        assert_eq!(guard.run_type(), RunType::Scheduled);
        assert!(runner.is_running());
        drop(guard);
        assert!(!runner.is_running());
    }
}
