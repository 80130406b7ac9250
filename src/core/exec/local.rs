use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{ExecContext, ExecError, LocalTarget, StepFailure, Transcript};

/// Splits a command line on whitespace into program and arguments.
///
/// There is no quoting or escaping: `echo "a b"` yields the arguments
/// `"a` and `b"`. Returns `None` for a blank line.
pub fn split_command_line(line: &str) -> Option<(&str, Vec<&str>)> {
    let mut parts = line.split_whitespace();
    let program = parts.next()?;
    Some((program, parts.collect()))
}

fn drain<R>(pipe: Option<R>) -> JoinHandle<String>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe
            && let Err(e) = pipe.read_to_end(&mut buf).await
        {
            debug!("Failed reading child output: {}", e);
        }
        String::from_utf8_lossy(&buf).into_owned()
    })
}

/// How long a killed command's pipes may stay open. Grandchildren that
/// inherited them can keep them open after the child is reaped.
const KILLED_DRAIN_GRACE: Duration = Duration::from_secs(2);

async fn collect(task: JoinHandle<String>) -> String {
    task.await.unwrap_or_default()
}

async fn collect_within(task: JoinHandle<String>, grace: Duration) -> String {
    let abort = task.abort_handle();
    match tokio::time::timeout(grace, task).await {
        Ok(joined) => joined.unwrap_or_default(),
        Err(_) => {
            abort.abort();
            debug!("Output pipe still open after {:?}, dropping it", grace);
            String::new()
        }
    }
}

/// Runs every command of `target` as a local child process, in order.
pub async fn run_local(target: &LocalTarget, ctx: &ExecContext) -> Result<String, StepFailure> {
    ctx.activity(format!(
        "Preparing to run local commands for {}...",
        target.label
    ));

    let mut transcript = Transcript::default();
    let total = target.commands.len();

    for (i, line) in target.commands.iter().enumerate() {
        if ctx.is_canceled() {
            return Err(transcript.fail(ExecError::Canceled { scope: "local" }));
        }

        ctx.activity(format!(
            "Running command {}/{} locally ({}):\n{}",
            i + 1,
            total,
            target.label,
            line
        ));

        let spawned = match split_command_line(line) {
            Some((program, args)) => Command::new(program)
                .args(args)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .spawn()
                .map_err(|e| e.to_string()),
            None => Err("empty command line".to_string()),
        };

        let mut child = match spawned {
            Ok(child) => child,
            Err(reason) => {
                transcript.push_line(&format!(
                    "Failed to start command: {line:?}\nError: {reason}"
                ));
                return Err(transcript.fail(ExecError::Spawn {
                    command: line.clone(),
                    reason,
                }));
            }
        };

        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        let waited = tokio::select! {
            status = child.wait() => Some(status),
            _ = ctx.cancel.cancelled() => None,
        };

        let Some(waited) = waited else {
            ctx.activity(format!("Cancelling local command: {line}"));
            if let Err(e) = child.start_kill() {
                warn!("Failed to kill local command '{}': {}", line, e);
            }
            // Reap the child so it does not linger as a zombie.
            if let Err(e) = child.wait().await {
                warn!("Failed to reap local command '{}': {}", line, e);
            }
            let (out, err) = tokio::join!(
                collect_within(stdout, KILLED_DRAIN_GRACE),
                collect_within(stderr, KILLED_DRAIN_GRACE)
            );
            transcript.push_canceled(line, &out, &err);
            return Err(transcript.fail(ExecError::Canceled { scope: "local" }));
        };

        let (out, err) = (collect(stdout).await, collect(stderr).await);
        transcript.push_command(line, &out, &err);

        let failure = match waited {
            Ok(status) if status.success() => None,
            Ok(status) => Some(match status.code() {
                Some(code) => format!("exit status {code}"),
                None => format!("{status}"),
            }),
            Err(e) => Some(e.to_string()),
        };

        if let Some(reason) = failure {
            let error = ExecError::CommandFailed(reason);
            transcript.push_failure(&error);
            return Err(transcript.fail(error));
        }
    }

    Ok(transcript.into_string())
}
