use anyhow::{Result, bail};
use std::sync::Arc;

use super::CliOptions;
use crate::core::exec::SshShell;
use crate::core::job::{JobRunner, RunType};
use crate::core::terminal::{self, print_info, print_warn};

/// Runs the pipeline once in the foreground. Ctrl-C stops the job.
pub async fn run_once(options: CliOptions) -> Result<()> {
    crate::logging::init(options.verbose);
    let config = options.load_config()?;

    let remote = Arc::new(SshShell::new(config.file.ssh.connect_timeout()));
    let runner = Arc::new(JobRunner::new(config, remote));
    print_info("Starting diagnostic run (Ctrl+C to stop)");
    let mut job = runner.start(RunType::Manual)?;

    let result = tokio::select! {
        finished = &mut job => finished?,
        _ = tokio::signal::ctrl_c() => {
            print_warn("Stopping job...");
            if let Err(e) = runner.stop() {
                print_warn(&e.to_string());
            }
            job.await?
        }
    };

    terminal::print_job_result(&result);
    if !result.succeeded() {
        bail!("job did not complete");
    }
    Ok(())
}
