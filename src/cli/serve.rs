use anyhow::Result;
use console::style;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{info, warn};

use super::CliOptions;
use crate::core::exec::SshShell;
use crate::core::job::JobRunner;
use crate::core::lifecycle::LifecycleManager;
use crate::core::schedule::ScheduleEngine;
use crate::core::terminal::{self, GuideSection};
use crate::interfaces::web::{ApiServer, AppState};

const STOP_GRACE: Duration = Duration::from_secs(10);

pub async fn run_serve(options: CliOptions) -> Result<()> {
    let log_tx = crate::logging::init(options.verbose);
    let config = options.load_config()?;

    let host = options
        .host
        .clone()
        .unwrap_or_else(|| config.file.server.host.clone());
    let port = options.port.unwrap_or(config.file.server.port);

    terminal::print_banner();

    let remote = Arc::new(SshShell::new(config.file.ssh.connect_timeout()));
    let runner = Arc::new(JobRunner::new(config, remote));

    let mut lifecycle = LifecycleManager::new().await?;
    let schedules = ScheduleEngine::new(runner.clone(), lifecycle.scheduler.clone());
    let state = AppState::new(runner.clone(), schedules, log_tx);
    lifecycle.attach(Arc::new(Mutex::new(ApiServer::new(
        state,
        host.clone(),
        port,
    ))));
    lifecycle.start().await?;

    GuideSection::new("routetest")
        .status("API Endpoint", &format!("http://{}:{}/api", host, port))
        .status("Live Logs", &format!("http://{}:{}/api/logs", host, port))
        .blank()
        .info(&format!(
            "Press {} to stop the server.",
            style("Ctrl+C").bold().yellow()
        ))
        .print();
    println!();

    tokio::signal::ctrl_c().await?;
    info!("Shutting down routetest...");

    if runner.stop().is_ok() {
        info!("Stopping the running job before exit");
        let drained = tokio::time::timeout(STOP_GRACE, async {
            while runner.is_running() {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        })
        .await;
        if drained.is_err() {
            warn!("Job did not stop within {:?}", STOP_GRACE);
        }
    }

    lifecycle.shutdown().await?;
    terminal::print_goodbye();
    Ok(())
}
