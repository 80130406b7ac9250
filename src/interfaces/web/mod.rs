mod handlers;
mod router;

use anyhow::{Context, Result};
use async_trait::async_trait;
use axum::{
    extract::State,
    response::sse::{Event, Sse},
};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_stream::Stream;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::core::job::JobRunner;
use crate::core::lifecycle::LifecycleComponent;
use crate::core::schedule::ScheduleEngine;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) runner: Arc<JobRunner>,
    pub(crate) schedules: Arc<ScheduleEngine>,
    pub(crate) log_tx: tokio::sync::broadcast::Sender<String>,
}

impl AppState {
    pub(crate) fn new(
        runner: Arc<JobRunner>,
        schedules: Arc<ScheduleEngine>,
        log_tx: tokio::sync::broadcast::Sender<String>,
    ) -> Self {
        Self {
            runner,
            schedules,
            log_tx,
        }
    }
}

pub struct ApiServer {
    state: AppState,
    host: String,
    port: u16,
    shutdown: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl ApiServer {
    pub(crate) fn new(state: AppState, host: String, port: u16) -> Self {
        Self {
            state,
            host,
            port,
            shutdown: CancellationToken::new(),
            task: None,
        }
    }
}

// --- SSE Logs (used by router) ---

async fn sse_logs_endpoint(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let receiver = state.log_tx.subscribe();
    let stream = BroadcastStream::new(receiver).map(|msg| match msg {
        Ok(line) => Ok(Event::default().data(line)),
        Err(_) => Ok(Event::default().data("Log stream lagged")),
    });

    Sse::new(stream)
}

// --- Lifecycle Implementation ---

#[async_trait]
impl LifecycleComponent for ApiServer {
    async fn on_init(&mut self) -> Result<()> {
        info!("API Server initializing...");
        Ok(())
    }

    async fn on_start(&mut self) -> Result<()> {
        let addr = format!("{}:{}", self.host, self.port);
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .with_context(|| format!("failed to bind API server to {addr}"))?;
        let app = router::build_api_router(self.state.clone());
        let shutdown = self.shutdown.clone();

        self.task = Some(tokio::spawn(async move {
            info!("API Server running at http://{addr}");
            let served = axum::serve(listener, app)
                .with_graceful_shutdown(async move { shutdown.cancelled().await })
                .await;
            if let Err(e) = served {
                tracing::error!("API Server crashed: {}", e);
            }
        }));
        Ok(())
    }

    async fn on_shutdown(&mut self) -> Result<()> {
        info!("API Server shutting down...");
        self.shutdown.cancel();
        if let Some(task) = self.task.take() {
            // Open log streams keep connections alive; do not wait on them forever.
            if tokio::time::timeout(SHUTDOWN_GRACE, task).await.is_err() {
                warn!("API Server did not drain within {:?}", SHUTDOWN_GRACE);
            }
        }
        Ok(())
    }
}
