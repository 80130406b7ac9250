use std::future::Future;
use std::sync::Mutex;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Owns one long-lived background remote command, e.g. a `tail -F` that has to
/// keep running while other steps execute.
///
/// The command runs on its own task which watches a stop token. [`close`]
/// signals that token and waits for the task; it is idempotent and may be
/// called from the pipeline step and from run cleanup alike. Dropping the
/// handle signals the stop token as well, so the remote command never
/// outlives its owner.
///
/// [`close`]: PersistentHandle::close
pub struct PersistentHandle {
    label: String,
    stop: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl PersistentHandle {
    /// Spawns `body` with the handle's stop token. `body` must return once the
    /// token is cancelled, after tearing its session down.
    pub fn spawn<F, Fut>(label: impl Into<String>, body: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let stop = CancellationToken::new();
        let task = tokio::spawn(body(stop.clone()));
        Self {
            label: label.into(),
            stop,
            task: Mutex::new(Some(task)),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn is_closed(&self) -> bool {
        self.stop.is_cancelled()
    }

    /// Requests teardown without waiting for it.
    pub fn signal_close(&self) {
        self.stop.cancel();
    }

    pub async fn close(&self) {
        self.stop.cancel();
        let task = self
            .task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        match task {
            Some(task) => {
                if let Err(e) = task.await {
                    warn!("Background session '{}' ended abnormally: {}", self.label, e);
                } else {
                    debug!("Background session '{}' closed", self.label);
                }
            }
            None => debug!("Background session '{}' already closed", self.label),
        }
    }
}

impl Drop for PersistentHandle {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

impl std::fmt::Debug for PersistentHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistentHandle")
            .field("label", &self.label)
            .field("closed", &self.is_closed())
            .finish()
    }
}
