use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler, JobSchedulerError};
use tracing::{debug, warn};
use uuid::Uuid;

/// One-shot timers keyed by schedule id, backed by the lifecycle's
/// [`JobScheduler`]. At most one timer is live per id.
pub(crate) struct TimerRegistry {
    scheduler: JobScheduler,
    jobs: Mutex<HashMap<String, Uuid>>,
}

impl TimerRegistry {
    pub(crate) fn new(scheduler: JobScheduler) -> Self {
        Self {
            scheduler,
            jobs: Mutex::new(HashMap::new()),
        }
    }

    /// Installs a timer firing `callback` after `delay`, replacing any timer
    /// already registered for `id`. The old timer is only removed once the
    /// new one is in place, so a failed arm leaves the old one untouched.
    ///
    /// The callback receives the job uuid, to be handed to [`claim`].
    ///
    /// [`claim`]: TimerRegistry::claim
    pub(crate) async fn arm<F, Fut>(
        &self,
        id: &str,
        delay: Duration,
        callback: F,
    ) -> Result<(), JobSchedulerError>
    where
        F: Fn(Uuid) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let job = Job::new_one_shot_async(delay, move |uuid, _scheduler| {
            Box::pin(callback(uuid))
        })?;

        let mut jobs = self.jobs.lock().await;
        let uuid = self.scheduler.add(job).await?;
        if let Some(previous) = jobs.insert(id.to_string(), uuid) {
            self.remove_job(id, previous).await;
        }
        debug!(schedule_id = %id, job_id = %uuid, "Timer armed in {:?}", delay);
        Ok(())
    }

    /// Called by a firing timer. Returns `true` when `uuid` is still the live
    /// timer for `id`, unregistering it; a replaced or cancelled timer gets
    /// `false` and must do nothing.
    pub(crate) async fn claim(&self, id: &str, uuid: Uuid) -> bool {
        let mut jobs = self.jobs.lock().await;
        if jobs.get(id) == Some(&uuid) {
            jobs.remove(id);
            true
        } else {
            false
        }
    }

    pub(crate) async fn cancel(&self, id: &str) {
        let mut jobs = self.jobs.lock().await;
        if let Some(uuid) = jobs.remove(id) {
            self.remove_job(id, uuid).await;
        }
    }

    async fn remove_job(&self, id: &str, uuid: Uuid) {
        if let Err(e) = self.scheduler.remove(&uuid).await {
            warn!(schedule_id = %id, "Failed to remove timer {}: {}", uuid, e);
        }
    }

    #[cfg(test)]
    pub(crate) async fn is_armed(&self, id: &str) -> bool {
        self.jobs.lock().await.contains_key(id)
    }
}
