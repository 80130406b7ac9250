//! One-shot scheduled runs.
//!
//! Every schedule owns at most one timer. When the timer fires the engine
//! goes through the same run gate as manual triggers: a busy gate marks the
//! schedule as skipped, otherwise the pipeline runs as a scheduled run. Fired
//! and skipped schedules are terminal until deleted.

mod timers;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio_cron_scheduler::JobScheduler;
use tracing::{info, warn};
use uuid::Uuid;

use crate::core::job::{JobResult, JobRunner, RunType};
use timers::TimerRegistry;

/// Minimum distance between any two schedules, checked when one is written.
pub const CONFLICT_WINDOW_MINUTES: i64 = 5;

pub const SKIPPED_OUTPUT: &str = "Job skipped: another job was already running.\n\n";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("schedule conflicts with an existing job")]
    Conflict,
    #[error("schedule {0} not found")]
    NotFound(String),
    #[error("schedule time must be in the future")]
    InPast,
    #[error("schedule {0} has already fired")]
    AlreadyFired(String),
    #[error("failed to arm timer: {0}")]
    Timer(String),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Schedule {
    pub id: String,
    pub time: DateTime<Utc>,
    pub is_past: bool,
    pub has_error: bool,
    pub is_running: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleResult {
    pub output: String,
    pub run_type: RunType,
}

impl Default for ScheduleResult {
    fn default() -> Self {
        Self {
            output: String::new(),
            run_type: RunType::Scheduled,
        }
    }
}

impl ScheduleResult {
    fn from_run(result: &JobResult) -> Self {
        Self {
            output: format!(
                "{}\n\n{}\n\n{}\n{}",
                result.scheduler_output,
                result.sdvn_output,
                result.local_output,
                result.error_message
            ),
            run_type: RunType::Scheduled,
        }
    }

    fn skipped() -> Self {
        Self {
            output: SKIPPED_OUTPUT.to_string(),
            run_type: RunType::Scheduled,
        }
    }
}

#[derive(Default)]
struct ScheduleBook {
    schedules: HashMap<String, Schedule>,
    results: HashMap<String, ScheduleResult>,
}

impl ScheduleBook {
    fn check_separation(&self, time: DateTime<Utc>, except: Option<&str>) -> Result<(), ScheduleError> {
        let clash = self
            .schedules
            .values()
            .filter(|s| Some(s.id.as_str()) != except)
            .any(|s| {
                let gap = if s.time > time { s.time - time } else { time - s.time };
                gap < TimeDelta::minutes(CONFLICT_WINDOW_MINUTES)
            });
        if clash {
            Err(ScheduleError::Conflict)
        } else {
            Ok(())
        }
    }
}

pub struct ScheduleEngine {
    runner: Arc<JobRunner>,
    timers: TimerRegistry,
    book: Mutex<ScheduleBook>,
    /// Held by create, update and delete from the book change until the
    /// timer matches it.
    writes: tokio::sync::Mutex<()>,
    this: Weak<ScheduleEngine>,
}

impl ScheduleEngine {
    pub fn new(runner: Arc<JobRunner>, scheduler: JobScheduler) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            runner,
            timers: TimerRegistry::new(scheduler),
            book: Mutex::new(ScheduleBook::default()),
            writes: tokio::sync::Mutex::new(()),
            this: this.clone(),
        })
    }

    fn book(&self) -> MutexGuard<'_, ScheduleBook> {
        self.book.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub async fn create(&self, time: DateTime<Utc>) -> Result<Schedule, ScheduleError> {
        ensure_future(time)?;
        let _write = self.writes.lock().await;
        let schedule = {
            let mut book = self.book();
            book.check_separation(time, None)?;
            let schedule = Schedule {
                id: Uuid::new_v4().to_string(),
                time,
                is_past: false,
                has_error: false,
                is_running: false,
            };
            book.schedules.insert(schedule.id.clone(), schedule.clone());
            schedule
        };

        if let Err(e) = self.arm(&schedule.id, time).await {
            self.book().schedules.remove(&schedule.id);
            return Err(e);
        }
        info!(schedule_id = %schedule.id, "Schedule created for {}", time.to_rfc3339());
        Ok(schedule)
    }

    /// Moves a pending schedule to a new time, replacing its timer.
    pub async fn update(&self, id: &str, time: DateTime<Utc>) -> Result<Schedule, ScheduleError> {
        let _write = self.writes.lock().await;
        let (previous, updated) = {
            let mut book = self.book();
            match book.schedules.get(id) {
                None => return Err(ScheduleError::NotFound(id.to_string())),
                Some(s) if s.is_past || s.is_running => {
                    return Err(ScheduleError::AlreadyFired(id.to_string()));
                }
                Some(_) => {}
            }
            ensure_future(time)?;
            book.check_separation(time, Some(id))?;
            let Some(schedule) = book.schedules.get_mut(id) else {
                return Err(ScheduleError::NotFound(id.to_string()));
            };
            let previous = schedule.time;
            schedule.time = time;
            (previous, schedule.clone())
        };

        if let Err(e) = self.arm(id, time).await {
            if let Some(schedule) = self.book().schedules.get_mut(id) {
                schedule.time = previous;
            }
            return Err(e);
        }
        info!(schedule_id = %id, "Schedule moved to {}", time.to_rfc3339());
        Ok(updated)
    }

    /// Removes the schedule, its timer and its result. Unknown ids are a
    /// no-op.
    pub async fn delete(&self, id: &str) {
        let _write = self.writes.lock().await;
        let existed = {
            let mut book = self.book();
            book.results.remove(id);
            book.schedules.remove(id).is_some()
        };
        self.timers.cancel(id).await;
        if existed {
            info!(schedule_id = %id, "Schedule deleted");
        }
    }

    /// All schedules, earliest first.
    pub fn list(&self) -> Vec<Schedule> {
        let mut schedules: Vec<Schedule> = self.book().schedules.values().cloned().collect();
        schedules.sort_by(|a, b| a.time.cmp(&b.time).then_with(|| a.id.cmp(&b.id)));
        schedules
    }

    pub fn get(&self, id: &str) -> Option<Schedule> {
        self.book().schedules.get(id).cloned()
    }

    /// The stored result, or an empty one if the schedule has not fired yet.
    pub fn result(&self, id: &str) -> ScheduleResult {
        self.book().results.get(id).cloned().unwrap_or_default()
    }

    async fn arm(&self, id: &str, time: DateTime<Utc>) -> Result<(), ScheduleError> {
        let delay = (time - Utc::now()).to_std().unwrap_or_default();
        let engine = self.this.clone();
        let schedule_id = id.to_string();
        self.timers
            .arm(id, delay, move |uuid| {
                let engine = engine.clone();
                let schedule_id = schedule_id.clone();
                async move {
                    if let Some(engine) = engine.upgrade() {
                        engine.fire(&schedule_id, uuid, time).await;
                    }
                }
            })
            .await
            .map_err(|e| ScheduleError::Timer(e.to_string()))
    }

    async fn fire(&self, id: &str, timer: Uuid, time: DateTime<Utc>) {
        if !self.timers.claim(id, timer).await {
            return;
        }
        let current = {
            let book = self.book();
            book.schedules
                .get(id)
                .is_some_and(|s| s.time == time && !s.is_past)
        };
        if !current {
            return;
        }

        let guard = match self.runner.begin(RunType::Scheduled) {
            Ok(guard) => guard,
            Err(e) => {
                warn!(schedule_id = %id, "Scheduled job skipped: {}", e);
                let mut book = self.book();
                if let Some(schedule) = book.schedules.get_mut(id) {
                    schedule.is_past = true;
                    schedule.has_error = true;
                    book.results.insert(id.to_string(), ScheduleResult::skipped());
                }
                return;
            }
        };

        if let Some(schedule) = self.book().schedules.get_mut(id) {
            schedule.is_running = true;
        }
        info!(schedule_id = %id, "Scheduled job firing");
        let result = self.runner.run(guard).await;

        let mut book = self.book();
        // A schedule deleted mid-run leaves no result behind.
        if let Some(schedule) = book.schedules.get_mut(id) {
            schedule.is_running = false;
            schedule.is_past = true;
            schedule.has_error = !result.error_message.is_empty();
            book.results
                .insert(id.to_string(), ScheduleResult::from_run(&result));
        }
    }
}

fn ensure_future(time: DateTime<Utc>) -> Result<(), ScheduleError> {
    if time <= Utc::now() {
        Err(ScheduleError::InPast)
    } else {
        Ok(())
    }
}
