//! Cron-driven firing of enabled sync tasks.
//!
//! Each registered task owns one job loop. Unregistering cancels the loop
//! and waits on its firing gate, so once `unregister` returns the task can
//! no longer start a run. A firing that finds the previous run of the same
//! task still in flight is skipped; the in-flight flag is kept per task id
//! and survives re-registration.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use cron::Schedule as CronSchedule;
use futures::future::join_all;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::SyncEngine;
use crate::tasks::SyncTaskDefinition;

/// Fields of a cron expression: sec min hour day-of-month month day-of-week.
pub const CRON_FIELDS: usize = 6;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("invalid cron expression '{expr}': {reason}")]
    InvalidCron { expr: String, reason: String },

    #[error("task '{0}' is disabled")]
    Disabled(String),
}

/// Validate and parse a six-field cron expression.
pub fn parse_cron(expr: &str) -> Result<CronSchedule, SchedulerError> {
    let fields = expr.split_whitespace().count();
    if fields != CRON_FIELDS {
        return Err(SchedulerError::InvalidCron {
            expr: expr.to_string(),
            reason: format!(
                "expected {} fields (sec min hour day month weekday), got {}",
                CRON_FIELDS, fields
            ),
        });
    }
    CronSchedule::from_str(expr.trim()).map_err(|e| SchedulerError::InvalidCron {
        expr: expr.to_string(),
        reason: e.to_string(),
    })
}

/// One upcoming firing, for previews.
#[derive(Debug, Clone, Serialize)]
pub struct UpcomingRun {
    pub at: DateTime<Utc>,
    pub task_id: i64,
    pub task_name: String,
}

struct Job {
    name: String,
    schedule: CronSchedule,
    cancel: CancellationToken,
    gate: Arc<Mutex<()>>,
}

impl Job {
    async fn stop(self) {
        self.cancel.cancel();
        // A firing holds the gate while it decides to start a run.
        let _gate = self.gate.lock().await;
    }
}

#[derive(Clone)]
pub struct SyncScheduler {
    engine: Arc<SyncEngine>,
    jobs: Arc<Mutex<HashMap<i64, Job>>>,
    in_flight: Arc<Mutex<HashMap<i64, Arc<AtomicBool>>>>,
}

impl SyncScheduler {
    pub fn new(engine: Arc<SyncEngine>) -> Self {
        Self {
            engine,
            jobs: Arc::new(Mutex::new(HashMap::new())),
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Start firing `task` on its cron schedule, replacing any job already
    /// registered under the same id.
    pub async fn register(&self, task: &SyncTaskDefinition) -> Result<(), SchedulerError> {
        if !task.enabled {
            return Err(SchedulerError::Disabled(task.name.clone()));
        }
        let schedule = parse_cron(&task.cron_expr)?;

        let mut jobs = self.jobs.lock().await;
        if let Some(old) = jobs.remove(&task.id) {
            old.stop().await;
        }
        let in_flight = self
            .in_flight
            .lock()
            .await
            .entry(task.id)
            .or_default()
            .clone();

        let job = Job {
            name: task.name.clone(),
            schedule: schedule.clone(),
            cancel: CancellationToken::new(),
            gate: Arc::new(Mutex::new(())),
        };
        tokio::spawn(job_loop(
            self.engine.clone(),
            task.clone(),
            schedule,
            job.cancel.clone(),
            job.gate.clone(),
            in_flight,
        ));
        jobs.insert(task.id, job);

        info!(task = %task.name, task_id = task.id, cron = %task.cron_expr, "task scheduled");
        Ok(())
    }

    /// Stop firing a task. Returns whether a job was registered.
    pub async fn unregister(&self, task_id: i64) -> bool {
        let job = self.jobs.lock().await.remove(&task_id);
        match job {
            Some(job) => {
                let name = job.name.clone();
                job.stop().await;
                self.forget_idle(task_id).await;
                info!(task = %name, task_id, "task unscheduled");
                true
            }
            None => false,
        }
    }

    pub async fn is_registered(&self, task_id: i64) -> bool {
        self.jobs.lock().await.contains_key(&task_id)
    }

    pub async fn registered(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self.jobs.lock().await.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Firings due within the next `hours`, in time order.
    pub async fn preview(&self, hours: u64) -> Vec<UpcomingRun> {
        let now = Utc::now();
        let end = now + chrono::Duration::hours(hours as i64);
        let jobs = self.jobs.lock().await;

        let mut preview = Vec::new();
        for (id, job) in jobs.iter() {
            for at in job.schedule.after(&now) {
                if at > end {
                    break;
                }
                preview.push(UpcomingRun {
                    at,
                    task_id: *id,
                    task_name: job.name.clone(),
                });
            }
        }
        preview.sort_by(|a, b| a.at.cmp(&b.at).then(a.task_id.cmp(&b.task_id)));
        preview
    }

    /// Whether a run started by this task's schedule is still executing.
    pub async fn is_running(&self, task_id: i64) -> bool {
        self.in_flight
            .lock()
            .await
            .get(&task_id)
            .is_some_and(|f| f.load(Ordering::SeqCst))
    }

    /// Stop every job, then wait up to the configured grace period for runs
    /// already started to finish.
    pub async fn shutdown(&self) {
        let drained: Vec<Job> = self.jobs.lock().await.drain().map(|(_, j)| j).collect();
        let stopped = drained.len();
        join_all(drained.into_iter().map(Job::stop)).await;

        let grace = Duration::from_secs(self.engine.config().shutdown_grace_secs);
        let finished = self.engine.drain(grace).await;
        info!(stopped, runs_finished = finished, "scheduler stopped");
    }

    /// Drop the in-flight flag of an unscheduled task unless a run still
    /// holds it.
    async fn forget_idle(&self, task_id: i64) {
        let mut flags = self.in_flight.lock().await;
        if flags.get(&task_id).is_some_and(|f| !f.load(Ordering::SeqCst)) {
            flags.remove(&task_id);
        }
    }
}

async fn job_loop(
    engine: Arc<SyncEngine>,
    task: SyncTaskDefinition,
    schedule: CronSchedule,
    cancel: CancellationToken,
    gate: Arc<Mutex<()>>,
    in_flight: Arc<AtomicBool>,
) {
    loop {
        let Some(next) = schedule.after(&Utc::now()).next() else {
            warn!(task = %task.name, cron = %task.cron_expr, "schedule has no upcoming firings");
            break;
        };
        let wait = (next - Utc::now()).to_std().unwrap_or_default();

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(wait) => {}
        }

        let _gate = gate.lock().await;
        if cancel.is_cancelled() {
            break;
        }
        if in_flight.swap(true, Ordering::SeqCst) {
            warn!(task = %task.name, "previous run still in flight; skipping firing");
            continue;
        }

        debug!(task = %task.name, at = %next, "task firing");
        let run = engine.spawn(task.run_request());
        let flag = in_flight.clone();
        let name = task.name.clone();
        tokio::spawn(async move {
            match run.await {
                Ok(Ok(result)) => {
                    info!(task = %name, execution = %result.execution_id, status = %result.status, "scheduled run finished")
                }
                Ok(Err(e)) => error!(task = %name, error = %e, "scheduled run failed"),
                Err(e) => error!(task = %name, error = %e, "scheduled run aborted"),
            }
            flag.store(false, Ordering::SeqCst);
        });
    }

    debug!(task = %task.name, "job loop stopped");
}
