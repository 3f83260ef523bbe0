//! Periodic sync triggering on top of tokio-cron-scheduler.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_cron_scheduler::{Job, JobScheduler, JobSchedulerError};
use tracing::info;
use uuid::Uuid;

use crate::SyncError;

/// Every 30 minutes, on the hour and half hour.
pub const DEFAULT_SYNC_CRON: &str = "0 */30 * * * *";

/// Applied when a reschedule request names neither a cron expression nor an interval.
pub const DEFAULT_RESCHEDULE_INTERVAL: Duration = Duration::from_secs(300);

pub type ScheduledTrigger =
    Arc<dyn Fn() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncSchedule {
    Cron(String),
    Interval(Duration),
}

impl Default for SyncSchedule {
    fn default() -> Self {
        SyncSchedule::Cron(DEFAULT_SYNC_CRON.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EffectiveSchedule {
    pub cron_expression: Option<String>,
    pub interval_seconds: Option<u64>,
}

impl SyncSchedule {
    /// Cron and interval are mutually exclusive.
    pub fn from_parts(
        cron_expression: Option<&str>,
        interval_seconds: Option<u64>,
    ) -> Result<Self, SyncError> {
        match (cron_expression, interval_seconds) {
            (Some(_), Some(_)) => Err(SyncError::Configuration(
                "cannot specify both cron_expression and interval_seconds".to_string(),
            )),
            (Some(expr), None) if expr.trim().is_empty() => Err(SyncError::Configuration(
                "cron_expression must not be empty".to_string(),
            )),
            (Some(expr), None) => Ok(SyncSchedule::Cron(with_seconds_field(expr))),
            (None, Some(0)) => Err(SyncError::Configuration(
                "interval_seconds must be greater than zero".to_string(),
            )),
            (None, Some(secs)) => Ok(SyncSchedule::Interval(Duration::from_secs(secs))),
            (None, None) => Ok(SyncSchedule::Interval(DEFAULT_RESCHEDULE_INTERVAL)),
        }
    }

    pub fn effective(&self) -> EffectiveSchedule {
        match self {
            SyncSchedule::Cron(expr) => EffectiveSchedule {
                cron_expression: Some(expr.clone()),
                interval_seconds: None,
            },
            SyncSchedule::Interval(every) => EffectiveSchedule {
                cron_expression: None,
                interval_seconds: Some(every.as_secs()),
            },
        }
    }
}

/// Five-field crontab expressions fire at second zero.
fn with_seconds_field(expr: &str) -> String {
    let fields = expr.split_whitespace().collect::<Vec<_>>();
    if fields.len() == 5 {
        format!("0 {}", fields.join(" "))
    } else {
        expr.trim().to_string()
    }
}

fn scheduler_error(err: JobSchedulerError) -> SyncError {
    SyncError::Scheduler(err.to_string())
}

/// Builds the scheduler job, which also validates the cron expression.
fn build_job(schedule: &SyncSchedule, trigger: ScheduledTrigger) -> Result<Job, SyncError> {
    let job = match schedule {
        SyncSchedule::Cron(expr) => Job::new_async(expr.as_str(), move |_uuid, _l| {
            let trigger = trigger.clone();
            Box::pin(async move { trigger().await })
        }),
        SyncSchedule::Interval(every) => Job::new_repeated_async(*every, move |_uuid, _l| {
            let trigger = trigger.clone();
            Box::pin(async move { trigger().await })
        }),
    };
    job.map_err(|err| {
        SyncError::Configuration(format!("invalid sync schedule {schedule:?}: {err}"))
    })
}

struct RunningScheduler {
    scheduler: JobScheduler,
    job_id: Uuid,
}

/// Owns the cadence. Fires `trigger` on every tick; never touches job records itself.
pub struct SyncScheduler {
    schedule: SyncSchedule,
    trigger: ScheduledTrigger,
    running: Option<RunningScheduler>,
}

impl SyncScheduler {
    pub fn new(schedule: SyncSchedule, trigger: ScheduledTrigger) -> Self {
        Self {
            schedule,
            trigger,
            running: None,
        }
    }

    pub fn schedule(&self) -> &SyncSchedule {
        &self.schedule
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    pub async fn start(&mut self) -> Result<(), SyncError> {
        if self.running.is_some() {
            return Ok(());
        }

        let job = build_job(&self.schedule, self.trigger.clone())?;
        let scheduler = JobScheduler::new().await.map_err(scheduler_error)?;
        let job_id = scheduler.add(job).await.map_err(scheduler_error)?;
        scheduler.start().await.map_err(scheduler_error)?;
        info!(schedule = ?self.schedule, "sync scheduler started");

        self.running = Some(RunningScheduler { scheduler, job_id });
        Ok(())
    }

    /// Swaps the cadence. An invalid schedule is rejected before the current one is removed.
    pub async fn reschedule(&mut self, schedule: SyncSchedule) -> Result<EffectiveSchedule, SyncError> {
        let job = build_job(&schedule, self.trigger.clone())?;

        if let Some(running) = self.running.as_mut() {
            let replacement = running.scheduler.add(job).await.map_err(scheduler_error)?;
            let previous = std::mem::replace(&mut running.job_id, replacement);
            running
                .scheduler
                .remove(&previous)
                .await
                .map_err(scheduler_error)?;
            info!(schedule = ?schedule, "sync scheduler rescheduled");
        }

        self.schedule = schedule;
        Ok(self.schedule.effective())
    }

    pub async fn shutdown(&mut self) -> Result<(), SyncError> {
        if let Some(mut running) = self.running.take() {
            running.scheduler.shutdown().await.map_err(scheduler_error)?;
            info!("sync scheduler stopped");
        }
        Ok(())
    }
}
