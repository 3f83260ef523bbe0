//! Sync job records and the process-wide registry that tracks them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use catalog_core::SyncSummary;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::SyncError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

/// Who asked for the sync. Kept for observability only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobOrigin {
    Manual,
    Scheduled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobProgress {
    pub current: u64,
    pub total: u64,
}

impl Default for JobProgress {
    fn default() -> Self {
        Self {
            current: 0,
            total: 1,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyncJob {
    pub id: Uuid,
    pub seq: u64,
    pub status: JobStatus,
    pub origin: JobOrigin,
    pub provider: String,
    pub progress: JobProgress,
    pub summary: Option<SyncSummary>,
    pub error: Option<String>,
    pub cancel_requested: bool,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub cancel: CancellationToken,
}

impl SyncJob {
    pub fn view(&self) -> JobStatusView {
        JobStatusView {
            job_id: self.id,
            status: self.status,
            origin: self.origin,
            provider: self.provider.clone(),
            progress: (self.status == JobStatus::Running).then_some(self.progress),
            result: self
                .summary
                .filter(|_| self.status == JobStatus::Succeeded),
            error: self
                .error
                .clone()
                .filter(|_| self.status == JobStatus::Failed),
            cancel_requested: self.cancel_requested,
            created_at: self.created_at,
            started_at: self.started_at,
            finished_at: self.finished_at,
        }
    }
}

/// Caller-facing snapshot of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatusView {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub origin: JobOrigin,
    pub provider: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<JobProgress>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<SyncSummary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub cancel_requested: bool,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy)]
pub struct RegistryConfig {
    pub capacity: usize,
    pub retention: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            capacity: 200,
            retention: Duration::from_secs(3600),
        }
    }
}

/// Concurrency-safe job table. Readers never wait on a running pipeline; each
/// status transition is a short write that swaps the job's fields in place.
#[derive(Debug)]
pub struct JobRegistry {
    jobs: RwLock<HashMap<Uuid, SyncJob>>,
    next_seq: AtomicU64,
    config: RegistryConfig,
}

impl Default for JobRegistry {
    fn default() -> Self {
        Self::new(RegistryConfig::default())
    }
}

impl JobRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
            next_seq: AtomicU64::new(0),
            config,
        }
    }

    /// Mints a pending job and returns a copy of it.
    pub async fn create(&self, origin: JobOrigin, provider: &str) -> SyncJob {
        let job = SyncJob {
            id: Uuid::new_v4(),
            seq: self.next_seq.fetch_add(1, Ordering::SeqCst),
            status: JobStatus::Pending,
            origin,
            provider: provider.to_string(),
            progress: JobProgress::default(),
            summary: None,
            error: None,
            cancel_requested: false,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            cancel: CancellationToken::new(),
        };

        let mut jobs = self.jobs.write().await;
        jobs.insert(job.id, job.clone());
        self.evict(&mut jobs, Utc::now());
        job
    }

    pub async fn get(&self, id: Uuid) -> Option<SyncJob> {
        self.jobs.read().await.get(&id).cloned()
    }

    pub async fn view(&self, id: Uuid) -> Result<JobStatusView, SyncError> {
        self.jobs
            .read()
            .await
            .get(&id)
            .map(SyncJob::view)
            .ok_or(SyncError::NotFound(id))
    }

    /// Applies `apply` to the job under the write lock and returns the result.
    pub async fn update<F>(&self, id: Uuid, apply: F) -> Option<SyncJob>
    where
        F: FnOnce(&mut SyncJob),
    {
        let mut jobs = self.jobs.write().await;
        let job = jobs.get_mut(&id)?;
        apply(job);
        Some(job.clone())
    }

    /// Flags the job and fires its token. The runner performs the transition.
    pub async fn request_cancel(&self, id: Uuid) -> Result<JobStatusView, SyncError> {
        let mut jobs = self.jobs.write().await;
        let job = jobs.get_mut(&id).ok_or(SyncError::NotFound(id))?;
        if job.status.is_terminal() {
            return Err(SyncError::Configuration(format!(
                "job {id} is already {}",
                job.status.as_str()
            )));
        }
        job.cancel_requested = true;
        job.cancel.cancel();
        Ok(job.view())
    }

    /// Most recent first.
    pub async fn history(&self, limit: usize) -> Vec<JobStatusView> {
        let jobs = self.jobs.read().await;
        let mut all = jobs.values().collect::<Vec<_>>();
        all.sort_by(|a, b| b.seq.cmp(&a.seq));
        all.into_iter().take(limit).map(SyncJob::view).collect()
    }

    pub async fn len(&self) -> usize {
        self.jobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    fn evict(&self, jobs: &mut HashMap<Uuid, SyncJob>, now: DateTime<Utc>) {
        let retention = chrono::Duration::from_std(self.config.retention)
            .unwrap_or_else(|_| chrono::Duration::hours(1));
        jobs.retain(|_, job| match (job.status.is_terminal(), job.finished_at) {
            (true, Some(finished_at)) => now - finished_at <= retention,
            _ => true,
        });

        if jobs.len() <= self.config.capacity {
            return;
        }
        let mut terminal = jobs
            .values()
            .filter(|job| job.status.is_terminal())
            .map(|job| (job.seq, job.id))
            .collect::<Vec<_>>();
        terminal.sort_unstable();
        let excess = jobs.len() - self.config.capacity;
        for (_, id) in terminal.into_iter().take(excess) {
            jobs.remove(&id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn finish(registry: &JobRegistry, id: Uuid, status: JobStatus) {
        registry
            .update(id, |job| {
                job.status = status;
                job.finished_at = Some(Utc::now());
            })
            .await
            .expect("job exists");
    }

    #[tokio::test]
    async fn history_is_most_recent_first_and_bounded() {
        let registry = JobRegistry::default();
        let mut ids = Vec::new();
        for _ in 0..8 {
            ids.push(registry.create(JobOrigin::Manual, "dummyjson").await.id);
        }

        let history = registry.history(5).await;
        assert_eq!(history.len(), 5);
        let expected = ids.iter().rev().take(5).copied().collect::<Vec<_>>();
        assert_eq!(history.iter().map(|v| v.job_id).collect::<Vec<_>>(), expected);
    }

    #[tokio::test]
    async fn view_only_exposes_fields_relevant_to_the_status() {
        let registry = JobRegistry::default();
        let job = registry.create(JobOrigin::Scheduled, "dummyjson").await;

        let pending = registry.view(job.id).await.unwrap();
        assert_eq!(pending.status, JobStatus::Pending);
        assert!(pending.progress.is_none());

        registry
            .update(job.id, |job| job.status = JobStatus::Running)
            .await
            .unwrap();
        let running = registry.view(job.id).await.unwrap();
        assert_eq!(running.progress, Some(JobProgress { current: 0, total: 1 }));

        registry
            .update(job.id, |job| {
                job.status = JobStatus::Succeeded;
                job.summary = Some(SyncSummary {
                    added: 1,
                    updated: 0,
                    total_processed: 1,
                });
            })
            .await
            .unwrap();
        let done = registry.view(job.id).await.unwrap();
        assert!(done.progress.is_none());
        assert_eq!(done.result.map(|s| s.added), Some(1));
        assert_eq!(done.origin, JobOrigin::Scheduled);
    }

    #[tokio::test]
    async fn unknown_job_is_not_found() {
        let registry = JobRegistry::default();
        let id = Uuid::new_v4();
        assert!(matches!(registry.view(id).await, Err(SyncError::NotFound(found)) if found == id));
        assert!(matches!(
            registry.request_cancel(id).await,
            Err(SyncError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn cancel_fires_token_for_active_jobs_and_rejects_terminal_ones() {
        let registry = JobRegistry::default();
        let active = registry.create(JobOrigin::Manual, "dummyjson").await;
        let view = registry.request_cancel(active.id).await.unwrap();
        assert!(view.cancel_requested);
        assert_eq!(view.status, JobStatus::Pending);
        assert!(active.cancel.is_cancelled());

        let done = registry.create(JobOrigin::Manual, "dummyjson").await;
        finish(&registry, done.id, JobStatus::Succeeded).await;
        assert!(matches!(
            registry.request_cancel(done.id).await,
            Err(SyncError::Configuration(_))
        ));
        assert!(!done.cancel.is_cancelled());
    }

    #[tokio::test]
    async fn capacity_evicts_oldest_terminal_jobs_only() {
        let registry = JobRegistry::new(RegistryConfig {
            capacity: 3,
            retention: Duration::from_secs(3600),
        });
        let oldest = registry.create(JobOrigin::Manual, "p").await;
        let active = registry.create(JobOrigin::Manual, "p").await;
        let second = registry.create(JobOrigin::Manual, "p").await;
        finish(&registry, oldest.id, JobStatus::Succeeded).await;
        finish(&registry, second.id, JobStatus::Failed).await;

        let newest = registry.create(JobOrigin::Manual, "p").await;
        assert_eq!(registry.len().await, 3);
        assert!(registry.get(oldest.id).await.is_none());
        assert!(registry.get(active.id).await.is_some());
        assert!(registry.get(second.id).await.is_some());
        assert!(registry.get(newest.id).await.is_some());
    }

    #[tokio::test]
    async fn expired_terminal_jobs_are_dropped_on_insert() {
        let registry = JobRegistry::new(RegistryConfig {
            capacity: 100,
            retention: Duration::from_secs(60),
        });
        let stale = registry.create(JobOrigin::Manual, "p").await;
        registry
            .update(stale.id, |job| {
                job.status = JobStatus::Failed;
                job.finished_at = Some(Utc::now() - chrono::Duration::minutes(5));
            })
            .await
            .unwrap();
        let waiting = registry.create(JobOrigin::Manual, "p").await;

        registry.create(JobOrigin::Manual, "p").await;
        assert!(registry.get(stale.id).await.is_none());
        assert!(registry.get(waiting.id).await.is_some());
    }
}
