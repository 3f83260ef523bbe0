//! Executes one sync pass for a registered job.

use std::sync::Arc;

use catalog_core::SyncSummary;
use catalog_providers::{normalize_all, ProductProvider};
use catalog_storage::ProductStore;
use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::jobs::{JobRegistry, JobStatus, JobStatusView};
use crate::reconcile::Reconciler;
use crate::SyncError;

enum Outcome {
    Succeeded(SyncSummary),
    Failed(String),
    Cancelled,
}

/// Drives a job through fetch, normalize and reconcile. The only writer of job status
/// after creation.
#[derive(Clone)]
pub struct JobRunner {
    registry: Arc<JobRegistry>,
    store: Arc<dyn ProductStore>,
    reconciler: Reconciler,
}

impl JobRunner {
    pub fn new(
        registry: Arc<JobRegistry>,
        store: Arc<dyn ProductStore>,
        reconciler: Reconciler,
    ) -> Self {
        Self {
            registry,
            store,
            reconciler,
        }
    }

    /// Runs the job on a background task and returns immediately.
    pub fn spawn(
        &self,
        job_id: Uuid,
        provider: Box<dyn ProductProvider>,
        cancel: CancellationToken,
    ) -> JoinHandle<Option<JobStatusView>> {
        let runner = self.clone();
        let span = info_span!("sync_job", %job_id, provider = provider.name());
        tokio::spawn(
            async move { runner.run(job_id, provider.as_ref(), &cancel).await }.instrument(span),
        )
    }

    /// Runs the job to a terminal state. Returns `None` if the job is not registered.
    pub async fn run(
        &self,
        job_id: Uuid,
        provider: &dyn ProductProvider,
        cancel: &CancellationToken,
    ) -> Option<JobStatusView> {
        let outcome = self.execute(job_id, provider, cancel).await;

        let finished = self
            .registry
            .update(job_id, |job| {
                job.finished_at = Some(Utc::now());
                match outcome {
                    // A cancel that lands during reconcile still ends the job cancelled.
                    Outcome::Succeeded(summary) if job.cancel_requested => {
                        job.status = JobStatus::Cancelled;
                        job.summary = Some(summary);
                    }
                    Outcome::Succeeded(summary) => {
                        job.status = JobStatus::Succeeded;
                        job.progress.current = summary.total_processed as u64;
                        job.summary = Some(summary);
                    }
                    Outcome::Failed(error) => {
                        job.status = JobStatus::Failed;
                        job.error = Some(error);
                    }
                    Outcome::Cancelled => job.status = JobStatus::Cancelled,
                }
            })
            .await?;

        match finished.status {
            JobStatus::Succeeded => info!(
                added = finished.summary.map(|s| s.added).unwrap_or_default(),
                updated = finished.summary.map(|s| s.updated).unwrap_or_default(),
                "sync job succeeded"
            ),
            JobStatus::Failed => warn!(
                error = finished.error.as_deref().unwrap_or_default(),
                "sync job failed"
            ),
            _ => info!(status = finished.status.as_str(), "sync job finished"),
        }
        Some(finished.view())
    }

    async fn execute(
        &self,
        job_id: Uuid,
        provider: &dyn ProductProvider,
        cancel: &CancellationToken,
    ) -> Outcome {
        if cancel.is_cancelled() {
            return Outcome::Cancelled;
        }
        self.registry
            .update(job_id, |job| {
                job.status = JobStatus::Running;
                job.started_at = Some(Utc::now());
            })
            .await;
        info!("sync job started");

        let records = match provider.fetch_raw().await {
            Ok(records) => records,
            Err(err) => return Outcome::Failed(SyncError::from(err).to_string()),
        };
        let total = records.len() as u64;
        self.registry
            .update(job_id, |job| job.progress.total = total)
            .await;
        if cancel.is_cancelled() {
            return Outcome::Cancelled;
        }

        let products = match normalize_all(provider, &records) {
            Ok(products) => products,
            Err(err) => return Outcome::Failed(SyncError::from(err).to_string()),
        };
        let normalized = products.len() as u64;
        self.registry
            .update(job_id, |job| job.progress.current = normalized)
            .await;
        if cancel.is_cancelled() {
            return Outcome::Cancelled;
        }

        match self.reconciler.reconcile(self.store.as_ref(), &products).await {
            Ok(summary) => Outcome::Succeeded(summary),
            Err(err) => Outcome::Failed(SyncError::from(err).to_string()),
        }
    }
}
