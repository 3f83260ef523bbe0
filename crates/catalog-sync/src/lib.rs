//! Sync orchestration: reconciliation, job tracking, background execution and scheduling.

pub mod jobs;
pub mod reconcile;
pub mod runner;
pub mod schedule;

#[cfg(test)]
mod test_support;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use catalog_providers::{ProductProvider, ProviderDescriptor, ProviderError, ProviderRegistry};
use catalog_storage::{
    HttpClientConfig, HttpFetcher, InMemoryProductStore, PgProductStore, ProductStore,
    StorageError,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

pub use jobs::{
    JobOrigin, JobProgress, JobRegistry, JobStatus, JobStatusView, RegistryConfig, SyncJob,
};
pub use reconcile::Reconciler;
pub use runner::JobRunner;
pub use schedule::{EffectiveSchedule, ScheduledTrigger, SyncSchedule, SyncScheduler};

pub const CRATE_NAME: &str = "catalog-sync";

pub const MAX_HISTORY_LIMIT: usize = 100;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("sync job {0} not found")]
    NotFound(Uuid),
    #[error("network error: {0}")]
    Network(String),
    #[error("upstream returned http {status} for {url}")]
    Upstream { status: u16, url: String },
    #[error("schema error: {0}")]
    Schema(String),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("scheduler error: {0}")]
    Scheduler(String),
}

impl From<ProviderError> for SyncError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::Network(msg) => SyncError::Network(msg),
            ProviderError::Upstream { status, url } => SyncError::Upstream { status, url },
            ProviderError::Schema(msg) => SyncError::Schema(msg),
            err @ ProviderError::UnknownProvider { .. } => SyncError::Configuration(err.to_string()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: Option<String>,
    pub provider: String,
    pub provider_url: Option<String>,
    pub scheduler_enabled: bool,
    pub sync_cron: Option<String>,
    pub sync_interval_secs: Option<u64>,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    pub owner_id: i64,
    pub job_history_capacity: usize,
    pub job_retention_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            provider: catalog_providers::DUMMYJSON_KEY.to_string(),
            provider_url: None,
            scheduler_enabled: false,
            sync_cron: None,
            sync_interval_secs: None,
            http_timeout_secs: 20,
            user_agent: "catalog-sync/0.1".to_string(),
            owner_id: 1,
            job_history_capacity: 200,
            job_retention_secs: 3600,
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

fn env_non_empty(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            database_url: env_non_empty("DATABASE_URL"),
            provider: env_non_empty("CATALOG_PROVIDER").unwrap_or(defaults.provider),
            provider_url: env_non_empty("CATALOG_PROVIDER_URL"),
            scheduler_enabled: std::env::var("CATALOG_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            sync_cron: env_non_empty("CATALOG_SYNC_CRON"),
            sync_interval_secs: env_parse("CATALOG_SYNC_INTERVAL_SECS"),
            http_timeout_secs: env_parse("CATALOG_HTTP_TIMEOUT_SECS")
                .unwrap_or(defaults.http_timeout_secs),
            user_agent: env_non_empty("CATALOG_USER_AGENT").unwrap_or(defaults.user_agent),
            owner_id: env_parse("CATALOG_SYNC_OWNER_ID").unwrap_or(defaults.owner_id),
            job_history_capacity: env_parse("CATALOG_JOB_HISTORY_CAPACITY")
                .unwrap_or(defaults.job_history_capacity),
            job_retention_secs: env_parse("CATALOG_JOB_RETENTION_SECS")
                .unwrap_or(defaults.job_retention_secs),
        }
    }

    /// The schedule the service starts with. Falls back to the 30 minute cron.
    pub fn initial_schedule(&self) -> Result<SyncSchedule, SyncError> {
        match (self.sync_cron.as_deref(), self.sync_interval_secs) {
            (None, None) => Ok(SyncSchedule::default()),
            (cron, interval) => SyncSchedule::from_parts(cron, interval),
        }
    }

    fn registry_config(&self) -> RegistryConfig {
        RegistryConfig {
            capacity: self.job_history_capacity.max(1),
            retention: Duration::from_secs(self.job_retention_secs),
        }
    }

    fn http_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            ..HttpClientConfig::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerReceipt {
    pub job_id: Uuid,
    pub provider_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelReceipt {
    pub job_id: Uuid,
    pub accepted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleReceipt {
    pub accepted: bool,
    pub effective_schedule: EffectiveSchedule,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvidersView {
    pub current_provider: String,
    pub current_source_url: String,
    pub providers: Vec<ProviderDescriptor>,
}

/// Shared by manual triggers and scheduler ticks so both take the same path.
struct Launcher {
    providers: ProviderRegistry,
    http: Arc<HttpFetcher>,
    registry: Arc<JobRegistry>,
    runner: JobRunner,
    default_provider: String,
    provider_url: Option<String>,
}

impl Launcher {
    fn resolve(&self, key: Option<&str>) -> Result<Box<dyn ProductProvider>, SyncError> {
        let key = key.unwrap_or(&self.default_provider);
        let url = if key == self.default_provider {
            self.provider_url.as_deref()
        } else {
            None
        };
        Ok(self.providers.resolve(key, self.http.clone(), url)?)
    }

    /// Resolves the provider before registering, so a bad key leaves no job behind.
    async fn prepare(
        &self,
        origin: JobOrigin,
        key: Option<&str>,
    ) -> Result<(SyncJob, Box<dyn ProductProvider>), SyncError> {
        let provider = self.resolve(key)?;
        let job = self.registry.create(origin, provider.name()).await;
        info!(
            job_id = %job.id,
            provider = provider.name(),
            origin = ?origin,
            "sync job queued"
        );
        Ok((job, provider))
    }

    async fn launch(
        &self,
        origin: JobOrigin,
        key: Option<&str>,
    ) -> Result<TriggerReceipt, SyncError> {
        let (job, provider) = self.prepare(origin, key).await?;
        self.runner.spawn(job.id, provider, job.cancel.clone());
        Ok(TriggerReceipt {
            job_id: job.id,
            provider_name: job.provider,
        })
    }
}

struct ServiceInner {
    launcher: Arc<Launcher>,
    registry: Arc<JobRegistry>,
    store: Arc<dyn ProductStore>,
    scheduler: Mutex<SyncScheduler>,
    config: SyncConfig,
}

/// Job-control context. Cheap to clone; all clones share one registry and scheduler.
#[derive(Clone)]
pub struct SyncService {
    inner: Arc<ServiceInner>,
}

impl SyncService {
    pub fn new(
        config: SyncConfig,
        providers: ProviderRegistry,
        store: Arc<dyn ProductStore>,
    ) -> Result<Self, SyncError> {
        let schedule = config.initial_schedule()?;
        if providers.descriptor(&config.provider).is_none() {
            return Err(SyncError::Configuration(format!(
                "unknown provider type: {}. available: {}",
                config.provider,
                providers.keys().join(", ")
            )));
        }
        let http = HttpFetcher::new(config.http_config())
            .map_err(|err| SyncError::Configuration(format!("{err:#}")))?;

        let registry = Arc::new(JobRegistry::new(config.registry_config()));
        let runner = JobRunner::new(
            registry.clone(),
            store.clone(),
            Reconciler::new(config.owner_id),
        );
        let launcher = Arc::new(Launcher {
            providers,
            http: Arc::new(http),
            registry: registry.clone(),
            runner,
            default_provider: config.provider.clone(),
            provider_url: config.provider_url.clone(),
        });

        let tick_launcher = launcher.clone();
        let trigger: ScheduledTrigger = Arc::new(move || {
            let launcher = tick_launcher.clone();
            Box::pin(async move {
                if let Err(err) = launcher.launch(JobOrigin::Scheduled, None).await {
                    warn!(error = %err, "scheduled sync could not be started");
                }
            }) as Pin<Box<dyn Future<Output = ()> + Send>>
        });

        Ok(Self {
            inner: Arc::new(ServiceInner {
                launcher,
                registry,
                store,
                scheduler: Mutex::new(SyncScheduler::new(schedule, trigger)),
                config,
            }),
        })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    pub fn store(&self) -> Arc<dyn ProductStore> {
        self.inner.store.clone()
    }

    /// Registers a pending job and starts it in the background.
    pub async fn trigger_sync(&self, provider_key: Option<&str>) -> Result<TriggerReceipt, SyncError> {
        self.inner.launcher.launch(JobOrigin::Manual, provider_key).await
    }

    pub async fn get_status(&self, job_id: Uuid) -> Result<JobStatusView, SyncError> {
        self.inner.registry.view(job_id).await
    }

    /// Advisory: the running pass stops at its next checkpoint.
    pub async fn cancel(&self, job_id: Uuid) -> Result<CancelReceipt, SyncError> {
        self.inner.registry.request_cancel(job_id).await?;
        info!(%job_id, "sync job cancellation requested");
        Ok(CancelReceipt {
            job_id,
            accepted: true,
        })
    }

    pub async fn history(&self, limit: usize) -> Result<Vec<JobStatusView>, SyncError> {
        if !(1..=MAX_HISTORY_LIMIT).contains(&limit) {
            return Err(SyncError::Configuration(format!(
                "limit must be between 1 and {MAX_HISTORY_LIMIT}, got {limit}"
            )));
        }
        Ok(self.inner.registry.history(limit).await)
    }

    pub fn list_providers(&self) -> ProvidersView {
        let launcher = &self.inner.launcher;
        let current_source_url = launcher
            .provider_url
            .clone()
            .or_else(|| {
                launcher
                    .providers
                    .descriptor(&launcher.default_provider)
                    .map(|d| d.source_url.clone())
            })
            .unwrap_or_default();
        ProvidersView {
            current_provider: launcher.default_provider.clone(),
            current_source_url,
            providers: launcher.providers.descriptors(),
        }
    }

    pub async fn reschedule(
        &self,
        cron_expression: Option<&str>,
        interval_seconds: Option<u64>,
    ) -> Result<ScheduleReceipt, SyncError> {
        let schedule = SyncSchedule::from_parts(cron_expression, interval_seconds)?;
        let effective_schedule = self.inner.scheduler.lock().await.reschedule(schedule).await?;
        Ok(ScheduleReceipt {
            accepted: true,
            effective_schedule,
        })
    }

    pub async fn current_schedule(&self) -> EffectiveSchedule {
        self.inner.scheduler.lock().await.schedule().effective()
    }

    /// Runs one pass in the foreground and returns the finished job.
    pub async fn run_once(&self, provider_key: Option<&str>) -> Result<JobStatusView, SyncError> {
        let (job, provider) = self
            .inner
            .launcher
            .prepare(JobOrigin::Manual, provider_key)
            .await?;
        let span = info_span!("sync_job", job_id = %job.id, provider = provider.name());
        self.inner
            .launcher
            .runner
            .run(job.id, provider.as_ref(), &job.cancel)
            .instrument(span)
            .await
            .ok_or(SyncError::NotFound(job.id))
    }

    pub async fn start_scheduler(&self) -> Result<(), SyncError> {
        self.inner.scheduler.lock().await.start().await
    }

    /// Starts the scheduler only when it is enabled in configuration.
    pub async fn maybe_start_scheduler(&self) -> Result<bool, SyncError> {
        if !self.inner.config.scheduler_enabled {
            return Ok(false);
        }
        self.start_scheduler().await?;
        Ok(true)
    }

    pub async fn shutdown(&self) -> Result<(), SyncError> {
        self.inner.scheduler.lock().await.shutdown().await
    }
}

/// Postgres when `DATABASE_URL` is set (migrations applied), otherwise a process-local store.
pub async fn store_from_config(config: &SyncConfig) -> anyhow::Result<Arc<dyn ProductStore>> {
    match config.database_url.as_deref() {
        Some(url) => {
            let store = PgProductStore::connect(url).await?;
            store.migrate().await.context("running migrations")?;
            Ok(Arc::new(store))
        }
        None => {
            warn!("DATABASE_URL not set; products are kept in memory for this process only");
            Ok(Arc::new(InMemoryProductStore::new()))
        }
    }
}

pub async fn service_from_env() -> anyhow::Result<SyncService> {
    let config = SyncConfig::from_env();
    let store = store_from_config(&config).await?;
    SyncService::new(config, ProviderRegistry::builtin(), store).context("building sync service")
}

pub async fn run_sync_once_from_env(provider_key: Option<&str>) -> anyhow::Result<JobStatusView> {
    let service = service_from_env().await?;
    service
        .run_once(provider_key)
        .await
        .context("running sync pass")
}
