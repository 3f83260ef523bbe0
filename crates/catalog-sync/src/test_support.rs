use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use catalog_core::{
    ExternalId, ExternalRecord, NormalizedProduct, PageRequest, PersistedProduct, ProductPage,
    ProductUpsert,
};
use catalog_providers::{
    ProductProvider, ProviderDescriptor, ProviderError, ProviderRegistry, ProviderSettings,
};
use catalog_storage::{InMemoryProductStore, ProductStore, StorageError};
use serde_json::json;
use tokio::sync::Notify;
use uuid::Uuid;

use crate::jobs::JobStatusView;
use crate::SyncService;

pub fn product(id: i64, title: &str, price: f64) -> NormalizedProduct {
    NormalizedProduct {
        external_id: ExternalId::Int(id),
        title: title.to_string(),
        price,
        description: Some(format!("{title} description")),
        height: Some(1.0),
        length: Some(2.0),
        depth: Some(3.0),
        source: "static".to_string(),
    }
}

pub fn record(id: i64, title: &str, price: f64) -> ExternalRecord {
    match json!({ "id": id, "title": title, "price": price }) {
        serde_json::Value::Object(map) => map,
        _ => unreachable!(),
    }
}

fn normalize_record(name: &str, record: &ExternalRecord) -> Result<NormalizedProduct, ProviderError> {
    let id = record
        .get("id")
        .and_then(|v| v.as_i64())
        .ok_or_else(|| ProviderError::Schema("missing id".into()))?;
    let title = record
        .get("title")
        .and_then(|v| v.as_str())
        .ok_or_else(|| ProviderError::Schema(format!("product {id}: missing title")))?;
    let price = record
        .get("price")
        .and_then(|v| v.as_f64())
        .ok_or_else(|| ProviderError::Schema(format!("product {id}: missing price")))?;
    Ok(NormalizedProduct {
        source: name.to_string(),
        ..product(id, title, price)
    })
}

/// Reads delegate to an in-memory store; every write is rejected.
pub struct FailingStore {
    pub inner: InMemoryProductStore,
}

impl FailingStore {
    pub fn new() -> Self {
        Self {
            inner: InMemoryProductStore::new(),
        }
    }
}

#[async_trait]
impl ProductStore for FailingStore {
    async fn find_by_external_id(
        &self,
        external_id: &ExternalId,
    ) -> Result<Option<PersistedProduct>, StorageError> {
        self.inner.find_by_external_id(external_id).await
    }

    async fn upsert_batch(&self, _batch: Vec<ProductUpsert>) -> Result<(), StorageError> {
        Err(StorageError::Rejected("disk full".into()))
    }

    async fn get_product(&self, id: i64) -> Result<Option<PersistedProduct>, StorageError> {
        self.inner.get_product(id).await
    }

    async fn list_products(&self, page: &PageRequest) -> Result<ProductPage, StorageError> {
        self.inner.list_products(page).await
    }
}

/// Blocks every lookup on `gate` so a test can act while reconcile is in flight.
pub struct GatedStore {
    pub inner: InMemoryProductStore,
    gate: Arc<Gate>,
}

impl GatedStore {
    pub fn new(gate: Arc<Gate>) -> Self {
        Self {
            inner: InMemoryProductStore::new(),
            gate,
        }
    }
}

#[async_trait]
impl ProductStore for GatedStore {
    async fn find_by_external_id(
        &self,
        external_id: &ExternalId,
    ) -> Result<Option<PersistedProduct>, StorageError> {
        self.gate.entered.notify_one();
        self.gate.release.notified().await;
        self.inner.find_by_external_id(external_id).await
    }

    async fn upsert_batch(&self, batch: Vec<ProductUpsert>) -> Result<(), StorageError> {
        self.inner.upsert_batch(batch).await
    }

    async fn get_product(&self, id: i64) -> Result<Option<PersistedProduct>, StorageError> {
        self.inner.get_product(id).await
    }

    async fn list_products(&self, page: &PageRequest) -> Result<ProductPage, StorageError> {
        self.inner.list_products(page).await
    }
}

pub struct StaticProvider {
    name: &'static str,
    records: Vec<ExternalRecord>,
    failure: Option<fn() -> ProviderError>,
    fetches: Arc<AtomicUsize>,
}

impl StaticProvider {
    pub fn new(records: Vec<ExternalRecord>) -> Self {
        Self {
            name: "static",
            records,
            failure: None,
            fetches: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn failing(failure: fn() -> ProviderError) -> Self {
        Self {
            failure: Some(failure),
            ..Self::new(Vec::new())
        }
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProductProvider for StaticProvider {
    fn name(&self) -> &'static str {
        self.name
    }

    fn source_url(&self) -> &str {
        "memory://static"
    }

    async fn fetch_raw(&self) -> Result<Vec<ExternalRecord>, ProviderError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        match self.failure {
            Some(failure) => Err(failure()),
            None => Ok(self.records.clone()),
        }
    }

    fn normalize(&self, record: &ExternalRecord) -> Result<NormalizedProduct, ProviderError> {
        normalize_record(self.name, record)
    }
}

#[derive(Default)]
pub struct Gate {
    pub entered: Notify,
    pub release: Notify,
}

/// Signals `entered` once fetch starts, then blocks until `release` fires.
pub struct GatedProvider {
    records: Vec<ExternalRecord>,
    gate: Arc<Gate>,
}

impl GatedProvider {
    pub fn new(records: Vec<ExternalRecord>) -> Self {
        Self::with_gate(records, Arc::new(Gate::default()))
    }

    pub fn with_gate(records: Vec<ExternalRecord>, gate: Arc<Gate>) -> Self {
        Self { records, gate }
    }

    pub fn gate(&self) -> Arc<Gate> {
        self.gate.clone()
    }
}

#[async_trait]
impl ProductProvider for GatedProvider {
    fn name(&self) -> &'static str {
        "gated"
    }

    fn source_url(&self) -> &str {
        "memory://gated"
    }

    async fn fetch_raw(&self) -> Result<Vec<ExternalRecord>, ProviderError> {
        self.gate.entered.notify_one();
        self.gate.release.notified().await;
        Ok(self.records.clone())
    }

    fn normalize(&self, record: &ExternalRecord) -> Result<NormalizedProduct, ProviderError> {
        normalize_record("gated", record)
    }
}

fn descriptor(name: &str) -> ProviderDescriptor {
    ProviderDescriptor {
        name: name.to_string(),
        description: format!("{name} test provider"),
        source_url: format!("memory://{name}"),
    }
}

/// Registers `static` (serves `records`), `gated` (blocks on `gate`) and `broken`
/// (always a network failure).
pub fn test_providers(records: Vec<ExternalRecord>, gate: Arc<Gate>) -> ProviderRegistry {
    let mut registry = ProviderRegistry::empty();

    let static_records = records.clone();
    registry.register(
        descriptor("static"),
        Arc::new(move |_settings: ProviderSettings| {
            Box::new(StaticProvider::new(static_records.clone())) as Box<dyn ProductProvider>
        }),
    );
    registry.register(
        descriptor("gated"),
        Arc::new(move |_settings: ProviderSettings| {
            Box::new(GatedProvider::with_gate(records.clone(), gate.clone()))
                as Box<dyn ProductProvider>
        }),
    );
    registry.register(
        descriptor("broken"),
        Arc::new(|_settings: ProviderSettings| {
            Box::new(StaticProvider::failing(|| {
                ProviderError::Network("connection refused".into())
            })) as Box<dyn ProductProvider>
        }),
    );
    registry
}

pub async fn wait_for_terminal(service: &SyncService, job_id: Uuid) -> JobStatusView {
    for _ in 0..500 {
        let view = service.get_status(job_id).await.expect("job is registered");
        if view.status.is_terminal() {
            return view;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("job {job_id} did not finish");
}
