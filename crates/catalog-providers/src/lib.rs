//! Product provider contracts, the DummyJSON provider, and the provider registry.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use catalog_core::{ExternalId, ExternalRecord, NormalizedProduct};
use catalog_storage::{FetchError, HttpFetcher};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "catalog-providers";

pub const DUMMYJSON_KEY: &str = "dummyjson";
pub const DUMMYJSON_DEFAULT_URL: &str = "https://dummyjson.com/products";

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("network error: {0}")]
    Network(String),
    #[error("upstream returned http {status} for {url}")]
    Upstream { status: u16, url: String },
    #[error("schema error: {0}")]
    Schema(String),
    #[error("unknown provider type: {key}. available: {}", .available.join(", "))]
    UnknownProvider { key: String, available: Vec<String> },
}

impl From<FetchError> for ProviderError {
    fn from(err: FetchError) -> Self {
        match err {
            FetchError::HttpStatus { status, url } => ProviderError::Upstream { status, url },
            err if err.is_timeout() => ProviderError::Network(format!("request timed out: {err}")),
            err => ProviderError::Network(err.to_string()),
        }
    }
}

#[async_trait]
pub trait ProductProvider: Send + Sync {
    /// Stable identifier, also recorded as the `source` of normalized products.
    fn name(&self) -> &'static str;

    fn source_url(&self) -> &str;

    async fn fetch_raw(&self) -> Result<Vec<ExternalRecord>, ProviderError>;

    fn normalize(&self, record: &ExternalRecord) -> Result<NormalizedProduct, ProviderError>;

    async fn fetch_and_normalize(&self) -> Result<Vec<NormalizedProduct>, ProviderError> {
        let records = self.fetch_raw().await?;
        normalize_all(self, &records)
    }
}

/// Normalizes every record, failing the whole batch on the first bad one.
pub fn normalize_all<P>(
    provider: &P,
    records: &[ExternalRecord],
) -> Result<Vec<NormalizedProduct>, ProviderError>
where
    P: ProductProvider + ?Sized,
{
    records.iter().map(|record| provider.normalize(record)).collect()
}

#[derive(Debug, Deserialize)]
struct DummyJsonEnvelope {
    products: Vec<ExternalRecord>,
    total: u64,
    skip: u64,
    limit: u64,
}

#[derive(Debug, Deserialize)]
struct DummyJsonProduct {
    id: i64,
    title: String,
    price: NumberLike,
    description: String,
    #[serde(default)]
    dimensions: Option<DummyJsonDimensions>,
}

#[derive(Debug, Default, Deserialize)]
struct DummyJsonDimensions {
    width: Option<f64>,
    height: Option<f64>,
    depth: Option<f64>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum NumberLike {
    Number(f64),
    Text(String),
}

impl NumberLike {
    fn to_f64(&self) -> Option<f64> {
        match self {
            NumberLike::Number(v) => Some(*v),
            NumberLike::Text(s) => s.trim().parse().ok(),
        }
    }
}

fn non_negative(field: &str, external_id: i64, value: f64) -> Result<f64, ProviderError> {
    if value.is_finite() && value >= 0.0 {
        Ok(value)
    } else {
        Err(ProviderError::Schema(format!(
            "product {external_id}: {field} must be a non-negative number, got {value}"
        )))
    }
}

/// Parses a DummyJSON list response into raw product records.
pub fn parse_dummyjson_envelope(body: &[u8]) -> Result<Vec<ExternalRecord>, ProviderError> {
    let envelope: DummyJsonEnvelope = serde_json::from_slice(body)
        .map_err(|e| ProviderError::Schema(format!("dummyjson response envelope: {e}")))?;
    debug!(
        total = envelope.total,
        skip = envelope.skip,
        limit = envelope.limit,
        records = envelope.products.len(),
        "parsed dummyjson envelope"
    );
    Ok(envelope.products)
}

#[derive(Debug, Clone)]
pub struct DummyJsonProvider {
    http: Arc<HttpFetcher>,
    source_url: String,
}

impl DummyJsonProvider {
    pub fn new(http: Arc<HttpFetcher>, source_url: impl Into<String>) -> Self {
        Self {
            http,
            source_url: source_url.into(),
        }
    }
}

#[async_trait]
impl ProductProvider for DummyJsonProvider {
    fn name(&self) -> &'static str {
        DUMMYJSON_KEY
    }

    fn source_url(&self) -> &str {
        &self.source_url
    }

    async fn fetch_raw(&self) -> Result<Vec<ExternalRecord>, ProviderError> {
        let response = self.http.fetch_bytes(self.name(), &self.source_url).await?;
        parse_dummyjson_envelope(&response.body)
    }

    fn normalize(&self, record: &ExternalRecord) -> Result<NormalizedProduct, ProviderError> {
        let product: DummyJsonProduct = serde_json::from_value(JsonValue::Object(record.clone()))
            .map_err(|e| ProviderError::Schema(format!("dummyjson product: {e}")))?;

        let price = product.price.to_f64().ok_or_else(|| {
            ProviderError::Schema(format!("product {}: price is not numeric", product.id))
        })?;
        let price = non_negative("price", product.id, price)?;

        // Upstream "width" is stored as our "length".
        let dimensions = product.dimensions.unwrap_or_default();
        let length = non_negative("width", product.id, dimensions.width.unwrap_or(0.0))?;
        let height = non_negative("height", product.id, dimensions.height.unwrap_or(0.0))?;
        let depth = non_negative("depth", product.id, dimensions.depth.unwrap_or(0.0))?;

        Ok(NormalizedProduct {
            external_id: ExternalId::Int(product.id),
            title: product.title,
            price,
            description: Some(product.description),
            height: Some(height),
            length: Some(length),
            depth: Some(depth),
            source: self.name().to_string(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderDescriptor {
    pub name: String,
    pub description: String,
    pub source_url: String,
}

#[derive(Debug, Clone)]
pub struct ProviderSettings {
    pub http: Arc<HttpFetcher>,
    pub source_url: String,
}

pub type ProviderFactory = Arc<dyn Fn(ProviderSettings) -> Box<dyn ProductProvider> + Send + Sync>;

#[derive(Clone)]
struct RegisteredProvider {
    descriptor: ProviderDescriptor,
    factory: ProviderFactory,
}

/// Maps provider keys to constructors. New sources register here; callers only
/// ever go through [`ProviderRegistry::resolve`].
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    entries: BTreeMap<String, RegisteredProvider>,
}

impl ProviderRegistry {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn builtin() -> Self {
        let mut registry = Self::empty();
        registry.register(
            ProviderDescriptor {
                name: DUMMYJSON_KEY.to_string(),
                description: "DummyJSON API for testing".to_string(),
                source_url: DUMMYJSON_DEFAULT_URL.to_string(),
            },
            Arc::new(|settings: ProviderSettings| {
                Box::new(DummyJsonProvider::new(settings.http, settings.source_url))
                    as Box<dyn ProductProvider>
            }),
        );
        registry
    }

    pub fn register(&mut self, descriptor: ProviderDescriptor, factory: ProviderFactory) {
        self.entries.insert(
            descriptor.name.clone(),
            RegisteredProvider {
                descriptor,
                factory,
            },
        );
    }

    pub fn keys(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    pub fn descriptor(&self, key: &str) -> Option<&ProviderDescriptor> {
        self.entries.get(key).map(|entry| &entry.descriptor)
    }

    pub fn descriptors(&self) -> Vec<ProviderDescriptor> {
        self.entries
            .values()
            .map(|entry| entry.descriptor.clone())
            .collect()
    }

    /// Builds the provider for `key`. Without a URL override the descriptor's URL is used.
    pub fn resolve(
        &self,
        key: &str,
        http: Arc<HttpFetcher>,
        source_url: Option<&str>,
    ) -> Result<Box<dyn ProductProvider>, ProviderError> {
        let entry = self
            .entries
            .get(key)
            .ok_or_else(|| ProviderError::UnknownProvider {
                key: key.to_string(),
                available: self.keys(),
            })?;
        let source_url = source_url
            .map(ToString::to_string)
            .unwrap_or_else(|| entry.descriptor.source_url.clone());
        Ok((entry.factory)(ProviderSettings { http, source_url }))
    }
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("keys", &self.keys())
            .finish()
    }
}
