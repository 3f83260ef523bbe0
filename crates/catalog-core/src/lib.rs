//! Core domain model for the product catalog and its sync pipeline.

use std::fmt;
use std::hash::{Hash, Hasher};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "catalog-core";

pub const DEFAULT_PAGE_SIZE: u32 = 20;
pub const MAX_PAGE_SIZE: u32 = 100;

/// Raw provider payload for a single product. Lives only inside a fetch call.
pub type ExternalRecord = serde_json::Map<String, serde_json::Value>;

/// Identifier a product carries in its upstream source.
///
/// Stored as text. Equality and hashing go through [`ExternalId::storage_key`],
/// so `Int(7)` and `Text("7")` name the same product.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ExternalId {
    Int(i64),
    Text(String),
}

impl ExternalId {
    pub fn storage_key(&self) -> String {
        match self {
            ExternalId::Int(v) => v.to_string(),
            ExternalId::Text(v) => v.clone(),
        }
    }

    pub fn from_storage_key(key: &str) -> Self {
        match key.parse::<i64>() {
            Ok(v) if v.to_string() == key => ExternalId::Int(v),
            _ => ExternalId::Text(key.to_string()),
        }
    }
}

impl PartialEq for ExternalId {
    fn eq(&self, other: &Self) -> bool {
        self.storage_key() == other.storage_key()
    }
}

impl Eq for ExternalId {}

impl Hash for ExternalId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.storage_key().hash(state);
    }
}

impl fmt::Display for ExternalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExternalId::Int(v) => write!(f, "{v}"),
            ExternalId::Text(v) => f.write_str(v),
        }
    }
}

impl From<i64> for ExternalId {
    fn from(value: i64) -> Self {
        ExternalId::Int(value)
    }
}

impl From<&str> for ExternalId {
    fn from(value: &str) -> Self {
        ExternalId::Text(value.to_string())
    }
}

/// Provider-independent product shape handed from normalization to reconciliation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedProduct {
    pub external_id: ExternalId,
    pub title: String,
    pub price: f64,
    pub description: Option<String>,
    pub height: Option<f64>,
    pub length: Option<f64>,
    pub depth: Option<f64>,
    /// Name of the provider the record came from.
    pub source: String,
}

/// Durable catalog entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedProduct {
    pub id: i64,
    pub external_id: Option<ExternalId>,
    pub title: String,
    pub price: f64,
    pub description: Option<String>,
    pub height: Option<f64>,
    pub length: Option<f64>,
    pub depth: Option<f64>,
    pub owner_id: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PersistedProduct {
    /// True when applying `upsert` would leave every catalog field unchanged.
    pub fn matches(&self, upsert: &ProductUpsert) -> bool {
        self.title == upsert.title
            && self.price == upsert.price
            && self.description == upsert.description
            && self.height == upsert.height
            && self.length == upsert.length
            && self.depth == upsert.depth
    }
}

/// Insert-or-update request keyed by external id.
///
/// `owner_id` is only applied when the row is created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductUpsert {
    pub external_id: ExternalId,
    pub title: String,
    pub price: f64,
    pub description: Option<String>,
    pub height: Option<f64>,
    pub length: Option<f64>,
    pub depth: Option<f64>,
    pub owner_id: i64,
}

impl ProductUpsert {
    pub fn from_normalized(product: &NormalizedProduct, owner_id: i64) -> Self {
        Self {
            external_id: product.external_id.clone(),
            title: product.title.clone(),
            price: product.price,
            description: product.description.clone(),
            height: product.height,
            length: product.length,
            depth: product.depth,
            owner_id,
        }
    }
}

/// Outcome counters for one reconciliation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncSummary {
    pub added: usize,
    pub updated: usize,
    pub total_processed: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRequest {
    pub page: u32,
    pub page_size: u32,
}

impl Default for PageRequest {
    fn default() -> Self {
        Self {
            page: 1,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

impl PageRequest {
    /// Builds a request from optional query values, clamping into the accepted range.
    pub fn clamped(page: Option<u32>, page_size: Option<u32>) -> Self {
        Self {
            page: page.unwrap_or(1).max(1),
            page_size: page_size.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE),
        }
    }

    pub fn offset(&self) -> u64 {
        u64::from(self.page.saturating_sub(1)) * u64::from(self.page_size)
    }

    pub fn limit(&self) -> u64 {
        u64::from(self.page_size)
    }

    pub fn total_pages(&self, total: u64) -> u64 {
        total.div_ceil(u64::from(self.page_size.max(1)))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductPage {
    pub products: Vec<PersistedProduct>,
    pub total: u64,
    pub page: u32,
    pub page_size: u32,
    pub total_pages: u64,
}
