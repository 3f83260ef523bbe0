//! Product persistence + outbound HTTP fetch utilities for the catalog.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use catalog_core::{ExternalId, PageRequest, PersistedProduct, ProductPage, ProductUpsert};
use chrono::Utc;
use reqwest::StatusCode;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use thiserror::Error;
use tokio::sync::{RwLock, Semaphore};
use tracing::{debug, info_span, Instrument};

pub const CRATE_NAME: &str = "catalog-storage";

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            global_concurrency: 16,
        }
    }
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

impl FetchError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, FetchError::Request(err) if err.is_timeout())
    }
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
        })
    }

    /// Single GET with the client timeout as the ceiling. Non-2xx statuses are errors.
    pub async fn fetch_bytes(&self, source: &str, url: &str) -> Result<FetchedResponse, FetchError> {
        // Never closed; a failed acquire proceeds unthrottled.
        let _permit = self.global_limit.acquire().await.ok();

        let span = info_span!("http_fetch", source, url);
        async {
            let resp = self.client.get(url).send().await?;
            let status = resp.status();
            let final_url = resp.url().to_string();

            if !status.is_success() {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: final_url,
                });
            }

            let body = resp.bytes().await?.to_vec();
            debug!(bytes = body.len(), "fetched response body");
            Ok(FetchedResponse {
                status,
                final_url,
                body,
            })
        }
        .instrument(span)
        .await
    }
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("write rejected: {0}")]
    Rejected(String),
}

/// Read/write seam consumed by the reconciler and the web layer.
#[async_trait]
pub trait ProductStore: Send + Sync {
    async fn find_by_external_id(
        &self,
        external_id: &ExternalId,
    ) -> Result<Option<PersistedProduct>, StorageError>;

    /// Applies every upsert in one transaction. Either all rows land or none do.
    async fn upsert_batch(&self, batch: Vec<ProductUpsert>) -> Result<(), StorageError>;

    async fn get_product(&self, id: i64) -> Result<Option<PersistedProduct>, StorageError>;

    async fn list_products(&self, page: &PageRequest) -> Result<ProductPage, StorageError>;
}

const PRODUCT_COLUMNS: &str = r#"
    id,
    external_id,
    title,
    price::float8 AS price,
    description,
    height::float8 AS height,
    length::float8 AS length,
    depth::float8 AS depth,
    owner_id,
    created_at,
    updated_at
"#;

#[derive(Debug, Clone)]
pub struct PgProductStore {
    pool: PgPool,
}

impl PgProductStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .connect(database_url)
            .await
            .context("connecting to postgres")?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StorageError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }
}

fn product_from_row(row: &PgRow) -> Result<PersistedProduct, sqlx::Error> {
    let external_id: Option<String> = row.try_get("external_id")?;
    Ok(PersistedProduct {
        id: row.try_get("id")?,
        external_id: external_id.as_deref().map(ExternalId::from_storage_key),
        title: row.try_get("title")?,
        price: row.try_get("price")?,
        description: row.try_get("description")?,
        height: row.try_get("height")?,
        length: row.try_get("length")?,
        depth: row.try_get("depth")?,
        owner_id: row.try_get("owner_id")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[async_trait]
impl ProductStore for PgProductStore {
    async fn find_by_external_id(
        &self,
        external_id: &ExternalId,
    ) -> Result<Option<PersistedProduct>, StorageError> {
        let sql = format!("SELECT {PRODUCT_COLUMNS} FROM products WHERE external_id = $1");
        let row = sqlx::query(&sql)
            .bind(external_id.storage_key())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(product_from_row).transpose()?)
    }

    async fn upsert_batch(&self, batch: Vec<ProductUpsert>) -> Result<(), StorageError> {
        if batch.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        for item in &batch {
            sqlx::query(
                r#"
                INSERT INTO products
                    (external_id, title, price, description, height, length, depth, owner_id)
                VALUES
                    ($1, $2, $3::float8::numeric(10,2), $4,
                     $5::float8::numeric(10,2), $6::float8::numeric(10,2), $7::float8::numeric(10,2),
                     $8)
                ON CONFLICT (external_id) DO UPDATE
                   SET title = EXCLUDED.title,
                       price = EXCLUDED.price,
                       description = EXCLUDED.description,
                       height = EXCLUDED.height,
                       length = EXCLUDED.length,
                       depth = EXCLUDED.depth,
                       updated_at = CASE
                           WHEN (products.title, products.price, products.description,
                                 products.height, products.length, products.depth)
                                IS DISTINCT FROM
                                (EXCLUDED.title, EXCLUDED.price, EXCLUDED.description,
                                 EXCLUDED.height, EXCLUDED.length, EXCLUDED.depth)
                           THEN NOW()
                           ELSE products.updated_at
                       END
                "#,
            )
            .bind(item.external_id.storage_key())
            .bind(&item.title)
            .bind(item.price)
            .bind(&item.description)
            .bind(item.height)
            .bind(item.length)
            .bind(item.depth)
            .bind(item.owner_id)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        debug!(rows = batch.len(), "committed product upsert batch");
        Ok(())
    }

    async fn get_product(&self, id: i64) -> Result<Option<PersistedProduct>, StorageError> {
        let sql = format!("SELECT {PRODUCT_COLUMNS} FROM products WHERE id = $1");
        let row = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await?;
        Ok(row.as_ref().map(product_from_row).transpose()?)
    }

    async fn list_products(&self, page: &PageRequest) -> Result<ProductPage, StorageError> {
        let total: i64 = sqlx::query("SELECT COUNT(*) AS total FROM products")
            .fetch_one(&self.pool)
            .await?
            .try_get("total")?;

        let sql = format!(
            "SELECT {PRODUCT_COLUMNS} FROM products ORDER BY id LIMIT $1 OFFSET $2"
        );
        let rows = sqlx::query(&sql)
            .bind(page.limit() as i64)
            .bind(page.offset() as i64)
            .fetch_all(&self.pool)
            .await?;

        let products = rows
            .iter()
            .map(product_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        let total = total.max(0) as u64;
        Ok(ProductPage {
            products,
            total,
            page: page.page,
            page_size: page.page_size,
            total_pages: page.total_pages(total),
        })
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    next_id: i64,
    rows: BTreeMap<i64, PersistedProduct>,
    by_external_id: HashMap<String, i64>,
}

/// Process-local store with the same all-or-nothing batch semantics as Postgres.
#[derive(Debug, Default)]
pub struct InMemoryProductStore {
    state: RwLock<MemoryState>,
}

impl InMemoryProductStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn snapshot(&self) -> Vec<PersistedProduct> {
        self.state.read().await.rows.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.rows.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

fn validate_upsert(item: &ProductUpsert) -> Result<(), StorageError> {
    if item.title.trim().is_empty() {
        return Err(StorageError::Rejected(format!(
            "product {} has an empty title",
            item.external_id
        )));
    }
    let amounts = [
        ("price", Some(item.price)),
        ("height", item.height),
        ("length", item.length),
        ("depth", item.depth),
    ];
    for (field, value) in amounts {
        if let Some(v) = value {
            if !v.is_finite() || v < 0.0 {
                return Err(StorageError::Rejected(format!(
                    "product {} has invalid {field}: {v}",
                    item.external_id
                )));
            }
        }
    }
    Ok(())
}

#[async_trait]
impl ProductStore for InMemoryProductStore {
    async fn find_by_external_id(
        &self,
        external_id: &ExternalId,
    ) -> Result<Option<PersistedProduct>, StorageError> {
        let state = self.state.read().await;
        Ok(state
            .by_external_id
            .get(&external_id.storage_key())
            .and_then(|id| state.rows.get(id))
            .cloned())
    }

    async fn upsert_batch(&self, batch: Vec<ProductUpsert>) -> Result<(), StorageError> {
        for item in &batch {
            validate_upsert(item)?;
        }

        let mut state = self.state.write().await;
        let now = Utc::now();
        for item in batch {
            let key = item.external_id.storage_key();
            if let Some(id) = state.by_external_id.get(&key).copied() {
                if let Some(row) = state.rows.get_mut(&id) {
                    if !row.matches(&item) {
                        row.title = item.title;
                        row.price = item.price;
                        row.description = item.description;
                        row.height = item.height;
                        row.length = item.length;
                        row.depth = item.depth;
                        row.updated_at = now;
                    }
                    continue;
                }
            }

            state.next_id += 1;
            let id = state.next_id;
            state.by_external_id.insert(key, id);
            state.rows.insert(
                id,
                PersistedProduct {
                    id,
                    external_id: Some(item.external_id),
                    title: item.title,
                    price: item.price,
                    description: item.description,
                    height: item.height,
                    length: item.length,
                    depth: item.depth,
                    owner_id: item.owner_id,
                    created_at: now,
                    updated_at: now,
                },
            );
        }
        Ok(())
    }

    async fn get_product(&self, id: i64) -> Result<Option<PersistedProduct>, StorageError> {
        Ok(self.state.read().await.rows.get(&id).cloned())
    }

    async fn list_products(&self, page: &PageRequest) -> Result<ProductPage, StorageError> {
        let state = self.state.read().await;
        let total = state.rows.len() as u64;
        let products = state
            .rows
            .values()
            .skip(page.offset() as usize)
            .take(page.limit() as usize)
            .cloned()
            .collect();
        Ok(ProductPage {
            products,
            total,
            page: page.page,
            page_size: page.page_size,
            total_pages: page.total_pages(total),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn upsert(external_id: i64, title: &str, price: f64) -> ProductUpsert {
        ProductUpsert {
            external_id: ExternalId::Int(external_id),
            title: title.to_string(),
            price,
            description: None,
            height: Some(1.0),
            length: Some(2.0),
            depth: Some(3.0),
            owner_id: 1,
        }
    }

    #[tokio::test]
    async fn memory_store_inserts_then_updates_by_external_id() {
        let store = InMemoryProductStore::new();
        store
            .upsert_batch(vec![upsert(1, "Phone", 10.0), upsert(2, "Laptop", 20.0)])
            .await
            .unwrap();
        assert_eq!(store.len().await, 2);

        store
            .upsert_batch(vec![upsert(1, "Phone Pro", 12.5)])
            .await
            .unwrap();
        let found = store
            .find_by_external_id(&ExternalId::Int(1))
            .await
            .unwrap()
            .expect("product 1");
        assert_eq!(found.title, "Phone Pro");
        assert_eq!(found.price, 12.5);
        assert_eq!(store.len().await, 2);
    }

    #[tokio::test]
    async fn memory_store_keeps_updated_at_when_nothing_changes() {
        let store = InMemoryProductStore::new();
        store.upsert_batch(vec![upsert(5, "Lamp", 3.0)]).await.unwrap();
        let before = store.snapshot().await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        store.upsert_batch(vec![upsert(5, "Lamp", 3.0)]).await.unwrap();
        assert_eq!(store.snapshot().await, before);
    }

    #[tokio::test]
    async fn memory_store_rejects_whole_batch_on_invalid_row() {
        let store = InMemoryProductStore::new();
        let err = store
            .upsert_batch(vec![upsert(1, "Ok", 1.0), upsert(2, "Broken", -4.0)])
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Rejected(_)));
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn memory_store_paginates_in_id_order() {
        let store = InMemoryProductStore::new();
        let batch = (1..=5).map(|i| upsert(i, &format!("P{i}"), 1.0)).collect();
        store.upsert_batch(batch).await.unwrap();

        let page = store
            .list_products(&PageRequest { page: 2, page_size: 2 })
            .await
            .unwrap();
        assert_eq!(page.total, 5);
        assert_eq!(page.total_pages, 3);
        let titles = page.products.iter().map(|p| p.title.as_str()).collect::<Vec<_>>();
        assert_eq!(titles, vec!["P3", "P4"]);
    }

    #[test]
    fn fetch_error_reports_status_and_url() {
        let err = FetchError::HttpStatus {
            status: 503,
            url: "https://example.test/products".into(),
        };
        assert_eq!(err.to_string(), "http status 503 for https://example.test/products");
        assert!(!err.is_timeout());
    }
}
