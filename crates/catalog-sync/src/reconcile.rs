//! Insert-or-update of normalized products keyed by external id.

use std::collections::HashSet;

use catalog_core::{NormalizedProduct, ProductUpsert, SyncSummary};
use catalog_storage::{ProductStore, StorageError};
use tracing::debug;

/// Stateless apart from the owner assigned to newly created rows.
#[derive(Debug, Clone, Copy)]
pub struct Reconciler {
    owner_id: i64,
}

impl Reconciler {
    pub fn new(owner_id: i64) -> Self {
        Self { owner_id }
    }

    /// Classifies each record against the store, then commits the whole batch at once.
    /// A failed commit leaves the store untouched and reports no counts.
    pub async fn reconcile(
        &self,
        store: &dyn ProductStore,
        batch: &[NormalizedProduct],
    ) -> Result<SyncSummary, StorageError> {
        if batch.is_empty() {
            return Ok(SyncSummary::default());
        }

        let mut seen = HashSet::with_capacity(batch.len());
        let mut writes = Vec::with_capacity(batch.len());
        let mut summary = SyncSummary {
            total_processed: batch.len(),
            ..SyncSummary::default()
        };

        for product in batch {
            let exists = seen.contains(&product.external_id)
                || store
                    .find_by_external_id(&product.external_id)
                    .await?
                    .is_some();
            if exists {
                summary.updated += 1;
            } else {
                summary.added += 1;
            }
            seen.insert(product.external_id.clone());
            writes.push(ProductUpsert::from_normalized(product, self.owner_id));
        }

        store.upsert_batch(writes).await?;
        debug!(
            added = summary.added,
            updated = summary.updated,
            total = summary.total_processed,
            "reconciled product batch"
        );
        Ok(summary)
    }
}
