//! Local cache reconciliation for fetched remote entities.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::Result;
use serde_json::Value;
use tracing::info;

use crate::store::{DocumentStore, WriteOp};
use crate::sync::batch::BatchWriter;

#[derive(Debug, Default, Clone, Copy, serde::Serialize)]
pub struct CacheSummary {
    pub upserted: usize,
    pub deleted: usize,
}

pub struct CacheReconciler {
    store: Arc<dyn DocumentStore>,
    collection: &'static str,
}

impl CacheReconciler {
    pub fn new(store: Arc<dyn DocumentStore>, collection: &'static str) -> Self {
        Self { store, collection }
    }

    /// Upsert every fetched item (full document replace, keyed by numeric
    /// id). On a full sync, additionally delete cache entries whose id is
    /// absent from the fetched set: a full fetch saw the whole remote
    /// collection, so omission means the entity is gone. A delta fetch
    /// carries no such information, so delta runs never delete.
    pub async fn reconcile(
        &self,
        items: &[(String, Value)],
        is_full_sync: bool,
        batch: &mut BatchWriter,
    ) -> Result<CacheSummary> {
        let mut summary = CacheSummary::default();

        if is_full_sync {
            let fresh: HashSet<&str> = items.iter().map(|(id, _)| id.as_str()).collect();
            for existing in self.store.list_ids(self.collection).await? {
                if !fresh.contains(existing.as_str()) {
                    batch
                        .stage(WriteOp::delete(self.collection, existing))
                        .await?;
                    summary.deleted += 1;
                }
            }
        }

        for (id, doc) in items {
            batch
                .stage(WriteOp::put(self.collection, id.clone(), doc.clone()))
                .await?;
            summary.upserted += 1;
        }

        info!(
            collection = self.collection,
            upserted = summary.upserted,
            deleted = summary.deleted,
            full = is_full_sync,
            "cache reconciled"
        );
        Ok(summary)
    }
}
