//! Sync orchestration: one sequential pipeline per run.
//!
//! fetch all pages -> reconcile cache -> reconcile inventory (products) or
//! project invoices (orders). Entry points never return `Err` for run-level
//! problems; they fold everything into a structured report so callers can
//! render partial success with warnings.

pub mod batch;
pub mod cache;
pub mod fetch;
pub mod inventory;
pub mod invoices;
pub mod sequence;
pub mod state;

use std::sync::Arc;

use chrono::{Duration, Utc};
use serde::Serialize;
use serde_json::Value;
use tracing::{error, info, warn};

use crate::models::{flatten_product, VariantSnapshot};
use crate::remote::{Feed, RemoteQueryApi};
use crate::store::{collections, DocumentStore};

use batch::BatchWriter;
use cache::{CacheReconciler, CacheSummary};
use fetch::{determine_sync_type, FetchOptions, FetchOutcome, RemoteCatalogFetcher, SyncType};
use inventory::{InventoryReconciler, InventorySummary};
use invoices::{OrderToInvoiceProjector, ProjectionSummary};
use state::{SyncStatePatch, SyncStateStore};

/// A lease older than this is considered abandoned and overwritten.
const LEASE_WINDOW_MINUTES: i64 = 15;

#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductSyncReport {
    pub success: bool,
    pub sync_type: Option<SyncType>,
    pub fetched: usize,
    pub pages: u32,
    pub cache: CacheSummary,
    #[serde(flatten)]
    pub inventory: InventorySummary,
    pub committed_ops: usize,
    pub commits: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderSyncReport {
    pub success: bool,
    pub sync_type: Option<SyncType>,
    pub fetched: usize,
    pub pages: u32,
    pub cache: CacheSummary,
    #[serde(flatten)]
    pub projection: ProjectionSummary,
    pub committed_ops: usize,
    pub commits: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct SyncOptions {
    pub force_full: bool,
    pub page_size: u32,
    /// Overall fetch cap; zero means unlimited.
    pub limit: usize,
}

pub struct SyncEngine {
    store: Arc<dyn DocumentStore>,
    api: Arc<dyn RemoteQueryApi>,
    batch_ceiling: usize,
}

impl SyncEngine {
    pub fn new(store: Arc<dyn DocumentStore>, api: Arc<dyn RemoteQueryApi>) -> Self {
        Self {
            store,
            api,
            batch_ceiling: batch::DEFAULT_CEILING,
        }
    }

    pub fn with_batch_ceiling(mut self, ceiling: usize) -> Self {
        self.batch_ceiling = ceiling;
        self
    }

    fn states(&self) -> SyncStateStore {
        SyncStateStore::new(self.store.clone())
    }

    /// Read prior state, honor the advisory run lease, and mark the attempt.
    /// Returns the state as it was before this run touched it.
    async fn begin_run(
        &self,
        feed: Feed,
        force_full: bool,
    ) -> Result<(state::SyncState, SyncType), String> {
        let states = self.states();
        let prior = states.read(feed).await;

        if let Some(since) = prior.running_since {
            let age = Utc::now() - since;
            if age < Duration::minutes(LEASE_WINDOW_MINUTES) {
                return Err(format!(
                    "a {} sync has been running since {since}; refusing to start another",
                    feed.as_str()
                ));
            }
            warn!(
                feed = feed.as_str(),
                since = %since,
                "ignoring stale run lease"
            );
        }

        let sync_type = determine_sync_type(force_full, &prior);
        let now = Utc::now();
        if let Err(e) = states
            .write(
                feed,
                SyncStatePatch {
                    last_sync_attempt: Some(now),
                    running_since: Some(Some(now)),
                    ..Default::default()
                },
            )
            .await
        {
            return Err(format!("failed to record sync attempt: {e:#}"));
        }

        info!(
            feed = feed.as_str(),
            sync_type = sync_type.as_str(),
            "sync run started"
        );
        Ok((prior, sync_type))
    }

    /// Persist cursor/lease/full-completion state at run end (best effort).
    async fn finish_run(&self, feed: Feed, sync_type: SyncType, outcome: &FetchOutcome) {
        let mut patch = SyncStatePatch {
            cursor: Some(outcome.end_cursor.clone()),
            running_since: Some(None),
            ..Default::default()
        };
        // Only a cleanly completed full walk proves we saw the whole remote
        // collection.
        if sync_type == SyncType::Full && outcome.completed {
            patch.last_full_sync_completion = Some(Utc::now());
        }
        if let Err(e) = self.states().write(feed, patch).await {
            error!(feed = feed.as_str(), error = %e, "failed to persist sync state");
        }
    }

    pub async fn sync_products(&self, opts: &SyncOptions) -> ProductSyncReport {
        let mut report = ProductSyncReport::default();
        let (prior, sync_type) = match self.begin_run(Feed::Products, opts.force_full).await {
            Ok(v) => v,
            Err(e) => {
                report.error = Some(e);
                return report;
            }
        };
        report.sync_type = Some(sync_type);

        let fetcher = RemoteCatalogFetcher::new(self.api.clone());
        let outcome = fetcher
            .fetch(
                Feed::Products,
                sync_type,
                &prior,
                &FetchOptions {
                    page_size: opts.page_size,
                    limit: opts.limit,
                },
            )
            .await;
        report.fetched = outcome.records.len();
        report.pages = outcome.pages;

        // Flatten products into per-variant cache snapshots.
        let mut snapshots: Vec<(String, VariantSnapshot)> = Vec::new();
        for record in &outcome.records {
            snapshots.extend(flatten_product(&record.node));
        }
        let cache_items: Vec<(String, Value)> = snapshots
            .iter()
            .map(|(id, snap)| (id.clone(), snap.to_cache_doc()))
            .collect();

        let mut batch = BatchWriter::with_ceiling(self.store.clone(), self.batch_ceiling);
        let run = async {
            let reconciler = CacheReconciler::new(self.store.clone(), collections::PRODUCT_CACHE);
            // Tombstoning is only sound when the fetch saw the whole
            // collection.
            let full_membership = sync_type == SyncType::Full && outcome.completed;
            let cache = reconciler
                .reconcile(&cache_items, full_membership, &mut batch)
                .await?;

            let variants: Vec<VariantSnapshot> =
                snapshots.iter().map(|(_, s)| s.clone()).collect();
            let inventory = InventoryReconciler::new(self.store.clone())
                .reconcile(&variants, &mut batch)
                .await?;
            batch.flush().await?;
            anyhow::Ok((cache, inventory))
        };

        match run.await {
            Ok((cache, inventory)) => {
                report.cache = cache;
                report.inventory = inventory;
            }
            Err(e) => {
                error!(error = %e, "product sync aborted mid-run");
                report.error = Some(format!("{e:#}"));
            }
        }
        report.committed_ops = batch.committed_ops();
        report.commits = batch.commits();

        self.finish_run(Feed::Products, sync_type, &outcome).await;
        if report.error.is_none() {
            report.error = outcome.error;
        }
        report.success = report.error.is_none();
        report
    }

    pub async fn sync_orders(&self, opts: &SyncOptions) -> OrderSyncReport {
        let mut report = OrderSyncReport::default();
        let (prior, sync_type) = match self.begin_run(Feed::Orders, opts.force_full).await {
            Ok(v) => v,
            Err(e) => {
                report.error = Some(e);
                return report;
            }
        };
        report.sync_type = Some(sync_type);

        let fetcher = RemoteCatalogFetcher::new(self.api.clone());
        let outcome = fetcher
            .fetch(
                Feed::Orders,
                sync_type,
                &prior,
                &FetchOptions {
                    page_size: opts.page_size,
                    limit: opts.limit,
                },
            )
            .await;
        report.fetched = outcome.records.len();
        report.pages = outcome.pages;

        let cache_items: Vec<(String, Value)> = outcome
            .records
            .iter()
            .filter_map(|r| {
                crate::models::numeric_suffix(&r.id).map(|key| (key, r.node.clone()))
            })
            .collect();
        let order_nodes: Vec<Value> = outcome.records.iter().map(|r| r.node.clone()).collect();

        let mut batch = BatchWriter::with_ceiling(self.store.clone(), self.batch_ceiling);
        let run = async {
            let reconciler = CacheReconciler::new(self.store.clone(), collections::ORDER_CACHE);
            let full_membership = sync_type == SyncType::Full && outcome.completed;
            let cache = reconciler
                .reconcile(&cache_items, full_membership, &mut batch)
                .await?;

            let projection = OrderToInvoiceProjector::new(self.store.clone())
                .project(&order_nodes, &mut batch)
                .await?;
            batch.flush().await?;
            anyhow::Ok((cache, projection))
        };

        match run.await {
            Ok((cache, projection)) => {
                report.cache = cache;
                report.projection = projection;
            }
            Err(e) => {
                error!(error = %e, "order sync aborted mid-run");
                report.error = Some(format!("{e:#}"));
            }
        }
        report.committed_ops = batch.committed_ops();
        report.commits = batch.commits();

        self.finish_run(Feed::Orders, sync_type, &outcome).await;
        if report.error.is_none() {
            report.error = outcome.error;
        }
        report.success = report.error.is_none();
        report
    }

    /// Run the one-time sale backfill with the engine's batching discipline.
    pub async fn migrate_sales(&self) -> invoices::MigrationSummary {
        let mut batch = BatchWriter::with_ceiling(self.store.clone(), self.batch_ceiling);
        let result = async {
            let summary = invoices::migrate_unlinked_sales(self.store.clone(), &mut batch).await?;
            batch.flush().await?;
            anyhow::Ok(summary)
        }
        .await;
        match result {
            Ok(summary) => summary,
            Err(e) => {
                error!(error = %e, "sale backfill aborted");
                let mut summary = invoices::MigrationSummary::default();
                summary.errors.push(format!("{e:#}"));
                summary
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::{PageRequest, QueryPage, RemoteRecord};
    use crate::store::sqlite::SqliteStore;
    use anyhow::Result;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;

    struct FakeRemote {
        product_pages: Mutex<Vec<QueryPage>>,
        order_pages: Mutex<Vec<QueryPage>>,
    }

    impl FakeRemote {
        fn new(products: Vec<QueryPage>, orders: Vec<QueryPage>) -> Self {
            Self {
                product_pages: Mutex::new(products),
                order_pages: Mutex::new(orders),
            }
        }
    }

    #[async_trait]
    impl RemoteQueryApi for FakeRemote {
        async fn query_page(&self, feed: Feed, _request: PageRequest) -> Result<QueryPage> {
            let pages = match feed {
                Feed::Products => &self.product_pages,
                Feed::Orders => &self.order_pages,
            };
            let mut pages = pages.lock().unwrap();
            if pages.is_empty() {
                Ok(QueryPage::default())
            } else {
                Ok(pages.remove(0))
            }
        }
    }

    fn product_page(skus: &[(&str, u64)]) -> QueryPage {
        let records = skus
            .iter()
            .map(|(sku, id)| {
                let gid = format!("gid://shop/Product/{id}");
                RemoteRecord {
                    id: gid.clone(),
                    node: json!({
                        "id": gid,
                        "title": format!("Item {sku}"),
                        "status": "ACTIVE",
                        "updatedAt": "2024-03-01T00:00:00Z",
                        "variants": [{
                            "id": format!("gid://shop/ProductVariant/{}", id * 10),
                            "sku": sku,
                            "price": "10.00",
                            "inventoryQuantity": 4
                        }]
                    }),
                }
            })
            .collect();
        QueryPage {
            records,
            end_cursor: Some("end".into()),
            has_next_page: false,
        }
    }

    fn order_page(ids: &[u64]) -> QueryPage {
        let records = ids
            .iter()
            .map(|id| {
                let gid = format!("gid://shop/Order/{id}");
                RemoteRecord {
                    id: gid.clone(),
                    node: json!({
                        "id": gid,
                        "name": format!("#{}", 1000 + id),
                        "createdAt": "2024-02-02T10:00:00Z",
                        "lineItems": [{
                            "title": "Widget",
                            "sku": "ABC",
                            "quantity": 2,
                            "discountedTotal": "40.00"
                        }]
                    }),
                }
            })
            .collect();
        QueryPage {
            records,
            end_cursor: Some("end".into()),
            has_next_page: false,
        }
    }

    #[tokio::test]
    async fn product_pipeline_caches_and_builds_inventory() {
        let store = Arc::new(SqliteStore::in_memory().await.unwrap());
        let api = Arc::new(FakeRemote::new(
            vec![product_page(&[("XYZ", 7), ("QRS", 8)])],
            vec![],
        ));
        let engine = SyncEngine::new(store.clone(), api);

        let report = engine.sync_products(&SyncOptions::default()).await;
        assert!(report.success, "error: {:?}", report.error);
        assert_eq!(report.sync_type, Some(SyncType::Full));
        assert_eq!(report.fetched, 2);
        assert_eq!(report.cache.upserted, 2);
        assert_eq!(report.inventory.added, 2);

        // Variant snapshot cached under the variant's numeric id.
        assert!(store
            .get(collections::PRODUCT_CACHE, "70")
            .await
            .unwrap()
            .is_some());

        // A clean full walk records the completion timestamp and clears the
        // lease.
        let state = SyncStateStore::new(store.clone()).read(Feed::Products).await;
        assert!(state.last_full_sync_completion.is_some());
        assert!(state.running_since.is_none());
    }

    #[tokio::test]
    async fn second_product_run_is_delta_and_keeps_cache_members() {
        let store = Arc::new(SqliteStore::in_memory().await.unwrap());
        let api = Arc::new(FakeRemote::new(
            vec![
                product_page(&[("XYZ", 7), ("QRS", 8)]),
                product_page(&[("XYZ", 7)]),
            ],
            vec![],
        ));
        let engine = SyncEngine::new(store.clone(), api);

        let first = engine.sync_products(&SyncOptions::default()).await;
        assert_eq!(first.sync_type, Some(SyncType::Full));

        let second = engine.sync_products(&SyncOptions::default()).await;
        assert_eq!(second.sync_type, Some(SyncType::Delta));
        assert_eq!(second.cache.deleted, 0);
        // Both variants still cached after the delta.
        let ids = store.list_ids(collections::PRODUCT_CACHE).await.unwrap();
        assert_eq!(ids.len(), 2);
    }

    #[tokio::test]
    async fn forced_full_run_tombstones_stale_cache_entries() {
        let store = Arc::new(SqliteStore::in_memory().await.unwrap());
        let api = Arc::new(FakeRemote::new(
            vec![
                product_page(&[("XYZ", 7), ("QRS", 8)]),
                product_page(&[("XYZ", 7)]),
            ],
            vec![],
        ));
        let engine = SyncEngine::new(store.clone(), api);

        engine.sync_products(&SyncOptions::default()).await;
        let report = engine
            .sync_products(&SyncOptions {
                force_full: true,
                ..Default::default()
            })
            .await;
        assert_eq!(report.sync_type, Some(SyncType::Full));
        assert_eq!(report.cache.deleted, 1);
        let ids = store.list_ids(collections::PRODUCT_CACHE).await.unwrap();
        assert_eq!(ids, vec!["70".to_string()]);
    }

    #[tokio::test]
    async fn order_pipeline_projects_invoices_once() {
        let store = Arc::new(SqliteStore::in_memory().await.unwrap());
        let api = Arc::new(FakeRemote::new(
            vec![],
            vec![order_page(&[555]), order_page(&[555])],
        ));
        let engine = SyncEngine::new(store.clone(), api);

        let first = engine.sync_orders(&SyncOptions::default()).await;
        assert!(first.success);
        assert_eq!(first.projection.invoices_created, 1);
        assert_eq!(first.projection.sale_lines_created, 1);

        let second = engine
            .sync_orders(&SyncOptions {
                force_full: true,
                ..Default::default()
            })
            .await;
        assert_eq!(second.projection.invoices_created, 0);
        assert_eq!(second.projection.skipped, 1);

        let invoice = store
            .get(collections::INVOICES, "555")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(invoice["invoiceNumber"], "SH-1555");
    }

    #[tokio::test]
    async fn active_lease_refuses_second_run() {
        let store = Arc::new(SqliteStore::in_memory().await.unwrap());
        let states = SyncStateStore::new(store.clone());
        states
            .write(
                Feed::Orders,
                state::SyncStatePatch {
                    running_since: Some(Some(Utc::now())),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let api = Arc::new(FakeRemote::new(vec![], vec![order_page(&[1])]));
        let engine = SyncEngine::new(store, api);
        let report = engine.sync_orders(&SyncOptions::default()).await;
        assert!(!report.success);
        assert!(report.error.unwrap().contains("refusing to start"));
        assert_eq!(report.fetched, 0);
    }

    #[tokio::test]
    async fn stale_lease_is_ignored() {
        let store = Arc::new(SqliteStore::in_memory().await.unwrap());
        let states = SyncStateStore::new(store.clone());
        states
            .write(
                Feed::Orders,
                state::SyncStatePatch {
                    running_since: Some(Some(Utc::now() - Duration::hours(2))),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let api = Arc::new(FakeRemote::new(vec![], vec![order_page(&[2])]));
        let engine = SyncEngine::new(store, api);
        let report = engine.sync_orders(&SyncOptions::default()).await;
        assert!(report.success, "error: {:?}", report.error);
    }
}
