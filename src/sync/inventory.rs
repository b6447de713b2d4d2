//! Merge cached remote variant snapshots into the authoritative inventory.
//!
//! Inventory is matched by SKU (a business key; the document id is separate)
//! and is never deleted by sync: local inventory may contain items that were
//! never sourced from the remote platform, so absence from the remote cache
//! carries no meaning here.

use std::sync::Arc;

use anyhow::{anyhow, Result};
use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use tracing::{debug, info};

use crate::models::{map_remote_status, InventoryItem, VariantSnapshot};
use crate::store::{collections, DocumentStore, WriteOp};
use crate::sync::batch::BatchWriter;

#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InventorySummary {
    pub added: usize,
    pub updated: usize,
    pub skipped: usize,
    pub errors: Vec<String>,
    pub change_log: Vec<String>,
}

enum ItemAction {
    Added,
    Updated(Vec<String>),
    Skipped(&'static str),
}

/// Short lowercase token derived from type+title, cached on the item so list
/// views never recompute it.
fn derive_image_hint(product_type: Option<&str>, title: &str) -> Option<String> {
    let joined = match product_type {
        Some(t) => format!("{t} {title}"),
        None => title.to_string(),
    };
    let token: String = joined
        .to_lowercase()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .take(16)
        .collect();
    (!token.is_empty()).then_some(token)
}

fn sorted(v: &[String]) -> Vec<&str> {
    let mut out: Vec<&str> = v.iter().map(String::as_str).collect();
    out.sort_unstable();
    out
}

fn norm(v: &Option<String>) -> Option<&str> {
    v.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

fn money_differs(a: f64, b: f64) -> bool {
    (a - b).abs() > 0.005
}

pub struct InventoryReconciler {
    store: Arc<dyn DocumentStore>,
}

impl InventoryReconciler {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    /// Best-effort reconciliation: per-item failures are collected in the
    /// summary and do not abort the loop. Only items with a real field-level
    /// change (beyond remote-id/marker bookkeeping) are staged.
    pub async fn reconcile(
        &self,
        snapshots: &[VariantSnapshot],
        batch: &mut BatchWriter,
    ) -> Result<InventorySummary> {
        let mut summary = InventorySummary::default();

        for snap in snapshots {
            match self.reconcile_one(snap, batch).await {
                Ok(ItemAction::Added) => {
                    summary.added += 1;
                    summary.change_log.push(format!(
                        "{}: created from remote variant {}",
                        snap.sku.as_deref().unwrap_or("?"),
                        snap.variant_id
                    ));
                }
                Ok(ItemAction::Updated(changes)) => {
                    summary.updated += 1;
                    summary.change_log.push(format!(
                        "{}: {}",
                        snap.sku.as_deref().unwrap_or("?"),
                        changes.join(", ")
                    ));
                }
                Ok(ItemAction::Skipped(reason)) => {
                    summary.skipped += 1;
                    debug!(variant = %snap.variant_id, reason, "variant skipped");
                    if reason == "no sku" {
                        summary
                            .change_log
                            .push(format!("skipped (no sku): {}", snap.variant_id));
                    }
                }
                Err(e) => summary
                    .errors
                    .push(format!("{}: {e:#}", snap.variant_id)),
            }
        }

        info!(
            added = summary.added,
            updated = summary.updated,
            skipped = summary.skipped,
            errors = summary.errors.len(),
            "inventory reconciled"
        );
        Ok(summary)
    }

    async fn reconcile_one(
        &self,
        snap: &VariantSnapshot,
        batch: &mut BatchWriter,
    ) -> Result<ItemAction> {
        let Some(sku) = norm(&snap.sku).map(str::to_string) else {
            return Ok(ItemAction::Skipped("no sku"));
        };

        let matches = self
            .store
            .find_eq(collections::INVENTORY, "sku", &json!(sku))
            .await?;

        let Some((doc_id, doc)) = matches.into_iter().next() else {
            let item = self.build_new_item(&sku, snap);
            let doc_id = crate::models::numeric_suffix(&snap.variant_id)
                .unwrap_or_else(|| sku.clone());
            batch
                .stage(WriteOp::put(collections::INVENTORY, doc_id, item.to_doc()))
                .await
                .map_err(|e| anyhow!("staging create failed: {e}"))?;
            return Ok(ItemAction::Added);
        };

        let mut item = InventoryItem::from_doc(doc)?;
        let mut changes: Vec<String> = Vec::new();

        // Remote is authoritative for catalog metadata.
        let status = map_remote_status(&snap.status).to_string();
        if item.status != status {
            changes.push(format!("status {} -> {}", item.status, status));
            item.status = status;
        }
        if item.title != snap.title && !snap.title.is_empty() {
            changes.push(format!("title \"{}\" -> \"{}\"", item.title, snap.title));
            item.title = snap.title.clone();
        }

        // Optional descriptive fields: add when remote gained one, replace
        // when it differs, clear when remote dropped it.
        Self::diff_opt(&mut item.description, &snap.description, "description", &mut changes);
        Self::diff_opt(&mut item.url, &snap.url, "url", &mut changes);
        Self::diff_opt(&mut item.variant_label, &snap.variant_label, "variant", &mut changes);
        Self::diff_opt(&mut item.vendor, &snap.vendor, "vendor", &mut changes);
        Self::diff_opt(&mut item.product_type, &snap.product_type, "type", &mut changes);

        if sorted(&item.tags) != sorted(&snap.tags) {
            changes.push(format!("tags ({} -> {})", item.tags.len(), snap.tags.len()));
            item.tags = snap.tags.clone();
        }
        if sorted(&item.images) != sorted(&snap.images) {
            changes.push(format!(
                "images ({} -> {})",
                item.images.len(),
                snap.images.len()
            ));
            item.images = snap.images.clone();
        }

        if snap.cost != item.cost
            && !matches!((item.cost, snap.cost), (Some(a), Some(b)) if !money_differs(a, b))
        {
            changes.push(format!("cost {:?} -> {:?}", item.cost, snap.cost));
            item.cost = snap.cost;
        }

        // Conflict window: a local edit newer than the remote's last-updated
        // marker keeps its price and quantity; otherwise remote wins. These
        // two fields are the ones operators hand-correct.
        let local_newer = item.updated_at > snap.remote_updated_at;
        if !local_newer {
            if money_differs(item.price, snap.price) {
                changes.push(format!("price {} -> {}", item.price, snap.price));
                item.price = snap.price;
            }
            if item.quantity != snap.quantity {
                changes.push(format!("quantity {} -> {}", item.quantity, snap.quantity));
                item.quantity = snap.quantity;
            }
        }

        if changes.is_empty() {
            return Ok(ItemAction::Skipped("no changes"));
        }

        if changes.iter().any(|c| c.starts_with("title") || c.starts_with("type"))
            || item.image_hint.is_none()
        {
            item.image_hint = derive_image_hint(item.product_type.as_deref(), &item.title);
        }

        // Bookkeeping, refreshed on every staged update.
        item.remote_product_id = Some(snap.product_id.clone());
        item.remote_variant_id = Some(snap.variant_id.clone());
        item.remote_updated_at = snap.remote_updated_at;
        item.updated_at = Some(Utc::now());

        batch
            .stage(WriteOp::put(collections::INVENTORY, doc_id, item.to_doc()))
            .await
            .map_err(|e| anyhow!("staging update failed: {e}"))?;
        Ok(ItemAction::Updated(changes))
    }

    fn build_new_item(&self, sku: &str, snap: &VariantSnapshot) -> InventoryItem {
        let now = Utc::now();
        InventoryItem {
            sku: sku.to_string(),
            title: snap.title.clone(),
            status: map_remote_status(&snap.status).to_string(),
            price: snap.price,
            cost: snap.cost,
            quantity: snap.quantity,
            tags: snap.tags.clone(),
            images: snap.images.clone(),
            description: snap.description.clone(),
            url: snap.url.clone(),
            vendor: snap.vendor.clone(),
            product_type: snap.product_type.clone(),
            variant_label: snap.variant_label.clone(),
            image_hint: derive_image_hint(snap.product_type.as_deref(), &snap.title),
            remote_product_id: Some(snap.product_id.clone()),
            remote_variant_id: Some(snap.variant_id.clone()),
            remote_updated_at: snap.remote_updated_at,
            created_at: Some(now),
            updated_at: Some(now),
        }
    }

    fn diff_opt(
        local: &mut Option<String>,
        remote: &Option<String>,
        label: &str,
        changes: &mut Vec<String>,
    ) {
        match (norm(local), norm(remote)) {
            (a, b) if a == b => {}
            (_, Some(fresh)) => {
                changes.push(format!("{label} updated"));
                *local = Some(fresh.to_string());
            }
            (Some(_), None) => {
                changes.push(format!("{label} cleared"));
                *local = None;
            }
            (None, None) => {}
        }
    }
}
