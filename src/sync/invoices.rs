//! Projection of remote orders into local invoices and sales.
//!
//! Each remote order becomes exactly one invoice plus one flat sale record
//! per line item; the remote order id is the idempotency key, so re-running
//! the projector over the same orders is a no-op after the first success.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::models::{
    numeric_suffix, Customer, Invoice, InvoiceLine, RemoteOrder, Sale, REMOTE_CHANNEL,
    REMOTE_INVOICE_PREFIX,
};
use crate::store::time::parse_instant;
use crate::store::{collections, DocumentStore, WriteOp};
use crate::sync::batch::BatchWriter;

const STATUS_PAID: &str = "Paid";

#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectionSummary {
    pub invoices_created: usize,
    pub sale_lines_created: usize,
    pub customers_created: usize,
    pub skipped: usize,
    pub details: Vec<String>,
    pub errors: Vec<String>,
}

pub struct OrderToInvoiceProjector {
    store: Arc<dyn DocumentStore>,
}

impl OrderToInvoiceProjector {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    /// Project a batch of fetched order nodes. Per-order failures land in
    /// `errors` without aborting the loop; a batch commit failure aborts.
    pub async fn project(
        &self,
        order_nodes: &[Value],
        batch: &mut BatchWriter,
    ) -> Result<ProjectionSummary> {
        let mut summary = ProjectionSummary::default();

        for node in order_nodes {
            let Some(order) = RemoteOrder::from_node(node) else {
                summary
                    .errors
                    .push("order node missing id; not projected".to_string());
                continue;
            };
            // Building the unit is per-order and best-effort; staging goes
            // through the batch writer and a commit failure halts the run.
            match self.build_unit(&order).await {
                Ok(Some(unit)) => {
                    let ops = unit.ops;
                    for op in ops {
                        batch.stage(op).await?;
                    }
                    summary.invoices_created += 1;
                    summary.sale_lines_created += unit.sale_lines;
                    if unit.created_customer {
                        summary.customers_created += 1;
                    }
                    summary
                        .details
                        .push(format!("projected {} ({} lines)", order.name, unit.sale_lines));
                }
                Ok(None) => {
                    summary.skipped += 1;
                    debug!(order = %order.id, "already projected; skipping");
                }
                Err(e) => summary.errors.push(format!("{}: {e:#}", order.id)),
            }
        }

        info!(
            invoices = summary.invoices_created,
            sale_lines = summary.sale_lines_created,
            skipped = summary.skipped,
            errors = summary.errors.len(),
            "orders projected"
        );
        Ok(summary)
    }

    /// Assemble the writes for one order, or `None` when the order was
    /// already projected.
    async fn build_unit(&self, order: &RemoteOrder) -> Result<Option<ProjectionUnit>> {
        let existing = self
            .store
            .find_eq(collections::INVOICES, "remoteOrderId", &json!(order.id))
            .await?;
        if !existing.is_empty() {
            return Ok(None);
        }

        let now = Utc::now();
        let invoice_doc_id = numeric_suffix(&order.id).unwrap_or_else(|| order.id.clone());

        // Customer: reuse a local record matched by remote customer id,
        // create one when the order carries a structured customer we have
        // never seen, otherwise fall back to a display-only label.
        let mut new_customer_op: Option<WriteOp> = None;
        let (customer_id, customer_name) = match &order.customer {
            Some(rc) => {
                let found = self
                    .store
                    .find_eq(collections::CUSTOMERS, "remoteCustomerId", &json!(rc.id))
                    .await?;
                if let Some((cid, cdoc)) = found.into_iter().next() {
                    let name = cdoc
                        .get("name")
                        .and_then(Value::as_str)
                        .unwrap_or("Customer")
                        .to_string();
                    (Some(cid), name)
                } else {
                    let cid = numeric_suffix(&rc.id).unwrap_or_else(|| rc.id.clone());
                    let name = rc
                        .display_name
                        .clone()
                        .or_else(|| rc.email.clone())
                        .unwrap_or_else(|| format!("Customer {cid}"));
                    let customer = Customer {
                        name: name.clone(),
                        email: rc.email.clone(),
                        phone: rc.phone.clone(),
                        remote_customer_id: Some(rc.id.clone()),
                        created_at: now,
                    };
                    new_customer_op = Some(WriteOp::put(
                        collections::CUSTOMERS,
                        cid.clone(),
                        serde_json::to_value(&customer)?,
                    ));
                    (Some(cid), name)
                }
            }
            None => (
                None,
                order
                    .email
                    .clone()
                    .unwrap_or_else(|| order.name.clone()),
            ),
        };

        let items: Vec<InvoiceLine> = order
            .line_items
            .iter()
            .map(|li| InvoiceLine {
                item_name: li.title.clone(),
                item_sku: li.sku.clone(),
                item_quantity: li.quantity,
                item_price_per_unit: if li.quantity > 0 {
                    li.discounted_total / li.quantity as f64
                } else {
                    li.discounted_total
                },
                line_item_total: li.discounted_total,
            })
            .collect();
        let subtotal: f64 = items.iter().map(|l| l.line_item_total).sum();

        // Orders surfaced by this feed are settled on the platform already.
        let invoice_date = order.created_at.unwrap_or(now);
        let invoice = Invoice {
            invoice_number: remote_invoice_number(order),
            remote_order_id: Some(order.id.clone()),
            invoice_date,
            customer_id: customer_id.clone(),
            customer_name: customer_name.clone(),
            items,
            subtotal,
            tax_amount: 0.0,
            total_amount: subtotal,
            total_allocated_payment: subtotal,
            total_balance: 0.0,
            status: STATUS_PAID.to_string(),
            channel: REMOTE_CHANNEL.to_string(),
            created_at: now,
            updated_at: now,
        };

        // One logical unit: customer first so the invoice can reference it,
        // then the invoice, then its sale lines.
        let created_customer = new_customer_op.is_some();
        let mut ops: Vec<WriteOp> = Vec::new();
        if let Some(op) = new_customer_op {
            ops.push(op);
        }
        ops.push(WriteOp::put(
            collections::INVOICES,
            invoice_doc_id.clone(),
            serde_json::to_value(&invoice)?,
        ));

        let mut lines = 0usize;
        for (idx, line) in invoice.items.iter().enumerate() {
            let sale = Sale {
                invoice_id: Some(invoice_doc_id.clone()),
                invoice_number: invoice.invoice_number.clone(),
                customer_name: customer_name.clone(),
                customer_id: customer_id.clone(),
                date: invoice_date,
                item_name: line.item_name.clone(),
                sku: line.item_sku.clone(),
                quantity: line.item_quantity,
                line_amount: line.line_item_total,
                allocated_payment: line.line_item_total,
                balance: 0.0,
                channel: REMOTE_CHANNEL.to_string(),
                created_at: now,
                updated_at: now,
            };
            ops.push(WriteOp::put(
                collections::SALES,
                format!("{invoice_doc_id}-{}", idx + 1),
                serde_json::to_value(&sale)?,
            ));
            lines += 1;
        }

        Ok(Some(ProjectionUnit {
            ops,
            sale_lines: lines,
            created_customer,
        }))
    }
}

/// The staged writes for one remote order.
struct ProjectionUnit {
    ops: Vec<WriteOp>,
    sale_lines: usize,
    created_customer: bool,
}

/// `"#1002"` becomes `"SH-1002"`: any leading symbol/ordinal prefix on the
/// remote display name is stripped and the source prefix added.
fn remote_invoice_number(order: &RemoteOrder) -> String {
    let stripped = order
        .name
        .trim_start_matches(|c: char| !c.is_ascii_alphanumeric());
    if stripped.is_empty() {
        format!(
            "{REMOTE_INVOICE_PREFIX}{}",
            numeric_suffix(&order.id).unwrap_or_else(|| order.id.clone())
        )
    } else {
        format!("{REMOTE_INVOICE_PREFIX}{stripped}")
    }
}

// ---------------------------------------------------------------------------
// One-time backfill of historical unlinked sales
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationSummary {
    pub groups: usize,
    pub invoices_created: usize,
    pub sales_linked: usize,
    pub details: Vec<String>,
    pub errors: Vec<String>,
}

/// Group pre-existing sales that never got an invoice link by their legacy
/// invoice-number field, then link each group to the invoice with that number
/// or synthesize one from the group. Linked sales are skipped on re-runs, so
/// the operation is idempotent.
pub async fn migrate_unlinked_sales(
    store: Arc<dyn DocumentStore>,
    batch: &mut BatchWriter,
) -> Result<MigrationSummary> {
    let mut summary = MigrationSummary::default();

    let mut groups: BTreeMap<String, Vec<(String, Value)>> = BTreeMap::new();
    for id in store.list_ids(collections::SALES).await? {
        let Some(doc) = store.get(collections::SALES, &id).await? else {
            continue;
        };
        let linked = doc
            .get("invoiceId")
            .map(|v| !v.is_null())
            .unwrap_or(false);
        if linked {
            continue;
        }
        let Some(number) = doc.get("invoiceNumber").and_then(Value::as_str) else {
            summary
                .errors
                .push(format!("sale {id}: unlinked and no invoice number"));
            continue;
        };
        groups.entry(number.to_string()).or_default().push((id, doc));
    }
    summary.groups = groups.len();

    for (number, sales) in groups {
        match link_group(&store, &number, &sales, batch).await {
            Ok(created) => {
                if created {
                    summary.invoices_created += 1;
                    summary
                        .details
                        .push(format!("{number}: synthesized invoice for {} sales", sales.len()));
                } else {
                    summary
                        .details
                        .push(format!("{number}: linked {} sales", sales.len()));
                }
                summary.sales_linked += sales.len();
            }
            Err(e) => summary.errors.push(format!("{number}: {e:#}")),
        }
    }

    info!(
        groups = summary.groups,
        invoices_created = summary.invoices_created,
        sales_linked = summary.sales_linked,
        "sale backfill staged"
    );
    Ok(summary)
}

/// Returns true when an invoice had to be synthesized for the group.
async fn link_group(
    store: &Arc<dyn DocumentStore>,
    number: &str,
    sales: &[(String, Value)],
    batch: &mut BatchWriter,
) -> Result<bool> {
    let existing = store
        .find_eq(collections::INVOICES, "invoiceNumber", &json!(number))
        .await?;

    let (invoice_id, created) = match existing.into_iter().next() {
        Some((id, _)) => (id, false),
        None => {
            let now = Utc::now();
            let first = &sales[0].1;
            let date = first
                .get("date")
                .and_then(parse_instant)
                .unwrap_or(now);
            let customer_name = first
                .get("customerName")
                .and_then(Value::as_str)
                .unwrap_or("Unknown")
                .to_string();
            let customer_id = first
                .get("customerId")
                .and_then(Value::as_str)
                .map(str::to_string);

            let items: Vec<InvoiceLine> = sales
                .iter()
                .map(|(_, doc)| {
                    let quantity = doc.get("quantity").and_then(Value::as_i64).unwrap_or(1);
                    let amount = doc
                        .get("lineAmount")
                        .and_then(crate::models::as_money)
                        .unwrap_or(0.0);
                    InvoiceLine {
                        item_name: doc
                            .get("itemName")
                            .and_then(Value::as_str)
                            .unwrap_or("Item")
                            .to_string(),
                        item_sku: doc.get("sku").and_then(Value::as_str).map(str::to_string),
                        item_quantity: quantity,
                        item_price_per_unit: if quantity > 0 {
                            amount / quantity as f64
                        } else {
                            amount
                        },
                        line_item_total: amount,
                    }
                })
                .collect();
            let subtotal: f64 = items.iter().map(|l| l.line_item_total).sum();

            let invoice = Invoice {
                invoice_number: number.to_string(),
                remote_order_id: None,
                invoice_date: date,
                customer_id,
                customer_name,
                items,
                subtotal,
                tax_amount: 0.0,
                total_amount: subtotal,
                total_allocated_payment: subtotal,
                total_balance: 0.0,
                status: STATUS_PAID.to_string(),
                channel: first
                    .get("channel")
                    .and_then(Value::as_str)
                    .unwrap_or("legacy")
                    .to_string(),
                created_at: now,
                updated_at: now,
            };

            let id = format!("legacy-{number}");
            batch
                .stage(WriteOp::put(
                    collections::INVOICES,
                    id.clone(),
                    serde_json::to_value(&invoice)?,
                ))
                .await?;
            (id, true)
        }
    };

    for (sale_id, doc) in sales {
        let mut doc = doc.clone();
        let map = doc
            .as_object_mut()
            .ok_or_else(|| anyhow!("sale {sale_id} is not an object"))?;
        map.insert("invoiceId".into(), json!(invoice_id));
        map.insert("updatedAt".into(), json!(Utc::now().to_rfc3339()));
        batch
            .stage(WriteOp::put(collections::SALES, sale_id.clone(), doc))
            .await?;
    }

    Ok(created)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::sqlite::SqliteStore;

    fn order_node() -> Value {
        json!({
            "id": "gid://shop/Order/555",
            "name": "#1002",
            "createdAt": "2024-02-02T10:00:00Z",
            "lineItems": [{
                "title": "Widget",
                "sku": "ABC",
                "quantity": 2,
                "discountedTotal": "40.00"
            }]
        })
    }

    async fn project_all(store: &Arc<SqliteStore>, nodes: &[Value]) -> ProjectionSummary {
        let projector = OrderToInvoiceProjector::new(store.clone());
        let mut batch = BatchWriter::new(store.clone());
        let summary = projector.project(nodes, &mut batch).await.unwrap();
        batch.flush().await.unwrap();
        summary
    }

    #[tokio::test]
    async fn projects_order_to_paid_invoice_and_sale() {
        let store = Arc::new(SqliteStore::in_memory().await.unwrap());
        let summary = project_all(&store, &[order_node()]).await;

        assert_eq!(summary.invoices_created, 1);
        assert_eq!(summary.sale_lines_created, 1);
        assert_eq!(summary.customers_created, 0);

        let invoice = store
            .get(collections::INVOICES, "555")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(invoice["invoiceNumber"], "SH-1002");
        assert_eq!(invoice["totalAmount"], 40.0);
        assert_eq!(invoice["totalBalance"], 0.0);
        assert_eq!(invoice["status"], "Paid");
        assert_eq!(invoice["items"][0]["itemPricePerUnit"], 20.0);
        // No structured customer on the order: display-only label, no record.
        assert!(invoice.get("customerId").is_none());

        let sale = store
            .get(collections::SALES, "555-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(sale["quantity"], 2);
        assert_eq!(sale["lineAmount"], 40.0);
        assert_eq!(sale["balance"], 0.0);
        assert_eq!(sale["channel"], REMOTE_CHANNEL);
    }

    #[tokio::test]
    async fn projection_is_idempotent_per_order_id() {
        let store = Arc::new(SqliteStore::in_memory().await.unwrap());
        let first = project_all(&store, &[order_node()]).await;
        assert_eq!(first.invoices_created, 1);

        let second = project_all(&store, &[order_node()]).await;
        assert_eq!(second.invoices_created, 0);
        assert_eq!(second.sale_lines_created, 0);
        assert_eq!(second.skipped, 1);

        let invoices = store
            .find_eq(
                collections::INVOICES,
                "remoteOrderId",
                &json!("gid://shop/Order/555"),
            )
            .await
            .unwrap();
        assert_eq!(invoices.len(), 1);
        assert_eq!(store.list_ids(collections::SALES).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn creates_customer_once_and_reuses_it() {
        let store = Arc::new(SqliteStore::in_memory().await.unwrap());
        let with_customer = |order: u64| {
            json!({
                "id": format!("gid://shop/Order/{order}"),
                "name": format!("#{order}"),
                "customer": {
                    "id": "gid://shop/Customer/9",
                    "displayName": "Ada Lovelace",
                    "email": "ada@example.com"
                },
                "lineItems": [{"title": "Widget", "quantity": 1, "discountedTotal": 5}]
            })
        };

        let first = project_all(&store, &[with_customer(600)]).await;
        assert_eq!(first.customers_created, 1);
        let second = project_all(&store, &[with_customer(601)]).await;
        assert_eq!(second.customers_created, 0);

        let customer = store
            .get(collections::CUSTOMERS, "9")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(customer["name"], "Ada Lovelace");

        let invoice = store
            .get(collections::INVOICES, "601")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(invoice["customerId"], "9");
        assert_eq!(invoice["customerName"], "Ada Lovelace");
    }

    #[tokio::test]
    async fn zero_quantity_line_uses_flat_amount() {
        let store = Arc::new(SqliteStore::in_memory().await.unwrap());
        let node = json!({
            "id": "gid://shop/Order/700",
            "name": "#1700",
            "lineItems": [{"title": "Fee", "quantity": 0, "discountedTotal": "12.50"}]
        });
        project_all(&store, &[node]).await;

        let invoice = store
            .get(collections::INVOICES, "700")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(invoice["items"][0]["itemPricePerUnit"], 12.5);
        assert_eq!(invoice["items"][0]["lineItemTotal"], 12.5);
    }

    #[tokio::test]
    async fn backfill_synthesizes_and_links_by_legacy_number() {
        let store = Arc::new(SqliteStore::in_memory().await.unwrap());
        for (id, number, amount) in [("s1", "I000007", 10.0), ("s2", "I000007", 15.0)] {
            store
                .put(
                    collections::SALES,
                    id,
                    json!({
                        "invoiceNumber": number,
                        "customerName": "Walk-in",
                        "date": "2023-06-01T00:00:00Z",
                        "itemName": "Old item",
                        "quantity": 1,
                        "lineAmount": amount,
                        "allocatedPayment": amount,
                        "balance": 0.0,
                        "channel": "pos"
                    }),
                )
                .await
                .unwrap();
        }

        let mut batch = BatchWriter::new(store.clone());
        let summary = migrate_unlinked_sales(store.clone(), &mut batch)
            .await
            .unwrap();
        batch.flush().await.unwrap();

        assert_eq!(summary.groups, 1);
        assert_eq!(summary.invoices_created, 1);
        assert_eq!(summary.sales_linked, 2);

        let invoice = store
            .get(collections::INVOICES, "legacy-I000007")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(invoice["subtotal"], 25.0);
        assert_eq!(invoice["taxAmount"], 0.0);
        assert_eq!(invoice["totalBalance"], 0.0);

        let s1 = store.get(collections::SALES, "s1").await.unwrap().unwrap();
        assert_eq!(s1["invoiceId"], "legacy-I000007");

        // Second pass finds nothing unlinked.
        let mut batch = BatchWriter::new(store.clone());
        let again = migrate_unlinked_sales(store.clone(), &mut batch)
            .await
            .unwrap();
        batch.flush().await.unwrap();
        assert_eq!(again.groups, 0);
        assert_eq!(again.invoices_created, 0);
    }

    #[tokio::test]
    async fn backfill_links_to_existing_invoice_without_creating() {
        let store = Arc::new(SqliteStore::in_memory().await.unwrap());
        store
            .put(
                collections::INVOICES,
                "inv-1",
                json!({"invoiceNumber": "I000042", "status": "Paid"}),
            )
            .await
            .unwrap();
        store
            .put(
                collections::SALES,
                "s9",
                json!({"invoiceNumber": "I000042", "itemName": "X", "quantity": 1, "lineAmount": 5.0}),
            )
            .await
            .unwrap();

        let mut batch = BatchWriter::new(store.clone());
        let summary = migrate_unlinked_sales(store.clone(), &mut batch)
            .await
            .unwrap();
        batch.flush().await.unwrap();

        assert_eq!(summary.invoices_created, 0);
        assert_eq!(summary.sales_linked, 1);
        let s9 = store.get(collections::SALES, "s9").await.unwrap().unwrap();
        assert_eq!(s9["invoiceId"], "inv-1");
    }
}
