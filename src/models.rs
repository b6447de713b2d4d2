//! Document types for the authoritative collections plus extraction of the
//! remote payload shapes the engine consumes.
//!
//! Documents are written as full replacements, so field absence in a stored
//! document always means "cleared", never "left as-is"; `Option` fields are
//! omitted when `None`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::store::time::{instant_to_value, parse_instant};

/// Channel tag stamped on projected invoices and sales.
pub const REMOTE_CHANNEL: &str = "online-store";

/// Prefix added to invoice numbers projected from remote orders.
pub const REMOTE_INVOICE_PREFIX: &str = "SH-";

/// Numeric suffix of a remote global id, e.g. `gid://shop/Order/555` -> `555`.
pub fn numeric_suffix(gid: &str) -> Option<String> {
    let tail = gid.rsplit('/').next()?;
    if !tail.is_empty() && tail.chars().all(|c| c.is_ascii_digit()) {
        Some(tail.to_string())
    } else {
        None
    }
}

/// Money values arrive as numbers, decimal strings, or `{amount: ...}` shop
/// money objects.
pub fn as_money(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        Value::Object(map) => map.get("amount").and_then(as_money),
        _ => None,
    }
}

/// Remote product lifecycle state mapped to the local status vocabulary.
pub fn map_remote_status(raw: &str) -> &'static str {
    match raw.to_ascii_uppercase().as_str() {
        "ACTIVE" => "Active",
        "ARCHIVED" => "Archived",
        _ => "Draft",
    }
}

/// Rewrite the named top-level timestamp fields of `doc` into canonical
/// RFC3339 form so the typed structs below can deserialize them. Fields that
/// are absent or unparseable are removed rather than left in a foreign shape.
pub fn normalize_timestamps(doc: &mut Value, fields: &[&str]) {
    let Some(map) = doc.as_object_mut() else {
        return;
    };
    for field in fields {
        if let Some(raw) = map.get(*field) {
            match parse_instant(raw) {
                Some(dt) => {
                    map.insert((*field).to_string(), instant_to_value(dt));
                }
                None => {
                    map.remove(*field);
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Authoritative local documents
// ---------------------------------------------------------------------------

/// Authoritative inventory record, keyed by SKU.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InventoryItem {
    pub sku: String,
    pub title: String,
    pub status: String,
    pub price: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cost: Option<f64>,
    pub quantity: i64,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vendor: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub product_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variant_label: Option<String>,
    /// Short derived type+title token, cached so list views never recompute it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_hint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_product_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_variant_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_updated_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    /// Local last-edit instant; only consulted by the price/quantity
    /// conflict window.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl InventoryItem {
    pub fn from_doc(mut doc: Value) -> anyhow::Result<Self> {
        normalize_timestamps(
            &mut doc,
            &["remoteUpdatedAt", "createdAt", "updatedAt"],
        );
        Ok(serde_json::from_value(doc)?)
    }

    pub fn to_doc(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvoiceLine {
    pub item_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub item_sku: Option<String>,
    pub item_quantity: i64,
    pub item_price_per_unit: f64,
    pub line_item_total: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Invoice {
    pub invoice_number: String,
    /// Idempotency key: the remote order's global id.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_order_id: Option<String>,
    pub invoice_date: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub customer_id: Option<String>,
    pub customer_name: String,
    pub items: Vec<InvoiceLine>,
    pub subtotal: f64,
    pub tax_amount: f64,
    pub total_amount: f64,
    pub total_allocated_payment: f64,
    pub total_balance: f64,
    pub status: String,
    pub channel: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Flat per-line projection used by reporting views.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Sale {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub invoice_id: Option<String>,
    pub invoice_number: String,
    pub customer_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub customer_id: Option<String>,
    pub date: DateTime<Utc>,
    pub item_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sku: Option<String>,
    pub quantity: i64,
    pub line_amount: f64,
    pub allocated_payment: f64,
    pub balance: f64,
    pub channel: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Customer {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_customer_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Remote payload extraction
// ---------------------------------------------------------------------------

/// Denormalized snapshot of one remote product variant; this is the cache
/// document for the products feed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VariantSnapshot {
    pub variant_id: String,
    pub product_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sku: Option<String>,
    pub title: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vendor: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub product_type: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variant_label: Option<String>,
    pub price: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cost: Option<f64>,
    pub quantity: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_updated_at: Option<DateTime<Utc>>,
}

impl VariantSnapshot {
    pub fn from_cache_doc(mut doc: Value) -> anyhow::Result<Self> {
        normalize_timestamps(&mut doc, &["remoteUpdatedAt"]);
        Ok(serde_json::from_value(doc)?)
    }

    pub fn to_cache_doc(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

fn str_field(node: &Value, key: &str) -> Option<String> {
    node.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Nested connections arrive either as a plain array or as a GraphQL
/// `{edges: [{node}]}` connection; accept both.
fn connection_nodes(v: Option<&Value>) -> Vec<&Value> {
    let Some(v) = v else { return Vec::new() };
    if let Some(arr) = v.as_array() {
        return arr.iter().collect();
    }
    v.get("edges")
        .and_then(Value::as_array)
        .map(|edges| edges.iter().filter_map(|e| e.get("node")).collect())
        .unwrap_or_default()
}

/// Flatten one remote product node into per-variant cache snapshots, keyed by
/// the numeric suffix of the variant id.
pub fn flatten_product(node: &Value) -> Vec<(String, VariantSnapshot)> {
    let Some(product_id) = str_field(node, "id") else {
        return Vec::new();
    };
    let title = str_field(node, "title").unwrap_or_default();
    let status = str_field(node, "status").unwrap_or_default();
    let description = str_field(node, "descriptionHtml").or_else(|| str_field(node, "description"));
    let url = str_field(node, "onlineStoreUrl");
    let vendor = str_field(node, "vendor");
    let product_type = str_field(node, "productType");
    let remote_updated_at = node.get("updatedAt").and_then(parse_instant);

    let tags: Vec<String> = node
        .get("tags")
        .and_then(Value::as_array)
        .map(|arr| {
            arr.iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    let images: Vec<String> = connection_nodes(node.get("images"))
        .into_iter()
        .filter_map(|img| {
            str_field(img, "url")
                .or_else(|| str_field(img, "src"))
                .filter(|u| u.starts_with("http"))
        })
        .collect();

    let mut out = Vec::new();
    for variant in connection_nodes(node.get("variants")) {
        let Some(variant_id) = str_field(variant, "id") else {
            continue;
        };
        let Some(key) = numeric_suffix(&variant_id) else {
            continue;
        };

        let variant_label = variant
            .get("selectedOptions")
            .and_then(Value::as_array)
            .map(|opts| {
                opts.iter()
                    .filter_map(|o| str_field(o, "value"))
                    .filter(|v| !v.eq_ignore_ascii_case("default title"))
                    .collect::<Vec<_>>()
                    .join(" / ")
            })
            .filter(|s| !s.is_empty());

        let cost = variant
            .get("unitCost")
            .and_then(as_money)
            .or_else(|| variant.get("inventoryItem").and_then(|i| i.get("unitCost")).and_then(as_money));

        out.push((
            key,
            VariantSnapshot {
                variant_id,
                product_id: product_id.clone(),
                sku: str_field(variant, "sku"),
                title: title.clone(),
                status: status.clone(),
                description: description.clone(),
                url: url.clone(),
                vendor: vendor.clone(),
                product_type: product_type.clone(),
                tags: tags.clone(),
                images: images.clone(),
                variant_label,
                price: variant.get("price").and_then(as_money).unwrap_or(0.0),
                cost,
                quantity: variant
                    .get("inventoryQuantity")
                    .and_then(Value::as_i64)
                    .unwrap_or(0),
                remote_updated_at,
            },
        ));
    }
    out
}

/// One remote order as consumed by the invoice projector.
#[derive(Debug, Clone)]
pub struct RemoteOrder {
    pub id: String,
    pub name: String,
    pub email: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub customer: Option<RemoteCustomer>,
    pub line_items: Vec<RemoteLine>,
}

#[derive(Debug, Clone)]
pub struct RemoteCustomer {
    pub id: String,
    pub display_name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RemoteLine {
    pub title: String,
    pub sku: Option<String>,
    pub quantity: i64,
    pub discounted_total: f64,
}

impl RemoteOrder {
    pub fn from_node(node: &Value) -> Option<Self> {
        let id = str_field(node, "id")?;
        let name = str_field(node, "name").unwrap_or_else(|| id.clone());

        let customer = node.get("customer").filter(|c| c.is_object()).and_then(|c| {
            Some(RemoteCustomer {
                id: str_field(c, "id")?,
                display_name: str_field(c, "displayName"),
                email: str_field(c, "email"),
                phone: str_field(c, "phone"),
            })
        });

        let line_items = connection_nodes(node.get("lineItems"))
            .into_iter()
            .filter_map(|li| {
                Some(RemoteLine {
                    title: str_field(li, "title")?,
                    sku: str_field(li, "sku"),
                    quantity: li.get("quantity").and_then(Value::as_i64).unwrap_or(0),
                    discounted_total: li
                        .get("discountedTotalSet")
                        .and_then(|s| s.get("shopMoney"))
                        .and_then(as_money)
                        .or_else(|| li.get("discountedTotal").and_then(as_money))
                        .unwrap_or(0.0),
                })
            })
            .collect();

        Some(Self {
            id,
            name,
            email: str_field(node, "email"),
            created_at: node.get("createdAt").and_then(parse_instant),
            customer,
            line_items,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn numeric_suffix_extracts_trailing_id() {
        assert_eq!(
            numeric_suffix("gid://shop/Order/555"),
            Some("555".to_string())
        );
        assert_eq!(numeric_suffix("gid://shop/Order/abc"), None);
        assert_eq!(numeric_suffix(""), None);
    }

    #[test]
    fn money_accepts_numbers_strings_and_objects() {
        assert_eq!(as_money(&json!(12.5)), Some(12.5));
        assert_eq!(as_money(&json!("40.00")), Some(40.0));
        assert_eq!(as_money(&json!({"amount": "9.99", "currencyCode": "USD"})), Some(9.99));
        assert_eq!(as_money(&json!(null)), None);
    }

    #[test]
    fn status_mapping_defaults_to_draft() {
        assert_eq!(map_remote_status("ACTIVE"), "Active");
        assert_eq!(map_remote_status("archived"), "Archived");
        assert_eq!(map_remote_status("DRAFT"), "Draft");
        assert_eq!(map_remote_status("anything-else"), "Draft");
    }

    #[test]
    fn flattens_product_into_variant_snapshots() {
        let node = json!({
            "id": "gid://shop/Product/77",
            "title": "Tea Pot",
            "status": "ACTIVE",
            "vendor": "Acme",
            "productType": "Kitchen",
            "tags": ["ceramic", "sale"],
            "updatedAt": "2024-03-01T00:00:00Z",
            "images": {"edges": [{"node": {"url": "https://cdn/img1.png"}}]},
            "variants": {"edges": [
                {"node": {
                    "id": "gid://shop/ProductVariant/88",
                    "sku": "XYZ",
                    "price": "10.00",
                    "inventoryQuantity": 3,
                    "selectedOptions": [{"name": "Size", "value": "Large"}]
                }},
                {"node": {"id": "gid://shop/ProductVariant/89", "sku": "XYZ-2", "price": 12}}
            ]}
        });

        let snaps = flatten_product(&node);
        assert_eq!(snaps.len(), 2);
        let (key, snap) = &snaps[0];
        assert_eq!(key, "88");
        assert_eq!(snap.sku.as_deref(), Some("XYZ"));
        assert_eq!(snap.title, "Tea Pot");
        assert_eq!(snap.price, 10.0);
        assert_eq!(snap.quantity, 3);
        assert_eq!(snap.variant_label.as_deref(), Some("Large"));
        assert_eq!(snap.images, vec!["https://cdn/img1.png".to_string()]);
    }

    #[test]
    fn default_title_option_is_not_a_label() {
        let node = json!({
            "id": "gid://shop/Product/1",
            "title": "Single",
            "status": "ACTIVE",
            "variants": [{
                "id": "gid://shop/ProductVariant/2",
                "sku": "S",
                "price": "5.00",
                "selectedOptions": [{"name": "Title", "value": "Default Title"}]
            }]
        });
        let snaps = flatten_product(&node);
        assert_eq!(snaps[0].1.variant_label, None);
    }

    #[test]
    fn parses_order_with_connection_line_items() {
        let node = json!({
            "id": "gid://shop/Order/555",
            "name": "#1002",
            "email": "buyer@example.com",
            "createdAt": "2024-02-02T10:00:00Z",
            "lineItems": {"edges": [{"node": {
                "title": "Widget",
                "sku": "ABC",
                "quantity": 2,
                "discountedTotalSet": {"shopMoney": {"amount": "40.00"}}
            }}]}
        });

        let order = RemoteOrder::from_node(&node).unwrap();
        assert_eq!(order.name, "#1002");
        assert!(order.customer.is_none());
        assert_eq!(order.line_items.len(), 1);
        assert_eq!(order.line_items[0].discounted_total, 40.0);
    }

    #[test]
    fn inventory_doc_normalizes_foreign_timestamps() {
        let doc = json!({
            "sku": "ABC",
            "title": "Widget",
            "status": "Active",
            "price": 10.0,
            "quantity": 1,
            "updatedAt": {"_seconds": 1709296200, "_nanoseconds": 0}
        });
        let item = InventoryItem::from_doc(doc).unwrap();
        assert_eq!(item.updated_at.unwrap().timestamp(), 1709296200);
    }
}
