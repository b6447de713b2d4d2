//! HTTP client for the storefront admin GraphQL API.
//!
//! Endpoint shape: `POST https://{domain}/admin/api/{version}/graphql.json`
//! with the access token in a header. Responses use the standard connection
//! shape: `{edges: [{cursor, node}], pageInfo: {hasNextPage, endCursor}}`.

use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use tracing::debug;

use super::{Feed, PageRequest, QueryPage, RemoteQueryApi, RemoteRecord};
use crate::config::AppConfig;

fn truncate_for_log(mut s: String, max_len: usize) -> String {
    if s.len() > max_len {
        s.truncate(max_len);
        s.push_str("…");
    }
    s
}

const ORDERS_QUERY: &str = r#"
query Orders($first: Int!, $after: String, $query: String) {
  orders(first: $first, after: $after, query: $query, sortKey: UPDATED_AT) {
    edges {
      cursor
      node {
        id
        name
        email
        createdAt
        updatedAt
        displayFinancialStatus
        customer { id displayName email phone }
        lineItems(first: 50) {
          edges {
            node {
              title
              sku
              quantity
              discountedTotalSet { shopMoney { amount currencyCode } }
            }
          }
        }
      }
    }
    pageInfo { hasNextPage endCursor }
  }
}"#;

const PRODUCTS_QUERY: &str = r#"
query Products($first: Int!, $after: String, $query: String) {
  products(first: $first, after: $after, query: $query, sortKey: UPDATED_AT) {
    edges {
      cursor
      node {
        id
        title
        status
        vendor
        productType
        tags
        descriptionHtml
        onlineStoreUrl
        updatedAt
        images(first: 10) { edges { node { url } } }
        variants(first: 50) {
          edges {
            node {
              id
              sku
              price
              inventoryQuantity
              selectedOptions { name value }
              inventoryItem { unitCost { amount } }
            }
          }
        }
      }
    }
    pageInfo { hasNextPage endCursor }
  }
}"#;

#[derive(Debug, Clone)]
pub struct StorefrontClient {
    endpoint: String,
    access_token: String,
    http: Client,
}

impl StorefrontClient {
    pub fn new(cfg: &AppConfig) -> Result<Self> {
        let endpoint = format!(
            "https://{}/admin/api/{}/graphql.json",
            cfg.store_domain.trim_end_matches('/'),
            cfg.api_version
        );
        let http = Client::builder()
            .user_agent("ShopSync/1.0")
            .timeout(Duration::from_secs(cfg.http_timeout_secs))
            .build()?;

        Ok(Self {
            endpoint,
            access_token: cfg.access_token.clone(),
            http,
        })
    }

    fn parse_connection(feed: Feed, body: &Value) -> Result<QueryPage> {
        if let Some(errors) = body.get("errors").filter(|e| !e.is_null()) {
            return Err(anyhow!(
                "remote API reported errors for {}: {}",
                feed.as_str(),
                truncate_for_log(errors.to_string(), 2000)
            ));
        }

        let connection = body
            .get("data")
            .and_then(|d| d.get(feed.as_str()))
            .ok_or_else(|| {
                anyhow!(
                    "unexpected {} response shape (missing data.{})",
                    feed.as_str(),
                    feed.as_str()
                )
            })?;

        let mut records = Vec::new();
        if let Some(edges) = connection.get("edges").and_then(Value::as_array) {
            for edge in edges {
                let Some(node) = edge.get("node") else { continue };
                let Some(id) = node.get("id").and_then(Value::as_str) else {
                    continue;
                };
                records.push(RemoteRecord {
                    id: id.to_string(),
                    node: node.clone(),
                });
            }
        }

        let page_info = connection.get("pageInfo").unwrap_or(&Value::Null);
        Ok(QueryPage {
            records,
            end_cursor: page_info
                .get("endCursor")
                .and_then(Value::as_str)
                .map(str::to_string),
            has_next_page: page_info
                .get("hasNextPage")
                .and_then(Value::as_bool)
                .unwrap_or(false),
        })
    }
}

#[async_trait]
impl RemoteQueryApi for StorefrontClient {
    async fn query_page(&self, feed: Feed, request: PageRequest) -> Result<QueryPage> {
        let query = match feed {
            Feed::Orders => ORDERS_QUERY,
            Feed::Products => PRODUCTS_QUERY,
        };
        let payload = json!({
            "query": query,
            "variables": {
                "first": request.page_size,
                "after": request.cursor,
                "query": request.filter,
            }
        });

        debug!(
            feed = feed.as_str(),
            page_size = request.page_size,
            cursor = request.cursor.as_deref().unwrap_or("<start>"),
            "remote page request"
        );

        let resp = self
            .http
            .post(&self.endpoint)
            .header("X-Access-Token", &self.access_token)
            .header("Accept", "application/json")
            .json(&payload)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = truncate_for_log(resp.text().await.unwrap_or_default(), 2000);
            return Err(anyhow!(
                "{} page fetch failed: {status} body={body}",
                feed.as_str()
            ));
        }

        let body: Value = resp.json().await?;
        Self::parse_connection(feed, &body)
    }
}
