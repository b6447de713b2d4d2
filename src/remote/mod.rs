//! Remote storefront query API: the paginated, cursor-based endpoint the
//! fetcher walks. The trait exists so sync logic can run against an
//! in-memory double in tests; the production implementation is
//! [`client::StorefrontClient`].

pub mod client;

use async_trait::async_trait;
use serde_json::Value;

/// Which remote feed a sync run targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Feed {
    Orders,
    Products,
}

impl Feed {
    pub fn as_str(&self) -> &'static str {
        match self {
            Feed::Orders => "orders",
            Feed::Products => "products",
        }
    }
}

/// One page request against the remote query API.
#[derive(Debug, Clone, Default)]
pub struct PageRequest {
    pub page_size: u32,
    pub cursor: Option<String>,
    /// Server-side search filter, e.g. `updated_at:>'2024-03-01T00:00:00Z'`.
    pub filter: Option<String>,
}

/// One fetched record: the remote global id plus the raw node payload.
#[derive(Debug, Clone)]
pub struct RemoteRecord {
    pub id: String,
    pub node: Value,
}

/// One page of results.
#[derive(Debug, Clone, Default)]
pub struct QueryPage {
    pub records: Vec<RemoteRecord>,
    pub end_cursor: Option<String>,
    pub has_next_page: bool,
}

#[async_trait]
pub trait RemoteQueryApi: Send + Sync {
    /// Fetch one page of the given feed, sorted by last-updated ascending.
    /// Cursors are only meaningful relative to the immediately preceding
    /// page, so callers must walk pages sequentially.
    async fn query_page(&self, feed: Feed, request: PageRequest) -> anyhow::Result<QueryPage>;
}
