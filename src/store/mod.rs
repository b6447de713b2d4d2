//! Document-store abstraction.
//!
//! The backing database is treated as a generic transactional document store:
//! named collections of JSON documents keyed by string id. The engine only
//! ever goes through [`DocumentStore`], so tests (and any future backend) can
//! swap the implementation; the production backend is [`sqlite::SqliteStore`].

pub mod sqlite;
pub mod time;

use async_trait::async_trait;
use serde_json::Value;

/// Hard backend limit on operations per atomic commit. `commit` rejects
/// anything larger; batching below this is the caller's job (see
/// `sync::batch::BatchWriter`, which keeps a safety margin).
pub const MAX_COMMIT_OPS: usize = 500;

/// Collection names used by the engine.
pub mod collections {
    pub const INVENTORY: &str = "inventory";
    pub const INVOICES: &str = "invoices";
    pub const SALES: &str = "sales";
    pub const CUSTOMERS: &str = "customers";
    pub const COUNTERS: &str = "counters";
    pub const SYNC_STATE: &str = "sync_state";
    pub const ORDER_CACHE: &str = "order_cache";
    pub const PRODUCT_CACHE: &str = "product_cache";
}

/// A single write operation against the store.
#[derive(Debug, Clone)]
pub enum WriteOp {
    /// Create-or-replace the document at `collection/id`.
    Put {
        collection: &'static str,
        id: String,
        doc: Value,
    },
    /// Delete the document at `collection/id`; deleting a missing document
    /// is a no-op.
    Delete {
        collection: &'static str,
        id: String,
    },
}

impl WriteOp {
    pub fn put(collection: &'static str, id: impl Into<String>, doc: Value) -> Self {
        WriteOp::Put {
            collection,
            id: id.into(),
            doc,
        }
    }

    pub fn delete(collection: &'static str, id: impl Into<String>) -> Self {
        WriteOp::Delete {
            collection,
            id: id.into(),
        }
    }
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Fetch one document by id.
    async fn get(&self, collection: &str, id: &str) -> anyhow::Result<Option<Value>>;

    /// Create-or-replace one document outside of any batch.
    async fn put(&self, collection: &'static str, id: &str, doc: Value) -> anyhow::Result<()>;

    /// All document ids in a collection.
    async fn list_ids(&self, collection: &str) -> anyhow::Result<Vec<String>>;

    /// Documents whose top-level `field` equals `value`, as (id, doc) pairs.
    async fn find_eq(
        &self,
        collection: &str,
        field: &str,
        value: &Value,
    ) -> anyhow::Result<Vec<(String, Value)>>;

    /// Commit a group of writes atomically. Errors if the group exceeds
    /// [`MAX_COMMIT_OPS`]; either every operation applies or none do.
    async fn commit(&self, ops: Vec<WriteOp>) -> anyhow::Result<()>;

    /// Atomic read-increment-write on the counter document `collection/id`
    /// (field `value`). A missing counter initializes to 1. Returns the
    /// post-increment value.
    async fn fetch_and_increment(&self, collection: &str, id: &str) -> anyhow::Result<i64>;
}
