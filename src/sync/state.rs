//! Per-feed sync state: the only durable coordination point between runs.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::warn;

use crate::remote::Feed;
use crate::store::time::{instant_to_value, parse_instant};
use crate::store::{collections, DocumentStore};

/// Cursor and timestamp state for one feed. A feed with no stored state
/// deserializes to the default (everything unset), which forces a full sync.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncState {
    pub cursor: Option<String>,
    /// Instant the most recent run started; the next delta filter is built
    /// from this value as read *before* the run overwrites it.
    pub last_sync_attempt: Option<DateTime<Utc>>,
    /// Instant the most recent full run walked every page cleanly.
    pub last_full_sync_completion: Option<DateTime<Utc>>,
    /// Advisory run lease; see `SyncEngine`.
    pub running_since: Option<DateTime<Utc>>,
}

/// Partial update; only set fields are written, everything else is preserved.
/// The double `Option` distinguishes "leave alone" from "explicitly clear".
#[derive(Debug, Clone, Default)]
pub struct SyncStatePatch {
    pub cursor: Option<Option<String>>,
    pub last_sync_attempt: Option<DateTime<Utc>>,
    pub last_full_sync_completion: Option<DateTime<Utc>>,
    pub running_since: Option<Option<DateTime<Utc>>>,
}

#[derive(Clone)]
pub struct SyncStateStore {
    store: Arc<dyn DocumentStore>,
}

impl SyncStateStore {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    /// Read a feed's state. A read failure is treated as absent state (the
    /// run then falls back to a full sync) rather than aborting.
    pub async fn read(&self, feed: Feed) -> SyncState {
        let doc = match self.store.get(collections::SYNC_STATE, feed.as_str()).await {
            Ok(doc) => doc,
            Err(e) => {
                warn!(
                    feed = feed.as_str(),
                    error = %e,
                    "sync state read failed; treating as absent (will full-sync)"
                );
                None
            }
        };
        let Some(doc) = doc else {
            return SyncState::default();
        };

        SyncState {
            cursor: doc
                .get("cursor")
                .and_then(Value::as_str)
                .map(str::to_string),
            last_sync_attempt: doc.get("lastSyncAttemptTimestamp").and_then(parse_instant),
            last_full_sync_completion: doc
                .get("lastFullSyncCompletionTimestamp")
                .and_then(parse_instant),
            running_since: doc.get("runningSince").and_then(parse_instant),
        }
    }

    /// Merge `patch` into the stored state without clobbering unset fields.
    pub async fn write(&self, feed: Feed, patch: SyncStatePatch) -> anyhow::Result<()> {
        let current = self
            .store
            .get(collections::SYNC_STATE, feed.as_str())
            .await?
            .unwrap_or_else(|| Value::Object(Map::new()));
        let mut map = match current {
            Value::Object(map) => map,
            _ => Map::new(),
        };

        if let Some(cursor) = patch.cursor {
            match cursor {
                Some(c) => map.insert("cursor".into(), Value::String(c)),
                None => map.insert("cursor".into(), Value::Null),
            };
        }
        if let Some(at) = patch.last_sync_attempt {
            map.insert("lastSyncAttemptTimestamp".into(), instant_to_value(at));
        }
        if let Some(at) = patch.last_full_sync_completion {
            map.insert(
                "lastFullSyncCompletionTimestamp".into(),
                instant_to_value(at),
            );
        }
        if let Some(lease) = patch.running_since {
            match lease {
                Some(at) => map.insert("runningSince".into(), instant_to_value(at)),
                None => map.insert("runningSince".into(), Value::Null),
            };
        }

        self.store
            .put(collections::SYNC_STATE, feed.as_str(), Value::Object(map))
            .await
    }
}
