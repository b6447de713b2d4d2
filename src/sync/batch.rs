//! Bounded-batch write accumulator.
//!
//! The backend caps operations per atomic commit (`store::MAX_COMMIT_OPS`);
//! the writer commits full chunks at a configured ceiling kept strictly below
//! that cap, in staging order, and never re-commits an operation. A commit
//! failure propagates to the caller, which must stop staging for that run.

use std::sync::Arc;

use anyhow::Result;
use tracing::debug;

use crate::store::{DocumentStore, WriteOp, MAX_COMMIT_OPS};

/// Default chunk ceiling; leaves headroom below the backend's hard limit.
pub const DEFAULT_CEILING: usize = 450;

pub struct BatchWriter {
    store: Arc<dyn DocumentStore>,
    ceiling: usize,
    staged: Vec<WriteOp>,
    committed_ops: usize,
    commits: usize,
}

impl BatchWriter {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self::with_ceiling(store, DEFAULT_CEILING)
    }

    pub fn with_ceiling(store: Arc<dyn DocumentStore>, ceiling: usize) -> Self {
        Self {
            store,
            ceiling: ceiling.clamp(1, MAX_COMMIT_OPS - 1),
            staged: Vec::new(),
            committed_ops: 0,
            commits: 0,
        }
    }

    /// Stage one operation; commits the accumulated chunk when it reaches the
    /// ceiling. Operations reach the store in staging order.
    pub async fn stage(&mut self, op: WriteOp) -> Result<()> {
        self.staged.push(op);
        if self.staged.len() >= self.ceiling {
            self.commit_staged().await?;
        }
        Ok(())
    }

    /// Commit whatever remains staged. Call once at the end of a run.
    pub async fn flush(&mut self) -> Result<()> {
        if self.staged.is_empty() {
            return Ok(());
        }
        self.commit_staged().await
    }

    /// Operations committed so far (excludes anything still staged).
    pub fn committed_ops(&self) -> usize {
        self.committed_ops
    }

    /// Number of chunk commits performed.
    pub fn commits(&self) -> usize {
        self.commits
    }

    /// Operations staged but not yet committed.
    pub fn pending(&self) -> usize {
        self.staged.len()
    }

    async fn commit_staged(&mut self) -> Result<()> {
        let chunk = std::mem::take(&mut self.staged);
        let n = chunk.len();
        self.store.commit(chunk).await?;
        self.committed_ops += n;
        self.commits += 1;
        debug!(ops = n, total = self.committed_ops, "batch chunk committed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::{anyhow, bail};
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::sync::Mutex;

    /// Store double that records commit chunk contents and can be told to
    /// fail after a number of successful commits.
    struct RecordingStore {
        chunks: Mutex<Vec<Vec<String>>>,
        fail_after: Option<usize>,
    }

    impl RecordingStore {
        fn new(fail_after: Option<usize>) -> Self {
            Self {
                chunks: Mutex::new(Vec::new()),
                fail_after,
            }
        }
    }

    #[async_trait]
    impl DocumentStore for RecordingStore {
        async fn get(&self, _c: &str, _id: &str) -> Result<Option<Value>> {
            Ok(None)
        }
        async fn put(&self, _c: &'static str, _id: &str, _doc: Value) -> Result<()> {
            Ok(())
        }
        async fn list_ids(&self, _c: &str) -> Result<Vec<String>> {
            Ok(Vec::new())
        }
        async fn find_eq(&self, _c: &str, _f: &str, _v: &Value) -> Result<Vec<(String, Value)>> {
            Ok(Vec::new())
        }
        async fn commit(&self, ops: Vec<WriteOp>) -> Result<()> {
            let mut chunks = self.chunks.lock().unwrap();
            if let Some(n) = self.fail_after {
                if chunks.len() >= n {
                    bail!("backend commit rejected");
                }
            }
            chunks.push(
                ops.iter()
                    .map(|op| match op {
                        WriteOp::Put { id, .. } => id.clone(),
                        WriteOp::Delete { id, .. } => format!("-{id}"),
                    })
                    .collect(),
            );
            Ok(())
        }
        async fn fetch_and_increment(&self, _c: &str, _id: &str) -> Result<i64> {
            Err(anyhow!("not a counter store"))
        }
    }

    fn op(i: usize) -> WriteOp {
        WriteOp::put("t", i.to_string(), json!({}))
    }

    #[tokio::test]
    async fn chunks_at_ceiling_and_flushes_remainder() {
        let store = Arc::new(RecordingStore::new(None));
        let mut writer = BatchWriter::with_ceiling(store.clone(), 4);

        for i in 0..10 {
            writer.stage(op(i)).await.unwrap();
        }
        writer.flush().await.unwrap();

        let chunks = store.chunks.lock().unwrap();
        // ceil(10 / 4) commits, none empty, at most 4 ops each, in order.
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].len(), 4);
        assert_eq!(chunks[1].len(), 4);
        assert_eq!(chunks[2].len(), 2);
        let flat: Vec<&String> = chunks.iter().flatten().collect();
        let expected: Vec<String> = (0..10).map(|i| i.to_string()).collect();
        assert_eq!(flat, expected.iter().collect::<Vec<_>>());

        assert_eq!(writer.commits(), 3);
        assert_eq!(writer.committed_ops(), 10);
        assert_eq!(writer.pending(), 0);
    }

    #[tokio::test]
    async fn empty_flush_commits_nothing() {
        let store = Arc::new(RecordingStore::new(None));
        let mut writer = BatchWriter::with_ceiling(store.clone(), 4);
        writer.flush().await.unwrap();
        assert!(store.chunks.lock().unwrap().is_empty());
        assert_eq!(writer.commits(), 0);
    }

    #[tokio::test]
    async fn commit_failure_propagates_and_preserves_earlier_chunks() {
        let store = Arc::new(RecordingStore::new(Some(1)));
        let mut writer = BatchWriter::with_ceiling(store.clone(), 2);

        writer.stage(op(0)).await.unwrap();
        writer.stage(op(1)).await.unwrap(); // chunk 1 commits
        writer.stage(op(2)).await.unwrap();
        let err = writer.stage(op(3)).await.unwrap_err(); // chunk 2 rejected
        assert!(err.to_string().contains("rejected"));

        // First chunk stands; nothing was committed twice.
        assert_eq!(store.chunks.lock().unwrap().len(), 1);
        assert_eq!(writer.committed_ops(), 2);
    }

    #[tokio::test]
    async fn ceiling_is_clamped_below_backend_limit() {
        let store = Arc::new(RecordingStore::new(None));
        let writer = BatchWriter::with_ceiling(store, MAX_COMMIT_OPS * 2);
        assert_eq!(writer.ceiling, MAX_COMMIT_OPS - 1);
    }
}
