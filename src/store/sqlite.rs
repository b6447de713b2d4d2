//! SQLite-backed [`DocumentStore`] (sqlx).
//!
//! Documents live in one table, `documents(collection, id, doc)`, with the
//! JSON body stored as text. The pool is capped at a single connection: the
//! engine is a single logical worker and this keeps transactions serialized
//! (and makes `sqlite::memory:` behave as one database in tests).

use std::str::FromStr;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use tracing::info;

use super::{DocumentStore, WriteOp, MAX_COMMIT_OPS};

#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (creating if missing) and bootstrap the schema.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)
            .with_context(|| format!("bad database url: {database_url}"))?
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS documents (
                collection TEXT NOT NULL,
                id         TEXT NOT NULL,
                doc        TEXT NOT NULL,
                PRIMARY KEY (collection, id)
            )",
        )
        .execute(&pool)
        .await?;
        info!("document store ready");

        Ok(Self { pool })
    }

    /// In-memory store for tests.
    pub async fn in_memory() -> Result<Self> {
        Self::connect("sqlite::memory:").await
    }
}

#[async_trait]
impl DocumentStore for SqliteStore {
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Value>> {
        let row = sqlx::query("SELECT doc FROM documents WHERE collection = ?1 AND id = ?2")
            .bind(collection)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => {
                let raw: String = row.get("doc");
                Ok(Some(serde_json::from_str(&raw)?))
            }
            None => Ok(None),
        }
    }

    async fn put(&self, collection: &'static str, id: &str, doc: Value) -> Result<()> {
        sqlx::query(
            "INSERT INTO documents (collection, id, doc) VALUES (?1, ?2, ?3)
             ON CONFLICT (collection, id) DO UPDATE SET doc = excluded.doc",
        )
        .bind(collection)
        .bind(id)
        .bind(doc.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_ids(&self, collection: &str) -> Result<Vec<String>> {
        let rows = sqlx::query("SELECT id FROM documents WHERE collection = ?1 ORDER BY id")
            .bind(collection)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(|r| r.get::<String, _>("id")).collect())
    }

    async fn find_eq(
        &self,
        collection: &str,
        field: &str,
        value: &Value,
    ) -> Result<Vec<(String, Value)>> {
        let path = format!("$.{field}");
        let sql = "SELECT id, doc FROM documents
                   WHERE collection = ?1 AND json_extract(doc, ?2) = ?3";
        let query = sqlx::query(sql).bind(collection).bind(&path);
        let query = match value {
            Value::String(s) => query.bind(s.clone()),
            Value::Number(n) if n.is_i64() => query.bind(n.as_i64().unwrap()),
            Value::Number(n) => query.bind(n.as_f64().unwrap_or_default()),
            Value::Bool(b) => query.bind(*b),
            other => query.bind(other.to_string()),
        };
        let rows = query.fetch_all(&self.pool).await?;
        rows.iter()
            .map(|r| {
                let id: String = r.get("id");
                let raw: String = r.get("doc");
                Ok((id, serde_json::from_str(&raw)?))
            })
            .collect()
    }

    async fn commit(&self, ops: Vec<WriteOp>) -> Result<()> {
        if ops.is_empty() {
            return Ok(());
        }
        if ops.len() > MAX_COMMIT_OPS {
            bail!(
                "commit of {} operations exceeds backend limit of {MAX_COMMIT_OPS}",
                ops.len()
            );
        }
        let mut tx = self.pool.begin().await?;
        for op in ops {
            match op {
                WriteOp::Put {
                    collection,
                    id,
                    doc,
                } => {
                    sqlx::query(
                        "INSERT INTO documents (collection, id, doc) VALUES (?1, ?2, ?3)
                         ON CONFLICT (collection, id) DO UPDATE SET doc = excluded.doc",
                    )
                    .bind(collection)
                    .bind(id)
                    .bind(doc.to_string())
                    .execute(&mut *tx)
                    .await?;
                }
                WriteOp::Delete { collection, id } => {
                    sqlx::query("DELETE FROM documents WHERE collection = ?1 AND id = ?2")
                        .bind(collection)
                        .bind(id)
                        .execute(&mut *tx)
                        .await?;
                }
            }
        }
        tx.commit().await?;
        Ok(())
    }

    async fn fetch_and_increment(&self, collection: &str, id: &str) -> Result<i64> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query("SELECT doc FROM documents WHERE collection = ?1 AND id = ?2")
            .bind(collection)
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?;
        let next = match row {
            Some(row) => {
                let raw: String = row.get("doc");
                let doc: Value = serde_json::from_str(&raw)?;
                doc.get("value").and_then(Value::as_i64).unwrap_or(0) + 1
            }
            None => 1,
        };
        sqlx::query(
            "INSERT INTO documents (collection, id, doc) VALUES (?1, ?2, ?3)
             ON CONFLICT (collection, id) DO UPDATE SET doc = excluded.doc",
        )
        .bind(collection)
        .bind(id)
        .bind(json!({ "value": next }).to_string())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(next)
    }
}
