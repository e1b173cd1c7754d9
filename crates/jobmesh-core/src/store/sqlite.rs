//! SQLite-backed document store.
//!
//! All collections share one table. Insert-if-absent relies on the primary
//! key, and conditional writes compare the `revision` column inside a single
//! `UPDATE`/`DELETE` statement, so several processes can share one database
//! file safely.

use std::{path::Path, str::FromStr, time::Duration};

use async_trait::async_trait;
use serde_json::Value;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
    SqlitePool,
};

use super::{Document, DocumentStore, InsertOutcome, Revision, WriteOutcome};
use crate::{Error, Result};

/// How long a connection waits on a locked database file.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Connections kept by a file-backed pool.
const MAX_CONNECTIONS: u32 = 8;

#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (creating if needed) a database file.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                Error::store(format!(
                    "Failed to create store directory {}: {e}",
                    parent.display()
                ))
            })?;
        }
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(BUSY_TIMEOUT);
        let pool = SqlitePoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .connect_with(options)
            .await?;
        Self::with_pool(pool).await
    }

    /// Private in-memory database. One connection, so every query sees the
    /// same data.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        Self::with_pool(pool).await
    }

    /// Wrap an existing pool and make sure the schema exists.
    pub async fn with_pool(pool: SqlitePool) -> Result<Self> {
        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    async fn init(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS documents (
                collection TEXT NOT NULL,
                id TEXT NOT NULL,
                revision INTEGER NOT NULL,
                body TEXT NOT NULL,
                PRIMARY KEY (collection, id)
            )",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn to_document(collection: &str, row: (String, i64, String)) -> Result<Document> {
    let (id, revision, body) = row;
    let revision = u64::try_from(revision)
        .map_err(|_| Error::corrupted(collection, &id, format!("negative revision {revision}")))?;
    let body: Value = serde_json::from_str(&body)
        .map_err(|e| Error::corrupted(collection, &id, format!("invalid JSON body: {e}")))?;
    Ok(Document {
        id,
        revision: Revision(revision),
        body,
    })
}

fn revision_param(revision: Revision) -> Result<i64> {
    i64::try_from(revision.0)
        .map_err(|_| Error::store(format!("revision {} out of range", revision.0)))
}

#[async_trait]
impl DocumentStore for SqliteStore {
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>> {
        let row: Option<(String, i64, String)> = sqlx::query_as(
            "SELECT id, revision, body FROM documents WHERE collection = ? AND id = ?",
        )
        .bind(collection)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| to_document(collection, r)).transpose()
    }

    async fn list(&self, collection: &str) -> Result<Vec<Document>> {
        let rows: Vec<(String, i64, String)> = sqlx::query_as(
            "SELECT id, revision, body FROM documents WHERE collection = ? ORDER BY id",
        )
        .bind(collection)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|r| to_document(collection, r))
            .collect()
    }

    async fn insert(&self, collection: &str, id: &str, body: Value) -> Result<InsertOutcome> {
        let text = serde_json::to_string(&body)?;
        loop {
            let inserted = sqlx::query(
                "INSERT INTO documents (collection, id, revision, body) VALUES (?, ?, ?, ?)
                 ON CONFLICT (collection, id) DO NOTHING",
            )
            .bind(collection)
            .bind(id)
            .bind(revision_param(Revision::INITIAL)?)
            .bind(&text)
            .execute(&self.pool)
            .await?
            .rows_affected();

            if inserted == 1 {
                return Ok(InsertOutcome::Inserted(Revision::INITIAL));
            }
            // Deleted between the failed insert and this read: try again.
            if let Some(existing) = self.get(collection, id).await? {
                return Ok(InsertOutcome::AlreadyExists(existing));
            }
        }
    }

    async fn replace(
        &self,
        collection: &str,
        id: &str,
        expected: Revision,
        body: Value,
    ) -> Result<WriteOutcome> {
        let text = serde_json::to_string(&body)?;
        let updated = sqlx::query(
            "UPDATE documents SET body = ?, revision = revision + 1
             WHERE collection = ? AND id = ? AND revision = ?",
        )
        .bind(&text)
        .bind(collection)
        .bind(id)
        .bind(revision_param(expected)?)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if updated == 1 {
            return Ok(WriteOutcome::Applied(expected.next()));
        }
        Ok(match self.get(collection, id).await? {
            Some(_) => WriteOutcome::Conflict,
            None => WriteOutcome::Missing,
        })
    }

    async fn delete(
        &self,
        collection: &str,
        id: &str,
        expected: Option<Revision>,
    ) -> Result<WriteOutcome> {
        let deleted: Option<(i64,)> = match expected {
            Some(revision) => {
                sqlx::query_as(
                    "DELETE FROM documents WHERE collection = ? AND id = ? AND revision = ?
                     RETURNING revision",
                )
                .bind(collection)
                .bind(id)
                .bind(revision_param(revision)?)
                .fetch_optional(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as(
                    "DELETE FROM documents WHERE collection = ? AND id = ? RETURNING revision",
                )
                .bind(collection)
                .bind(id)
                .fetch_optional(&self.pool)
                .await?
            }
        };

        if let Some((revision,)) = deleted {
            return Ok(WriteOutcome::Applied(Revision(
                u64::try_from(revision).unwrap_or_default(),
            )));
        }
        Ok(match self.get(collection, id).await? {
            Some(_) => WriteOutcome::Conflict,
            None => WriteOutcome::Missing,
        })
    }

    async fn drop_collection(&self, collection: &str) -> Result<u64> {
        let removed = sqlx::query("DELETE FROM documents WHERE collection = ?")
            .bind(collection)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::store::contract;

    #[tokio::test]
    async fn test_insert_is_atomic_unique() -> Result<()> {
        contract::insert_is_atomic_unique(&SqliteStore::in_memory().await?).await
    }

    #[tokio::test]
    async fn test_replace_is_revision_guarded() -> Result<()> {
        contract::replace_is_revision_guarded(&SqliteStore::in_memory().await?).await
    }

    #[tokio::test]
    async fn test_delete_respects_expected_revision() -> Result<()> {
        contract::delete_respects_expected_revision(&SqliteStore::in_memory().await?).await
    }

    #[tokio::test]
    async fn test_collections_are_isolated() -> Result<()> {
        contract::collections_are_isolated(&SqliteStore::in_memory().await?).await
    }

    #[tokio::test]
    async fn test_update_where_filters_and_retries() -> Result<()> {
        contract::update_where_filters_and_retries(&SqliteStore::in_memory().await?).await
    }

    #[tokio::test]
    async fn test_two_handles_on_one_file_share_documents() -> Result<()> {
        let dir = tempfile::tempdir().map_err(Error::from)?;
        let path = dir.path().join("nested").join("store.db");
        let first = SqliteStore::open(&path).await?;
        let second = SqliteStore::open(&path).await?;

        first.insert("jobs", "a", json!({"x": 1})).await?;
        match second.insert("jobs", "a", json!({"x": 2})).await? {
            InsertOutcome::AlreadyExists(doc) => assert_eq!(doc.body, json!({"x": 1})),
            InsertOutcome::Inserted(_) => panic!("insert through second handle must collide"),
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_corrupted_body_is_reported() -> Result<()> {
        let store = SqliteStore::in_memory().await?;
        sqlx::query("INSERT INTO documents (collection, id, revision, body) VALUES ('jobs', 'bad', 1, '{not json')")
            .execute(store.pool())
            .await?;
        let err = store.get("jobs", "bad").await.err();
        assert!(matches!(err, Some(Error::CorruptedState { .. })));
        Ok(())
    }
}
