//! # Store Adapter
//!
//! The narrow interface every coordination primitive is built on. A backend
//! only has to offer, per document:
//!
//! - read (`get`) and collection scan (`list`)
//! - insert-if-absent (`insert`)
//! - revision-guarded replace (`replace`)
//! - delete, optionally revision-guarded (`delete`)
//!
//! There are no multi-document transactions. The "conditional update matching
//! a filter" primitive is [`update_where`]: read, evaluate the predicate,
//! write back guarded by the revision that was read. Because every write is a
//! compare-and-set on the revision, the result is linearizable per document.
//!
//! ## Backends
//!
//! - [`MemoryStore`] - in-process maps, for tests and single-process use
//! - [`SqliteStore`] - one SQLite table shared by every process using the file

mod memory;
mod sqlite;

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use crate::{Error, Result};

/// Collection holding one document per job.
pub const JOBS: &str = "jobs";
/// Collection holding one document per queued task.
pub const QUEUE: &str = "queue";
/// Collection holding queue bookkeeping (the sequence counter).
pub const QUEUE_META: &str = "queue_meta";
/// Collection holding one result per executed fingerprint.
pub const QUEUE_RESULTS: &str = "queue_results";
/// Collection backing the fingerprint set.
pub const FETCHED_SET: &str = "fetched_set";

/// Per-document version used for compare-and-set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Revision(pub u64);

impl Revision {
    /// Revision assigned on insert.
    pub const INITIAL: Self = Self(1);

    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

/// A stored document.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub id: String,
    pub revision: Revision,
    pub body: Value,
}

impl Document {
    /// Decode the body into a typed document.
    pub fn decode<T: DeserializeOwned>(&self, collection: &str) -> Result<T> {
        serde_json::from_value(self.body.clone())
            .map_err(|e| Error::corrupted(collection, &self.id, e.to_string()))
    }
}

/// Encode a typed document body.
pub fn encode<T: Serialize>(value: &T) -> Result<Value> {
    serde_json::to_value(value).map_err(Error::from)
}

/// Result of an insert-if-absent.
#[derive(Debug, Clone, PartialEq)]
pub enum InsertOutcome {
    Inserted(Revision),
    /// Another document with this id exists; it is returned as found.
    AlreadyExists(Document),
}

/// Result of a revision-guarded write or delete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Applied(Revision),
    /// The document changed since the expected revision.
    Conflict,
    Missing,
}

#[async_trait]
pub trait DocumentStore: Send + Sync + std::fmt::Debug {
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>>;

    /// Every document of a collection, in unspecified order.
    async fn list(&self, collection: &str) -> Result<Vec<Document>>;

    async fn insert(&self, collection: &str, id: &str, body: Value) -> Result<InsertOutcome>;

    async fn replace(
        &self,
        collection: &str,
        id: &str,
        expected: Revision,
        body: Value,
    ) -> Result<WriteOutcome>;

    /// Delete a document. With `expected = None` the delete is unconditional.
    async fn delete(
        &self,
        collection: &str,
        id: &str,
        expected: Option<Revision>,
    ) -> Result<WriteOutcome>;

    /// Remove every document of a collection, returning how many went.
    async fn drop_collection(&self, collection: &str) -> Result<u64>;
}

// ═══════════════════════════════════════════════════════════════════════════
// CONDITIONAL UPDATE
// ═══════════════════════════════════════════════════════════════════════════

/// Outcome of [`update_where`].
#[derive(Debug, Clone, PartialEq)]
pub enum Conditional {
    /// The predicate matched and the new body was written.
    Applied(Document),
    /// The predicate did not match the current document.
    Rejected(Document),
    Missing,
}

impl Conditional {
    #[must_use]
    pub const fn is_applied(&self) -> bool {
        matches!(self, Self::Applied(_))
    }
}

/// Atomic conditional update of one document.
///
/// `apply` sees the current body and returns `Some(new_body)` when its filter
/// matches, `None` when it does not. A concurrent writer makes the guarded
/// replace fail with a conflict; the loop then re-reads and re-evaluates, so
/// the filter is always judged against the state that is overwritten.
pub async fn update_where<F>(
    store: &dyn DocumentStore,
    collection: &str,
    id: &str,
    mut apply: F,
) -> Result<Conditional>
where
    F: FnMut(&Value) -> Result<Option<Value>> + Send,
{
    loop {
        let Some(current) = store.get(collection, id).await? else {
            return Ok(Conditional::Missing);
        };
        let Some(body) = apply(&current.body)? else {
            return Ok(Conditional::Rejected(current));
        };
        match store
            .replace(collection, id, current.revision, body.clone())
            .await?
        {
            WriteOutcome::Applied(revision) => {
                return Ok(Conditional::Applied(Document {
                    id: current.id,
                    revision,
                    body,
                }));
            }
            WriteOutcome::Missing => return Ok(Conditional::Missing),
            WriteOutcome::Conflict => {
                tracing::trace!(collection, id, "conditional update raced, retrying");
                tokio::task::yield_now().await;
            }
        }
    }
}

/// Typed variant of [`update_where`].
///
/// The closure mutates a decoded copy and returns whether its filter matched.
pub async fn update_typed<T, F>(
    store: &dyn DocumentStore,
    collection: &str,
    id: &str,
    mut apply: F,
) -> Result<Conditional>
where
    T: Serialize + DeserializeOwned,
    F: FnMut(&mut T) -> bool + Send,
{
    update_where(store, collection, id, |body| {
        let mut doc: T = serde_json::from_value(body.clone())
            .map_err(|e| Error::corrupted(collection, id, e.to_string()))?;
        if apply(&mut doc) {
            encode(&doc).map(Some)
        } else {
            Ok(None)
        }
    })
    .await
}
