//! In-process document store.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;

use super::{Document, DocumentStore, InsertOutcome, Revision, WriteOutcome};
use crate::Result;

type Collection = BTreeMap<String, Document>;

/// Documents kept in memory behind a single lock.
///
/// Every operation holds the lock for its whole read-check-write, which gives
/// the same per-document atomicity a networked store provides.
#[derive(Debug, Default)]
pub struct MemoryStore {
    collections: RwLock<HashMap<String, Collection>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>> {
        let collections = self.collections.read().await;
        Ok(collections
            .get(collection)
            .and_then(|docs| docs.get(id))
            .cloned())
    }

    async fn list(&self, collection: &str) -> Result<Vec<Document>> {
        let collections = self.collections.read().await;
        Ok(collections
            .get(collection)
            .map(|docs| docs.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn insert(&self, collection: &str, id: &str, body: Value) -> Result<InsertOutcome> {
        let mut collections = self.collections.write().await;
        let docs = collections.entry(collection.to_owned()).or_default();
        if let Some(existing) = docs.get(id) {
            return Ok(InsertOutcome::AlreadyExists(existing.clone()));
        }
        docs.insert(
            id.to_owned(),
            Document {
                id: id.to_owned(),
                revision: Revision::INITIAL,
                body,
            },
        );
        Ok(InsertOutcome::Inserted(Revision::INITIAL))
    }

    async fn replace(
        &self,
        collection: &str,
        id: &str,
        expected: Revision,
        body: Value,
    ) -> Result<WriteOutcome> {
        let mut collections = self.collections.write().await;
        let Some(doc) = collections.get_mut(collection).and_then(|d| d.get_mut(id)) else {
            return Ok(WriteOutcome::Missing);
        };
        if doc.revision != expected {
            return Ok(WriteOutcome::Conflict);
        }
        doc.revision = doc.revision.next();
        doc.body = body;
        Ok(WriteOutcome::Applied(doc.revision))
    }

    async fn delete(
        &self,
        collection: &str,
        id: &str,
        expected: Option<Revision>,
    ) -> Result<WriteOutcome> {
        let mut collections = self.collections.write().await;
        let Some(docs) = collections.get_mut(collection) else {
            return Ok(WriteOutcome::Missing);
        };
        let Some(doc) = docs.get(id) else {
            return Ok(WriteOutcome::Missing);
        };
        if expected.is_some_and(|rev| rev != doc.revision) {
            return Ok(WriteOutcome::Conflict);
        }
        let revision = doc.revision;
        docs.remove(id);
        Ok(WriteOutcome::Applied(revision))
    }

    async fn drop_collection(&self, collection: &str) -> Result<u64> {
        let mut collections = self.collections.write().await;
        Ok(collections
            .remove(collection)
            .map_or(0, |docs| docs.len() as u64))
    }
}
