//! Deduplicating membership set of in-flight task fingerprints.
//!
//! Membership is document existence, so `add` is the store's insert-if-absent
//! and two concurrent adders can never both win. Entries carry a
//! `touched_at` lease: a worker executing a task refreshes it, and
//! [`FingerprintSet::sweep_stale`] drops entries whose worker stopped
//! touching them.

#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::panic))]

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    clock::{to_chrono, Clock},
    error::DuplicateStage,
    hashing::Fingerprint,
    store::{self, encode, update_typed, Conditional, DocumentStore, InsertOutcome, WriteOutcome},
    Error, Result,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FingerprintEntry {
    pub fingerprint: Fingerprint,
    /// Worker instance that added the entry.
    pub owner: String,
    pub added_at: DateTime<Utc>,
    pub touched_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct FingerprintSet {
    store: Arc<dyn DocumentStore>,
    clock: Arc<dyn Clock>,
    collection: String,
}

impl FingerprintSet {
    #[must_use]
    pub fn new(store: Arc<dyn DocumentStore>, clock: Arc<dyn Clock>) -> Self {
        Self::with_collection(store, clock, store::FETCHED_SET)
    }

    #[must_use]
    pub fn with_collection(
        store: Arc<dyn DocumentStore>,
        clock: Arc<dyn Clock>,
        collection: impl Into<String>,
    ) -> Self {
        Self {
            store,
            clock,
            collection: collection.into(),
        }
    }

    pub async fn contains(&self, fingerprint: &Fingerprint) -> Result<bool> {
        Ok(self
            .store
            .get(&self.collection, fingerprint.as_str())
            .await?
            .is_some())
    }

    /// Add a fingerprint owned by `owner`.
    ///
    /// # Errors
    ///
    /// `DuplicateSubmission` (stage `InFlight`) when already a member.
    pub async fn add(&self, fingerprint: &Fingerprint, owner: &str) -> Result<()> {
        let now = self.clock.now();
        let entry = FingerprintEntry {
            fingerprint: fingerprint.clone(),
            owner: owner.to_owned(),
            added_at: now,
            touched_at: now,
        };
        match self
            .store
            .insert(&self.collection, fingerprint.as_str(), encode(&entry)?)
            .await?
        {
            InsertOutcome::Inserted(_) => Ok(()),
            InsertOutcome::AlreadyExists(_) => Err(Error::DuplicateSubmission {
                fingerprint: fingerprint.to_string(),
                stage: DuplicateStage::InFlight,
            }),
        }
    }

    /// Remove a fingerprint. Removing a non-member is fine.
    pub async fn remove(&self, fingerprint: &Fingerprint) -> Result<bool> {
        let outcome = self
            .store
            .delete(&self.collection, fingerprint.as_str(), None)
            .await?;
        Ok(matches!(outcome, WriteOutcome::Applied(_)))
    }

    /// Refresh the lease of an entry. `false` when it is not a member.
    pub async fn touch(&self, fingerprint: &Fingerprint) -> Result<bool> {
        let now = self.clock.now();
        let outcome = update_typed::<FingerprintEntry, _>(
            self.store.as_ref(),
            &self.collection,
            fingerprint.as_str(),
            |entry| {
                entry.touched_at = now;
                true
            },
        )
        .await?;
        Ok(matches!(outcome, Conditional::Applied(_)))
    }

    pub async fn members(&self) -> Result<Vec<FingerprintEntry>> {
        self.store
            .list(&self.collection)
            .await?
            .iter()
            .map(|doc| doc.decode(&self.collection))
            .collect()
    }

    /// Delete entries not touched for longer than `cutoff`.
    ///
    /// Each delete is guarded by the revision that was judged stale, so an
    /// entry touched in between survives.
    pub async fn sweep_stale(&self, cutoff: Duration) -> Result<Vec<Fingerprint>> {
        let now = self.clock.now();
        let cutoff = to_chrono(cutoff);
        let mut swept = Vec::new();

        for doc in self.store.list(&self.collection).await? {
            let entry: FingerprintEntry = match doc.decode(&self.collection) {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::warn!(id = %doc.id, error = %e, "skipping unreadable fingerprint entry");
                    continue;
                }
            };
            if now.signed_duration_since(entry.touched_at) <= cutoff {
                continue;
            }
            let outcome = self
                .store
                .delete(&self.collection, &doc.id, Some(doc.revision))
                .await?;
            if matches!(outcome, WriteOutcome::Applied(_)) {
                tracing::info!(
                    fingerprint = %entry.fingerprint,
                    owner = %entry.owner,
                    "swept stale in-flight fingerprint"
                );
                swept.push(entry.fingerprint);
            }
        }
        Ok(swept)
    }
}
