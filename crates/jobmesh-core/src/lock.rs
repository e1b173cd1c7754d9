//! Distributed lock embedded in a resource document.
//!
//! The lock is a `lock` field inside the document it protects. Acquisition is
//! one conditional update that only matches when the field is absent or its
//! lease has run out, so the store's single-document atomicity is the sole
//! source of mutual exclusion. A crashed holder never has to release: its
//! lease lapses and the next acquire takes over.
//!
//! Release and renewal are guarded by the owner token handed out on acquire.
//! A holder whose lease expired and was taken over cannot clear or extend the
//! new owner's lock.

#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::panic))]

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{
    clock::{to_chrono, Clock},
    store::{update_where, Conditional, DocumentStore},
    wait::{Deadline, WaitPolicy},
    Error, Result,
};

/// Name of the embedded lock field.
pub const LOCK_FIELD: &str = "lock";

/// Default lease (3 heartbeat periods).
pub const DEFAULT_LEASE: Duration = Duration::from_secs(180);

/// Default poll period of a blocking acquire.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Lock field contents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockState {
    /// Token of the acquisition holding the lock.
    pub owner: String,
    pub acquired_at: DateTime<Utc>,
    pub lease_ms: u64,
}

impl LockState {
    /// When the lease runs out, `None` if it never does.
    #[must_use]
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.acquired_at
            .checked_add_signed(to_chrono(Duration::from_millis(self.lease_ms)))
    }

    /// Lease is over once `acquired_at + lease < now`.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at().is_some_and(|deadline| deadline < now)
    }
}

/// Proof of a successful acquisition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockHandle {
    pub resource: String,
    pub owner: String,
    pub acquired_at: DateTime<Utc>,
    pub lease: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockConfig {
    pub lease: Duration,
    pub poll_interval: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            lease: DEFAULT_LEASE,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

/// Lock over the documents of one collection.
#[derive(Debug, Clone)]
pub struct DistributedLock {
    store: Arc<dyn DocumentStore>,
    clock: Arc<dyn Clock>,
    collection: String,
    config: LockConfig,
}

impl DistributedLock {
    #[must_use]
    pub fn new(
        store: Arc<dyn DocumentStore>,
        clock: Arc<dyn Clock>,
        collection: impl Into<String>,
        config: LockConfig,
    ) -> Self {
        Self {
            store,
            clock,
            collection: collection.into(),
            config,
        }
    }

    #[must_use]
    pub const fn config(&self) -> &LockConfig {
        &self.config
    }

    /// Acquire the lock on `resource`.
    ///
    /// # Errors
    ///
    /// - `LockBusy` when non-blocking and held by a live owner
    /// - `LockTimeout` when the wait budget runs out
    /// - `NotFound` when the resource document does not exist
    pub async fn acquire(&self, resource: &str, wait: WaitPolicy) -> Result<LockHandle> {
        self.acquire_inner(resource, wait, None).await
    }

    /// Like [`Self::acquire`], but a fired `cancel` token stops the wait with
    /// `Cancelled`.
    pub async fn acquire_cancellable(
        &self,
        resource: &str,
        wait: WaitPolicy,
        cancel: &CancellationToken,
    ) -> Result<LockHandle> {
        self.acquire_inner(resource, wait, Some(cancel)).await
    }

    async fn acquire_inner(
        &self,
        resource: &str,
        wait: WaitPolicy,
        cancel: Option<&CancellationToken>,
    ) -> Result<LockHandle> {
        let deadline = Deadline::start(wait);
        loop {
            if let Some(handle) = self.try_acquire(resource).await? {
                return Ok(handle);
            }
            if !deadline.pause(self.config.poll_interval, cancel).await? {
                return Err(if wait.is_blocking() {
                    tracing::debug!(resource, waited = ?deadline.waited(), "lock wait timed out");
                    Error::LockTimeout {
                        resource: resource.to_owned(),
                        waited: deadline.waited(),
                    }
                } else {
                    tracing::debug!(resource, "lock busy");
                    Error::LockBusy {
                        resource: resource.to_owned(),
                    }
                });
            }
        }
    }

    /// One acquisition attempt. `Ok(None)` when a live owner holds the lock.
    pub async fn try_acquire(&self, resource: &str) -> Result<Option<LockHandle>> {
        let now = self.clock.now();
        let lease_ms = u64::try_from(self.config.lease.as_millis()).unwrap_or(u64::MAX);
        let state = LockState {
            owner: Uuid::new_v4().to_string(),
            acquired_at: now,
            lease_ms,
        };
        let encoded = serde_json::to_value(&state)?;
        let collection = self.collection.as_str();

        let outcome = update_where(self.store.as_ref(), collection, resource, |body| {
            let free = match read_lock(collection, resource, body)? {
                None => true,
                Some(current) => current.is_expired(now),
            };
            if free {
                with_lock(collection, resource, body, encoded.clone()).map(Some)
            } else {
                Ok(None)
            }
        })
        .await?;

        match outcome {
            Conditional::Applied(_) => {
                tracing::debug!(resource, owner = %state.owner, "lock acquired");
                Ok(Some(LockHandle {
                    resource: resource.to_owned(),
                    owner: state.owner,
                    acquired_at: now,
                    lease: self.config.lease,
                }))
            }
            Conditional::Rejected(_) => Ok(None),
            Conditional::Missing => Err(Error::not_found(format!(
                "{}/{resource}",
                self.collection
            ))),
        }
    }

    /// Release a lock. A no-op returning `false` when the token no longer
    /// owns it or the document is gone.
    pub async fn release(&self, handle: LockHandle) -> Result<bool> {
        let collection = self.collection.as_str();
        let resource = handle.resource.as_str();
        let outcome = update_where(self.store.as_ref(), collection, resource, |body| {
            match read_lock(collection, resource, body)? {
                Some(current) if current.owner == handle.owner => {
                    with_lock(collection, resource, body, Value::Null).map(Some)
                }
                _ => Ok(None),
            }
        })
        .await?;

        let released = outcome.is_applied();
        if released {
            tracing::debug!(resource, owner = %handle.owner, "lock released");
        } else {
            tracing::debug!(resource, owner = %handle.owner, "release skipped, lock no longer owned");
        }
        Ok(released)
    }

    /// Restart the lease of a lock still owned by `handle`.
    ///
    /// Returns `false` when ownership was lost (lease taken over, or
    /// document removed).
    pub async fn renew(&self, handle: &mut LockHandle) -> Result<bool> {
        let now = self.clock.now();
        let collection = self.collection.as_str();
        let resource = handle.resource.clone();
        let owner = handle.owner.clone();
        let outcome = update_where(self.store.as_ref(), collection, &resource, |body| {
            match read_lock(collection, &resource, body)? {
                Some(mut current) if current.owner == owner => {
                    current.acquired_at = now;
                    let encoded = serde_json::to_value(&current)?;
                    with_lock(collection, &resource, body, encoded).map(Some)
                }
                _ => Ok(None),
            }
        })
        .await?;

        if outcome.is_applied() {
            handle.acquired_at = now;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// The live holder of `resource`, if any.
    pub async fn state(&self, resource: &str) -> Result<Option<LockState>> {
        let Some(doc) = self.store.get(&self.collection, resource).await? else {
            return Err(Error::not_found(format!(
                "{}/{resource}",
                self.collection
            )));
        };
        let now = self.clock.now();
        Ok(read_lock(&self.collection, resource, &doc.body)?
            .filter(|state| !state.is_expired(now)))
    }
}

fn read_lock(collection: &str, id: &str, body: &Value) -> Result<Option<LockState>> {
    match body.get(LOCK_FIELD) {
        None | Some(Value::Null) => Ok(None),
        Some(raw) => serde_json::from_value(raw.clone())
            .map(Some)
            .map_err(|e| Error::corrupted(collection, id, format!("unreadable lock field: {e}"))),
    }
}

fn with_lock(collection: &str, id: &str, body: &Value, lock: Value) -> Result<Value> {
    let Value::Object(map) = body else {
        return Err(Error::corrupted(collection, id, "document is not an object"));
    };
    let mut map = map.clone();
    if lock.is_null() {
        map.remove(LOCK_FIELD);
    } else {
        map.insert(LOCK_FIELD.to_owned(), lock);
    }
    Ok(Value::Object(map))
}

#[cfg(test)]
mod tests {
    use chrono::Duration as ChronoDuration;
    use serde_json::json;

    use super::*;
    use crate::{clock::ManualClock, store::MemoryStore};

    struct Fixture {
        store: Arc<MemoryStore>,
        clock: ManualClock,
        lock: DistributedLock,
    }

    async fn setup() -> Result<Fixture> {
        let store = Arc::new(MemoryStore::new());
        store.insert("jobs", "job-1", json!({"_id": "job-1"})).await?;
        let clock = ManualClock::default();
        let lock = DistributedLock::new(
            store.clone(),
            Arc::new(clock.clone()),
            "jobs",
            LockConfig {
                lease: Duration::from_secs(30),
                poll_interval: Duration::from_millis(5),
            },
        );
        Ok(Fixture { store, clock, lock })
    }

    #[tokio::test]
    async fn test_acquire_free_resource() -> Result<()> {
        let fx = setup().await?;
        let handle = fx.lock.acquire("job-1", WaitPolicy::NonBlocking).await?;
        assert_eq!(handle.resource, "job-1");

        let state = fx.lock.state("job-1").await?;
        assert_eq!(state.map(|s| s.owner), Some(handle.owner));
        Ok(())
    }

    #[tokio::test]
    async fn test_second_non_blocking_acquire_is_busy() -> Result<()> {
        let fx = setup().await?;
        let _held = fx.lock.acquire("job-1", WaitPolicy::NonBlocking).await?;
        let second = fx.lock.acquire("job-1", WaitPolicy::NonBlocking).await;
        assert!(matches!(second, Err(Error::LockBusy { resource }) if resource == "job-1"));
        Ok(())
    }

    #[tokio::test]
    async fn test_blocking_acquire_times_out() -> Result<()> {
        let fx = setup().await?;
        let _held = fx.lock.acquire("job-1", WaitPolicy::NonBlocking).await?;
        let second = fx
            .lock
            .acquire("job-1", WaitPolicy::Timeout(Duration::from_millis(30)))
            .await;
        assert!(matches!(second, Err(Error::LockTimeout { .. })));
        Ok(())
    }

    #[tokio::test]
    async fn test_blocking_acquire_succeeds_after_release() -> Result<()> {
        let fx = setup().await?;
        let held = fx.lock.acquire("job-1", WaitPolicy::NonBlocking).await?;

        let waiter = {
            let lock = fx.lock.clone();
            tokio::spawn(async move {
                lock.acquire("job-1", WaitPolicy::Timeout(Duration::from_secs(5)))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(fx.lock.release(held).await?);

        let acquired = waiter.await.map_err(|e| Error::Io(e.to_string()))??;
        assert_eq!(acquired.resource, "job-1");
        Ok(())
    }

    #[tokio::test]
    async fn test_expired_lease_is_taken_over_without_release() -> Result<()> {
        let fx = setup().await?;
        let crashed = fx.lock.acquire("job-1", WaitPolicy::NonBlocking).await?;
        fx.clock.advance(ChronoDuration::seconds(31));

        let next = fx.lock.acquire("job-1", WaitPolicy::NonBlocking).await?;
        assert_ne!(next.owner, crashed.owner);
        Ok(())
    }

    #[tokio::test]
    async fn test_lease_is_not_expired_at_exact_boundary() -> Result<()> {
        let fx = setup().await?;
        let _held = fx.lock.acquire("job-1", WaitPolicy::NonBlocking).await?;
        fx.clock.advance(ChronoDuration::seconds(30));
        let second = fx.lock.acquire("job-1", WaitPolicy::NonBlocking).await;
        assert!(matches!(second, Err(Error::LockBusy { .. })));
        Ok(())
    }

    #[tokio::test]
    async fn test_stale_token_release_is_a_noop() -> Result<()> {
        let fx = setup().await?;
        let crashed = fx.lock.acquire("job-1", WaitPolicy::NonBlocking).await?;
        fx.clock.advance(ChronoDuration::seconds(31));
        let next = fx.lock.acquire("job-1", WaitPolicy::NonBlocking).await?;

        assert!(!fx.lock.release(crashed).await?);
        let state = fx.lock.state("job-1").await?;
        assert_eq!(state.map(|s| s.owner), Some(next.owner));
        Ok(())
    }

    #[tokio::test]
    async fn test_renew_extends_lease_and_fails_after_takeover() -> Result<()> {
        let fx = setup().await?;
        let mut held = fx.lock.acquire("job-1", WaitPolicy::NonBlocking).await?;

        fx.clock.advance(ChronoDuration::seconds(20));
        assert!(fx.lock.renew(&mut held).await?);
        fx.clock.advance(ChronoDuration::seconds(20));
        // 40s after acquisition but only 20s after renewal: still held.
        let busy = fx.lock.acquire("job-1", WaitPolicy::NonBlocking).await;
        assert!(matches!(busy, Err(Error::LockBusy { .. })));

        fx.clock.advance(ChronoDuration::seconds(31));
        let _other = fx.lock.acquire("job-1", WaitPolicy::NonBlocking).await?;
        assert!(!fx.lock.renew(&mut held).await?);
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_resource_is_not_found() -> Result<()> {
        let fx = setup().await?;
        let result = fx.lock.acquire("ghost", WaitPolicy::NonBlocking).await;
        assert!(matches!(result, Err(Error::NotFound(_))));
        Ok(())
    }

    #[tokio::test]
    async fn test_unreadable_lock_field_is_corrupted_state() -> Result<()> {
        let fx = setup().await?;
        fx.store
            .insert("jobs", "job-2", json!({"lock": {"owner": 7}}))
            .await?;
        let result = fx.lock.acquire("job-2", WaitPolicy::NonBlocking).await;
        assert!(matches!(result, Err(Error::CorruptedState { .. })));
        Ok(())
    }

    #[tokio::test]
    async fn test_cancel_stops_blocking_acquire() -> Result<()> {
        let fx = setup().await?;
        let _held = fx.lock.acquire("job-1", WaitPolicy::NonBlocking).await?;
        let token = CancellationToken::new();
        let cancel = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel.cancel();
        });
        let result = fx
            .lock
            .acquire_cancellable("job-1", WaitPolicy::Forever, &token)
            .await;
        assert!(matches!(result, Err(Error::Cancelled)));
        Ok(())
    }

    #[tokio::test]
    async fn test_release_keeps_other_fields() -> Result<()> {
        let fx = setup().await?;
        let held = fx.lock.acquire("job-1", WaitPolicy::NonBlocking).await?;
        fx.lock.release(held).await?;
        let doc = fx.store.get("jobs", "job-1").await?;
        assert_eq!(doc.map(|d| d.body), Some(json!({"_id": "job-1"})));
        Ok(())
    }
}
