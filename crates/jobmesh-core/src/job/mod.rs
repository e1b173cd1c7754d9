//! # Job Registry
//!
//! Content-addressed job documents plus the liveness table that says which
//! worker instances hold each job open.
//!
//! ## Document lifecycle
//!
//! - `register`/`open` insert the document if absent (idempotent)
//! - `open` takes the job lock, then adds the worker to `executing` and
//!   writes its first `pulse` in one single-document update
//! - the heartbeat rewrites `pulse[worker]` every period
//! - `close` drops the worker from both fields and releases the lock
//! - `remove` deletes the filesystem areas, then the document
//!
//! A worker that dies without closing is dropped by [`JobRegistry::reclaim_dead`]
//! and its lock lapses with the lease.

#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::panic))]

mod document;
mod handle;
mod storage;
mod sweep;

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use serde::Serialize;

pub use document::JobDocument;
pub use handle::JobHandle;
pub use storage::JobStorage;
pub use sweep::{ReclaimReport, Reclaimed};

use crate::{
    clock::Clock,
    hashing::{JobId, Parameters},
    lock::DistributedLock,
    store::{self, encode, update_typed, Conditional, DocumentStore, InsertOutcome, WriteOutcome},
    wait::WaitPolicy,
    Error, Result,
};

pub const DEFAULT_HEARTBEAT_PERIOD: Duration = Duration::from_secs(60);

/// Five missed beats.
pub const DEFAULT_DEAD_AFTER: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatConfig {
    pub period: Duration,
    /// Default cutoff age for [`JobRegistry::reclaim_dead`].
    pub dead_after: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            period: DEFAULT_HEARTBEAT_PERIOD,
            dead_after: DEFAULT_DEAD_AFTER,
        }
    }
}

/// One row of [`JobRegistry::job_pulse`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PulseEntry {
    pub worker: String,
    pub job_id: JobId,
    pub last_beat: DateTime<Utc>,
}

/// Either way of naming a job to open.
#[derive(Debug, Clone, PartialEq)]
pub enum JobRef {
    Parameters(Parameters),
    Id(JobId),
}

impl From<Parameters> for JobRef {
    fn from(parameters: Parameters) -> Self {
        Self::Parameters(parameters)
    }
}

impl From<JobId> for JobRef {
    fn from(id: JobId) -> Self {
        Self::Id(id)
    }
}

#[derive(Debug, Clone)]
pub struct JobRegistry {
    store: Arc<dyn DocumentStore>,
    clock: Arc<dyn Clock>,
    lock: DistributedLock,
    storage: JobStorage,
    heartbeat: HeartbeatConfig,
    develop: bool,
}

impl JobRegistry {
    #[must_use]
    pub fn new(
        store: Arc<dyn DocumentStore>,
        clock: Arc<dyn Clock>,
        lock: DistributedLock,
        storage: JobStorage,
        heartbeat: HeartbeatConfig,
    ) -> Self {
        Self {
            store,
            clock,
            lock,
            storage,
            heartbeat,
            develop: false,
        }
    }

    /// Flag every job created through this registry as `develop`.
    #[must_use]
    pub fn with_develop(mut self, develop: bool) -> Self {
        self.develop = develop;
        self
    }

    #[must_use]
    pub const fn lock(&self) -> &DistributedLock {
        &self.lock
    }

    #[must_use]
    pub const fn storage(&self) -> &JobStorage {
        &self.storage
    }

    #[must_use]
    pub const fn heartbeat(&self) -> &HeartbeatConfig {
        &self.heartbeat
    }

    // ═══════════════════════════════════════════════════════════════════════
    // REGISTRATION
    // ═══════════════════════════════════════════════════════════════════════

    /// Insert the job document if absent. Returns the job id either way.
    pub async fn register(&self, parameters: &Parameters) -> Result<JobId> {
        let doc = JobDocument::new(parameters.clone(), self.develop, self.clock.now());
        let id = doc.id.clone();
        match self
            .store
            .insert(store::JOBS, id.as_str(), encode(&doc)?)
            .await?
        {
            InsertOutcome::Inserted(_) => {
                tracing::debug!(job_id = %id, develop = self.develop, "job registered");
            }
            InsertOutcome::AlreadyExists(_) => {}
        }
        Ok(id)
    }

    pub async fn register_many<'a, I>(&self, parameter_sets: I) -> Result<Vec<JobId>>
    where
        I: IntoIterator<Item = &'a Parameters> + Send,
        I::IntoIter: Send,
    {
        let mut ids = Vec::new();
        for parameters in parameter_sets {
            ids.push(self.register(parameters).await?);
        }
        Ok(ids)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // OPEN / REMOVE
    // ═══════════════════════════════════════════════════════════════════════

    /// Open a job by parameters (registering it) or by id.
    ///
    /// # Errors
    ///
    /// - `LockBusy` / `LockTimeout` from the job lock, per `wait`
    /// - `NotFound` when opened by an id with no document
    pub async fn open(&self, job: impl Into<JobRef> + Send, wait: WaitPolicy) -> Result<JobHandle> {
        let id = match job.into() {
            JobRef::Parameters(parameters) => self.register(&parameters).await?,
            JobRef::Id(id) => id,
        };
        self.open_by_id(&id, wait).await
    }

    pub async fn open_by_id(&self, id: &JobId, wait: WaitPolicy) -> Result<JobHandle> {
        handle::open(self.clone(), id, wait).await
    }

    pub async fn get(&self, id: &JobId) -> Result<Option<JobDocument>> {
        self.store
            .get(store::JOBS, id.as_str())
            .await?
            .map(|doc| doc.decode(store::JOBS))
            .transpose()
    }

    /// # Errors
    ///
    /// `NotFound` without a document, `CorruptedState` when the document
    /// has no parameters.
    pub async fn parameters_of(&self, id: &JobId) -> Result<Parameters> {
        let doc = self
            .get(id)
            .await?
            .ok_or_else(|| Error::not_found(format!("job {id}")))?;
        doc.parameters().cloned()
    }

    /// Remove a job: its filesystem areas first, then the document.
    ///
    /// Without `force` the job lock is taken non-blocking first and a
    /// cleanup failure aborts the removal. With `force` the lock is ignored
    /// and cleanup failures are logged.
    pub async fn remove(&self, id: &JobId, force: bool) -> Result<()> {
        let held = if force {
            None
        } else {
            Some(self.lock.acquire(id.as_str(), WaitPolicy::NonBlocking).await?)
        };
        let result = self.remove_held(id, force).await;
        if result.is_err() {
            if let Some(handle) = held {
                self.lock.release(handle).await?;
            }
        }
        result
    }

    /// Remove a job whose lock the caller already holds (or bypasses).
    pub(crate) async fn remove_held(&self, id: &JobId, force: bool) -> Result<()> {
        if let Err(e) = self.storage.remove(id).await {
            if !force {
                return Err(e);
            }
            tracing::warn!(job_id = %id, error = %e, "forced removal continues past cleanup failure");
        }
        match self.store.delete(store::JOBS, id.as_str(), None).await? {
            WriteOutcome::Applied(_) => {
                tracing::info!(job_id = %id, "job removed");
                Ok(())
            }
            WriteOutcome::Missing | WriteOutcome::Conflict => {
                Err(Error::not_found(format!("job {id}")))
            }
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // QUERIES
    // ═══════════════════════════════════════════════════════════════════════

    pub async fn list(&self) -> Result<Vec<JobDocument>> {
        self.store
            .list(store::JOBS)
            .await?
            .iter()
            .map(|doc| doc.decode(store::JOBS))
            .collect()
    }

    /// Ids of jobs whose parameters contain every key/value of `filter`.
    pub async fn find(&self, filter: &Parameters) -> Result<Vec<JobId>> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .filter(|doc| doc.matches(filter))
            .map(|doc| doc.id)
            .collect())
    }

    pub async fn active_job_ids(&self) -> Result<Vec<JobId>> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .filter(JobDocument::is_active)
            .map(|doc| doc.id)
            .collect())
    }

    pub async fn num_active_jobs(&self) -> Result<usize> {
        Ok(self.active_job_ids().await?.len())
    }

    /// Every `(worker, job, last beat)` in the store.
    pub async fn job_pulse(&self) -> Result<Vec<PulseEntry>> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .flat_map(|doc| {
                let job_id = doc.id;
                doc.pulse
                    .into_iter()
                    .map(move |(worker, last_beat)| PulseEntry {
                        worker,
                        job_id: job_id.clone(),
                        last_beat,
                    })
            })
            .collect())
    }

    /// Remove every job. Returns how many went.
    pub async fn clear(&self, force: bool) -> Result<usize> {
        self.remove_matching(force, |_| true).await
    }

    /// Remove every job flagged `develop`.
    pub async fn clear_develop(&self, force: bool) -> Result<usize> {
        self.remove_matching(force, |doc| doc.develop).await
    }

    async fn remove_matching<F>(&self, force: bool, keep: F) -> Result<usize>
    where
        F: Fn(&JobDocument) -> bool + Send,
    {
        let mut removed = 0;
        for doc in self.list().await? {
            if !keep(&doc) {
                continue;
            }
            match self.remove(&doc.id, force).await {
                Ok(()) => removed += 1,
                // Removed concurrently.
                Err(Error::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(removed)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // LIVENESS
    // ═══════════════════════════════════════════════════════════════════════

    /// Reclaim workers with no beat for longer than `cutoff`.
    pub async fn reclaim_dead(&self, cutoff: Duration) -> Result<ReclaimReport> {
        sweep::reclaim_dead(self.store.as_ref(), self.clock.as_ref(), cutoff).await
    }

    /// Add `worker` to `executing` and refresh its pulse.
    ///
    /// Returns whether the worker had to be re-added, `Err(NotFound)` when
    /// the document is gone.
    pub(crate) async fn beat(&self, id: &JobId, worker: &str) -> Result<bool> {
        let now = self.clock.now();
        let mut readded = false;
        let outcome = update_typed::<JobDocument, _>(
            self.store.as_ref(),
            store::JOBS,
            id.as_str(),
            |doc| {
                readded = doc.executing.insert(worker.to_owned());
                doc.pulse.insert(worker.to_owned(), now);
                true
            },
        )
        .await?;
        match outcome {
            Conditional::Applied(_) => Ok(readded),
            Conditional::Rejected(_) | Conditional::Missing => {
                Err(Error::not_found(format!("job {id}")))
            }
        }
    }

    /// Drop `worker` from `executing` and `pulse`.
    pub(crate) async fn leave(&self, id: &JobId, worker: &str) -> Result<()> {
        update_typed::<JobDocument, _>(self.store.as_ref(), store::JOBS, id.as_str(), |doc| {
            doc.forget_worker(worker)
        })
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration as ChronoDuration;
    use serde_json::json;

    use super::*;
    use crate::{
        clock::ManualClock,
        lock::LockConfig,
        store::MemoryStore,
    };

    pub(super) struct Fixture {
        pub registry: JobRegistry,
        pub clock: ManualClock,
        pub store: Arc<MemoryStore>,
        pub root: tempfile::TempDir,
    }

    pub(super) fn fixture() -> Result<Fixture> {
        let root = tempfile::tempdir()?;
        let store = Arc::new(MemoryStore::new());
        let clock = ManualClock::default();
        let shared: Arc<dyn Clock> = Arc::new(clock.clone());
        let lock = DistributedLock::new(
            store.clone(),
            shared.clone(),
            store::JOBS,
            LockConfig {
                lease: Duration::from_secs(180),
                poll_interval: Duration::from_millis(5),
            },
        );
        let storage = JobStorage::new(root.path().join("workspace"), root.path().join("storage"));
        let registry = JobRegistry::new(
            store.clone(),
            shared,
            lock,
            storage,
            HeartbeatConfig::default(),
        );
        Ok(Fixture {
            registry,
            clock,
            store,
            root,
        })
    }

    pub(super) fn params(value: serde_json::Value) -> Parameters {
        match value {
            serde_json::Value::Object(map) => map,
            other => panic!("not an object: {other}"),
        }
    }

    #[tokio::test]
    async fn test_register_is_idempotent() -> Result<()> {
        let fx = fixture()?;
        let first = fx.registry.register(&params(json!({"a": 1, "b": 2}))).await?;
        let second = fx.registry.register(&params(json!({"b": 2, "a": 1}))).await?;
        assert_eq!(first, second);
        assert_eq!(fx.registry.list().await?.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_parameters_of() -> Result<()> {
        let fx = fixture()?;
        let p = params(json!({"a": 1}));
        let id = fx.registry.register(&p).await?;
        assert_eq!(fx.registry.parameters_of(&id).await?, p);

        let ghost = JobId::from_parameters(&params(json!({"ghost": true})));
        assert!(matches!(
            fx.registry.parameters_of(&ghost).await,
            Err(Error::NotFound(_))
        ));

        fx.store
            .insert(store::JOBS, ghost.as_str(), json!({"_id": ghost.as_str()}))
            .await?;
        assert!(matches!(
            fx.registry.parameters_of(&ghost).await,
            Err(Error::CorruptedState { .. })
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_find_and_register_many() -> Result<()> {
        let fx = fixture()?;
        let sets: Vec<Parameters> = (0..4)
            .map(|n| params(json!({"n": n, "even": n % 2 == 0})))
            .collect();
        let ids = fx.registry.register_many(&sets).await?;
        assert_eq!(ids.len(), 4);

        let mut even = fx.registry.find(&params(json!({"even": true}))).await?;
        even.sort();
        let mut expected = vec![ids[0].clone(), ids[2].clone()];
        expected.sort();
        assert_eq!(even, expected);
        Ok(())
    }

    #[tokio::test]
    async fn test_remove_requires_lock_unless_forced() -> Result<()> {
        let fx = fixture()?;
        let handle = fx
            .registry
            .open(params(json!({"a": 1})), WaitPolicy::NonBlocking)
            .await?;
        let id = handle.id().clone();

        assert!(matches!(
            fx.registry.remove(&id, false).await,
            Err(Error::LockBusy { .. })
        ));
        fx.registry.remove(&id, true).await?;
        assert!(fx.registry.get(&id).await?.is_none());
        assert!(!fx.registry.storage().workspace_dir(&id).exists());
        Ok(())
    }

    #[tokio::test]
    async fn test_cleanup_failure_keeps_document_unless_forced() -> Result<()> {
        let fx = fixture()?;
        // A regular file as the workspace root makes every job's workspace
        // impossible to remove.
        let blocker = fx.root.path().join("blocked");
        tokio::fs::write(&blocker, b"").await?;
        let registry = JobRegistry::new(
            fx.store.clone(),
            Arc::new(fx.clock.clone()),
            fx.registry.lock().clone(),
            JobStorage::new(&blocker, fx.root.path().join("storage")),
            HeartbeatConfig::default(),
        );
        let id = registry.register(&params(json!({"a": 1}))).await?;

        assert!(matches!(
            registry.remove(&id, false).await,
            Err(Error::CleanupFailed { .. })
        ));
        let doc = registry.get(&id).await?;
        assert!(doc.is_some_and(|d| d.lock.is_none()));
        assert!(registry.lock().state(id.as_str()).await?.is_none());

        registry.remove(&id, true).await?;
        assert!(registry.get(&id).await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_remove_missing_job_is_not_found() -> Result<()> {
        let fx = fixture()?;
        let ghost = JobId::from_parameters(&params(json!({"ghost": true})));
        assert!(matches!(
            fx.registry.remove(&ghost, true).await,
            Err(Error::NotFound(_))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_clear_develop_only_touches_develop_jobs() -> Result<()> {
        let fx = fixture()?;
        fx.registry.register(&params(json!({"keep": 1}))).await?;
        let develop = fx.registry.clone().with_develop(true);
        develop.register(&params(json!({"scratch": 1}))).await?;
        develop.register(&params(json!({"scratch": 2}))).await?;

        assert_eq!(fx.registry.clear_develop(false).await?, 2);
        assert_eq!(fx.registry.list().await?.len(), 1);
        assert_eq!(fx.registry.clear(false).await?, 1);
        assert!(fx.registry.list().await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_active_jobs_and_pulse() -> Result<()> {
        let fx = fixture()?;
        fx.registry.register(&params(json!({"idle": 1}))).await?;
        let handle = fx
            .registry
            .open(params(json!({"busy": 1})), WaitPolicy::NonBlocking)
            .await?;

        assert_eq!(fx.registry.active_job_ids().await?, vec![handle.id().clone()]);
        assert_eq!(fx.registry.num_active_jobs().await?, 1);
        let pulse = fx.registry.job_pulse().await?;
        assert_eq!(pulse.len(), 1);
        assert_eq!(pulse[0].worker, handle.worker());

        handle.close().await?;
        assert_eq!(fx.registry.num_active_jobs().await?, 0);
        assert!(fx.registry.job_pulse().await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_reclaim_dead_uses_cutoff() -> Result<()> {
        let fx = fixture()?;
        let id = fx.registry.register(&params(json!({"a": 1}))).await?;
        let now = fx.clock.now();
        update_typed::<JobDocument, _>(fx.store.as_ref(), store::JOBS, id.as_str(), |doc| {
            doc.executing.extend(["dead".to_owned(), "alive".to_owned()]);
            doc.pulse.insert("dead".to_owned(), now - ChronoDuration::seconds(301));
            doc.pulse.insert("alive".to_owned(), now - ChronoDuration::seconds(100));
            true
        })
        .await?;

        let report = fx.registry.reclaim_dead(Duration::from_secs(300)).await?;
        assert_eq!(report.reclaimed.len(), 1);
        assert_eq!(report.reclaimed[0].worker, "dead");

        let doc = fx.registry.get(&id).await?;
        let executing: Vec<String> = doc.map(|d| d.executing.into_iter().collect()).unwrap_or_default();
        assert_eq!(executing, vec!["alive".to_owned()]);
        Ok(())
    }
}
