//! Task submission with in-flight deduplication, and result records.
//!
//! A task is identified by its [`Fingerprint`]. Submission is refused twice
//! over: once if a worker currently has the fingerprint checked out (the
//! fingerprint set), and once if the queue already holds it pending. The two
//! refusals carry different [`DuplicateStage`]s.

#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::panic))]

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
    time::Duration,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::{
    clock::Clock,
    error::DuplicateStage,
    fingerprint_set::FingerprintSet,
    hashing::Fingerprint,
    queue::{PutOutcome, TaskQueue},
    store::{self, encode, DocumentStore, InsertOutcome, WriteOutcome},
    wait::{Deadline, WaitPolicy},
    Error, Result,
};

/// A task reference plus its arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskCall {
    pub task: String,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: BTreeMap<String, Value>,
}

impl TaskCall {
    #[must_use]
    pub fn new(task: impl Into<String>) -> Self {
        Self {
            task: task.into(),
            args: Vec::new(),
            kwargs: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.args.push(value.into());
        self
    }

    #[must_use]
    pub fn kwarg(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.kwargs.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::of(&self.task, &self.args, &self.kwargs)
    }
}

/// Terminal outcome of one execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Outcome {
    Value { value: Value },
    Failure { message: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRecord {
    pub fingerprint: Fingerprint,
    pub outcome: Outcome,
    pub worker: String,
    pub finished_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct Executor {
    store: Arc<dyn DocumentStore>,
    clock: Arc<dyn Clock>,
    queue: TaskQueue,
    fetched: FingerprintSet,
}

impl Executor {
    #[must_use]
    pub fn new(
        store: Arc<dyn DocumentStore>,
        clock: Arc<dyn Clock>,
        queue: TaskQueue,
        fetched: FingerprintSet,
    ) -> Self {
        Self {
            store,
            clock,
            queue,
            fetched,
        }
    }

    #[must_use]
    pub const fn queue(&self) -> &TaskQueue {
        &self.queue
    }

    #[must_use]
    pub const fn fetched_set(&self) -> &FingerprintSet {
        &self.fetched
    }

    /// Queue a task unless it is already in flight or queued.
    ///
    /// # Errors
    ///
    /// `DuplicateSubmission` with stage `InFlight` when a worker holds the
    /// fingerprint, `Queued` when it is waiting in the queue.
    pub async fn submit(&self, call: &TaskCall) -> Result<Fingerprint> {
        let fingerprint = call.fingerprint();
        if self.fetched.contains(&fingerprint).await? {
            tracing::debug!(%fingerprint, task = %call.task, "submit refused, task in flight");
            return Err(Error::DuplicateSubmission {
                fingerprint: fingerprint.to_string(),
                stage: DuplicateStage::InFlight,
            });
        }
        self.queue.put(&fingerprint, encode(call)?).await?;
        tracing::info!(%fingerprint, task = %call.task, "task submitted");
        Ok(fingerprint)
    }

    /// Queue a task bypassing both duplicate checks.
    pub async fn resubmit(&self, call: &TaskCall) -> Result<(Fingerprint, PutOutcome)> {
        let fingerprint = call.fingerprint();
        let outcome = self.queue.put_forced(&fingerprint, encode(call)?).await?;
        tracing::info!(%fingerprint, task = %call.task, ?outcome, "task resubmitted");
        Ok((fingerprint, outcome))
    }

    pub async fn result(&self, fingerprint: &Fingerprint) -> Result<Option<ResultRecord>> {
        self.store
            .get(store::QUEUE_RESULTS, fingerprint.as_str())
            .await?
            .map(|doc| doc.decode(store::QUEUE_RESULTS))
            .transpose()
    }

    /// Poll for a result. `None` when the wait policy runs out first.
    pub async fn wait_for_result(
        &self,
        fingerprint: &Fingerprint,
        wait: WaitPolicy,
    ) -> Result<Option<ResultRecord>> {
        self.wait_for_result_inner(fingerprint, wait, None).await
    }

    pub async fn wait_for_result_cancellable(
        &self,
        fingerprint: &Fingerprint,
        wait: WaitPolicy,
        cancel: &CancellationToken,
    ) -> Result<Option<ResultRecord>> {
        self.wait_for_result_inner(fingerprint, wait, Some(cancel))
            .await
    }

    async fn wait_for_result_inner(
        &self,
        fingerprint: &Fingerprint,
        wait: WaitPolicy,
        cancel: Option<&CancellationToken>,
    ) -> Result<Option<ResultRecord>> {
        let deadline = Deadline::start(wait);
        loop {
            if let Some(record) = self.result(fingerprint).await? {
                return Ok(Some(record));
            }
            if !deadline.pause(self.queue.config().poll_interval, cancel).await? {
                return Ok(None);
            }
        }
    }

    /// Store the outcome of an execution, replacing an older one.
    pub async fn record_result(
        &self,
        fingerprint: &Fingerprint,
        outcome: Outcome,
        worker: &str,
    ) -> Result<ResultRecord> {
        let record = ResultRecord {
            fingerprint: fingerprint.clone(),
            outcome,
            worker: worker.to_owned(),
            finished_at: self.clock.now(),
        };
        let body = encode(&record)?;
        loop {
            let existing = match self
                .store
                .insert(store::QUEUE_RESULTS, fingerprint.as_str(), body.clone())
                .await?
            {
                InsertOutcome::Inserted(_) => return Ok(record),
                InsertOutcome::AlreadyExists(doc) => doc,
            };
            match self
                .store
                .replace(store::QUEUE_RESULTS, &existing.id, existing.revision, body.clone())
                .await?
            {
                WriteOutcome::Applied(_) => return Ok(record),
                WriteOutcome::Conflict | WriteOutcome::Missing => tokio::task::yield_now().await,
            }
        }
    }

    /// Manual acknowledgement of a fetched task: drop it from the in-flight
    /// set and complete its queue entry.
    pub async fn fetched_task_done(&self, call: &TaskCall) -> Result<()> {
        let fingerprint = call.fingerprint();
        self.fetched.remove(&fingerprint).await?;
        self.queue.complete(&fingerprint).await?;
        Ok(())
    }

    /// Recover from crashed workers: drop fingerprints nobody touched within
    /// `cutoff` and put stale claims back in line. A claim whose fingerprint
    /// survived the first step belongs to a live worker and stays claimed.
    pub async fn sweep_stale(&self, cutoff: Duration) -> Result<SweepStale> {
        let fingerprints = self.fetched.sweep_stale(cutoff).await?;
        let live: BTreeSet<Fingerprint> = self
            .fetched
            .members()
            .await?
            .into_iter()
            .map(|entry| entry.fingerprint)
            .collect();
        let requeued = self.queue.requeue_stale_skipping(cutoff, &live).await?;
        Ok(SweepStale {
            fingerprints,
            requeued,
        })
    }
}

/// What [`Executor::sweep_stale`] cleaned up.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepStale {
    pub fingerprints: Vec<Fingerprint>,
    pub requeued: Vec<Fingerprint>,
}
