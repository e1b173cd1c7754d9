//! FIFO task queue over single-document updates.
//!
//! One document per task, keyed by fingerprint, so "is this task already
//! queued" is answered by the store's insert-if-absent. Order comes from a
//! sequence counter kept in its own document and bumped by compare-and-set.
//!
//! Lifecycle of an entry:
//!
//! ```text
//! put ──► pending ──get──► claimed ──task_done──► done
//!            ▲                │  │
//!            └─ requeue_stale ┘  └─ task_done with `requeue` set ─► pending
//! ```

#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::panic))]

use std::{collections::BTreeSet, str::FromStr, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{
    clock::{to_chrono, Clock},
    error::DuplicateStage,
    hashing::Fingerprint,
    store::{self, encode, update_where, Conditional, Document, DocumentStore, InsertOutcome, WriteOutcome},
    wait::{Deadline, WaitPolicy},
    Error, Result,
};

/// Id of the sequence counter document in the meta collection.
const SEQUENCE_DOC: &str = "sequence";

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueStatus {
    Pending,
    Claimed,
    Done,
}

impl QueueStatus {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Claimed => "claimed",
            Self::Done => "done",
        }
    }
}

impl FromStr for QueueStatus {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "claimed" => Ok(Self::Claimed),
            "done" => Ok(Self::Done),
            _ => Err(Error::InvalidConfig(format!("Invalid queue status: {s}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub fingerprint: Fingerprint,
    pub payload: Value,
    pub sequence: u64,
    pub status: QueueStatus,
    pub enqueued_at: DateTime<Utc>,
    #[serde(default)]
    pub claimed_by: Option<String>,
    #[serde(default)]
    pub claimed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub attempts: u32,
    /// Set by a forced resubmission while the entry was claimed.
    #[serde(default)]
    pub requeue: bool,
}

impl QueueEntry {
    fn pending(fingerprint: Fingerprint, payload: Value, sequence: u64, now: DateTime<Utc>) -> Self {
        Self {
            fingerprint,
            payload,
            sequence,
            status: QueueStatus::Pending,
            enqueued_at: now,
            claimed_by: None,
            claimed_at: None,
            attempts: 0,
            requeue: false,
        }
    }

    fn reset_to_pending(&mut self, sequence: u64, now: DateTime<Utc>) {
        self.sequence = sequence;
        self.status = QueueStatus::Pending;
        self.enqueued_at = now;
        self.claimed_by = None;
        self.claimed_at = None;
        self.requeue = false;
    }
}

/// What a forced put did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    /// A new pending entry with this sequence.
    Enqueued { sequence: u64 },
    /// The entry was still pending; its payload was replaced in place.
    Refreshed,
    /// The entry is claimed; it returns to pending when acknowledged.
    RequeueScheduled,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub total: usize,
    pub pending: usize,
    pub claimed: usize,
    pub done: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueConfig {
    pub poll_interval: Duration,
    /// Delete entries on acknowledgement instead of marking them done.
    pub remove_done: bool,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            remove_done: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TaskQueue {
    store: Arc<dyn DocumentStore>,
    clock: Arc<dyn Clock>,
    config: QueueConfig,
    /// Identity written into `claimed_by` by this handle.
    consumer: String,
}

impl TaskQueue {
    #[must_use]
    pub fn new(store: Arc<dyn DocumentStore>, clock: Arc<dyn Clock>, config: QueueConfig) -> Self {
        Self {
            store,
            clock,
            config,
            consumer: Uuid::new_v4().to_string(),
        }
    }

    /// Same queue, claiming under another consumer id.
    #[must_use]
    pub fn for_consumer(&self, consumer: impl Into<String>) -> Self {
        Self {
            consumer: consumer.into(),
            ..self.clone()
        }
    }

    #[must_use]
    pub fn consumer(&self) -> &str {
        &self.consumer
    }

    #[must_use]
    pub const fn config(&self) -> &QueueConfig {
        &self.config
    }

    // ═══════════════════════════════════════════════════════════════════════
    // PRODUCER SIDE
    // ═══════════════════════════════════════════════════════════════════════

    /// Append a task. Returns its sequence number.
    ///
    /// # Errors
    ///
    /// `DuplicateSubmission` when the fingerprint is pending (`Queued`) or
    /// claimed (`InFlight`). A `done` entry is reset to pending instead.
    pub async fn put(&self, fingerprint: &Fingerprint, payload: Value) -> Result<u64> {
        loop {
            let sequence = self.next_sequence().await?;
            let now = self.clock.now();
            let entry = QueueEntry::pending(fingerprint.clone(), payload.clone(), sequence, now);

            let existing = match self
                .store
                .insert(store::QUEUE, fingerprint.as_str(), encode(&entry)?)
                .await?
            {
                InsertOutcome::Inserted(_) => {
                    tracing::debug!(%fingerprint, sequence, "task enqueued");
                    return Ok(sequence);
                }
                InsertOutcome::AlreadyExists(doc) => decode_entry(&doc)?,
            };

            match existing.status {
                QueueStatus::Pending => return Err(duplicate(fingerprint, DuplicateStage::Queued)),
                QueueStatus::Claimed => return Err(duplicate(fingerprint, DuplicateStage::InFlight)),
                QueueStatus::Done => {
                    let applied = self
                        .modify(fingerprint, |current| {
                            if current.status != QueueStatus::Done {
                                return false;
                            }
                            current.payload = payload.clone();
                            current.attempts = 0;
                            current.reset_to_pending(sequence, now);
                            true
                        })
                        .await?;
                    if applied.is_applied() {
                        tracing::debug!(%fingerprint, sequence, "finished task enqueued again");
                        return Ok(sequence);
                    }
                    // Changed under us (claimed, deleted, re-put): judge again.
                }
            }
        }
    }

    /// Put without duplicate checks.
    pub async fn put_forced(&self, fingerprint: &Fingerprint, payload: Value) -> Result<PutOutcome> {
        loop {
            let Some(doc) = self.store.get(store::QUEUE, fingerprint.as_str()).await? else {
                match self.put(fingerprint, payload.clone()).await {
                    Ok(sequence) => return Ok(PutOutcome::Enqueued { sequence }),
                    Err(Error::DuplicateSubmission { .. }) => continue,
                    Err(e) => return Err(e),
                }
            };
            let status = decode_entry(&doc)?.status;

            let outcome = match status {
                QueueStatus::Pending => PutOutcome::Refreshed,
                QueueStatus::Claimed => PutOutcome::RequeueScheduled,
                QueueStatus::Done => {
                    match self.put(fingerprint, payload.clone()).await {
                        Ok(sequence) => return Ok(PutOutcome::Enqueued { sequence }),
                        Err(Error::DuplicateSubmission { .. }) => continue,
                        Err(e) => return Err(e),
                    }
                }
            };

            let applied = self
                .modify(fingerprint, |current| {
                    if current.status != status {
                        return false;
                    }
                    current.payload = payload.clone();
                    if status == QueueStatus::Claimed {
                        current.requeue = true;
                    }
                    true
                })
                .await?;
            if applied.is_applied() {
                tracing::debug!(%fingerprint, ?outcome, "forced resubmission");
                return Ok(outcome);
            }
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // CONSUMER SIDE
    // ═══════════════════════════════════════════════════════════════════════

    /// Claim the lowest-sequence pending entry.
    ///
    /// # Errors
    ///
    /// `Empty` when nothing became ready within the wait policy.
    pub async fn get(&self, wait: WaitPolicy) -> Result<QueueEntry> {
        self.get_inner(wait, None).await
    }

    pub async fn get_cancellable(
        &self,
        wait: WaitPolicy,
        cancel: &CancellationToken,
    ) -> Result<QueueEntry> {
        self.get_inner(wait, Some(cancel)).await
    }

    async fn get_inner(
        &self,
        wait: WaitPolicy,
        cancel: Option<&CancellationToken>,
    ) -> Result<QueueEntry> {
        let deadline = Deadline::start(wait);
        loop {
            if let Some(entry) = self.try_claim().await? {
                return Ok(entry);
            }
            if !deadline.pause(self.config.poll_interval, cancel).await? {
                return Err(Error::Empty);
            }
        }
    }

    /// One claim attempt over the current pending entries.
    pub async fn try_claim(&self) -> Result<Option<QueueEntry>> {
        let mut pending: Vec<QueueEntry> = self
            .entries()
            .await?
            .into_iter()
            .filter(|e| e.status == QueueStatus::Pending)
            .collect();
        pending.sort_by_key(|e| e.sequence);

        for candidate in pending {
            let now = self.clock.now();
            let outcome = self
                .modify(&candidate.fingerprint, |current| {
                    if current.status != QueueStatus::Pending || current.sequence != candidate.sequence {
                        return false;
                    }
                    current.status = QueueStatus::Claimed;
                    current.claimed_by = Some(self.consumer.clone());
                    current.claimed_at = Some(now);
                    current.attempts = current.attempts.saturating_add(1);
                    true
                })
                .await?;
            if let Conditional::Applied(doc) = outcome {
                let entry = decode_entry(&doc)?;
                tracing::debug!(
                    fingerprint = %entry.fingerprint,
                    sequence = entry.sequence,
                    consumer = %self.consumer,
                    "task claimed"
                );
                return Ok(Some(entry));
            }
        }
        Ok(None)
    }

    /// Acknowledge a claimed entry.
    ///
    /// Returns `false` when the entry is no longer held by this claim, e.g.
    /// it was requeued as stale and claimed by someone else.
    pub async fn task_done(&self, entry: &QueueEntry) -> Result<bool> {
        self.finish(&entry.fingerprint, entry.claimed_by.as_deref()).await
    }

    /// Acknowledge the claim of `fingerprint` whoever holds it.
    pub async fn complete(&self, fingerprint: &Fingerprint) -> Result<bool> {
        self.finish(fingerprint, None).await
    }

    async fn finish(&self, fingerprint: &Fingerprint, claimant: Option<&str>) -> Result<bool> {
        loop {
            let Some(doc) = self.store.get(store::QUEUE, fingerprint.as_str()).await? else {
                return Ok(false);
            };
            let mut entry = decode_entry(&doc)?;
            let held = entry.status == QueueStatus::Claimed
                && claimant.map_or(true, |c| entry.claimed_by.as_deref() == Some(c));
            if !held {
                return Ok(false);
            }

            let outcome = if entry.requeue {
                let sequence = self.next_sequence().await?;
                entry.reset_to_pending(sequence, self.clock.now());
                self.store
                    .replace(store::QUEUE, &doc.id, doc.revision, encode(&entry)?)
                    .await?
            } else if self.config.remove_done {
                self.store
                    .delete(store::QUEUE, &doc.id, Some(doc.revision))
                    .await?
            } else {
                entry.status = QueueStatus::Done;
                self.store
                    .replace(store::QUEUE, &doc.id, doc.revision, encode(&entry)?)
                    .await?
            };

            match outcome {
                WriteOutcome::Applied(_) => {
                    tracing::debug!(
                        %fingerprint,
                        requeued = entry.status == QueueStatus::Pending,
                        "task acknowledged"
                    );
                    return Ok(true);
                }
                WriteOutcome::Missing => return Ok(false),
                WriteOutcome::Conflict => tokio::task::yield_now().await,
            }
        }
    }

    /// Give a claim back without completing it. The entry keeps its place in
    /// line. `false` when this claim no longer holds it.
    pub async fn release(&self, entry: &QueueEntry) -> Result<bool> {
        let claimant = entry.claimed_by.clone();
        let outcome = self
            .modify(&entry.fingerprint, |current| {
                if current.status != QueueStatus::Claimed || current.claimed_by != claimant {
                    return false;
                }
                current.status = QueueStatus::Pending;
                current.claimed_by = None;
                current.claimed_at = None;
                current.requeue = false;
                true
            })
            .await?;
        Ok(outcome.is_applied())
    }

    /// Give a claim back and send the entry to the end of the line, so a
    /// task that cannot run yet does not block the ones behind it.
    pub async fn defer(&self, entry: &QueueEntry) -> Result<bool> {
        let claimant = entry.claimed_by.clone();
        let sequence = self.next_sequence().await?;
        let now = self.clock.now();
        let outcome = self
            .modify(&entry.fingerprint, |current| {
                if current.status != QueueStatus::Claimed || current.claimed_by != claimant {
                    return false;
                }
                current.reset_to_pending(sequence, now);
                true
            })
            .await?;
        Ok(outcome.is_applied())
    }

    /// Refresh `claimed_at` while the claim is still ours, so a long-running
    /// task is not mistaken for an abandoned one.
    pub async fn touch_claim(&self, entry: &QueueEntry) -> Result<bool> {
        let claimant = entry.claimed_by.clone();
        let now = self.clock.now();
        let outcome = self
            .modify(&entry.fingerprint, |current| {
                if current.status != QueueStatus::Claimed || current.claimed_by != claimant {
                    return false;
                }
                current.claimed_at = Some(now);
                true
            })
            .await?;
        Ok(outcome.is_applied())
    }

    /// Wait until no entry is pending or claimed. `false` on timeout.
    pub async fn join(&self, wait: WaitPolicy) -> Result<bool> {
        self.join_inner(wait, None).await
    }

    pub async fn join_cancellable(&self, wait: WaitPolicy, cancel: &CancellationToken) -> Result<bool> {
        self.join_inner(wait, Some(cancel)).await
    }

    async fn join_inner(&self, wait: WaitPolicy, cancel: Option<&CancellationToken>) -> Result<bool> {
        let deadline = Deadline::start(wait);
        loop {
            let stats = self.stats().await?;
            if stats.pending == 0 && stats.claimed == 0 {
                return Ok(true);
            }
            if !deadline.pause(self.config.poll_interval, cancel).await? {
                return Ok(false);
            }
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // MAINTENANCE
    // ═══════════════════════════════════════════════════════════════════════

    /// Return claims older than `cutoff` to pending, keeping their place in
    /// line.
    pub async fn requeue_stale(&self, cutoff: Duration) -> Result<Vec<Fingerprint>> {
        self.requeue_stale_skipping(cutoff, &BTreeSet::new()).await
    }

    /// Like [`Self::requeue_stale`], leaving claims on `live` fingerprints
    /// alone.
    pub async fn requeue_stale_skipping(
        &self,
        cutoff: Duration,
        live: &BTreeSet<Fingerprint>,
    ) -> Result<Vec<Fingerprint>> {
        let now = self.clock.now();
        let cutoff = to_chrono(cutoff);
        let mut requeued = Vec::new();

        for entry in self.entries().await? {
            let Some(claimed_at) = entry.claimed_at else {
                continue;
            };
            if entry.status != QueueStatus::Claimed || now.signed_duration_since(claimed_at) <= cutoff {
                continue;
            }
            if live.contains(&entry.fingerprint) {
                tracing::debug!(fingerprint = %entry.fingerprint, "old claim still in flight, kept");
                continue;
            }
            let outcome = self
                .modify(&entry.fingerprint, |current| {
                    if current.status != QueueStatus::Claimed || current.claimed_at != Some(claimed_at) {
                        return false;
                    }
                    current.status = QueueStatus::Pending;
                    current.claimed_by = None;
                    current.claimed_at = None;
                    true
                })
                .await?;
            if outcome.is_applied() {
                tracing::warn!(
                    fingerprint = %entry.fingerprint,
                    claimed_by = ?entry.claimed_by,
                    "requeued stale claim"
                );
                requeued.push(entry.fingerprint);
            }
        }
        Ok(requeued)
    }

    pub async fn stats(&self) -> Result<QueueStats> {
        Ok(self
            .entries()
            .await?
            .iter()
            .fold(QueueStats::default(), |mut stats, entry| {
                stats.total += 1;
                match entry.status {
                    QueueStatus::Pending => stats.pending += 1,
                    QueueStatus::Claimed => stats.claimed += 1,
                    QueueStatus::Done => stats.done += 1,
                }
                stats
            }))
    }

    /// Delete every `done` entry. Returns how many went.
    pub async fn purge_done(&self) -> Result<usize> {
        let mut purged = 0;
        for doc in self.store.list(store::QUEUE).await? {
            if decode_entry(&doc)?.status != QueueStatus::Done {
                continue;
            }
            let outcome = self
                .store
                .delete(store::QUEUE, &doc.id, Some(doc.revision))
                .await?;
            if matches!(outcome, WriteOutcome::Applied(_)) {
                purged += 1;
            }
        }
        Ok(purged)
    }

    pub async fn entry(&self, fingerprint: &Fingerprint) -> Result<Option<QueueEntry>> {
        self.store
            .get(store::QUEUE, fingerprint.as_str())
            .await?
            .map(|doc| decode_entry(&doc))
            .transpose()
    }

    pub async fn entries(&self) -> Result<Vec<QueueEntry>> {
        self.store
            .list(store::QUEUE)
            .await?
            .iter()
            .map(decode_entry)
            .collect()
    }

    // ═══════════════════════════════════════════════════════════════════════
    // INTERNALS
    // ═══════════════════════════════════════════════════════════════════════

    async fn modify<F>(&self, fingerprint: &Fingerprint, mut apply: F) -> Result<Conditional>
    where
        F: FnMut(&mut QueueEntry) -> bool + Send,
    {
        let id = fingerprint.as_str();
        update_where(self.store.as_ref(), store::QUEUE, id, |body| {
            let mut entry: QueueEntry = serde_json::from_value(body.clone())
                .map_err(|e| Error::corrupted(store::QUEUE, id, e.to_string()))?;
            if apply(&mut entry) {
                encode(&entry).map(Some)
            } else {
                Ok(None)
            }
        })
        .await
    }

    /// Allocate the next sequence number.
    async fn next_sequence(&self) -> Result<u64> {
        loop {
            let mut allocated = 0;
            let outcome = update_where(self.store.as_ref(), store::QUEUE_META, SEQUENCE_DOC, |body| {
                let last = body.get("last").and_then(Value::as_u64).ok_or_else(|| {
                    Error::corrupted(store::QUEUE_META, SEQUENCE_DOC, "missing 'last' counter")
                })?;
                allocated = last.saturating_add(1);
                Ok(Some(json!({ "last": allocated })))
            })
            .await?;
            match outcome {
                Conditional::Applied(_) => return Ok(allocated),
                Conditional::Rejected(_) => {
                    return Err(Error::store("sequence counter update was rejected"));
                }
                Conditional::Missing => {
                    // First use: create the counter; losing the race is fine.
                    self.store
                        .insert(store::QUEUE_META, SEQUENCE_DOC, json!({ "last": 0 }))
                        .await?;
                }
            }
        }
    }
}

fn decode_entry(doc: &Document) -> Result<QueueEntry> {
    doc.decode(store::QUEUE)
}

fn duplicate(fingerprint: &Fingerprint, stage: DuplicateStage) -> Error {
    tracing::debug!(%fingerprint, %stage, "duplicate submission");
    Error::DuplicateSubmission {
        fingerprint: fingerprint.to_string(),
        stage,
    }
}
