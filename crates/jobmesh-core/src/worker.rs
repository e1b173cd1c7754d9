//! Worker loop: claim, mark in flight, execute, record, acknowledge.
//!
//! WHEN cancelled in the middle of a task, the worker gives the claim back
//! and drops the fingerprint from the in-flight set so another worker picks
//! the task up without waiting for a stale-claim sweep.

#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::panic))]

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{
    executor::{Executor, Outcome, ResultRecord, TaskCall},
    queue::{QueueEntry, TaskQueue},
    wait::WaitPolicy,
    Error, Result,
};

/// Default period between fingerprint and claim touches while a task runs.
pub const DEFAULT_TOUCH_PERIOD: Duration = Duration::from_secs(60);

/// Executes task calls. Errors become failure records, not worker errors.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn call(&self, call: &TaskCall) -> anyhow::Result<Value>;
}

/// Counters returned when [`Worker::run`] stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WorkerStats {
    pub processed: usize,
    pub failed: usize,
}

#[derive(Debug)]
pub struct Worker<H> {
    id: String,
    executor: Executor,
    queue: TaskQueue,
    handler: Arc<H>,
    touch_period: Duration,
}

impl<H: TaskHandler> Worker<H> {
    #[must_use]
    pub fn new(executor: Executor, handler: H, touch_period: Duration) -> Self {
        let id = Uuid::new_v4().to_string();
        let queue = executor.queue().for_consumer(id.clone());
        Self {
            id,
            executor,
            queue,
            handler: Arc::new(handler),
            touch_period,
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Process at most one task. `Ok(None)` when nothing was ready within
    /// `wait`, or the claimed task turned out to be in flight elsewhere.
    pub async fn run_once(&self, wait: WaitPolicy) -> Result<Option<ResultRecord>> {
        self.process(wait, &CancellationToken::new()).await
    }

    /// Process tasks until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) -> Result<WorkerStats> {
        let mut stats = WorkerStats::default();
        tracing::info!(worker = %self.id, "worker started");
        loop {
            match self.process(WaitPolicy::Forever, &cancel).await {
                Ok(Some(record)) => {
                    stats.processed += 1;
                    if matches!(record.outcome, Outcome::Failure { .. }) {
                        stats.failed += 1;
                    }
                }
                Ok(None) => {
                    tokio::select! {
                        () = cancel.cancelled() => break,
                        () = tokio::time::sleep(self.queue.config().poll_interval) => {}
                    }
                }
                Err(Error::Cancelled) => break,
                Err(e) => {
                    tracing::error!(worker = %self.id, error = %e, "worker stopped");
                    return Err(e);
                }
            }
        }
        tracing::info!(
            worker = %self.id,
            processed = stats.processed,
            failed = stats.failed,
            "worker shut down"
        );
        Ok(stats)
    }

    async fn process(
        &self,
        wait: WaitPolicy,
        cancel: &CancellationToken,
    ) -> Result<Option<ResultRecord>> {
        let entry = match self.queue.get_cancellable(wait, cancel).await {
            Ok(entry) => entry,
            Err(Error::Empty) => return Ok(None),
            Err(e) => return Err(e),
        };
        let fingerprint = entry.fingerprint.clone();
        let fetched = self.executor.fetched_set();

        match fetched.add(&fingerprint, &self.id).await {
            Ok(()) => {}
            Err(Error::DuplicateSubmission { .. }) => {
                tracing::debug!(worker = %self.id, %fingerprint, "task in flight elsewhere, deferring");
                self.queue.defer(&entry).await?;
                return Ok(None);
            }
            Err(e) => {
                self.queue.release(&entry).await?;
                return Err(e);
            }
        }

        let Some(outcome) = self.execute(&entry, cancel).await else {
            tracing::info!(worker = %self.id, %fingerprint, "cancelled mid-task, releasing claim");
            self.queue.release(&entry).await?;
            fetched.remove(&fingerprint).await?;
            return Err(Error::Cancelled);
        };

        let record = self
            .executor
            .record_result(&fingerprint, outcome, &self.id)
            .await?;
        fetched.remove(&fingerprint).await?;
        if !self.queue.task_done(&entry).await? {
            tracing::warn!(worker = %self.id, %fingerprint, "claim was lost before acknowledgement");
        }
        Ok(Some(record))
    }

    /// Run the handler, touching the fingerprint and the claim every period.
    /// `None` when cancelled first.
    async fn execute(&self, entry: &QueueEntry, cancel: &CancellationToken) -> Option<Outcome> {
        let call: TaskCall = match serde_json::from_value(entry.payload.clone()) {
            Ok(call) => call,
            Err(e) => {
                tracing::error!(fingerprint = %entry.fingerprint, error = %e, "unreadable task payload");
                return Some(Outcome::Failure {
                    message: format!("unreadable task payload: {e}"),
                });
            }
        };

        let fetched = self.executor.fetched_set();
        let mut work = self.handler.call(&call);
        let mut ticker = tokio::time::interval(self.touch_period);
        ticker.tick().await;

        let result = loop {
            tokio::select! {
                result = &mut work => break result,
                () = cancel.cancelled() => return None,
                _ = ticker.tick() => {
                    if let Err(e) = fetched.touch(&entry.fingerprint).await {
                        tracing::warn!(fingerprint = %entry.fingerprint, error = %e, "failed to touch in-flight fingerprint");
                    }
                    match self.queue.touch_claim(entry).await {
                        Ok(true) => {}
                        Ok(false) => tracing::warn!(worker = %self.id, fingerprint = %entry.fingerprint, "claim no longer held while running"),
                        Err(e) => tracing::warn!(fingerprint = %entry.fingerprint, error = %e, "failed to touch claim"),
                    }
                }
            }
        };

        Some(match result {
            Ok(value) => {
                tracing::debug!(
                    worker = %self.id,
                    fingerprint = %entry.fingerprint,
                    task = %call.task,
                    "task finished"
                );
                Outcome::Value { value }
            }
            Err(e) => {
                let message = format!("{e:#}");
                tracing::warn!(
                    worker = %self.id,
                    fingerprint = %entry.fingerprint,
                    task = %call.task,
                    error = %message,
                    "task failed"
                );
                Outcome::Failure { message }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use chrono::Duration as ChronoDuration;
    use serde_json::json;
    use tokio::sync::Notify;

    use super::*;
    use crate::{
        clock::{Clock, ManualClock, SystemClock},
        fingerprint_set::FingerprintSet,
        queue::{QueueConfig, QueueStatus},
        store::{DocumentStore, MemoryStore},
    };

    struct Square;

    #[async_trait]
    impl TaskHandler for Square {
        async fn call(&self, call: &TaskCall) -> anyhow::Result<Value> {
            let n = call
                .args
                .first()
                .and_then(Value::as_i64)
                .ok_or_else(|| anyhow::anyhow!("expected an integer argument"))?;
            Ok(json!(n * n))
        }
    }

    struct Stuck {
        started: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl TaskHandler for Stuck {
        async fn call(&self, _call: &TaskCall) -> anyhow::Result<Value> {
            self.started.fetch_add(1, Ordering::SeqCst);
            std::future::pending::<()>().await;
            Ok(Value::Null)
        }
    }

    /// Counts runs and blocks until the gate opens.
    struct Gated {
        runs: Arc<AtomicUsize>,
        gate: Arc<Notify>,
    }

    #[async_trait]
    impl TaskHandler for Gated {
        async fn call(&self, _call: &TaskCall) -> anyhow::Result<Value> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            self.gate.notified().await;
            Ok(json!("finished"))
        }
    }

    fn executor() -> Executor {
        executor_on(Arc::new(SystemClock))
    }

    fn executor_on(clock: Arc<dyn Clock>) -> Executor {
        let store: Arc<dyn DocumentStore> = Arc::new(MemoryStore::new());
        let queue = TaskQueue::new(
            store.clone(),
            clock.clone(),
            QueueConfig {
                poll_interval: Duration::from_millis(5),
                remove_done: false,
            },
        );
        let fetched = FingerprintSet::new(store.clone(), clock.clone());
        Executor::new(store, clock, queue, fetched)
    }

    #[tokio::test]
    async fn test_run_once_executes_and_acknowledges() -> Result<()> {
        let executor = executor();
        let call = TaskCall::new("square").arg(7);
        let fp = executor.submit(&call).await?;

        let worker = Worker::new(executor.clone(), Square, DEFAULT_TOUCH_PERIOD);
        let record = worker.run_once(WaitPolicy::NonBlocking).await?;
        assert_eq!(record.map(|r| r.outcome), Some(Outcome::Value { value: json!(49) }));

        assert!(!executor.fetched_set().contains(&fp).await?);
        let entry = executor.queue().entry(&fp).await?;
        assert_eq!(entry.map(|e| e.status), Some(QueueStatus::Done));

        // Acknowledged, so the same call may be submitted again.
        executor.submit(&call).await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_handler_error_becomes_failure_record() -> Result<()> {
        let executor = executor();
        let fp = executor.submit(&TaskCall::new("square").arg("x")).await?;
        let worker = Worker::new(executor.clone(), Square, DEFAULT_TOUCH_PERIOD);
        worker.run_once(WaitPolicy::NonBlocking).await?;

        let record = executor.result(&fp).await?;
        assert!(matches!(
            record.map(|r| r.outcome),
            Some(Outcome::Failure { message }) if message.contains("integer")
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_run_once_on_empty_queue_is_none() -> Result<()> {
        let worker = Worker::new(executor(), Square, DEFAULT_TOUCH_PERIOD);
        assert!(worker.run_once(WaitPolicy::NonBlocking).await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_run_drains_queue_until_cancelled() -> Result<()> {
        let executor = executor();
        for n in 0..5 {
            executor.submit(&TaskCall::new("square").arg(n)).await?;
        }
        let worker = Worker::new(executor.clone(), Square, DEFAULT_TOUCH_PERIOD);
        let cancel = CancellationToken::new();
        let run = {
            let cancel = cancel.clone();
            tokio::spawn(async move { worker.run(cancel).await })
        };

        assert!(
            executor
                .queue()
                .join(WaitPolicy::Timeout(Duration::from_secs(5)))
                .await?
        );
        cancel.cancel();
        let stats = run.await.map_err(|e| Error::Io(e.to_string()))??;
        assert_eq!(stats, WorkerStats { processed: 5, failed: 0 });
        Ok(())
    }

    #[tokio::test]
    async fn test_cancel_mid_task_releases_claim() -> Result<()> {
        let executor = executor();
        let fp = executor.submit(&TaskCall::new("stuck")).await?;
        let started = Arc::new(AtomicUsize::new(0));
        let worker = Worker::new(
            executor.clone(),
            Stuck {
                started: started.clone(),
            },
            DEFAULT_TOUCH_PERIOD,
        );
        let cancel = CancellationToken::new();
        let run = {
            let cancel = cancel.clone();
            tokio::spawn(async move { worker.run(cancel).await })
        };
        while started.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        cancel.cancel();
        run.await.map_err(|e| Error::Io(e.to_string()))??;

        let entry = executor.queue().entry(&fp).await?;
        assert_eq!(entry.map(|e| e.status), Some(QueueStatus::Pending));
        assert!(!executor.fetched_set().contains(&fp).await?);
        Ok(())
    }

    #[tokio::test]
    async fn test_task_running_past_cutoff_is_not_requeued() -> Result<()> {
        let clock = ManualClock::default();
        let executor = executor_on(Arc::new(clock.clone()));
        let fp = executor.submit(&TaskCall::new("slow")).await?;
        let runs = Arc::new(AtomicUsize::new(0));
        let gate = Arc::new(Notify::new());

        let worker = Worker::new(
            executor.clone(),
            Gated {
                runs: runs.clone(),
                gate: gate.clone(),
            },
            Duration::from_millis(10),
        );
        let first = tokio::spawn(async move { worker.run_once(WaitPolicy::NonBlocking).await });
        while runs.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        // Past the cutoff while the handler is still running; the touch
        // ticker keeps both the fingerprint and the claim fresh.
        clock.advance(ChronoDuration::seconds(301));
        tokio::time::sleep(Duration::from_millis(60)).await;
        let swept = executor.sweep_stale(Duration::from_secs(300)).await?;
        assert!(swept.requeued.is_empty());
        assert!(swept.fingerprints.is_empty());
        let entry = executor.queue().entry(&fp).await?;
        assert_eq!(entry.map(|e| e.status), Some(QueueStatus::Claimed));

        gate.notify_one();
        let record = first.await.map_err(|e| Error::Io(e.to_string()))??;
        assert!(record.is_some());
        let entry = executor.queue().entry(&fp).await?;
        assert_eq!(entry.map(|e| e.status), Some(QueueStatus::Done));

        let second = Worker::new(
            executor.clone(),
            Gated {
                runs: runs.clone(),
                gate,
            },
            DEFAULT_TOUCH_PERIOD,
        );
        assert!(second.run_once(WaitPolicy::NonBlocking).await?.is_none());
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_task_in_flight_elsewhere_does_not_block_the_line() -> Result<()> {
        let executor = executor();
        let held = executor.submit(&TaskCall::new("square").arg(2)).await?;
        executor.submit(&TaskCall::new("square").arg(3)).await?;
        executor.fetched_set().add(&held, "elsewhere").await?;

        let worker = Worker::new(executor.clone(), Square, DEFAULT_TOUCH_PERIOD);
        assert!(worker.run_once(WaitPolicy::NonBlocking).await?.is_none());
        let record = worker.run_once(WaitPolicy::NonBlocking).await?;
        assert_eq!(record.map(|r| r.outcome), Some(Outcome::Value { value: json!(9) }));

        let entry = executor.queue().entry(&held).await?;
        assert_eq!(entry.map(|e| e.status), Some(QueueStatus::Pending));
        Ok(())
    }
}
