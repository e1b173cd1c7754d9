//! An open job and its heartbeat task.

use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::JobRegistry;
use crate::{
    hashing::{JobId, Parameters},
    lock::LockHandle,
    wait::WaitPolicy,
    Error, Result,
};

/// A job held open by this worker instance.
///
/// Dropping the handle without [`JobHandle::close`] stops the heartbeat but
/// leaves the lock and the `executing` entry behind, exactly like a crash:
/// the lease lapses and the sweep reclaims the worker.
#[derive(Debug)]
pub struct JobHandle {
    registry: JobRegistry,
    id: JobId,
    worker: String,
    parameters: Parameters,
    lost: Arc<AtomicBool>,
    cancel: CancellationToken,
    heartbeat: Option<JoinHandle<LockHandle>>,
}

pub(super) async fn open(registry: JobRegistry, id: &JobId, wait: WaitPolicy) -> Result<JobHandle> {
    let lock = registry.lock().acquire(id.as_str(), wait).await?;
    let worker = Uuid::new_v4().to_string();

    let setup = async {
        let parameters = registry.parameters_of(id).await?;
        registry.beat(id, &worker).await?;
        registry.storage().create(id).await?;
        Ok::<_, Error>(parameters)
    }
    .await;

    let parameters = match setup {
        Ok(parameters) => parameters,
        Err(e) => {
            if let Err(cleanup) = registry.leave(id, &worker).await {
                tracing::warn!(job_id = %id, error = %cleanup, "failed to undo partial open");
            }
            registry.lock().release(lock).await?;
            return Err(e);
        }
    };

    let lost = Arc::new(AtomicBool::new(false));
    let cancel = CancellationToken::new();
    let heartbeat = tokio::spawn(heartbeat_loop(
        registry.clone(),
        id.clone(),
        worker.clone(),
        lock,
        Arc::clone(&lost),
        cancel.clone(),
    ));
    tracing::info!(job_id = %id, %worker, "job opened");

    Ok(JobHandle {
        registry,
        id: id.clone(),
        worker,
        parameters,
        lost,
        cancel,
        heartbeat: Some(heartbeat),
    })
}

/// Renew the lease, then rewrite the pulse, every period until cancelled or
/// the lease is lost. Hands the lock back when it stops.
async fn heartbeat_loop(
    registry: JobRegistry,
    id: JobId,
    worker: String,
    mut lock: LockHandle,
    lost: Arc<AtomicBool>,
    cancel: CancellationToken,
) -> LockHandle {
    let mut ticker = tokio::time::interval(registry.heartbeat().period);
    ticker.tick().await;

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        match registry.lock().renew(&mut lock).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::error!(job_id = %id, %worker, "job lease lost, stopping heartbeat");
                lost.store(true, Ordering::SeqCst);
                break;
            }
            Err(e) => {
                tracing::warn!(job_id = %id, %worker, error = %e, "lease renewal failed");
                continue;
            }
        }

        match registry.beat(&id, &worker).await {
            Ok(true) => {
                tracing::info!(job_id = %id, %worker, "worker was reclaimed while alive, re-registered");
            }
            Ok(false) => tracing::trace!(job_id = %id, %worker, "pulse"),
            Err(Error::NotFound(_)) => {
                tracing::error!(job_id = %id, %worker, "job document vanished, stopping heartbeat");
                lost.store(true, Ordering::SeqCst);
                break;
            }
            Err(e) => tracing::warn!(job_id = %id, %worker, error = %e, "pulse failed"),
        }
    }
    lock
}

impl JobHandle {
    #[must_use]
    pub const fn id(&self) -> &JobId {
        &self.id
    }

    /// Worker-instance id written into `executing` and `pulse`.
    #[must_use]
    pub fn worker(&self) -> &str {
        &self.worker
    }

    #[must_use]
    pub const fn parameters(&self) -> &Parameters {
        &self.parameters
    }

    #[must_use]
    pub fn workspace_dir(&self) -> PathBuf {
        self.registry.storage().workspace_dir(&self.id)
    }

    #[must_use]
    pub fn filestorage_dir(&self) -> PathBuf {
        self.registry.storage().filestorage_dir(&self.id)
    }

    /// Whether the heartbeat found the lease taken over or the job gone.
    #[must_use]
    pub fn is_lease_lost(&self) -> bool {
        self.lost.load(Ordering::SeqCst)
    }

    /// Stop the heartbeat, leave the liveness table and release the lock.
    pub async fn close(mut self) -> Result<()> {
        let lock = self.stop_heartbeat().await?;
        self.registry.leave(&self.id, &self.worker).await?;
        let released = self.registry.lock().release(lock).await?;
        if !released {
            tracing::warn!(job_id = %self.id, worker = %self.worker, "lock was no longer held at close");
        }
        tracing::info!(job_id = %self.id, worker = %self.worker, "job closed");
        Ok(())
    }

    /// Remove the job while holding it open.
    pub async fn remove(mut self, force: bool) -> Result<()> {
        let lock = self.stop_heartbeat().await?;
        let result = self.registry.remove_held(&self.id, force).await;
        if result.is_err() {
            self.registry.leave(&self.id, &self.worker).await?;
            self.registry.lock().release(lock).await?;
        }
        result
    }

    async fn stop_heartbeat(&mut self) -> Result<LockHandle> {
        self.cancel.cancel();
        let task = self
            .heartbeat
            .take()
            .ok_or_else(|| Error::Io("heartbeat already stopped".to_owned()))?;
        task.await
            .map_err(|e| Error::Io(format!("heartbeat task failed: {e}")))
    }
}

impl Drop for JobHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
