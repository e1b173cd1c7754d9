//! Reclamation of workers that stopped beating.
//!
//! The sweep never touches the lock. A dead holder's lease runs out on its
//! own; the sweep only cleans `executing` and `pulse` so that job counts and
//! pulse listings stop reporting the dead worker.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::JobDocument;
use crate::{
    clock::{to_chrono, Clock},
    hashing::JobId,
    store::{self, update_typed, Conditional, DocumentStore},
    Result,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Reclaimed {
    pub job_id: JobId,
    pub worker: String,
    /// `None` for an `executing` member that never wrote a pulse.
    pub last_beat: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReclaimReport {
    pub scanned: usize,
    pub reclaimed: Vec<Reclaimed>,
    /// Documents skipped because they could not be read or updated.
    pub failed: usize,
}

pub(super) async fn reclaim_dead(
    store: &dyn DocumentStore,
    clock: &dyn Clock,
    cutoff: Duration,
) -> Result<ReclaimReport> {
    let now = clock.now();
    let cutoff = to_chrono(cutoff);
    let mut report = ReclaimReport::default();

    for doc in store.list(store::JOBS).await? {
        report.scanned += 1;
        let job: JobDocument = match doc.decode(store::JOBS) {
            Ok(job) => job,
            Err(e) => {
                tracing::warn!(id = %doc.id, error = %e, "sweep skipped unreadable job");
                report.failed += 1;
                continue;
            }
        };
        if job.stale_workers(now, cutoff).is_empty() {
            continue;
        }

        // Judge staleness again against the state being overwritten, so a
        // beat that lands between list and update survives.
        let mut removed = Vec::new();
        let outcome = update_typed::<JobDocument, _>(store, store::JOBS, &doc.id, |current| {
            removed = current.stale_workers(now, cutoff);
            for (worker, _) in &removed {
                current.forget_worker(worker);
            }
            !removed.is_empty()
        })
        .await;

        match outcome {
            Ok(Conditional::Applied(_)) => {
                for (worker, last_beat) in removed {
                    tracing::info!(
                        job_id = %job.id,
                        %worker,
                        last_beat = ?last_beat,
                        "reclaimed dead worker"
                    );
                    report.reclaimed.push(Reclaimed {
                        job_id: job.id.clone(),
                        worker,
                        last_beat,
                    });
                }
            }
            Ok(Conditional::Rejected(_) | Conditional::Missing) => {}
            Err(e) => {
                tracing::warn!(job_id = %job.id, error = %e, "sweep failed to update job");
                report.failed += 1;
            }
        }
    }

    if !report.reclaimed.is_empty() {
        tracing::info!(
            scanned = report.scanned,
            reclaimed = report.reclaimed.len(),
            "reclamation sweep finished"
        );
    }
    Ok(report)
}
