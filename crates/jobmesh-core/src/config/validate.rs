//! Configuration validation and conversion into runtime settings.

use std::time::Duration;

use super::types::{Config, StoreUrl};
use crate::{
    job::{HeartbeatConfig, JobStorage},
    lock::LockConfig,
    queue::QueueConfig,
    Error, Result,
};

// ═══════════════════════════════════════════════════════════════════════════
// VALIDATION LOGIC
// ═══════════════════════════════════════════════════════════════════════════

impl Config {
    /// Validate configuration values
    ///
    /// # Errors
    ///
    /// Returns error if any value is zero where a period is expected, the
    /// lease or the dead-worker cutoff does not outlast a heartbeat period,
    /// or the store url is not understood.
    pub fn validate(&self) -> Result<()> {
        if self.project.trim().is_empty() {
            return Err(Error::InvalidConfig("project cannot be empty".to_string()));
        }

        let positive = [
            ("lock.lease_secs", self.lock.lease_secs),
            ("lock.poll_interval_ms", self.lock.poll_interval_ms),
            ("heartbeat.period_secs", self.heartbeat.period_secs),
            ("heartbeat.dead_after_secs", self.heartbeat.dead_after_secs),
            ("queue.poll_interval_ms", self.queue.poll_interval_ms),
        ];
        if let Some((key, _)) = positive.iter().find(|(_, value)| *value == 0) {
            return Err(Error::InvalidConfig(format!("{key} must be greater than 0")));
        }

        // A lease renewed once per period must outlast the period.
        if self.lock.lease_secs <= self.heartbeat.period_secs {
            return Err(Error::InvalidConfig(format!(
                "lock.lease_secs ({}) must be greater than heartbeat.period_secs ({})",
                self.lock.lease_secs, self.heartbeat.period_secs
            )));
        }

        // Workers beat once per period, so a shorter cutoff reclaims live ones.
        if self.heartbeat.dead_after_secs <= self.heartbeat.period_secs {
            return Err(Error::InvalidConfig(format!(
                "heartbeat.dead_after_secs ({}) must be greater than heartbeat.period_secs ({})",
                self.heartbeat.dead_after_secs, self.heartbeat.period_secs
            )));
        }

        self.store_url().map(|_| ())
    }

    pub fn store_url(&self) -> Result<StoreUrl> {
        self.store.url.parse()
    }

    #[must_use]
    pub const fn lock_config(&self) -> LockConfig {
        LockConfig {
            lease: Duration::from_secs(self.lock.lease_secs),
            poll_interval: Duration::from_millis(self.lock.poll_interval_ms),
        }
    }

    #[must_use]
    pub const fn heartbeat_config(&self) -> HeartbeatConfig {
        HeartbeatConfig {
            period: Duration::from_secs(self.heartbeat.period_secs),
            dead_after: Duration::from_secs(self.heartbeat.dead_after_secs),
        }
    }

    #[must_use]
    pub const fn queue_config(&self) -> QueueConfig {
        QueueConfig {
            poll_interval: Duration::from_millis(self.queue.poll_interval_ms),
            remove_done: self.queue.remove_done,
        }
    }

    #[must_use]
    pub fn job_storage(&self) -> JobStorage {
        JobStorage::new(&self.paths.workspace_dir, &self.paths.filestorage_dir)
    }
}
