//! One entry point wiring every primitive to a shared store and clock.

use std::sync::Arc;

use crate::{
    clock::{Clock, SystemClock},
    config::{Config, StoreUrl},
    executor::Executor,
    fingerprint_set::FingerprintSet,
    job::JobRegistry,
    lock::DistributedLock,
    queue::TaskQueue,
    store::{self, DocumentStore, MemoryStore, SqliteStore},
    worker::{TaskHandler, Worker},
    Result,
};

#[derive(Debug, Clone)]
pub struct Coordinator {
    config: Config,
    store: Arc<dyn DocumentStore>,
    clock: Arc<dyn Clock>,
}

impl Coordinator {
    /// Open the store named by `config.store.url`.
    pub async fn connect(config: &Config) -> Result<Self> {
        config.validate()?;
        let store: Arc<dyn DocumentStore> = match config.store_url()? {
            StoreUrl::Memory => Arc::new(MemoryStore::new()),
            StoreUrl::Sqlite(path) => Arc::new(SqliteStore::open(&path).await?),
        };
        tracing::info!(project = %config.project, store = %config.store.url, "connected");
        Ok(Self::with_store(config.clone(), store, Arc::new(SystemClock)))
    }

    /// Build on an existing store and clock.
    #[must_use]
    pub fn with_store(config: Config, store: Arc<dyn DocumentStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            store,
            clock,
        }
    }

    #[must_use]
    pub const fn config(&self) -> &Config {
        &self.config
    }

    #[must_use]
    pub fn store(&self) -> Arc<dyn DocumentStore> {
        Arc::clone(&self.store)
    }

    #[must_use]
    pub fn job_lock(&self) -> DistributedLock {
        DistributedLock::new(
            self.store(),
            Arc::clone(&self.clock),
            store::JOBS,
            self.config.lock_config(),
        )
    }

    #[must_use]
    pub fn jobs(&self) -> JobRegistry {
        JobRegistry::new(
            self.store(),
            Arc::clone(&self.clock),
            self.job_lock(),
            self.config.job_storage(),
            self.config.heartbeat_config(),
        )
        .with_develop(self.config.develop)
    }

    #[must_use]
    pub fn queue(&self) -> TaskQueue {
        TaskQueue::new(self.store(), Arc::clone(&self.clock), self.config.queue_config())
    }

    #[must_use]
    pub fn fetched_set(&self) -> FingerprintSet {
        FingerprintSet::new(self.store(), Arc::clone(&self.clock))
    }

    #[must_use]
    pub fn executor(&self) -> Executor {
        Executor::new(
            self.store(),
            Arc::clone(&self.clock),
            self.queue(),
            self.fetched_set(),
        )
    }

    /// A worker touching its in-flight fingerprint once per heartbeat period.
    #[must_use]
    pub fn worker<H: TaskHandler>(&self, handler: H) -> Worker<H> {
        Worker::new(self.executor(), handler, self.config.heartbeat_config().period)
    }
}
