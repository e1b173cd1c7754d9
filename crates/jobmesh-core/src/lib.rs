//! # jobmesh core
//!
//! Coordination primitives for many worker processes sharing one document
//! store that offers nothing stronger than single-document atomic updates.
//!
//! ## Building blocks
//!
//! - [`store`]: the narrow [`DocumentStore`] adapter and its backends
//! - [`lock`]: lease-based distributed lock embedded in a document
//! - [`job`]: content-addressed jobs, heartbeats and dead-worker reclamation
//! - [`fingerprint_set`]: in-flight task deduplication
//! - [`queue`]: FIFO task queue keyed by fingerprint
//! - [`executor`] and [`worker`]: submission, execution and results
//!
//! ## Laws (Compiler Enforced)
//!
//! - No `unwrap()` - returns `Result` instead
//! - No `expect()` - returns `Result` instead
//! - No `panic!()` - returns `Result` instead
//! - No `unsafe` - safe Rust only
//!
//! ## Error Handling
//!
//! All fallible operations return `Result<T, Error>`. Busy locks, timeouts,
//! empty queues and duplicate submissions are ordinary [`Error`] variants the
//! caller branches on (see [`Error::is_expected`]).

#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::panic))]
#![forbid(unsafe_code)]

pub mod clock;
pub mod config;
mod coordinator;
mod error;
pub mod executor;
pub mod fingerprint_set;
pub mod hashing;
pub mod job;
pub mod lock;
pub mod queue;
pub mod store;
pub mod wait;
pub mod worker;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::Config;
pub use coordinator::Coordinator;
pub use error::{DuplicateStage, Error, Result};
pub use executor::{Executor, Outcome, ResultRecord, TaskCall};
pub use fingerprint_set::FingerprintSet;
pub use hashing::{Fingerprint, JobId, Parameters};
pub use job::{JobHandle, JobRegistry, ReclaimReport};
pub use lock::{DistributedLock, LockHandle};
pub use queue::{QueueEntry, QueueStats, QueueStatus, TaskQueue};
pub use store::{DocumentStore, MemoryStore, SqliteStore};
pub use wait::WaitPolicy;
pub use worker::{TaskHandler, Worker};
