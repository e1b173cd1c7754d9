//! Error taxonomy for the coordination layer.
//!
//! Errors fall into two groups:
//!
//! - **Expected outcomes**: `LockBusy`, `LockTimeout`, `Empty`,
//!   `DuplicateSubmission`. Callers branch on these; they are never logged
//!   as errors by the core.
//! - **Failures**: `StoreUnavailable`, `CorruptedState`, `NotFound`, I/O and
//!   configuration problems. These always surface and are never retried or
//!   repaired silently.

use std::time::Duration;

use thiserror::Error;

/// Where a duplicate submission was detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DuplicateStage {
    /// The fingerprint is checked out by a worker right now.
    InFlight,
    /// The fingerprint is queued and not fetched yet.
    Queued,
}

impl DuplicateStage {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::InFlight => "in_flight",
            Self::Queued => "queued",
        }
    }
}

impl std::fmt::Display for DuplicateStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Top-level error type for every coordination operation.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// Non-blocking acquire found the resource held by a live owner.
    #[error("resource '{resource}' is locked")]
    LockBusy { resource: String },

    /// Blocking acquire did not succeed within the timeout.
    #[error("timed out after {waited:?} waiting for lock on '{resource}'")]
    LockTimeout { resource: String, waited: Duration },

    /// A job id or fingerprint has no backing document.
    #[error("not found: {0}")]
    NotFound(String),

    /// The fingerprint is already queued or in flight.
    #[error("task {fingerprint} was already submitted and is currently {stage}; use resubmit to force")]
    DuplicateSubmission {
        fingerprint: String,
        stage: DuplicateStage,
    },

    /// Queue `get` timed out with no ready entry.
    #[error("queue is empty")]
    Empty,

    /// A blocking call was cancelled through its cancellation token.
    #[error("operation cancelled")]
    Cancelled,

    /// Connectivity or driver failure in the backing store.
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    /// A document is missing an expected field or cannot be decoded.
    #[error("corrupted document {collection}/{id}: {reason}")]
    CorruptedState {
        collection: String,
        id: String,
        reason: String,
    },

    /// Filesystem cleanup for a job failed during removal.
    #[error("cleanup of job {job_id} failed: {reason}")]
    CleanupFailed { job_id: String, reason: String },

    /// Invalid configuration value or file.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Filesystem error outside job cleanup.
    #[error("io error: {0}")]
    Io(String),

    /// Value could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl Error {
    pub fn corrupted(
        collection: impl Into<String>,
        id: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::CorruptedState {
            collection: collection.into(),
            id: id.into(),
            reason: reason.into(),
        }
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn store(msg: impl Into<String>) -> Self {
        Self::StoreUnavailable(msg.into())
    }

    /// Stable machine-readable code.
    pub const fn code(&self) -> &'static str {
        match self {
            Self::LockBusy { .. } => "LOCK_BUSY",
            Self::LockTimeout { .. } => "LOCK_TIMEOUT",
            Self::NotFound(_) => "NOT_FOUND",
            Self::DuplicateSubmission { .. } => "DUPLICATE_SUBMISSION",
            Self::Empty => "EMPTY",
            Self::Cancelled => "CANCELLED",
            Self::StoreUnavailable(_) => "STORE_UNAVAILABLE",
            Self::CorruptedState { .. } => "CORRUPTED_STATE",
            Self::CleanupFailed { .. } => "CLEANUP_FAILED",
            Self::InvalidConfig(_) => "INVALID_CONFIG",
            Self::Io(_) => "IO_ERROR",
            Self::Serialization(_) => "SERIALIZATION_ERROR",
        }
    }

    /// Ordinary outcomes a caller is expected to handle by branching.
    pub const fn is_expected(&self) -> bool {
        matches!(
            self,
            Self::LockBusy { .. }
                | Self::LockTimeout { .. }
                | Self::Empty
                | Self::DuplicateSubmission { .. }
                | Self::Cancelled
        )
    }

    /// Process exit code for the CLI.
    ///
    /// - 1: invalid input or configuration
    /// - 2: store or filesystem failure
    /// - 3: not found
    /// - 4: corrupted state
    /// - 5: busy, timed out, duplicate or empty
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::InvalidConfig(_) | Self::Serialization(_) => 1,
            Self::StoreUnavailable(_) | Self::Io(_) | Self::CleanupFailed { .. } => 2,
            Self::NotFound(_) => 3,
            Self::CorruptedState { .. } => 4,
            Self::LockBusy { .. }
            | Self::LockTimeout { .. }
            | Self::DuplicateSubmission { .. }
            | Self::Empty
            | Self::Cancelled => 5,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Self::InvalidConfig(format!("Failed to parse config: {err}"))
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        Self::StoreUnavailable(err.to_string())
    }
}

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, Error>;
