//! Configuration type definitions

use std::{path::PathBuf, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

// ═══════════════════════════════════════════════════════════════════════════
// MAIN CONFIGURATION
// ═══════════════════════════════════════════════════════════════════════════

/// Root configuration structure
///
/// Loaded from defaults → global → project → env vars
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    /// Informational project name, logged on connect.
    pub project: String,
    /// Flag newly registered jobs as `develop`.
    pub develop: bool,
    pub store: StoreConfig,
    pub lock: LockSettings,
    pub heartbeat: HeartbeatSettings,
    pub queue: QueueSettings,
    pub paths: PathsConfig,
}

// ═══════════════════════════════════════════════════════════════════════════
// NESTED CONFIGURATION STRUCTURES
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StoreConfig {
    /// `memory://` or `sqlite://<path>`
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LockSettings {
    pub lease_secs: u64,
    pub poll_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct HeartbeatSettings {
    pub period_secs: u64,
    pub dead_after_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct QueueSettings {
    pub poll_interval_ms: u64,
    pub remove_done: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PathsConfig {
    pub workspace_dir: PathBuf,
    pub filestorage_dir: PathBuf,
}

// ═══════════════════════════════════════════════════════════════════════════
// STORE URL
// ═══════════════════════════════════════════════════════════════════════════

/// Parsed `store.url`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreUrl {
    Memory,
    Sqlite(PathBuf),
}

impl FromStr for StoreUrl {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if s == "memory://" {
            return Ok(Self::Memory);
        }
        match s.strip_prefix("sqlite://") {
            Some(path) if !path.is_empty() => Ok(Self::Sqlite(PathBuf::from(path))),
            _ => Err(Error::InvalidConfig(format!(
                "Unsupported store url '{s}': expected 'memory://' or 'sqlite://<path>'"
            ))),
        }
    }
}
