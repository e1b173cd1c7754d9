//! Configuration loading from files and environment
//!
//! This module handles loading configuration from:
//! 1. Built-in defaults
//! 2. Global config: `<config dir>/jobmesh/config.toml`
//! 3. Project config: `.jobmesh/config.toml`
//! 4. Environment variables: `JOBMESH_*`

use std::path::{Path, PathBuf};

use toml::{Table, Value};

use super::{merge::merge_tables, types::Config};
use crate::{Error, Result};

// ═══════════════════════════════════════════════════════════════════════════
// PUBLIC API
// ═══════════════════════════════════════════════════════════════════════════

/// Load configuration for the current directory.
///
/// # Errors
///
/// Returns error if:
/// - The current directory cannot be determined
/// - A config file is malformed TOML or has mistyped values
/// - Config values fail validation
pub fn load_config() -> Result<Config> {
    let cwd = std::env::current_dir()
        .map_err(|e| Error::Io(format!("Failed to get current directory: {e}")))?;
    load_config_in(&cwd)
}

/// Load configuration for a project rooted at `project_root`.
pub fn load_config_in(project_root: &Path) -> Result<Config> {
    // 1. Built-in defaults
    let table = defaults_table()?;

    // 2. Global config if it exists
    let table = match global_config_path() {
        Some(path) if path.exists() => merge_tables(table, load_toml_file(&path)?),
        _ => table,
    };

    // 3. Project config if it exists
    let project_path = project_config_path(project_root);
    let table = if project_path.exists() {
        merge_tables(table, load_toml_file(&project_path)?)
    } else {
        table
    };

    let config: Config = Value::Table(table).try_into()?;

    // 4. Environment overrides, then validation
    let config = config.apply_env_vars()?;
    config.validate()?;
    tracing::debug!(project = %config.project, store = %config.store.url, "configuration loaded");
    Ok(config)
}

// ═══════════════════════════════════════════════════════════════════════════
// PATH HELPERS
// ═══════════════════════════════════════════════════════════════════════════

/// Get path to global config file
pub fn global_config_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", "jobmesh")
        .map(|proj_dirs| proj_dirs.config_dir().join("config.toml"))
}

/// Get path to the project config file under `project_root`
pub fn project_config_path(project_root: &Path) -> PathBuf {
    project_root.join(".jobmesh").join("config.toml")
}

/// Load a TOML file as a partial configuration table
///
/// # Errors
///
/// Returns error if:
/// - File cannot be read
/// - Path is a directory instead of a file
/// - TOML is malformed
pub fn load_toml_file(path: &Path) -> Result<Table> {
    if path.is_dir() {
        return Err(Error::Io(format!(
            "Config path is a directory, not a file: {}",
            path.display()
        )));
    }

    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::Io(format!("Failed to read config file {}: {e}", path.display())))?;

    content.parse::<Table>().map_err(|e| {
        Error::InvalidConfig(format!(
            "Failed to parse config file {}: {e}",
            path.display()
        ))
    })
}

fn defaults_table() -> Result<Table> {
    match Value::try_from(Config::default()) {
        Ok(Value::Table(table)) => Ok(table),
        Ok(_) => Err(Error::Serialization(
            "default configuration is not a table".to_string(),
        )),
        Err(e) => Err(Error::Serialization(e.to_string())),
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// ENVIRONMENT VARIABLE OVERRIDES
// ═══════════════════════════════════════════════════════════════════════════

impl Config {
    /// Apply environment variable overrides
    ///
    /// # Errors
    ///
    /// Returns error if environment variable values are invalid
    pub fn apply_env_vars(mut self) -> Result<Self> {
        // JOBMESH_STORE_URL
        if let Ok(value) = std::env::var("JOBMESH_STORE_URL") {
            if value.is_empty() {
                return Err(Error::InvalidConfig(
                    "JOBMESH_STORE_URL cannot be empty - unset the variable or provide a url"
                        .to_string(),
                ));
            }
            self.store.url = value;
        }

        // JOBMESH_DEVELOP
        if let Ok(value) = std::env::var("JOBMESH_DEVELOP") {
            self.develop = value.parse().map_err(|e| {
                Error::InvalidConfig(format!("Invalid JOBMESH_DEVELOP value: {e}"))
            })?;
        }

        // JOBMESH_LOCK_LEASE_SECS
        if let Ok(value) = std::env::var("JOBMESH_LOCK_LEASE_SECS") {
            self.lock.lease_secs = value.parse().map_err(|e| {
                Error::InvalidConfig(format!("Invalid JOBMESH_LOCK_LEASE_SECS value: {e}"))
            })?;
        }

        // JOBMESH_HEARTBEAT_PERIOD_SECS
        if let Ok(value) = std::env::var("JOBMESH_HEARTBEAT_PERIOD_SECS") {
            self.heartbeat.period_secs = value.parse().map_err(|e| {
                Error::InvalidConfig(format!("Invalid JOBMESH_HEARTBEAT_PERIOD_SECS value: {e}"))
            })?;
        }

        // JOBMESH_WORKSPACE_DIR
        if let Ok(value) = std::env::var("JOBMESH_WORKSPACE_DIR") {
            self.paths.workspace_dir = value.into();
        }

        // JOBMESH_FILESTORAGE_DIR
        if let Ok(value) = std::env::var("JOBMESH_FILESTORAGE_DIR") {
            self.paths.filestorage_dir = value.into();
        }

        Ok(self)
    }
}
