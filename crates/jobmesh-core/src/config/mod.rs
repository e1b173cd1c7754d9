//! Configuration loading and management
//!
//! # Hierarchy
//!
//! Configuration is loaded in this order (later overrides earlier):
//! 1. Built-in defaults
//! 2. Global config: `<config dir>/jobmesh/config.toml`
//! 3. Project config: `.jobmesh/config.toml`
//! 4. Environment variables: `JOBMESH_*`
//!
//! # Example Config
//!
//! ```toml
//! project = "sweep-2024"
//!
//! [store]
//! url = "sqlite:///shared/jobmesh/store.db"
//!
//! [lock]
//! lease_secs = 180
//!
//! [heartbeat]
//! period_secs = 60
//! dead_after_secs = 300
//! ```
//!
//! # Module Structure
//!
//! - `types`: Configuration structure definitions
//! - `defaults`: Default value implementations
//! - `load`: Loading from files and environment
//! - `merge`: Table overlay of partial files
//! - `validate`: Validation and conversion into runtime settings

mod defaults;
mod load;
mod merge;
mod types;
mod validate;

#[cfg(test)]
mod tests_loading;
#[cfg(test)]
mod tests_validation;

pub use load::{global_config_path, load_config, load_config_in, load_toml_file, project_config_path};
pub use types::{
    Config, HeartbeatSettings, LockSettings, PathsConfig, QueueSettings, StoreConfig, StoreUrl,
};
