//! Default configuration values

use super::types::{
    Config, HeartbeatSettings, LockSettings, PathsConfig, QueueSettings, StoreConfig,
};

impl Default for Config {
    fn default() -> Self {
        Self {
            project: "default".to_string(),
            develop: false,
            store: StoreConfig::default(),
            lock: LockSettings::default(),
            heartbeat: HeartbeatSettings::default(),
            queue: QueueSettings::default(),
            paths: PathsConfig::default(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://.jobmesh/store.db".to_string(),
        }
    }
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            lease_secs: 180,
            poll_interval_ms: 100,
        }
    }
}

impl Default for HeartbeatSettings {
    fn default() -> Self {
        Self {
            period_secs: 60,
            dead_after_secs: 300,
        }
    }
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: 250,
            remove_done: false,
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            workspace_dir: "workspace".into(),
            filestorage_dir: "storage".into(),
        }
    }
}
