//! Loading-focused tests for configuration
//!
//! File parsing, layering and environment overrides.

#[cfg(test)]
mod loading_tests {
    use std::path::Path;

    use serial_test::serial;

    use crate::config::{load_config_in, load_toml_file, project_config_path, Config, StoreUrl};
    use crate::{Error, Result};

    const ENV_VARS: [&str; 6] = [
        "JOBMESH_STORE_URL",
        "JOBMESH_DEVELOP",
        "JOBMESH_LOCK_LEASE_SECS",
        "JOBMESH_HEARTBEAT_PERIOD_SECS",
        "JOBMESH_WORKSPACE_DIR",
        "JOBMESH_FILESTORAGE_DIR",
    ];

    fn clear_env() {
        for var in ENV_VARS {
            std::env::remove_var(var);
        }
    }

    fn write_project_config(root: &Path, content: &str) -> Result<()> {
        let path = project_config_path(root);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    #[test]
    #[serial]
    fn test_no_project_file_returns_defaults() -> Result<()> {
        clear_env();
        let root = tempfile::tempdir()?;
        let config = load_config_in(root.path())?;
        assert_eq!(config.lock, Config::default().lock);
        assert_eq!(config.heartbeat, Config::default().heartbeat);
        Ok(())
    }

    #[test]
    #[serial]
    fn test_partial_project_file_keeps_other_defaults() -> Result<()> {
        clear_env();
        let root = tempfile::tempdir()?;
        write_project_config(
            root.path(),
            "project = \"fits\"\n[lock]\nlease_secs = 600\n[store]\nurl = \"memory://\"\n",
        )?;

        let config = load_config_in(root.path())?;
        assert_eq!(config.project, "fits");
        assert_eq!(config.lock.lease_secs, 600);
        assert_eq!(config.lock.poll_interval_ms, 100);
        assert_eq!(config.store_url()?, StoreUrl::Memory);
        Ok(())
    }

    #[test]
    #[serial]
    fn test_env_overrides_project_file() -> Result<()> {
        clear_env();
        let root = tempfile::tempdir()?;
        write_project_config(root.path(), "[store]\nurl = \"memory://\"\n")?;

        std::env::set_var("JOBMESH_STORE_URL", "sqlite:///tmp/other.db");
        std::env::set_var("JOBMESH_DEVELOP", "true");
        std::env::set_var("JOBMESH_WORKSPACE_DIR", "/scratch/ws");
        let config = load_config_in(root.path());
        clear_env();

        let config = config?;
        assert_eq!(config.store_url()?, StoreUrl::Sqlite("/tmp/other.db".into()));
        assert!(config.develop);
        assert_eq!(config.paths.workspace_dir, Path::new("/scratch/ws"));
        Ok(())
    }

    #[test]
    #[serial]
    fn test_invalid_env_value_is_invalid_config() -> Result<()> {
        clear_env();
        let root = tempfile::tempdir()?;
        std::env::set_var("JOBMESH_LOCK_LEASE_SECS", "forever");
        let result = load_config_in(root.path());
        clear_env();
        assert!(matches!(result, Err(Error::InvalidConfig(_))));
        Ok(())
    }

    #[test]
    #[serial]
    fn test_env_lease_below_period_fails_validation() -> Result<()> {
        clear_env();
        let root = tempfile::tempdir()?;
        std::env::set_var("JOBMESH_LOCK_LEASE_SECS", "30");
        let result = load_config_in(root.path());
        clear_env();
        assert!(matches!(result, Err(Error::InvalidConfig(msg)) if msg.contains("lease_secs")));
        Ok(())
    }

    #[test]
    fn test_malformed_toml_returns_parse_error() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "lease_secs = \n invalid toml [[[")?;
        let result = load_toml_file(&path);
        assert!(matches!(result, Err(Error::InvalidConfig(msg)) if msg.contains("parse")));
        Ok(())
    }

    #[test]
    #[serial]
    fn test_mistyped_value_is_rejected() -> Result<()> {
        clear_env();
        let root = tempfile::tempdir()?;
        write_project_config(root.path(), "[lock]\nlease_secs = \"long\"\n")?;
        assert!(matches!(
            load_config_in(root.path()),
            Err(Error::InvalidConfig(_))
        ));
        Ok(())
    }

    #[test]
    fn test_directory_path_is_rejected() -> Result<()> {
        let dir = tempfile::tempdir()?;
        assert!(matches!(load_toml_file(dir.path()), Err(Error::Io(_))));
        Ok(())
    }
}
