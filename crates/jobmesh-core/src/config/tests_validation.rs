//! Validation tests for configuration

#[cfg(test)]
mod validation_tests {
    use std::time::Duration;

    use crate::config::{Config, StoreUrl};
    use crate::Error;

    #[test]
    fn test_zero_periods_are_rejected() {
        let mut config = Config::default();
        config.queue.poll_interval_ms = 0;
        assert!(matches!(
            config.validate(),
            Err(Error::InvalidConfig(msg)) if msg.contains("queue.poll_interval_ms")
        ));

        let mut config = Config::default();
        config.heartbeat.period_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_lease_must_outlast_heartbeat() {
        let mut config = Config::default();
        config.lock.lease_secs = config.heartbeat.period_secs;
        assert!(config.validate().is_err());
        config.lock.lease_secs += 1;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_dead_after_must_outlast_heartbeat() {
        let mut config = Config::default();
        config.heartbeat.dead_after_secs = config.heartbeat.period_secs;
        assert!(matches!(
            config.validate(),
            Err(Error::InvalidConfig(msg)) if msg.contains("heartbeat.dead_after_secs")
        ));
        config.heartbeat.dead_after_secs = config.heartbeat.period_secs - 1;
        assert!(config.validate().is_err());
        config.heartbeat.dead_after_secs = config.heartbeat.period_secs + 1;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_store_urls() {
        assert_eq!("memory://".parse::<StoreUrl>().ok(), Some(StoreUrl::Memory));
        assert_eq!(
            "sqlite://.jobmesh/store.db".parse::<StoreUrl>().ok(),
            Some(StoreUrl::Sqlite(".jobmesh/store.db".into()))
        );
        assert!("sqlite://".parse::<StoreUrl>().is_err());
        assert!("mongodb://localhost".parse::<StoreUrl>().is_err());

        let mut config = Config::default();
        config.store.url = "postgres://x".to_string();
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_runtime_settings_conversion() {
        let config = Config::default();
        assert_eq!(config.lock_config().lease, Duration::from_secs(180));
        assert_eq!(config.lock_config().poll_interval, Duration::from_millis(100));
        assert_eq!(config.heartbeat_config().dead_after, Duration::from_secs(300));
        assert_eq!(config.queue_config().poll_interval, Duration::from_millis(250));
    }
}
