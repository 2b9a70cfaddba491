
    use super::*;

    #[test]
    fn test_default_subscriber_config() {
        let config = SubscriberConfig::default();
        assert_eq!(config.max_block_time, 2.0);
        assert_eq!(config.min_block_time, 0.1);
        assert_eq!(config.block_time_delta, 0.7);
        assert_eq!(config.max_messages_count, 10);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_block_time_delta_range() {
        assert!(SubscriberConfig::new()
            .with_block_time_delta(0.0)
            .validate()
            .is_err());
        assert!(SubscriberConfig::new()
            .with_block_time_delta(1.5)
            .validate()
            .is_err());
        assert!(SubscriberConfig::new()
            .with_block_time_delta(1.0)
            .validate()
            .is_ok());
    }

    #[test]
    fn test_block_time_bounds() {
        let config = SubscriberConfig::new().with_block_time(1.0, 0.5);
        match config.validate() {
            Err(Error::InvalidConfig { field, .. }) => assert_eq!(field, "max_block_time"),
            other => panic!("Expected InvalidConfig, got {:?}", other),
        }
    }

    #[test]
    fn test_block_time_must_be_finite() {
        for max in [f64::INFINITY, f64::NAN, MAX_BLOCK_TIME + 1.0] {
            let config = SubscriberConfig::new().with_block_time(0.1, max);
            match config.validate() {
                Err(Error::InvalidConfig { field, .. }) => assert_eq!(field, "max_block_time"),
                other => panic!("Expected InvalidConfig for {}, got {:?}", max, other),
            }
        }
        assert!(SubscriberConfig::new()
            .with_block_time(f64::NAN, 1.0)
            .validate()
            .is_err());
        assert!(SubscriberConfig::new()
            .with_block_time(0.1, MAX_BLOCK_TIME)
            .validate()
            .is_ok());
    }

    #[test]
    fn test_shard_bounds() {
        assert!(validate_shards(0).is_err());
        assert!(validate_shards(1).is_ok());
        assert!(validate_shards(32).is_ok());
        assert!(matches!(
            validate_shards(33),
            Err(Error::InvalidShardCount(33))
        ));
    }

    #[test]
    fn test_event_manager_config_deserialization() {
        let json = r#"{
            "shards": 8,
            "streams": { "orders": { "maxlen": 500 } },
            "subscriber": { "max_block_time": 1.0 }
        }"#;
        let config: EventManagerConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.shards, 8);
        assert_eq!(config.lock_prefix, "SHARDBUS:STREAM:SHARDLOCK");
        assert_eq!(config.maxlen_for("orders"), 500);
        assert_eq!(config.maxlen_for("users"), 1_000_000);
        assert_eq!(config.subscriber.max_block_time, 1.0);
        assert_eq!(config.subscriber.min_block_time, 0.1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_periodic_config_defaults_and_validation() {
        let config = PeriodicConfig::default();
        assert_eq!(config.queue_capacity, 10);
        assert_eq!(config.lock_prefix, "SHARDBUS:PERIODIC:LOCK");
        assert_eq!(config.lock_ttl(), Duration::from_secs(86_400));
        assert!(config.validate().is_ok());

        let zero = PeriodicConfig {
            queue_capacity: 0,
            ..PeriodicConfig::default()
        };
        assert!(matches!(
            zero.validate(),
            Err(Error::InvalidConfig { field, .. }) if field == "queue_capacity"
        ));
    }
