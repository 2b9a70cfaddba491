
    use super::*;
    use std::sync::Arc;

    const PREFIX: &str = "SHARDBUS:TEST:SHARDLOCK";

    fn scope<'a>(consumer_id: &'a str) -> ShardScope<'a> {
        ShardScope {
            prefix: PREFIX,
            consumer_group: "test_group",
            consumer_id,
            shard_count: 16,
        }
    }

    fn channels(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_lock_shards_round_trip() {
        let store = MemoryStore::new();
        let chans = channels(&["test_channel"]);

        let acquired = store.lock_shards(&scope("test_id"), &chans).await.unwrap();
        assert_eq!(acquired, vec![("test_channel".to_string(), 0xFFFF)]);

        let again = store.lock_shards(&scope("test_id"), &chans).await.unwrap();
        assert_eq!(again, vec![("test_channel".to_string(), 0x0)]);

        store
            .unlock_shards(&scope("test_id"), &[("test_channel".to_string(), 0xFFFF)])
            .await
            .unwrap();

        let reacquired = store.lock_shards(&scope("test_id"), &chans).await.unwrap();
        assert_eq!(reacquired, vec![("test_channel".to_string(), 0xFFFF)]);
    }

    #[tokio::test]
    async fn test_live_owner_keeps_its_shard() {
        let store = MemoryStore::new();
        let ttl = Duration::from_secs(30);
        let lock_key = shard_lock_key(PREFIX, "test_channel", 1, "test_group");

        store.set_ex(&lock_key, "another_id", ttl).await.unwrap();
        store
            .set_ex(&liveness_key(PREFIX, "another_id"), "1", ttl)
            .await
            .unwrap();

        let acquired = store
            .lock_shards(&scope("test_id"), &channels(&["test_channel"]))
            .await
            .unwrap();
        assert_eq!(acquired, vec![("test_channel".to_string(), 0xFFFF - 2)]);

        store
            .unlock_shards(&scope("test_id"), &[("test_channel".to_string(), 0xFFFF)])
            .await
            .unwrap();

        // Only our own locks are released
        assert_eq!(store.get(&lock_key).await.unwrap().as_deref(), Some("another_id"));
        let ours = shard_lock_key(PREFIX, "test_channel", 2, "test_group");
        assert_eq!(store.get(&ours).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_dead_owner_is_taken_over() {
        let store = MemoryStore::new();
        let lock_key = shard_lock_key(PREFIX, "test_channel", 1, "test_group");
        store
            .set_ex(&lock_key, "crashed_id", Duration::from_secs(600))
            .await
            .unwrap();

        let acquired = store
            .lock_shards(&scope("test_id"), &channels(&["test_channel"]))
            .await
            .unwrap();
        assert_eq!(acquired[0].1, 0xFFFF);
        assert_eq!(store.get(&lock_key).await.unwrap().as_deref(), Some("test_id"));
    }

    #[tokio::test]
    async fn test_keys_expire() {
        let store = MemoryStore::new();
        assert!(store
            .set_nx("k", "v", Duration::from_millis(20))
            .await
            .unwrap());
        assert!(!store.set_nx("k", "w", Duration::from_secs(1)).await.unwrap());

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(store.get("k").await.unwrap(), None);
        assert!(store.set_nx("k", "w", Duration::from_secs(1)).await.unwrap());
    }

    #[tokio::test]
    async fn test_owner_checked_delete_and_expire() {
        let store = MemoryStore::new();
        store.set_ex("k", "me", Duration::from_secs(1)).await.unwrap();

        assert!(!store.delete_if_owner("k", "other").await.unwrap());
        assert!(!store
            .expire_if_owner("k", "other", Duration::from_secs(5))
            .await
            .unwrap());
        assert!(store
            .expire_if_owner("k", "me", Duration::from_secs(5))
            .await
            .unwrap());
        assert!(store.delete_if_owner("k", "me").await.unwrap());
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_incr_by_counts_and_keeps_expiry() {
        let store = MemoryStore::new();
        assert_eq!(store.incr_by("hits", 1, None).await.unwrap(), 1);
        assert_eq!(store.incr_by("hits", 5, None).await.unwrap(), 6);
        assert_eq!(store.incr_by("hits", -2, None).await.unwrap(), 4);

        // A later increment without ttl keeps the expiry set earlier
        store
            .incr_by("daily", 1, Some(Duration::from_millis(30)))
            .await
            .unwrap();
        store.incr_by("daily", 1, None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!store.exists("daily").await.unwrap());
        assert_eq!(store.incr_by("daily", 1, None).await.unwrap(), 1);

        store.set("name", "not-a-number").await.unwrap();
        assert!(matches!(
            store.incr_by("name", 1, None).await,
            Err(Error::Store(_))
        ));
        store.set("max", &i64::MAX.to_string()).await.unwrap();
        assert!(store.incr_by("max", 1, None).await.is_err());
    }

    #[tokio::test]
    async fn test_set_delete_exists() {
        let store = MemoryStore::new();
        store.set("k", "v").await.unwrap();
        assert!(store.exists("k").await.unwrap());
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));

        assert!(store.delete("k").await.unwrap());
        assert!(!store.delete("k").await.unwrap());
        assert!(!store.exists("k").await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_prefix_leaves_other_keys() {
        let store = MemoryStore::new();
        store.set("cache:user:1", "a").await.unwrap();
        store.set("cache:user:2", "b").await.unwrap();
        store.set("cache:order:1", "c").await.unwrap();
        store
            .set_ex("cache:user:gone", "d", Duration::from_millis(1))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(store.delete_prefix("cache:user:").await.unwrap(), 2);
        assert!(!store.exists("cache:user:1").await.unwrap());
        assert!(store.exists("cache:order:1").await.unwrap());
    }

    #[tokio::test]
    async fn test_read_without_group_fails() {
        let store = MemoryStore::new();
        let streams = channels(&["orders$0"]);
        let read = GroupRead {
            group: "g",
            consumer: "c",
            streams: &streams,
            count: 10,
            block: Duration::from_millis(10),
        };

        assert!(matches!(
            store.read_group(&read).await,
            Err(Error::NoGroup(stream)) if stream == "orders$0"
        ));
    }

    #[tokio::test]
    async fn test_append_requires_existing_stream() {
        let store = MemoryStore::new();
        assert_eq!(store.append("orders$0", b"x", 100).await.unwrap(), None);

        store.create_group("orders$0", "g").await.unwrap();
        assert!(store.append("orders$0", b"x", 100).await.unwrap().is_some());
        assert_eq!(store.stream_len("orders$0"), 1);
    }

    #[tokio::test]
    async fn test_group_starts_at_tail_and_delivers_once() {
        let store = MemoryStore::new();
        store.create_group("orders$0", "early").await.unwrap();
        store.append("orders$0", b"before", 100).await.unwrap();
        store.create_group("orders$0", "late").await.unwrap();
        store.append("orders$0", b"after", 100).await.unwrap();

        let streams = channels(&["orders$0"]);
        let read = |group: &'static str| GroupRead {
            group,
            consumer: "c",
            streams: &streams,
            count: 10,
            block: Duration::from_millis(10),
        };

        let early = store.read_group(&read("early")).await.unwrap();
        let payloads: Vec<&[u8]> = early[0].entries.iter().map(|e| e.payload.as_slice()).collect();
        assert_eq!(payloads, vec![b"before".as_slice(), b"after".as_slice()]);

        let late = store.read_group(&read("late")).await.unwrap();
        assert_eq!(late[0].entries.len(), 1);
        assert_eq!(late[0].entries[0].payload, b"after");

        // Already delivered to the group
        assert!(store.read_group(&read("early")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_count_limits_each_stream() {
        let store = MemoryStore::new();
        store.create_group("s", "g").await.unwrap();
        for i in 0..5u8 {
            store.append("s", &[i], 100).await.unwrap();
        }

        let streams = channels(&["s"]);
        let read = GroupRead {
            group: "g",
            consumer: "c",
            streams: &streams,
            count: 2,
            block: Duration::from_millis(10),
        };
        assert_eq!(store.read_group(&read).await.unwrap()[0].entries.len(), 2);
        assert_eq!(store.read_group(&read).await.unwrap()[0].entries.len(), 2);
        assert_eq!(store.read_group(&read).await.unwrap()[0].entries.len(), 1);
    }

    #[tokio::test]
    async fn test_blocking_read_wakes_on_append() {
        let store = Arc::new(MemoryStore::new());
        store.create_group("s", "g").await.unwrap();

        let writer = store.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            writer.append("s", b"late", 100).await.unwrap();
        });

        let streams = channels(&["s"]);
        let read = GroupRead {
            group: "g",
            consumer: "c",
            streams: &streams,
            count: 10,
            block: Duration::from_secs(5),
        };
        let started = std::time::Instant::now();
        let batches = store.read_group(&read).await.unwrap();
        assert_eq!(batches[0].entries[0].payload, b"late");
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_blocking_read_times_out_empty() {
        let store = MemoryStore::new();
        store.create_group("s", "g").await.unwrap();
        let streams = channels(&["s"]);
        let read = GroupRead {
            group: "g",
            consumer: "c",
            streams: &streams,
            count: 10,
            block: Duration::from_millis(20),
        };
        assert!(store.read_group(&read).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_maxlen_trims_oldest() {
        let store = MemoryStore::new();
        store.create_group("s", "g").await.unwrap();
        for i in 0..10u8 {
            store.append("s", &[i], 3).await.unwrap();
        }
        assert_eq!(store.stream_len("s"), 3);
    }

    #[tokio::test]
    async fn test_pubsub_filters_channels() {
        let store = MemoryStore::new();
        let mut sub = store.subscribe(&channels(&["a"])).await.unwrap();

        store.publish("b", b"ignored").await.unwrap();
        store.publish("a", b"hello").await.unwrap();

        let msg = tokio::time::timeout(Duration::from_secs(1), sub.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(msg.channel, "a");
        assert_eq!(msg.payload, b"hello");
    }
