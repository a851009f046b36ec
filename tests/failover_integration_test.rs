// Integration tests for heartbeat liveness and failed-peer reclamation.

#[cfg(test)]
mod failover_integration_tests {
    use std::sync::Arc;
    use std::time::Duration;

    use chrono::Utc;

    use phonon::reference::Counting;
    use phonon::store::{MemoryStore, SharedStore};
    use phonon::{Connection, ConnectionConfig};

    fn test_config() -> ConnectionConfig {
        ConnectionConfig {
            heartbeat_interval: Duration::from_secs(300),
            ..Default::default()
        }
    }

    async fn connect(store: &Arc<MemoryStore>) -> Arc<Connection> {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
        let shared: Arc<dyn SharedStore> = Arc::clone(store) as Arc<dyn SharedStore>;
        let conn = Connection::with_store(shared, test_config()).await.unwrap();
        wait_for_beat(store, &conn.id()).await;
        conn
    }

    /// Let the connection's immediate first heartbeat land before the test
    /// starts rewriting timestamps underneath it.
    async fn wait_for_beat(store: &Arc<MemoryStore>, node_id: &str) {
        for _ in 0..200 {
            let beats = store.hgetall("phonon_heartbeat").await.unwrap();
            if beats.contains_key(node_id) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("initial heartbeat never arrived for {}", node_id);
    }

    fn now_ms() -> i64 {
        Utc::now().timestamp_millis()
    }

    async fn mark_failed(store: &Arc<MemoryStore>, node_id: &str, config: &ConnectionConfig) {
        let stale = now_ms() - config.failure_threshold().as_millis() as i64 - 1000;
        store
            .hset("phonon_heartbeat", node_id, &stale.to_string())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_failed_peer_references_move_to_survivor() {
        let store = Arc::new(MemoryStore::new());
        let c1 = connect(&store).await;
        let c2 = connect(&store).await;

        // C1 holds references to r1 and r2, then its heartbeat lapses.
        let _r1 = c1.create_reference("r1", Counting::Membership).await.unwrap();
        let _r2 = c1.create_reference("r2", Counting::Membership).await.unwrap();
        let c1_id = c1.id();
        mark_failed(&store, &c1_id, c1.config()).await;

        c2.send_heartbeat().await.unwrap();

        // Both resources now belong to C2's registry.
        let mut adopted = c2.registry().await.unwrap();
        adopted.sort();
        assert_eq!(adopted, vec!["r1".to_string(), "r2".to_string()]);

        // The nodelists carry C2 and no longer carry C1.
        for resource in ["r1", "r2"] {
            let nodes = store
                .hgetall(&format!("phonon_{}.nodelist", resource))
                .await
                .unwrap();
            assert!(nodes.contains_key(&c2.id()));
            assert!(!nodes.contains_key(&c1_id));
        }

        // The failed heartbeat entry is gone.
        let beats = store.hgetall("phonon_heartbeat").await.unwrap();
        assert!(!beats.contains_key(&c1_id));

        c1.close().await.unwrap();
        c2.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_heartbeat_before_reclamation_cancels_failed_state() {
        let store = Arc::new(MemoryStore::new());
        let c1 = connect(&store).await;
        let c2 = connect(&store).await;

        let _r1 = c1.create_reference("r1", Counting::Membership).await.unwrap();
        mark_failed(&store, &c1.id(), c1.config()).await;

        // C1 beats again before anyone notices; it keeps its identity and
        // its registry.
        let original_id = c1.id();
        c1.send_heartbeat().await.unwrap();
        assert_eq!(c1.id(), original_id);

        c2.send_heartbeat().await.unwrap();
        assert_eq!(c1.registry().await.unwrap(), vec!["r1".to_string()]);
        assert!(c2.registry().await.unwrap().is_empty());

        c1.close().await.unwrap();
        c2.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_self_recovery_abandons_old_registry_to_peers() {
        let store = Arc::new(MemoryStore::new());
        let c1 = connect(&store).await;
        let c2 = connect(&store).await;

        let _r1 = c1.create_reference("r1", Counting::Membership).await.unwrap();
        let old_id = c1.id();
        mark_failed(&store, &old_id, c1.config()).await;

        // C1 observes its own lapsed entry: fresh identity, old registry
        // left in place for peers.
        c1.recover_failed_processes().await.unwrap();
        assert_ne!(c1.id(), old_id);
        assert_eq!(
            store.smembers(&format!("phonon_{}", old_id)).await.unwrap(),
            vec!["r1".to_string()]
        );

        // The old identity never beats again, so a peer reclaims its
        // registry.
        c2.send_heartbeat().await.unwrap();
        assert_eq!(c2.registry().await.unwrap(), vec!["r1".to_string()]);

        c1.close().await.unwrap();
        c2.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_orphans_drain_across_survivors() {
        let store = Arc::new(MemoryStore::new());
        let shared: Arc<dyn SharedStore> = Arc::clone(&store) as Arc<dyn SharedStore>;
        let c1 = connect(&store).await;
        let c2 = connect(&store).await;

        // A dead node with four orphaned resources.
        let dead_id = "dead-node";
        for resource in ["o1", "o2", "o3", "o4"] {
            shared
                .sadd(&format!("phonon_{}", dead_id), resource)
                .await
                .unwrap();
        }
        mark_failed(&store, dead_id, c1.config()).await;

        // Survivors beat in turns; the per-round quota max(1, orphans/active)
        // drains the registry within a bounded number of rounds.
        for _ in 0..4 {
            c1.send_heartbeat().await.unwrap();
            c2.send_heartbeat().await.unwrap();
        }

        let mut r1 = c1.registry().await.unwrap();
        let mut r2 = c2.registry().await.unwrap();
        r1.sort();
        r2.sort();

        assert_eq!(r1.len() + r2.len(), 4);
        assert!(r1.iter().all(|r| !r2.contains(r)));
        let mut all: Vec<String> = r1.into_iter().chain(r2).collect();
        all.sort();
        assert_eq!(all, vec!["o1", "o2", "o3", "o4"]);

        // Both survivors took part in the reclamation.
        assert!(!c1.registry().await.unwrap().is_empty());
        assert!(!c2.registry().await.unwrap().is_empty());

        // Fully drained: the dead heartbeat entry is removed.
        let beats = store.hgetall("phonon_heartbeat").await.unwrap();
        assert!(!beats.contains_key(dead_id));

        c1.close().await.unwrap();
        c2.close().await.unwrap();
    }
}
