//! Two nodes talking over real TCP connections.

#[cfg(test)]
mod tests {
    use crate::cache::TableCache;
    use crate::cluster::ClusterNotifier;
    use crate::config::{ClusterConfig, TableCacheConfig};
    use crate::network::{CacheReply, CacheRequest, ClientConfig, RpcClient, TcpConnector};
    use crate::testing::utils::{allocate_os_ports, init_tracing, wait_for};
    use crate::testing::MockBackend;
    use crate::types::{HintKey, ResponseKeyShape};
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use std::time::Duration;

    const WAIT: Duration = Duration::from_secs(5);

    async fn start_node(port: u16, roster: &[String], backend: Arc<MockBackend>) -> Arc<TableCache> {
        let config = TableCacheConfig::new(format!("127.0.0.1:{}", port).parse().unwrap())
            .with_backend_timeout(Duration::from_secs(2))
            .with_cluster_config(
                ClusterConfig::default()
                    .with_peers(roster.iter().cloned())
                    .with_notify_interval(Duration::from_millis(20))
                    .with_notify_timeout(Duration::from_millis(500)),
            );

        let cache = Arc::new(TableCache::new(config, backend).await.unwrap());
        cache.serve().await.unwrap();
        cache
    }

    async fn two_nodes() -> (Arc<TableCache>, Arc<TableCache>, Arc<MockBackend>, Vec<String>) {
        init_tracing();
        let ports = allocate_os_ports(2).await;
        let roster: Vec<String> = ports.iter().map(|p| format!("127.0.0.1:{}", p)).collect();

        // Both nodes front the same database.
        let backend = Arc::new(MockBackend::users());
        let a = start_node(ports[0], &roster, backend.clone()).await;
        let b = start_node(ports[1], &roster, backend.clone()).await;
        (a, b, backend, roster)
    }

    fn name_only() -> Vec<String> {
        vec!["name".to_string()]
    }

    #[tokio::test]
    async fn test_each_node_sees_only_the_other() {
        let (a, b, _, roster) = two_nodes().await;

        assert_eq!(a.notifier().peers(), vec![roster[1].clone()]);
        assert_eq!(b.notifier().peers(), vec![roster[0].clone()]);

        a.shutdown().await;
        b.shutdown().await;
    }

    #[tokio::test]
    async fn test_write_on_one_node_evicts_on_the_other() {
        let (a, b, _, _) = two_nodes().await;

        b.fetch("users", &[HintKey::Int(1)], &name_only(), ResponseKeyShape::Native)
            .await
            .unwrap();
        assert!(b.contains("users", 1));

        let mut values = BTreeMap::new();
        values.insert("name".to_string(), "zed".to_string());
        a.modify("users", &HintKey::Int(1), &values).await.unwrap();

        assert!(wait_for(|| !b.contains("users", 1), WAIT).await);
        assert!(wait_for(|| a.notifier().metrics().acknowledged >= 1, WAIT).await);

        let rows = b
            .fetch("users", &[HintKey::Int(1)], &name_only(), ResponseKeyShape::Native)
            .await
            .unwrap();
        assert_eq!(rows.get(&HintKey::Int(1)), Some(&vec!["zed".to_string()]));

        a.shutdown().await;
        b.shutdown().await;
    }

    #[tokio::test]
    async fn test_table_invalidation_reaches_peer_without_echo() {
        let (a, b, _, roster) = two_nodes().await;

        b.fetch("users", &[HintKey::Int(2)], &[], ResponseKeyShape::Native)
            .await
            .unwrap();
        assert!(b.has_schema("users"));

        a.invalidate_table("users", false);
        assert!(wait_for(|| !b.has_schema("users"), WAIT).await);

        // The peer applied it as internal and queued nothing back.
        let pending = b.notifier().pending_for(&roster[0]).unwrap();
        assert!(pending.get("users").is_none());

        a.shutdown().await;
        b.shutdown().await;
    }

    #[tokio::test]
    async fn test_client_requests_over_tcp() {
        let (a, b, _, roster) = two_nodes().await;
        let client = RpcClient::new(roster[0].clone(), ClientConfig::default());

        let reply = client
            .call(CacheRequest::Fetch {
                table: "users".into(),
                key: None,
                keys: vec![HintKey::Int(1), HintKey::Int(3)],
                fields: name_only(),
                shape: ResponseKeyShape::String,
            })
            .await
            .unwrap();
        match reply {
            CacheReply::Rows(rows) => {
                assert_eq!(rows.get(&HintKey::from("1")), Some(&vec!["alice".to_string()]));
                assert_eq!(rows.get(&HintKey::from("3")), Some(&vec!["carol".to_string()]));
            }
            other => panic!("unexpected reply: {:?}", other),
        }

        let err = client
            .call(CacheRequest::Fetch {
                table: "missing".into(),
                key: Some(HintKey::Int(1)),
                keys: Vec::new(),
                fields: Vec::new(),
                shape: ResponseKeyShape::Native,
            })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("missing"), "{}", err);

        match client.call(CacheRequest::Status).await.unwrap() {
            CacheReply::Status(status) => {
                assert_eq!(status.fetch_count, 1);
                assert_eq!(status.cached_items_per_table.get("users"), Some(&2));
            }
            other => panic!("unexpected reply: {:?}", other),
        }

        assert!(matches!(
            client.call(CacheRequest::RefreshCluster).await,
            Ok(CacheReply::Empty)
        ));

        a.shutdown().await;
        b.shutdown().await;
    }

    #[tokio::test]
    async fn test_notifications_redelivered_after_peer_starts() {
        init_tracing();
        let ports = allocate_os_ports(2).await;
        let roster: Vec<String> = ports.iter().map(|p| format!("127.0.0.1:{}", p)).collect();
        let backend = Arc::new(MockBackend::users());

        let a = start_node(ports[0], &roster, backend.clone()).await;
        a.delete("users", &HintKey::Int(2)).await.unwrap();

        // Nobody listens on the peer port yet: the notification keeps
        // coming back into the queue.
        assert!(wait_for(|| a.notifier().metrics().requeued >= 1, WAIT).await);

        let b = start_node(ports[1], &roster, backend).await;
        assert!(wait_for(|| a.notifier().metrics().acknowledged >= 1, WAIT).await);
        assert!(a.notifier().pending_for(&roster[1]).unwrap().is_empty());

        a.shutdown().await;
        b.shutdown().await;
    }

    #[tokio::test]
    async fn test_silent_peer_keeps_every_table_pending() {
        init_tracing();

        // A peer that accepts and reads but never answers.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let peer = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    while let Ok(n) = tokio::io::AsyncReadExt::read(&mut socket, &mut buf).await {
                        if n == 0 {
                            break;
                        }
                    }
                });
            }
        });

        let cluster = ClusterConfig::default()
            .with_peers([peer.clone()])
            .with_notify_interval(Duration::from_millis(20))
            .with_notify_timeout(Duration::from_millis(100))
            .with_queue_depth(4);
        let connector = Arc::new(TcpConnector::new(ClientConfig::from(&cluster)));
        let notifier = ClusterNotifier::new(13799, cluster, connector);

        for table in ["orders", "sessions", "users", "carts"] {
            notifier.invalidate(table, 1);
        }
        notifier.start();
        tokio::time::sleep(Duration::from_millis(1500)).await;
        notifier.shutdown().await;

        // Let the last in-flight notifications time out and come back.
        tokio::time::sleep(Duration::from_millis(300)).await;

        let metrics = notifier.metrics();
        assert!(metrics.sent > 4, "{:?}", metrics);
        assert_eq!(metrics.acknowledged, 0);
        assert_eq!(metrics.dispatch_failures, 0);
        assert_eq!(notifier.pending_for(&peer).unwrap().len(), 4);
    }
}
