//! Run a single table cache node over an in-memory backend.
//!
//! ```text
//! cargo run --example node -- 127.0.0.1:13799 peers.list
//! ```
//!
//! The optional second argument is a roster file with one `host:port` per
//! line. Start several nodes sharing one roster file to watch invalidations
//! travel between them (`RUST_LOG=tablecache=debug`).

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tablecache::testing::MockBackend;
use tablecache::{ClusterConfig, HintKey, ResponseKeyShape, TableCache, TableCacheConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tablecache=info".into()),
        )
        .init();

    let mut args = std::env::args().skip(1);
    let listen_addr: SocketAddr = args
        .next()
        .unwrap_or_else(|| "127.0.0.1:13799".to_string())
        .parse()?;

    let mut cluster = ClusterConfig::default();
    if let Some(roster) = args.next() {
        cluster = cluster.with_roster_file(roster);
    }

    let config = TableCacheConfig::new(listen_addr)
        .with_cache_capacity(100_000)
        .with_cluster_config(cluster);

    let cache = Arc::new(TableCache::new(config, Arc::new(MockBackend::users())).await?);
    let addr = cache.serve().await?;
    println!("Table cache listening on {}", addr);
    println!("Peers: {:?}", cache.notifier().peers());

    // Warm the cache and show one write-through.
    let fields = vec!["name".to_string(), "score".to_string()];
    let rows = cache
        .fetch("users", &[HintKey::Int(1), HintKey::Int(2)], &fields, ResponseKeyShape::Native)
        .await?;
    println!("Fetched: {:?}", rows);

    let mut values = BTreeMap::new();
    values.insert("score".to_string(), "11".to_string());
    cache.modify("users", &HintKey::Int(1), &values).await?;

    let rows = cache
        .fetch("users", &[HintKey::Int(1), HintKey::Int(2)], &fields, ResponseKeyShape::Native)
        .await?;
    println!("After modify: {:?}", rows);
    println!("Status: {}", cache.status().to_json());

    println!("Press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;

    cache.shutdown().await;
    Ok(())
}
