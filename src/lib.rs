//! Row-level read/write cache in front of a relational storage proxy.
//!
//! Several service instances share one database through a storage proxy.
//! Each instance keeps recently read rows in memory, writes through to the
//! backend, and tells every other instance to drop rows it wrote, so that no
//! node keeps serving a row after another node changed it.
//!
//! # Example
//!
//! ```rust,no_run
//! use tablecache::testing::MockBackend;
//! use tablecache::{ClusterConfig, HintKey, ResponseKeyShape, TableCache, TableCacheConfig};
//! use std::collections::BTreeMap;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = TableCacheConfig::new("0.0.0.0:13799".parse()?)
//!         .with_cache_capacity(1_000_000)
//!         .with_cluster_config(ClusterConfig::default().with_roster_file("/etc/tablecache/peers"));
//!
//!     let cache = Arc::new(TableCache::new(config, Arc::new(MockBackend::users())).await?);
//!     cache.serve().await?;
//!
//!     // Served from the backend, then from memory.
//!     let rows = cache
//!         .fetch("users", &[HintKey::Int(1)], &["name".into()], ResponseKeyShape::Native)
//!         .await?;
//!     println!("{:?}", rows);
//!
//!     // Written through, evicted here and on every peer.
//!     let mut values = BTreeMap::new();
//!     values.insert("name".to_string(), "zed".to_string());
//!     cache.modify("users", &HintKey::Int(1), &values).await?;
//!
//!     cache.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! ```text
//!        clients / peers (TCP)
//!                │
//!                ▼
//! ┌─────────────────────────────┐      ┌──────────────────────┐
//! │         TableCache          │─────▶│   StorageBackend     │
//! │  fetch / modify / delete    │      │ describe, split col, │
//! │  invalidate / status        │      │ query, write         │
//! └─────────────────────────────┘      └──────────────────────┘
//!     │              │
//!     ▼              ▼
//! ┌─────────┐  ┌──────────────────┐
//! │ Schemas │  │ ClusterNotifier  │──▶ peers: invalidate / invalidate_table
//! │ + rows  │  │ per-peer pending │
//! └─────────┘  └──────────────────┘
//! ```
//!
//! # Consistency
//!
//! - A write always evicts the row locally, whether or not the backend
//!   accepted it, and queues the eviction for every peer.
//! - Peer notifications are delivered at least once; unacknowledged ones are
//!   queued again. Peers converge, they are not linearizable.

pub mod backend;
pub mod cache;
pub mod cluster;
pub mod config;
pub mod error;
pub mod metrics;
pub mod network;
pub mod testing;
pub mod types;

// Re-export main types for convenience
pub use backend::{BackendResult, RowQuery, RowWrite, Rows, Statement, StorageBackend};
pub use cache::{CacheRequestHandler, TableCache};
pub use config::{ClusterConfig, PeerRoster, TableCacheConfig, MIN_CACHE_CAPACITY};
pub use error::{BackendError, Error, NetworkError, RemoteError, RemoteErrorKind, Result};
pub use types::{string_hint, CacheKey, CacheStatus, HintKey, ResponseKeyShape, RowMap};

// Re-export cluster types
pub use cluster::{ClusterNotifier, Notification, PeerClient, PeerConnector, PeerEndpoint};

// Re-export network types
pub use network::{CacheReply, CacheRequest, ClientConfig, RpcClient, TcpConnector};

// Re-export metrics types
pub use metrics::{Counter, FetchMetrics, LabeledCounter, NotifierMetrics, NotifierSnapshot};
