//! Testing utilities for the table cache.
//!
//! - [`MockBackend`]: in-memory tables behind the [`StorageBackend`] trait,
//!   with call counting, scripted failures and a query gate
//! - [`RecordingConnector`] / [`RecordingPeer`]: peers that record the
//!   notifications they receive and answer from a script
//!
//! # Example
//!
//! ```rust,no_run
//! use tablecache::testing::{MockBackend, RecordingConnector};
//! use tablecache::{HintKey, ResponseKeyShape, TableCache, TableCacheConfig};
//! use std::sync::Arc;
//!
//! # async fn run() -> tablecache::Result<()> {
//! let backend = Arc::new(MockBackend::users());
//! let cache = TableCache::with_connector(
//!     TableCacheConfig::default(),
//!     backend.clone(),
//!     Arc::new(RecordingConnector::new()),
//! )
//! .await?;
//!
//! cache
//!     .fetch("users", &[HintKey::Int(1)], &[], ResponseKeyShape::Native)
//!     .await?;
//! assert_eq!(backend.query_count(), 1);
//! # Ok(())
//! # }
//! ```
//!
//! [`StorageBackend`]: crate::backend::StorageBackend

mod backend;
mod peers;

mod cache_integration_tests_basic;
mod cache_integration_tests_cluster;
#[cfg(test)]
mod utils;

pub use backend::MockBackend;
pub use peers::{AckMode, RecordingConnector, RecordingPeer};
