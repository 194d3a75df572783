//! Cluster-wide invalidation.
//!
//! Every write evicts the row locally and queues the `(table, hint)` pair for
//! every peer. A background loop flushes the queues; a notification that is
//! not acknowledged goes back into its peer's queue for a later cycle.

pub mod notifier;
pub mod pending;
pub mod roster;

pub use notifier::ClusterNotifier;
pub use pending::PendingInvalidations;
pub use roster::PeerEndpoint;

use crate::error::Result;
use crate::network::{CacheReply, CacheRequest};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::oneshot;

/// Eventual answer to a submitted request. A sender dropped without an
/// answer counts as a failure.
pub type ReplyReceiver = oneshot::Receiver<Result<CacheReply>>;

/// Connection to a peer node.
pub trait PeerClient: Send + Sync + 'static {
    /// Queue a request without waiting for it. Fails when the request cannot
    /// even be dispatched.
    fn submit(&self, request: CacheRequest) -> Result<ReplyReceiver>;
}

/// Creates [`PeerClient`]s for roster entries.
pub trait PeerConnector: Send + Sync + 'static {
    fn connect(&self, endpoint: &PeerEndpoint) -> Result<Arc<dyn PeerClient>>;
}

/// One queued invalidation, as sent to a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub table: String,
    /// Hint ids to drop. Empty means the whole table.
    pub hints: BTreeSet<i64>,
}

impl Notification {
    pub fn new(table: impl Into<String>, hints: BTreeSet<i64>) -> Self {
        Self {
            table: table.into(),
            hints,
        }
    }

    pub fn is_whole_table(&self) -> bool {
        self.hints.is_empty()
    }

    /// Request the receiving peer runs. Whole-table notifications are marked
    /// internal so the peer does not broadcast them again.
    pub fn to_request(&self) -> CacheRequest {
        if self.is_whole_table() {
            CacheRequest::InvalidateTable {
                table: self.table.clone(),
                internal: true,
            }
        } else {
            CacheRequest::Invalidate {
                table: self.table.clone(),
                hints: self.hints.iter().copied().collect(),
            }
        }
    }
}
