//! Metrics for the table cache.
//!
//! Two groups of counters:
//! - [`FetchMetrics`]: fetch calls and cache hit ratios, reported by the
//!   status operation
//! - [`NotifierMetrics`]: cluster invalidation delivery

mod counters;

pub use counters::{Counter, LabeledCounter};

/// Fetch statistics.
#[derive(Debug)]
pub struct FetchMetrics {
    /// Fetch calls.
    pub fetch_total: Counter,
    /// Fetch calls with some but not all keys served from cache.
    pub part_hits: Counter,
    /// Fetch calls with every key served from cache.
    pub full_hits: Counter,
    /// Keys requested.
    pub items_requested: Counter,
    /// Keys served from cache.
    pub items_hit: Counter,
}

impl FetchMetrics {
    pub fn new() -> Self {
        Self {
            fetch_total: Counter::new("tablecache_fetch_total"),
            part_hits: Counter::new("tablecache_fetch_part_hits_total"),
            full_hits: Counter::new("tablecache_fetch_full_hits_total"),
            items_requested: Counter::new("tablecache_fetch_items_total"),
            items_hit: Counter::new("tablecache_fetch_item_hits_total"),
        }
    }

    /// Record one fetch call of `requested` keys, `hit` of which were cached.
    pub fn record_fetch(&self, requested: usize, hit: usize) {
        self.fetch_total.inc();
        self.items_requested.inc_by(requested as u64);
        self.items_hit.inc_by(hit as u64);

        if hit == requested {
            self.full_hits.inc();
        } else if hit > 0 {
            self.part_hits.inc();
        }
    }
}

impl Default for FetchMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Cluster invalidation delivery statistics.
#[derive(Debug)]
pub struct NotifierMetrics {
    /// Notifications handed to a peer connection.
    pub sent: Counter,
    /// Notifications acknowledged by a peer.
    pub acknowledged: Counter,
    /// Notifications merged back into a peer's pending set.
    pub requeued: Counter,
    /// Notifications that could not be dispatched, even after a retry.
    pub dispatch_failures: Counter,
    /// Re-queued notifications per peer endpoint.
    pub requeued_by_peer: LabeledCounter,
}

impl NotifierMetrics {
    pub fn new() -> Self {
        Self {
            sent: Counter::new("tablecache_notify_sent_total"),
            acknowledged: Counter::new("tablecache_notify_acked_total"),
            requeued: Counter::new("tablecache_notify_requeued_total"),
            dispatch_failures: Counter::new("tablecache_notify_dispatch_failures_total"),
            requeued_by_peer: LabeledCounter::new("tablecache_notify_requeued_by_peer", "peer"),
        }
    }

    pub fn record_requeue(&self, endpoint: &str) {
        self.requeued.inc();
        self.requeued_by_peer.inc_by(endpoint, 1);
    }

    pub fn snapshot(&self) -> NotifierSnapshot {
        NotifierSnapshot {
            sent: self.sent.get(),
            acknowledged: self.acknowledged.get(),
            requeued: self.requeued.get(),
            dispatch_failures: self.dispatch_failures.get(),
        }
    }
}

impl Default for NotifierMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy of [`NotifierMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NotifierSnapshot {
    pub sent: u64,
    pub acknowledged: u64,
    pub requeued: u64,
    pub dispatch_failures: u64,
}
