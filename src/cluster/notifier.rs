//! Broadcaster of invalidations to the other nodes of the cluster.

use super::pending::PendingInvalidations;
use super::roster::{load_roster, self_endpoints, PeerEndpoint};
use super::{Notification, PeerClient, PeerConnector, ReplyReceiver};
use crate::config::ClusterConfig;
use crate::error::Result;
use crate::metrics::{NotifierMetrics, NotifierSnapshot};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

/// A roster member and its queued invalidations.
struct PeerState {
    client: Arc<dyn PeerClient>,
    pending: PendingInvalidations,
}

struct Shared {
    /// Peers keyed by endpoint. Held only for map updates, never across I/O.
    peers: Mutex<HashMap<String, PeerState>>,
    connector: Arc<dyn PeerConnector>,
    self_endpoints: HashSet<String>,
    config: ClusterConfig,
    metrics: NotifierMetrics,
}

/// Queues invalidations per peer and delivers them from a background loop.
///
/// Delivery is at least once: a notification that is not acknowledged within
/// the notify timeout is merged back into the peer's queue.
pub struct ClusterNotifier {
    shared: Arc<Shared>,
    shutdown_tx: Mutex<Option<mpsc::Sender<()>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ClusterNotifier {
    /// Create a notifier for a node listening on `listen_port` and load the
    /// roster. The flush loop is not running until [`start`](Self::start).
    pub fn new(listen_port: u16, config: ClusterConfig, connector: Arc<dyn PeerConnector>) -> Self {
        let shared = Arc::new(Shared {
            peers: Mutex::new(HashMap::new()),
            connector,
            self_endpoints: self_endpoints(listen_port, &config),
            config,
            metrics: NotifierMetrics::new(),
        });

        let notifier = Self {
            shared,
            shutdown_tx: Mutex::new(None),
            task: Mutex::new(None),
        };
        notifier.refresh();
        notifier
    }

    /// Spawn the flush loop. Calling it again while running is a no-op.
    pub fn start(&self) {
        let mut task = self.task.lock();
        if task.is_some() {
            return;
        }

        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let shared = self.shared.clone();
        *task = Some(tokio::spawn(run_flush_loop(shared, shutdown_rx)));
        *self.shutdown_tx.lock() = Some(shutdown_tx);
    }

    /// Stop the flush loop and wait for it to exit.
    pub async fn shutdown(&self) {
        let shutdown_tx = self.shutdown_tx.lock().take();
        if let Some(tx) = shutdown_tx {
            let _ = tx.send(()).await;
        }

        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    /// Queue a row invalidation for every peer.
    pub fn invalidate(&self, table: &str, hint: i64) {
        let mut peers = self.shared.peers.lock();
        for peer in peers.values_mut() {
            peer.pending.add_hint(table, hint);
        }
        trace!(table, hint, peers = peers.len(), "Queued row invalidation");
    }

    /// Queue a whole-table invalidation for every peer.
    pub fn invalidate_table(&self, table: &str) {
        let mut peers = self.shared.peers.lock();
        for peer in peers.values_mut() {
            peer.pending.add_table(table);
        }
        debug!(table, peers = peers.len(), "Queued table invalidation");
    }

    /// Reload the roster. Peers still listed keep their connection and their
    /// queued invalidations; peers no longer listed are dropped with theirs.
    /// Returns the number of peers.
    pub fn refresh(&self) -> usize {
        self.shared.refresh()
    }

    /// Endpoints of the current peers, sorted.
    pub fn peers(&self) -> Vec<String> {
        let mut peers: Vec<String> = self.shared.peers.lock().keys().cloned().collect();
        peers.sort();
        peers
    }

    /// Copy of the invalidations queued for a peer.
    pub fn pending_for(&self, endpoint: &str) -> Option<PendingInvalidations> {
        self.shared
            .peers
            .lock()
            .get(endpoint)
            .map(|peer| peer.pending.clone())
    }

    pub fn metrics(&self) -> NotifierSnapshot {
        self.shared.metrics.snapshot()
    }

    /// Re-queued notifications for one peer.
    pub fn requeued_for(&self, endpoint: &str) -> u64 {
        self.shared.metrics.requeued_by_peer.get(endpoint)
    }

    /// Run one flush cycle now. Returns the acknowledgement waiters so a
    /// caller can wait for the cycle to settle.
    pub(crate) fn flush(&self) -> Vec<JoinHandle<()>> {
        self.shared.flush()
    }
}

impl std::fmt::Debug for ClusterNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterNotifier")
            .field("peers", &self.peers())
            .field("running", &self.task.lock().is_some())
            .finish()
    }
}

async fn run_flush_loop(shared: Arc<Shared>, mut shutdown_rx: mpsc::Receiver<()>) {
    let mut interval = tokio::time::interval(shared.config.notify_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    info!(
        interval_ms = shared.config.notify_interval.as_millis() as u64,
        "Cluster notifier started"
    );

    loop {
        tokio::select! {
            _ = interval.tick() => {
                shared.flush();
            }
            _ = shutdown_rx.recv() => {
                info!("Cluster notifier shutting down");
                break;
            }
        }
    }
}

impl Shared {
    fn is_self(&self, endpoint: &PeerEndpoint) -> bool {
        self.self_endpoints.contains(&endpoint.normalized())
    }

    fn refresh(&self) -> usize {
        let listed: Vec<PeerEndpoint> = load_roster(&self.config.roster)
            .into_iter()
            .filter(|endpoint| {
                let is_self = self.is_self(endpoint);
                if is_self {
                    debug!(endpoint = %endpoint, "Skipping self in peer roster");
                }
                !is_self
            })
            .collect();

        // Connect new peers outside the lock.
        let known: HashSet<String> = self.peers.lock().keys().cloned().collect();
        let mut connected = HashMap::new();
        for endpoint in &listed {
            let key = endpoint.to_string();
            if known.contains(&key) {
                continue;
            }
            match self.connector.connect(endpoint) {
                Ok(client) => {
                    connected.insert(key, client);
                }
                Err(e) => warn!(endpoint = %endpoint, error = %e, "Failed to create peer client"),
            }
        }

        let mut peers = self.peers.lock();
        let mut next = HashMap::with_capacity(listed.len());
        let mut added = 0usize;
        for endpoint in &listed {
            let key = endpoint.to_string();
            if let Some(state) = peers.remove(&key) {
                next.insert(key, state);
            } else if let Some(client) = connected.remove(&key) {
                added += 1;
                next.insert(
                    key,
                    PeerState {
                        client,
                        pending: PendingInvalidations::new(),
                    },
                );
            }
        }

        let removed = peers.len();
        for endpoint in peers.keys() {
            self.metrics.requeued_by_peer.remove(endpoint);
            debug!(endpoint = %endpoint, "Peer left the roster");
        }
        *peers = next;

        let count = peers.len();
        info!(peers = count, added, removed, "Cluster roster refreshed");
        if count == 0 {
            warn!("No cluster peers configured, running in single-node mode");
        }
        count
    }

    fn flush(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let batches: Vec<(String, Arc<dyn PeerClient>, PendingInvalidations)> = {
            let mut peers = self.peers.lock();
            peers
                .iter_mut()
                .filter(|(_, peer)| !peer.pending.is_empty())
                .map(|(endpoint, peer)| (endpoint.clone(), peer.client.clone(), peer.pending.take()))
                .collect()
        };

        let mut waiters = Vec::new();
        for (endpoint, client, pending) in batches {
            for (table, hints) in pending {
                let notification = Notification::new(table, hints);
                match dispatch(client.as_ref(), &notification) {
                    Ok(reply) => {
                        self.metrics.sent.inc();
                        waiters.push(tokio::spawn(await_ack(
                            self.clone(),
                            endpoint.clone(),
                            notification,
                            reply,
                        )));
                    }
                    Err(e) => {
                        // Dropped for this cycle.
                        self.metrics.dispatch_failures.inc();
                        warn!(
                            endpoint = %endpoint,
                            table = %notification.table,
                            error = %e,
                            "Failed to dispatch notification twice, dropping it"
                        );
                    }
                }
            }
        }

        waiters
    }

    fn requeue(&self, endpoint: &str, notification: Notification) {
        let mut peers = self.peers.lock();
        match peers.get_mut(endpoint) {
            Some(peer) => {
                peer.pending.merge(&notification.table, notification.hints);
                self.metrics.record_requeue(endpoint);
            }
            None => debug!(endpoint, "Peer gone, dropping notification"),
        }
    }
}

/// Submit a notification, retrying once if it cannot be dispatched.
fn dispatch(client: &dyn PeerClient, notification: &Notification) -> Result<ReplyReceiver> {
    client
        .submit(notification.to_request())
        .or_else(|_| client.submit(notification.to_request()))
}

async fn await_ack(
    shared: Arc<Shared>,
    endpoint: String,
    notification: Notification,
    reply: ReplyReceiver,
) {
    let timeout: Duration = shared.config.notify_timeout;
    let reason = match tokio::time::timeout(timeout, reply).await {
        Ok(Ok(Ok(_))) => {
            shared.metrics.acknowledged.inc();
            return;
        }
        Ok(Ok(Err(e))) => e.to_string(),
        Ok(Err(_)) => "connection dropped the request".to_string(),
        Err(_) => "timed out".to_string(),
    };

    debug!(
        endpoint = %endpoint,
        table = %notification.table,
        hints = notification.hints.len(),
        reason = %reason,
        "Notification not acknowledged, re-queued"
    );
    shared.requeue(&endpoint, notification);
}
