//! Configuration types for the table cache.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Smallest row cache capacity a node will run with.
pub const MIN_CACHE_CAPACITY: usize = 1024;

/// Main configuration for a table cache node.
#[derive(Debug, Clone)]
pub struct TableCacheConfig {
    /// Address the RPC server listens on. Its port is also the port peers
    /// use to reach this node.
    pub listen_addr: SocketAddr,

    /// Target number of cached rows.
    pub cache_capacity: usize,

    /// Timeout applied to each storage backend call.
    pub backend_timeout: Duration,

    /// Cluster invalidation configuration.
    pub cluster: ClusterConfig,
}

impl Default for TableCacheConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 13799)),
            cache_capacity: 64 * 1024 * 1024,
            backend_timeout: Duration::from_secs(15),
            cluster: ClusterConfig::default(),
        }
    }
}

impl TableCacheConfig {
    /// Create a new configuration listening on the given address.
    pub fn new(listen_addr: SocketAddr) -> Self {
        Self {
            listen_addr,
            ..Default::default()
        }
    }

    /// Set the row cache capacity.
    pub fn with_cache_capacity(mut self, capacity: usize) -> Self {
        self.cache_capacity = capacity;
        self
    }

    /// Set the storage backend call timeout.
    pub fn with_backend_timeout(mut self, timeout: Duration) -> Self {
        self.backend_timeout = timeout;
        self
    }

    /// Set the cluster configuration.
    pub fn with_cluster_config(mut self, cluster: ClusterConfig) -> Self {
        self.cluster = cluster;
        self
    }

    /// Row cache capacity actually used, never below [`MIN_CACHE_CAPACITY`].
    pub fn effective_capacity(&self) -> usize {
        self.cache_capacity.max(MIN_CACHE_CAPACITY)
    }
}

/// Where the list of cluster peers comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerRoster {
    /// A file with one `host:port` per line. Blank lines and lines starting
    /// with `#` are ignored. The file is re-read on every refresh.
    File(PathBuf),

    /// A fixed list of `host:port` endpoints.
    Static(Vec<String>),
}

impl Default for PeerRoster {
    fn default() -> Self {
        PeerRoster::Static(Vec::new())
    }
}

/// Cluster invalidation configuration.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Source of the peer list.
    pub roster: PeerRoster,

    /// Interval between two flushes of pending invalidations.
    pub notify_interval: Duration,

    /// How long a peer has to acknowledge a notification.
    pub notify_timeout: Duration,

    /// Timeout for establishing a connection to a peer.
    pub connect_timeout: Duration,

    /// Maximum number of queued requests per peer connection.
    pub queue_depth: usize,

    /// Local IPv4 address of this node, if known.
    pub local_ip: Option<String>,

    /// Public IPv4 address of this node, if known.
    pub public_ip: Option<String>,

    /// Domain name of this node, if any.
    pub domain: Option<String>,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            roster: PeerRoster::default(),
            notify_interval: Duration::from_millis(100),
            notify_timeout: Duration::from_secs(2),
            connect_timeout: Duration::from_secs(2),
            queue_depth: 1024,
            local_ip: None,
            public_ip: None,
            domain: None,
        }
    }
}

impl ClusterConfig {
    /// Read peers from a roster file.
    pub fn with_roster_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.roster = PeerRoster::File(path.into());
        self
    }

    /// Use a fixed peer list.
    pub fn with_peers<I, S>(mut self, peers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.roster = PeerRoster::Static(peers.into_iter().map(Into::into).collect());
        self
    }

    /// Set the flush interval.
    pub fn with_notify_interval(mut self, interval: Duration) -> Self {
        self.notify_interval = interval;
        self
    }

    /// Set the acknowledgement timeout for peer notifications.
    pub fn with_notify_timeout(mut self, timeout: Duration) -> Self {
        self.notify_timeout = timeout;
        self
    }

    /// Set the timeout for connecting to a peer.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set how many requests may queue per peer connection.
    pub fn with_queue_depth(mut self, depth: usize) -> Self {
        self.queue_depth = depth;
        self
    }

    /// Set the local IP self-address hint.
    pub fn with_local_ip(mut self, ip: impl Into<String>) -> Self {
        self.local_ip = Some(ip.into());
        self
    }

    /// Set the public IP self-address hint.
    pub fn with_public_ip(mut self, ip: impl Into<String>) -> Self {
        self.public_ip = Some(ip.into());
        self
    }

    /// Set the domain self-address hint.
    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }
}
