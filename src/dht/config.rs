use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use super::error::DhtError;
use super::id::InfoHash;

/// Public Mainline routers used to join the network.
pub const BOOTSTRAP_NODES: &[&str] = &[
    "router.bittorrent.com:6881",
    "dht.transmissionbt.com:6881",
    "router.utorrent.com:6881",
];

/// Transport family for the DHT socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    /// Whatever family the bind address has.
    Udp,
    Udp4,
    Udp6,
}

impl Network {
    pub fn accepts(&self, addr: &SocketAddr) -> bool {
        match self {
            Network::Udp => true,
            Network::Udp4 => addr.is_ipv4(),
            Network::Udp6 => addr.is_ipv6(),
        }
    }
}

/// Hooks for queries other nodes send us.
///
/// Both methods default to doing nothing.
pub trait DhtHandler: Send + Sync {
    /// A node asked us for peers of `info_hash`. `port` is the port the
    /// query came from.
    fn on_get_peers(&self, _ip: IpAddr, _info_hash: &InfoHash, _port: u16) {}

    /// A node with a valid token announced it has `info_hash` on `port`.
    fn on_announce_peer(&self, _ip: IpAddr, _info_hash: &InfoHash, _port: u16) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHandler;

impl DhtHandler for NoopHandler {}

/// DHT node configuration.
#[derive(Clone)]
pub struct DhtConfig {
    /// Nodes per bucket; 8 in Mainline.
    pub k: usize,
    pub network: Network,
    /// `ip:port` to bind.
    pub address: String,
    /// `host:port` of the nodes used to join the network.
    pub prime_nodes: Vec<String>,
    /// A bucket untouched for this long gets refreshed.
    pub bucket_expiry: Duration,
    /// A node silent for this long may be replaced.
    pub node_expiry: Duration,
    pub bucket_check_period: Duration,
    pub token_expiry: Duration,
    pub token_sweep_period: Duration,
    /// Transaction ids wrap at this value.
    pub max_transaction_cursor: u64,
    /// Routing table capacity.
    pub max_nodes: usize,
    /// Attempts per query before giving up.
    pub tries: u32,
    /// How long to wait for a reply to one attempt.
    pub query_timeout: Duration,
    /// Capacity of the inbound packet queue.
    pub packet_job_limit: usize,
    /// Packets handled concurrently.
    pub packet_worker_limit: usize,
    /// Nodes queried per stale bucket.
    pub refresh_node_num: usize,
    pub lookup_poll_interval: Duration,
    pub lookup_poll_attempts: u32,
    pub handler: Arc<dyn DhtHandler>,
}

impl Default for DhtConfig {
    fn default() -> Self {
        Self {
            k: 8,
            network: Network::Udp4,
            address: "0.0.0.0:4444".to_string(),
            prime_nodes: BOOTSTRAP_NODES.iter().map(|s| s.to_string()).collect(),
            bucket_expiry: Duration::from_secs(15 * 60),
            node_expiry: Duration::from_secs(15 * 60),
            bucket_check_period: Duration::from_secs(30),
            token_expiry: Duration::from_secs(10 * 60),
            token_sweep_period: Duration::from_secs(3 * 60),
            max_transaction_cursor: u32::MAX as u64,
            max_nodes: 5000,
            tries: 2,
            query_timeout: Duration::from_secs(15),
            packet_job_limit: 1024,
            packet_worker_limit: 256,
            refresh_node_num: 8,
            lookup_poll_interval: Duration::from_secs(1),
            lookup_poll_attempts: 30,
            handler: Arc::new(NoopHandler),
        }
    }
}

impl DhtConfig {
    pub fn with_handler(mut self, handler: impl DhtHandler + 'static) -> Self {
        self.handler = Arc::new(handler);
        self
    }

    /// Parses the bind address and checks every limit is usable.
    pub fn validate(&self) -> Result<SocketAddr, DhtError> {
        let nonzero = [
            ("k", self.k as u64),
            ("max_nodes", self.max_nodes as u64),
            ("tries", self.tries as u64),
            ("max_transaction_cursor", self.max_transaction_cursor),
            ("packet_job_limit", self.packet_job_limit as u64),
            ("packet_worker_limit", self.packet_worker_limit as u64),
        ];
        for (name, value) in nonzero {
            if value == 0 {
                return Err(DhtError::Config(format!("{} must be non-zero", name)));
            }
        }

        if self.query_timeout.is_zero()
            || self.bucket_check_period.is_zero()
            || self.token_sweep_period.is_zero()
            || self.lookup_poll_interval.is_zero()
        {
            return Err(DhtError::Config("periods must be non-zero".into()));
        }

        let addr: SocketAddr = self
            .address
            .parse()
            .map_err(|e| DhtError::Config(format!("address {:?}: {}", self.address, e)))?;

        if !self.network.accepts(&addr) {
            return Err(DhtError::Config(format!(
                "address {} does not match network {:?}",
                addr, self.network
            )));
        }

        Ok(addr)
    }
}

impl fmt::Debug for DhtConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DhtConfig")
            .field("k", &self.k)
            .field("network", &self.network)
            .field("address", &self.address)
            .field("prime_nodes", &self.prime_nodes)
            .field("bucket_expiry", &self.bucket_expiry)
            .field("node_expiry", &self.node_expiry)
            .field("token_expiry", &self.token_expiry)
            .field("max_nodes", &self.max_nodes)
            .field("tries", &self.tries)
            .field("packet_job_limit", &self.packet_job_limit)
            .field("packet_worker_limit", &self.packet_worker_limit)
            .finish_non_exhaustive()
    }
}
