use super::id::{NodeId, ID_LEN};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::{Duration, Instant};

/// Failures after which a node is dropped from the routing table.
pub const MAX_FAILURES: u8 = 3;

const COMPACT_V4_LEN: usize = 6;
const COMPACT_V6_LEN: usize = 18;

/// Compact node info length for IPv4 (`nodes`).
pub const COMPACT_NODE_V4_LEN: usize = ID_LEN + COMPACT_V4_LEN;
/// Compact node info length for IPv6 (`nodes6`).
pub const COMPACT_NODE_V6_LEN: usize = ID_LEN + COMPACT_V6_LEN;

/// A DHT node we have exchanged messages with.
#[derive(Debug, Clone)]
pub struct Node {
    pub id: NodeId,
    pub addr: SocketAddr,
    pub last_seen: Instant,
    pub failures: u8,
}

impl Node {
    pub fn new(id: NodeId, addr: SocketAddr) -> Self {
        Self {
            id,
            addr,
            last_seen: Instant::now(),
            failures: 0,
        }
    }

    pub fn touch(&mut self) {
        self.last_seen = Instant::now();
        self.failures = 0;
    }

    pub fn fail(&mut self) {
        self.failures = self.failures.saturating_add(1);
    }

    pub fn is_expired(&self, expiry: Duration) -> bool {
        self.last_seen.elapsed() > expiry
    }

    /// Unresponsive or silent for longer than `expiry`; may be replaced.
    pub fn is_evictable(&self, expiry: Duration) -> bool {
        self.failures > 0 || self.is_expired(expiry)
    }

    pub fn is_bad(&self) -> bool {
        self.failures >= MAX_FAILURES
    }

    pub fn from_compact(data: &[u8]) -> Option<Self> {
        if data.len() != COMPACT_NODE_V4_LEN && data.len() != COMPACT_NODE_V6_LEN {
            return None;
        }
        let id = NodeId::from_bytes(&data[..ID_LEN]).ok()?;
        let addr = addr_from_compact(&data[ID_LEN..])?;
        Some(Self::new(id, addr))
    }

    /// 26 bytes for IPv4 nodes, 38 bytes for IPv6 nodes.
    pub fn to_compact(&self) -> Vec<u8> {
        let mut compact = Vec::with_capacity(COMPACT_NODE_V6_LEN);
        compact.extend_from_slice(self.id.as_bytes());
        compact.extend_from_slice(&addr_to_compact(&self.addr));
        compact
    }
}

/// The target of an outgoing query.
///
/// Bootstrap routers are contacted before we learn their id, so the id is
/// optional until the first reply arrives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Remote {
    pub addr: SocketAddr,
    pub id: Option<NodeId>,
}

impl Remote {
    pub fn bootstrap(addr: SocketAddr) -> Self {
        Self { addr, id: None }
    }
}

impl From<&Node> for Remote {
    fn from(node: &Node) -> Self {
        Self {
            addr: node.addr,
            id: Some(node.id),
        }
    }
}

/// Parses a compact peer (6 bytes IPv4, 18 bytes IPv6).
pub fn addr_from_compact(data: &[u8]) -> Option<SocketAddr> {
    match data.len() {
        COMPACT_V4_LEN => {
            let ip = Ipv4Addr::new(data[0], data[1], data[2], data[3]);
            let port = u16::from_be_bytes([data[4], data[5]]);
            Some(SocketAddr::new(IpAddr::V4(ip), port))
        }
        COMPACT_V6_LEN => {
            let octets: [u8; 16] = data[..16].try_into().ok()?;
            let port = u16::from_be_bytes([data[16], data[17]]);
            Some(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port))
        }
        _ => None,
    }
}

pub fn addr_to_compact(addr: &SocketAddr) -> Vec<u8> {
    let mut compact = match addr.ip() {
        IpAddr::V4(ip) => ip.octets().to_vec(),
        IpAddr::V6(ip) => ip.octets().to_vec(),
    };
    compact.extend_from_slice(&addr.port().to_be_bytes());
    compact
}
