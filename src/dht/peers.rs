use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::time::Instant;

use parking_lot::RwLock;

use super::id::InfoHash;

/// Announced peers kept per info-hash; the oldest is dropped beyond this.
const MAX_PEERS_PER_INFO_HASH: usize = 1000;

#[derive(Debug, Clone)]
pub struct PeerRecord {
    pub addr: SocketAddr,
    pub announced_at: Instant,
}

/// Peers that announced themselves for an info-hash.
///
/// Records live until the process exits or the per-hash cap pushes them out.
#[derive(Default)]
pub struct PeersManager {
    peers: RwLock<HashMap<InfoHash, VecDeque<PeerRecord>>>,
}

impl PeersManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `addr`, or moves it to the most-recent end if already stored.
    pub fn store(&self, info_hash: InfoHash, addr: SocketAddr) {
        let mut peers = self.peers.write();
        let records = peers.entry(info_hash).or_default();

        records.retain(|p| p.addr != addr);
        if records.len() >= MAX_PEERS_PER_INFO_HASH {
            records.pop_front();
        }
        records.push_back(PeerRecord {
            addr,
            announced_at: Instant::now(),
        });
    }

    /// Up to `count` peers, most recently announced first.
    pub fn get_peers(&self, info_hash: &InfoHash, count: usize) -> Vec<SocketAddr> {
        self.peers
            .read()
            .get(info_hash)
            .map(|records| records.iter().rev().take(count).map(|p| p.addr).collect())
            .unwrap_or_default()
    }

    pub fn records(&self, info_hash: &InfoHash) -> Vec<PeerRecord> {
        self.peers
            .read()
            .get(info_hash)
            .map(|records| records.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of info-hashes with at least one peer.
    pub fn len(&self) -> usize {
        self.peers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
