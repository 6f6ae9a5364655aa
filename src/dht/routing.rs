use std::cmp::Reverse;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tracing::debug;

use super::config::DhtConfig;
use super::id::{IdRange, NodeId, ID_BITS};
use super::node::{Node, Remote};
use super::transaction::TransactionManager;

/// What [`RoutingTable::insert`] did with a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Insertion {
    Added,
    /// Already known; recency updated.
    Refreshed,
    /// Took the slot of an unresponsive or expired node.
    Replaced,
    /// Bucket full and not splittable; kept as a replacement candidate.
    Dropped,
}

#[derive(Debug)]
struct Bucket {
    range: IdRange,
    nodes: VecDeque<Node>,
    candidates: VecDeque<Node>,
    last_changed: Instant,
}

impl Bucket {
    fn new(range: IdRange) -> Self {
        Self {
            range,
            nodes: VecDeque::new(),
            candidates: VecDeque::new(),
            last_changed: Instant::now(),
        }
    }

    fn position(&self, id: &NodeId) -> Option<usize> {
        self.nodes.iter().position(|n| &n.id == id)
    }

    /// Moves the node at `pos` to the most-recent end.
    fn refresh(&mut self, pos: usize, addr: SocketAddr) {
        if let Some(mut existing) = self.nodes.remove(pos) {
            existing.addr = addr;
            existing.touch();
            self.nodes.push_back(existing);
        }
        self.last_changed = Instant::now();
    }

    fn push(&mut self, node: Node) {
        self.candidates.retain(|c| c.id != node.id);
        self.nodes.push_back(node);
        self.last_changed = Instant::now();
    }

    fn add_candidate(&mut self, node: Node, k: usize) {
        self.candidates.retain(|c| c.id != node.id);
        if self.candidates.len() >= k {
            self.candidates.pop_front();
        }
        self.candidates.push_back(node);
    }

    fn remove(&mut self, pos: usize) -> Option<Node> {
        let removed = self.nodes.remove(pos)?;
        if let Some(candidate) = self.candidates.pop_back() {
            self.nodes.push_back(candidate);
        }
        self.last_changed = Instant::now();
        Some(removed)
    }
}

/// Kademlia routing table with a single splittable branch.
///
/// Bucket `i` (for every bucket but the last) holds nodes whose id first
/// differs from ours at bit `i`; the last bucket holds everything sharing at
/// least `len - 1` leading bits with our id and is the only one that splits.
pub struct RoutingTable {
    local_id: NodeId,
    k: usize,
    max_nodes: usize,
    node_expiry: Duration,
    bucket_expiry: Duration,
    refresh_node_num: usize,
    buckets: RwLock<Vec<Bucket>>,
}

impl RoutingTable {
    pub fn new(local_id: NodeId, config: &DhtConfig) -> Self {
        Self {
            local_id,
            k: config.k,
            max_nodes: config.max_nodes,
            node_expiry: config.node_expiry,
            bucket_expiry: config.bucket_expiry,
            refresh_node_num: config.refresh_node_num,
            buckets: RwLock::new(vec![Bucket::new(IdRange::ALL)]),
        }
    }

    pub fn local_id(&self) -> &NodeId {
        &self.local_id
    }

    fn bucket_index(&self, bucket_count: usize, id: &NodeId) -> usize {
        self.local_id
            .distance(id)
            .leading_zeros()
            .min(bucket_count - 1)
    }

    pub fn insert(&self, node: Node) -> Insertion {
        if node.id == self.local_id {
            return Insertion::Dropped;
        }

        let mut buckets = self.buckets.write();
        loop {
            let total: usize = buckets.iter().map(|b| b.nodes.len()).sum();
            let bucket_count = buckets.len();
            let idx = self.bucket_index(bucket_count, &node.id);
            let bucket = &mut buckets[idx];

            if let Some(pos) = bucket.position(&node.id) {
                bucket.refresh(pos, node.addr);
                return Insertion::Refreshed;
            }

            let full = bucket.nodes.len() >= self.k;
            if !full && total < self.max_nodes {
                bucket.push(node);
                return Insertion::Added;
            }

            if full && idx == bucket_count - 1 && bucket_count < ID_BITS {
                Self::split_last(&mut buckets, &self.local_id);
                continue;
            }

            let bucket = &mut buckets[idx];
            let node_expiry = self.node_expiry;
            if let Some(pos) = bucket
                .nodes
                .iter()
                .position(|n| n.is_evictable(node_expiry))
            {
                if let Some(evicted) = bucket.nodes.remove(pos) {
                    debug!("Evicting node {} for {}", evicted.addr, node.addr);
                }
                bucket.push(node);
                return Insertion::Replaced;
            }

            bucket.add_candidate(node, self.k);
            return Insertion::Dropped;
        }
    }

    /// Splits the last bucket at the next bit of our id.
    fn split_last(buckets: &mut Vec<Bucket>, local_id: &NodeId) {
        let depth = buckets.len() - 1;
        let far = IdRange::new(local_id.flip_bit(depth), depth + 1);
        let near = IdRange::new(*local_id, depth + 1);

        let mut split = Bucket::new(near);
        if let Some(last) = buckets.last_mut() {
            last.range = far;
            let (kept, moved): (VecDeque<Node>, VecDeque<Node>) =
                last.nodes.drain(..).partition(|n| far.contains(&n.id));
            last.nodes = kept;
            split.nodes = moved;

            let (kept, moved): (VecDeque<Node>, VecDeque<Node>) =
                last.candidates.drain(..).partition(|n| far.contains(&n.id));
            last.candidates = kept;
            split.candidates = moved;
        }
        buckets.push(split);
    }

    pub fn remove(&self, id: &NodeId) -> Option<Node> {
        let mut buckets = self.buckets.write();
        let idx = self.bucket_index(buckets.len(), id);
        let bucket = &mut buckets[idx];
        let pos = bucket.position(id)?;
        bucket.remove(pos)
    }

    pub fn remove_by_addr(&self, addr: &SocketAddr) -> Option<Node> {
        let mut buckets = self.buckets.write();
        buckets.iter_mut().find_map(|bucket| {
            let pos = bucket.nodes.iter().position(|n| &n.addr == addr)?;
            bucket.remove(pos)
        })
    }

    /// Records an unanswered query; drops the node once it is bad.
    pub fn mark_failed(&self, remote: &Remote) {
        let mut buckets = self.buckets.write();
        let bucket_count = buckets.len();

        let located = match remote.id {
            Some(id) => {
                let idx = self.bucket_index(bucket_count, &id);
                buckets[idx].position(&id).map(|pos| (idx, pos))
            }
            None => buckets.iter().enumerate().find_map(|(idx, b)| {
                b.nodes
                    .iter()
                    .position(|n| n.addr == remote.addr)
                    .map(|pos| (idx, pos))
            }),
        };

        if let Some((idx, pos)) = located {
            let bucket = &mut buckets[idx];
            bucket.nodes[pos].fail();
            if bucket.nodes[pos].is_bad() {
                debug!("Removing unresponsive node {}", remote.addr);
                bucket.remove(pos);
            }
        }
    }

    /// Up to `count` nodes closest to `target`, most recently seen first on ties.
    pub fn neighbors(&self, target: &NodeId, count: usize) -> Vec<Node> {
        let buckets = self.buckets.read();
        let mut nodes: Vec<Node> = buckets
            .iter()
            .flat_map(|b| b.nodes.iter())
            .filter(|n| !n.is_bad())
            .cloned()
            .collect();

        nodes.sort_by_key(|n| (n.id.distance(target), Reverse(n.last_seen)));
        nodes.truncate(count);
        nodes
    }

    pub fn get(&self, id: &NodeId) -> Option<Node> {
        let buckets = self.buckets.read();
        let idx = self.bucket_index(buckets.len(), id);
        buckets[idx].nodes.iter().find(|n| &n.id == id).cloned()
    }

    pub fn len(&self) -> usize {
        self.buckets.read().iter().map(|b| b.nodes.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn bucket_ranges(&self) -> Vec<IdRange> {
        self.buckets.read().iter().map(|b| b.range).collect()
    }

    pub fn bucket_sizes(&self) -> Vec<usize> {
        self.buckets.read().iter().map(|b| b.nodes.len()).collect()
    }

    /// Sends `find_node` toward a random id inside every bucket that has not
    /// changed for longer than the bucket expiry. Returns the number of
    /// buckets refreshed.
    pub async fn refresh(&self, transactions: &TransactionManager) -> usize {
        let stale = self.stale_buckets();
        let refreshed = stale.len();

        for (target, mut remotes) in stale {
            if remotes.is_empty() {
                remotes = self
                    .neighbors(&target, self.refresh_node_num)
                    .iter()
                    .map(Remote::from)
                    .collect();
            }
            for remote in remotes {
                transactions.find_node(remote, target).await;
            }
        }

        if refreshed > 0 {
            debug!("Refreshed {} stale buckets", refreshed);
        }
        refreshed
    }

    fn stale_buckets(&self) -> Vec<(NodeId, Vec<Remote>)> {
        let mut buckets = self.buckets.write();
        let now = Instant::now();

        buckets
            .iter_mut()
            .filter(|b| now.duration_since(b.last_changed) > self.bucket_expiry)
            .map(|bucket| {
                bucket.last_changed = now;
                let remotes = bucket
                    .nodes
                    .iter()
                    .take(self.refresh_node_num)
                    .map(Remote::from)
                    .collect();
                (bucket.range.random_id(), remotes)
            })
            .collect()
    }
}
