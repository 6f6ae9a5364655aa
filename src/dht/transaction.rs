use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::debug;

use super::config::DhtConfig;
use super::error::DhtError;
use super::id::{InfoHash, NodeId};
use super::message::{decode_transaction_id, encode_transaction_id, Message, Method, Query};
use super::node::Remote;
use super::routing::RoutingTable;

/// An outstanding query awaiting its reply.
#[derive(Debug, Clone)]
pub struct Transaction {
    pub id: u64,
    pub remote: Remote,
    pub query: Query,
    pub issued_at: Instant,
    /// Sends so far, including the first.
    pub attempts: u32,
    packet: Vec<u8>,
}

#[derive(Default)]
struct Pending {
    cursor: u64,
    by_id: HashMap<u64, Transaction>,
    by_target: HashMap<(SocketAddr, Method), u64>,
}

impl Pending {
    /// Next free id in `0..max`, wrapping at `max`.
    fn next_id(&mut self, max: u64) -> u64 {
        for _ in 0..=self.by_id.len() {
            let id = self.cursor;
            self.cursor = (self.cursor + 1) % max;
            if !self.by_id.contains_key(&id) {
                return id;
            }
        }
        self.cursor
    }

    fn remove(&mut self, id: u64) -> Option<Transaction> {
        let transaction = self.by_id.remove(&id)?;
        if let Some(method) = transaction.query.method() {
            self.by_target.remove(&(transaction.remote.addr, method));
        }
        Some(transaction)
    }
}

/// Sends KRPC queries and matches replies to them.
///
/// At most one query per (address, method) is in flight. Unanswered queries
/// are resent until `tries` attempts have been made, then dropped and the
/// remote is reported to the routing table as failed.
pub struct TransactionManager {
    socket: Arc<UdpSocket>,
    local_id: NodeId,
    routing_table: Arc<RoutingTable>,
    max_cursor: u64,
    tries: u32,
    timeout: Duration,
    pending: Mutex<Pending>,
}

impl TransactionManager {
    pub fn new(
        socket: Arc<UdpSocket>,
        local_id: NodeId,
        routing_table: Arc<RoutingTable>,
        config: &DhtConfig,
    ) -> Self {
        Self {
            socket,
            local_id,
            routing_table,
            max_cursor: config.max_transaction_cursor,
            tries: config.tries,
            timeout: config.query_timeout,
            pending: Mutex::new(Pending::default()),
        }
    }

    pub async fn ping(&self, remote: Remote) -> u64 {
        self.send_query(remote, Method::Ping, Query::Ping).await
    }

    pub async fn find_node(&self, remote: Remote, target: NodeId) -> u64 {
        self.send_query(remote, Method::FindNode, Query::FindNode { target })
            .await
    }

    pub async fn get_peers(&self, remote: Remote, info_hash: InfoHash) -> u64 {
        self.send_query(remote, Method::GetPeers, Query::GetPeers { info_hash })
            .await
    }

    pub async fn announce_peer(
        &self,
        remote: Remote,
        info_hash: InfoHash,
        port: u16,
        token: Bytes,
    ) -> u64 {
        let query = Query::AnnouncePeer {
            info_hash,
            port,
            token,
            implied_port: false,
        };
        self.send_query(remote, Method::AnnouncePeer, query).await
    }

    /// Sends any query we know how to serve; returns its transaction id.
    pub async fn query(&self, remote: Remote, query: Query) -> Result<u64, DhtError> {
        let method = query
            .method()
            .ok_or_else(|| DhtError::InvalidMessage("cannot send unknown method".into()))?;
        Ok(self.send_query(remote, method, query).await)
    }

    async fn send_query(&self, remote: Remote, method: Method, query: Query) -> u64 {
        let (id, packet) = {
            let mut pending = self.pending.lock();
            if let Some(&id) = pending.by_target.get(&(remote.addr, method)) {
                return id;
            }

            let id = pending.next_id(self.max_cursor);
            // only taken when every id is in use; that transaction is abandoned
            pending.remove(id);
            let packet = Message::query(encode_transaction_id(id), self.local_id, query.clone())
                .encode();

            pending.by_target.insert((remote.addr, method), id);
            pending.by_id.insert(
                id,
                Transaction {
                    id,
                    remote,
                    query,
                    issued_at: Instant::now(),
                    attempts: 1,
                    packet: packet.clone(),
                },
            );
            (id, packet)
        };

        self.send(remote.addr, &packet).await;
        id
    }

    async fn send(&self, addr: SocketAddr, packet: &[u8]) {
        if let Err(e) = self.socket.send_to(packet, addr).await {
            debug!("Failed to send query to {}: {}", addr, e);
        }
    }

    /// Removes and returns the transaction a reply from `from` answers.
    ///
    /// Unknown ids and replies from another address leave the table as is.
    pub fn on_reply(&self, transaction_id: &[u8], from: SocketAddr) -> Option<Transaction> {
        let id = decode_transaction_id(transaction_id)?;
        let mut pending = self.pending.lock();

        if pending.by_id.get(&id)?.remote.addr != from {
            return None;
        }
        pending.remove(id)
    }

    /// Resends timed out queries with attempts left and drops the rest.
    /// Returns the number of transactions dropped.
    pub async fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut resend = Vec::new();
        let mut failed = Vec::new();

        {
            let mut pending = self.pending.lock();
            let expired: Vec<u64> = pending
                .by_id
                .values()
                .filter(|t| now.duration_since(t.issued_at) >= self.timeout)
                .map(|t| t.id)
                .collect();

            for id in expired {
                if let Some(transaction) = pending.by_id.get_mut(&id) {
                    if transaction.attempts < self.tries {
                        transaction.attempts += 1;
                        transaction.issued_at = now;
                        resend.push((transaction.remote.addr, transaction.packet.clone()));
                        continue;
                    }
                }
                if let Some(transaction) = pending.remove(id) {
                    failed.push(transaction.remote);
                }
            }
        }

        for (addr, packet) in resend {
            debug!("Retrying query to {}", addr);
            self.send(addr, &packet).await;
        }

        for remote in &failed {
            debug!("Query to {} timed out", remote.addr);
            self.routing_table.mark_failed(remote);
        }

        failed.len()
    }

    pub fn len(&self) -> usize {
        self.pending.lock().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sweeps on its own timer until shutdown.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let period = (self.timeout / 4).clamp(Duration::from_millis(10), Duration::from_secs(1));
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.sweep().await;
                }
                _ = shutdown.changed() => break,
            }
        }
    }
}
