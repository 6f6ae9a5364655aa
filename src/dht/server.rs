use super::config::DhtConfig;
use super::error::DhtError;
use super::id::{InfoHash, NodeId, ID_LEN};
use super::message::{Body, Message, Query, Response, ERROR_METHOD_UNKNOWN, ERROR_PROTOCOL};
use super::node::{Node, Remote};
use super::peers::PeersManager;
use super::routing::{Insertion, RoutingTable};
use super::token::TokenManager;
use super::transaction::TransactionManager;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

const READ_BUFFER_SIZE: usize = 8192;

/// Where a node is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    /// Socket bound and tables built; not yet joined.
    Initialized,
    Bootstrapping,
    Serving,
    /// The routing table emptied out and the prime nodes are being queried again.
    Rejoining,
    Stopped,
}

/// What a maintenance tick did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Maintenance {
    /// The routing table was empty; prime nodes were queried again.
    Rejoined,
    /// Stale buckets are being refreshed in the background.
    Refreshing,
    /// Queries are still outstanding; nothing to do.
    Busy,
    /// The node was shut down.
    Stopped,
}

/// A lookup key: either the raw 20 bytes or their 40 character hex form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LookupKey {
    Raw(InfoHash),
    Hex(String),
}

impl LookupKey {
    pub fn resolve(&self) -> Result<InfoHash, DhtError> {
        match self {
            LookupKey::Raw(id) => Ok(*id),
            LookupKey::Hex(s) if s.len() != ID_LEN * 2 => Err(DhtError::InvalidKey(format!(
                "expected {} hex characters, got {}",
                ID_LEN * 2,
                s.len()
            ))),
            LookupKey::Hex(s) => NodeId::from_hex(s),
        }
    }
}

impl From<InfoHash> for LookupKey {
    fn from(id: InfoHash) -> Self {
        LookupKey::Raw(id)
    }
}

impl From<[u8; ID_LEN]> for LookupKey {
    fn from(bytes: [u8; ID_LEN]) -> Self {
        LookupKey::Raw(NodeId(bytes))
    }
}

impl From<&str> for LookupKey {
    fn from(s: &str) -> Self {
        LookupKey::Hex(s.to_string())
    }
}

impl From<String> for LookupKey {
    fn from(s: String) -> Self {
        LookupKey::Hex(s)
    }
}

/// A token a remote node issued us for announcing to it.
#[derive(Debug, Clone)]
struct WriteToken {
    remote: Remote,
    token: Bytes,
    received_at: Instant,
}

/// A received datagram waiting for a worker.
#[derive(Debug, Clone)]
pub struct Packet {
    pub data: Bytes,
    pub from: SocketAddr,
}

/// A Mainline DHT node ([BEP-5]).
///
/// `bind` opens the socket and starts the transaction and token sweeps;
/// `run` joins the network and serves until [`DhtServer::shutdown`].
///
/// # Examples
///
/// ```no_run
/// use rdht::dht::{DhtConfig, DhtServer};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let dht = DhtServer::bind(DhtConfig::default()).await?;
/// tokio::spawn(dht.clone().run());
///
/// // Raw bytes or the hex form are both accepted.
/// let peers = dht
///     .find_node("c12fe1c06bba254a9dc9f519b335aa7c1367a88a")
///     .await?;
/// println!("found {} peers", peers.len());
/// # Ok(())
/// # }
/// ```
///
/// [BEP-5]: http://bittorrent.org/beps/bep_0005.html
pub struct DhtServer {
    config: DhtConfig,
    local_id: NodeId,
    local_addr: SocketAddr,
    socket: Arc<UdpSocket>,
    routing_table: Arc<RoutingTable>,
    transactions: Arc<TransactionManager>,
    peers: Arc<PeersManager>,
    tokens: Arc<TokenManager>,
    /// Tokens other nodes gave us in `get_peers` replies, per info-hash.
    write_tokens: Mutex<HashMap<InfoHash, Vec<WriteToken>>>,
    ready: AtomicBool,
    running: AtomicBool,
    state: RwLock<NodeState>,
    shutdown: watch::Sender<bool>,
}

impl DhtServer {
    pub async fn bind(config: DhtConfig) -> Result<Arc<Self>, DhtError> {
        let addr = config.validate()?;
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        let local_addr = socket.local_addr()?;
        let local_id = NodeId::random();

        info!("DHT bound to {} with id {}", local_addr, local_id);

        let routing_table = Arc::new(RoutingTable::new(local_id, &config));
        let transactions = Arc::new(TransactionManager::new(
            socket.clone(),
            local_id,
            routing_table.clone(),
            &config,
        ));
        let tokens = Arc::new(TokenManager::new(config.token_expiry));
        let (shutdown, _) = watch::channel(false);

        let sweeper = transactions.clone();
        let stop = shutdown.subscribe();
        tokio::spawn(async move { sweeper.run(stop).await });

        let sweeper = tokens.clone();
        let period = config.token_sweep_period;
        let stop = shutdown.subscribe();
        tokio::spawn(async move { sweeper.run(period, stop).await });

        Ok(Arc::new(Self {
            config,
            local_id,
            local_addr,
            socket,
            routing_table,
            transactions,
            peers: Arc::new(PeersManager::new()),
            tokens,
            write_tokens: Mutex::new(HashMap::new()),
            ready: AtomicBool::new(false),
            running: AtomicBool::new(false),
            state: RwLock::new(NodeState::Initialized),
            shutdown,
        }))
    }

    pub fn local_id(&self) -> &NodeId {
        &self.local_id
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn config(&self) -> &DhtConfig {
        &self.config
    }

    pub fn routing_table(&self) -> &RoutingTable {
        &self.routing_table
    }

    pub fn transactions(&self) -> &TransactionManager {
        &self.transactions
    }

    pub fn peers(&self) -> &PeersManager {
        &self.peers
    }

    pub fn tokens(&self) -> &TokenManager {
        &self.tokens
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    pub fn state(&self) -> NodeState {
        *self.state.read()
    }

    fn set_state(&self, next: NodeState) {
        let mut state = self.state.write();
        if *state != NodeState::Stopped {
            *state = next;
        }
    }

    fn is_stopped(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Queries every prime node for our own id and marks the node ready.
    /// Unresolvable prime nodes are skipped. Returns how many were queried;
    /// a stopped node queries none.
    pub async fn join(&self) -> usize {
        if self.is_stopped() {
            return 0;
        }

        let rejoining = self.is_ready();
        self.set_state(if rejoining {
            NodeState::Rejoining
        } else {
            NodeState::Bootstrapping
        });

        let mut contacted = 0;
        for prime in &self.config.prime_nodes {
            let addr = match tokio::net::lookup_host(prime.as_str()).await {
                Ok(mut addrs) => addrs.find(|a| self.config.network.accepts(a)),
                Err(e) => {
                    warn!("Failed to resolve prime node {}: {}", prime, e);
                    continue;
                }
            };

            let Some(addr) = addr else {
                warn!("Prime node {} has no {:?} address", prime, self.config.network);
                continue;
            };

            debug!("Querying prime node {}", addr);
            self.transactions
                .find_node(Remote::bootstrap(addr), self.local_id)
                .await;
            contacted += 1;
        }

        let mut state = self.state.write();
        if *state != NodeState::Stopped {
            if !rejoining {
                self.ready.store(true, Ordering::Release);
                info!("DHT ready");
            }
            *state = NodeState::Serving;
        }
        contacted
    }

    /// Listens, joins and serves until shutdown.
    ///
    /// Received datagrams go through a queue of `packet_job_limit` entries to
    /// at most `packet_worker_limit` concurrent handlers; a full queue stalls
    /// the socket reader.
    pub async fn run(self: Arc<Self>) -> Result<(), DhtError> {
        if self.running.swap(true, Ordering::AcqRel) {
            return Err(DhtError::AlreadyRunning);
        }

        let mut shutdown = self.shutdown.subscribe();
        if *shutdown.borrow() {
            return Ok(());
        }

        let (tx, mut packets) = mpsc::channel(self.config.packet_job_limit);
        self.listen(tx);
        self.join().await;

        let workers = Arc::new(Semaphore::new(self.config.packet_worker_limit));
        let mut tick = interval(self.config.bucket_check_period);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tick.tick().await;

        loop {
            tokio::select! {
                packet = packets.recv() => {
                    let Some(packet) = packet else { break };
                    let Ok(permit) = workers.clone().acquire_owned().await else { break };
                    let server = self.clone();
                    tokio::spawn(async move {
                        server.handle_packet(packet).await;
                        drop(permit);
                    });
                }
                _ = tick.tick() => {
                    self.maintain().await;
                }
                _ = shutdown.changed() => break,
            }
        }

        self.set_state(NodeState::Stopped);
        info!("DHT stopped");
        Ok(())
    }

    /// Stops the reader, the service loop and both sweeps.
    pub fn shutdown(&self) {
        {
            let mut state = self.state.write();
            *state = NodeState::Stopped;
            self.ready.store(false, Ordering::Release);
        }
        self.shutdown.send_replace(true);
    }

    fn listen(&self, packets: mpsc::Sender<Packet>) {
        let socket = self.socket.clone();
        let mut shutdown = self.shutdown.subscribe();

        tokio::spawn(async move {
            let mut buf = vec![0u8; READ_BUFFER_SIZE];
            loop {
                let (n, from) = tokio::select! {
                    result = socket.recv_from(&mut buf) => match result {
                        Ok(received) => received,
                        Err(e) => {
                            warn!("DHT socket read failed: {}", e);
                            continue;
                        }
                    },
                    _ = shutdown.changed() => break,
                };

                let packet = Packet {
                    data: Bytes::copy_from_slice(&buf[..n]),
                    from,
                };
                if packets.send(packet).await.is_err() {
                    break;
                }
            }
        });
    }

    /// One tick of the maintenance timer.
    pub async fn maintain(&self) -> Maintenance {
        if self.is_stopped() {
            Maintenance::Stopped
        } else if self.routing_table.is_empty() {
            info!("Routing table empty, rejoining");
            self.join().await;
            Maintenance::Rejoined
        } else if self.transactions.is_empty() {
            let table = self.routing_table.clone();
            let transactions = self.transactions.clone();
            tokio::spawn(async move { table.refresh(&transactions).await });
            Maintenance::Refreshing
        } else {
            Maintenance::Busy
        }
    }

    /// Returns peers announced for `key`.
    ///
    /// Known peers are returned at once. Otherwise the closest known nodes
    /// are asked with `get_peers` and the peer store is polled until peers
    /// show up or the poll budget runs out; finding none is not an error.
    pub async fn find_node(
        &self,
        key: impl Into<LookupKey>,
    ) -> Result<Vec<SocketAddr>, DhtError> {
        if !self.is_ready() {
            return Err(DhtError::NotReady);
        }

        let info_hash = key.into().resolve()?;
        let k = self.config.k;

        let peers = self.peers.get_peers(&info_hash, k);
        if !peers.is_empty() {
            return Ok(peers);
        }

        for node in self.routing_table.neighbors(&info_hash, k) {
            self.transactions
                .get_peers(Remote::from(&node), info_hash)
                .await;
        }

        let mut poll = interval(self.config.lookup_poll_interval);
        poll.tick().await;
        for _ in 0..self.config.lookup_poll_attempts {
            poll.tick().await;
            let peers = self.peers.get_peers(&info_hash, k);
            if !peers.is_empty() {
                return Ok(peers);
            }
        }

        debug!("No peers found for {}", info_hash);
        Ok(Vec::new())
    }

    /// Announces `port` for `info_hash` to every node that handed us a
    /// token for it. Returns the number of announces sent.
    pub async fn announce_peer(&self, info_hash: InfoHash, port: u16) -> Result<usize, DhtError> {
        if !self.is_ready() {
            return Err(DhtError::NotReady);
        }

        let targets = {
            let mut write_tokens = self.write_tokens.lock();
            self.expire_write_tokens(&mut write_tokens);
            write_tokens.get(&info_hash).cloned().unwrap_or_default()
        };

        for target in &targets {
            self.transactions
                .announce_peer(target.remote, info_hash, port, target.token.clone())
                .await;
        }

        Ok(targets.len())
    }

    pub(crate) async fn handle_packet(&self, packet: Packet) {
        let message = match Message::parse(&packet.data) {
            Ok(message) => message,
            Err(e) => {
                debug!("Dropping packet from {}: {}", packet.from, e);
                return;
            }
        };

        match message.body {
            Body::Query { sender, query } => {
                self.handle_query(message.transaction_id, packet.from, sender, query)
                    .await
            }
            Body::Response(response) => {
                self.handle_response(&message.transaction_id, packet.from, response)
                    .await
            }
            Body::Error { code, message: text } => {
                let tid = &message.transaction_id;
                if let Some(transaction) = self.transactions.on_reply(tid, packet.from) {
                    debug!(
                        "Query {:?} to {} failed: {} {}",
                        transaction.query.method(),
                        packet.from,
                        code,
                        text
                    );
                }
            }
        }
    }

    async fn handle_query(
        &self,
        tid: Bytes,
        from: SocketAddr,
        sender: Option<NodeId>,
        query: Query,
    ) {
        let Some(sender) = sender else {
            self.send(from, &Message::error(tid, ERROR_PROTOCOL, "invalid id"))
                .await;
            return;
        };

        let k = self.config.k;
        let reply = match query {
            Query::Ping => Message::response(tid, Response::new(self.local_id)),
            Query::FindNode { target } => {
                let mut response = Response::new(self.local_id);
                response.nodes = self.routing_table.neighbors(&target, k);
                Message::response(tid, response)
            }
            Query::GetPeers { info_hash } => {
                self.config
                    .handler
                    .on_get_peers(from.ip(), &info_hash, from.port());

                let mut response = Response::new(self.local_id);
                response.token = Some(self.tokens.issue(from.ip()));

                let peers = self.peers.get_peers(&info_hash, k);
                if peers.is_empty() {
                    response.nodes = self.routing_table.neighbors(&info_hash, k);
                } else {
                    response.values = peers;
                }
                Message::response(tid, response)
            }
            Query::AnnouncePeer {
                info_hash,
                port,
                token,
                implied_port,
            } => {
                if self.tokens.validate(from.ip(), &token) {
                    let port = if implied_port { from.port() } else { port };
                    self.peers
                        .store(info_hash, SocketAddr::new(from.ip(), port));
                    self.config
                        .handler
                        .on_announce_peer(from.ip(), &info_hash, port);
                    debug!("Stored peer {}:{} for {}", from.ip(), port, info_hash);
                    Message::response(tid, Response::new(self.local_id))
                } else {
                    debug!("Rejecting announce_peer from {}: invalid token", from);
                    Message::error(tid, ERROR_PROTOCOL, "invalid token")
                }
            }
            Query::Unknown(method) => {
                Message::error(tid, ERROR_METHOD_UNKNOWN, format!("unknown method {}", method))
            }
        };

        self.send(from, &reply).await;
        self.routing_table.insert(Node::new(sender, from));
    }

    async fn handle_response(&self, tid: &[u8], from: SocketAddr, response: Response) {
        let Some(transaction) = self.transactions.on_reply(tid, from) else {
            debug!("Dropping unmatched reply from {}", from);
            return;
        };

        self.routing_table.insert(Node::new(response.id, from));

        match transaction.query {
            Query::FindNode { target } => {
                for node in &response.nodes {
                    if node.id == self.local_id || !self.config.network.accepts(&node.addr) {
                        continue;
                    }
                    let closer = target.closer_to(&node.id, &response.id);
                    if self.routing_table.insert(node.clone()) == Insertion::Added && closer {
                        self.transactions
                            .find_node(Remote::from(node), target)
                            .await;
                    }
                }
            }
            Query::GetPeers { info_hash } => {
                for peer in &response.values {
                    self.peers.store(info_hash, *peer);
                }
                for node in &response.nodes {
                    if node.id != self.local_id && self.config.network.accepts(&node.addr) {
                        self.routing_table.insert(node.clone());
                    }
                }
                if let Some(token) = response.token {
                    let remote = Remote {
                        addr: from,
                        id: Some(response.id),
                    };
                    self.remember_token(info_hash, remote, token);
                }
            }
            _ => {}
        }
    }

    fn remember_token(&self, info_hash: InfoHash, remote: Remote, token: Bytes) {
        let mut write_tokens = self.write_tokens.lock();
        self.expire_write_tokens(&mut write_tokens);

        let entries = write_tokens.entry(info_hash).or_default();
        entries.retain(|t| t.remote.addr != remote.addr);
        if entries.len() >= self.config.k {
            entries.remove(0);
        }
        entries.push(WriteToken {
            remote,
            token,
            received_at: Instant::now(),
        });
    }

    /// Remote tokens live about as long as ours; older ones would be rejected.
    fn expire_write_tokens(&self, write_tokens: &mut HashMap<InfoHash, Vec<WriteToken>>) {
        let expiry = self.config.token_expiry;
        write_tokens.retain(|_, entries| {
            entries.retain(|t| t.received_at.elapsed() <= expiry);
            !entries.is_empty()
        });
    }

    async fn send(&self, addr: SocketAddr, message: &Message) {
        if let Err(e) = self.socket.send_to(&message.encode(), addr).await {
            debug!("Failed to send reply to {}: {}", addr, e);
        }
    }
}

impl Drop for DhtServer {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
    }
}
