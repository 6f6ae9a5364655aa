//! Distributed Hash Table ([BEP-5]).
//!
//! A Kademlia node speaking KRPC over UDP: it keeps a routing table of other
//! nodes, answers `ping`, `find_node`, `get_peers` and `announce_peer`, and
//! looks up peers for info-hashes.
//!
//! [BEP-5]: http://bittorrent.org/beps/bep_0005.html

mod config;
mod error;
mod id;
mod message;
mod node;
mod peers;
mod routing;
mod server;
mod token;
mod transaction;

pub use config::{DhtConfig, DhtHandler, Network, NoopHandler, BOOTSTRAP_NODES};
pub use error::DhtError;
pub use id::{IdRange, InfoHash, NodeId, ID_BITS, ID_LEN};
pub use message::{
    Body, Message, Method, Query, Response, TransactionId, ERROR_GENERIC, ERROR_METHOD_UNKNOWN,
    ERROR_PROTOCOL,
};
pub use node::{Node, Remote, MAX_FAILURES};
pub use peers::{PeerRecord, PeersManager};
pub use routing::{Insertion, RoutingTable};
pub use server::{DhtServer, LookupKey, Maintenance, NodeState, Packet};
pub use token::TokenManager;
pub use transaction::{Transaction, TransactionManager};
