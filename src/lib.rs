//! rdht - a BitTorrent Mainline DHT node
//!
//! # Modules
//!
//! - [`bencode`] - BEP-3 Bencode encoding/decoding, the KRPC wire format
//! - [`dht`] - BEP-5 Distributed Hash Table: routing table, transactions,
//!   tokens, peer store and the UDP server

pub mod bencode;
pub mod dht;

pub use bencode::{decode, encode, BencodeError, Value};
pub use dht::{
    DhtConfig, DhtError, DhtHandler, DhtServer, InfoHash, LookupKey, Node, NodeId, RoutingTable,
};
