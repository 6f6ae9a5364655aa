use super::error::DhtError;
use super::id::{InfoHash, NodeId};
use super::node::{
    addr_from_compact, addr_to_compact, Node, COMPACT_NODE_V4_LEN, COMPACT_NODE_V6_LEN,
};
use crate::bencode::{decode, encode, Value};
use bytes::Bytes;
use std::net::SocketAddr;

pub type TransactionId = Bytes;

/// KRPC error codes (BEP-5).
pub const ERROR_GENERIC: i64 = 201;
pub const ERROR_PROTOCOL: i64 = 203;
pub const ERROR_METHOD_UNKNOWN: i64 = 204;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Ping,
    FindNode,
    GetPeers,
    AnnouncePeer,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Ping => "ping",
            Method::FindNode => "find_node",
            Method::GetPeers => "get_peers",
            Method::AnnouncePeer => "announce_peer",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Query {
    Ping,
    FindNode {
        target: NodeId,
    },
    GetPeers {
        info_hash: InfoHash,
    },
    AnnouncePeer {
        info_hash: InfoHash,
        port: u16,
        token: Bytes,
        implied_port: bool,
    },
    /// A method we do not serve; answered with error 204.
    Unknown(String),
}

impl Query {
    pub fn method(&self) -> Option<Method> {
        match self {
            Query::Ping => Some(Method::Ping),
            Query::FindNode { .. } => Some(Method::FindNode),
            Query::GetPeers { .. } => Some(Method::GetPeers),
            Query::AnnouncePeer { .. } => Some(Method::AnnouncePeer),
            Query::Unknown(_) => None,
        }
    }

    fn name(&self) -> &str {
        match self {
            Query::Unknown(name) => name,
            other => other.method().map(|m| m.as_str()).unwrap_or_default(),
        }
    }
}

/// The `r` dictionary of a reply.
///
/// Replies do not name the method they answer; the transaction that sent
/// the query decides how the fields are interpreted.
#[derive(Debug, Clone)]
pub struct Response {
    pub id: NodeId,
    pub nodes: Vec<Node>,
    pub values: Vec<SocketAddr>,
    pub token: Option<Bytes>,
}

impl Response {
    pub fn new(id: NodeId) -> Self {
        Self {
            id,
            nodes: Vec::new(),
            values: Vec::new(),
            token: None,
        }
    }
}

#[derive(Debug, Clone)]
pub enum Body {
    Query {
        sender: Option<NodeId>,
        query: Query,
    },
    Response(Response),
    Error {
        code: i64,
        message: String,
    },
}

#[derive(Debug, Clone)]
pub struct Message {
    pub transaction_id: TransactionId,
    pub body: Body,
}

impl Message {
    pub fn query(transaction_id: TransactionId, sender: NodeId, query: Query) -> Self {
        Self {
            transaction_id,
            body: Body::Query {
                sender: Some(sender),
                query,
            },
        }
    }

    pub fn response(transaction_id: TransactionId, response: Response) -> Self {
        Self {
            transaction_id,
            body: Body::Response(response),
        }
    }

    pub fn error(transaction_id: TransactionId, code: i64, message: impl Into<String>) -> Self {
        Self {
            transaction_id,
            body: Body::Error {
                code,
                message: message.into(),
            },
        }
    }

    pub fn parse(data: &[u8]) -> Result<Self, DhtError> {
        let value = decode(data)?;
        if value.as_dict().is_none() {
            return Err(invalid("expected dict"));
        }

        let transaction_id = value
            .get_bytes(b"t")
            .cloned()
            .ok_or_else(|| invalid("missing transaction id"))?;

        let body = match value.get_str(b"y") {
            Some("q") => Self::parse_query(&value)?,
            Some("r") => Self::parse_response(&value)?,
            Some("e") => Self::parse_error(&value)?,
            Some(other) => return Err(invalid(format!("unknown message type: {}", other))),
            None => return Err(invalid("missing message type")),
        };

        Ok(Self {
            transaction_id,
            body,
        })
    }

    fn parse_query(value: &Value) -> Result<Body, DhtError> {
        let name = value.get_str(b"q").ok_or_else(|| invalid("missing query name"))?;
        let args = value
            .get(b"a")
            .filter(|a| a.as_dict().is_some())
            .ok_or_else(|| invalid("missing query args"))?;

        let sender = args.get_array(b"id").map(NodeId);
        let id_arg = |key: &str| {
            args.get_array(key.as_bytes())
                .map(NodeId)
                .ok_or_else(|| invalid(format!("missing {}", key)))
        };

        let query = match name {
            "ping" => Query::Ping,
            "find_node" => Query::FindNode {
                target: id_arg("target")?,
            },
            "get_peers" => Query::GetPeers {
                info_hash: id_arg("info_hash")?,
            },
            "announce_peer" => Query::AnnouncePeer {
                info_hash: id_arg("info_hash")?,
                port: args
                    .get_integer(b"port")
                    .and_then(|p| u16::try_from(p).ok())
                    .ok_or_else(|| invalid("missing port"))?,
                token: args
                    .get_bytes(b"token")
                    .cloned()
                    .ok_or_else(|| invalid("missing token"))?,
                implied_port: args.get_integer(b"implied_port").is_some_and(|v| v != 0),
            },
            other => Query::Unknown(other.to_string()),
        };

        Ok(Body::Query { sender, query })
    }

    fn parse_response(value: &Value) -> Result<Body, DhtError> {
        let r = value
            .get(b"r")
            .filter(|r| r.as_dict().is_some())
            .ok_or_else(|| invalid("missing response dict"))?;

        let id = r
            .get_array(b"id")
            .map(NodeId)
            .ok_or_else(|| invalid("missing id in response"))?;

        let mut nodes = Vec::new();
        for (key, len) in [
            (b"nodes".as_slice(), COMPACT_NODE_V4_LEN),
            (b"nodes6".as_slice(), COMPACT_NODE_V6_LEN),
        ] {
            if let Some(data) = r.get_bytes(key) {
                nodes.extend(data.chunks_exact(len).filter_map(Node::from_compact));
            }
        }

        let values = r
            .get(b"values")
            .and_then(Value::as_list)
            .map(|list| {
                list.iter()
                    .filter_map(Value::as_bytes)
                    .filter_map(|b| addr_from_compact(b))
                    .collect()
            })
            .unwrap_or_default();

        Ok(Body::Response(Response {
            id,
            nodes,
            values,
            token: r.get_bytes(b"token").cloned(),
        }))
    }

    fn parse_error(value: &Value) -> Result<Body, DhtError> {
        let error = value
            .get(b"e")
            .and_then(Value::as_list)
            .ok_or_else(|| invalid("missing error list"))?;

        let code = error
            .first()
            .and_then(Value::as_integer)
            .unwrap_or(ERROR_GENERIC);
        let message = error
            .get(1)
            .and_then(Value::as_str)
            .unwrap_or("unknown error")
            .to_string();

        Ok(Body::Error { code, message })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut fields: Vec<(&[u8], Value)> =
            vec![(b"t".as_slice(), Value::Bytes(self.transaction_id.clone()))];

        match &self.body {
            Body::Query { sender, query } => {
                fields.push((b"y", Value::string("q")));
                fields.push((b"q", Value::string(query.name())));
                fields.push((b"a", encode_args(sender.as_ref(), query)));
            }
            Body::Response(response) => {
                fields.push((b"y", Value::string("r")));
                fields.push((b"r", encode_response(response)));
            }
            Body::Error { code, message } => {
                fields.push((b"y", Value::string("e")));
                fields.push((
                    b"e",
                    Value::List(vec![Value::Integer(*code), Value::string(message)]),
                ));
            }
        }

        encode(&fields.into_iter().collect())
    }
}

fn invalid(reason: impl Into<String>) -> DhtError {
    DhtError::InvalidMessage(reason.into())
}

fn encode_args(sender: Option<&NodeId>, query: &Query) -> Value {
    let mut args: Vec<(&[u8], Value)> = Vec::new();
    if let Some(id) = sender {
        args.push((b"id", Value::bytes(id.as_bytes())));
    }

    match query {
        Query::Ping | Query::Unknown(_) => {}
        Query::FindNode { target } => args.push((b"target", Value::bytes(target.as_bytes()))),
        Query::GetPeers { info_hash } => {
            args.push((b"info_hash", Value::bytes(info_hash.as_bytes())))
        }
        Query::AnnouncePeer {
            info_hash,
            port,
            token,
            implied_port,
        } => {
            args.push((b"info_hash", Value::bytes(info_hash.as_bytes())));
            args.push((b"port", Value::Integer(i64::from(*port))));
            args.push((b"token", Value::Bytes(token.clone())));
            if *implied_port {
                args.push((b"implied_port", Value::Integer(1)));
            }
        }
    }

    args.into_iter().collect()
}

fn encode_response(response: &Response) -> Value {
    let mut fields: Vec<(&[u8], Value)> =
        vec![(b"id".as_slice(), Value::bytes(response.id.as_bytes()))];

    let (v4, v6): (Vec<&Node>, Vec<&Node>) =
        response.nodes.iter().partition(|n| n.addr.is_ipv4());
    for (key, nodes) in [(b"nodes".as_slice(), v4), (b"nodes6".as_slice(), v6)] {
        if !nodes.is_empty() {
            let compact: Vec<u8> = nodes.iter().flat_map(|n| n.to_compact()).collect();
            fields.push((key, Value::Bytes(Bytes::from(compact))));
        }
    }

    if !response.values.is_empty() {
        let values = response
            .values
            .iter()
            .map(|addr| Value::Bytes(Bytes::from(addr_to_compact(addr))))
            .collect();
        fields.push((b"values", Value::List(values)));
    }

    if let Some(token) = &response.token {
        fields.push((b"token", Value::Bytes(token.clone())));
    }

    fields.into_iter().collect()
}

/// Big-endian with leading zero bytes stripped; at least one byte.
pub fn encode_transaction_id(id: u64) -> TransactionId {
    let bytes = id.to_be_bytes();
    let skip = bytes.iter().take_while(|&&b| b == 0).count().min(7);
    Bytes::copy_from_slice(&bytes[skip..])
}

pub fn decode_transaction_id(tid: &[u8]) -> Option<u64> {
    if tid.is_empty() || tid.len() > 8 {
        return None;
    }
    Some(tid.iter().fold(0u64, |acc, &b| (acc << 8) | b as u64))
}
