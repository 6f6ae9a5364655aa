use thiserror::Error;

#[derive(Debug, Error)]
pub enum DhtError {
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),

    #[error("undecodable packet: {0}")]
    Bencode(#[from] crate::bencode::BencodeError),

    #[error("malformed krpc message: {0}")]
    InvalidMessage(String),

    #[error("node id must be 20 bytes")]
    InvalidNodeId,

    #[error("invalid lookup key: {0}")]
    InvalidKey(String),

    #[error("dht not ready")]
    NotReady,

    #[error("dht is already running")]
    AlreadyRunning,

    #[error("invalid config: {0}")]
    Config(String),
}
