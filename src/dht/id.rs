use super::error::DhtError;
use rand::Rng as _;
use std::cmp::Ordering;
use std::fmt;

/// Length of node ids and info-hashes in bytes.
pub const ID_LEN: usize = 20;
/// Length of node ids and info-hashes in bits.
pub const ID_BITS: usize = ID_LEN * 8;

/// A 160-bit identifier in the DHT key space.
///
/// Node ids and info-hashes share the space, so lookups for content and
/// for nodes use the same XOR metric.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub [u8; ID_LEN]);

/// Content identifier; shares the node id space.
pub type InfoHash = NodeId;

impl NodeId {
    pub const ZERO: NodeId = NodeId([0; ID_LEN]);
    pub const MAX: NodeId = NodeId([0xff; ID_LEN]);

    /// Uniformly random id.
    pub fn random() -> Self {
        let mut id = [0u8; ID_LEN];
        rand::rng().fill(&mut id);
        Self(id)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DhtError> {
        let id: [u8; ID_LEN] = bytes.try_into().map_err(|_| DhtError::InvalidNodeId)?;
        Ok(Self(id))
    }

    /// Parses the 40 character hex form.
    pub fn from_hex(s: &str) -> Result<Self, DhtError> {
        let mut id = [0u8; ID_LEN];
        hex::decode_to_slice(s, &mut id).map_err(|e| DhtError::InvalidKey(e.to_string()))?;
        Ok(Self(id))
    }

    pub fn as_bytes(&self) -> &[u8; ID_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn distance(&self, other: &NodeId) -> NodeId {
        let mut dist = [0u8; ID_LEN];
        for (i, d) in dist.iter_mut().enumerate() {
            *d = self.0[i] ^ other.0[i];
        }
        NodeId(dist)
    }

    /// Orders `a` and `b` by their XOR distance to `self`.
    pub fn cmp_distance(&self, a: &NodeId, b: &NodeId) -> Ordering {
        self.distance(a).cmp(&self.distance(b))
    }

    /// Whether `a` is strictly closer to `self` than `b` is.
    pub fn closer_to(&self, a: &NodeId, b: &NodeId) -> bool {
        self.cmp_distance(a, b) == Ordering::Less
    }

    pub fn leading_zeros(&self) -> usize {
        for (i, &byte) in self.0.iter().enumerate() {
            if byte != 0 {
                return i * 8 + byte.leading_zeros() as usize;
            }
        }
        ID_BITS
    }

    /// Bit `index`, counting from the most significant bit.
    pub fn bit(&self, index: usize) -> bool {
        self.0[index / 8] & (0x80 >> (index % 8)) != 0
    }

    pub fn flip_bit(mut self, index: usize) -> Self {
        self.0[index / 8] ^= 0x80 >> (index % 8);
        self
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({:02x}{:02x}{:02x}{:02x}..)", self.0[0], self.0[1], self.0[2], self.0[3])
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl From<[u8; ID_LEN]> for NodeId {
    fn from(bytes: [u8; ID_LEN]) -> Self {
        Self(bytes)
    }
}

/// The ids sharing the first `len` bits of `prefix`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdRange {
    prefix: NodeId,
    len: usize,
}

impl IdRange {
    /// The whole id space.
    pub const ALL: IdRange = IdRange {
        prefix: NodeId::ZERO,
        len: 0,
    };

    pub fn new(prefix: NodeId, len: usize) -> Self {
        debug_assert!(len <= ID_BITS);
        Self {
            prefix: Self::masked(prefix, len, false),
            len,
        }
    }

    pub fn prefix_len(&self) -> usize {
        self.len
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.prefix.distance(id).leading_zeros() >= self.len
    }

    pub fn first(&self) -> NodeId {
        self.prefix
    }

    pub fn last(&self) -> NodeId {
        Self::masked(self.prefix, self.len, true)
    }

    /// Uniformly random id inside the range.
    pub fn random_id(&self) -> NodeId {
        let random = NodeId::random();
        let mut id = self.prefix;
        for i in self.len..ID_BITS {
            if random.bit(i) != id.bit(i) {
                id = id.flip_bit(i);
            }
        }
        id
    }

    /// Keeps the first `len` bits and sets every following bit to `fill`.
    fn masked(mut id: NodeId, len: usize, fill: bool) -> NodeId {
        for i in len..ID_BITS {
            if id.bit(i) != fill {
                id = id.flip_bit(i);
            }
        }
        id
    }
}
