//! Module implement the small identifier types shared by every subsystem.

use std::{convert::TryInto, fmt};

use crate::Result;

/// Reserved field names on a node object.
pub const ID_FIELD: &str = "id";
pub const TYPE_FIELD: &str = "type";
pub const ALIASES_FIELD: &str = "aliases";
pub const PARENTS_FIELD: &str = "parents";
pub const CHILDREN_FIELD: &str = "children";
pub const ANCESTORS_FIELD: &str = "ancestors";
pub const DESCENDANTS_FIELD: &str = "descendants";
pub const CREATED_AT_FIELD: &str = "createdAt";
pub const UPDATED_AT_FIELD: &str = "updatedAt";

/// Node type prefix, the first two bytes of a [NodeId].
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeType(pub [u8; 2]);

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

impl fmt::Debug for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self)
    }
}

/// Node identifier. Fixed 16 bytes, nul-padded; the first two bytes are
/// the type prefix. Equality and ordering are byte-lexicographic.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct NodeId([u8; NodeId::SIZE]);

impl NodeId {
    pub const SIZE: usize = 16;
    pub const TYPE_SIZE: usize = 2;

    /// Copy a node id of any length into a fixed length NodeId. Longer
    /// inputs are truncated, shorter inputs are nul-padded.
    pub fn new(src: &[u8]) -> NodeId {
        let mut buf = [0_u8; NodeId::SIZE];
        let n = src.len().min(NodeId::SIZE);
        buf[..n].copy_from_slice(&src[..n]);
        NodeId(buf)
    }

    pub fn root() -> NodeId {
        NodeId::new(b"root")
    }

    pub fn empty() -> NodeId {
        NodeId([0_u8; NodeId::SIZE])
    }

    pub fn as_bytes(&self) -> &[u8; NodeId::SIZE] {
        &self.0
    }

    /// Id bytes ignoring the nul padding at the end.
    pub fn trimmed(&self) -> &[u8] {
        let n = self.0.iter().rposition(|b| *b != 0).map(|p| p + 1).unwrap_or(0);
        &self.0[..n]
    }

    pub fn node_type(&self) -> NodeType {
        NodeType([self.0[0], self.0[1]])
    }

    pub fn is_root(&self) -> bool {
        *self == NodeId::root()
    }

    pub fn is_empty(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(self.trimmed()))
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self)
    }
}

impl<'a> arbitrary::Arbitrary<'a> for NodeId {
    fn arbitrary(u: &mut arbitrary::Unstructured) -> arbitrary::Result<Self> {
        let typ: [u8; 2] = [*u.choose(b"abcdmopr")?, *u.choose(b"abcdmopr")?];
        let tail: u64 = u.arbitrary()?;
        let mut buf = [0_u8; NodeId::SIZE];
        buf[..2].copy_from_slice(&typ);
        buf[2..10].copy_from_slice(format!("{:08}", tail % 100_000_000).as_bytes());
        Ok(NodeId(buf))
    }
}

/// Subscription identifier, a SHA256 in binary.
pub type SubscriptionId = [u8; 32];

/// Subscription marker id, unique within one subscription.
pub type MarkerId = i64;

/// Render a subscription id as the 64 character hex string clients use.
pub fn sub_id_to_hex(sub_id: &SubscriptionId) -> String {
    let mut s = String::with_capacity(64);
    for b in sub_id.iter() {
        s.push_str(&format!("{:02x}", b));
    }
    s
}

/// Parse a 64 character hex string into a subscription id.
pub fn sub_id_from_hex(src: &str) -> Result<SubscriptionId> {
    if src.len() != 64 {
        return err_at!(InvalidInput, msg: "subscription id {:?}", src);
    }
    let mut buf = Vec::with_capacity(32);
    for i in (0..64).step_by(2) {
        let b = err_at!(InvalidInput, u8::from_str_radix(&src[i..i + 2], 16))?;
        buf.push(b);
    }
    Ok(buf.as_slice().try_into().unwrap())
}

/// Split a packed node-id argument into individual ids. Commands pass
/// several node ids as one string of concatenated 16 byte ids.
pub fn node_ids_from_arg(arg: &[u8]) -> Result<Vec<NodeId>> {
    if arg.is_empty() || (arg.len() % NodeId::SIZE) != 0 {
        return err_at!(InvalidInput, msg: "bad node_ids length {}", arg.len());
    }
    Ok(arg.chunks(NodeId::SIZE).map(NodeId::new).collect())
}

/// Trigger event classes recognized by trigger markers.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TriggerType {
    Created = 0,
    Updated = 1,
    Deleted = 2,
}

impl TriggerType {
    pub fn from_u8(v: u8) -> Result<TriggerType> {
        match v {
            0 => Ok(TriggerType::Created),
            1 => Ok(TriggerType::Updated),
            2 => Ok(TriggerType::Deleted),
            _ => err_at!(InvalidInput, msg: "trigger event type {}", v),
        }
    }
}

#[cfg(test)]
#[path = "types_test.rs"]
mod types_test;
