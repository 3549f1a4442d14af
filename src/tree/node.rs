//! Tree node descriptors and indirect block encoding
//!
//! Each child slot of an indirect block is 33 bytes:
//! ```text
//! [tag: 1 byte] [address: 32 bytes]
//!   tag 0x00            Empty
//!   tag 0x80            Leaf
//!   tag depth | 0x80?   Indirect (high bit set when full)
//! ```

use super::{TreeError, TreeResult};
use crate::address::{Address, ADDRESS_SIZE};
use std::fmt;
use std::str::FromStr;

/// Bits of block number consumed per level
pub const INDIRECT_BITS: u32 = 10;

/// Children per indirect block
pub const FANOUT: usize = 1 << INDIRECT_BITS;

/// Deepest supported tree
pub const MAX_DEPTH: u8 = 6;

/// First block number the tree cannot hold
pub const MAX_BLOCKS: u64 = 1 << (INDIRECT_BITS * MAX_DEPTH as u32);

/// Serialized size of one node
pub const NODE_SIZE: usize = 1 + ADDRESS_SIZE;

/// Largest serialized indirect block
pub const INDIRECT_BLOCK_SIZE: usize = FANOUT * NODE_SIZE;

const FULL_FLAG: u8 = 0x80;
const DEPTH_MASK: u8 = 0x7f;

/// Descriptor of a (sub)tree
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TreeNode {
    /// No blocks
    #[default]
    Empty,
    /// A single block, stored under its address
    Leaf(Address),
    /// An indirect block of child descriptors
    Indirect {
        depth: u8,
        addr: Address,
        /// Holds exactly `span(depth)` blocks
        full: bool,
    },
}

impl TreeNode {
    /// Levels of indirection below this node
    pub fn depth(&self) -> u8 {
        match self {
            TreeNode::Empty | TreeNode::Leaf(_) => 0,
            TreeNode::Indirect { depth, .. } => *depth,
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, TreeNode::Empty)
    }

    /// Whether the subtree holds every block its depth can address.
    /// A leaf is a full tree of depth 0.
    pub fn is_full(&self) -> bool {
        match self {
            TreeNode::Empty => false,
            TreeNode::Leaf(_) => true,
            TreeNode::Indirect { full, .. } => *full,
        }
    }

    /// Full, and exactly `depth` levels tall
    pub fn is_full_at(&self, depth: u8) -> bool {
        self.is_full() && self.depth() == depth
    }

    pub fn encode(&self) -> [u8; NODE_SIZE] {
        let mut buf = [0u8; NODE_SIZE];
        match self {
            TreeNode::Empty => {}
            TreeNode::Leaf(addr) => {
                buf[0] = FULL_FLAG;
                buf[1..].copy_from_slice(addr.as_bytes());
            }
            TreeNode::Indirect { depth, addr, full } => {
                buf[0] = depth | if *full { FULL_FLAG } else { 0 };
                buf[1..].copy_from_slice(addr.as_bytes());
            }
        }
        buf
    }

    pub fn decode(bytes: &[u8]) -> TreeResult<Self> {
        if bytes.len() != NODE_SIZE {
            return Err(TreeError::Corrupt(format!(
                "node is {} bytes, expected {}",
                bytes.len(),
                NODE_SIZE
            )));
        }

        let tag = bytes[0];
        let mut addr = [0u8; ADDRESS_SIZE];
        addr.copy_from_slice(&bytes[1..]);
        let addr = Address::from_bytes(addr);

        let depth = tag & DEPTH_MASK;
        let full = tag & FULL_FLAG != 0;
        match (depth, full) {
            (0, false) => Ok(TreeNode::Empty),
            (0, true) if addr.is_nil() => Ok(TreeNode::Empty),
            (0, true) => Ok(TreeNode::Leaf(addr)),
            (depth, _) if depth > MAX_DEPTH => Err(TreeError::Corrupt(format!(
                "node depth {} exceeds {}",
                depth, MAX_DEPTH
            ))),
            (_, _) if addr.is_nil() => Err(TreeError::Corrupt(
                "indirect node with nil address".to_string(),
            )),
            (depth, full) => Ok(TreeNode::Indirect { depth, addr, full }),
        }
    }

    /// Text form: hex of the serialized node
    pub fn to_hex(&self) -> String {
        hex::encode(self.encode())
    }

    pub fn from_hex(s: &str) -> TreeResult<Self> {
        if s.len() != NODE_SIZE * 2 {
            return Err(TreeError::InvalidRoot(format!(
                "expected {} hex characters, got {}",
                NODE_SIZE * 2,
                s.len()
            )));
        }
        let mut buf = [0u8; NODE_SIZE];
        hex::decode_to_slice(s, &mut buf).map_err(|e| TreeError::InvalidRoot(e.to_string()))?;
        TreeNode::decode(&buf).map_err(|e| TreeError::InvalidRoot(e.to_string()))
    }
}

impl fmt::Display for TreeNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl FromStr for TreeNode {
    type Err = TreeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TreeNode::from_hex(s)
    }
}

/// Number of blocks a node of `depth` addresses
pub fn span(depth: u8) -> u64 {
    1u64 << (INDIRECT_BITS * depth as u32)
}

/// Child slot of `rel` in a node of `depth` (depth >= 1)
pub fn slot_of(rel: u64, depth: u8) -> usize {
    ((rel >> (INDIRECT_BITS * (depth as u32 - 1))) & (FANOUT as u64 - 1)) as usize
}

/// Smallest depth whose span covers `count` blocks
pub fn depth_for(count: u64) -> u8 {
    let mut depth = 0;
    let mut capacity = 1u64;
    while capacity < count {
        capacity <<= INDIRECT_BITS;
        depth += 1;
    }
    depth
}

/// Serialize the occupied slots of an indirect block
pub fn encode_indirect(children: &[TreeNode]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(children.len() * NODE_SIZE);
    for child in children {
        buf.extend_from_slice(&child.encode());
    }
    buf
}

/// Parse an indirect block. It must hold between 1 and 1024 slots.
pub fn decode_indirect(data: &[u8]) -> TreeResult<Vec<TreeNode>> {
    if data.is_empty() || data.len() % NODE_SIZE != 0 || data.len() > INDIRECT_BLOCK_SIZE {
        return Err(TreeError::Corrupt(format!(
            "indirect block of {} bytes",
            data.len()
        )));
    }
    data.chunks_exact(NODE_SIZE).map(TreeNode::decode).collect()
}
