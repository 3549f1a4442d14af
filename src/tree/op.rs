//! Batched block operations

use super::node::MAX_BLOCKS;
use super::{TreeError, TreeResult};
use std::cmp::Ordering;
use std::fmt;
use std::io;

/// Callback that writes a block's payload into a buffer of the declared length
pub type FillFn = Box<dyn FnMut(&mut [u8]) -> io::Result<()>>;

/// What to do with one block
pub enum Payload {
    /// Store these bytes
    Data(Vec<u8>),
    /// Store `len` bytes produced by `fill` when the block is reached
    Fill { len: usize, fill: FillFn },
    /// Remove the block (tombstone)
    Delete,
}

/// One update in a batch
pub struct BlockOp {
    block: u64,
    payload: Payload,
}

impl BlockOp {
    /// Write `data` at `block`
    pub fn new(block: u64, data: impl Into<Vec<u8>>) -> Self {
        Self {
            block,
            payload: Payload::Data(data.into()),
        }
    }

    /// Write `len` bytes produced by `fill` at `block`
    pub fn fill<F>(block: u64, len: usize, fill: F) -> Self
    where
        F: FnMut(&mut [u8]) -> io::Result<()> + 'static,
    {
        Self {
            block,
            payload: Payload::Fill {
                len,
                fill: Box::new(fill),
            },
        }
    }

    /// Delete `block`
    pub fn delete(block: u64) -> Self {
        Self {
            block,
            payload: Payload::Delete,
        }
    }

    pub fn block(&self) -> u64 {
        self.block
    }

    pub fn is_delete(&self) -> bool {
        matches!(self.payload, Payload::Delete)
    }

    pub(crate) fn payload_mut(&mut self) -> &mut Payload {
        &mut self.payload
    }
}

impl fmt::Debug for BlockOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match &self.payload {
            Payload::Data(data) => format!("data({} bytes)", data.len()),
            Payload::Fill { len, .. } => format!("fill({} bytes)", len),
            Payload::Delete => "delete".to_string(),
        };
        f.debug_struct("BlockOp")
            .field("block", &self.block)
            .field("payload", &kind)
            .finish()
    }
}

/// Batch order: tombstones first, highest block first, then writes in
/// ascending block order
pub fn compare_ops(a: &BlockOp, b: &BlockOp) -> Ordering {
    match (a.is_delete(), b.is_delete()) {
        (true, true) => b.block.cmp(&a.block),
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        (false, false) => a.block.cmp(&b.block),
    }
}

/// Sort a batch into application order
pub fn sort_ops(ops: &mut [BlockOp]) {
    ops.sort_by(compare_ops);
}

/// Reject batches naming a block twice or beyond the deepest tree
pub fn validate_ops(ops: &[BlockOp]) -> TreeResult<()> {
    let mut blocks: Vec<u64> = ops.iter().map(BlockOp::block).collect();
    blocks.sort_unstable();

    if let Some(pair) = blocks.windows(2).find(|pair| pair[0] == pair[1]) {
        return Err(TreeError::DuplicateBlock(pair[0]));
    }
    match blocks.last() {
        Some(&block) if block >= MAX_BLOCKS => Err(TreeError::OutOfRange {
            block,
            reason: "beyond the deepest supported tree",
        }),
        _ => Ok(()),
    }
}
