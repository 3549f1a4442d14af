//! Copy-on-write block tree over the content store
//!
//! A tree maps block numbers `0..n` to payloads. Leaves are payload
//! addresses; interior nodes are indirect blocks of up to 1024 child
//! descriptors, themselves stored in the content store. Every update
//! writes new nodes along the changed paths and returns a new root, so
//! older roots stay readable.
//!
//! Trees are dense: blocks are appended at the end, deleted from the end,
//! and rewritten anywhere in between.

pub mod node;
pub mod op;

use crate::address::Address;
use crate::logging::{emit, Logger};
use crate::store::{Store, StoreError, MAX_BLOCK_SIZE};
use log::Level;
use thiserror::Error;

pub use node::{
    decode_indirect, depth_for, encode_indirect, slot_of, span, TreeNode, FANOUT,
    INDIRECT_BITS, INDIRECT_BLOCK_SIZE, MAX_BLOCKS, MAX_DEPTH, NODE_SIZE,
};
pub use op::{compare_ops, sort_ops, validate_ops, BlockOp, FillFn, Payload};

/// Tree errors
#[derive(Debug, Error)]
pub enum TreeError {
    #[error("block {block} out of range: {reason}")]
    OutOfRange { block: u64, reason: &'static str },

    #[error("block {0} appears more than once in the batch")]
    DuplicateBlock(u64),

    #[error("payload for block {block} could not be produced: {source}")]
    Fill {
        block: u64,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed tree: {0}")]
    Corrupt(String),

    #[error("invalid tree root: {0}")]
    InvalidRoot(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Result type for tree operations
pub type TreeResult<T> = Result<T, TreeError>;

/// An indirect block being rewritten. Children are loaded on first touch.
struct Rewrite {
    depth: u8,
    node: TreeNode,
    children: Option<Vec<TreeNode>>,
}

impl Rewrite {
    fn new(node: TreeNode) -> Self {
        Self {
            depth: node.depth(),
            node,
            children: None,
        }
    }

    fn with_children(depth: u8, children: Vec<TreeNode>) -> Self {
        Self {
            depth,
            node: TreeNode::Empty,
            children: Some(children),
        }
    }

    fn is_full(&self) -> bool {
        match &self.children {
            Some(children) => {
                children.len() == FANOUT
                    && children
                        .last()
                        .is_some_and(|last| last.is_full_at(self.depth - 1))
            }
            None => self.node.is_full(),
        }
    }

    fn children(&mut self, tree: &mut BlockTree<'_>) -> TreeResult<&mut Vec<TreeNode>> {
        let children = match (self.children.take(), self.node) {
            (Some(children), _) => children,
            (None, TreeNode::Indirect { addr, .. }) => tree.load(&addr)?,
            (None, _) => Vec::with_capacity(FANOUT),
        };
        Ok(self.children.insert(children))
    }
}

/// Block tree operations against a store
pub struct BlockTree<'a> {
    store: &'a mut Store,
    logger: Logger,
}

impl<'a> BlockTree<'a> {
    /// Operate on trees in `store`, logging through the store's logger
    pub fn new(store: &'a mut Store) -> Self {
        let logger = store.logger().clone();
        Self { store, logger }
    }

    /// Address of the payload stored at `block`
    pub fn lookup(&mut self, root: &TreeNode, block: u64) -> TreeResult<Address> {
        let mut node = *root;
        let mut rel = block;
        loop {
            match node {
                TreeNode::Empty => {
                    return Err(TreeError::OutOfRange {
                        block,
                        reason: "tree is empty",
                    })
                }
                TreeNode::Leaf(addr) if rel == 0 => return Ok(addr),
                TreeNode::Leaf(_) => {
                    return Err(TreeError::OutOfRange {
                        block,
                        reason: "beyond the end of the tree",
                    })
                }
                TreeNode::Indirect { depth, addr, .. } => {
                    check_depth(depth, &addr)?;
                    if rel >= span(depth) {
                        return Err(TreeError::OutOfRange {
                            block,
                            reason: "beyond the end of the tree",
                        });
                    }
                    let children = self.load(&addr)?;
                    node = *children
                        .get(slot_of(rel, depth))
                        .ok_or(TreeError::OutOfRange {
                            block,
                            reason: "beyond the end of the tree",
                        })?;
                    rel &= span(depth - 1) - 1;
                }
            }
        }
    }

    /// Copy the payload of `block` into `buf`, returning its full length
    pub fn get(&mut self, root: &TreeNode, block: u64, buf: &mut [u8]) -> TreeResult<usize> {
        let addr = self.lookup(root, block)?;
        Ok(self.store.get(&addr, buf)?)
    }

    /// The whole payload of `block`
    pub fn read(&mut self, root: &TreeNode, block: u64) -> TreeResult<Vec<u8>> {
        let addr = self.lookup(root, block)?;
        Ok(self.store.read(&addr)?)
    }

    /// Number of blocks in the tree
    pub fn count(&mut self, root: &TreeNode) -> TreeResult<u64> {
        let mut node = *root;
        let mut total = 0u64;
        loop {
            match node {
                TreeNode::Empty => return Ok(total),
                TreeNode::Leaf(_) => return Ok(total + 1),
                TreeNode::Indirect {
                    depth,
                    addr,
                    full: true,
                } => {
                    check_depth(depth, &addr)?;
                    return Ok(total + span(depth));
                }
                TreeNode::Indirect {
                    depth,
                    addr,
                    full: false,
                } => {
                    check_depth(depth, &addr)?;
                    let children = self.load(&addr)?;
                    let (last, earlier) = children
                        .split_last()
                        .ok_or_else(|| TreeError::Corrupt(format!("{} has no children", addr)))?;
                    total += earlier.len() as u64 * span(depth - 1);
                    node = *last;
                }
            }
        }
    }

    /// Write one block
    pub fn put(&mut self, root: &TreeNode, block: u64, data: &[u8]) -> TreeResult<TreeNode> {
        self.put_many(root, vec![BlockOp::new(block, data)])
    }

    /// Delete one block; only the last block of a tree can be deleted
    pub fn delete(&mut self, root: &TreeNode, block: u64) -> TreeResult<TreeNode> {
        self.put_many(root, vec![BlockOp::delete(block)])
    }

    /// Apply a batch of writes and deletions, returning the new root.
    ///
    /// Deletions apply first, from the highest block down, then writes in
    /// ascending order. Any failure leaves `root` untouched; nodes already
    /// written for the failed batch stay in the store unreferenced.
    pub fn put_many(&mut self, root: &TreeNode, mut ops: Vec<BlockOp>) -> TreeResult<TreeNode> {
        if ops.is_empty() {
            return Ok(*root);
        }

        sort_ops(&mut ops);
        validate_ops(&ops)?;

        let updated = self.apply(*root, &mut ops, 0)?;
        emit!(
            self.logger,
            Level::Debug,
            "applied {} block ops, root {} -> {}",
            ops.len(),
            root,
            updated
        );
        Ok(updated)
    }

    /// Apply sorted `ops` to the subtree `node` whose first block is `base`
    fn apply(&mut self, node: TreeNode, ops: &mut [BlockOp], base: u64) -> TreeResult<TreeNode> {
        if let TreeNode::Indirect { depth, addr, .. } = node {
            check_depth(depth, &addr)?;
        }
        let mut level = Rewrite::new(node);
        let mut i = 0;

        while i < ops.len() {
            let block = ops[i].block();
            let deleting = ops[i].is_delete();
            let rel = block.checked_sub(base).ok_or(TreeError::OutOfRange {
                block,
                reason: "before the start of the subtree",
            })?;

            // An empty subtree receiving a run from its first block is built
            // at its final height straight away
            if level.children.is_none()
                && level.node.is_empty()
                && rel == 0
                && !deleting
                && ops.len() - i > 1
            {
                let last = ops[ops.len() - 1].block() - base;
                let depth = depth_for(last + 1);
                if depth > 0 {
                    level = Rewrite::with_children(depth, Vec::with_capacity(FANOUT));
                }
            }

            if level.children.is_none() && level.depth == 0 && rel == 0 {
                if deleting && level.node.is_empty() {
                    return Err(TreeError::OutOfRange {
                        block,
                        reason: "no such block",
                    });
                }
                level.node = self.store_leaf(&mut ops[i])?;
                i += 1;
                continue;
            }

            // Appending just past a full subtree adds a level above it
            if !deleting && level.is_full() && rel == span(level.depth) {
                if level.depth >= MAX_DEPTH {
                    return Err(TreeError::OutOfRange {
                        block,
                        reason: "beyond the deepest supported tree",
                    });
                }
                let depth = level.depth + 1;
                let sealed = self.seal(level)?;
                level = Rewrite::with_children(depth, vec![sealed]);
                emit!(self.logger, Level::Trace, "tree grew to depth {} at block {}", depth, block);
            }

            if level.depth == 0 || rel >= span(level.depth) {
                return Err(TreeError::OutOfRange {
                    block,
                    reason: "beyond the end of the tree",
                });
            }

            let depth = level.depth;
            let child_span = span(depth - 1);
            let children = level.children(self)?;
            let sel = slot_of(rel, depth);
            let count = children.len();

            if sel > count {
                return Err(TreeError::OutOfRange {
                    block,
                    reason: "would leave a gap after the last block",
                });
            }
            if sel == count {
                if deleting {
                    return Err(TreeError::OutOfRange {
                        block,
                        reason: "no such block",
                    });
                }
                if children
                    .last()
                    .is_some_and(|prev| !prev.is_full_at(depth - 1))
                {
                    return Err(TreeError::OutOfRange {
                        block,
                        reason: "would leave a gap after the last block",
                    });
                }
                children.push(TreeNode::Empty);
            } else if deleting && sel + 1 != count {
                return Err(TreeError::OutOfRange {
                    block,
                    reason: "only the last block can be deleted",
                });
            }

            let child_base = base + sel as u64 * child_span;
            let n = ops[i..]
                .iter()
                .take_while(|op| op.block() >= child_base && op.block() - child_base < child_span)
                .count();
            let updated = self.apply(children[sel], &mut ops[i..i + n], child_base)?;
            i += n;

            if updated.is_empty() {
                debug_assert_eq!(sel + 1, children.len());
                children.pop();
            } else {
                children[sel] = updated;
            }
        }

        self.seal(level)
    }

    /// Persist a rewritten level and return its descriptor
    fn seal(&mut self, level: Rewrite) -> TreeResult<TreeNode> {
        let Some(children) = level.children else {
            return Ok(level.node);
        };

        let node = match children.as_slice() {
            [] => TreeNode::Empty,
            [only] => *only,
            [.., last] => {
                let full = children.len() == FANOUT && last.is_full_at(level.depth - 1);
                let addr = self.store.put(&encode_indirect(&children))?;
                TreeNode::Indirect {
                    depth: level.depth,
                    addr,
                    full,
                }
            }
        };
        Ok(node)
    }

    /// Store the payload of a write, or clear the slot for a deletion
    fn store_leaf(&mut self, op: &mut BlockOp) -> TreeResult<TreeNode> {
        let block = op.block();
        let addr = match op.payload_mut() {
            Payload::Delete => return Ok(TreeNode::Empty),
            Payload::Data(data) => self.store.put(data)?,
            Payload::Fill { len, fill } => {
                if *len > MAX_BLOCK_SIZE {
                    return Err(StoreError::TooLarge(*len).into());
                }
                let mut buf = vec![0u8; *len];
                fill(&mut buf).map_err(|source| TreeError::Fill { block, source })?;
                self.store.put(&buf)?
            }
        };
        Ok(TreeNode::Leaf(addr))
    }

    /// Child descriptors of the indirect block at `addr`
    fn load(&mut self, addr: &Address) -> TreeResult<Vec<TreeNode>> {
        let mut buf = vec![0u8; INDIRECT_BLOCK_SIZE];
        let len = self.store.get(addr, &mut buf)?;
        if len > buf.len() {
            emit!(self.logger, Level::Error, "indirect block {} is {} bytes", addr, len);
            return Err(TreeError::Corrupt(format!(
                "indirect block {} is {} bytes",
                addr, len
            )));
        }
        let children = decode_indirect(&buf[..len])?;
        if children.iter().any(TreeNode::is_empty) {
            emit!(self.logger, Level::Error, "indirect block {} has an empty slot", addr);
            return Err(TreeError::Corrupt(format!(
                "indirect block {} has an empty slot",
                addr
            )));
        }
        Ok(children)
    }
}

/// Indirect nodes sit between depth 1 and the deepest supported tree
fn check_depth(depth: u8, addr: &Address) -> TreeResult<()> {
    if depth == 0 || depth > MAX_DEPTH {
        return Err(TreeError::Corrupt(format!(
            "indirect node {} has depth {}",
            addr, depth
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::capture::Capture;
    use crate::logging::{self, Logger};
    use crate::store::{FileStore, MemoryBackend};
    use std::io;
    use tempfile::TempDir;

    fn memory_store() -> Store {
        Store::new(Box::new(MemoryBackend::new()), logging::discard())
    }

    fn payload(block: u64) -> Vec<u8> {
        format!("block {}", block).into_bytes()
    }

    fn batch(blocks: std::ops::Range<u64>) -> Vec<BlockOp> {
        blocks.map(|b| BlockOp::new(b, payload(b))).collect()
    }

    fn build(store: &mut Store, n: u64) -> TreeNode {
        BlockTree::new(store)
            .put_many(&TreeNode::Empty, batch(0..n))
            .unwrap()
    }

    fn assert_blocks(tree: &mut BlockTree<'_>, root: &TreeNode, n: u64) {
        assert_eq!(tree.count(root).unwrap(), n);
        for b in 0..n {
            assert_eq!(tree.read(root, b).unwrap(), payload(b), "block {}", b);
        }
        assert!(matches!(
            tree.read(root, n),
            Err(TreeError::OutOfRange { block, .. }) if block == n
        ));
    }

    #[test]
    fn test_empty_tree() {
        let mut store = memory_store();
        let mut tree = BlockTree::new(&mut store);
        assert_eq!(tree.count(&TreeNode::Empty).unwrap(), 0);
        assert!(matches!(
            tree.read(&TreeNode::Empty, 0),
            Err(TreeError::OutOfRange { block: 0, .. })
        ));
        assert_eq!(tree.put_many(&TreeNode::Empty, vec![]).unwrap(), TreeNode::Empty);
    }

    #[test]
    fn test_single_block_is_leaf() {
        let mut store = memory_store();
        let mut tree = BlockTree::new(&mut store);
        let root = tree.put(&TreeNode::Empty, 0, b"only").unwrap();

        assert_eq!(root, TreeNode::Leaf(Address::of(b"only")));
        assert_eq!(tree.count(&root).unwrap(), 1);
        assert_eq!(tree.read(&root, 0).unwrap(), b"only");
    }

    #[test]
    fn test_sequential_puts() {
        let mut store = memory_store();
        let mut tree = BlockTree::new(&mut store);

        let mut root = TreeNode::Empty;
        for b in 0..1030 {
            root = tree.put(&root, b, &payload(b)).unwrap();
            assert_eq!(tree.count(&root).unwrap(), b + 1);
        }
        assert_eq!(root.depth(), 2);
        assert!(!root.is_full());
        assert_blocks(&mut tree, &root, 1030);
    }

    #[test]
    fn test_growth_past_full_level() {
        let mut store = memory_store();
        let full = build(&mut store, 1024);
        let mut tree = BlockTree::new(&mut store);

        assert!(full.is_full_at(1));
        assert_eq!(tree.count(&full).unwrap(), 1024);

        let grown = tree.put(&full, 1024, &payload(1024)).unwrap();
        assert_eq!(grown.depth(), 2);
        assert!(!grown.is_full());
        assert_blocks(&mut tree, &grown, 1025);

        // The old root is untouched
        assert_blocks(&mut tree, &full, 1024);
    }

    #[test]
    fn test_batch_matches_sequential() {
        let mut store = memory_store();
        let batched = build(&mut store, 1100);
        let mut tree = BlockTree::new(&mut store);

        let mut sequential = TreeNode::Empty;
        for b in 0..1100 {
            sequential = tree.put(&sequential, b, &payload(b)).unwrap();
        }
        assert_eq!(batched, sequential);

        // Batches that extend an existing tree land on the same root too
        let mut extended = tree.put_many(&TreeNode::Empty, batch(0..700)).unwrap();
        extended = tree.put_many(&extended, batch(700..1100)).unwrap();
        assert_eq!(extended, batched);
    }

    #[test]
    fn test_unsorted_batch() {
        let mut store = memory_store();
        let mut tree = BlockTree::new(&mut store);

        let mut ops = batch(0..50);
        ops.reverse();
        let root = tree.put_many(&TreeNode::Empty, ops).unwrap();
        assert_blocks(&mut tree, &root, 50);
    }

    #[test]
    fn test_overwrite_keeps_snapshot() {
        let mut store = memory_store();
        let before = build(&mut store, 2000);
        let mut tree = BlockTree::new(&mut store);

        let after = tree.put(&before, 1500, b"rewritten").unwrap();
        assert_ne!(after, before);
        assert_eq!(tree.count(&after).unwrap(), 2000);
        assert_eq!(tree.read(&after, 1500).unwrap(), b"rewritten");
        assert_eq!(tree.read(&after, 1499).unwrap(), payload(1499));
        assert_eq!(tree.read(&before, 1500).unwrap(), payload(1500));
    }

    #[test]
    fn test_delete_tail() {
        let mut store = memory_store();
        let root = build(&mut store, 10);
        let mut tree = BlockTree::new(&mut store);

        let shorter = tree.delete(&root, 9).unwrap();
        assert_blocks(&mut tree, &shorter, 9);
        assert_eq!(shorter, build_in(&mut tree, 9));

        let mut root = shorter;
        for b in (0..9).rev() {
            root = tree.delete(&root, b).unwrap();
        }
        assert_eq!(root, TreeNode::Empty);
    }

    fn build_in(tree: &mut BlockTree<'_>, n: u64) -> TreeNode {
        tree.put_many(&TreeNode::Empty, batch(0..n)).unwrap()
    }

    #[test]
    fn test_delete_shrinks_height() {
        let mut store = memory_store();
        let full = build(&mut store, 1024);
        let mut tree = BlockTree::new(&mut store);

        let grown = tree.put(&full, 1024, &payload(1024)).unwrap();
        let shrunk = tree.delete(&grown, 1024).unwrap();
        assert_eq!(shrunk, full);
        assert!(shrunk.is_full_at(1));
    }

    #[test]
    fn test_delete_clears_full_flag() {
        let mut store = memory_store();
        let full = build(&mut store, 1024);
        let mut tree = BlockTree::new(&mut store);

        let partial = tree.delete(&full, 1023).unwrap();
        assert!(!partial.is_full());
        assert_eq!(partial.depth(), 1);
        assert_blocks(&mut tree, &partial, 1023);

        let refilled = tree.put(&partial, 1023, &payload(1023)).unwrap();
        assert_eq!(refilled, full);
    }

    #[test]
    fn test_batched_deletes_across_children() {
        let mut store = memory_store();
        let root = build(&mut store, 1030);
        let mut tree = BlockTree::new(&mut store);

        let ops: Vec<BlockOp> = (1020..1030).map(BlockOp::delete).collect();
        let trimmed = tree.put_many(&root, ops).unwrap();
        assert_blocks(&mut tree, &trimmed, 1020);
        assert_eq!(trimmed, build_in(&mut tree, 1020));
    }

    #[test]
    fn test_mixed_batch() {
        let mut store = memory_store();
        let root = build(&mut store, 20);
        let mut tree = BlockTree::new(&mut store);

        let ops = vec![
            BlockOp::new(3, b"three".to_vec()),
            BlockOp::delete(19),
            BlockOp::new(18, b"eighteen".to_vec()),
            BlockOp::delete(18),
        ];
        assert!(matches!(
            tree.put_many(&root, ops),
            Err(TreeError::DuplicateBlock(18))
        ));

        let ops = vec![
            BlockOp::new(3, b"three".to_vec()),
            BlockOp::delete(19),
            BlockOp::delete(18),
            BlockOp::new(20, b"x".to_vec()),
        ];
        // Deletions run first, so the write lands past the shortened end
        assert!(matches!(
            tree.put_many(&root, ops),
            Err(TreeError::OutOfRange { block: 20, .. })
        ));

        let ops = vec![
            BlockOp::new(3, b"three".to_vec()),
            BlockOp::delete(19),
            BlockOp::delete(18),
        ];
        let updated = tree.put_many(&root, ops).unwrap();
        assert_eq!(tree.count(&updated).unwrap(), 18);
        assert_eq!(tree.read(&updated, 3).unwrap(), b"three");
        assert_eq!(tree.read(&updated, 17).unwrap(), payload(17));
    }

    #[test]
    fn test_delete_rules() {
        let mut store = memory_store();
        let root = build(&mut store, 1500);
        let mut tree = BlockTree::new(&mut store);

        assert!(matches!(
            tree.delete(&root, 700),
            Err(TreeError::OutOfRange { block: 700, .. })
        ));
        assert!(matches!(
            tree.delete(&root, 1500),
            Err(TreeError::OutOfRange { block: 1500, .. })
        ));
        assert!(matches!(
            tree.delete(&TreeNode::Empty, 0),
            Err(TreeError::OutOfRange { block: 0, .. })
        ));
        assert_blocks(&mut tree, &root, 1500);
    }

    #[test]
    fn test_gap_is_rejected() {
        let mut store = memory_store();
        let root = build(&mut store, 5);
        let mut tree = BlockTree::new(&mut store);

        assert!(matches!(
            tree.put(&root, 6, b"gap"),
            Err(TreeError::OutOfRange { block: 6, .. })
        ));
        assert!(matches!(
            tree.put(&root, 2000, b"gap"),
            Err(TreeError::OutOfRange { block: 2000, .. })
        ));
        assert!(matches!(
            tree.put(&TreeNode::Empty, 1, b"gap"),
            Err(TreeError::OutOfRange { block: 1, .. })
        ));
        let ops = vec![BlockOp::new(0, b"a".to_vec()), BlockOp::new(2, b"c".to_vec())];
        assert!(matches!(
            tree.put_many(&TreeNode::Empty, ops),
            Err(TreeError::OutOfRange { block: 2, .. })
        ));
        assert_blocks(&mut tree, &root, 5);
    }

    #[test]
    fn test_block_limit() {
        let mut store = memory_store();
        let mut tree = BlockTree::new(&mut store);
        assert!(matches!(
            tree.put(&TreeNode::Empty, MAX_BLOCKS, b"far"),
            Err(TreeError::OutOfRange { .. })
        ));
    }

    #[test]
    fn test_fill_ops() {
        let mut store = memory_store();
        let mut tree = BlockTree::new(&mut store);

        let ops: Vec<BlockOp> = (0..3u8)
            .map(|b| {
                BlockOp::fill(b as u64, 16, move |buf: &mut [u8]| {
                    buf.fill(b);
                    Ok(())
                })
            })
            .collect();
        let root = tree.put_many(&TreeNode::Empty, ops).unwrap();
        assert_eq!(tree.read(&root, 2).unwrap(), vec![2u8; 16]);

        let failing = BlockOp::fill(3, 16, |_buf: &mut [u8]| {
            Err(io::Error::new(io::ErrorKind::UnexpectedEof, "source ran dry"))
        });
        assert!(matches!(
            tree.put_many(&root, vec![failing]),
            Err(TreeError::Fill { block: 3, .. })
        ));

        let oversized = BlockOp::fill(3, MAX_BLOCK_SIZE + 1, |_buf: &mut [u8]| Ok(()));
        assert!(matches!(
            tree.put_many(&root, vec![oversized]),
            Err(TreeError::Store(StoreError::TooLarge(_)))
        ));
    }

    #[test]
    fn test_get_short_buffer() {
        let mut store = memory_store();
        let mut tree = BlockTree::new(&mut store);
        let root = tree.put(&TreeNode::Empty, 0, b"0123456789").unwrap();

        let mut buf = [0u8; 4];
        assert_eq!(tree.get(&root, 0, &mut buf).unwrap(), 10);
        assert_eq!(&buf, b"0123");
    }

    #[test]
    fn test_corrupt_indirect_block() {
        let mut store = memory_store();
        let garbage = store.put(&[0xffu8; 40]).unwrap();
        let root = TreeNode::Indirect {
            depth: 1,
            addr: garbage,
            full: false,
        };
        let mut tree = BlockTree::new(&mut store);

        assert!(matches!(tree.read(&root, 0), Err(TreeError::Corrupt(_))));
        assert!(matches!(tree.count(&root), Err(TreeError::Corrupt(_))));
        assert!(matches!(
            tree.put(&root, 0, b"x"),
            Err(TreeError::Corrupt(_))
        ));
    }

    #[test]
    fn test_empty_slot_in_indirect_block() {
        let mut store = memory_store();
        let children = [
            TreeNode::Leaf(Address::of(b"a")),
            TreeNode::Empty,
            TreeNode::Leaf(Address::of(b"c")),
        ];
        let addr = store.put(&encode_indirect(&children)).unwrap();
        let root = TreeNode::Indirect {
            depth: 1,
            addr,
            full: false,
        };
        let mut tree = BlockTree::new(&mut store);

        assert!(matches!(tree.lookup(&root, 1), Err(TreeError::Corrupt(_))));
        assert!(matches!(tree.count(&root), Err(TreeError::Corrupt(_))));
        assert!(matches!(
            tree.put(&root, 1, b"b"),
            Err(TreeError::Corrupt(_))
        ));
    }

    #[test]
    fn test_indirect_depth_out_of_bounds() {
        let mut store = memory_store();
        let addr = store
            .put(&encode_indirect(&[
                TreeNode::Leaf(Address::of(b"a")),
                TreeNode::Leaf(Address::of(b"b")),
            ]))
            .unwrap();
        let mut tree = BlockTree::new(&mut store);

        for depth in [0, MAX_DEPTH + 1, u8::MAX] {
            for full in [false, true] {
                let root = TreeNode::Indirect { depth, addr, full };
                assert!(matches!(tree.lookup(&root, 0), Err(TreeError::Corrupt(_))));
                assert!(matches!(tree.count(&root), Err(TreeError::Corrupt(_))));
                assert!(matches!(
                    tree.put(&root, 2, b"x"),
                    Err(TreeError::Corrupt(_))
                ));
                assert!(matches!(tree.delete(&root, 1), Err(TreeError::Corrupt(_))));
            }
        }
    }

    #[test]
    fn test_full_flag_propagates_through_indirect_children() {
        let n = span(2);
        // Payloads repeat per depth-1 subtree so the store stays small
        let small = |b: u64| ((b % FANOUT as u64) as u16).to_le_bytes().to_vec();

        let mut store = memory_store();
        let mut tree = BlockTree::new(&mut store);
        let ops: Vec<BlockOp> = (0..n).map(|b| BlockOp::new(b, small(b))).collect();
        let full = tree.put_many(&TreeNode::Empty, ops).unwrap();

        assert!(full.is_full_at(2));
        assert_eq!(tree.count(&full).unwrap(), n);
        assert_eq!(tree.read(&full, n - 1).unwrap(), small(n - 1));

        let grown = tree.put(&full, n, b"next level").unwrap();
        assert_eq!(grown.depth(), 3);
        assert!(!grown.is_full());
        assert_eq!(tree.count(&grown).unwrap(), n + 1);
        assert_eq!(tree.read(&grown, n).unwrap(), b"next level");
        assert_eq!(tree.read(&grown, 5000).unwrap(), small(5000));

        let shrunk = tree.delete(&grown, n).unwrap();
        assert_eq!(shrunk, full);

        let partial = tree.delete(&full, n - 1).unwrap();
        assert_eq!(partial.depth(), 2);
        assert!(!partial.is_full());
        assert_eq!(tree.count(&partial).unwrap(), n - 1);
        assert!(matches!(
            tree.read(&partial, n - 1),
            Err(TreeError::OutOfRange { .. })
        ));
    }

    #[test]
    fn test_missing_indirect_block() {
        let mut store = memory_store();
        let root = TreeNode::Indirect {
            depth: 1,
            addr: Address::of(b"never stored"),
            full: false,
        };
        let mut tree = BlockTree::new(&mut store);
        assert!(matches!(
            tree.count(&root),
            Err(TreeError::Store(StoreError::NotFound(_)))
        ));
    }

    #[test]
    fn test_file_backed_tree_survives_reopen() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("store");
        FileStore::create(&dir).unwrap();

        let capture = Capture::new();
        let logger: Logger = capture.clone();
        let backend = FileStore::open(&dir, logger.clone()).unwrap();
        let mut store = Store::new(Box::new(backend), logger);
        let root = build(&mut store, 1100);
        store.release().unwrap();
        assert!(capture.contains(log::Level::Debug, "applied 1100 block ops"));

        let backend = FileStore::open(&dir, logging::discard()).unwrap();
        let mut store = Store::uncached(Box::new(backend), logging::discard());
        let mut tree = BlockTree::new(&mut store);
        let text = root.to_hex();
        let reopened = TreeNode::from_hex(&text).unwrap();
        assert_blocks(&mut tree, &reopened, 1100);
    }
}
