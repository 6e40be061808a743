//! In-memory block index graph.
//!
//! Nodes live in an arena and refer to each other by [`NodeId`]. The graph is
//! append-only for the lifetime of the process; failed blocks stay in it with
//! their failure bits set.

use std::collections::HashMap;

use coind_consensus::Hash256;
use coind_pow::difficulty::{block_proof, HeaderInfo};
use coind_primitives::block::BlockHeader;
use primitive_types::U256;

pub type NodeId = usize;

pub const BLOCK_VALID_UNKNOWN: u32 = 0;
/// Parsed, version ok, hash satisfies its claimed target.
pub const BLOCK_VALID_HEADER: u32 = 1;
/// All parents found, difficulty and timestamps valid.
pub const BLOCK_VALID_TREE: u32 = 2;
/// Block data present and context-free checks passed. Implies every parent
/// is at least TREE, but not that they have data.
pub const BLOCK_VALID_TRANSACTIONS: u32 = 3;
/// Outputs do not overspend, no double spends, coinbase ok. Implies all
/// parents are also at least CHAIN.
pub const BLOCK_VALID_CHAIN: u32 = 4;
/// Scripts and signatures ok.
pub const BLOCK_VALID_SCRIPTS: u32 = 5;
pub const BLOCK_VALID_MASK: u32 = 7;

pub const BLOCK_HAVE_DATA: u32 = 8;
pub const BLOCK_HAVE_UNDO: u32 = 16;
pub const BLOCK_HAVE_MASK: u32 = BLOCK_HAVE_DATA | BLOCK_HAVE_UNDO;

pub const BLOCK_FAILED_VALID: u32 = 32;
pub const BLOCK_FAILED_CHILD: u32 = 64;
pub const BLOCK_FAILED_MASK: u32 = BLOCK_FAILED_VALID | BLOCK_FAILED_CHILD;

#[derive(Clone, Debug)]
pub struct BlockIndexNode {
    pub hash: Hash256,
    pub prev_hash: Hash256,
    pub prev: Option<NodeId>,
    pub skip: Option<NodeId>,
    pub height: i32,
    pub file: u32,
    pub data_pos: u32,
    pub undo_pos: u32,
    pub chain_work: U256,
    pub tx_count: u32,
    /// Transactions up to and including this block. Zero until every
    /// ancestor's data has been received.
    pub chain_tx: u64,
    pub status: u32,
    /// Order in which full block data arrived. Zero for blocks loaded from disk.
    pub sequence_id: u32,
    pub version: i32,
    pub merkle_root: Hash256,
    pub time: u32,
    pub bits: u32,
    pub nonce: u32,
}

impl BlockIndexNode {
    pub fn from_header(hash: Hash256, header: &BlockHeader) -> Self {
        Self {
            hash,
            prev_hash: header.prev_block,
            prev: None,
            skip: None,
            height: 0,
            file: 0,
            data_pos: 0,
            undo_pos: 0,
            chain_work: U256::zero(),
            tx_count: 0,
            chain_tx: 0,
            status: BLOCK_VALID_UNKNOWN,
            sequence_id: 0,
            version: header.version,
            merkle_root: header.merkle_root,
            time: header.time,
            bits: header.bits,
            nonce: header.nonce,
        }
    }

    pub fn header(&self) -> BlockHeader {
        BlockHeader {
            version: self.version,
            prev_block: self.prev_hash,
            merkle_root: self.merkle_root,
            time: self.time,
            bits: self.bits,
            nonce: self.nonce,
        }
    }

    pub fn block_time(&self) -> i64 {
        self.time as i64
    }

    pub fn is_failed(&self) -> bool {
        self.status & BLOCK_FAILED_MASK != 0
    }

    pub fn have_data(&self) -> bool {
        self.status & BLOCK_HAVE_DATA != 0
    }

    pub fn have_undo(&self) -> bool {
        self.status & BLOCK_HAVE_UNDO != 0
    }

    /// Whether the node reached validity level `up_to` and has not failed.
    pub fn is_valid(&self, up_to: u32) -> bool {
        if self.is_failed() {
            return false;
        }
        (self.status & BLOCK_VALID_MASK) >= up_to
    }

    /// Raises the validity level. Returns whether anything changed.
    pub fn raise_validity(&mut self, up_to: u32) -> bool {
        if self.is_failed() {
            return false;
        }
        if (self.status & BLOCK_VALID_MASK) < up_to {
            self.status = (self.status & !BLOCK_VALID_MASK) | up_to;
            return true;
        }
        false
    }
}

fn invert_lowest_one(value: i32) -> i32 {
    value & value.saturating_sub(1)
}

/// Height the skip pointer of a node at `height` points to.
pub fn get_skip_height(height: i32) -> i32 {
    if height < 2 {
        0
    } else if (height & 1) != 0 {
        invert_lowest_one(invert_lowest_one(height - 1)) + 1
    } else {
        invert_lowest_one(height)
    }
}

#[derive(Default)]
pub struct BlockIndex {
    nodes: Vec<BlockIndexNode>,
    by_hash: HashMap<Hash256, NodeId>,
}

impl BlockIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn lookup(&self, hash: &Hash256) -> Option<NodeId> {
        self.by_hash.get(hash).copied()
    }

    pub fn node(&self, id: NodeId) -> &BlockIndexNode {
        &self.nodes[id]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut BlockIndexNode {
        &mut self.nodes[id]
    }

    pub fn get(&self, hash: &Hash256) -> Option<&BlockIndexNode> {
        self.lookup(hash).map(|id| &self.nodes[id])
    }

    pub fn ids(&self) -> impl Iterator<Item = NodeId> {
        0..self.nodes.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (NodeId, &BlockIndexNode)> {
        self.nodes.iter().enumerate()
    }

    /// Inserts a header, linking it to its parent when the parent is known.
    /// Returns the existing id if the hash is already indexed.
    pub fn insert_header(&mut self, hash: Hash256, header: &BlockHeader) -> NodeId {
        if let Some(id) = self.lookup(&hash) {
            return id;
        }
        let mut node = BlockIndexNode::from_header(hash, header);
        node.prev = self.lookup(&header.prev_block);
        self.push_linked(node)
    }

    /// Inserts a node whose link fields are recomputed from `prev`.
    pub(crate) fn push_linked(&mut self, mut node: BlockIndexNode) -> NodeId {
        let proof = block_proof(node.bits);
        match node.prev {
            Some(prev) => {
                let parent = &self.nodes[prev];
                node.height = parent.height + 1;
                node.chain_work = parent.chain_work.saturating_add(proof);
                node.skip = self.ancestor(prev, get_skip_height(node.height));
            }
            None => {
                node.height = 0;
                node.chain_work = proof;
                node.skip = None;
            }
        }
        let id = self.nodes.len();
        self.by_hash.insert(node.hash, id);
        self.nodes.push(node);
        id
    }

    /// Ancestor of `id` at `height`, walking skip pointers.
    pub fn ancestor(&self, id: NodeId, height: i32) -> Option<NodeId> {
        let start = &self.nodes[id];
        if height > start.height || height < 0 {
            return None;
        }
        let mut walk = id;
        let mut height_walk = start.height;
        while height_walk > height {
            let node = &self.nodes[walk];
            let height_skip = get_skip_height(height_walk);
            let height_skip_prev = get_skip_height(height_walk - 1);
            let use_skip = node.skip.is_some()
                && (height_skip == height
                    || (height_skip > height
                        && !(height_skip_prev < height_skip - 2 && height_skip_prev >= height)));
            match (use_skip, node.skip, node.prev) {
                (true, Some(skip), _) => {
                    walk = skip;
                    height_walk = height_skip;
                }
                (_, _, Some(prev)) => {
                    walk = prev;
                    height_walk -= 1;
                }
                _ => return None,
            }
        }
        Some(walk)
    }

    pub fn prev(&self, id: NodeId) -> Option<NodeId> {
        self.nodes[id].prev
    }

    /// Whether `ancestor` is on the path from `id` back to genesis.
    pub fn is_ancestor(&self, ancestor: NodeId, id: NodeId) -> bool {
        let height = self.nodes[ancestor].height;
        self.ancestor(id, height) == Some(ancestor)
    }

    pub fn last_common_ancestor(&self, a: NodeId, b: NodeId) -> Option<NodeId> {
        let (mut a, mut b) = (a, b);
        let height_a = self.nodes[a].height;
        let height_b = self.nodes[b].height;
        if height_a > height_b {
            a = self.ancestor(a, height_b)?;
        } else if height_b > height_a {
            b = self.ancestor(b, height_a)?;
        }
        while a != b {
            a = self.nodes[a].prev?;
            b = self.nodes[b].prev?;
        }
        Some(a)
    }

    /// Median of the last eleven block times ending at `id`.
    pub fn median_time_past(&self, id: NodeId) -> i64 {
        let mut times = Vec::with_capacity(coind_consensus::constants::MEDIAN_TIME_SPAN);
        let mut cursor = Some(id);
        while let Some(current) = cursor {
            if times.len() == coind_consensus::constants::MEDIAN_TIME_SPAN {
                break;
            }
            times.push(self.nodes[current].block_time());
            cursor = self.nodes[current].prev;
        }
        times.sort_unstable();
        times[times.len() / 2]
    }

    pub fn header_info(&self, id: NodeId) -> HeaderInfo {
        let node = &self.nodes[id];
        HeaderInfo {
            height: node.height as i64,
            time: node.block_time(),
            bits: node.bits,
        }
    }

    /// Whether at least `required` of the `window` blocks ending at `start`
    /// have a version of at least `min_version`.
    pub fn is_super_majority(
        &self,
        min_version: i32,
        start: Option<NodeId>,
        required: i32,
        window: i32,
    ) -> bool {
        let mut found = 0;
        let mut cursor = start;
        let mut seen = 0;
        while let Some(id) = cursor {
            if seen >= window || found >= required {
                break;
            }
            let node = &self.nodes[id];
            if node.version >= min_version {
                found += 1;
            }
            seen += 1;
            cursor = node.prev;
        }
        found >= required
    }
}
