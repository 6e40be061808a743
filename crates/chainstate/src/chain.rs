//! The active chain: a height-indexed view over the block index.

use coind_consensus::Hash256;

use crate::blockindex::{BlockIndex, NodeId};

#[derive(Clone, Debug, Default)]
pub struct ActiveChain {
    ids: Vec<NodeId>,
}

impl ActiveChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn genesis(&self) -> Option<NodeId> {
        self.ids.first().copied()
    }

    pub fn tip(&self) -> Option<NodeId> {
        self.ids.last().copied()
    }

    /// Height of the tip, `-1` for an empty chain.
    pub fn height(&self) -> i32 {
        self.ids.len() as i32 - 1
    }

    pub fn at(&self, height: i32) -> Option<NodeId> {
        if height < 0 {
            return None;
        }
        self.ids.get(height as usize).copied()
    }

    pub fn contains(&self, index: &BlockIndex, id: NodeId) -> bool {
        self.at(index.node(id).height) == Some(id)
    }

    /// Successor of `id` on this chain, if `id` is on it.
    pub fn next(&self, index: &BlockIndex, id: NodeId) -> Option<NodeId> {
        if self.contains(index, id) {
            self.at(index.node(id).height + 1)
        } else {
            None
        }
    }

    /// Makes `tip` the new tip, rewriting only the part that changed.
    pub fn set_tip(&mut self, index: &BlockIndex, tip: Option<NodeId>) {
        let Some(tip) = tip else {
            self.ids.clear();
            return;
        };
        let height = index.node(tip).height as usize;
        self.ids.resize(height + 1, NodeId::MAX);
        let mut cursor = Some(tip);
        while let Some(id) = cursor {
            let slot = index.node(id).height as usize;
            if self.ids[slot] == id {
                break;
            }
            self.ids[slot] = id;
            cursor = index.prev(id);
        }
    }

    /// Last block shared between this chain and the branch ending at `id`.
    pub fn find_fork(&self, index: &BlockIndex, id: NodeId) -> Option<NodeId> {
        let mut cursor = Some(id);
        if index.node(id).height > self.height() {
            cursor = index.ancestor(id, self.height());
        }
        while let Some(current) = cursor {
            if self.contains(index, current) {
                return Some(current);
            }
            cursor = index.prev(current);
        }
        None
    }

    /// Block locator starting at `from` (the tip when `None`): the last ten
    /// blocks one by one, then exponentially sparser, always ending at genesis.
    pub fn locator(&self, index: &BlockIndex, from: Option<NodeId>) -> Vec<Hash256> {
        let mut hashes = Vec::with_capacity(32);
        let mut step = 1;
        let mut cursor = from.or_else(|| self.tip());
        while let Some(id) = cursor {
            let node = index.node(id);
            hashes.push(node.hash);
            if node.height == 0 {
                break;
            }
            let height = (node.height - step).max(0);
            cursor = if self.contains(index, id) {
                self.at(height)
            } else {
                index.ancestor(id, height)
            };
            if hashes.len() > 10 {
                step *= 2;
            }
        }
        hashes
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = NodeId> + '_ {
        self.ids.iter().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coind_primitives::block::BlockHeader;

    fn build(index: &mut BlockIndex, parent: Option<NodeId>, count: usize, salt: u8) -> Vec<NodeId> {
        let mut ids = Vec::new();
        let mut prev_hash = parent.map(|id| index.node(id).hash).unwrap_or([0u8; 32]);
        for i in 0..count {
            let header = BlockHeader {
                version: 1,
                prev_block: prev_hash,
                merkle_root: [salt; 32],
                time: 1_000 + i as u32,
                bits: 0x207fffff,
                nonce: i as u32,
            };
            let mut hash = [salt; 32];
            hash[0..8].copy_from_slice(&(i as u64).to_le_bytes());
            let id = index.insert_header(hash, &header);
            prev_hash = hash;
            ids.push(id);
        }
        ids
    }

    #[test]
    fn set_tip_switches_branches() {
        let mut index = BlockIndex::new();
        let main = build(&mut index, None, 6, 1);
        let fork = build(&mut index, Some(main[2]), 5, 2);
        let mut chain = ActiveChain::new();
        assert_eq!(chain.height(), -1);
        chain.set_tip(&index, Some(main[5]));
        assert_eq!(chain.height(), 5);
        assert!(chain.contains(&index, main[3]));
        assert_eq!(chain.next(&index, main[2]), Some(main[3]));

        chain.set_tip(&index, Some(fork[4]));
        assert_eq!(chain.height(), 7);
        assert!(!chain.contains(&index, main[3]));
        assert!(chain.contains(&index, main[2]));
        assert_eq!(chain.at(3), Some(fork[0]));
        assert_eq!(chain.find_fork(&index, main[5]), Some(main[2]));
    }

    #[test]
    fn locator_ends_at_genesis() {
        let mut index = BlockIndex::new();
        let main = build(&mut index, None, 40, 3);
        let mut chain = ActiveChain::new();
        chain.set_tip(&index, Some(main[39]));
        let locator = chain.locator(&index, None);
        assert_eq!(locator.first(), Some(&index.node(main[39]).hash));
        assert_eq!(locator.last(), Some(&index.node(main[0]).hash));
        // Heights 39..=29 one by one, then 28, 26, 22, 14, 0.
        assert_eq!(locator.len(), 16);
        assert_eq!(locator[11], index.node(main[28]).hash);
        assert_eq!(locator[14], index.node(main[14]).hash);
    }
}
