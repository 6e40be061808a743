//! Transactions whose inputs are not known yet.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use coind_chainstate::state::PeerId;
use coind_consensus::{hash256_to_hex, Hash256};
use coind_log::{log_cat, Category};
use coind_primitives::transaction::Transaction;
use rand::Rng;

use crate::mempool::Txid;

pub const DEFAULT_MAX_ORPHAN_TRANSACTIONS: usize = 100;
/// Larger orphans are dropped: a peer could otherwise fill the pool with
/// big transactions that never resolve.
pub const MAX_ORPHAN_TX_SIZE: usize = 5000;

#[derive(Clone, Debug)]
pub struct OrphanTx {
    pub tx: Transaction,
    pub from_peer: PeerId,
}

#[derive(Debug, Default)]
pub struct OrphanPool {
    orphans: BTreeMap<Txid, OrphanTx>,
    by_prev: HashMap<Hash256, BTreeSet<Txid>>,
}

impl OrphanPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.orphans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.orphans.is_empty()
    }

    pub fn contains(&self, txid: &Txid) -> bool {
        self.orphans.contains_key(txid)
    }

    pub fn get(&self, txid: &Txid) -> Option<&OrphanTx> {
        self.orphans.get(txid)
    }

    /// Orphans spending an output of `parent`.
    pub fn dependents_of(&self, parent: &Hash256) -> Vec<Txid> {
        self.by_prev
            .get(parent)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn add_orphan_tx(&mut self, tx: &Transaction, peer: PeerId) -> bool {
        let txid = tx.txid();
        if self.orphans.contains_key(&txid) {
            return false;
        }
        let size = tx.serialized_size();
        if size > MAX_ORPHAN_TX_SIZE {
            log_cat!(
                Category::Mempool,
                "ignoring large orphan tx (size: {size}, hash: {})",
                hash256_to_hex(&txid)
            );
            return false;
        }
        for input in &tx.vin {
            self.by_prev.entry(input.prevout.hash).or_default().insert(txid);
        }
        self.orphans.insert(
            txid,
            OrphanTx {
                tx: tx.clone(),
                from_peer: peer,
            },
        );
        log_cat!(
            Category::Mempool,
            "stored orphan tx {} (mapsz {} prevsz {})",
            hash256_to_hex(&txid),
            self.orphans.len(),
            self.by_prev.len()
        );
        true
    }

    pub fn erase_orphan_tx(&mut self, txid: &Txid) -> bool {
        let Some(orphan) = self.orphans.remove(txid) else {
            return false;
        };
        for input in &orphan.tx.vin {
            let Some(set) = self.by_prev.get_mut(&input.prevout.hash) else {
                continue;
            };
            set.remove(txid);
            if set.is_empty() {
                self.by_prev.remove(&input.prevout.hash);
            }
        }
        true
    }

    pub fn erase_orphans_for(&mut self, peer: PeerId) -> usize {
        let from_peer: Vec<Txid> = self
            .orphans
            .iter()
            .filter(|(_, orphan)| orphan.from_peer == peer)
            .map(|(txid, _)| *txid)
            .collect();
        for txid in &from_peer {
            self.erase_orphan_tx(txid);
        }
        if !from_peer.is_empty() {
            log_cat!(
                Category::Mempool,
                "erased {} orphan tx from peer {peer}",
                from_peer.len()
            );
        }
        from_peer.len()
    }

    /// Evicts random orphans until at most `max` remain.
    pub fn limit_orphan_tx_size(&mut self, max: usize) -> usize {
        let mut rng = rand::thread_rng();
        let mut evicted = 0;
        while self.orphans.len() > max {
            let random: Hash256 = rng.gen();
            let victim = self
                .orphans
                .range(random..)
                .next()
                .or_else(|| self.orphans.iter().next())
                .map(|(txid, _)| *txid);
            let Some(victim) = victim else {
                break;
            };
            self.erase_orphan_tx(&victim);
            evicted += 1;
        }
        evicted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coind_primitives::outpoint::OutPoint;
    use coind_primitives::transaction::{TxIn, TxOut};

    fn orphan(parent: Hash256, tag: u8, script_len: usize) -> Transaction {
        Transaction {
            version: 1,
            vin: vec![TxIn::new(OutPoint::new(parent, 0), vec![tag; script_len])],
            vout: vec![TxOut::new(1_000, vec![0x51])],
            lock_time: 0,
        }
    }

    #[test]
    fn add_index_and_erase() {
        let mut pool = OrphanPool::new();
        let first = orphan([1; 32], 1, 1);
        let second = orphan([1; 32], 2, 1);
        assert!(pool.add_orphan_tx(&first, 7));
        assert!(!pool.add_orphan_tx(&first, 7));
        assert!(pool.add_orphan_tx(&second, 8));
        assert_eq!(pool.dependents_of(&[1; 32]).len(), 2);

        assert!(pool.erase_orphan_tx(&first.txid()));
        assert_eq!(pool.dependents_of(&[1; 32]), vec![second.txid()]);
        assert_eq!(pool.erase_orphans_for(8), 1);
        assert!(pool.is_empty());
        assert!(pool.by_prev.is_empty());
    }

    #[test]
    fn oversized_orphans_are_ignored() {
        let mut pool = OrphanPool::new();
        assert!(!pool.add_orphan_tx(&orphan([2; 32], 1, MAX_ORPHAN_TX_SIZE), 1));
        assert!(pool.is_empty());
    }

    #[test]
    fn limit_evicts_down_to_the_cap() {
        let mut pool = OrphanPool::new();
        for tag in 0..20u8 {
            pool.add_orphan_tx(&orphan([tag; 32], tag, 1), 1);
        }
        assert_eq!(pool.limit_orphan_tx_size(5), 15);
        assert_eq!(pool.len(), 5);
        let indexed: usize = pool.by_prev.values().map(BTreeSet::len).sum();
        assert_eq!(indexed, 5);
    }
}
