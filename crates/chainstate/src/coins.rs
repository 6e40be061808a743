//! Unspent outputs grouped per transaction, and the layered views over them.
//!
//! A [`CoinsViewCache`] sits on top of any other [`CoinsView`]: misses are
//! fetched from the parent and cached, modifications stay local until
//! [`CoinsViewCache::flush`] hands them to the parent in one batch.

use std::collections::HashMap;
use std::sync::Arc;

use coind_consensus::money::Amount;
use coind_consensus::Hash256;
use coind_primitives::encoding::{DecodeError, Decoder, Encoder};
use coind_primitives::transaction::{Transaction, TxIn, TxOut};
use coind_storage::{Column, KeyValueStore, StoreError, WriteBatch};

use crate::undo::TxInUndo;

const META_BEST_BLOCK_KEY: &[u8] = b"coins_best_block";

/// Height reported for coins created by unconfirmed transactions.
pub const MEMPOOL_HEIGHT: i32 = 0x7fff_ffff;

/// Unspent outputs of one transaction. Spent outputs are `None`; trailing
/// spent outputs are trimmed so a fully spent record has no outputs.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Coins {
    pub outputs: Vec<Option<TxOut>>,
    pub height: i32,
    pub is_coinbase: bool,
    pub version: i32,
}

impl Coins {
    pub fn from_tx(tx: &Transaction, height: i32) -> Self {
        let mut coins = Self {
            outputs: tx.vout.iter().cloned().map(Some).collect(),
            height,
            is_coinbase: tx.is_coinbase(),
            version: tx.version,
        };
        coins.cleanup();
        coins
    }

    pub fn clear(&mut self) {
        self.outputs.clear();
        self.height = 0;
        self.is_coinbase = false;
        self.version = 0;
    }

    /// Drops trailing spent outputs and unspendable scripts.
    pub fn cleanup(&mut self) {
        for output in self.outputs.iter_mut() {
            if output
                .as_ref()
                .is_some_and(|out| coind_script::script::is_unspendable(&out.script_pubkey))
            {
                *output = None;
            }
        }
        while matches!(self.outputs.last(), Some(None)) {
            self.outputs.pop();
        }
        if self.outputs.is_empty() {
            self.outputs.shrink_to_fit();
        }
    }

    pub fn is_available(&self, index: u32) -> bool {
        matches!(self.outputs.get(index as usize), Some(Some(_)))
    }

    pub fn is_pruned(&self) -> bool {
        self.outputs.iter().all(Option::is_none)
    }

    pub fn output(&self, index: u32) -> Option<&TxOut> {
        self.outputs.get(index as usize).and_then(Option::as_ref)
    }

    /// Marks output `index` spent. The undo record carries the record's
    /// metadata when this spend emptied it.
    pub fn spend(&mut self, index: u32) -> Option<TxInUndo> {
        let slot = self.outputs.get_mut(index as usize)?;
        let txout = slot.take()?;
        let mut undo = TxInUndo::new(txout);
        self.cleanup();
        if self.outputs.is_empty() {
            undo.height = self.height;
            undo.is_coinbase = self.is_coinbase;
            undo.version = self.version;
        }
        Some(undo)
    }

    pub fn dynamic_memory_usage(&self) -> usize {
        let scripts: usize = self
            .outputs
            .iter()
            .flatten()
            .map(|out| out.script_pubkey.capacity())
            .sum();
        self.outputs.capacity() * std::mem::size_of::<Option<TxOut>>() + scripts
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        encoder.write_i32_le(self.version);
        encoder.write_compact_size((self.height.max(0) as u64) * 2 + u64::from(self.is_coinbase));
        encoder.write_compact_size(self.outputs.len() as u64);
        for output in &self.outputs {
            match output {
                Some(out) => {
                    encoder.write_u8(1);
                    encoder.write_i64_le(out.value);
                    encoder.write_var_bytes(&out.script_pubkey);
                }
                None => encoder.write_u8(0),
            }
        }
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let version = decoder.read_i32_le()?;
        let code = decoder.read_compact_size()?;
        let height = i32::try_from(code / 2).map_err(|_| DecodeError::InvalidData("coins height"))?;
        let count = decoder.read_compact_size()? as usize;
        let mut outputs = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            if decoder.read_u8()? == 0 {
                outputs.push(None);
            } else {
                let value = decoder.read_i64_le()?;
                let script_pubkey = decoder.read_var_bytes()?;
                outputs.push(Some(TxOut::new(value, script_pubkey)));
            }
        }
        if !decoder.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(Self {
            outputs,
            height,
            is_coinbase: code & 1 != 0,
            version,
        })
    }
}

/// The entry differs from the parent's version.
pub const COINS_DIRTY: u8 = 1;
/// The parent has no unspent version of this entry, so a pruned entry can be
/// dropped instead of written.
pub const COINS_FRESH: u8 = 2;

#[derive(Clone, Debug, Default)]
pub struct CoinsCacheEntry {
    pub coins: Coins,
    pub flags: u8,
}

pub type CoinsMap = HashMap<Hash256, CoinsCacheEntry>;

/// A source of coins. Implementations must be shareable across the script
/// check workers, hence the bounds.
pub trait CoinsView: Send + Sync {
    fn coins(&self, txid: &Hash256) -> Result<Option<Coins>, StoreError>;

    fn have_coins(&self, txid: &Hash256) -> Result<bool, StoreError> {
        Ok(self.coins(txid)?.is_some_and(|coins| !coins.is_pruned()))
    }

    fn best_block(&self) -> Result<Hash256, StoreError>;

    /// Applies a set of dirty entries and moves the best-block marker.
    fn batch_write(&mut self, changes: CoinsMap, best_block: Hash256) -> Result<(), StoreError>;
}

/// Coins persisted in a key-value store, one record per transaction id.
pub struct CoinsViewDb<S> {
    store: Arc<S>,
}

impl<S> CoinsViewDb<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }
}

impl<S: KeyValueStore> CoinsViewDb<S> {
    /// Visits every unspent record. Used by the consistency checks.
    pub fn for_each_coins(
        &self,
        mut visit: impl FnMut(&Hash256, &Coins),
    ) -> Result<(), StoreError> {
        self.store
            .for_each_prefix(Column::Coins, &[], &mut |key, value| {
                let txid: Hash256 = key
                    .try_into()
                    .map_err(|_| StoreError::Backend("invalid coins key".to_string()))?;
                let coins =
                    Coins::decode(value).map_err(|err| StoreError::Backend(err.to_string()))?;
                visit(&txid, &coins);
                Ok(())
            })
    }
}

impl<S: KeyValueStore> CoinsView for CoinsViewDb<S> {
    fn coins(&self, txid: &Hash256) -> Result<Option<Coins>, StoreError> {
        match self.store.get(Column::Coins, txid)? {
            Some(bytes) => Coins::decode(&bytes)
                .map(Some)
                .map_err(|err| StoreError::Backend(err.to_string())),
            None => Ok(None),
        }
    }

    fn best_block(&self) -> Result<Hash256, StoreError> {
        match self.store.get(Column::Meta, META_BEST_BLOCK_KEY)? {
            Some(bytes) => bytes
                .as_slice()
                .try_into()
                .map_err(|_| StoreError::Backend("invalid best block marker".to_string())),
            None => Ok([0u8; 32]),
        }
    }

    fn batch_write(&mut self, changes: CoinsMap, best_block: Hash256) -> Result<(), StoreError> {
        let mut batch = WriteBatch::new();
        let mut changed = 0usize;
        for (txid, entry) in changes {
            if entry.flags & COINS_DIRTY == 0 {
                continue;
            }
            if entry.coins.is_pruned() {
                batch.delete(Column::Coins, txid);
            } else {
                batch.put(Column::Coins, txid, entry.coins.encode());
            }
            changed += 1;
        }
        if best_block != [0u8; 32] {
            batch.put(Column::Meta, META_BEST_BLOCK_KEY, best_block);
        }
        coind_log::log_debug!("committing {changed} changed transactions to coin database");
        self.store.write_batch(&batch)
    }
}

enum CacheBase<'a> {
    Borrowed(&'a mut dyn CoinsView),
    Owned(Box<dyn CoinsView + 'a>),
}

impl CacheBase<'_> {
    fn view(&self) -> &dyn CoinsView {
        match self {
            CacheBase::Borrowed(view) => &**view,
            CacheBase::Owned(view) => view.as_ref(),
        }
    }

    fn view_mut(&mut self) -> &mut dyn CoinsView {
        match self {
            CacheBase::Borrowed(view) => &mut **view,
            CacheBase::Owned(view) => view.as_mut(),
        }
    }
}

pub struct CoinsViewCache<'a> {
    base: CacheBase<'a>,
    best_block: Hash256,
    cache: CoinsMap,
    cached_usage: usize,
}

impl<'a> CoinsViewCache<'a> {
    pub fn new(base: &'a mut dyn CoinsView) -> Self {
        Self::with_base(CacheBase::Borrowed(base))
    }

    pub fn owned(base: Box<dyn CoinsView + 'a>) -> Self {
        Self::with_base(CacheBase::Owned(base))
    }

    fn with_base(base: CacheBase<'a>) -> Self {
        Self {
            base,
            best_block: [0u8; 32],
            cache: CoinsMap::new(),
            cached_usage: 0,
        }
    }

    pub fn base(&self) -> &dyn CoinsView {
        self.base.view()
    }

    fn fetch(&mut self, txid: &Hash256) -> Result<bool, StoreError> {
        if self.cache.contains_key(txid) {
            return Ok(true);
        }
        let Some(coins) = self.base.view().coins(txid)? else {
            return Ok(false);
        };
        let flags = if coins.is_pruned() { COINS_FRESH } else { 0 };
        self.cached_usage += coins.dynamic_memory_usage();
        self.cache.insert(*txid, CoinsCacheEntry { coins, flags });
        Ok(true)
    }

    pub fn access_coins(&mut self, txid: &Hash256) -> Result<Option<&Coins>, StoreError> {
        if !self.fetch(txid)? {
            return Ok(None);
        }
        Ok(self.cache.get(txid).map(|entry| &entry.coins))
    }

    pub fn have_coins(&mut self, txid: &Hash256) -> Result<bool, StoreError> {
        Ok(self
            .access_coins(txid)?
            .is_some_and(|coins| !coins.is_pruned()))
    }

    pub fn have_coins_in_cache(&self, txid: &Hash256) -> bool {
        self.cache.contains_key(txid)
    }

    /// Runs `modify` on the (possibly empty) record for `txid` and marks it
    /// dirty. A fresh record that ends up pruned is dropped from the cache.
    pub fn modify_coins<R>(
        &mut self,
        txid: &Hash256,
        modify: impl FnOnce(&mut Coins) -> R,
    ) -> Result<R, StoreError> {
        if !self.fetch(txid)? {
            // Not known to any parent: whatever we create here is fresh.
            self.cache.insert(
                *txid,
                CoinsCacheEntry {
                    coins: Coins::default(),
                    flags: COINS_FRESH,
                },
            );
        }
        Ok(self.modify_cached(txid, modify))
    }

    /// Like [`Self::modify_coins`] but assumes the parent holds no unspent
    /// version, so nothing is fetched.
    pub fn modify_new_coins<R>(
        &mut self,
        txid: &Hash256,
        modify: impl FnOnce(&mut Coins) -> R,
    ) -> R {
        let entry = self.cache.entry(*txid).or_default();
        self.cached_usage = self
            .cached_usage
            .saturating_sub(entry.coins.dynamic_memory_usage());
        entry.coins.clear();
        entry.flags = COINS_FRESH;
        self.cached_usage += entry.coins.dynamic_memory_usage();
        self.modify_cached(txid, modify)
    }

    fn modify_cached<R>(&mut self, txid: &Hash256, modify: impl FnOnce(&mut Coins) -> R) -> R {
        let Some(entry) = self.cache.get_mut(txid) else {
            return modify(&mut Coins::default());
        };
        let before = entry.coins.dynamic_memory_usage();
        let result = modify(&mut entry.coins);
        entry.coins.cleanup();
        entry.flags |= COINS_DIRTY;
        let after = entry.coins.dynamic_memory_usage();
        let erase = entry.flags & COINS_FRESH != 0 && entry.coins.is_pruned();
        self.cached_usage = self.cached_usage.saturating_sub(before);
        if erase {
            self.cache.remove(txid);
        } else {
            self.cached_usage += after;
        }
        result
    }

    /// Output spent by `input`, if still unspent in this view.
    pub fn output_for(&mut self, input: &TxIn) -> Result<Option<&TxOut>, StoreError> {
        let index = input.prevout.index;
        Ok(self
            .access_coins(&input.prevout.hash)?
            .and_then(|coins| coins.output(index)))
    }

    /// Whether every input of `tx` refers to an unspent output.
    pub fn have_inputs(&mut self, tx: &Transaction) -> Result<bool, StoreError> {
        if tx.is_coinbase() {
            return Ok(true);
        }
        for input in &tx.vin {
            let available = self
                .access_coins(&input.prevout.hash)?
                .is_some_and(|coins| coins.is_available(input.prevout.index));
            if !available {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Sum of the inputs of `tx`. Missing inputs count as zero; callers check
    /// [`Self::have_inputs`] first.
    pub fn value_in(&mut self, tx: &Transaction) -> Result<Amount, StoreError> {
        if tx.is_coinbase() {
            return Ok(0);
        }
        let mut total: Amount = 0;
        for input in &tx.vin {
            if let Some(out) = self.output_for(input)? {
                total = total.saturating_add(out.value);
            }
        }
        Ok(total)
    }

    /// Input priority of `tx` at `height`: the sum of value times age.
    pub fn priority(&mut self, tx: &Transaction, height: i32) -> Result<f64, StoreError> {
        if tx.is_coinbase() {
            return Ok(0.0);
        }
        let mut result = 0.0;
        for input in &tx.vin {
            let Some(coins) = self.access_coins(&input.prevout.hash)? else {
                continue;
            };
            let Some(out) = coins.output(input.prevout.index) else {
                continue;
            };
            if coins.height <= height {
                result += out.value as f64 * (height - coins.height) as f64;
            }
        }
        Ok(tx.compute_priority(result, tx.serialized_size()))
    }

    pub fn best_block(&mut self) -> Result<Hash256, StoreError> {
        if self.best_block == [0u8; 32] {
            self.best_block = self.base.view().best_block()?;
        }
        Ok(self.best_block)
    }

    pub fn set_best_block(&mut self, hash: Hash256) {
        self.best_block = hash;
    }

    /// Pushes every modification to the parent and empties this cache.
    pub fn flush(&mut self) -> Result<(), StoreError> {
        let changes = std::mem::take(&mut self.cache);
        let best = self.best_block;
        self.cached_usage = 0;
        self.base.view_mut().batch_write(changes, best)
    }

    /// Drops an unmodified entry so memory can be reclaimed.
    pub fn uncache(&mut self, txid: &Hash256) {
        if let Some(entry) = self.cache.get(txid) {
            if entry.flags == 0 {
                self.cached_usage = self
                    .cached_usage
                    .saturating_sub(entry.coins.dynamic_memory_usage());
                self.cache.remove(txid);
            }
        }
    }

    pub fn cache_size(&self) -> usize {
        self.cache.len()
    }

    pub fn dynamic_memory_usage(&self) -> usize {
        self.cache.capacity()
            * (std::mem::size_of::<Hash256>() + std::mem::size_of::<CoinsCacheEntry>())
            + self.cached_usage
    }
}

impl CoinsView for CoinsViewCache<'_> {
    fn coins(&self, txid: &Hash256) -> Result<Option<Coins>, StoreError> {
        match self.cache.get(txid) {
            Some(entry) => Ok(Some(entry.coins.clone())),
            None => self.base.view().coins(txid),
        }
    }

    fn best_block(&self) -> Result<Hash256, StoreError> {
        if self.best_block == [0u8; 32] {
            return self.base.view().best_block();
        }
        Ok(self.best_block)
    }

    fn batch_write(&mut self, changes: CoinsMap, best_block: Hash256) -> Result<(), StoreError> {
        for (txid, child) in changes {
            if child.flags & COINS_DIRTY == 0 {
                continue;
            }
            match self.cache.get_mut(&txid) {
                None => {
                    // Fresh and pruned in the child: nothing for us to record.
                    if child.flags & COINS_FRESH != 0 && child.coins.is_pruned() {
                        continue;
                    }
                    self.cached_usage += child.coins.dynamic_memory_usage();
                    let flags = COINS_DIRTY | (child.flags & COINS_FRESH);
                    self.cache.insert(
                        txid,
                        CoinsCacheEntry {
                            coins: child.coins,
                            flags,
                        },
                    );
                }
                Some(ours) => {
                    self.cached_usage = self
                        .cached_usage
                        .saturating_sub(ours.coins.dynamic_memory_usage());
                    if ours.flags & COINS_FRESH != 0 && child.coins.is_pruned() {
                        self.cache.remove(&txid);
                    } else {
                        self.cached_usage += child.coins.dynamic_memory_usage();
                        ours.coins = child.coins;
                        ours.flags |= COINS_DIRTY;
                    }
                }
            }
        }
        self.best_block = best_block;
        Ok(())
    }
}

/// A view that knows nothing. Lets a cache be used stand-alone.
#[derive(Clone, Copy, Debug, Default)]
pub struct EmptyCoinsView;

impl CoinsView for EmptyCoinsView {
    fn coins(&self, _txid: &Hash256) -> Result<Option<Coins>, StoreError> {
        Ok(None)
    }

    fn best_block(&self) -> Result<Hash256, StoreError> {
        Ok([0u8; 32])
    }

    fn batch_write(&mut self, _changes: CoinsMap, _best_block: Hash256) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coind_primitives::outpoint::OutPoint;
    use coind_storage::memory::MemoryStore;

    fn tx_with_outputs(values: &[Amount], salt: u8) -> Transaction {
        Transaction {
            version: 1,
            vin: vec![TxIn::new(OutPoint::new([salt; 32], 0), vec![0x51])],
            vout: values.iter().map(|v| TxOut::new(*v, vec![0x51])).collect(),
            lock_time: 0,
        }
    }

    #[test]
    fn spend_trims_and_reports_metadata_on_last_output() {
        let tx = tx_with_outputs(&[10, 20], 1);
        let mut coins = Coins::from_tx(&tx, 7);
        let first = coins.spend(1).expect("spend");
        assert_eq!(first.height, 0);
        assert_eq!(coins.outputs.len(), 1);
        assert!(coins.spend(1).is_none());
        let last = coins.spend(0).expect("spend");
        assert_eq!(last.height, 7);
        assert!(coins.is_pruned());
    }

    #[test]
    fn unspendable_outputs_are_never_stored() {
        let mut tx = tx_with_outputs(&[10], 2);
        tx.vout.push(TxOut::new(0, vec![0x6a, 0x01, 0x00]));
        let coins = Coins::from_tx(&tx, 1);
        assert_eq!(coins.outputs.len(), 1);
        assert_eq!(Coins::decode(&coins.encode()).expect("decode"), coins);
    }

    #[test]
    fn cache_layers_flush_to_database() {
        let store = Arc::new(MemoryStore::new());
        let mut db = CoinsViewDb::new(Arc::clone(&store));
        let tx = tx_with_outputs(&[50, 60], 3);
        let txid = tx.txid();
        {
            let mut tip = CoinsViewCache::new(&mut db);
            {
                let mut child = CoinsViewCache::new(&mut tip);
                child.modify_new_coins(&txid, |coins| *coins = Coins::from_tx(&tx, 1));
                child.set_best_block([9u8; 32]);
                child.flush().expect("flush child");
            }
            assert!(tip.have_coins(&txid).expect("have"));
            tip.flush().expect("flush tip");
        }
        assert!(db.have_coins(&txid).expect("db have"));
        assert_eq!(db.best_block().expect("best"), [9u8; 32]);

        {
            let mut tip = CoinsViewCache::new(&mut db);
            tip.modify_coins(&txid, |coins| {
                coins.spend(0);
                coins.spend(1);
            })
            .expect("modify");
            tip.flush().expect("flush");
        }
        assert!(!db.have_coins(&txid).expect("db have"));
    }

    #[test]
    fn fresh_entries_spent_before_flush_never_reach_parent() {
        let store = Arc::new(MemoryStore::new());
        let mut db = CoinsViewDb::new(Arc::clone(&store));
        let tx = tx_with_outputs(&[5], 4);
        let txid = tx.txid();
        let mut tip = CoinsViewCache::new(&mut db);
        tip.modify_new_coins(&txid, |coins| *coins = Coins::from_tx(&tx, 1));
        assert_eq!(tip.cache_size(), 1);
        tip.modify_coins(&txid, |coins| coins.spend(0))
            .expect("modify");
        assert_eq!(tip.cache_size(), 0);
        tip.flush().expect("flush");
        assert_eq!(store.len(Column::Coins), 0);
    }

    #[test]
    fn uncache_keeps_dirty_entries() {
        let mut empty = EmptyCoinsView;
        let mut cache = CoinsViewCache::new(&mut empty);
        let tx = tx_with_outputs(&[5], 5);
        let txid = tx.txid();
        cache.modify_new_coins(&txid, |coins| *coins = Coins::from_tx(&tx, 1));
        cache.uncache(&txid);
        assert!(cache.have_coins_in_cache(&txid));
        assert_eq!(cache.value_in(&tx_with_outputs(&[1], 6)).expect("value"), 0);
        let spend = Transaction {
            version: 1,
            vin: vec![TxIn::new(OutPoint::new(txid, 0), Vec::new())],
            vout: vec![TxOut::new(1, vec![0x51])],
            lock_time: 0,
        };
        assert!(cache.have_inputs(&spend).expect("inputs"));
        assert_eq!(cache.value_in(&spend).expect("value"), 5);
    }
}
