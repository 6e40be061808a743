//! Unconfirmed transaction pool.
//!
//! Every entry carries the aggregate size, modified fee and count of its
//! in-pool ancestors and descendants. The aggregates are maintained eagerly
//! on every add, remove and fee change, so package eviction and chain limits
//! never need a full recomputation.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap};

use coind_chainstate::coins::{Coins, CoinsMap, CoinsView, CoinsViewCache, MEMPOOL_HEIGHT};
use coind_chainstate::state::{update_coins, ChainView};
use coind_chainstate::validation::{check_inputs, LockPoints};
use coind_consensus::constants::COINBASE_MATURITY;
use coind_consensus::money::{Amount, FeeRate};
use coind_consensus::{hash256_to_hex, Hash256};
use coind_log::{log_cat, log_info, Category};
use coind_primitives::outpoint::OutPoint;
use coind_primitives::transaction::Transaction;
use coind_script::Interpreter;
use coind_storage::StoreError;
use rand::Rng;

pub type Txid = Hash256;

pub const DEFAULT_MAX_MEMPOOL_SIZE_MB: usize = 300;
pub const DEFAULT_MEMPOOL_EXPIRY_HOURS: i64 = 72;
pub const DEFAULT_ANCESTOR_LIMIT: u64 = 25;
pub const DEFAULT_ANCESTOR_SIZE_LIMIT_KB: u64 = 101;
pub const DEFAULT_DESCENDANT_LIMIT: u64 = 25;
pub const DEFAULT_DESCENDANT_SIZE_LIMIT_KB: u64 = 101;

/// Seconds for the rolling minimum fee to halve once the pool has room.
pub const ROLLING_FEE_HALFLIFE: i64 = 60 * 60 * 12;

/// Bookkeeping charged per parent or child link.
const LINK_USAGE: usize = 3 * std::mem::size_of::<usize>() + std::mem::size_of::<Txid>();
/// Index overhead charged per entry on top of its own usage.
const ENTRY_OVERHEAD: usize = std::mem::size_of::<TxMemPoolEntry>() + 12 * std::mem::size_of::<usize>();
const NEXT_TX_OVERHEAD: usize =
    std::mem::size_of::<OutPoint>() + std::mem::size_of::<Txid>() + 3 * std::mem::size_of::<usize>();

/// Package limits for a new entry: its ancestors, and the descendants of
/// each of those ancestors once the entry joins them. Sizes are in bytes.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct MempoolLimits {
    pub ancestor_count: u64,
    pub ancestor_size: u64,
    pub descendant_count: u64,
    pub descendant_size: u64,
}

impl Default for MempoolLimits {
    fn default() -> Self {
        Self {
            ancestor_count: DEFAULT_ANCESTOR_LIMIT,
            ancestor_size: DEFAULT_ANCESTOR_SIZE_LIMIT_KB * 1000,
            descendant_count: DEFAULT_DESCENDANT_LIMIT,
            descendant_size: DEFAULT_DESCENDANT_SIZE_LIMIT_KB * 1000,
        }
    }
}

impl MempoolLimits {
    pub const fn unlimited() -> Self {
        Self {
            ancestor_count: u64::MAX,
            ancestor_size: u64::MAX,
            descendant_count: u64::MAX,
            descendant_size: u64::MAX,
        }
    }
}

#[derive(Clone, Debug)]
pub struct TxMemPoolEntry {
    tx: Transaction,
    txid: Txid,
    fee: Amount,
    tx_size: u64,
    modified_size: u64,
    usage: usize,
    time: i64,
    entry_priority: f64,
    entry_height: i32,
    had_no_dependencies: bool,
    in_chain_input_value: Amount,
    spends_coinbase: bool,
    sig_op_count: u32,
    fee_delta: Amount,
    lock_points: LockPoints,

    count_with_descendants: u64,
    size_with_descendants: u64,
    mod_fees_with_descendants: Amount,

    count_with_ancestors: u64,
    size_with_ancestors: u64,
    mod_fees_with_ancestors: Amount,
    sig_ops_with_ancestors: u64,
}

impl TxMemPoolEntry {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        tx: Transaction,
        fee: Amount,
        time: i64,
        entry_priority: f64,
        entry_height: i32,
        had_no_dependencies: bool,
        in_chain_input_value: Amount,
        spends_coinbase: bool,
        sig_op_count: u32,
        lock_points: LockPoints,
    ) -> Self {
        let tx_size = tx.serialized_size() as u64;
        let modified_size = tx.modified_size(tx_size as usize) as u64;
        let usage = transaction_usage(&tx);
        let txid = tx.txid();
        Self {
            tx,
            txid,
            fee,
            tx_size,
            modified_size,
            usage,
            time,
            entry_priority,
            entry_height,
            had_no_dependencies,
            in_chain_input_value,
            spends_coinbase,
            sig_op_count,
            fee_delta: 0,
            lock_points,
            count_with_descendants: 1,
            size_with_descendants: tx_size,
            mod_fees_with_descendants: fee,
            count_with_ancestors: 1,
            size_with_ancestors: tx_size,
            mod_fees_with_ancestors: fee,
            sig_ops_with_ancestors: u64::from(sig_op_count),
        }
    }

    pub fn tx(&self) -> &Transaction {
        &self.tx
    }

    pub fn txid(&self) -> &Txid {
        &self.txid
    }

    pub fn fee(&self) -> Amount {
        self.fee
    }

    pub fn tx_size(&self) -> u64 {
        self.tx_size
    }

    pub fn time(&self) -> i64 {
        self.time
    }

    pub fn height(&self) -> i32 {
        self.entry_height
    }

    pub fn had_no_dependencies(&self) -> bool {
        self.had_no_dependencies
    }

    pub fn spends_coinbase(&self) -> bool {
        self.spends_coinbase
    }

    pub fn sig_op_count(&self) -> u32 {
        self.sig_op_count
    }

    pub fn modified_fee(&self) -> Amount {
        self.fee + self.fee_delta
    }

    pub fn usage(&self) -> usize {
        self.usage
    }

    pub fn lock_points(&self) -> &LockPoints {
        &self.lock_points
    }

    /// Priority once the chain reaches `current_height`; confirmed inputs
    /// keep aging while the transaction waits.
    pub fn priority(&self, current_height: i32) -> f64 {
        if self.modified_size == 0 {
            return self.entry_priority.max(0.0);
        }
        let aged = f64::from(current_height - self.entry_height) * self.in_chain_input_value as f64
            / self.modified_size as f64;
        (self.entry_priority + aged).max(0.0)
    }

    pub fn count_with_descendants(&self) -> u64 {
        self.count_with_descendants
    }

    pub fn size_with_descendants(&self) -> u64 {
        self.size_with_descendants
    }

    pub fn mod_fees_with_descendants(&self) -> Amount {
        self.mod_fees_with_descendants
    }

    pub fn count_with_ancestors(&self) -> u64 {
        self.count_with_ancestors
    }

    pub fn size_with_ancestors(&self) -> u64 {
        self.size_with_ancestors
    }

    pub fn mod_fees_with_ancestors(&self) -> Amount {
        self.mod_fees_with_ancestors
    }

    pub fn sig_ops_with_ancestors(&self) -> u64 {
        self.sig_ops_with_ancestors
    }

    fn update_fee_delta(&mut self, fee_delta: Amount) {
        self.mod_fees_with_descendants += fee_delta - self.fee_delta;
        self.mod_fees_with_ancestors += fee_delta - self.fee_delta;
        self.fee_delta = fee_delta;
    }

    fn update_descendant_state(&mut self, size: i64, fee: Amount, count: i64) {
        self.size_with_descendants = self.size_with_descendants.saturating_add_signed(size);
        self.mod_fees_with_descendants += fee;
        self.count_with_descendants = self.count_with_descendants.saturating_add_signed(count);
    }

    fn update_ancestor_state(&mut self, size: i64, fee: Amount, count: i64, sig_ops: i64) {
        self.size_with_ancestors = self.size_with_ancestors.saturating_add_signed(size);
        self.mod_fees_with_ancestors += fee;
        self.count_with_ancestors = self.count_with_ancestors.saturating_add_signed(count);
        self.sig_ops_with_ancestors = self.sig_ops_with_ancestors.saturating_add_signed(sig_ops);
    }

    /// Whichever of its own fee rate and its package's fee rate is higher.
    fn descendant_score(&self) -> DescendantScore {
        let own = i128::from(self.modified_fee()) * i128::from(self.size_with_descendants);
        let package = i128::from(self.mod_fees_with_descendants) * i128::from(self.tx_size);
        let (fee, size) = if package > own {
            (self.mod_fees_with_descendants, self.size_with_descendants)
        } else {
            (self.modified_fee(), self.tx_size)
        };
        DescendantScore {
            fee,
            size,
            time: self.time,
            txid: self.txid,
        }
    }
}

fn transaction_usage(tx: &Transaction) -> usize {
    let inputs: usize = tx
        .vin
        .iter()
        .map(|input| std::mem::size_of_val(input) + input.script_sig.len())
        .sum();
    let outputs: usize = tx
        .vout
        .iter()
        .map(|output| std::mem::size_of_val(output) + output.script_pubkey.len())
        .sum();
    std::mem::size_of::<Transaction>() + inputs + outputs
}

/// Eviction order: the lowest fee rate first, and among equal rates the most
/// recent entry first.
#[derive(Clone, Copy, Debug)]
struct DescendantScore {
    fee: Amount,
    size: u64,
    time: i64,
    txid: Txid,
}

impl Ord for DescendantScore {
    fn cmp(&self, other: &Self) -> Ordering {
        let left = i128::from(self.fee) * i128::from(other.size);
        let right = i128::from(other.fee) * i128::from(self.size);
        left.cmp(&right)
            .then_with(|| other.time.cmp(&self.time))
            .then_with(|| self.txid.cmp(&other.txid))
    }
}

impl PartialOrd for DescendantScore {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for DescendantScore {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for DescendantScore {}

#[derive(Clone, Debug, Default)]
struct TxLinks {
    parents: BTreeSet<Txid>,
    children: BTreeSet<Txid>,
}

pub struct Mempool {
    entries: HashMap<Txid, TxMemPoolEntry>,
    links: HashMap<Txid, TxLinks>,
    by_descendant_score: BTreeSet<DescendantScore>,
    by_entry_time: BTreeSet<(i64, Txid)>,
    /// Spender of every outpoint consumed by a pool transaction.
    next_tx: BTreeMap<OutPoint, Txid>,
    deltas: HashMap<Txid, (f64, Amount)>,
    total_tx_size: u64,
    cached_inner_usage: usize,
    transactions_updated: u32,
    min_relay_fee: FeeRate,
    check_ratio: f64,
    rolling_minimum_fee_rate: f64,
    last_rolling_fee_update: i64,
    block_since_last_rolling_fee_bump: bool,
}

impl Mempool {
    /// `min_relay_fee` is the floor of the rolling minimum fee and the
    /// increment applied when a package is evicted.
    pub fn new(min_relay_fee: FeeRate) -> Self {
        Self {
            entries: HashMap::new(),
            links: HashMap::new(),
            by_descendant_score: BTreeSet::new(),
            by_entry_time: BTreeSet::new(),
            next_tx: BTreeMap::new(),
            deltas: HashMap::new(),
            total_tx_size: 0,
            cached_inner_usage: 0,
            transactions_updated: 0,
            min_relay_fee,
            check_ratio: 0.0,
            rolling_minimum_fee_rate: 0.0,
            last_rolling_fee_update: 0,
            block_since_last_rolling_fee_bump: false,
        }
    }

    /// Fraction of [`Self::should_check`] calls that answer yes.
    pub fn set_check_ratio(&mut self, ratio: f64) {
        self.check_ratio = ratio.clamp(0.0, 1.0);
    }

    pub fn should_check(&self) -> bool {
        self.check_ratio > 0.0 && rand::thread_rng().gen::<f64>() < self.check_ratio
    }

    pub fn min_relay_fee(&self) -> FeeRate {
        self.min_relay_fee
    }

    pub fn size(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn total_tx_size(&self) -> u64 {
        self.total_tx_size
    }

    pub fn transactions_updated(&self) -> u32 {
        self.transactions_updated
    }

    pub fn add_transactions_updated(&mut self, count: u32) {
        self.transactions_updated = self.transactions_updated.wrapping_add(count);
    }

    pub fn exists(&self, txid: &Txid) -> bool {
        self.entries.contains_key(txid)
    }

    pub fn get(&self, txid: &Txid) -> Option<&TxMemPoolEntry> {
        self.entries.get(txid)
    }

    pub fn lookup(&self, txid: &Txid) -> Option<&Transaction> {
        self.entries.get(txid).map(|entry| &entry.tx)
    }

    pub fn entries(&self) -> impl Iterator<Item = &TxMemPoolEntry> {
        self.entries.values()
    }

    /// Txids ordered by descendant score, best first.
    pub fn query_hashes(&self) -> Vec<Txid> {
        self.by_descendant_score
            .iter()
            .rev()
            .map(|score| score.txid)
            .collect()
    }

    /// The pool transaction spending `outpoint`.
    pub fn spender(&self, outpoint: &OutPoint) -> Option<Txid> {
        self.next_tx.get(outpoint).copied()
    }

    pub fn parents_of(&self, txid: &Txid) -> BTreeSet<Txid> {
        self.links
            .get(txid)
            .map(|links| links.parents.clone())
            .unwrap_or_default()
    }

    pub fn children_of(&self, txid: &Txid) -> BTreeSet<Txid> {
        self.links
            .get(txid)
            .map(|links| links.children.clone())
            .unwrap_or_default()
    }

    /// True when no input of `tx` is created by a pool transaction.
    pub fn has_no_inputs_of(&self, tx: &Transaction) -> bool {
        tx.vin
            .iter()
            .all(|input| !self.exists(&input.prevout.hash))
    }

    pub fn dynamic_memory_usage(&self) -> usize {
        self.entries.len() * ENTRY_OVERHEAD
            + self.next_tx.len() * NEXT_TX_OVERHEAD
            + self.deltas.len() * (std::mem::size_of::<Txid>() + std::mem::size_of::<(f64, Amount)>())
            + self.links.len() * (std::mem::size_of::<Txid>() + std::mem::size_of::<TxLinks>())
            + self.cached_inner_usage
    }

    fn modify_entry(&mut self, txid: &Txid, update: impl FnOnce(&mut TxMemPoolEntry)) {
        let Some(entry) = self.entries.get_mut(txid) else {
            return;
        };
        self.by_descendant_score.remove(&entry.descendant_score());
        update(entry);
        self.by_descendant_score.insert(entry.descendant_score());
    }

    fn update_child(&mut self, parent: &Txid, child: &Txid, add: bool) {
        let Some(links) = self.links.get_mut(parent) else {
            return;
        };
        if add {
            if links.children.insert(*child) {
                self.cached_inner_usage += LINK_USAGE;
            }
        } else if links.children.remove(child) {
            self.cached_inner_usage = self.cached_inner_usage.saturating_sub(LINK_USAGE);
        }
    }

    fn update_parent(&mut self, child: &Txid, parent: &Txid, add: bool) {
        let Some(links) = self.links.get_mut(child) else {
            return;
        };
        if add {
            if links.parents.insert(*parent) {
                self.cached_inner_usage += LINK_USAGE;
            }
        } else if links.parents.remove(parent) {
            self.cached_inner_usage = self.cached_inner_usage.saturating_sub(LINK_USAGE);
        }
    }

    /// Adds `entry` whose in-pool ancestors are exactly `ancestors`. The
    /// caller has checked the entry against the package limits.
    pub fn add_unchecked(&mut self, mut entry: TxMemPoolEntry, ancestors: &BTreeSet<Txid>) {
        let txid = entry.txid;
        if let Some(&(_, fee_delta)) = self.deltas.get(&txid) {
            if fee_delta != 0 {
                entry.update_fee_delta(fee_delta);
            }
        }
        self.cached_inner_usage += entry.usage;
        self.total_tx_size += entry.tx_size;

        let mut parents = BTreeSet::new();
        for input in &entry.tx.vin {
            self.next_tx.insert(input.prevout.clone(), txid);
            parents.insert(input.prevout.hash);
        }
        self.by_entry_time.insert((entry.time, txid));
        self.by_descendant_score.insert(entry.descendant_score());
        self.entries.insert(txid, entry);
        self.links.insert(txid, TxLinks::default());

        for parent in parents {
            if self.entries.contains_key(&parent) {
                self.update_parent(&txid, &parent, true);
            }
        }
        self.update_ancestors_of(true, &txid, ancestors);
        self.update_entry_for_ancestors(&txid, ancestors);
        self.transactions_updated = self.transactions_updated.wrapping_add(1);
    }

    /// Links `txid` into (or out of) its parents' child sets and moves its
    /// size and fee into (or out of) every ancestor's descendant totals.
    fn update_ancestors_of(&mut self, add: bool, txid: &Txid, ancestors: &BTreeSet<Txid>) {
        for parent in self.parents_of(txid) {
            self.update_child(&parent, txid, add);
        }
        let Some(entry) = self.entries.get(txid) else {
            return;
        };
        let sign: i64 = if add { 1 } else { -1 };
        let size = sign * entry.tx_size as i64;
        let fee = sign * entry.modified_fee();
        for ancestor in ancestors {
            self.modify_entry(ancestor, |state| state.update_descendant_state(size, fee, sign));
        }
    }

    fn update_entry_for_ancestors(&mut self, txid: &Txid, ancestors: &BTreeSet<Txid>) {
        let mut size = 0i64;
        let mut fee: Amount = 0;
        let mut sig_ops = 0i64;
        for ancestor in ancestors.iter().filter_map(|id| self.entries.get(id)) {
            size += ancestor.tx_size as i64;
            fee += ancestor.modified_fee();
            sig_ops += i64::from(ancestor.sig_op_count);
        }
        if let Some(entry) = self.entries.get_mut(txid) {
            entry.update_ancestor_state(size, fee, ancestors.len() as i64, sig_ops);
        }
    }

    fn update_children_for_removal(&mut self, txid: &Txid) {
        for child in self.children_of(txid) {
            self.update_parent(&child, txid, false);
        }
    }

    /// In-pool ancestors of a transaction whose in-pool parents are
    /// `parents`, stopping at the first limit the package would break.
    fn collect_ancestors(
        &self,
        mut staged: BTreeSet<Txid>,
        tx_size: u64,
        limits: &MempoolLimits,
    ) -> Result<BTreeSet<Txid>, String> {
        let mut ancestors = BTreeSet::new();
        let mut total_size = tx_size;
        while let Some(txid) = staged.pop_first() {
            let Some(stage) = self.entries.get(&txid) else {
                continue;
            };
            ancestors.insert(txid);
            total_size = total_size.saturating_add(stage.tx_size);

            if stage.size_with_descendants.saturating_add(tx_size) > limits.descendant_size {
                return Err(format!(
                    "exceeds descendant size limit for tx {} [limit: {}]",
                    hash256_to_hex(&txid),
                    limits.descendant_size
                ));
            } else if stage.count_with_descendants.saturating_add(1) > limits.descendant_count {
                return Err(format!(
                    "too many descendants for tx {} [limit: {}]",
                    hash256_to_hex(&txid),
                    limits.descendant_count
                ));
            } else if total_size > limits.ancestor_size {
                return Err(format!(
                    "exceeds ancestor size limit [limit: {}]",
                    limits.ancestor_size
                ));
            }

            if let Some(links) = self.links.get(&txid) {
                for parent in &links.parents {
                    if !ancestors.contains(parent) {
                        staged.insert(*parent);
                    }
                    if (staged.len() + ancestors.len() + 1) as u64 > limits.ancestor_count {
                        return Err(format!(
                            "too many unconfirmed ancestors [limit: {}]",
                            limits.ancestor_count
                        ));
                    }
                }
            }
        }
        Ok(ancestors)
    }

    /// All in-pool ancestors of `entry`. With `search_for_parents` the
    /// parents are found through the inputs, so `entry` need not be in the
    /// pool yet; otherwise its recorded links are used.
    pub fn calculate_mempool_ancestors(
        &self,
        entry: &TxMemPoolEntry,
        limits: &MempoolLimits,
        search_for_parents: bool,
    ) -> Result<BTreeSet<Txid>, String> {
        let parents = if search_for_parents {
            let mut parents = BTreeSet::new();
            for input in &entry.tx.vin {
                if self.entries.contains_key(&input.prevout.hash) {
                    parents.insert(input.prevout.hash);
                    if parents.len() as u64 + 1 > limits.ancestor_count {
                        return Err(format!(
                            "too many unconfirmed parents [limit: {}]",
                            limits.ancestor_count
                        ));
                    }
                }
            }
            parents
        } else {
            self.parents_of(&entry.txid)
        };
        self.collect_ancestors(parents, entry.tx_size, limits)
    }

    fn pooled_ancestors(&self, txid: &Txid) -> BTreeSet<Txid> {
        let Some(entry) = self.entries.get(txid) else {
            return BTreeSet::new();
        };
        self.collect_ancestors(self.parents_of(txid), entry.tx_size, &MempoolLimits::unlimited())
            .unwrap_or_default()
    }

    /// Adds `txid` and every in-pool descendant of it to `descendants`.
    pub fn calculate_descendants(&self, txid: &Txid, descendants: &mut BTreeSet<Txid>) {
        let mut stack = vec![*txid];
        while let Some(current) = stack.pop() {
            if !descendants.insert(current) {
                continue;
            }
            if let Some(links) = self.links.get(&current) {
                stack.extend(
                    links
                        .children
                        .iter()
                        .filter(|child| !descendants.contains(*child)),
                );
            }
        }
    }

    /// Takes the entries of `stage` out of every other entry's totals and
    /// links. With `update_descendants` the descendants left behind lose
    /// the removed entries from their ancestor totals.
    fn update_for_remove_from_mempool(&mut self, stage: &BTreeSet<Txid>, update_descendants: bool) {
        if update_descendants {
            for txid in stage {
                let Some(entry) = self.entries.get(txid) else {
                    continue;
                };
                let size = entry.tx_size as i64;
                let fee = entry.modified_fee();
                let sig_ops = i64::from(entry.sig_op_count);
                let mut descendants = BTreeSet::new();
                self.calculate_descendants(txid, &mut descendants);
                for descendant in descendants.iter().filter(|id| !stage.contains(*id)) {
                    if let Some(state) = self.entries.get_mut(descendant) {
                        state.update_ancestor_state(-size, -fee, -1, -sig_ops);
                    }
                }
            }
        }
        for txid in stage {
            let ancestors = self.pooled_ancestors(txid);
            self.update_ancestors_of(false, txid, &ancestors);
        }
        for txid in stage {
            self.update_children_for_removal(txid);
        }
    }

    fn remove_unchecked(&mut self, txid: &Txid) -> Option<TxMemPoolEntry> {
        let entry = self.entries.remove(txid)?;
        for input in &entry.tx.vin {
            self.next_tx.remove(&input.prevout);
        }
        self.by_descendant_score.remove(&entry.descendant_score());
        self.by_entry_time.remove(&(entry.time, *txid));
        if let Some(links) = self.links.remove(txid) {
            let linked = links.parents.len() + links.children.len();
            self.cached_inner_usage = self.cached_inner_usage.saturating_sub(linked * LINK_USAGE);
        }
        self.cached_inner_usage = self.cached_inner_usage.saturating_sub(entry.usage);
        self.total_tx_size = self.total_tx_size.saturating_sub(entry.tx_size);
        self.transactions_updated = self.transactions_updated.wrapping_add(1);
        Some(entry)
    }

    /// Removes every entry of `stage`. Without `update_descendants` the
    /// stage must already contain all descendants of its members.
    pub fn remove_staged(
        &mut self,
        stage: &BTreeSet<Txid>,
        update_descendants: bool,
    ) -> Vec<TxMemPoolEntry> {
        self.update_for_remove_from_mempool(stage, update_descendants);
        stage
            .iter()
            .filter_map(|txid| self.remove_unchecked(txid))
            .collect()
    }

    /// Removes `tx` and everything that spends it. When `tx` itself is not
    /// in the pool its in-pool spenders and their descendants still go.
    pub fn remove_recursive(&mut self, tx: &Transaction) -> Vec<Transaction> {
        let txid = tx.txid();
        let mut roots = Vec::new();
        if self.entries.contains_key(&txid) {
            roots.push(txid);
        } else {
            for index in 0..tx.vout.len() as u32 {
                if let Some(spender) = self.spender(&OutPoint::new(txid, index)) {
                    roots.push(spender);
                }
            }
        }
        let mut stage = BTreeSet::new();
        for root in &roots {
            self.calculate_descendants(root, &mut stage);
        }
        self.remove_staged(&stage, false)
            .into_iter()
            .map(|entry| entry.tx)
            .collect()
    }

    /// Removes pool transactions that spend an input of `tx`, with their
    /// descendants.
    pub fn remove_conflicts(&mut self, tx: &Transaction) -> Vec<Transaction> {
        let txid = tx.txid();
        let mut removed = Vec::new();
        for input in &tx.vin {
            let Some(conflict) = self.spender(&input.prevout) else {
                continue;
            };
            if conflict == txid {
                continue;
            }
            if let Some(conflict_tx) = self.lookup(&conflict).cloned() {
                removed.extend(self.remove_recursive(&conflict_tx));
                self.clear_prioritisation(&conflict);
            }
        }
        removed
    }

    /// Drops the transactions of a newly connected block at `height` and
    /// returns the pool transactions that conflicted with them.
    pub fn remove_for_block(&mut self, txs: &[Transaction], height: i32, now: i64) -> Vec<Transaction> {
        let mut mined = 0usize;
        let mut conflicts = Vec::new();
        for tx in txs {
            let txid = tx.txid();
            if self.entries.contains_key(&txid) {
                self.remove_staged(&BTreeSet::from([txid]), true);
                mined += 1;
            }
            conflicts.extend(self.remove_conflicts(tx));
            self.clear_prioritisation(&txid);
        }
        self.last_rolling_fee_update = now;
        self.block_since_last_rolling_fee_bump = true;
        log_cat!(
            Category::Mempool,
            "block {height}: {mined} pool txs mined, {} conflicts removed",
            conflicts.len()
        );
        conflicts
    }

    /// After a reorganisation, drops entries that are no longer final,
    /// whose relative locks fail, or that spend a coinbase which is missing
    /// or immature at `mempool_height`. Cached lock points are refreshed.
    pub fn remove_for_reorg(
        &mut self,
        chain: &ChainView<'_>,
        coins_tip: &dyn CoinsView,
        mempool_height: i32,
        flags: u32,
    ) -> Result<Vec<Transaction>, StoreError> {
        let mut to_remove = Vec::new();
        let mut refreshed = Vec::new();
        {
            let view = CoinsViewMemPool::new(coins_tip, self);
            for entry in self.entries.values() {
                let mut lock_points = entry.lock_points;
                let valid_lock_points = chain.test_lock_point_validity(&lock_points);
                if !chain.check_final_tx(&entry.tx, flags)
                    || !chain.check_sequence_locks(
                        &entry.tx,
                        flags,
                        &view,
                        Some(&mut lock_points),
                        valid_lock_points,
                    )?
                {
                    to_remove.push(entry.tx.clone());
                } else if entry.spends_coinbase {
                    for input in &entry.tx.vin {
                        if self.entries.contains_key(&input.prevout.hash) {
                            continue;
                        }
                        let immature = match coins_tip.coins(&input.prevout.hash)? {
                            Some(coins) => {
                                coins.is_coinbase && mempool_height - coins.height < COINBASE_MATURITY
                            }
                            None => true,
                        };
                        if immature {
                            to_remove.push(entry.tx.clone());
                            break;
                        }
                    }
                }
                if !valid_lock_points {
                    refreshed.push((entry.txid, lock_points));
                }
            }
        }
        for (txid, lock_points) in refreshed {
            if let Some(entry) = self.entries.get_mut(&txid) {
                entry.lock_points = lock_points;
            }
        }
        let mut removed = Vec::new();
        for tx in &to_remove {
            removed.extend(self.remove_recursive(tx));
        }
        Ok(removed)
    }

    /// Re-links transactions returned to the pool by a disconnected block
    /// with the pool children that were already spending them. `txids` are
    /// in the order they were re-added.
    pub fn update_transactions_from_block(&mut self, txids: &[Txid]) {
        let already_included: BTreeSet<Txid> = txids.iter().copied().collect();
        for txid in txids.iter().rev() {
            if !self.entries.contains_key(txid) {
                continue;
            }
            let children: Vec<Txid> = self
                .next_tx
                .range(OutPoint::new(*txid, 0)..=OutPoint::new(*txid, u32::MAX))
                .map(|(_, spender)| *spender)
                .collect();
            for child in children {
                if already_included.contains(&child) {
                    continue;
                }
                self.update_child(txid, &child, true);
                self.update_parent(&child, txid, true);
            }
            self.update_for_descendants(txid, &already_included);
        }
    }

    /// Adds the descendants of `txid` that are not in `exclude` to its
    /// descendant totals, and `txid` to their ancestor totals.
    fn update_for_descendants(&mut self, txid: &Txid, exclude: &BTreeSet<Txid>) {
        let Some(entry) = self.entries.get(txid) else {
            return;
        };
        let size = entry.tx_size as i64;
        let fee = entry.modified_fee();
        let sig_ops = i64::from(entry.sig_op_count);

        let mut descendants = BTreeSet::new();
        self.calculate_descendants(txid, &mut descendants);
        descendants.remove(txid);

        let mut modify_size = 0i64;
        let mut modify_fee: Amount = 0;
        let mut modify_count = 0i64;
        for descendant in descendants.iter().filter(|id| !exclude.contains(*id)) {
            if let Some(state) = self.entries.get_mut(descendant) {
                modify_size += state.tx_size as i64;
                modify_fee += state.modified_fee();
                modify_count += 1;
                state.update_ancestor_state(size, fee, 1, sig_ops);
            }
        }
        self.modify_entry(txid, |state| {
            state.update_descendant_state(modify_size, modify_fee, modify_count)
        });
    }

    /// Removes entries that entered before `time`, with their descendants.
    pub fn expire(&mut self, time: i64) -> usize {
        let expired: Vec<Txid> = self
            .by_entry_time
            .iter()
            .take_while(|(entry_time, _)| *entry_time < time)
            .map(|(_, txid)| *txid)
            .collect();
        let mut stage = BTreeSet::new();
        for txid in &expired {
            self.calculate_descendants(txid, &mut stage);
        }
        self.remove_staged(&stage, false);
        stage.len()
    }

    fn track_package_removed(&mut self, rate: FeeRate) {
        if rate.per_k() as f64 > self.rolling_minimum_fee_rate {
            self.rolling_minimum_fee_rate = rate.per_k() as f64;
            self.block_since_last_rolling_fee_bump = false;
        }
    }

    /// Evicts the lowest-scoring packages until the pool fits in `limit`
    /// bytes. Returns the txids whose coins no remaining entry spends, so
    /// the caller can drop them from its coin cache.
    pub fn trim_to_size(&mut self, limit: usize) -> Vec<Txid> {
        let mut no_spends_remaining = Vec::new();
        let mut removed_count = 0usize;
        let mut max_rate_removed = FeeRate::default();
        while self.dynamic_memory_usage() > limit {
            let Some(worst) = self.by_descendant_score.first().map(|score| score.txid) else {
                break;
            };
            let Some(entry) = self.entries.get(&worst) else {
                break;
            };
            let package_rate =
                FeeRate::from_fee(entry.mod_fees_with_descendants, entry.size_with_descendants as usize);
            let removed_rate = FeeRate::new(package_rate.per_k() + self.min_relay_fee.per_k());
            self.track_package_removed(removed_rate);
            max_rate_removed = max_rate_removed.max(removed_rate);

            let mut stage = BTreeSet::new();
            self.calculate_descendants(&worst, &mut stage);
            removed_count += stage.len();
            let removed = self.remove_staged(&stage, false);
            for entry in &removed {
                for input in &entry.tx.vin {
                    let hash = input.prevout.hash;
                    if self.exists(&hash) {
                        continue;
                    }
                    let still_spent = self
                        .next_tx
                        .range(OutPoint::new(hash, 0)..=OutPoint::new(hash, u32::MAX))
                        .next()
                        .is_some();
                    if !still_spent {
                        no_spends_remaining.push(hash);
                    }
                }
            }
        }
        if max_rate_removed > FeeRate::default() {
            log_cat!(
                Category::Mempool,
                "removed {removed_count} txn, rolling minimum fee bumped to {max_rate_removed}"
            );
        }
        no_spends_remaining
    }

    /// Minimum fee rate for entry into a pool capped at `size_limit` bytes.
    /// Raised by evictions, it decays with a half-life of twelve hours once
    /// a block has arrived, faster while the pool is well below its cap.
    pub fn get_min_fee(&mut self, size_limit: usize, now: i64) -> FeeRate {
        if !self.block_since_last_rolling_fee_bump || self.rolling_minimum_fee_rate == 0.0 {
            return FeeRate::new(self.rolling_minimum_fee_rate as Amount);
        }
        if now > self.last_rolling_fee_update + 10 {
            let usage = self.dynamic_memory_usage();
            let mut halflife = ROLLING_FEE_HALFLIFE as f64;
            if usage < size_limit / 4 {
                halflife /= 4.0;
            } else if usage < size_limit / 2 {
                halflife /= 2.0;
            }
            let elapsed = (now - self.last_rolling_fee_update) as f64;
            self.rolling_minimum_fee_rate /= 2f64.powf(elapsed / halflife);
            self.last_rolling_fee_update = now;
            if self.rolling_minimum_fee_rate < self.min_relay_fee.per_k() as f64 / 2.0 {
                self.rolling_minimum_fee_rate = 0.0;
                return FeeRate::default();
            }
        }
        FeeRate::new(self.rolling_minimum_fee_rate as Amount).max(self.min_relay_fee)
    }

    /// Adjusts the priority and fee mining and eviction see for `txid`. The
    /// deltas persist until the transaction is mined or conflicted.
    pub fn prioritise_transaction(&mut self, txid: &Txid, priority_delta: f64, fee_delta: Amount) {
        let deltas = self.deltas.entry(*txid).or_insert((0.0, 0));
        deltas.0 += priority_delta;
        deltas.1 += fee_delta;
        let total_fee_delta = deltas.1;

        if self.entries.contains_key(txid) {
            self.modify_entry(txid, |entry| entry.update_fee_delta(total_fee_delta));
            for ancestor in self.pooled_ancestors(txid) {
                self.modify_entry(&ancestor, |entry| entry.update_descendant_state(0, fee_delta, 0));
            }
            let mut descendants = BTreeSet::new();
            self.calculate_descendants(txid, &mut descendants);
            descendants.remove(txid);
            for descendant in descendants {
                if let Some(entry) = self.entries.get_mut(&descendant) {
                    entry.update_ancestor_state(0, fee_delta, 0, 0);
                }
            }
        }
        log_info!(
            "prioritise_transaction: {} priority += {priority_delta}, fee += {fee_delta}",
            hash256_to_hex(txid)
        );
    }

    pub fn apply_deltas(&self, txid: &Txid, priority: &mut f64, fee: &mut Amount) {
        if let Some(&(priority_delta, fee_delta)) = self.deltas.get(txid) {
            *priority += priority_delta;
            *fee += fee_delta;
        }
    }

    pub fn clear_prioritisation(&mut self, txid: &Txid) {
        self.deltas.remove(txid);
    }

    /// Consistency sweep over links, spender index, package totals and
    /// inputs. `coins_tip` supplies confirmed inputs; coinbase maturity is
    /// judged at `spend_height`. Returns one line per violation.
    pub fn check(&self, coins_tip: &dyn CoinsView, spend_height: i32) -> Result<Vec<String>, StoreError> {
        log_cat!(
            Category::Mempool,
            "checking mempool with {} transactions and {} inputs",
            self.entries.len(),
            self.next_tx.len()
        );
        let mut problems = Vec::new();
        let mut check_total = 0u64;
        let mut inner_usage = 0usize;
        let mut duplicate = CoinsViewCache::owned(Box::new(ReadOnlyView(coins_tip)));
        let verifier = Interpreter::new();
        let mut waiting = std::collections::VecDeque::new();

        let mut ordered: Vec<&TxMemPoolEntry> = self.entries.values().collect();
        ordered.sort_by_key(|entry| entry.txid);
        for entry in ordered {
            let txid = entry.txid;
            let name = hash256_to_hex(&txid);
            check_total += entry.tx_size;
            inner_usage += entry.usage;
            let links = self.links.get(&txid).cloned().unwrap_or_default();
            inner_usage += (links.parents.len() + links.children.len()) * LINK_USAGE;

            let mut depends_wait = false;
            let mut parents = BTreeSet::new();
            for (index, input) in entry.tx.vin.iter().enumerate() {
                let prevout = &input.prevout;
                if let Some(parent) = self.lookup(&prevout.hash) {
                    if parent.vout.len() <= prevout.index as usize {
                        problems.push(format!("{name} spends missing output {prevout}"));
                    }
                    depends_wait = true;
                    parents.insert(prevout.hash);
                } else {
                    let available = coins_tip
                        .coins(&prevout.hash)?
                        .is_some_and(|coins| coins.is_available(prevout.index));
                    if !available {
                        problems.push(format!("{name} spends unavailable {prevout}"));
                    }
                }
                if self.next_tx.get(prevout) != Some(&txid) {
                    problems.push(format!("{name} input {index} missing from the spender index"));
                }
            }
            if parents != links.parents {
                problems.push(format!("{name} parent links disagree with its inputs"));
            }

            let children: BTreeSet<Txid> = self
                .next_tx
                .range(OutPoint::new(txid, 0)..=OutPoint::new(txid, u32::MAX))
                .map(|(_, spender)| *spender)
                .collect();
            if children != links.children {
                problems.push(format!("{name} child links disagree with the spender index"));
            }

            let mut descendants = BTreeSet::new();
            self.calculate_descendants(&txid, &mut descendants);
            let (count, size, fees) = self.package_totals(&descendants);
            if (count, size, fees)
                != (
                    entry.count_with_descendants,
                    entry.size_with_descendants,
                    entry.mod_fees_with_descendants,
                )
            {
                problems.push(format!("{name} descendant totals are stale"));
            }
            let mut ancestors = self.pooled_ancestors(&txid);
            ancestors.insert(txid);
            let (count, size, fees) = self.package_totals(&ancestors);
            let sig_ops: u64 = ancestors
                .iter()
                .filter_map(|id| self.entries.get(id))
                .map(|ancestor| u64::from(ancestor.sig_op_count))
                .sum();
            if (count, size, fees, sig_ops)
                != (
                    entry.count_with_ancestors,
                    entry.size_with_ancestors,
                    entry.mod_fees_with_ancestors,
                    entry.sig_ops_with_ancestors,
                )
            {
                problems.push(format!("{name} ancestor totals are stale"));
            }

            if depends_wait {
                waiting.push_back(entry);
            } else {
                check_spend(entry, &mut duplicate, spend_height, &verifier, &mut problems)?;
            }
        }

        let mut steps_since_last_remove = 0usize;
        while let Some(entry) = waiting.pop_front() {
            if !duplicate.have_inputs(&entry.tx)? {
                steps_since_last_remove += 1;
                if steps_since_last_remove > waiting.len() {
                    problems.push(format!(
                        "{} waits on inputs no pool transaction provides",
                        hash256_to_hex(&entry.txid)
                    ));
                    break;
                }
                waiting.push_back(entry);
            } else {
                check_spend(entry, &mut duplicate, spend_height, &verifier, &mut problems)?;
                steps_since_last_remove = 0;
            }
        }

        for (prevout, spender) in &self.next_tx {
            let spends = self
                .lookup(spender)
                .is_some_and(|tx| tx.vin.iter().any(|input| &input.prevout == prevout));
            if !spends {
                problems.push(format!("spender index entry {prevout} is stale"));
            }
        }
        if check_total != self.total_tx_size {
            problems.push(format!(
                "total size {} differs from the sum {check_total}",
                self.total_tx_size
            ));
        }
        if inner_usage != self.cached_inner_usage {
            problems.push(format!(
                "cached usage {} differs from the sum {inner_usage}",
                self.cached_inner_usage
            ));
        }
        Ok(problems)
    }

    fn package_totals(&self, members: &BTreeSet<Txid>) -> (u64, u64, Amount) {
        members
            .iter()
            .filter_map(|id| self.entries.get(id))
            .fold((0, 0, 0), |(count, size, fees), entry| {
                (count + 1, size + entry.tx_size, fees + entry.modified_fee())
            })
    }
}

fn check_spend(
    entry: &TxMemPoolEntry,
    view: &mut CoinsViewCache<'_>,
    spend_height: i32,
    verifier: &Interpreter,
    problems: &mut Vec<String>,
) -> Result<(), StoreError> {
    if let Err(state) = check_inputs(&entry.tx, view, spend_height, false, 0, false, verifier, None)? {
        problems.push(format!(
            "{} fails input checks: {state}",
            hash256_to_hex(&entry.txid)
        ));
        return Ok(());
    }
    if let Err(err) = update_coins(&entry.tx, view, None, 1_000_000) {
        problems.push(format!("{} cannot be applied: {err}", hash256_to_hex(&entry.txid)));
    }
    Ok(())
}

/// Coins of the chain tip overlaid with the outputs of pool transactions,
/// which appear at [`MEMPOOL_HEIGHT`].
pub struct CoinsViewMemPool<'a> {
    base: &'a dyn CoinsView,
    pool: &'a Mempool,
}

impl<'a> CoinsViewMemPool<'a> {
    pub fn new(base: &'a dyn CoinsView, pool: &'a Mempool) -> Self {
        Self { base, pool }
    }
}

impl CoinsView for CoinsViewMemPool<'_> {
    fn coins(&self, txid: &Hash256) -> Result<Option<Coins>, StoreError> {
        if let Some(tx) = self.pool.lookup(txid) {
            return Ok(Some(Coins::from_tx(tx, MEMPOOL_HEIGHT)));
        }
        Ok(self.base.coins(txid)?.filter(|coins| !coins.is_pruned()))
    }

    fn have_coins(&self, txid: &Hash256) -> Result<bool, StoreError> {
        Ok(self.pool.exists(txid) || self.base.have_coins(txid)?)
    }

    fn best_block(&self) -> Result<Hash256, StoreError> {
        self.base.best_block()
    }

    fn batch_write(&mut self, _changes: CoinsMap, _best_block: Hash256) -> Result<(), StoreError> {
        Err(StoreError::Backend("the mempool coin view is read-only".to_string()))
    }
}

struct ReadOnlyView<'a>(&'a dyn CoinsView);

impl CoinsView for ReadOnlyView<'_> {
    fn coins(&self, txid: &Hash256) -> Result<Option<Coins>, StoreError> {
        self.0.coins(txid)
    }

    fn best_block(&self) -> Result<Hash256, StoreError> {
        self.0.best_block()
    }

    fn batch_write(&mut self, _changes: CoinsMap, _best_block: Hash256) -> Result<(), StoreError> {
        Err(StoreError::Backend("snapshot view is read-only".to_string()))
    }
}
