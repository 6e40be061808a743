//! Transaction admission into the [`Mempool`].

use std::collections::{BTreeSet, HashMap};

use coind_chainstate::coins::{CoinsViewCache, MEMPOOL_HEIGHT};
use coind_chainstate::events::ChainEvent;
use coind_chainstate::state::ChainState;
use coind_chainstate::validation::{
    check_inputs, check_transaction, legacy_sigop_count, p2sh_sigop_count, LockPoints,
    ValidationResult, ValidationState, REJECT_ALREADY_KNOWN, REJECT_CONFLICT, REJECT_DUPLICATE,
    REJECT_HIGHFEE, REJECT_INSUFFICIENTFEE, REJECT_INVALID, REJECT_NONSTANDARD,
};
use coind_chainstate::versionbits::ThresholdState;
use coind_consensus::constants::STANDARD_LOCKTIME_VERIFY_FLAGS;
use coind_consensus::money::{Amount, FeeRate, COIN};
use coind_consensus::{hash256_to_hex, DeploymentPos};
use coind_log::{log_cat, log_error, Category};
use coind_primitives::transaction::Transaction;
use coind_script::standard::{are_inputs_standard, is_standard_tx, StandardPolicy, MAX_STANDARD_TX_SIGOPS};
use coind_script::{MANDATORY_SCRIPT_VERIFY_FLAGS, STANDARD_SCRIPT_VERIFY_FLAGS};
use coind_storage::{KeyValueStore, StoreError};

use crate::mempool::{
    CoinsViewMemPool, Mempool, MempoolLimits, TxMemPoolEntry, Txid, DEFAULT_MAX_MEMPOOL_SIZE_MB,
    DEFAULT_MEMPOOL_EXPIRY_HOURS,
};

pub const DEFAULT_MIN_RELAY_TX_FEE: Amount = 1000;
/// Thousand-bytes-per-minute of free transactions relayed.
pub const DEFAULT_LIMIT_FREE_RELAY: u64 = 15;
pub const DEFAULT_RELAY_PRIORITY: bool = true;
pub const DEFAULT_ENABLE_REPLACEMENT: bool = true;
pub const DEFAULT_BYTES_PER_SIGOP: u64 = 20;
/// Conflicting entries (with descendants) one replacement may evict.
pub const MAX_REPLACEMENT_CANDIDATES: u64 = 100;

/// Relay policy, fixed at startup.
#[derive(Clone, Debug)]
pub struct MempoolPolicy {
    pub max_mempool_bytes: usize,
    pub expiry_secs: i64,
    pub limits: MempoolLimits,
    pub min_relay_fee: FeeRate,
    pub limit_free_relay: u64,
    pub relay_priority: bool,
    pub enable_replacement: bool,
    pub require_standard: bool,
    pub bytes_per_sigop: u64,
    pub permit_bare_multisig: bool,
    pub accept_datacarrier: bool,
}

impl Default for MempoolPolicy {
    fn default() -> Self {
        Self {
            max_mempool_bytes: DEFAULT_MAX_MEMPOOL_SIZE_MB * 1_000_000,
            expiry_secs: DEFAULT_MEMPOOL_EXPIRY_HOURS * 60 * 60,
            limits: MempoolLimits::default(),
            min_relay_fee: FeeRate::new(DEFAULT_MIN_RELAY_TX_FEE),
            limit_free_relay: DEFAULT_LIMIT_FREE_RELAY,
            relay_priority: DEFAULT_RELAY_PRIORITY,
            enable_replacement: DEFAULT_ENABLE_REPLACEMENT,
            require_standard: true,
            bytes_per_sigop: DEFAULT_BYTES_PER_SIGOP,
            permit_bare_multisig: true,
            accept_datacarrier: true,
        }
    }
}

impl MempoolPolicy {
    fn standard_policy(&self) -> StandardPolicy {
        StandardPolicy {
            min_relay_fee: self.min_relay_fee,
            permit_bare_multisig: self.permit_bare_multisig,
            accept_datacarrier: self.accept_datacarrier,
            ..StandardPolicy::default()
        }
    }
}

/// Per-call switches.
#[derive(Clone, Copy, Debug)]
pub struct AcceptOptions {
    /// Apply the free-transaction rate limit.
    pub limit_free: bool,
    /// Skip the size trim after adding. Used when re-adding transactions
    /// from disconnected blocks.
    pub override_mempool_limit: bool,
    pub reject_absurd_fee: bool,
}

impl AcceptOptions {
    /// Transactions arriving from peers.
    pub const RELAY: Self = Self {
        limit_free: true,
        override_mempool_limit: false,
        reject_absurd_fee: false,
    };

    /// Transactions returned to the pool by a disconnected block.
    pub const REORG: Self = Self {
        limit_free: false,
        override_mempool_limit: true,
        reject_absurd_fee: false,
    };
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct AcceptOutcome {
    pub accepted: bool,
    /// An input is unknown; the caller may keep the transaction as an orphan.
    pub missing_inputs: bool,
    /// Entries evicted by the replacement.
    pub replaced: Vec<Txid>,
}

/// Exponentially decaying count of free bytes relayed over a ten minute
/// window.
#[derive(Clone, Debug, Default)]
pub struct FreeRelayLimiter {
    count: f64,
    last_time: i64,
}

impl FreeRelayLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `size` bytes unless the window already holds `limit_kb_per_min`
    /// worth of free traffic.
    pub fn admit(&mut self, size: u64, now: i64, limit_kb_per_min: u64) -> bool {
        self.count *= (1.0 - 1.0 / 600.0f64).powf((now - self.last_time) as f64);
        self.last_time = now;
        if self.count >= (limit_kb_per_min * 10 * 1000) as f64 {
            return false;
        }
        log_cat!(
            Category::Mempool,
            "rate limit free count: {} => {}",
            self.count,
            self.count + size as f64
        );
        self.count += size as f64;
        true
    }
}

fn allow_free(priority: f64) -> bool {
    priority > (COIN * 144 / 250) as f64
}

/// Expires old entries, then trims the pool to its size cap and releases
/// coins nothing in the pool spends any more.
pub fn limit_mempool_size(
    pool: &mut Mempool,
    coins_tip: &mut CoinsViewCache<'_>,
    limit: usize,
    age_secs: i64,
    now: i64,
) {
    let expired = pool.expire(now - age_secs);
    if expired != 0 {
        log_cat!(
            Category::Mempool,
            "expired {expired} transactions from the memory pool"
        );
    }
    for txid in pool.trim_to_size(limit) {
        coins_tip.uncache(&txid);
    }
}

/// Runs the admission pipeline for `tx`. Policy and consensus failures come
/// back as `Ok(Err(state))`; only store failures are errors.
pub fn accept_to_memory_pool<S: KeyValueStore + 'static>(
    chain: &mut ChainState<S>,
    pool: &mut Mempool,
    limiter: &mut FreeRelayLimiter,
    policy: &MempoolPolicy,
    tx: &Transaction,
    options: AcceptOptions,
) -> Result<ValidationResult<AcceptOutcome>, StoreError> {
    let txid = tx.txid();
    if let Err(state) = check_transaction(tx) {
        return Ok(Err(state));
    }
    if tx.is_coinbase() {
        return Ok(Err(ValidationState::dos(100, REJECT_INVALID, "coinbase")));
    }
    if policy.require_standard {
        if let Err(reason) = is_standard_tx(tx, &policy.standard_policy()) {
            return Ok(Err(ValidationState::invalid(REJECT_NONSTANDARD, reason)));
        }
    }
    if policy.require_standard
        && tx.version >= 2
        && chain.deployment_state(DeploymentPos::Csv) != ThresholdState::Active
    {
        return Ok(Err(ValidationState::invalid(
            REJECT_NONSTANDARD,
            "premature-version2-tx",
        )));
    }
    if !chain.check_final_tx(tx, STANDARD_LOCKTIME_VERIFY_FLAGS) {
        return Ok(Err(ValidationState::invalid(REJECT_NONSTANDARD, "non-final")));
    }
    if pool.exists(&txid) {
        return Ok(Err(ValidationState::invalid(
            REJECT_ALREADY_KNOWN,
            "txn-already-in-mempool",
        )));
    }

    let mut conflicts = BTreeSet::new();
    for input in &tx.vin {
        let Some(conflicting) = pool.spender(&input.prevout) else {
            continue;
        };
        if conflicts.contains(&conflicting) {
            continue;
        }
        let opted_in = policy.enable_replacement
            && pool.lookup(&conflicting).is_some_and(|existing| {
                existing
                    .vin
                    .iter()
                    .any(|input| input.sequence < u32::MAX - 1)
            });
        if !opted_in {
            return Ok(Err(ValidationState::invalid(
                REJECT_CONFLICT,
                "txn-mempool-conflict",
            )));
        }
        conflicts.insert(conflicting);
    }

    let now = chain.clock().now();
    let mempool_reject_rate = pool.get_min_fee(policy.max_mempool_bytes, now);
    let verifier = chain.verifier();
    let (view, coins_tip) = chain.mempool_context();
    let chain_height = view.height();

    let (entry, ancestors, replaced) = {
        let mut cache = CoinsViewCache::owned(Box::new(CoinsViewMemPool::new(&*coins_tip, pool)));
        if cache.have_coins(&txid)? {
            return Ok(Err(ValidationState::invalid(
                REJECT_ALREADY_KNOWN,
                "txn-already-known",
            )));
        }
        for input in &tx.vin {
            if !cache.have_coins(&input.prevout.hash)? {
                return Ok(Ok(AcceptOutcome {
                    missing_inputs: true,
                    ..AcceptOutcome::default()
                }));
            }
        }
        if !cache.have_inputs(tx)? {
            return Ok(Err(ValidationState::invalid(
                REJECT_DUPLICATE,
                "bad-txns-inputs-spent",
            )));
        }
        cache.best_block()?;
        let value_in = cache.value_in(tx)?;

        let mut lock_points = LockPoints::default();
        if !view.check_sequence_locks(
            tx,
            STANDARD_LOCKTIME_VERIFY_FLAGS,
            &cache,
            Some(&mut lock_points),
            false,
        )? {
            return Ok(Err(ValidationState::invalid(
                REJECT_NONSTANDARD,
                "non-BIP68-final",
            )));
        }

        if policy.require_standard {
            let mut prev_scripts = HashMap::with_capacity(tx.vin.len());
            for input in &tx.vin {
                if let Some(output) = cache.output_for(input)? {
                    prev_scripts.insert(input.prevout.clone(), output.script_pubkey.clone());
                }
            }
            if !are_inputs_standard(tx, |prevout| prev_scripts.get(prevout).cloned()) {
                return Ok(Err(ValidationState::invalid(
                    REJECT_NONSTANDARD,
                    "bad-txns-nonstandard-inputs",
                )));
            }
        }

        let sig_ops = legacy_sigop_count(tx) + p2sh_sigop_count(tx, &mut cache)?;
        let fees = value_in - tx.value_out().unwrap_or(0);
        let mut modified_fees = fees;
        let mut priority_dummy = 0.0;
        pool.apply_deltas(&txid, &mut priority_dummy, &mut modified_fees);

        let mut in_chain_value: Amount = 0;
        let mut spends_coinbase = false;
        for input in &tx.vin {
            if let Some(coins) = cache.access_coins(&input.prevout.hash)? {
                spends_coinbase |= coins.is_coinbase;
                if coins.height != MEMPOOL_HEIGHT && coins.height <= chain_height {
                    if let Some(output) = coins.output(input.prevout.index) {
                        in_chain_value += output.value;
                    }
                }
            }
        }
        let priority = cache.priority(tx, chain_height)?;

        let entry = TxMemPoolEntry::new(
            tx.clone(),
            fees,
            now,
            priority,
            chain_height,
            pool.has_no_inputs_of(tx),
            in_chain_value,
            spends_coinbase,
            sig_ops,
            lock_points,
        );
        let size = entry.tx_size();

        if sig_ops > MAX_STANDARD_TX_SIGOPS
            || (policy.bytes_per_sigop != 0 && u64::from(sig_ops) > size / policy.bytes_per_sigop)
        {
            return Ok(Err(ValidationState::invalid(
                REJECT_NONSTANDARD,
                "bad-txns-too-many-sigops",
            )
            .with_debug(sig_ops.to_string())));
        }

        let mempool_reject_fee = mempool_reject_rate.fee(size as usize);
        let min_relay_fee = policy.min_relay_fee.fee(size as usize);
        if mempool_reject_fee > 0 && modified_fees < mempool_reject_fee {
            return Ok(Err(ValidationState::invalid(
                REJECT_INSUFFICIENTFEE,
                "mempool min fee not met",
            )
            .with_debug(format!("{fees} < {mempool_reject_fee}"))));
        } else if policy.relay_priority
            && modified_fees < min_relay_fee
            && !allow_free(entry.priority(chain_height + 1))
        {
            return Ok(Err(ValidationState::invalid(
                REJECT_INSUFFICIENTFEE,
                "insufficient priority",
            )));
        }

        if options.limit_free
            && modified_fees < min_relay_fee
            && !limiter.admit(size, now, policy.limit_free_relay)
        {
            return Ok(Err(ValidationState::invalid(
                REJECT_INSUFFICIENTFEE,
                "rate limited free transaction",
            )));
        }

        if options.reject_absurd_fee && fees > min_relay_fee * 10_000 {
            return Ok(Err(ValidationState::invalid(REJECT_HIGHFEE, "absurdly-high-fee")
                .with_debug(format!("{fees} > {}", min_relay_fee * 10_000))));
        }

        let ancestors = match pool.calculate_mempool_ancestors(&entry, &policy.limits, true) {
            Ok(ancestors) => ancestors,
            Err(message) => {
                return Ok(Err(ValidationState::invalid(
                    REJECT_NONSTANDARD,
                    "too-long-mempool-chain",
                )
                .with_debug(message)));
            }
        };
        if let Some(ancestor) = ancestors.iter().find(|id| conflicts.contains(*id)) {
            log_error!(
                "accept_to_memory_pool: {} spends conflicting transaction {}",
                hash256_to_hex(&txid),
                hash256_to_hex(ancestor)
            );
            return Ok(Err(ValidationState::dos(
                10,
                REJECT_INVALID,
                "bad-txns-spends-conflicting-tx",
            )));
        }

        let mut all_conflicting = BTreeSet::new();
        if !conflicts.is_empty() {
            if let Err(state) =
                check_replacement(pool, tx, &txid, modified_fees, size, &conflicts, policy, &mut all_conflicting)
            {
                return Ok(Err(state));
            }
        }

        if let Err(state) = check_inputs(
            tx,
            &mut cache,
            chain_height + 1,
            true,
            STANDARD_SCRIPT_VERIFY_FLAGS,
            true,
            verifier.as_ref(),
            None,
        )? {
            return Ok(Err(state));
        }
        if let Err(state) = check_inputs(
            tx,
            &mut cache,
            chain_height + 1,
            true,
            MANDATORY_SCRIPT_VERIFY_FLAGS,
            true,
            verifier.as_ref(),
            None,
        )? {
            log_error!(
                "accept_to_memory_pool: BUG! inputs of {} fail the mandatory but not the standard flags: {state}",
                hash256_to_hex(&txid)
            );
            return Ok(Err(ValidationState::error("mandatory-script-verify-flag-failed")));
        }
        (entry, ancestors, all_conflicting)
    };

    let replaced_fees = replaced
        .iter()
        .filter_map(|id| pool.get(id))
        .map(TxMemPoolEntry::modified_fee)
        .sum::<Amount>();
    for id in &replaced {
        log_cat!(
            Category::Mempool,
            "replacing tx {} with {} for {} additional fees",
            hash256_to_hex(id),
            hash256_to_hex(&txid),
            entry.modified_fee() - replaced_fees
        );
    }
    pool.remove_staged(&replaced, false);
    pool.add_unchecked(entry, &ancestors);

    if !options.override_mempool_limit {
        limit_mempool_size(pool, coins_tip, policy.max_mempool_bytes, policy.expiry_secs, now);
        if !pool.exists(&txid) {
            return Ok(Err(ValidationState::invalid(
                REJECT_INSUFFICIENTFEE,
                "mempool full",
            )));
        }
    }

    chain.events_mut().publish(ChainEvent::TxAccepted { txid });
    Ok(Ok(AcceptOutcome {
        accepted: true,
        missing_inputs: false,
        replaced: replaced.into_iter().collect(),
    }))
}

/// Economic rules for replacing `conflicts`. On success `all_conflicting`
/// holds every entry the replacement evicts.
#[allow(clippy::too_many_arguments)]
fn check_replacement(
    pool: &Mempool,
    tx: &Transaction,
    txid: &Txid,
    modified_fees: Amount,
    size: u64,
    conflicts: &BTreeSet<Txid>,
    policy: &MempoolPolicy,
    all_conflicting: &mut BTreeSet<Txid>,
) -> ValidationResult {
    let new_rate = FeeRate::from_fee(modified_fees, size as usize);
    let mut conflict_parents = BTreeSet::new();
    let mut conflicting_count = 0u64;
    for conflict in conflicts {
        let Some(existing) = pool.get(conflict) else {
            continue;
        };
        let old_rate = FeeRate::from_fee(existing.modified_fee(), existing.tx_size() as usize);
        if new_rate <= old_rate {
            log_cat!(
                Category::Mempool,
                "rejecting replacement {}; new feerate {new_rate} <= old feerate {old_rate}",
                hash256_to_hex(txid)
            );
            return Err(ValidationState::invalid(
                REJECT_INSUFFICIENTFEE,
                "insufficient fee",
            ));
        }
        conflict_parents.extend(existing.tx().vin.iter().map(|input| input.prevout.hash));
        conflicting_count += existing.count_with_descendants();
    }
    if conflicting_count > MAX_REPLACEMENT_CANDIDATES {
        return Err(ValidationState::invalid(
            REJECT_NONSTANDARD,
            "too many potential replacements",
        )
        .with_debug(format!("{conflicting_count} > {MAX_REPLACEMENT_CANDIDATES}")));
    }
    for conflict in conflicts {
        pool.calculate_descendants(conflict, all_conflicting);
    }
    let conflicting_fees: Amount = all_conflicting
        .iter()
        .filter_map(|id| pool.get(id))
        .map(TxMemPoolEntry::modified_fee)
        .sum();

    for (index, input) in tx.vin.iter().enumerate() {
        if !conflict_parents.contains(&input.prevout.hash) && pool.exists(&input.prevout.hash) {
            return Err(ValidationState::invalid(
                REJECT_NONSTANDARD,
                "replacement-adds-unconfirmed",
            )
            .with_debug(format!("input {index}")));
        }
    }
    if modified_fees < conflicting_fees {
        return Err(ValidationState::invalid(
            REJECT_INSUFFICIENTFEE,
            "insufficient fee",
        )
        .with_debug(format!("{modified_fees} < {conflicting_fees}")));
    }
    let delta = modified_fees - conflicting_fees;
    let relay_fee = policy.min_relay_fee.fee(size as usize);
    if delta < relay_fee {
        return Err(ValidationState::invalid(
            REJECT_INSUFFICIENTFEE,
            "insufficient fee",
        )
        .with_debug(format!("{delta} < {relay_fee}")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn free_relay_window_decays() {
        let mut limiter = FreeRelayLimiter::new();
        assert!(limiter.admit(100_000, 1_000, 15));
        assert!(limiter.admit(60_000, 1_000, 15));
        // 160 kB sits above the 150 kB window.
        assert!(!limiter.admit(1, 1_000, 15));
        // Ten minutes later the count has decayed by 1/e.
        assert!(limiter.admit(1, 1_600, 15));
    }

    #[test]
    fn priority_threshold() {
        let threshold = (COIN * 144 / 250) as f64;
        assert!(!allow_free(threshold));
        assert!(allow_free(threshold + 1.0));
    }

    #[test]
    fn relay_and_reorg_options() {
        assert!(AcceptOptions::RELAY.limit_free);
        assert!(!AcceptOptions::RELAY.override_mempool_limit);
        assert!(!AcceptOptions::REORG.limit_free);
        assert!(AcceptOptions::REORG.override_mempool_limit);
    }
}
