//! Block and transaction validity rules.
//!
//! Context-free checks take only the object under test. Contextual checks
//! take the block index and the parent the object would build on. Nothing
//! here mutates chain state.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use coind_consensus::constants::{
    COINBASE_MATURITY, LOCKTIME_MEDIAN_TIME_PAST, LOCKTIME_THRESHOLD, LOCKTIME_VERIFY_SEQUENCE,
    MAX_BLOCK_SIGOPS, MAX_BLOCK_SIZE, MAX_FUTURE_BLOCK_TIME,
};
use coind_consensus::money::{money_range, Amount, MAX_MONEY};
use coind_consensus::params::ConsensusParams;
use coind_pow::difficulty::get_next_work_required;
use coind_pow::validation::check_proof_of_work;
use coind_primitives::block::{Block, BlockHeader};
use coind_primitives::transaction::{
    Transaction, SEQUENCE_FINAL, SEQUENCE_LOCKTIME_DISABLE_FLAG, SEQUENCE_LOCKTIME_GRANULARITY,
    SEQUENCE_LOCKTIME_MASK, SEQUENCE_LOCKTIME_TYPE_FLAG,
};
use coind_script::script::{p2sh_sig_op_count, push_int, sig_op_count};
use coind_script::interpreter::SCRIPT_VERIFY_P2SH;
use coind_script::{ScriptError, ScriptFlags, ScriptVerifier, STANDARD_NOT_MANDATORY_VERIFY_FLAGS};
use coind_storage::StoreError;
use rayon::prelude::*;

use crate::blockindex::{BlockIndex, NodeId};
use crate::coins::CoinsViewCache;

pub const REJECT_MALFORMED: u16 = 0x01;
pub const REJECT_INVALID: u16 = 0x10;
pub const REJECT_OBSOLETE: u16 = 0x11;
pub const REJECT_DUPLICATE: u16 = 0x12;
pub const REJECT_NONSTANDARD: u16 = 0x40;
pub const REJECT_DUST: u16 = 0x41;
pub const REJECT_INSUFFICIENTFEE: u16 = 0x42;
pub const REJECT_CHECKPOINT: u16 = 0x43;

/// Codes at or above this are never sent to peers.
pub const REJECT_INTERNAL: u16 = 0x100;
pub const REJECT_HIGHFEE: u16 = 0x100;
pub const REJECT_ALREADY_KNOWN: u16 = 0x101;
pub const REJECT_CONFLICT: u16 = 0x102;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RejectKind {
    /// The object itself breaks a rule.
    Invalid,
    /// Something local went wrong while checking it.
    Error,
}

/// Why a transaction or block was rejected.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ValidationState {
    kind: RejectKind,
    code: u16,
    reason: String,
    debug: String,
    dos: i32,
    corruption_possible: bool,
}

pub type ValidationResult<T = ()> = Result<T, ValidationState>;

impl ValidationState {
    /// A rule violation worth `dos` misbehavior points to the sender.
    pub fn dos(dos: i32, code: u16, reason: impl Into<String>) -> Self {
        Self {
            kind: RejectKind::Invalid,
            code,
            reason: reason.into(),
            debug: String::new(),
            dos,
            corruption_possible: false,
        }
    }

    pub fn invalid(code: u16, reason: impl Into<String>) -> Self {
        Self::dos(0, code, reason)
    }

    pub fn error(reason: impl Into<String>) -> Self {
        Self {
            kind: RejectKind::Error,
            code: 0,
            reason: reason.into(),
            debug: String::new(),
            dos: 0,
            corruption_possible: false,
        }
    }

    pub fn with_debug(mut self, debug: impl Into<String>) -> Self {
        self.debug = debug.into();
        self
    }

    /// The data may have been damaged in transit, so the block hash must not
    /// be marked permanently invalid.
    pub fn corruption_possible(mut self) -> Self {
        self.corruption_possible = true;
        self
    }

    pub fn kind(&self) -> RejectKind {
        self.kind
    }

    pub fn is_invalid(&self) -> bool {
        self.kind == RejectKind::Invalid
    }

    pub fn is_error(&self) -> bool {
        self.kind == RejectKind::Error
    }

    pub fn reject_code(&self) -> u16 {
        self.code
    }

    pub fn reject_reason(&self) -> &str {
        &self.reason
    }

    pub fn debug_message(&self) -> &str {
        &self.debug
    }

    pub fn dos_score(&self) -> i32 {
        self.dos
    }

    pub fn is_corruption_possible(&self) -> bool {
        self.corruption_possible
    }
}

impl std::fmt::Display for ValidationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.reason)?;
        if !self.debug.is_empty() {
            write!(f, ", {}", self.debug)?;
        }
        write!(f, " (code {})", self.code)
    }
}

impl std::error::Error for ValidationState {}

/// Cumulative timings of block validation stages, reported under the
/// `bench` debug category.
#[derive(Debug, Default)]
pub struct ValidationMetrics {
    connect_us: AtomicU64,
    connect_blocks: AtomicU64,
    script_us: AtomicU64,
    script_inputs: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct ValidationMetricsSnapshot {
    pub connect_us: u64,
    pub connect_blocks: u64,
    pub script_us: u64,
    pub script_inputs: u64,
}

impl ValidationMetrics {
    pub fn record_connect(&self, elapsed: Duration) {
        self.connect_us
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
        self.connect_blocks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_scripts(&self, elapsed: Duration, inputs: usize) {
        self.script_us
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
        self.script_inputs
            .fetch_add(inputs as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ValidationMetricsSnapshot {
        ValidationMetricsSnapshot {
            connect_us: self.connect_us.load(Ordering::Relaxed),
            connect_blocks: self.connect_blocks.load(Ordering::Relaxed),
            script_us: self.script_us.load(Ordering::Relaxed),
            script_inputs: self.script_inputs.load(Ordering::Relaxed),
        }
    }
}

pub fn check_transaction(tx: &Transaction) -> ValidationResult {
    if tx.vin.is_empty() {
        return Err(ValidationState::dos(10, REJECT_INVALID, "bad-txns-vin-empty"));
    }
    if tx.vout.is_empty() {
        return Err(ValidationState::dos(10, REJECT_INVALID, "bad-txns-vout-empty"));
    }
    if tx.serialized_size() > MAX_BLOCK_SIZE as usize {
        return Err(ValidationState::dos(100, REJECT_INVALID, "bad-txns-oversize"));
    }

    let mut value_out: Amount = 0;
    for output in &tx.vout {
        if output.value < 0 {
            return Err(ValidationState::dos(100, REJECT_INVALID, "bad-txns-vout-negative"));
        }
        if output.value > MAX_MONEY {
            return Err(ValidationState::dos(100, REJECT_INVALID, "bad-txns-vout-toolarge"));
        }
        value_out += output.value;
        if !money_range(value_out) {
            return Err(ValidationState::dos(
                100,
                REJECT_INVALID,
                "bad-txns-txouttotal-toolarge",
            ));
        }
    }

    let mut seen = HashSet::with_capacity(tx.vin.len());
    for input in &tx.vin {
        if !seen.insert(&input.prevout) {
            return Err(ValidationState::dos(100, REJECT_INVALID, "bad-txns-inputs-duplicate"));
        }
    }

    if tx.is_coinbase() {
        let len = tx.vin[0].script_sig.len();
        if !(2..=100).contains(&len) {
            return Err(ValidationState::dos(100, REJECT_INVALID, "bad-cb-length"));
        }
    } else if tx.vin.iter().any(|input| input.prevout.is_null()) {
        return Err(ValidationState::dos(10, REJECT_INVALID, "bad-txns-prevout-null"));
    }
    Ok(())
}

/// Whether `tx` may appear in a block at `height` with lock-time cutoff
/// `block_time`.
pub fn is_final_tx(tx: &Transaction, height: i32, block_time: i64) -> bool {
    if tx.lock_time == 0 {
        return true;
    }
    let lock_time = tx.lock_time as i64;
    let cutoff = if tx.lock_time < LOCKTIME_THRESHOLD {
        height as i64
    } else {
        block_time
    };
    if lock_time < cutoff {
        return true;
    }
    tx.vin.iter().all(|input| input.sequence == SEQUENCE_FINAL)
}

/// Earliest height and time a transaction's relative locks allow, cached on
/// mempool entries.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct LockPoints {
    pub height: i32,
    pub time: i64,
    /// Highest block the calculation depended on. While it stays on the
    /// active chain the lock points remain valid.
    pub max_input_block: Option<NodeId>,
}

/// Relative lock-time constraints of `tx` for a block whose parent is `prev`.
///
/// Returns the last invalid height and time (`-1` when unconstrained).
/// `prev_heights` holds the confirmation height of each input's coins;
/// entries for inputs with the disable flag are zeroed.
pub fn calculate_sequence_locks(
    tx: &Transaction,
    flags: u32,
    prev_heights: &mut [i32],
    index: &BlockIndex,
    prev: NodeId,
) -> (i32, i64) {
    let mut min_height = -1i32;
    let mut min_time = -1i64;
    let enforce = tx.version as u32 >= 2 && flags & LOCKTIME_VERIFY_SEQUENCE != 0;
    if !enforce {
        return (min_height, min_time);
    }
    for (input, coin_height) in tx.vin.iter().zip(prev_heights.iter_mut()) {
        if input.sequence & SEQUENCE_LOCKTIME_DISABLE_FLAG != 0 {
            *coin_height = 0;
            continue;
        }
        let value = (input.sequence & SEQUENCE_LOCKTIME_MASK) as i64;
        if input.sequence & SEQUENCE_LOCKTIME_TYPE_FLAG != 0 {
            let coin_time = index
                .ancestor(prev, (*coin_height - 1).max(0))
                .map(|id| index.median_time_past(id))
                .unwrap_or(0);
            min_time = min_time.max(coin_time + (value << SEQUENCE_LOCKTIME_GRANULARITY) - 1);
        } else {
            min_height = min_height.max(*coin_height + value as i32 - 1);
        }
    }
    (min_height, min_time)
}

/// Whether a block built on `prev` satisfies the lock pair.
pub fn evaluate_sequence_locks(index: &BlockIndex, prev: NodeId, lock: (i32, i64)) -> bool {
    let height = index.node(prev).height + 1;
    let block_time = index.median_time_past(prev);
    !(lock.0 >= height || lock.1 >= block_time)
}

pub fn sequence_locks(
    tx: &Transaction,
    flags: u32,
    prev_heights: &mut [i32],
    index: &BlockIndex,
    prev: NodeId,
) -> bool {
    let lock = calculate_sequence_locks(tx, flags, prev_heights, index, prev);
    evaluate_sequence_locks(index, prev, lock)
}

/// Signature operations counted without looking at spent outputs.
pub fn legacy_sigop_count(tx: &Transaction) -> u32 {
    let inputs: u32 = tx
        .vin
        .iter()
        .map(|input| sig_op_count(&input.script_sig, false))
        .sum();
    let outputs: u32 = tx
        .vout
        .iter()
        .map(|output| sig_op_count(&output.script_pubkey, false))
        .sum();
    inputs + outputs
}

/// Signature operations inside pay-to-script-hash redeem scripts.
pub fn p2sh_sigop_count(tx: &Transaction, view: &mut CoinsViewCache<'_>) -> Result<u32, StoreError> {
    if tx.is_coinbase() {
        return Ok(0);
    }
    let mut count = 0u32;
    for input in &tx.vin {
        if let Some(prev) = view.output_for(input)? {
            count += p2sh_sig_op_count(&prev.script_pubkey, &input.script_sig);
        }
    }
    Ok(count)
}

/// Checks amounts and coinbase maturity of the inputs of `tx` and returns
/// its fee. Missing inputs are an invalid result with no reason.
pub fn check_tx_inputs(
    tx: &Transaction,
    view: &mut CoinsViewCache<'_>,
    spend_height: i32,
) -> Result<ValidationResult<Amount>, StoreError> {
    if !view.have_inputs(tx)? {
        return Ok(Err(
            ValidationState::invalid(0, "").with_debug("inputs unavailable")
        ));
    }
    let mut value_in: Amount = 0;
    for input in &tx.vin {
        let Some(coins) = view.access_coins(&input.prevout.hash)? else {
            return Ok(Err(ValidationState::invalid(0, "").with_debug("inputs unavailable")));
        };
        if coins.is_coinbase && spend_height - coins.height < COINBASE_MATURITY {
            return Ok(Err(ValidationState::invalid(
                REJECT_INVALID,
                "bad-txns-premature-spend-of-coinbase",
            )
            .with_debug(format!(
                "tried to spend coinbase at depth {}",
                spend_height - coins.height
            ))));
        }
        let value = coins.output(input.prevout.index).map(|out| out.value).unwrap_or(0);
        value_in = value_in.saturating_add(value);
        if !money_range(value) || !money_range(value_in) {
            return Ok(Err(ValidationState::dos(
                100,
                REJECT_INVALID,
                "bad-txns-inputvalues-outofrange",
            )));
        }
    }
    let value_out = tx.value_out().unwrap_or(Amount::MAX);
    if value_in < value_out {
        return Ok(Err(ValidationState::dos(100, REJECT_INVALID, "bad-txns-in-belowout")
            .with_debug(format!("value in ({value_in}) < value out ({value_out})"))));
    }
    let fee = value_in - value_out;
    if fee < 0 {
        return Ok(Err(ValidationState::dos(100, REJECT_INVALID, "bad-txns-fee-negative")));
    }
    if !money_range(fee) {
        return Ok(Err(ValidationState::dos(100, REJECT_INVALID, "bad-txns-fee-outofrange")));
    }
    Ok(Ok(fee))
}

/// One deferred input script verification.
#[derive(Clone, Debug)]
pub struct ScriptCheck<'a> {
    pub tx: &'a Transaction,
    pub input_index: usize,
    pub script_pubkey: Vec<u8>,
    pub flags: ScriptFlags,
    pub cache_store: bool,
}

impl ScriptCheck<'_> {
    pub fn run(&self, verifier: &dyn ScriptVerifier) -> Result<(), ScriptError> {
        verifier.verify_input(
            self.tx,
            self.input_index,
            &self.script_pubkey,
            self.flags,
            self.cache_store,
        )
    }

    /// Runs the check and turns a failure into a rejection, retrying without
    /// the policy-only flags to tell policy failures from consensus ones.
    pub fn run_with_state(&self, verifier: &dyn ScriptVerifier) -> ValidationResult {
        let Err(err) = self.run(verifier) else {
            return Ok(());
        };
        if self.flags & STANDARD_NOT_MANDATORY_VERIFY_FLAGS != 0 {
            let relaxed = ScriptCheck {
                flags: self.flags & !STANDARD_NOT_MANDATORY_VERIFY_FLAGS,
                ..self.clone()
            };
            if relaxed.run(verifier).is_ok() {
                return Err(ValidationState::invalid(
                    REJECT_NONSTANDARD,
                    format!("non-mandatory-script-verify-flag ({err})"),
                ));
            }
        }
        Err(ValidationState::dos(
            100,
            REJECT_INVALID,
            format!("mandatory-script-verify-flag-failed ({err})"),
        ))
    }
}

/// Input checks: amounts and maturity, then scripts. With `deferred` the
/// script checks are queued instead of run.
#[allow(clippy::too_many_arguments)]
pub fn check_inputs<'t>(
    tx: &'t Transaction,
    view: &mut CoinsViewCache<'_>,
    spend_height: i32,
    script_checks: bool,
    flags: ScriptFlags,
    cache_store: bool,
    verifier: &dyn ScriptVerifier,
    deferred: Option<&mut Vec<ScriptCheck<'t>>>,
) -> Result<ValidationResult<Amount>, StoreError> {
    if tx.is_coinbase() {
        return Ok(Ok(0));
    }
    let fee = match check_tx_inputs(tx, view, spend_height)? {
        Ok(fee) => fee,
        Err(state) => return Ok(Err(state)),
    };
    if !script_checks {
        return Ok(Ok(fee));
    }
    let mut checks = Vec::with_capacity(tx.vin.len());
    for (input_index, input) in tx.vin.iter().enumerate() {
        let script_pubkey = view
            .output_for(input)?
            .map(|out| out.script_pubkey.clone())
            .unwrap_or_default();
        checks.push(ScriptCheck {
            tx,
            input_index,
            script_pubkey,
            flags,
            cache_store,
        });
    }
    match deferred {
        Some(queue) => queue.extend(checks),
        None => {
            for check in &checks {
                if let Err(state) = check.run_with_state(verifier) {
                    return Ok(Err(state));
                }
            }
        }
    }
    Ok(Ok(fee))
}

/// Runs queued script checks on the rayon pool. The first failure wins.
pub fn run_script_checks(checks: &[ScriptCheck<'_>], verifier: &dyn ScriptVerifier) -> ValidationResult {
    checks
        .par_iter()
        .try_for_each(|check| match check.run(verifier) {
            Ok(()) => Ok(()),
            Err(err) => Err(ValidationState::dos(
                100,
                REJECT_INVALID,
                format!("mandatory-script-verify-flag-failed ({err})"),
            )
            .with_debug(format!(
                "input {} of {}",
                check.input_index,
                coind_consensus::hash256_to_hex(&check.tx.txid())
            ))),
        })
}

pub fn check_block_header(
    header: &BlockHeader,
    params: &ConsensusParams,
    adjusted_time: i64,
    check_pow: bool,
) -> ValidationResult {
    if check_pow && check_proof_of_work(&header.hash(), header.bits, params).is_err() {
        return Err(ValidationState::dos(50, REJECT_INVALID, "high-hash")
            .with_debug("proof of work failed"));
    }
    if header.time as i64 > adjusted_time + MAX_FUTURE_BLOCK_TIME {
        return Err(ValidationState::invalid(REJECT_INVALID, "time-too-new")
            .with_debug("block timestamp too far in the future"));
    }
    Ok(())
}

pub fn check_block(
    block: &Block,
    params: &ConsensusParams,
    adjusted_time: i64,
    check_pow: bool,
    check_merkle_root: bool,
) -> ValidationResult {
    check_block_header(&block.header, params, adjusted_time, check_pow)?;

    if check_merkle_root {
        let (root, mutated) = block.merkle_root_with_mutation();
        if block.header.merkle_root != root {
            return Err(ValidationState::dos(100, REJECT_INVALID, "bad-txnmrklroot")
                .with_debug("hashMerkleRoot mismatch")
                .corruption_possible());
        }
        // Duplicate trailing transactions leave the root unchanged; such a
        // block could be the mutated copy of a valid one.
        if mutated {
            return Err(ValidationState::dos(100, REJECT_INVALID, "bad-txns-duplicate")
                .with_debug("duplicate transaction")
                .corruption_possible());
        }
    }

    if block.transactions.is_empty()
        || block.transactions.len() > MAX_BLOCK_SIZE as usize
        || block.serialized_size() > MAX_BLOCK_SIZE as usize
    {
        return Err(ValidationState::dos(100, REJECT_INVALID, "bad-blk-length")
            .with_debug("size limits failed"));
    }
    if !block.transactions[0].is_coinbase() {
        return Err(ValidationState::dos(100, REJECT_INVALID, "bad-cb-missing")
            .with_debug("first tx is not coinbase"));
    }
    if block.transactions[1..].iter().any(Transaction::is_coinbase) {
        return Err(ValidationState::dos(100, REJECT_INVALID, "bad-cb-multiple")
            .with_debug("more than one coinbase"));
    }
    for tx in &block.transactions {
        check_transaction(tx).map_err(|state| {
            let debug = format!(
                "transaction check failed (tx hash {}) {}",
                coind_consensus::hash256_to_hex(&tx.txid()),
                state.debug_message()
            );
            state.with_debug(debug)
        })?;
    }
    let sigops: u32 = block.transactions.iter().map(legacy_sigop_count).sum();
    if sigops > MAX_BLOCK_SIGOPS {
        return Err(ValidationState::dos(100, REJECT_INVALID, "bad-blk-sigops")
            .with_debug("out-of-bounds SigOpCount"));
    }
    Ok(())
}

/// Header rules that depend on the parent `prev`. `last_checkpoint` is the
/// height of the newest checkpoint present in the index, when checkpoints
/// are enforced.
pub fn contextual_check_block_header(
    header: &BlockHeader,
    index: &BlockIndex,
    prev: NodeId,
    params: &ConsensusParams,
    last_checkpoint: Option<i32>,
) -> ValidationResult {
    let height = index.node(prev).height + 1;

    if let Some(checkpoint) = last_checkpoint {
        if height < checkpoint {
            return Err(ValidationState::dos(
                100,
                REJECT_CHECKPOINT,
                "bad-fork-prior-to-checkpoint",
            )
            .with_debug(format!("forked chain older than last checkpoint (height {height})")));
        }
    }

    let last = index.header_info(prev);
    let required = get_next_work_required(
        Some(&last),
        header.time as i64,
        |h| {
            let h = i32::try_from(h).ok()?;
            index.ancestor(prev, h).map(|id| index.header_info(id))
        },
        params,
    );
    if header.bits != required {
        return Err(ValidationState::dos(100, REJECT_INVALID, "bad-diffbits")
            .with_debug("incorrect proof of work"));
    }

    if header.time as i64 <= index.median_time_past(prev) {
        return Err(ValidationState::invalid(REJECT_INVALID, "time-too-old")
            .with_debug("block's timestamp is too early"));
    }

    for version in 2..5 {
        if header.version < version
            && index.is_super_majority(
                version,
                Some(prev),
                params.majority_reject_block_outdated,
                params.majority_window,
            )
        {
            return Err(ValidationState::invalid(
                REJECT_OBSOLETE,
                format!("bad-version(0x{:08x})", version - 1),
            )
            .with_debug(format!("rejected nVersion=0x{:08x} block", version - 1)));
        }
    }
    Ok(())
}

/// Transaction-level rules that depend on the parent `prev`. `csv_active`
/// is the CSV deployment state for the block being checked.
pub fn contextual_check_block(
    block: &Block,
    index: &BlockIndex,
    prev: Option<NodeId>,
    params: &ConsensusParams,
    csv_active: bool,
) -> ValidationResult {
    let height = prev.map(|id| index.node(id).height + 1).unwrap_or(0);
    let lock_time_flags = if csv_active {
        LOCKTIME_MEDIAN_TIME_PAST
    } else {
        0
    };
    let cutoff = match prev {
        Some(prev) if lock_time_flags & LOCKTIME_MEDIAN_TIME_PAST != 0 => {
            index.median_time_past(prev)
        }
        _ => block.header.time as i64,
    };
    for tx in &block.transactions {
        if !is_final_tx(tx, height, cutoff) {
            return Err(ValidationState::dos(10, REJECT_INVALID, "bad-txns-nonfinal")
                .with_debug("non-final transaction"));
        }
    }

    if block.header.version >= 2
        && index.is_super_majority(
            2,
            prev,
            params.majority_enforce_block_upgrade,
            params.majority_window,
        )
    {
        let mut expected = Vec::new();
        push_int(&mut expected, height as i64);
        let script_sig = &block.transactions[0].vin[0].script_sig;
        if !script_sig.starts_with(&expected) {
            return Err(ValidationState::dos(100, REJECT_INVALID, "bad-cb-height")
                .with_debug("block height mismatch in coinbase"));
        }
    }
    Ok(())
}

/// Script flags every block enforces regardless of soft-fork state.
pub fn base_script_flags(block_time: i64) -> ScriptFlags {
    // BIP16 switch-over time.
    if block_time >= 1_333_238_400 {
        SCRIPT_VERIFY_P2SH
    } else {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coind_primitives::outpoint::OutPoint;
    use coind_primitives::transaction::{TxIn, TxOut};

    fn spend() -> Transaction {
        Transaction {
            version: 1,
            vin: vec![TxIn::new(OutPoint::new([1u8; 32], 0), vec![0x51])],
            vout: vec![TxOut::new(1_000, vec![0x51])],
            lock_time: 0,
        }
    }

    fn reason(result: ValidationResult) -> (String, i32) {
        let state = result.expect_err("rejected");
        (state.reject_reason().to_string(), state.dos_score())
    }

    #[test]
    fn structural_rejections_carry_dos_weights() {
        assert!(check_transaction(&spend()).is_ok());

        let mut tx = spend();
        tx.vin.clear();
        assert_eq!(reason(check_transaction(&tx)), ("bad-txns-vin-empty".into(), 10));

        let mut tx = spend();
        tx.vout[0].value = -1;
        assert_eq!(reason(check_transaction(&tx)), ("bad-txns-vout-negative".into(), 100));

        let mut tx = spend();
        tx.vout.push(TxOut::new(MAX_MONEY, vec![]));
        assert_eq!(
            reason(check_transaction(&tx)),
            ("bad-txns-txouttotal-toolarge".into(), 100)
        );

        let mut tx = spend();
        tx.vin.push(tx.vin[0].clone());
        assert_eq!(reason(check_transaction(&tx)), ("bad-txns-inputs-duplicate".into(), 100));

        let mut tx = spend();
        tx.vin.push(TxIn::new(OutPoint::null(), vec![]));
        assert_eq!(reason(check_transaction(&tx)), ("bad-txns-prevout-null".into(), 10));

        let coinbase = Transaction {
            vin: vec![TxIn::new(OutPoint::null(), vec![0x01])],
            ..spend()
        };
        assert_eq!(reason(check_transaction(&coinbase)), ("bad-cb-length".into(), 100));
    }

    #[test]
    fn finality_by_height_time_and_sequence() {
        let mut tx = spend();
        tx.lock_time = 100;
        tx.vin[0].sequence = 0;
        assert!(!is_final_tx(&tx, 100, 0));
        assert!(is_final_tx(&tx, 101, 0));
        tx.vin[0].sequence = SEQUENCE_FINAL;
        assert!(is_final_tx(&tx, 100, 0));

        tx.lock_time = LOCKTIME_THRESHOLD + 10;
        tx.vin[0].sequence = 0;
        assert!(!is_final_tx(&tx, 1, (LOCKTIME_THRESHOLD + 10) as i64));
        assert!(is_final_tx(&tx, 1, (LOCKTIME_THRESHOLD + 11) as i64));
    }

    fn header_chain(len: u32) -> (BlockIndex, Vec<NodeId>) {
        let mut index = BlockIndex::new();
        let mut ids = Vec::new();
        let mut prev = [0u8; 32];
        for n in 0..len {
            let header = BlockHeader {
                version: 4,
                prev_block: prev,
                merkle_root: [0u8; 32],
                time: 1_000 + n * 600,
                bits: 0x207f_ffff,
                nonce: n,
            };
            let hash = header.hash();
            ids.push(index.insert_header(hash, &header));
            prev = hash;
        }
        (index, ids)
    }

    #[test]
    fn sequence_locks_follow_the_unsigned_version() {
        let (index, ids) = header_chain(20);
        let tip = *ids.last().expect("tip");
        let mut tx = spend();
        tx.vin[0].sequence = 5;

        let mut heights = [10];
        assert_eq!(
            calculate_sequence_locks(&tx, LOCKTIME_VERIFY_SEQUENCE, &mut heights, &index, tip),
            (-1, -1)
        );

        tx.version = 2;
        let mut heights = [10];
        assert_eq!(
            calculate_sequence_locks(&tx, LOCKTIME_VERIFY_SEQUENCE, &mut heights, &index, tip),
            (14, -1)
        );

        tx.version = 0x8000_0002u32 as i32;
        let mut heights = [10];
        assert_eq!(
            calculate_sequence_locks(&tx, LOCKTIME_VERIFY_SEQUENCE, &mut heights, &index, tip),
            (14, -1)
        );

        // Without the flag nothing is enforced.
        let mut heights = [10];
        assert_eq!(calculate_sequence_locks(&tx, 0, &mut heights, &index, tip), (-1, -1));
    }

    #[test]
    fn legacy_sigops_cover_inputs_and_outputs() {
        let mut tx = spend();
        tx.vin[0].script_sig = vec![0xac, 0xac];
        tx.vout[0].script_pubkey = vec![0xae];
        assert_eq!(legacy_sigop_count(&tx), 2 + 20);
    }

    #[test]
    fn validation_state_formats_reason_and_debug() {
        let state = ValidationState::dos(100, REJECT_INVALID, "bad-blk-sigops")
            .with_debug("out-of-bounds SigOpCount");
        assert_eq!(state.to_string(), "bad-blk-sigops, out-of-bounds SigOpCount (code 16)");
        assert!(state.is_invalid());
        assert!(!state.is_corruption_possible());
        assert!(ValidationState::error("disk").is_error());
    }
}
