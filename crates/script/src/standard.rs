//! Standard script templates and relay policy.

use coind_consensus::constants::MAX_BLOCK_SIGOPS;
use coind_consensus::money::FeeRate;
use coind_primitives::transaction::{Transaction, TxOut};
use coind_primitives::OutPoint;

use crate::interpreter::{eval_script, NullSignatureChecker, SCRIPT_VERIFY_NONE};
use crate::script::*;

pub const MAX_STANDARD_TX_SIZE: usize = 100_000;
pub const MAX_STANDARD_SCRIPTSIG_SIZE: usize = 1650;
pub const MAX_P2SH_SIGOPS: u32 = 15;
pub const MAX_STANDARD_TX_SIGOPS: u32 = MAX_BLOCK_SIGOPS / 5;
pub const MAX_OP_RETURN_RELAY: usize = 83;
pub const DEFAULT_MIN_RELAY_TX_FEE: i64 = 1000;
pub const DEFAULT_PERMIT_BAREMULTISIG: bool = true;
pub const DEFAULT_ACCEPT_DATACARRIER: bool = true;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ScriptType {
    NonStandard,
    PubKey,
    PubKeyHash,
    ScriptHash,
    MultiSig,
    NullData,
}

impl ScriptType {
    pub fn as_str(self) -> &'static str {
        match self {
            ScriptType::NonStandard => "nonstandard",
            ScriptType::PubKey => "pubkey",
            ScriptType::PubKeyHash => "pubkeyhash",
            ScriptType::ScriptHash => "scripthash",
            ScriptType::MultiSig => "multisig",
            ScriptType::NullData => "nulldata",
        }
    }
}

/// Relay-policy knobs that standardness depends on.
#[derive(Clone, Debug)]
pub struct StandardPolicy {
    pub min_relay_fee: FeeRate,
    pub permit_bare_multisig: bool,
    pub accept_datacarrier: bool,
    pub max_datacarrier_bytes: usize,
}

impl Default for StandardPolicy {
    fn default() -> Self {
        Self {
            min_relay_fee: FeeRate::new(DEFAULT_MIN_RELAY_TX_FEE),
            permit_bare_multisig: DEFAULT_PERMIT_BAREMULTISIG,
            accept_datacarrier: DEFAULT_ACCEPT_DATACARRIER,
            max_datacarrier_bytes: MAX_OP_RETURN_RELAY,
        }
    }
}

fn is_pubkey_push(ins: &Instruction<'_>) -> bool {
    ins.opcode <= OP_PUSHDATA4 && (33..=65).contains(&ins.data.len())
}

fn small_int(opcode: u8) -> Option<usize> {
    if opcode == OP_0 || (OP_1..=OP_16).contains(&opcode) {
        Some(decode_op_n(opcode))
    } else {
        None
    }
}

/// Matches `script_pubkey` against the standard templates. Solutions are the
/// template's data: the key, key hash, script hash, or `[m], keys.., [n]`.
pub fn solver(script_pubkey: &[u8]) -> (ScriptType, Vec<Vec<u8>>) {
    if is_p2sh(script_pubkey) {
        return (ScriptType::ScriptHash, vec![script_pubkey[2..22].to_vec()]);
    }
    if script_pubkey.first() == Some(&OP_RETURN) && is_push_only(&script_pubkey[1..]) {
        return (ScriptType::NullData, Vec::new());
    }

    let mut ops = Vec::new();
    for ins in Instructions::new(script_pubkey) {
        match ins {
            Ok(ins) => ops.push(ins),
            Err(()) => return (ScriptType::NonStandard, Vec::new()),
        }
    }

    match ops.as_slice() {
        [key, checksig] if is_pubkey_push(key) && checksig.opcode == OP_CHECKSIG => {
            (ScriptType::PubKey, vec![key.data.to_vec()])
        }
        [dup, hash160, hash, equalverify, checksig]
            if dup.opcode == OP_DUP
                && hash160.opcode == OP_HASH160
                && hash.opcode <= OP_PUSHDATA4
                && hash.data.len() == 20
                && equalverify.opcode == OP_EQUALVERIFY
                && checksig.opcode == OP_CHECKSIG =>
        {
            (ScriptType::PubKeyHash, vec![hash.data.to_vec()])
        }
        [first, keys @ .., last, checkmultisig]
            if checkmultisig.opcode == OP_CHECKMULTISIG && !keys.is_empty() =>
        {
            let (Some(m), Some(n)) = (small_int(first.opcode), small_int(last.opcode)) else {
                return (ScriptType::NonStandard, Vec::new());
            };
            if !keys.iter().all(is_pubkey_push) || m < 1 || n < 1 || m > n || keys.len() != n {
                return (ScriptType::NonStandard, Vec::new());
            }
            let mut solutions = Vec::with_capacity(n + 2);
            solutions.push(vec![m as u8]);
            solutions.extend(keys.iter().map(|key| key.data.to_vec()));
            solutions.push(vec![n as u8]);
            (ScriptType::MultiSig, solutions)
        }
        _ => (ScriptType::NonStandard, Vec::new()),
    }
}

pub fn classify_script_pubkey(script: &[u8]) -> ScriptType {
    solver(script).0
}

/// Template check plus the multisig and data-carrier size limits.
pub fn is_standard(script_pubkey: &[u8], policy: &StandardPolicy) -> (bool, ScriptType) {
    let (kind, solutions) = solver(script_pubkey);
    let standard = match kind {
        ScriptType::NonStandard => false,
        ScriptType::MultiSig => {
            let m = solutions.first().and_then(|v| v.first()).copied().unwrap_or(0);
            let n = solutions.last().and_then(|v| v.first()).copied().unwrap_or(0);
            (1..=3).contains(&n) && m >= 1 && m <= n
        }
        ScriptType::NullData => {
            policy.accept_datacarrier && script_pubkey.len() <= policy.max_datacarrier_bytes
        }
        _ => true,
    };
    (standard, kind)
}

/// Smallest output value worth relaying: three times the fee to spend it.
pub fn dust_threshold(txout: &TxOut, min_relay_fee: &FeeRate) -> i64 {
    if is_unspendable(&txout.script_pubkey) {
        return 0;
    }
    // 148 bytes approximates a compressed-key P2PKH input spending it.
    let size = txout.serialized_size() + 32 + 4 + 1 + 107 + 4;
    3 * min_relay_fee.fee(size)
}

pub fn is_dust(txout: &TxOut, min_relay_fee: &FeeRate) -> bool {
    txout.value < dust_threshold(txout, min_relay_fee)
}

/// Returns the policy reason on the first violated rule.
pub fn is_standard_tx(tx: &Transaction, policy: &StandardPolicy) -> Result<(), &'static str> {
    if tx.version > coind_primitives::transaction::MAX_STANDARD_VERSION || tx.version < 1 {
        return Err("version");
    }
    if tx.serialized_size() >= MAX_STANDARD_TX_SIZE {
        return Err("tx-size");
    }
    for input in &tx.vin {
        if input.script_sig.len() > MAX_STANDARD_SCRIPTSIG_SIZE {
            return Err("scriptsig-size");
        }
        if !is_push_only(&input.script_sig) {
            return Err("scriptsig-not-pushonly");
        }
    }

    let mut data_outputs = 0usize;
    for output in &tx.vout {
        let (standard, kind) = is_standard(&output.script_pubkey, policy);
        if !standard {
            return Err("scriptpubkey");
        }
        if kind == ScriptType::NullData {
            data_outputs += 1;
        } else if kind == ScriptType::MultiSig && !policy.permit_bare_multisig {
            return Err("bare-multisig");
        } else if is_dust(output, &policy.min_relay_fee) {
            return Err("dust");
        }
    }
    if data_outputs > 1 {
        return Err("multi-op-return");
    }
    Ok(())
}

/// Number of signature-script stack items a template needs, or `None`.
pub fn script_sig_args_expected(kind: ScriptType, solutions: &[Vec<u8>]) -> Option<usize> {
    match kind {
        ScriptType::NonStandard | ScriptType::NullData => None,
        ScriptType::PubKey => Some(1),
        ScriptType::PubKeyHash => Some(2),
        ScriptType::MultiSig => solutions
            .first()
            .and_then(|m| m.first())
            .map(|m| *m as usize + 1),
        ScriptType::ScriptHash => Some(1),
    }
}

/// Checks that every input's signature script has exactly the shape its
/// previous output's template expects. `prev_script` resolves prevouts.
pub fn are_inputs_standard<F>(tx: &Transaction, mut prev_script: F) -> bool
where
    F: FnMut(&OutPoint) -> Option<Vec<u8>>,
{
    if tx.is_coinbase() {
        return true;
    }
    for input in &tx.vin {
        let Some(prev_script_pubkey) = prev_script(&input.prevout) else {
            return false;
        };
        let (kind, solutions) = solver(&prev_script_pubkey);
        let Some(mut args_expected) = script_sig_args_expected(kind, &solutions) else {
            return false;
        };

        let mut stack = Vec::new();
        if eval_script(
            &mut stack,
            &input.script_sig,
            SCRIPT_VERIFY_NONE,
            &NullSignatureChecker,
        )
        .is_err()
        {
            return false;
        }

        if kind == ScriptType::ScriptHash {
            let Some(subscript) = stack.last() else {
                return false;
            };
            let (sub_kind, sub_solutions) = solver(subscript);
            if sub_kind == ScriptType::NonStandard {
                // Any other redeem script is fine under the sigop cap, and
                // the remaining inputs are not examined.
                return sig_op_count(subscript, true) <= MAX_P2SH_SIGOPS;
            }
            match script_sig_args_expected(sub_kind, &sub_solutions) {
                Some(extra) => args_expected += extra,
                None => return false,
            }
        }

        if stack.len() != args_expected {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p2pkh() -> Vec<u8> {
        let mut script = vec![OP_DUP, OP_HASH160, 0x14];
        script.extend_from_slice(&[0x11; 20]);
        script.extend_from_slice(&[OP_EQUALVERIFY, OP_CHECKSIG]);
        script
    }

    #[test]
    fn dust_threshold_for_p2pkh() {
        let out = TxOut::new(545, p2pkh());
        // (34 + 148) * 1000 / 1000 * 3
        assert_eq!(dust_threshold(&out, &FeeRate::new(1000)), 546);
        assert!(is_dust(&out, &FeeRate::new(1000)));
        let data = TxOut::new(0, vec![OP_RETURN]);
        assert!(!is_dust(&data, &FeeRate::new(1000)));
    }

    #[test]
    fn multisig_solutions() {
        let mut script = vec![OP_1];
        for byte in [0x02u8, 0x03] {
            push_data(&mut script, &[byte; 33]);
        }
        script.extend_from_slice(&[OP_1 + 1, OP_CHECKMULTISIG]);
        let (kind, solutions) = solver(&script);
        assert_eq!(kind, ScriptType::MultiSig);
        assert_eq!(solutions.len(), 4);
        assert_eq!(script_sig_args_expected(kind, &solutions), Some(2));
    }
}
