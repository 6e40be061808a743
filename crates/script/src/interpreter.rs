//! Script interpreter and validation.

use std::fmt;

use coind_consensus::constants::LOCKTIME_THRESHOLD;
use coind_primitives::hash::{hash160, sha256, sha256d};
use coind_primitives::transaction::{
    Transaction, SEQUENCE_FINAL, SEQUENCE_LOCKTIME_DISABLE_FLAG, SEQUENCE_LOCKTIME_MASK,
    SEQUENCE_LOCKTIME_TYPE_FLAG,
};
use ripemd::{Digest as RipemdDigest, Ripemd160};
use sha1::Sha1;

use crate::script::*;
use crate::secp::{is_low_s, verify_ecdsa};
use crate::sigcache::SignatureCache;
use crate::sighash::{signature_hash, SighashType};

pub type ScriptFlags = u32;

pub const SCRIPT_VERIFY_NONE: ScriptFlags = 0;
pub const SCRIPT_VERIFY_P2SH: ScriptFlags = 1 << 0;
pub const SCRIPT_VERIFY_STRICTENC: ScriptFlags = 1 << 1;
pub const SCRIPT_VERIFY_DERSIG: ScriptFlags = 1 << 2;
pub const SCRIPT_VERIFY_LOW_S: ScriptFlags = 1 << 3;
pub const SCRIPT_VERIFY_NULLDUMMY: ScriptFlags = 1 << 4;
pub const SCRIPT_VERIFY_SIGPUSHONLY: ScriptFlags = 1 << 5;
pub const SCRIPT_VERIFY_MINIMALDATA: ScriptFlags = 1 << 6;
pub const SCRIPT_VERIFY_DISCOURAGE_UPGRADABLE_NOPS: ScriptFlags = 1 << 7;
pub const SCRIPT_VERIFY_CLEANSTACK: ScriptFlags = 1 << 8;
pub const SCRIPT_VERIFY_CHECKLOCKTIMEVERIFY: ScriptFlags = 1 << 9;
pub const SCRIPT_VERIFY_CHECKSEQUENCEVERIFY: ScriptFlags = 1 << 10;

/// Failing these makes a block invalid.
pub const MANDATORY_SCRIPT_VERIFY_FLAGS: ScriptFlags = SCRIPT_VERIFY_P2SH;
/// Mempool policy. Failing these without failing the mandatory set is not punished.
pub const STANDARD_SCRIPT_VERIFY_FLAGS: ScriptFlags = MANDATORY_SCRIPT_VERIFY_FLAGS
    | SCRIPT_VERIFY_DERSIG
    | SCRIPT_VERIFY_STRICTENC
    | SCRIPT_VERIFY_MINIMALDATA
    | SCRIPT_VERIFY_NULLDUMMY
    | SCRIPT_VERIFY_DISCOURAGE_UPGRADABLE_NOPS
    | SCRIPT_VERIFY_CLEANSTACK
    | SCRIPT_VERIFY_CHECKLOCKTIMEVERIFY
    | SCRIPT_VERIFY_CHECKSEQUENCEVERIFY
    | SCRIPT_VERIFY_LOW_S;
pub const STANDARD_NOT_MANDATORY_VERIFY_FLAGS: ScriptFlags =
    STANDARD_SCRIPT_VERIFY_FLAGS & !MANDATORY_SCRIPT_VERIFY_FLAGS;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScriptError {
    Unknown,
    EvalFalse,
    OpReturn,
    ScriptSize,
    PushSize,
    OpCount,
    StackSize,
    SigCount,
    PubkeyCount,
    Verify,
    EqualVerify,
    CheckMultisigVerify,
    CheckSigVerify,
    NumEqualVerify,
    BadOpcode,
    DisabledOpcode,
    InvalidStackOperation,
    InvalidAltstackOperation,
    UnbalancedConditional,
    NegativeLocktime,
    UnsatisfiedLocktime,
    SigHashType,
    SigDer,
    MinimalData,
    SigPushOnly,
    SigHighS,
    SigNullDummy,
    PubkeyType,
    CleanStack,
    DiscourageUpgradableNops,
}

impl ScriptError {
    pub fn as_str(self) -> &'static str {
        match self {
            ScriptError::Unknown => "unknown error",
            ScriptError::EvalFalse => {
                "Script evaluated without error but finished with a false/empty top stack element"
            }
            ScriptError::OpReturn => "OP_RETURN was encountered",
            ScriptError::ScriptSize => "Script is too big",
            ScriptError::PushSize => "Push value size limit exceeded",
            ScriptError::OpCount => "Operation limit exceeded",
            ScriptError::StackSize => "Stack size limit exceeded",
            ScriptError::SigCount => "Signature count negative or greater than pubkey count",
            ScriptError::PubkeyCount => "Pubkey count negative or limit exceeded",
            ScriptError::Verify => "Script failed an OP_VERIFY operation",
            ScriptError::EqualVerify => "Script failed an OP_EQUALVERIFY operation",
            ScriptError::CheckMultisigVerify => "Script failed an OP_CHECKMULTISIGVERIFY operation",
            ScriptError::CheckSigVerify => "Script failed an OP_CHECKSIGVERIFY operation",
            ScriptError::NumEqualVerify => "Script failed an OP_NUMEQUALVERIFY operation",
            ScriptError::BadOpcode => "Opcode missing or not understood",
            ScriptError::DisabledOpcode => "Attempted to use a disabled opcode",
            ScriptError::InvalidStackOperation => "Operation not valid with the current stack size",
            ScriptError::InvalidAltstackOperation => {
                "Operation not valid with the current altstack size"
            }
            ScriptError::UnbalancedConditional => "Invalid OP_IF construction",
            ScriptError::NegativeLocktime => "Negative locktime",
            ScriptError::UnsatisfiedLocktime => "Locktime requirement not satisfied",
            ScriptError::SigHashType => "Signature hash type missing or not understood",
            ScriptError::SigDer => "Non-canonical DER signature",
            ScriptError::MinimalData => "Data push larger than necessary",
            ScriptError::SigPushOnly => "Only non-push operators allowed in signatures",
            ScriptError::SigHighS => "Non-canonical signature: S value is unnecessarily high",
            ScriptError::SigNullDummy => "Dummy CHECKMULTISIG argument must be zero",
            ScriptError::PubkeyType => "Public key is neither compressed or uncompressed",
            ScriptError::CleanStack => "Extra items left on stack after execution",
            ScriptError::DiscourageUpgradableNops => "NOPx reserved for soft-fork upgrades",
        }
    }
}

impl fmt::Display for ScriptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::error::Error for ScriptError {}

impl From<ScriptNumError> for ScriptError {
    fn from(_: ScriptNumError) -> Self {
        ScriptError::Unknown
    }
}

/// What the interpreter needs from the spending transaction.
pub trait SignatureChecker {
    fn check_sig(&self, _sig: &[u8], _pubkey: &[u8], _script_code: &[u8]) -> bool {
        false
    }

    fn check_lock_time(&self, _lock_time: ScriptNum) -> bool {
        false
    }

    fn check_sequence(&self, _sequence: ScriptNum) -> bool {
        false
    }
}

/// Fails every signature and lock-time check. Used to evaluate signature
/// scripts for their stack shape only.
pub struct NullSignatureChecker;

impl SignatureChecker for NullSignatureChecker {}

pub struct TransactionSignatureChecker<'a> {
    tx: &'a Transaction,
    input_index: usize,
    cache: Option<&'a SignatureCache>,
    store: bool,
}

impl<'a> TransactionSignatureChecker<'a> {
    pub fn new(tx: &'a Transaction, input_index: usize) -> Self {
        Self {
            tx,
            input_index,
            cache: None,
            store: false,
        }
    }

    /// Consults `cache` on every check. Successful verifications are added
    /// only when `store` is set.
    pub fn with_cache(mut self, cache: &'a SignatureCache, store: bool) -> Self {
        self.cache = Some(cache);
        self.store = store;
        self
    }
}

impl SignatureChecker for TransactionSignatureChecker<'_> {
    fn check_sig(&self, sig: &[u8], pubkey: &[u8], script_code: &[u8]) -> bool {
        let Some((hash_type, der)) = sig.split_last() else {
            return false;
        };
        let sighash = signature_hash(
            self.tx,
            self.input_index,
            script_code,
            SighashType(*hash_type as u32),
        );
        let key = self
            .cache
            .map(|_| SignatureCache::entry_key(&sighash, pubkey, der));
        if let (Some(cache), Some(key)) = (self.cache, key.as_ref()) {
            if cache.contains(key) {
                return true;
            }
        }
        if !verify_ecdsa(&sighash, der, pubkey) {
            return false;
        }
        if let (Some(cache), Some(key), true) = (self.cache, key, self.store) {
            cache.insert(key);
        }
        true
    }

    fn check_lock_time(&self, lock_time: ScriptNum) -> bool {
        let tx_lock_time = self.tx.lock_time as i64;
        let threshold = LOCKTIME_THRESHOLD as i64;
        // Height-based and time-based lock times are not comparable.
        if !((tx_lock_time < threshold && lock_time.0 < threshold)
            || (tx_lock_time >= threshold && lock_time.0 >= threshold))
        {
            return false;
        }
        if lock_time.0 > tx_lock_time {
            return false;
        }
        // A final input would let the spender bypass nLockTime entirely.
        match self.tx.vin.get(self.input_index) {
            Some(input) => input.sequence != SEQUENCE_FINAL,
            None => false,
        }
    }

    fn check_sequence(&self, sequence: ScriptNum) -> bool {
        let Some(input) = self.tx.vin.get(self.input_index) else {
            return false;
        };
        let tx_sequence = input.sequence as i64;
        // Versions are compared unsigned so high-bit versions opt in.
        if (self.tx.version as u32) < 2 {
            return false;
        }
        if tx_sequence & SEQUENCE_LOCKTIME_DISABLE_FLAG as i64 != 0 {
            return false;
        }
        let mask = (SEQUENCE_LOCKTIME_TYPE_FLAG | SEQUENCE_LOCKTIME_MASK) as i64;
        let tx_masked = tx_sequence & mask;
        let masked = sequence.0 & mask;
        let type_flag = SEQUENCE_LOCKTIME_TYPE_FLAG as i64;
        if !((tx_masked < type_flag && masked < type_flag)
            || (tx_masked >= type_flag && masked >= type_flag))
        {
            return false;
        }
        masked <= tx_masked
    }
}

pub fn cast_to_bool(data: &[u8]) -> bool {
    for (index, byte) in data.iter().enumerate() {
        if *byte != 0 {
            return !(index == data.len() - 1 && *byte == 0x80);
        }
    }
    false
}

fn bool_to_vec(value: bool) -> Vec<u8> {
    if value {
        vec![1]
    } else {
        Vec::new()
    }
}

fn is_disabled(opcode: u8) -> bool {
    matches!(
        opcode,
        OP_CAT
            | OP_SUBSTR
            | OP_LEFT
            | OP_RIGHT
            | OP_INVERT
            | OP_AND
            | OP_OR
            | OP_XOR
            | OP_2MUL
            | OP_2DIV
            | OP_MUL
            | OP_DIV
            | OP_MOD
            | OP_LSHIFT
            | OP_RSHIFT
    )
}

/// Strict DER (BIP66) including the trailing hash type byte.
pub fn is_valid_signature_encoding(sig: &[u8]) -> bool {
    let size = sig.len();
    if !(9..=73).contains(&size) {
        return false;
    }
    if sig[0] != 0x30 || sig[1] as usize != size - 3 {
        return false;
    }
    let len_r = sig[3] as usize;
    if 5 + len_r >= size {
        return false;
    }
    let len_s = sig[5 + len_r] as usize;
    if len_r + len_s + 7 != size {
        return false;
    }
    if sig[2] != 0x02 || len_r == 0 || sig[4] & 0x80 != 0 {
        return false;
    }
    if len_r > 1 && sig[4] == 0 && sig[5] & 0x80 == 0 {
        return false;
    }
    if sig[len_r + 4] != 0x02 || len_s == 0 || sig[len_r + 6] & 0x80 != 0 {
        return false;
    }
    if len_s > 1 && sig[len_r + 6] == 0 && sig[len_r + 7] & 0x80 == 0 {
        return false;
    }
    true
}

fn is_compressed_or_uncompressed_pubkey(pubkey: &[u8]) -> bool {
    match pubkey.first() {
        Some(0x04) => pubkey.len() == 65,
        Some(0x02) | Some(0x03) => pubkey.len() == 33,
        _ => false,
    }
}

pub fn check_signature_encoding(sig: &[u8], flags: ScriptFlags) -> Result<(), ScriptError> {
    // An empty signature is a compact way to fail CHECKSIG on purpose.
    if sig.is_empty() {
        return Ok(());
    }
    if flags & (SCRIPT_VERIFY_DERSIG | SCRIPT_VERIFY_LOW_S | SCRIPT_VERIFY_STRICTENC) != 0
        && !is_valid_signature_encoding(sig)
    {
        return Err(ScriptError::SigDer);
    }
    if flags & SCRIPT_VERIFY_LOW_S != 0 && !is_low_s(&sig[..sig.len() - 1]) {
        return Err(ScriptError::SigHighS);
    }
    if flags & SCRIPT_VERIFY_STRICTENC != 0 && !SighashType(sig[sig.len() - 1] as u32).is_defined()
    {
        return Err(ScriptError::SigHashType);
    }
    Ok(())
}

pub fn check_pubkey_encoding(pubkey: &[u8], flags: ScriptFlags) -> Result<(), ScriptError> {
    if flags & SCRIPT_VERIFY_STRICTENC != 0 && !is_compressed_or_uncompressed_pubkey(pubkey) {
        return Err(ScriptError::PubkeyType);
    }
    Ok(())
}

fn need(stack: &[Vec<u8>], count: usize) -> Result<(), ScriptError> {
    if stack.len() < count {
        return Err(ScriptError::InvalidStackOperation);
    }
    Ok(())
}

/// Element `depth` positions from the top; depth 1 is the top.
fn top(stack: &[Vec<u8>], depth: usize) -> Result<&Vec<u8>, ScriptError> {
    need(stack, depth)?;
    Ok(&stack[stack.len() - depth])
}

fn pop(stack: &mut Vec<Vec<u8>>) -> Result<Vec<u8>, ScriptError> {
    stack.pop().ok_or(ScriptError::InvalidStackOperation)
}

fn push_script_bytes(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + 5);
    push_data(&mut out, data);
    out
}

pub fn eval_script<C: SignatureChecker + ?Sized>(
    stack: &mut Vec<Vec<u8>>,
    script: &[u8],
    flags: ScriptFlags,
    checker: &C,
) -> Result<(), ScriptError> {
    if script.len() > MAX_SCRIPT_SIZE {
        return Err(ScriptError::ScriptSize);
    }
    let require_minimal = flags & SCRIPT_VERIFY_MINIMALDATA != 0;
    let num = |data: &[u8]| -> Result<ScriptNum, ScriptError> {
        Ok(ScriptNum::decode(
            data,
            require_minimal,
            ScriptNum::DEFAULT_MAX_SIZE,
        )?)
    };

    let mut instructions = Instructions::new(script);
    let mut code_start = 0usize;
    let mut exec_stack: Vec<bool> = Vec::new();
    let mut altstack: Vec<Vec<u8>> = Vec::new();
    let mut op_count = 0usize;

    while let Some(item) = instructions.next() {
        let exec = !exec_stack.contains(&false);
        let Instruction { opcode, data } = item.map_err(|()| ScriptError::BadOpcode)?;

        if data.len() > MAX_SCRIPT_ELEMENT_SIZE {
            return Err(ScriptError::PushSize);
        }
        if opcode > OP_16 {
            op_count += 1;
            if op_count > MAX_OPS_PER_SCRIPT {
                return Err(ScriptError::OpCount);
            }
        }
        // Disabled opcodes fail even in an unexecuted branch.
        if is_disabled(opcode) {
            return Err(ScriptError::DisabledOpcode);
        }

        if exec && opcode <= OP_PUSHDATA4 {
            if require_minimal && !check_minimal_push(data, opcode) {
                return Err(ScriptError::MinimalData);
            }
            stack.push(data.to_vec());
        } else if exec || (OP_IF..=OP_ENDIF).contains(&opcode) {
            match opcode {
                OP_1NEGATE | OP_1..=OP_16 => {
                    let value = opcode as i64 - (OP_1 as i64 - 1);
                    stack.push(ScriptNum::serialize(value));
                }
                OP_NOP => {}
                OP_CHECKLOCKTIMEVERIFY => {
                    if flags & SCRIPT_VERIFY_CHECKLOCKTIMEVERIFY == 0 {
                        if flags & SCRIPT_VERIFY_DISCOURAGE_UPGRADABLE_NOPS != 0 {
                            return Err(ScriptError::DiscourageUpgradableNops);
                        }
                    } else {
                        // Five bytes so times past 2038 still fit.
                        let lock_time = ScriptNum::decode(top(stack, 1)?, require_minimal, 5)?;
                        if lock_time.0 < 0 {
                            return Err(ScriptError::NegativeLocktime);
                        }
                        if !checker.check_lock_time(lock_time) {
                            return Err(ScriptError::UnsatisfiedLocktime);
                        }
                    }
                }
                OP_CHECKSEQUENCEVERIFY => {
                    if flags & SCRIPT_VERIFY_CHECKSEQUENCEVERIFY == 0 {
                        if flags & SCRIPT_VERIFY_DISCOURAGE_UPGRADABLE_NOPS != 0 {
                            return Err(ScriptError::DiscourageUpgradableNops);
                        }
                    } else {
                        let sequence = ScriptNum::decode(top(stack, 1)?, require_minimal, 5)?;
                        if sequence.0 < 0 {
                            return Err(ScriptError::NegativeLocktime);
                        }
                        if sequence.0 & SEQUENCE_LOCKTIME_DISABLE_FLAG as i64 == 0
                            && !checker.check_sequence(sequence)
                        {
                            return Err(ScriptError::UnsatisfiedLocktime);
                        }
                    }
                }
                OP_NOP1 | OP_NOP4..=OP_NOP10 => {
                    if flags & SCRIPT_VERIFY_DISCOURAGE_UPGRADABLE_NOPS != 0 {
                        return Err(ScriptError::DiscourageUpgradableNops);
                    }
                }
                OP_IF | OP_NOTIF => {
                    let mut value = false;
                    if exec {
                        let condition = stack.pop().ok_or(ScriptError::UnbalancedConditional)?;
                        value = cast_to_bool(&condition);
                        if opcode == OP_NOTIF {
                            value = !value;
                        }
                    }
                    exec_stack.push(value);
                }
                OP_ELSE => {
                    let last = exec_stack
                        .last_mut()
                        .ok_or(ScriptError::UnbalancedConditional)?;
                    *last = !*last;
                }
                OP_ENDIF => {
                    exec_stack.pop().ok_or(ScriptError::UnbalancedConditional)?;
                }
                OP_VERIFY => {
                    if !cast_to_bool(top(stack, 1)?) {
                        return Err(ScriptError::Verify);
                    }
                    stack.pop();
                }
                OP_RETURN => return Err(ScriptError::OpReturn),

                OP_TOALTSTACK => {
                    let value = pop(stack)?;
                    altstack.push(value);
                }
                OP_FROMALTSTACK => {
                    let value = altstack
                        .pop()
                        .ok_or(ScriptError::InvalidAltstackOperation)?;
                    stack.push(value);
                }
                OP_2DROP => {
                    need(stack, 2)?;
                    stack.truncate(stack.len() - 2);
                }
                OP_2DUP => {
                    need(stack, 2)?;
                    let len = stack.len();
                    let pair = [stack[len - 2].clone(), stack[len - 1].clone()];
                    stack.extend(pair);
                }
                OP_3DUP => {
                    need(stack, 3)?;
                    let len = stack.len();
                    let triple = stack[len - 3..].to_vec();
                    stack.extend(triple);
                }
                OP_2OVER => {
                    need(stack, 4)?;
                    let len = stack.len();
                    let pair = [stack[len - 4].clone(), stack[len - 3].clone()];
                    stack.extend(pair);
                }
                OP_2ROT => {
                    need(stack, 6)?;
                    let len = stack.len();
                    let moved: Vec<Vec<u8>> = stack.drain(len - 6..len - 4).collect();
                    stack.extend(moved);
                }
                OP_2SWAP => {
                    need(stack, 4)?;
                    let len = stack.len();
                    stack.swap(len - 4, len - 2);
                    stack.swap(len - 3, len - 1);
                }
                OP_IFDUP => {
                    let value = top(stack, 1)?;
                    if cast_to_bool(value) {
                        let value = value.clone();
                        stack.push(value);
                    }
                }
                OP_DEPTH => {
                    let depth = stack.len() as i64;
                    stack.push(ScriptNum::serialize(depth));
                }
                OP_DROP => {
                    pop(stack)?;
                }
                OP_DUP => {
                    let value = top(stack, 1)?.clone();
                    stack.push(value);
                }
                OP_NIP => {
                    need(stack, 2)?;
                    let len = stack.len();
                    stack.remove(len - 2);
                }
                OP_OVER => {
                    let value = top(stack, 2)?.clone();
                    stack.push(value);
                }
                OP_PICK | OP_ROLL => {
                    need(stack, 2)?;
                    let n = num(top(stack, 1)?)?.get_int();
                    stack.pop();
                    if n < 0 || n as usize >= stack.len() {
                        return Err(ScriptError::InvalidStackOperation);
                    }
                    let index = stack.len() - 1 - n as usize;
                    let value = if opcode == OP_ROLL {
                        stack.remove(index)
                    } else {
                        stack[index].clone()
                    };
                    stack.push(value);
                }
                OP_ROT => {
                    need(stack, 3)?;
                    let len = stack.len();
                    stack.swap(len - 3, len - 2);
                    stack.swap(len - 2, len - 1);
                }
                OP_SWAP => {
                    need(stack, 2)?;
                    let len = stack.len();
                    stack.swap(len - 2, len - 1);
                }
                OP_TUCK => {
                    need(stack, 2)?;
                    let len = stack.len();
                    let value = stack[len - 1].clone();
                    stack.insert(len - 2, value);
                }
                OP_SIZE => {
                    let size = top(stack, 1)?.len() as i64;
                    stack.push(ScriptNum::serialize(size));
                }

                OP_EQUAL | OP_EQUALVERIFY => {
                    need(stack, 2)?;
                    let len = stack.len();
                    let equal = stack[len - 2] == stack[len - 1];
                    stack.truncate(len - 2);
                    if opcode == OP_EQUALVERIFY {
                        if !equal {
                            return Err(ScriptError::EqualVerify);
                        }
                    } else {
                        stack.push(bool_to_vec(equal));
                    }
                }

                OP_1ADD | OP_1SUB | OP_NEGATE | OP_ABS | OP_NOT | OP_0NOTEQUAL => {
                    let value = num(top(stack, 1)?)?.0;
                    let result = match opcode {
                        OP_1ADD => value + 1,
                        OP_1SUB => value - 1,
                        OP_NEGATE => -value,
                        OP_ABS => value.abs(),
                        OP_NOT => (value == 0) as i64,
                        _ => (value != 0) as i64,
                    };
                    stack.pop();
                    stack.push(ScriptNum::serialize(result));
                }
                OP_ADD
                | OP_SUB
                | OP_BOOLAND
                | OP_BOOLOR
                | OP_NUMEQUAL
                | OP_NUMEQUALVERIFY
                | OP_NUMNOTEQUAL
                | OP_LESSTHAN
                | OP_GREATERTHAN
                | OP_LESSTHANOREQUAL
                | OP_GREATERTHANOREQUAL
                | OP_MIN
                | OP_MAX => {
                    need(stack, 2)?;
                    let a = num(top(stack, 2)?)?.0;
                    let b = num(top(stack, 1)?)?.0;
                    let result = match opcode {
                        OP_ADD => a + b,
                        OP_SUB => a - b,
                        OP_BOOLAND => (a != 0 && b != 0) as i64,
                        OP_BOOLOR => (a != 0 || b != 0) as i64,
                        OP_NUMEQUAL | OP_NUMEQUALVERIFY => (a == b) as i64,
                        OP_NUMNOTEQUAL => (a != b) as i64,
                        OP_LESSTHAN => (a < b) as i64,
                        OP_GREATERTHAN => (a > b) as i64,
                        OP_LESSTHANOREQUAL => (a <= b) as i64,
                        OP_GREATERTHANOREQUAL => (a >= b) as i64,
                        OP_MIN => a.min(b),
                        _ => a.max(b),
                    };
                    stack.truncate(stack.len() - 2);
                    if opcode == OP_NUMEQUALVERIFY {
                        if result == 0 {
                            return Err(ScriptError::NumEqualVerify);
                        }
                    } else {
                        stack.push(ScriptNum::serialize(result));
                    }
                }
                OP_WITHIN => {
                    need(stack, 3)?;
                    let value = num(top(stack, 3)?)?.0;
                    let min = num(top(stack, 2)?)?.0;
                    let max = num(top(stack, 1)?)?.0;
                    stack.truncate(stack.len() - 3);
                    stack.push(bool_to_vec(min <= value && value < max));
                }

                OP_RIPEMD160 | OP_SHA1 | OP_SHA256 | OP_HASH160 | OP_HASH256 => {
                    let data = pop(stack)?;
                    let digest = match opcode {
                        OP_RIPEMD160 => Ripemd160::digest(&data).to_vec(),
                        OP_SHA1 => Sha1::digest(&data).to_vec(),
                        OP_SHA256 => sha256(&data).to_vec(),
                        OP_HASH160 => hash160(&data).to_vec(),
                        _ => sha256d(&data).to_vec(),
                    };
                    stack.push(digest);
                }
                OP_CODESEPARATOR => {
                    code_start = instructions.position();
                }
                OP_CHECKSIG | OP_CHECKSIGVERIFY => {
                    need(stack, 2)?;
                    let len = stack.len();
                    let sig = &stack[len - 2];
                    let pubkey = &stack[len - 1];
                    let script_code =
                        find_and_delete(&script[code_start..], &push_script_bytes(sig));
                    check_signature_encoding(sig, flags)?;
                    check_pubkey_encoding(pubkey, flags)?;
                    let success = checker.check_sig(sig, pubkey, &script_code);
                    stack.truncate(len - 2);
                    if opcode == OP_CHECKSIGVERIFY {
                        if !success {
                            return Err(ScriptError::CheckSigVerify);
                        }
                    } else {
                        stack.push(bool_to_vec(success));
                    }
                }
                OP_CHECKMULTISIG | OP_CHECKMULTISIGVERIFY => {
                    let mut i = 1usize;
                    let mut keys_count = num(top(stack, i)?)?.get_int();
                    if keys_count < 0 || keys_count as usize > MAX_PUBKEYS_PER_MULTISIG {
                        return Err(ScriptError::PubkeyCount);
                    }
                    op_count += keys_count as usize;
                    if op_count > MAX_OPS_PER_SCRIPT {
                        return Err(ScriptError::OpCount);
                    }
                    i += 1;
                    let mut key_depth = i;
                    i += keys_count as usize;
                    let mut sigs_count = num(top(stack, i)?)?.get_int();
                    if sigs_count < 0 || sigs_count > keys_count {
                        return Err(ScriptError::SigCount);
                    }
                    i += 1;
                    let mut sig_depth = i;
                    i += sigs_count as usize;
                    need(stack, i)?;

                    let mut script_code = script[code_start..].to_vec();
                    for k in 0..sigs_count as usize {
                        let sig = top(stack, sig_depth + k)?;
                        script_code = find_and_delete(&script_code, &push_script_bytes(sig));
                    }

                    let mut success = true;
                    while success && sigs_count > 0 {
                        let sig = top(stack, sig_depth)?;
                        let pubkey = top(stack, key_depth)?;
                        check_signature_encoding(sig, flags)?;
                        check_pubkey_encoding(pubkey, flags)?;
                        if checker.check_sig(sig, pubkey, &script_code) {
                            sig_depth += 1;
                            sigs_count -= 1;
                        }
                        key_depth += 1;
                        keys_count -= 1;
                        // More signatures left than keys means failure.
                        if sigs_count > keys_count {
                            success = false;
                        }
                    }

                    stack.truncate(stack.len() - (i - 1));
                    // Off-by-one consumes one extra element. NULLDUMMY pins it to empty.
                    let dummy = top(stack, 1)?;
                    if flags & SCRIPT_VERIFY_NULLDUMMY != 0 && !dummy.is_empty() {
                        return Err(ScriptError::SigNullDummy);
                    }
                    stack.pop();

                    if opcode == OP_CHECKMULTISIGVERIFY {
                        if !success {
                            return Err(ScriptError::CheckMultisigVerify);
                        }
                    } else {
                        stack.push(bool_to_vec(success));
                    }
                }
                _ => {
                    coind_log::log_trace!("bad opcode 0x{opcode:02x}");
                    return Err(ScriptError::BadOpcode);
                }
            }
        }

        if stack.len() + altstack.len() > MAX_STACK_SIZE {
            return Err(ScriptError::StackSize);
        }
    }

    if !exec_stack.is_empty() {
        return Err(ScriptError::UnbalancedConditional);
    }
    Ok(())
}

pub fn verify_script<C: SignatureChecker + ?Sized>(
    script_sig: &[u8],
    script_pubkey: &[u8],
    flags: ScriptFlags,
    checker: &C,
) -> Result<(), ScriptError> {
    if flags & SCRIPT_VERIFY_SIGPUSHONLY != 0 && !is_push_only(script_sig) {
        return Err(ScriptError::SigPushOnly);
    }

    let mut stack = Vec::new();
    eval_script(&mut stack, script_sig, flags, checker)?;
    let stack_copy = if flags & SCRIPT_VERIFY_P2SH != 0 {
        stack.clone()
    } else {
        Vec::new()
    };
    eval_script(&mut stack, script_pubkey, flags, checker)?;
    match stack.last() {
        Some(value) if cast_to_bool(value) => {}
        _ => return Err(ScriptError::EvalFalse),
    }

    if flags & SCRIPT_VERIFY_P2SH != 0 && is_p2sh(script_pubkey) {
        if !is_push_only(script_sig) {
            return Err(ScriptError::SigPushOnly);
        }
        stack = stack_copy;
        let redeem_script = stack.pop().ok_or(ScriptError::Unknown)?;
        eval_script(&mut stack, &redeem_script, flags, checker)?;
        match stack.last() {
            Some(value) if cast_to_bool(value) => {}
            _ => return Err(ScriptError::EvalFalse),
        }
    }

    // CLEANSTACK is only meaningful together with P2SH; without it a P2SH
    // spend could never satisfy the rule.
    if flags & SCRIPT_VERIFY_CLEANSTACK != 0
        && flags & SCRIPT_VERIFY_P2SH != 0
        && stack.len() != 1
    {
        return Err(ScriptError::CleanStack);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(script: &[u8], flags: ScriptFlags) -> Result<Vec<Vec<u8>>, ScriptError> {
        let mut stack = Vec::new();
        eval_script(&mut stack, script, flags, &NullSignatureChecker)?;
        Ok(stack)
    }

    #[test]
    fn arithmetic_and_equal() {
        let script = [OP_1 + 1, OP_1 + 2, OP_ADD, OP_1 + 4, OP_EQUAL];
        assert_eq!(run(&script, 0).expect("eval"), vec![vec![1]]);
        let within = [OP_1 + 2, OP_1, OP_1 + 4, OP_WITHIN];
        assert_eq!(run(&within, 0).expect("eval"), vec![vec![1]]);
    }

    #[test]
    fn disabled_opcode_fails_in_unexecuted_branch() {
        let script = [OP_0, OP_IF, OP_CAT, OP_ENDIF];
        assert_eq!(run(&script, 0), Err(ScriptError::DisabledOpcode));
        let reserved = [OP_0, OP_IF, OP_RESERVED, OP_ENDIF];
        assert!(run(&reserved, 0).is_ok());
        let verif = [OP_0, OP_IF, OP_VERIF, OP_ENDIF];
        assert_eq!(run(&verif, 0), Err(ScriptError::BadOpcode));
    }

    #[test]
    fn conditionals_must_balance() {
        assert_eq!(run(&[OP_1, OP_IF], 0), Err(ScriptError::UnbalancedConditional));
        assert_eq!(run(&[OP_ENDIF], 0), Err(ScriptError::UnbalancedConditional));
        let script = [OP_0, OP_IF, OP_1 + 1, OP_ELSE, OP_1 + 2, OP_ENDIF];
        assert_eq!(run(&script, 0).expect("eval"), vec![vec![3]]);
    }

    #[test]
    fn op_count_limit() {
        let script = vec![OP_NOP; MAX_OPS_PER_SCRIPT + 1];
        assert_eq!(run(&script, 0), Err(ScriptError::OpCount));
        let script = vec![OP_NOP; MAX_OPS_PER_SCRIPT];
        assert!(run(&script, 0).is_ok());
    }

    #[test]
    fn minimal_data_rejects_long_pushes() {
        let script = [0x01, 0x05];
        assert_eq!(run(&script, SCRIPT_VERIFY_MINIMALDATA), Err(ScriptError::MinimalData));
        assert!(run(&script, 0).is_ok());
    }

    #[test]
    fn discouraged_nops() {
        assert_eq!(
            run(&[OP_NOP1], SCRIPT_VERIFY_DISCOURAGE_UPGRADABLE_NOPS),
            Err(ScriptError::DiscourageUpgradableNops)
        );
        assert!(run(&[OP_NOP1], 0).is_ok());
    }

    #[test]
    fn cltv_checks_sign_and_checker() {
        let script = [OP_1NEGATE, OP_CHECKLOCKTIMEVERIFY];
        assert_eq!(
            run(&script, SCRIPT_VERIFY_CHECKLOCKTIMEVERIFY),
            Err(ScriptError::NegativeLocktime)
        );
        let script = [OP_1, OP_CHECKLOCKTIMEVERIFY];
        assert_eq!(
            run(&script, SCRIPT_VERIFY_CHECKLOCKTIMEVERIFY),
            Err(ScriptError::UnsatisfiedLocktime)
        );
        // Without the flag it behaves as NOP2.
        assert!(run(&script, 0).is_ok());
    }

    #[test]
    fn p2sh_evaluates_redeem_script() {
        let redeem = [OP_1 + 1, OP_EQUAL];
        let mut script_pubkey = vec![OP_HASH160, 0x14];
        script_pubkey.extend_from_slice(&hash160(&redeem));
        script_pubkey.push(OP_EQUAL);
        let mut script_sig = vec![OP_1 + 1];
        push_data(&mut script_sig, &redeem);
        let flags = SCRIPT_VERIFY_P2SH | SCRIPT_VERIFY_CLEANSTACK;
        assert!(verify_script(&script_sig, &script_pubkey, flags, &NullSignatureChecker).is_ok());

        let mut wrong = vec![OP_1 + 2];
        push_data(&mut wrong, &redeem);
        assert_eq!(
            verify_script(&wrong, &script_pubkey, flags, &NullSignatureChecker),
            Err(ScriptError::EvalFalse)
        );
    }

    #[test]
    fn cleanstack_rejects_leftovers() {
        let result = verify_script(
            &[OP_1, OP_1],
            &[OP_NOP],
            SCRIPT_VERIFY_P2SH | SCRIPT_VERIFY_CLEANSTACK,
            &NullSignatureChecker,
        );
        assert_eq!(result, Err(ScriptError::CleanStack));
    }

    #[test]
    fn der_encoding_rules() {
        let mut sig = vec![0x30, 0x06, 0x02, 0x01, 0x01, 0x02, 0x01, 0x01, 0x01];
        assert!(is_valid_signature_encoding(&sig));
        sig[4] = 0x81;
        assert!(!is_valid_signature_encoding(&sig));
        assert_eq!(
            check_signature_encoding(&sig, SCRIPT_VERIFY_DERSIG),
            Err(ScriptError::SigDer)
        );
        assert!(check_signature_encoding(&[], SCRIPT_VERIFY_DERSIG).is_ok());
    }

    #[test]
    fn nulldummy_error_string() {
        assert_eq!(
            ScriptError::SigNullDummy.to_string(),
            "Dummy CHECKMULTISIG argument must be zero"
        );
    }
}
