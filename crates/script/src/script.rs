//! Opcodes, script parsing and script numbers.

pub const OP_0: u8 = 0x00;
pub const OP_PUSHDATA1: u8 = 0x4c;
pub const OP_PUSHDATA2: u8 = 0x4d;
pub const OP_PUSHDATA4: u8 = 0x4e;
pub const OP_1NEGATE: u8 = 0x4f;
pub const OP_RESERVED: u8 = 0x50;
pub const OP_1: u8 = 0x51;
pub const OP_16: u8 = 0x60;

pub const OP_NOP: u8 = 0x61;
pub const OP_VER: u8 = 0x62;
pub const OP_IF: u8 = 0x63;
pub const OP_NOTIF: u8 = 0x64;
pub const OP_VERIF: u8 = 0x65;
pub const OP_VERNOTIF: u8 = 0x66;
pub const OP_ELSE: u8 = 0x67;
pub const OP_ENDIF: u8 = 0x68;
pub const OP_VERIFY: u8 = 0x69;
pub const OP_RETURN: u8 = 0x6a;

pub const OP_TOALTSTACK: u8 = 0x6b;
pub const OP_FROMALTSTACK: u8 = 0x6c;
pub const OP_2DROP: u8 = 0x6d;
pub const OP_2DUP: u8 = 0x6e;
pub const OP_3DUP: u8 = 0x6f;
pub const OP_2OVER: u8 = 0x70;
pub const OP_2ROT: u8 = 0x71;
pub const OP_2SWAP: u8 = 0x72;
pub const OP_IFDUP: u8 = 0x73;
pub const OP_DEPTH: u8 = 0x74;
pub const OP_DROP: u8 = 0x75;
pub const OP_DUP: u8 = 0x76;
pub const OP_NIP: u8 = 0x77;
pub const OP_OVER: u8 = 0x78;
pub const OP_PICK: u8 = 0x79;
pub const OP_ROLL: u8 = 0x7a;
pub const OP_ROT: u8 = 0x7b;
pub const OP_SWAP: u8 = 0x7c;
pub const OP_TUCK: u8 = 0x7d;

pub const OP_CAT: u8 = 0x7e;
pub const OP_SUBSTR: u8 = 0x7f;
pub const OP_LEFT: u8 = 0x80;
pub const OP_RIGHT: u8 = 0x81;
pub const OP_SIZE: u8 = 0x82;

pub const OP_INVERT: u8 = 0x83;
pub const OP_AND: u8 = 0x84;
pub const OP_OR: u8 = 0x85;
pub const OP_XOR: u8 = 0x86;
pub const OP_EQUAL: u8 = 0x87;
pub const OP_EQUALVERIFY: u8 = 0x88;

pub const OP_1ADD: u8 = 0x8b;
pub const OP_1SUB: u8 = 0x8c;
pub const OP_2MUL: u8 = 0x8d;
pub const OP_2DIV: u8 = 0x8e;
pub const OP_NEGATE: u8 = 0x8f;
pub const OP_ABS: u8 = 0x90;
pub const OP_NOT: u8 = 0x91;
pub const OP_0NOTEQUAL: u8 = 0x92;
pub const OP_ADD: u8 = 0x93;
pub const OP_SUB: u8 = 0x94;
pub const OP_MUL: u8 = 0x95;
pub const OP_DIV: u8 = 0x96;
pub const OP_MOD: u8 = 0x97;
pub const OP_LSHIFT: u8 = 0x98;
pub const OP_RSHIFT: u8 = 0x99;
pub const OP_BOOLAND: u8 = 0x9a;
pub const OP_BOOLOR: u8 = 0x9b;
pub const OP_NUMEQUAL: u8 = 0x9c;
pub const OP_NUMEQUALVERIFY: u8 = 0x9d;
pub const OP_NUMNOTEQUAL: u8 = 0x9e;
pub const OP_LESSTHAN: u8 = 0x9f;
pub const OP_GREATERTHAN: u8 = 0xa0;
pub const OP_LESSTHANOREQUAL: u8 = 0xa1;
pub const OP_GREATERTHANOREQUAL: u8 = 0xa2;
pub const OP_MIN: u8 = 0xa3;
pub const OP_MAX: u8 = 0xa4;
pub const OP_WITHIN: u8 = 0xa5;

pub const OP_RIPEMD160: u8 = 0xa6;
pub const OP_SHA1: u8 = 0xa7;
pub const OP_SHA256: u8 = 0xa8;
pub const OP_HASH160: u8 = 0xa9;
pub const OP_HASH256: u8 = 0xaa;
pub const OP_CODESEPARATOR: u8 = 0xab;
pub const OP_CHECKSIG: u8 = 0xac;
pub const OP_CHECKSIGVERIFY: u8 = 0xad;
pub const OP_CHECKMULTISIG: u8 = 0xae;
pub const OP_CHECKMULTISIGVERIFY: u8 = 0xaf;

pub const OP_NOP1: u8 = 0xb0;
pub const OP_CHECKLOCKTIMEVERIFY: u8 = 0xb1;
pub const OP_CHECKSEQUENCEVERIFY: u8 = 0xb2;
pub const OP_NOP4: u8 = 0xb3;
pub const OP_NOP10: u8 = 0xb9;

/// Maximum number of bytes pushable to the stack.
pub const MAX_SCRIPT_ELEMENT_SIZE: usize = 520;
/// Maximum number of non-push operations per script.
pub const MAX_OPS_PER_SCRIPT: usize = 201;
/// Maximum number of public keys per multisig.
pub const MAX_PUBKEYS_PER_MULTISIG: usize = 20;
/// Maximum combined height of stack and altstack.
pub const MAX_STACK_SIZE: usize = 1000;
pub const MAX_SCRIPT_SIZE: usize = coind_consensus::constants::MAX_SCRIPT_SIZE;

/// One parsed script element: the opcode and, for pushes, its payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Instruction<'a> {
    pub opcode: u8,
    pub data: &'a [u8],
}

/// Iterates script elements. Yields `Err(())` once on a truncated push, then stops.
pub struct Instructions<'a> {
    script: &'a [u8],
    cursor: usize,
    failed: bool,
}

impl<'a> Instructions<'a> {
    pub fn new(script: &'a [u8]) -> Self {
        Self {
            script,
            cursor: 0,
            failed: false,
        }
    }

    /// Byte offset of the next instruction.
    pub fn position(&self) -> usize {
        self.cursor
    }

    fn take(&mut self, len: usize) -> Option<&'a [u8]> {
        let end = self.cursor.checked_add(len)?;
        let slice = self.script.get(self.cursor..end)?;
        self.cursor = end;
        Some(slice)
    }

    fn read_len(&mut self, width: usize) -> Option<usize> {
        let bytes = self.take(width)?;
        let mut value = 0usize;
        for (shift, byte) in bytes.iter().enumerate() {
            value |= (*byte as usize) << (8 * shift);
        }
        Some(value)
    }
}

impl<'a> Iterator for Instructions<'a> {
    type Item = Result<Instruction<'a>, ()>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.cursor >= self.script.len() {
            return None;
        }
        let opcode = self.script[self.cursor];
        self.cursor += 1;
        let len = match opcode {
            0x01..=0x4b => Some(opcode as usize),
            OP_PUSHDATA1 => self.read_len(1),
            OP_PUSHDATA2 => self.read_len(2),
            OP_PUSHDATA4 => self.read_len(4),
            _ => Some(0),
        };
        match len.and_then(|len| self.take(len)) {
            Some(data) => Some(Ok(Instruction { opcode, data })),
            None => {
                self.failed = true;
                Some(Err(()))
            }
        }
    }
}

pub fn is_push_only(script: &[u8]) -> bool {
    Instructions::new(script).all(|ins| matches!(ins, Ok(ins) if ins.opcode <= OP_16))
}

pub fn is_p2sh(script_pubkey: &[u8]) -> bool {
    script_pubkey.len() == 23
        && script_pubkey[0] == OP_HASH160
        && script_pubkey[1] == 0x14
        && script_pubkey[22] == OP_EQUAL
}

/// Scripts starting with OP_RETURN or too large to execute can never be spent.
pub fn is_unspendable(script_pubkey: &[u8]) -> bool {
    script_pubkey.first() == Some(&OP_RETURN) || script_pubkey.len() > MAX_SCRIPT_SIZE
}

pub fn decode_op_n(opcode: u8) -> usize {
    if opcode == OP_0 {
        return 0;
    }
    (opcode - (OP_1 - 1)) as usize
}

pub fn encode_op_n(n: usize) -> u8 {
    if n == 0 {
        OP_0
    } else {
        OP_1 + (n as u8 - 1)
    }
}

/// Counts CHECKSIG-style operations. With `accurate`, a multisig preceded by
/// OP_1..OP_16 counts that many keys, otherwise the maximum.
pub fn sig_op_count(script: &[u8], accurate: bool) -> u32 {
    let mut count = 0u32;
    let mut last_opcode = 0xffu8;
    for ins in Instructions::new(script) {
        let Ok(ins) = ins else {
            break;
        };
        match ins.opcode {
            OP_CHECKSIG | OP_CHECKSIGVERIFY => count += 1,
            OP_CHECKMULTISIG | OP_CHECKMULTISIGVERIFY => {
                if accurate && (OP_1..=OP_16).contains(&last_opcode) {
                    count += decode_op_n(last_opcode) as u32;
                } else {
                    count += MAX_PUBKEYS_PER_MULTISIG as u32;
                }
            }
            _ => {}
        }
        last_opcode = ins.opcode;
    }
    count
}

/// Sigops of the redeem script a P2SH `script_sig` reveals. Zero when
/// `script_pubkey` is not P2SH or the signature script is not push-only.
pub fn p2sh_sig_op_count(script_pubkey: &[u8], script_sig: &[u8]) -> u32 {
    if !is_p2sh(script_pubkey) {
        return sig_op_count(script_pubkey, true);
    }
    let mut last_data: &[u8] = &[];
    for ins in Instructions::new(script_sig) {
        let Ok(ins) = ins else {
            return 0;
        };
        if ins.opcode > OP_16 {
            return 0;
        }
        last_data = ins.data;
    }
    sig_op_count(last_data, true)
}

/// Serializes `data` as a single minimal push.
pub fn push_data(out: &mut Vec<u8>, data: &[u8]) {
    let len = data.len();
    if len < OP_PUSHDATA1 as usize {
        out.push(len as u8);
    } else if len <= 0xff {
        out.push(OP_PUSHDATA1);
        out.push(len as u8);
    } else if len <= 0xffff {
        out.push(OP_PUSHDATA2);
        out.extend_from_slice(&(len as u16).to_le_bytes());
    } else {
        out.push(OP_PUSHDATA4);
        out.extend_from_slice(&(len as u32).to_le_bytes());
    }
    out.extend_from_slice(data);
}

/// Pushes an integer the way script builders do: OP_0/OP_1NEGATE/OP_1..OP_16
/// for small values, otherwise a minimal script-number push.
pub fn push_int(out: &mut Vec<u8>, value: i64) {
    if value == -1 || (1..=16).contains(&value) {
        out.push((value + (OP_1 as i64 - 1)) as u8);
    } else if value == 0 {
        out.push(OP_0);
    } else {
        push_data(out, &ScriptNum::serialize(value));
    }
}

/// Removes every occurrence of the serialized push `needle` at instruction
/// boundaries, as legacy signature hashing requires.
pub fn find_and_delete(script: &[u8], needle: &[u8]) -> Vec<u8> {
    if needle.is_empty() {
        return script.to_vec();
    }
    let mut out = Vec::with_capacity(script.len());
    let mut iter = Instructions::new(script);
    let mut start = 0usize;
    loop {
        while script[start..].starts_with(needle) {
            start += needle.len();
        }
        // Re-sync the parser to `start`.
        iter.cursor = start;
        match iter.next() {
            Some(Ok(_)) => {
                out.extend_from_slice(&script[start..iter.position()]);
                start = iter.position();
            }
            _ => {
                out.extend_from_slice(&script[start.min(script.len())..]);
                break;
            }
        }
    }
    out
}

pub fn check_minimal_push(data: &[u8], opcode: u8) -> bool {
    if data.is_empty() {
        return opcode == OP_0;
    }
    if data.len() == 1 && (1..=16).contains(&data[0]) {
        return opcode == OP_1 + (data[0] - 1);
    }
    if data.len() == 1 && data[0] == 0x81 {
        return opcode == OP_1NEGATE;
    }
    if data.len() <= 75 {
        return opcode as usize == data.len();
    }
    if data.len() <= 255 {
        return opcode == OP_PUSHDATA1;
    }
    if data.len() <= 65535 {
        return opcode == OP_PUSHDATA2;
    }
    true
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScriptNumError {
    Overflow,
    NonMinimal,
}

/// Little-endian sign-magnitude integer as used by script arithmetic.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct ScriptNum(pub i64);

impl ScriptNum {
    pub const DEFAULT_MAX_SIZE: usize = 4;

    pub fn decode(data: &[u8], require_minimal: bool, max_size: usize) -> Result<Self, ScriptNumError> {
        if data.len() > max_size {
            return Err(ScriptNumError::Overflow);
        }
        if require_minimal {
            if let Some(last) = data.last() {
                // The top byte may only be 0x00/0x80 when the next byte needs the sign bit.
                if last & 0x7f == 0 && (data.len() <= 1 || data[data.len() - 2] & 0x80 == 0) {
                    return Err(ScriptNumError::NonMinimal);
                }
            }
        }
        if data.is_empty() {
            return Ok(Self(0));
        }
        let mut result: i64 = 0;
        for (i, byte) in data.iter().enumerate() {
            result |= (*byte as i64) << (8 * i);
        }
        let last = data[data.len() - 1];
        if last & 0x80 != 0 {
            result &= !(0x80i64 << (8 * (data.len() - 1)));
            result = -result;
        }
        Ok(Self(result))
    }

    pub fn serialize(value: i64) -> Vec<u8> {
        if value == 0 {
            return Vec::new();
        }
        let negative = value < 0;
        let mut abs = value.unsigned_abs();
        let mut result = Vec::with_capacity(9);
        while abs > 0 {
            result.push((abs & 0xff) as u8);
            abs >>= 8;
        }
        if let Some(last) = result.last_mut() {
            if *last & 0x80 != 0 {
                result.push(if negative { 0x80 } else { 0x00 });
            } else if negative {
                *last |= 0x80;
            }
        }
        result
    }

    /// Value clamped to the `i32` range.
    pub fn get_int(self) -> i32 {
        self.0.clamp(i32::MIN as i64, i32::MAX as i64) as i32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn script_num_round_trip_and_minimality() {
        for value in [0i64, 1, -1, 127, 128, -128, 255, 256, 0x7fff_ffff, -0x7fff_ffff] {
            let bytes = ScriptNum::serialize(value);
            assert_eq!(ScriptNum::decode(&bytes, true, 4).expect("decode"), ScriptNum(value));
        }
        assert_eq!(
            ScriptNum::decode(&[0x01, 0x00], true, 4),
            Err(ScriptNumError::NonMinimal)
        );
        assert_eq!(ScriptNum::decode(&[0x01, 0x00], false, 4), Ok(ScriptNum(1)));
        assert_eq!(ScriptNum::decode(&[0x80, 0x80], true, 4), Ok(ScriptNum(-128)));
        assert_eq!(
            ScriptNum::decode(&[1, 2, 3, 4, 5], false, 4),
            Err(ScriptNumError::Overflow)
        );
    }

    #[test]
    fn multisig_sigops_accurate_vs_legacy() {
        let script = [OP_1, OP_2DUP, OP_1 + 2, OP_CHECKMULTISIG, OP_CHECKSIG];
        assert_eq!(sig_op_count(&script, true), 4);
        assert_eq!(sig_op_count(&script, false), 21);
    }

    #[test]
    fn p2sh_sigops_come_from_redeem_script() {
        let redeem = [OP_1 + 1, OP_CHECKMULTISIG];
        let mut script_sig = vec![OP_0];
        push_data(&mut script_sig, &redeem);
        let mut p2sh = vec![OP_HASH160, 0x14];
        p2sh.extend_from_slice(&[0u8; 20]);
        p2sh.push(OP_EQUAL);
        assert_eq!(p2sh_sig_op_count(&p2sh, &script_sig), 2);
        assert_eq!(p2sh_sig_op_count(&p2sh, &[OP_DUP]), 0);
    }

    #[test]
    fn find_and_delete_respects_boundaries() {
        let mut needle = Vec::new();
        push_data(&mut needle, &[0xaa, 0xbb]);
        let mut script = needle.clone();
        script.push(OP_CHECKSIG);
        script.extend_from_slice(&needle);
        assert_eq!(find_and_delete(&script, &needle), vec![OP_CHECKSIG]);

        // The needle bytes inside a larger push are untouched.
        let mut wrapped = Vec::new();
        push_data(&mut wrapped, &needle);
        assert_eq!(find_and_delete(&wrapped, &needle), wrapped);
    }

    #[test]
    fn push_only_accepts_reserved_but_not_nop() {
        assert!(is_push_only(&[OP_0, OP_RESERVED, OP_16]));
        assert!(!is_push_only(&[OP_NOP]));
        assert!(!is_push_only(&[0x02, 0x01]));
    }
}
