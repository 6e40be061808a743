//! Legacy (pre-segwit) signature hashing.

use coind_consensus::Hash256;
use coind_primitives::encoding::{Encodable, Encoder};
use coind_primitives::hash::sha256d;
use coind_primitives::transaction::Transaction;

use crate::script::{Instructions, OP_CODESEPARATOR};

pub const SIGHASH_ALL: u32 = 0x01;
pub const SIGHASH_NONE: u32 = 0x02;
pub const SIGHASH_SINGLE: u32 = 0x03;
pub const SIGHASH_ANYONECANPAY: u32 = 0x80;

/// Returned for out-of-range inputs and SIGHASH_SINGLE without a matching
/// output. Signatures over it are valid, which consensus has to preserve.
pub const SIGHASH_ONE: Hash256 = {
    let mut one = [0u8; 32];
    one[0] = 1;
    one
};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SighashType(pub u32);

impl SighashType {
    pub fn base_type(self) -> u32 {
        self.0 & 0x1f
    }

    pub fn has_anyone_can_pay(self) -> bool {
        (self.0 & SIGHASH_ANYONECANPAY) != 0
    }

    /// Whether the base type is one of ALL, NONE or SINGLE.
    pub fn is_defined(self) -> bool {
        let base = self.0 & !SIGHASH_ANYONECANPAY;
        (SIGHASH_ALL..=SIGHASH_SINGLE).contains(&base)
    }
}

pub fn signature_hash(
    tx: &Transaction,
    input_index: usize,
    script_code: &[u8],
    sighash_type: SighashType,
) -> Hash256 {
    if input_index >= tx.vin.len() {
        return SIGHASH_ONE;
    }
    let base = sighash_type.base_type();
    let hash_single = base == SIGHASH_SINGLE;
    let hash_none = base == SIGHASH_NONE;
    if hash_single && input_index >= tx.vout.len() {
        return SIGHASH_ONE;
    }
    let anyone_can_pay = sighash_type.has_anyone_can_pay();

    let mut encoder = Encoder::new();
    encoder.write_i32_le(tx.version);

    let input_count = if anyone_can_pay { 1 } else { tx.vin.len() };
    encoder.write_compact_size(input_count as u64);
    for position in 0..input_count {
        let actual = if anyone_can_pay { input_index } else { position };
        let input = &tx.vin[actual];
        input.prevout.consensus_encode(&mut encoder);
        if actual == input_index {
            write_script_code(&mut encoder, script_code);
        } else {
            encoder.write_compact_size(0);
        }
        if actual != input_index && (hash_single || hash_none) {
            encoder.write_u32_le(0);
        } else {
            encoder.write_u32_le(input.sequence);
        }
    }

    let output_count = if hash_none {
        0
    } else if hash_single {
        input_index + 1
    } else {
        tx.vout.len()
    };
    encoder.write_compact_size(output_count as u64);
    for position in 0..output_count {
        if hash_single && position != input_index {
            encoder.write_i64_le(-1);
            encoder.write_compact_size(0);
        } else {
            tx.vout[position].consensus_encode(&mut encoder);
        }
    }

    encoder.write_u32_le(tx.lock_time);
    encoder.write_u32_le(sighash_type.0);
    sha256d(&encoder.into_inner())
}

/// Serializes the script code with every OP_CODESEPARATOR removed.
fn write_script_code(encoder: &mut Encoder, script_code: &[u8]) {
    let mut stripped = Vec::with_capacity(script_code.len());
    let mut iter = Instructions::new(script_code);
    let mut start = 0usize;
    while let Some(item) = iter.next() {
        let end = iter.position();
        match item {
            Ok(ins) if ins.opcode == OP_CODESEPARATOR => {}
            Ok(_) => stripped.extend_from_slice(&script_code[start..end]),
            Err(()) => {
                stripped.extend_from_slice(&script_code[start..]);
                break;
            }
        }
        start = end;
    }
    encoder.write_var_bytes(&stripped);
}

#[cfg(test)]
mod tests {
    use super::*;
    use coind_primitives::{OutPoint, TxIn, TxOut};

    fn two_in_one_out() -> Transaction {
        Transaction {
            version: 1,
            vin: vec![
                TxIn::new(OutPoint::new([1u8; 32], 0), Vec::new()),
                TxIn::new(OutPoint::new([2u8; 32], 1), Vec::new()),
            ],
            vout: vec![TxOut::new(5_000, vec![0x51])],
            lock_time: 0,
        }
    }

    #[test]
    fn single_without_matching_output_hashes_to_one() {
        let tx = two_in_one_out();
        assert_eq!(
            signature_hash(&tx, 1, &[0x51], SighashType(SIGHASH_SINGLE)),
            SIGHASH_ONE
        );
        assert_eq!(
            signature_hash(&tx, 7, &[0x51], SighashType(SIGHASH_ALL)),
            SIGHASH_ONE
        );
        assert_ne!(
            signature_hash(&tx, 0, &[0x51], SighashType(SIGHASH_SINGLE)),
            SIGHASH_ONE
        );
    }

    #[test]
    fn codeseparators_do_not_affect_digest() {
        let tx = two_in_one_out();
        let plain = signature_hash(&tx, 0, &[0x51, 0xac], SighashType(SIGHASH_ALL));
        let separated = signature_hash(
            &tx,
            0,
            &[OP_CODESEPARATOR, 0x51, OP_CODESEPARATOR, 0xac],
            SighashType(SIGHASH_ALL),
        );
        assert_eq!(plain, separated);
    }

    #[test]
    fn anyone_can_pay_ignores_other_inputs() {
        let mut tx = two_in_one_out();
        let ty = SighashType(SIGHASH_ALL | SIGHASH_ANYONECANPAY);
        let before = signature_hash(&tx, 0, &[0x51], ty);
        tx.vin[1].prevout.index = 9;
        assert_eq!(before, signature_hash(&tx, 0, &[0x51], ty));
        assert_ne!(before, signature_hash(&tx, 0, &[0x51], SighashType(SIGHASH_ALL)));
    }
}
