//! Transaction types and serialization.

use coind_consensus::money::{money_range, Amount};
use coind_consensus::Hash256;

use crate::encoding::{compact_size_len, Decodable, DecodeError, Decoder, Encodable, Encoder};
use crate::hash::sha256d;
use crate::outpoint::OutPoint;

/// Setting `sequence` to this value on every input disables `lock_time`.
pub const SEQUENCE_FINAL: u32 = 0xffff_ffff;
/// When set, the input carries no relative lock-time.
pub const SEQUENCE_LOCKTIME_DISABLE_FLAG: u32 = 1 << 31;
/// When set, the relative lock is in units of 512 seconds, otherwise blocks.
pub const SEQUENCE_LOCKTIME_TYPE_FLAG: u32 = 1 << 22;
pub const SEQUENCE_LOCKTIME_MASK: u32 = 0x0000_ffff;
/// Time-based relative locks are shifted by this many bits (512 s granularity).
pub const SEQUENCE_LOCKTIME_GRANULARITY: u32 = 9;

/// Inputs with a sequence below this value signal opt-in replaceability.
pub const MAX_BIP125_RBF_SEQUENCE: u32 = 0xffff_fffd;

pub const CURRENT_VERSION: i32 = 1;
pub const MAX_STANDARD_VERSION: i32 = 2;

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TxIn {
    pub prevout: OutPoint,
    pub script_sig: Vec<u8>,
    pub sequence: u32,
}

impl TxIn {
    pub fn new(prevout: OutPoint, script_sig: Vec<u8>) -> Self {
        Self {
            prevout,
            script_sig,
            sequence: SEQUENCE_FINAL,
        }
    }
}

impl Encodable for TxIn {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        self.prevout.consensus_encode(encoder);
        encoder.write_var_bytes(&self.script_sig);
        encoder.write_u32_le(self.sequence);
    }
}

impl Decodable for TxIn {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let prevout = OutPoint::consensus_decode(decoder)?;
        let script_sig = decoder.read_var_bytes()?;
        let sequence = decoder.read_u32_le()?;
        Ok(Self {
            prevout,
            script_sig,
            sequence,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TxOut {
    pub value: Amount,
    pub script_pubkey: Vec<u8>,
}

impl TxOut {
    pub fn new(value: Amount, script_pubkey: Vec<u8>) -> Self {
        Self {
            value,
            script_pubkey,
        }
    }

    /// Serialized size of this output.
    pub fn serialized_size(&self) -> usize {
        8 + compact_size_len(self.script_pubkey.len() as u64) + self.script_pubkey.len()
    }
}

impl Encodable for TxOut {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        encoder.write_i64_le(self.value);
        encoder.write_var_bytes(&self.script_pubkey);
    }
}

impl Decodable for TxOut {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let value = decoder.read_i64_le()?;
        let script_pubkey = decoder.read_var_bytes()?;
        Ok(Self {
            value,
            script_pubkey,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Transaction {
    pub version: i32,
    pub vin: Vec<TxIn>,
    pub vout: Vec<TxOut>,
    pub lock_time: u32,
}

impl Default for Transaction {
    fn default() -> Self {
        Self {
            version: CURRENT_VERSION,
            vin: Vec::new(),
            vout: Vec::new(),
            lock_time: 0,
        }
    }
}

impl Transaction {
    pub fn consensus_encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        Encodable::consensus_encode(self, &mut encoder);
        encoder.into_inner()
    }

    pub fn consensus_decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let tx = Self::decode_from(&mut decoder)?;
        if !decoder.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(tx)
    }

    pub fn decode_from(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        <Self as Decodable>::consensus_decode(decoder)
    }

    pub fn txid(&self) -> Hash256 {
        sha256d(&self.consensus_encode())
    }

    pub fn is_coinbase(&self) -> bool {
        self.vin.len() == 1 && self.vin[0].prevout.is_null()
    }

    pub fn serialized_size(&self) -> usize {
        let inputs: usize = self
            .vin
            .iter()
            .map(|input| {
                OutPoint::SIZE
                    + compact_size_len(input.script_sig.len() as u64)
                    + input.script_sig.len()
                    + 4
            })
            .sum();
        let outputs: usize = self.vout.iter().map(TxOut::serialized_size).sum();
        4 + compact_size_len(self.vin.len() as u64)
            + inputs
            + compact_size_len(self.vout.len() as u64)
            + outputs
            + 4
    }

    /// Sum of output values, or `None` if any value or the running total
    /// leaves the money range.
    pub fn value_out(&self) -> Option<Amount> {
        let mut total: Amount = 0;
        for output in &self.vout {
            if !money_range(output.value) {
                return None;
            }
            total = total.checked_add(output.value)?;
            if !money_range(total) {
                return None;
            }
        }
        Some(total)
    }

    /// Size used for priority: each input is discounted by its outpoint,
    /// sequence and up to 110 bytes of script so spending is not penalised.
    pub fn modified_size(&self, size: usize) -> usize {
        let mut size = size;
        for input in &self.vin {
            let offset = 41 + input.script_sig.len().min(110);
            if size > offset {
                size -= offset;
            }
        }
        size
    }

    /// Priority after inputs worth `value_in` have aged to `priority_inputs`
    /// (sum of value * confirmations).
    pub fn compute_priority(&self, priority_inputs: f64, size: usize) -> f64 {
        let modified = self.modified_size(size);
        if modified == 0 {
            return 0.0;
        }
        priority_inputs / modified as f64
    }

    /// True when any input opts in to replacement.
    pub fn signals_replacement(&self) -> bool {
        self.vin
            .iter()
            .any(|input| input.sequence <= MAX_BIP125_RBF_SEQUENCE)
    }
}

impl Encodable for Transaction {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        encoder.write_i32_le(self.version);
        encoder.write_compact_size(self.vin.len() as u64);
        for input in &self.vin {
            input.consensus_encode(encoder);
        }
        encoder.write_compact_size(self.vout.len() as u64);
        for output in &self.vout {
            output.consensus_encode(encoder);
        }
        encoder.write_u32_le(self.lock_time);
    }
}

impl Decodable for Transaction {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let version = decoder.read_i32_le()?;
        let vin = read_vec::<TxIn>(decoder)?;
        let vout = read_vec::<TxOut>(decoder)?;
        let lock_time = decoder.read_u32_le()?;
        Ok(Self {
            version,
            vin,
            vout,
            lock_time,
        })
    }
}

pub(crate) fn read_vec<T: Decodable>(decoder: &mut Decoder) -> Result<Vec<T>, DecodeError> {
    let count = decoder.read_compact_size()?;
    let count = usize::try_from(count).map_err(|_| DecodeError::SizeTooLarge)?;
    // Each element consumes at least one byte; cap the allocation by what is left.
    let mut items = Vec::with_capacity(count.min(decoder.remaining()));
    for _ in 0..count {
        items.push(T::consensus_decode(decoder)?);
    }
    Ok(items)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spend(hash_byte: u8, index: u32, sequence: u32) -> TxIn {
        TxIn {
            prevout: OutPoint::new([hash_byte; 32], index),
            script_sig: vec![0x51],
            sequence,
        }
    }

    #[test]
    fn serialized_size_matches_encoding() {
        let tx = Transaction {
            version: 2,
            vin: vec![spend(1, 0, SEQUENCE_FINAL), spend(2, 7, 10)],
            vout: vec![TxOut::new(5_000, vec![0x76; 300]), TxOut::new(1, Vec::new())],
            lock_time: 99,
        };
        assert_eq!(tx.serialized_size(), tx.consensus_encode().len());
    }

    #[test]
    fn value_out_rejects_overflow() {
        let big = coind_consensus::money::MAX_MONEY;
        let tx = Transaction {
            vout: vec![TxOut::new(big, Vec::new()), TxOut::new(1, Vec::new())],
            ..Transaction::default()
        };
        assert_eq!(tx.value_out(), None);

        let negative = Transaction {
            vout: vec![TxOut::new(-1, Vec::new())],
            ..Transaction::default()
        };
        assert_eq!(negative.value_out(), None);
    }

    #[test]
    fn coinbase_requires_single_null_input() {
        let mut tx = Transaction {
            vin: vec![TxIn::new(OutPoint::null(), vec![1, 2])],
            ..Transaction::default()
        };
        assert!(tx.is_coinbase());
        tx.vin.push(spend(3, 0, SEQUENCE_FINAL));
        assert!(!tx.is_coinbase());
    }

    #[test]
    fn replacement_signal_uses_sequence_threshold() {
        let mut tx = Transaction {
            vin: vec![spend(1, 0, SEQUENCE_FINAL - 1)],
            ..Transaction::default()
        };
        assert!(!tx.signals_replacement());
        tx.vin[0].sequence = MAX_BIP125_RBF_SEQUENCE;
        assert!(tx.signals_replacement());
    }

    #[test]
    fn modified_size_discounts_inputs() {
        let tx = Transaction {
            vin: vec![spend(1, 0, SEQUENCE_FINAL)],
            vout: vec![TxOut::new(1, vec![0x51])],
            ..Transaction::default()
        };
        let size = tx.serialized_size();
        assert_eq!(tx.modified_size(size), size - 42);
    }
}
