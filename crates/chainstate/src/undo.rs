//! Undo records that reverse the coin changes of a connected block.

use coind_consensus::Hash256;
use coind_primitives::encoding::{Decodable, DecodeError, Decoder, Encodable, Encoder};
use coind_primitives::hash::sha256d;
use coind_primitives::outpoint::OutPoint;
use coind_primitives::transaction::TxOut;
use coind_storage::StoreError;

use crate::coins::CoinsViewCache;

/// One spent output. `height`, `is_coinbase` and `version` are only
/// meaningful (height nonzero) when the spend emptied the record.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TxInUndo {
    pub txout: TxOut,
    pub height: i32,
    pub is_coinbase: bool,
    pub version: i32,
}

impl TxInUndo {
    pub fn new(txout: TxOut) -> Self {
        Self {
            txout,
            height: 0,
            is_coinbase: false,
            version: 0,
        }
    }
}

impl Encodable for TxInUndo {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        let code = (self.height.max(0) as u64) * 2 + u64::from(self.is_coinbase);
        encoder.write_compact_size(code);
        if self.height > 0 {
            encoder.write_i32_le(self.version);
        }
        self.txout.consensus_encode(encoder);
    }
}

impl Decodable for TxInUndo {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let code = decoder.read_compact_size()?;
        let height = i32::try_from(code / 2).map_err(|_| DecodeError::InvalidData("undo height"))?;
        let is_coinbase = code & 1 != 0;
        let version = if height > 0 { decoder.read_i32_le()? } else { 0 };
        let txout = TxOut::consensus_decode(decoder)?;
        Ok(Self {
            txout,
            height,
            is_coinbase,
            version,
        })
    }
}

/// Undo information for every input of one transaction.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct TxUndo {
    pub prevouts: Vec<TxInUndo>,
}

impl Encodable for TxUndo {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        encoder.write_compact_size(self.prevouts.len() as u64);
        for prevout in &self.prevouts {
            prevout.consensus_encode(encoder);
        }
    }
}

impl Decodable for TxUndo {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let count = decoder.read_compact_size()? as usize;
        let mut prevouts = Vec::with_capacity(count.min(4096));
        for _ in 0..count {
            prevouts.push(TxInUndo::consensus_decode(decoder)?);
        }
        Ok(Self { prevouts })
    }
}

/// Undo information for all non-coinbase transactions of a block.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct BlockUndo {
    pub txs: Vec<TxUndo>,
}

impl BlockUndo {
    pub fn encode(&self) -> Vec<u8> {
        coind_primitives::encoding::encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        coind_primitives::encoding::decode(bytes)
    }
}

impl Encodable for BlockUndo {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        encoder.write_compact_size(self.txs.len() as u64);
        for tx in &self.txs {
            tx.consensus_encode(encoder);
        }
    }
}

impl Decodable for BlockUndo {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let count = decoder.read_compact_size()? as usize;
        let mut txs = Vec::with_capacity(count.min(4096));
        for _ in 0..count {
            txs.push(TxUndo::consensus_decode(decoder)?);
        }
        Ok(Self { txs })
    }
}

/// Checksum stored after an undo record: binds the payload to the block it
/// builds on.
pub fn undo_checksum(prev_block: &Hash256, payload: &[u8]) -> Hash256 {
    let mut data = Vec::with_capacity(32 + payload.len());
    data.extend_from_slice(prev_block);
    data.extend_from_slice(payload);
    sha256d(&data)
}

/// Puts a spent output back. Returns `false` when the view was not in the
/// state the undo record expects; the output is restored regardless.
pub fn apply_tx_in_undo(
    undo: &TxInUndo,
    view: &mut CoinsViewCache<'_>,
    out: &OutPoint,
) -> Result<bool, StoreError> {
    view.modify_coins(&out.hash, |coins| {
        let mut clean = true;
        if undo.height != 0 {
            if !coins.is_pruned() {
                coind_log::log_error!("undo data overwriting existing transaction {out}");
                clean = false;
            }
            coins.clear();
            coins.is_coinbase = undo.is_coinbase;
            coins.height = undo.height;
            coins.version = undo.version;
        } else if coins.is_pruned() {
            coind_log::log_error!("undo data adding output to missing transaction {out}");
            clean = false;
        }
        if coins.is_available(out.index) {
            coind_log::log_error!("undo data overwriting existing output {out}");
            clean = false;
        }
        let index = out.index as usize;
        if coins.outputs.len() <= index {
            coins.outputs.resize(index + 1, None);
        }
        coins.outputs[index] = Some(undo.txout.clone());
        clean
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_undo_encoding_keeps_metadata_only_when_present() {
        let undo = BlockUndo {
            txs: vec![TxUndo {
                prevouts: vec![
                    TxInUndo::new(TxOut::new(5_000, vec![0x51])),
                    TxInUndo {
                        txout: TxOut::new(7, vec![0x00, 0x14]),
                        height: 120,
                        is_coinbase: true,
                        version: 2,
                    },
                ],
            }],
        };
        let bytes = undo.encode();
        assert_eq!(BlockUndo::decode(&bytes).expect("decode"), undo);
        // First prevout: code 0, no version, value and one-byte script.
        assert_eq!(&bytes[2..4], &[0x00, 0x88]);
    }

    #[test]
    fn checksum_depends_on_previous_block() {
        let payload = BlockUndo::default().encode();
        assert_ne!(
            undo_checksum(&[1u8; 32], &payload),
            undo_checksum(&[2u8; 32], &payload)
        );
    }
}
