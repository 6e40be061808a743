//! Block header and block types.

use coind_consensus::{GenesisParams, Hash256};

use crate::encoding::{compact_size_len, DecodeError, Decoder, Encodable, Encoder};
use crate::hash::sha256d;
use crate::merkle::compute_merkle_root;
use crate::outpoint::OutPoint;
use crate::transaction::{read_vec, Transaction, TxIn, TxOut};

pub const HEADER_SIZE: usize = 80;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BlockHeader {
    pub version: i32,
    pub prev_block: Hash256,
    pub merkle_root: Hash256,
    pub time: u32,
    pub bits: u32,
    pub nonce: u32,
}

impl BlockHeader {
    pub fn consensus_encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        Encodable::consensus_encode(self, &mut encoder);
        encoder.into_inner()
    }

    pub fn hash(&self) -> Hash256 {
        sha256d(&self.consensus_encode())
    }

    pub fn is_null(&self) -> bool {
        self.bits == 0
    }

    pub fn consensus_decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let header = Self::consensus_decode_from(&mut decoder)?;
        if !decoder.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(header)
    }

    pub fn consensus_decode_from(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        Ok(Self {
            version: decoder.read_i32_le()?,
            prev_block: decoder.read_hash_le()?,
            merkle_root: decoder.read_hash_le()?,
            time: decoder.read_u32_le()?,
            bits: decoder.read_u32_le()?,
            nonce: decoder.read_u32_le()?,
        })
    }
}

impl Encodable for BlockHeader {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        encoder.write_i32_le(self.version);
        encoder.write_hash_le(&self.prev_block);
        encoder.write_hash_le(&self.merkle_root);
        encoder.write_u32_le(self.time);
        encoder.write_u32_le(self.bits);
        encoder.write_u32_le(self.nonce);
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
}

impl Block {
    pub fn hash(&self) -> Hash256 {
        self.header.hash()
    }

    pub fn consensus_encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        Encodable::consensus_encode(&self.header, &mut encoder);
        encoder.write_compact_size(self.transactions.len() as u64);
        for tx in &self.transactions {
            Encodable::consensus_encode(tx, &mut encoder);
        }
        encoder.into_inner()
    }

    pub fn consensus_decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let block = Self::consensus_decode_from(&mut decoder)?;
        if !decoder.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(block)
    }

    pub fn consensus_decode_from(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let header = BlockHeader::consensus_decode_from(decoder)?;
        let transactions = read_vec::<Transaction>(decoder)?;
        Ok(Self {
            header,
            transactions,
        })
    }

    pub fn serialized_size(&self) -> usize {
        HEADER_SIZE
            + compact_size_len(self.transactions.len() as u64)
            + self
                .transactions
                .iter()
                .map(Transaction::serialized_size)
                .sum::<usize>()
    }

    pub fn txids(&self) -> Vec<Hash256> {
        self.transactions.iter().map(Transaction::txid).collect()
    }

    /// Merkle root over the transaction ids plus the duplicate-subtree flag.
    pub fn merkle_root_with_mutation(&self) -> (Hash256, bool) {
        compute_merkle_root(&self.txids())
    }

    pub fn merkle_root(&self) -> Hash256 {
        self.merkle_root_with_mutation().0
    }
}

/// Builds the hard-coded first block of a network.
pub fn genesis_block(params: &GenesisParams) -> Block {
    let coinbase = Transaction {
        version: 1,
        vin: vec![TxIn::new(
            OutPoint::null(),
            params.coinbase_script_sig.clone(),
        )],
        vout: vec![TxOut::new(
            params.reward,
            params.coinbase_script_pubkey.clone(),
        )],
        lock_time: 0,
    };
    let mut block = Block {
        header: BlockHeader {
            version: params.version,
            prev_block: [0u8; 32],
            merkle_root: [0u8; 32],
            time: params.time,
            bits: params.bits,
            nonce: params.nonce,
        },
        transactions: vec![coinbase],
    };
    block.header.merkle_root = block.merkle_root();
    block
}
