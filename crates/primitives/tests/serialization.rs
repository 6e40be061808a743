use coind_consensus::{chain_params, hash256_from_hex, Hash256, Network};
use coind_primitives::block::{genesis_block, Block, BlockHeader, HEADER_SIZE};
use coind_primitives::encoding::{DecodeError, Decoder, Encoder};
use coind_primitives::outpoint::OutPoint;
use coind_primitives::transaction::{Transaction, TxIn, TxOut};

fn seq_hash(start: u8) -> Hash256 {
    std::array::from_fn(|i| start.wrapping_add(i as u8))
}

fn push_hash_le(buffer: &mut Vec<u8>, start: u8) {
    for byte in 0u8..=0x1f {
        buffer.push(start.wrapping_add(byte));
    }
}

#[test]
fn serialize_block_header() {
    let header = BlockHeader {
        version: 4,
        prev_block: seq_hash(0x00),
        merkle_root: seq_hash(0x20),
        time: 0x01020304,
        bits: 0x0a0b0c0d,
        nonce: 0xdeadbeef,
    };

    let encoded = header.consensus_encode();
    let mut expected = Vec::new();
    expected.extend_from_slice(&4i32.to_le_bytes());
    push_hash_le(&mut expected, 0x00);
    push_hash_le(&mut expected, 0x20);
    expected.extend_from_slice(&0x01020304u32.to_le_bytes());
    expected.extend_from_slice(&0x0a0b0c0du32.to_le_bytes());
    expected.extend_from_slice(&0xdeadbeefu32.to_le_bytes());

    assert_eq!(encoded.len(), HEADER_SIZE);
    assert_eq!(encoded, expected);
    let decoded = BlockHeader::consensus_decode(&encoded).expect("decode header");
    assert_eq!(decoded, header);
}

#[test]
fn serialize_transaction_v1() {
    let tx = Transaction {
        version: 1,
        vin: vec![TxIn {
            prevout: OutPoint {
                hash: seq_hash(0x10),
                index: 1,
            },
            script_sig: vec![0x51],
            sequence: 0xffff_ffff,
        }],
        vout: vec![TxOut {
            value: 50,
            script_pubkey: vec![0x51],
        }],
        lock_time: 0,
    };

    let encoded = tx.consensus_encode();
    let mut expected = Vec::new();
    expected.extend_from_slice(&1u32.to_le_bytes());
    expected.push(1);
    push_hash_le(&mut expected, 0x10);
    expected.extend_from_slice(&1u32.to_le_bytes());
    expected.push(1);
    expected.push(0x51);
    expected.extend_from_slice(&0xffff_ffffu32.to_le_bytes());
    expected.push(1);
    expected.extend_from_slice(&50i64.to_le_bytes());
    expected.push(1);
    expected.push(0x51);
    expected.extend_from_slice(&0u32.to_le_bytes());

    assert_eq!(encoded, expected);
    assert_eq!(Transaction::consensus_decode(&encoded).expect("decode"), tx);
}

#[test]
fn mainnet_genesis_hash_and_merkle_root() {
    let params = chain_params(Network::Mainnet);
    let genesis = genesis_block(&params.genesis);
    assert_eq!(
        genesis.header.merkle_root,
        hash256_from_hex("4a5e1e4baab89f3a32518a88c31bc87f618f76673e2cc77ab2127b7afdeda33b")
            .expect("merkle hex")
    );
    assert_eq!(genesis.hash(), params.consensus.hash_genesis_block);
    assert_eq!(genesis.serialized_size(), 285);
}

#[test]
fn regtest_and_testnet_genesis_hashes() {
    for network in [Network::Testnet, Network::Regtest] {
        let params = chain_params(network);
        let genesis = genesis_block(&params.genesis);
        assert_eq!(genesis.hash(), params.consensus.hash_genesis_block, "{network:?}");
    }
}

#[test]
fn block_roundtrip_rejects_trailing_bytes() {
    let genesis = genesis_block(&chain_params(Network::Regtest).genesis);
    let mut bytes = genesis.consensus_encode();
    assert_eq!(Block::consensus_decode(&bytes).expect("decode"), genesis);
    bytes.push(0);
    assert_eq!(
        Block::consensus_decode(&bytes).expect_err("trailing"),
        DecodeError::TrailingBytes
    );
}

#[test]
fn compactsize_rejects_noncanonical() {
    let cases = [
        vec![0xfd, 0xfc, 0x00],
        vec![0xfe, 0xff, 0x00, 0x00, 0x00],
        vec![0xff, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00],
    ];
    for bytes in cases {
        let mut decoder = Decoder::new(&bytes);
        let err = decoder.read_compact_size().expect_err("noncanonical compactsize");
        assert_eq!(err, DecodeError::NonCanonicalCompactSize);
    }

    let mut encoder = Encoder::new();
    encoder.write_compact_size(0x1_0000);
    let bytes = encoder.into_inner();
    assert_eq!(bytes, vec![0xfe, 0x00, 0x00, 0x01, 0x00]);
}
