//! Typed network messages and their payload encodings. Framing and sockets
//! live outside the node core; a message here is a command name plus the
//! payload bytes that follow the frame header.

use std::fmt;

use coind_consensus::constants::PROTOCOL_VERSION;
use coind_consensus::Hash256;
use coind_primitives::block::{Block, BlockHeader};
use coind_primitives::encoding::{DecodeError, Decoder, Encodable, Encoder};
use coind_primitives::transaction::Transaction;

pub const MSG_TX: u32 = 1;
pub const MSG_BLOCK: u32 = 2;
pub const NODE_NETWORK: u64 = 1;

/// Longest command name that fits a frame header.
pub const COMMAND_SIZE: usize = 12;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct Inv {
    pub inv_type: u32,
    pub hash: Hash256,
}

impl Inv {
    pub fn tx(hash: Hash256) -> Self {
        Self {
            inv_type: MSG_TX,
            hash,
        }
    }

    pub fn block(hash: Hash256) -> Self {
        Self {
            inv_type: MSG_BLOCK,
            hash,
        }
    }

    pub fn is_known_type(&self) -> bool {
        matches!(self.inv_type, MSG_TX | MSG_BLOCK)
    }
}

impl fmt::Display for Inv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.inv_type {
            MSG_TX => "tx",
            MSG_BLOCK => "block",
            _ => "unknown",
        };
        write!(f, "{kind} {}", coind_consensus::hash256_to_hex(&self.hash))
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct VersionMessage {
    pub version: i32,
    pub services: u64,
    pub timestamp: i64,
    pub nonce: u64,
    pub user_agent: String,
    pub start_height: i32,
    pub relay: bool,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum NetMessage {
    Version(VersionMessage),
    Verack,
    Inv(Vec<Inv>),
    GetData(Vec<Inv>),
    NotFound(Vec<Inv>),
    GetBlocks {
        locator: Vec<Hash256>,
        stop: Hash256,
    },
    GetHeaders {
        locator: Vec<Hash256>,
        stop: Hash256,
    },
    Headers(Vec<BlockHeader>),
    Block(Block),
    Tx(Transaction),
    Mempool,
    Ping(u64),
    Pong(u64),
    Reject {
        message: String,
        code: u8,
        reason: String,
        hash: Option<Hash256>,
    },
    SendHeaders,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    UnknownCommand(String),
    Decode(DecodeError),
}

impl fmt::Display for WireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WireError::UnknownCommand(command) => write!(f, "unknown command '{command}'"),
            WireError::Decode(err) => write!(f, "malformed payload: {err}"),
        }
    }
}

impl std::error::Error for WireError {}

impl From<DecodeError> for WireError {
    fn from(err: DecodeError) -> Self {
        WireError::Decode(err)
    }
}

impl NetMessage {
    pub fn command(&self) -> &'static str {
        match self {
            NetMessage::Version(_) => "version",
            NetMessage::Verack => "verack",
            NetMessage::Inv(_) => "inv",
            NetMessage::GetData(_) => "getdata",
            NetMessage::NotFound(_) => "notfound",
            NetMessage::GetBlocks { .. } => "getblocks",
            NetMessage::GetHeaders { .. } => "getheaders",
            NetMessage::Headers(_) => "headers",
            NetMessage::Block(_) => "block",
            NetMessage::Tx(_) => "tx",
            NetMessage::Mempool => "mempool",
            NetMessage::Ping(_) => "ping",
            NetMessage::Pong(_) => "pong",
            NetMessage::Reject { .. } => "reject",
            NetMessage::SendHeaders => "sendheaders",
        }
    }

    pub fn encode_payload(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        match self {
            NetMessage::Version(version) => {
                encoder.write_i32_le(version.version);
                encoder.write_u64_le(version.services);
                encoder.write_i64_le(version.timestamp);
                write_net_addr(&mut encoder, version.services);
                write_net_addr(&mut encoder, version.services);
                encoder.write_u64_le(version.nonce);
                encoder.write_var_str(&version.user_agent);
                encoder.write_i32_le(version.start_height);
                encoder.write_u8(version.relay as u8);
            }
            NetMessage::Verack | NetMessage::Mempool | NetMessage::SendHeaders => {}
            NetMessage::Inv(items) | NetMessage::GetData(items) | NetMessage::NotFound(items) => {
                encoder.write_compact_size(items.len() as u64);
                for item in items {
                    encoder.write_u32_le(item.inv_type);
                    encoder.write_hash_le(&item.hash);
                }
            }
            NetMessage::GetBlocks { locator, stop } | NetMessage::GetHeaders { locator, stop } => {
                encoder.write_i32_le(PROTOCOL_VERSION);
                encoder.write_compact_size(locator.len() as u64);
                for hash in locator {
                    encoder.write_hash_le(hash);
                }
                encoder.write_hash_le(stop);
            }
            NetMessage::Headers(headers) => {
                encoder.write_compact_size(headers.len() as u64);
                for header in headers {
                    Encodable::consensus_encode(header, &mut encoder);
                    encoder.write_compact_size(0);
                }
            }
            NetMessage::Block(block) => return block.consensus_encode(),
            NetMessage::Tx(tx) => encoder.write_bytes(&tx.consensus_encode()),
            NetMessage::Ping(nonce) | NetMessage::Pong(nonce) => encoder.write_u64_le(*nonce),
            NetMessage::Reject {
                message,
                code,
                reason,
                hash,
            } => {
                encoder.write_var_str(message);
                encoder.write_u8(*code);
                encoder.write_var_str(reason);
                if let Some(hash) = hash {
                    encoder.write_hash_le(hash);
                }
            }
        }
        encoder.into_inner()
    }

    pub fn decode_payload(command: &str, payload: &[u8]) -> Result<Self, WireError> {
        let mut decoder = Decoder::new(payload);
        let message = match command {
            "version" => NetMessage::Version(read_version(&mut decoder)?),
            "verack" => NetMessage::Verack,
            "inv" => NetMessage::Inv(read_inv(&mut decoder)?),
            "getdata" => NetMessage::GetData(read_inv(&mut decoder)?),
            "notfound" => NetMessage::NotFound(read_inv(&mut decoder)?),
            "getblocks" => {
                let (locator, stop) = read_locator(&mut decoder)?;
                NetMessage::GetBlocks { locator, stop }
            }
            "getheaders" => {
                let (locator, stop) = read_locator(&mut decoder)?;
                NetMessage::GetHeaders { locator, stop }
            }
            "headers" => NetMessage::Headers(read_headers(&mut decoder)?),
            "block" => NetMessage::Block(Block::consensus_decode_from(&mut decoder)?),
            "tx" => NetMessage::Tx(Transaction::decode_from(&mut decoder)?),
            "mempool" => NetMessage::Mempool,
            "ping" => NetMessage::Ping(decoder.read_u64_le()?),
            "pong" => NetMessage::Pong(decoder.read_u64_le()?),
            "reject" => {
                let message = decoder.read_var_str()?;
                let code = decoder.read_u8()?;
                let reason = decoder.read_var_str()?;
                let hash = if decoder.remaining() >= 32 {
                    Some(decoder.read_hash_le()?)
                } else {
                    None
                };
                NetMessage::Reject {
                    message,
                    code,
                    reason,
                    hash,
                }
            }
            "sendheaders" => NetMessage::SendHeaders,
            other => return Err(WireError::UnknownCommand(other.to_string())),
        };
        if !decoder.is_empty() {
            return Err(WireError::Decode(DecodeError::TrailingBytes));
        }
        Ok(message)
    }
}

fn write_net_addr(encoder: &mut Encoder, services: u64) {
    encoder.write_u64_le(services);
    encoder.write_bytes(&[0u8; 16]);
    encoder.write_bytes(&0u16.to_be_bytes());
}

fn read_net_addr(decoder: &mut Decoder) -> Result<(), DecodeError> {
    decoder.read_u64_le()?;
    decoder.read_fixed::<16>()?;
    decoder.read_fixed::<2>()?;
    Ok(())
}

fn read_version(decoder: &mut Decoder) -> Result<VersionMessage, DecodeError> {
    let version = decoder.read_i32_le()?;
    let services = decoder.read_u64_le()?;
    let timestamp = decoder.read_i64_le()?;
    read_net_addr(decoder)?;
    // Fields after the receiving address are optional for ancient peers.
    let mut message = VersionMessage {
        version,
        services,
        timestamp,
        nonce: 0,
        user_agent: String::new(),
        start_height: 0,
        relay: true,
    };
    if decoder.is_empty() {
        return Ok(message);
    }
    read_net_addr(decoder)?;
    message.nonce = decoder.read_u64_le()?;
    if decoder.is_empty() {
        return Ok(message);
    }
    message.user_agent = decoder.read_var_str()?;
    if decoder.is_empty() {
        return Ok(message);
    }
    message.start_height = decoder.read_i32_le()?;
    if !decoder.is_empty() {
        message.relay = decoder.read_bool()?;
    }
    Ok(message)
}

fn read_inv(decoder: &mut Decoder) -> Result<Vec<Inv>, DecodeError> {
    let count = decoder.read_compact_size()?;
    let mut items = Vec::with_capacity(count.min(1024) as usize);
    for _ in 0..count {
        let inv_type = decoder.read_u32_le()?;
        let hash = decoder.read_hash_le()?;
        items.push(Inv { inv_type, hash });
    }
    Ok(items)
}

fn read_locator(decoder: &mut Decoder) -> Result<(Vec<Hash256>, Hash256), DecodeError> {
    let _version = decoder.read_i32_le()?;
    let count = decoder.read_compact_size()?;
    let mut locator = Vec::with_capacity(count.min(128) as usize);
    for _ in 0..count {
        locator.push(decoder.read_hash_le()?);
    }
    let stop = decoder.read_hash_le()?;
    Ok((locator, stop))
}

fn read_headers(decoder: &mut Decoder) -> Result<Vec<BlockHeader>, DecodeError> {
    let count = decoder.read_compact_size()?;
    let mut headers = Vec::with_capacity(count.min(2000) as usize);
    for _ in 0..count {
        headers.push(BlockHeader::consensus_decode_from(decoder)?);
        // Headers messages carry an always-zero transaction count.
        decoder.read_compact_size()?;
    }
    Ok(headers)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(message: NetMessage) -> NetMessage {
        let payload = message.encode_payload();
        NetMessage::decode_payload(message.command(), &payload).expect("decode")
    }

    #[test]
    fn locator_messages_carry_the_stop_hash() {
        let message = NetMessage::GetHeaders {
            locator: vec![[1; 32], [2; 32]],
            stop: [3; 32],
        };
        assert_eq!(round_trip(message.clone()), message);
        let payload = message.encode_payload();
        assert_eq!(&payload[..4], &PROTOCOL_VERSION.to_le_bytes());
    }

    #[test]
    fn headers_include_zero_tx_counts() {
        let header = BlockHeader {
            version: 4,
            prev_block: [9; 32],
            merkle_root: [8; 32],
            time: 1_500_000_000,
            bits: 0x207f_ffff,
            nonce: 7,
        };
        let message = NetMessage::Headers(vec![header.clone(), header]);
        let payload = message.encode_payload();
        assert_eq!(payload.len(), 1 + 2 * 81);
        assert_eq!(round_trip(message.clone()), message);
    }

    #[test]
    fn short_version_defaults_the_optional_fields() {
        let mut encoder = Encoder::new();
        encoder.write_i32_le(209);
        encoder.write_u64_le(NODE_NETWORK);
        encoder.write_i64_le(1_000);
        write_net_addr(&mut encoder, NODE_NETWORK);
        let payload = encoder.into_inner();
        let NetMessage::Version(version) =
            NetMessage::decode_payload("version", &payload).expect("decode")
        else {
            panic!("not a version message");
        };
        assert_eq!(version.version, 209);
        assert!(version.relay);
        assert_eq!(version.start_height, 0);
    }

    #[test]
    fn reject_hash_is_optional() {
        let message = NetMessage::Reject {
            message: "tx".to_string(),
            code: 0x42,
            reason: "insufficient fee".to_string(),
            hash: None,
        };
        assert_eq!(round_trip(message.clone()), message);
        let with_hash = NetMessage::Reject {
            message: "block".to_string(),
            code: 0x10,
            reason: "bad-blk-length".to_string(),
            hash: Some([5; 32]),
        };
        assert_eq!(round_trip(with_hash.clone()), with_hash);
    }

    #[test]
    fn unknown_commands_and_trailing_bytes_fail() {
        assert!(matches!(
            NetMessage::decode_payload("alert", &[]),
            Err(WireError::UnknownCommand(_))
        ));
        assert_eq!(
            NetMessage::decode_payload("verack", &[0]),
            Err(WireError::Decode(DecodeError::TrailingBytes))
        );
        assert!(NetMessage::decode_payload("ping", &[1, 2]).is_err());
    }
}
