//! Bitcoin wire serialization.
//!
//! Integers are little-endian and fixed width. Lengths and counts use the
//! CompactSize prefix: one byte below `0xfd`, otherwise a `0xfd`/`0xfe`/`0xff`
//! marker followed by a 2, 4 or 8 byte value. Hashes are written in their
//! internal byte order, which is the reverse of how they are displayed.

use coind_consensus::Hash256;

/// Largest CompactSize a decoder accepts (32 MiB).
pub const MAX_SIZE: u64 = 0x0200_0000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    UnexpectedEof,
    NonCanonicalCompactSize,
    SizeTooLarge,
    InvalidData(&'static str),
    TrailingBytes,
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecodeError::UnexpectedEof => write!(f, "end of data"),
            DecodeError::NonCanonicalCompactSize => write!(f, "non-canonical ReadCompactSize()"),
            DecodeError::SizeTooLarge => write!(f, "ReadCompactSize(): size too large"),
            DecodeError::InvalidData(message) => write!(f, "{message}"),
            DecodeError::TrailingBytes => write!(f, "extra data after object"),
        }
    }
}

impl std::error::Error for DecodeError {}

/// Serialized length of the CompactSize prefix for `value`.
pub fn compact_size_len(value: u64) -> usize {
    match value {
        0..=0xfc => 1,
        0xfd..=0xffff => 3,
        0x1_0000..=0xffff_ffff => 5,
        _ => 9,
    }
}

macro_rules! le_writers {
    ($($name:ident: $ty:ty),* $(,)?) => {
        $(
            pub fn $name(&mut self, value: $ty) {
                self.buf.extend_from_slice(&value.to_le_bytes());
            }
        )*
    };
}

macro_rules! le_readers {
    ($($name:ident: $ty:ty),* $(,)?) => {
        $(
            pub fn $name(&mut self) -> Result<$ty, DecodeError> {
                Ok(<$ty>::from_le_bytes(self.read_fixed()?))
            }
        )*
    };
}

/// Append-only serialization buffer.
#[derive(Default)]
pub struct Encoder {
    buf: Vec<u8>,
}

impl Encoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn write_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    le_writers! {
        write_u16_le: u16,
        write_u32_le: u32,
        write_i32_le: i32,
        write_u64_le: u64,
        write_i64_le: i64,
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn write_compact_size(&mut self, value: u64) {
        match compact_size_len(value) {
            1 => self.write_u8(value as u8),
            3 => {
                self.write_u8(0xfd);
                self.write_u16_le(value as u16);
            }
            5 => {
                self.write_u8(0xfe);
                self.write_u32_le(value as u32);
            }
            _ => {
                self.write_u8(0xff);
                self.write_u64_le(value);
            }
        }
    }

    /// CompactSize length followed by the raw bytes.
    pub fn write_var_bytes(&mut self, bytes: &[u8]) {
        self.write_compact_size(bytes.len() as u64);
        self.write_bytes(bytes);
    }

    pub fn write_var_str(&mut self, value: &str) {
        self.write_var_bytes(value.as_bytes());
    }

    pub fn write_hash_le(&mut self, hash: &Hash256) {
        self.write_bytes(hash);
    }
}

/// Cursor over a borrowed byte slice.
pub struct Decoder<'a> {
    input: &'a [u8],
    cursor: usize,
}

impl<'a> Decoder<'a> {
    pub fn new(input: &'a [u8]) -> Self {
        Self { input, cursor: 0 }
    }

    pub fn position(&self) -> usize {
        self.cursor
    }

    pub fn remaining(&self) -> usize {
        self.input.len().saturating_sub(self.cursor)
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        let end = self
            .cursor
            .checked_add(len)
            .filter(|end| *end <= self.input.len())
            .ok_or(DecodeError::UnexpectedEof)?;
        let bytes = &self.input[self.cursor..end];
        self.cursor = end;
        Ok(bytes)
    }

    pub fn read_fixed<const N: usize>(&mut self) -> Result<[u8; N], DecodeError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub fn read_u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    le_readers! {
        read_u16_le: u16,
        read_u32_le: u32,
        read_i32_le: i32,
        read_u64_le: u64,
        read_i64_le: i64,
    }

    pub fn read_bool(&mut self) -> Result<bool, DecodeError> {
        Ok(self.read_u8()? != 0)
    }

    /// Reads a CompactSize, refusing encodings a shorter form could carry
    /// and values above [`MAX_SIZE`].
    pub fn read_compact_size(&mut self) -> Result<u64, DecodeError> {
        let (value, floor) = match self.read_u8()? {
            0xfd => (u64::from(self.read_u16_le()?), 0xfd),
            0xfe => (u64::from(self.read_u32_le()?), 0x1_0000),
            0xff => (self.read_u64_le()?, 0x1_0000_0000),
            small => return Ok(u64::from(small)),
        };
        if value < floor {
            return Err(DecodeError::NonCanonicalCompactSize);
        }
        if value > MAX_SIZE {
            return Err(DecodeError::SizeTooLarge);
        }
        Ok(value)
    }

    pub fn read_var_bytes(&mut self) -> Result<Vec<u8>, DecodeError> {
        let len = usize::try_from(self.read_compact_size()?).map_err(|_| DecodeError::SizeTooLarge)?;
        Ok(self.take(len)?.to_vec())
    }

    pub fn read_var_str(&mut self) -> Result<String, DecodeError> {
        String::from_utf8(self.read_var_bytes()?)
            .map_err(|_| DecodeError::InvalidData("string is not utf-8"))
    }

    pub fn read_hash_le(&mut self) -> Result<Hash256, DecodeError> {
        self.read_fixed()
    }
}

pub trait Encodable {
    fn consensus_encode(&self, encoder: &mut Encoder);
}

pub trait Decodable: Sized {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError>;
}

pub fn encode<T: Encodable>(value: &T) -> Vec<u8> {
    let mut encoder = Encoder::new();
    value.consensus_encode(&mut encoder);
    encoder.into_inner()
}

/// Decodes exactly one `T`; leftover input is an error.
pub fn decode<T: Decodable>(bytes: &[u8]) -> Result<T, DecodeError> {
    let mut decoder = Decoder::new(bytes);
    let value = T::consensus_decode(&mut decoder)?;
    if !decoder.is_empty() {
        return Err(DecodeError::TrailingBytes);
    }
    Ok(value)
}
