use coind_primitives::encoding::{DecodeError, Decoder, Encoder};

pub const META_LAST_BLOCK_FILE_KEY: &[u8] = b"last_block_file";
pub const META_REINDEXING_KEY: &[u8] = b"reindexing";

/// Statistics for one `blk?????.dat`/`rev?????.dat` pair.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct BlockFileInfo {
    pub blocks: u32,
    /// Bytes used in the block file.
    pub size: u32,
    /// Bytes used in the undo file.
    pub undo_size: u32,
    pub height_first: i32,
    pub height_last: i32,
    pub time_first: u32,
    pub time_last: u32,
}

impl BlockFileInfo {
    pub fn add_block(&mut self, height: i32, time: u32) {
        if self.blocks == 0 || height < self.height_first {
            self.height_first = height;
        }
        if self.blocks == 0 || time < self.time_first {
            self.time_first = time;
        }
        self.blocks += 1;
        if height > self.height_last {
            self.height_last = height;
        }
        if time > self.time_last {
            self.time_last = time;
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        encoder.write_compact_size(self.blocks as u64);
        encoder.write_compact_size(self.size as u64);
        encoder.write_compact_size(self.undo_size as u64);
        encoder.write_i32_le(self.height_first);
        encoder.write_i32_le(self.height_last);
        encoder.write_u32_le(self.time_first);
        encoder.write_u32_le(self.time_last);
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let blocks = read_u32_compact_size(&mut decoder)?;
        let size = read_u32_compact_size(&mut decoder)?;
        let undo_size = read_u32_compact_size(&mut decoder)?;
        let height_first = decoder.read_i32_le()?;
        let height_last = decoder.read_i32_le()?;
        let time_first = decoder.read_u32_le()?;
        let time_last = decoder.read_u32_le()?;
        if !decoder.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(Self {
            blocks,
            size,
            undo_size,
            height_first,
            height_last,
            time_first,
            time_last,
        })
    }
}

impl std::fmt::Display for BlockFileInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "blocks={}, size={}, heights={}...{}, time={}...{}",
            self.blocks,
            self.size,
            self.height_first,
            self.height_last,
            coind_log::format_unix_time(self.time_first as i64),
            coind_log::format_unix_time(self.time_last as i64),
        )
    }
}

fn read_u32_compact_size(decoder: &mut Decoder) -> Result<u32, DecodeError> {
    u32::try_from(decoder.read_compact_size()?).map_err(|_| DecodeError::InvalidData("file size"))
}

/// Big-endian so a prefix scan returns files in order.
pub fn block_file_info_key(file: u32) -> [u8; 4] {
    file.to_be_bytes()
}

pub fn parse_block_file_info_key(key: &[u8]) -> Option<u32> {
    let bytes: [u8; 4] = key.try_into().ok()?;
    Some(u32::from_be_bytes(bytes))
}
