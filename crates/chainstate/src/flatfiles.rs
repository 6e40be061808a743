//! Append-style block and undo files.
//!
//! Every record is `magic(4) ‖ len(4, LE) ‖ payload`, optionally followed by
//! a 32-byte trailer (undo checksums). Positions handed out point at the
//! payload, not at the record header.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use coind_consensus::Hash256;

/// Largest block file before rolling to the next one.
pub const MAX_BLOCKFILE_SIZE: u64 = 0x800_0000;
/// Size of the record header in front of every payload.
pub const RECORD_HEADER_SIZE: u32 = 8;

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash)]
pub struct FileLocation {
    pub file: u32,
    pub pos: u32,
}

impl FileLocation {
    pub fn new(file: u32, pos: u32) -> Self {
        Self { file, pos }
    }

    pub fn encode(&self) -> [u8; 8] {
        let mut out = [0u8; 8];
        out[0..4].copy_from_slice(&self.file.to_le_bytes());
        out[4..8].copy_from_slice(&self.pos.to_le_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != 8 {
            return None;
        }
        let file = u32::from_le_bytes(bytes[0..4].try_into().ok()?);
        let pos = u32::from_le_bytes(bytes[4..8].try_into().ok()?);
        Some(Self { file, pos })
    }
}

#[derive(Debug)]
pub enum FlatFileError {
    Io(std::io::Error),
    InvalidLocation,
    LengthMismatch,
    BadMagic,
}

impl std::fmt::Display for FlatFileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FlatFileError::Io(err) => write!(f, "{err}"),
            FlatFileError::InvalidLocation => write!(f, "invalid flatfile location"),
            FlatFileError::LengthMismatch => write!(f, "flatfile length mismatch"),
            FlatFileError::BadMagic => write!(f, "flatfile record has wrong network magic"),
        }
    }
}

impl std::error::Error for FlatFileError {}

impl From<std::io::Error> for FlatFileError {
    fn from(err: std::io::Error) -> Self {
        FlatFileError::Io(err)
    }
}

/// A directory of numbered files sharing one prefix (`blk` or `rev`).
pub struct FlatFileStore {
    dir: PathBuf,
    prefix: String,
    magic: [u8; 4],
}

impl FlatFileStore {
    pub fn new(
        dir: impl Into<PathBuf>,
        prefix: impl Into<String>,
        magic: [u8; 4],
    ) -> Result<Self, FlatFileError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            prefix: prefix.into(),
            magic,
        })
    }

    pub fn magic(&self) -> [u8; 4] {
        self.magic
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn file_path(&self, file: u32) -> PathBuf {
        self.dir.join(format!("{}{file:05}.dat", self.prefix))
    }

    /// Writes a record whose header starts at `record_start` and returns the
    /// location of its payload.
    pub fn write_record(
        &self,
        file: u32,
        record_start: u32,
        payload: &[u8],
        trailer: Option<&Hash256>,
    ) -> Result<FileLocation, FlatFileError> {
        let len = u32::try_from(payload.len()).map_err(|_| FlatFileError::LengthMismatch)?;
        let mut handle = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(self.file_path(file))?;
        handle.seek(SeekFrom::Start(record_start as u64))?;
        let mut buffer = Vec::with_capacity(payload.len() + 8 + 32);
        buffer.extend_from_slice(&self.magic);
        buffer.extend_from_slice(&len.to_le_bytes());
        buffer.extend_from_slice(payload);
        if let Some(trailer) = trailer {
            buffer.extend_from_slice(trailer);
        }
        handle.write_all(&buffer)?;
        handle.flush()?;
        Ok(FileLocation::new(file, record_start + RECORD_HEADER_SIZE))
    }

    /// Reads the payload at `location`, checking the record header.
    pub fn read_record(&self, location: FileLocation) -> Result<Vec<u8>, FlatFileError> {
        let (payload, _) = self.read_inner(location, false)?;
        Ok(payload)
    }

    /// Reads the payload and the 32-byte trailer that follows it.
    pub fn read_record_with_trailer(
        &self,
        location: FileLocation,
    ) -> Result<(Vec<u8>, Hash256), FlatFileError> {
        let (payload, trailer) = self.read_inner(location, true)?;
        Ok((payload, trailer.unwrap_or([0u8; 32])))
    }

    fn read_inner(
        &self,
        location: FileLocation,
        with_trailer: bool,
    ) -> Result<(Vec<u8>, Option<Hash256>), FlatFileError> {
        if location.pos < RECORD_HEADER_SIZE {
            return Err(FlatFileError::InvalidLocation);
        }
        let mut file = File::open(self.file_path(location.file))?;
        file.seek(SeekFrom::Start((location.pos - RECORD_HEADER_SIZE) as u64))?;
        let mut header = [0u8; 8];
        file.read_exact(&mut header)?;
        if header[0..4] != self.magic {
            return Err(FlatFileError::BadMagic);
        }
        let len = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
        let available = file.metadata()?.len();
        if location.pos as u64 + len as u64 > available {
            return Err(FlatFileError::LengthMismatch);
        }
        let mut payload = vec![0u8; len as usize];
        file.read_exact(&mut payload)?;
        let trailer = if with_trailer {
            let mut trailer = [0u8; 32];
            file.read_exact(&mut trailer)?;
            Some(trailer)
        } else {
            None
        };
        Ok((payload, trailer))
    }

    /// Flushes a file to disk. `finalize` additionally truncates it to
    /// `size`, dropping any bytes past the last complete record.
    pub fn flush_file(&self, file: u32, size: u32, finalize: bool) -> Result<(), FlatFileError> {
        let path = self.file_path(file);
        if !path.exists() {
            return Ok(());
        }
        let handle = OpenOptions::new().write(true).open(path)?;
        if finalize && handle.metadata()?.len() > size as u64 {
            handle.set_len(size as u64)?;
        }
        handle.sync_all()?;
        Ok(())
    }

    /// Opens a file for sequential scanning (external import).
    pub fn open_file(&self, file: u32) -> Result<File, FlatFileError> {
        Ok(File::open(self.file_path(file))?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAGIC: [u8; 4] = [0xfa, 0xbf, 0xb5, 0xda];

    #[test]
    fn records_round_trip_at_payload_positions() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FlatFileStore::new(dir.path(), "blk", MAGIC).expect("store");
        let first = store.write_record(0, 0, b"hello", None).expect("write");
        assert_eq!(first, FileLocation::new(0, 8));
        let second = store.write_record(0, 13, b"world!", None).expect("write");
        assert_eq!(second.pos, 21);
        assert_eq!(store.read_record(first).expect("read"), b"hello");
        assert_eq!(store.read_record(second).expect("read"), b"world!");
        assert!(dir.path().join("blk00000.dat").exists());
    }

    #[test]
    fn trailer_is_returned_and_magic_checked() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FlatFileStore::new(dir.path(), "rev", MAGIC).expect("store");
        let checksum = [0x5a; 32];
        let location = store
            .write_record(3, 0, b"undo", Some(&checksum))
            .expect("write");
        let (payload, trailer) = store.read_record_with_trailer(location).expect("read");
        assert_eq!(payload, b"undo");
        assert_eq!(trailer, checksum);

        let other = FlatFileStore::new(dir.path(), "rev", [0, 0, 0, 0]).expect("store");
        assert!(matches!(
            other.read_record(location),
            Err(FlatFileError::BadMagic)
        ));
        assert!(matches!(
            store.read_record(FileLocation::new(3, 2)),
            Err(FlatFileError::InvalidLocation)
        ));
    }
}
