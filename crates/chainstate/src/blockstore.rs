//! Block and undo file bookkeeping: which file receives the next record, how
//! full every file is, and which statistics still need to be persisted.

use std::collections::BTreeSet;
use std::path::Path;

use coind_consensus::params::ConsensusParams;
use coind_consensus::Hash256;
use coind_pow::validation::check_proof_of_work;
use coind_primitives::block::Block;

use crate::blockindex::BlockIndexNode;
use crate::filemeta::BlockFileInfo;
use crate::flatfiles::{
    FileLocation, FlatFileError, FlatFileStore, MAX_BLOCKFILE_SIZE, RECORD_HEADER_SIZE,
};
use crate::state::ChainStateError;
use crate::undo::{undo_checksum, BlockUndo};

/// Bytes appended to every undo payload: the record header and the checksum.
pub const UNDO_RECORD_OVERHEAD: u32 = RECORD_HEADER_SIZE + 32;

pub struct BlockStore {
    blocks: FlatFileStore,
    undo: FlatFileStore,
    files: Vec<BlockFileInfo>,
    last_file: u32,
    dirty: BTreeSet<u32>,
}

impl BlockStore {
    pub fn open(dir: impl AsRef<Path>, magic: [u8; 4]) -> Result<Self, FlatFileError> {
        let dir = dir.as_ref();
        Ok(Self {
            blocks: FlatFileStore::new(dir, "blk", magic)?,
            undo: FlatFileStore::new(dir, "rev", magic)?,
            files: vec![BlockFileInfo::default()],
            last_file: 0,
            dirty: BTreeSet::new(),
        })
    }

    /// Replaces the in-memory statistics with the persisted ones.
    pub fn load(&mut self, last_file: u32, infos: Vec<(u32, BlockFileInfo)>) {
        let count = infos
            .iter()
            .map(|(file, _)| *file as usize + 1)
            .max()
            .unwrap_or(0)
            .max(last_file as usize + 1);
        self.files = vec![BlockFileInfo::default(); count];
        for (file, info) in infos {
            self.files[file as usize] = info;
        }
        self.last_file = last_file;
        self.dirty.clear();
    }

    pub fn last_file(&self) -> u32 {
        self.last_file
    }

    pub fn file_info(&self, file: u32) -> Option<&BlockFileInfo> {
        self.files.get(file as usize)
    }

    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    pub fn blocks(&self) -> &FlatFileStore {
        &self.blocks
    }

    pub fn block_file_exists(&self, file: u32) -> bool {
        self.blocks.file_path(file).exists()
    }

    fn ensure_file(&mut self, file: u32) {
        if self.files.len() <= file as usize {
            self.files.resize(file as usize + 1, BlockFileInfo::default());
        }
    }

    /// Reserves `add_size` bytes for a block. With `known` the block already
    /// sits on disk at that payload position and only the statistics move.
    /// Otherwise the returned location is the record start in the chosen file.
    pub fn find_block_pos(
        &mut self,
        add_size: u32,
        height: i32,
        time: u32,
        known: Option<FileLocation>,
    ) -> Result<FileLocation, FlatFileError> {
        let mut file = known.map(|pos| pos.file).unwrap_or(self.last_file);
        self.ensure_file(file);
        if known.is_none() {
            while self.files[file as usize].size as u64 + add_size as u64 >= MAX_BLOCKFILE_SIZE {
                file += 1;
                self.ensure_file(file);
            }
        }
        let location = match known {
            Some(pos) => pos,
            None => FileLocation::new(file, self.files[file as usize].size),
        };

        if file != self.last_file {
            if known.is_none() {
                coind_log::log_info!(
                    "leaving block file {}: {}",
                    self.last_file,
                    self.files[self.last_file as usize]
                );
            }
            self.flush(known.is_none())?;
            self.last_file = file;
        }

        let info = &mut self.files[file as usize];
        info.add_block(height, time);
        info.size = match known {
            Some(pos) => (pos.pos + add_size).max(info.size),
            None => info.size + add_size,
        };
        self.dirty.insert(file);
        Ok(location)
    }

    /// Reserves `add_size` bytes in the undo file paired with `file` and
    /// returns the record start.
    pub fn find_undo_pos(&mut self, file: u32, add_size: u32) -> FileLocation {
        self.ensure_file(file);
        let info = &mut self.files[file as usize];
        let location = FileLocation::new(file, info.undo_size);
        info.undo_size += add_size;
        self.dirty.insert(file);
        location
    }

    pub fn write_block(
        &self,
        block: &Block,
        record_start: FileLocation,
    ) -> Result<FileLocation, FlatFileError> {
        self.blocks
            .write_record(record_start.file, record_start.pos, &block.consensus_encode(), None)
    }

    pub fn read_block_at(&self, location: FileLocation) -> Result<Block, ChainStateError> {
        let bytes = self.blocks.read_record(location)?;
        Ok(Block::consensus_decode(&bytes)?)
    }

    /// Reads the block of `node` and checks it is the block the index expects.
    pub fn read_block(
        &self,
        node: &BlockIndexNode,
        params: &ConsensusParams,
    ) -> Result<Block, ChainStateError> {
        if !node.have_data() {
            return Err(ChainStateError::Corrupt(format!(
                "no block data for {}",
                coind_consensus::hash256_to_hex(&node.hash)
            )));
        }
        let block = self.read_block_at(FileLocation::new(node.file, node.data_pos))?;
        let hash = block.hash();
        if check_proof_of_work(&hash, block.header.bits, params).is_err() {
            return Err(ChainStateError::Corrupt(format!(
                "errors in block header at {}:{}",
                node.file, node.data_pos
            )));
        }
        if hash != node.hash {
            return Err(ChainStateError::Corrupt(format!(
                "block at {}:{} is {} instead of {}",
                node.file,
                node.data_pos,
                coind_consensus::hash256_to_hex(&hash),
                coind_consensus::hash256_to_hex(&node.hash)
            )));
        }
        Ok(block)
    }

    pub fn write_undo(
        &self,
        payload: &[u8],
        record_start: FileLocation,
        prev_block: &Hash256,
    ) -> Result<FileLocation, FlatFileError> {
        let checksum = undo_checksum(prev_block, payload);
        self.undo
            .write_record(record_start.file, record_start.pos, payload, Some(&checksum))
    }

    /// Reads the undo record of `node`, verifying its checksum against the
    /// parent hash.
    pub fn read_undo(
        &self,
        node: &BlockIndexNode,
        prev_block: &Hash256,
    ) -> Result<BlockUndo, ChainStateError> {
        if !node.have_undo() {
            return Err(ChainStateError::Corrupt(format!(
                "no undo data available for {}",
                coind_consensus::hash256_to_hex(&node.hash)
            )));
        }
        let (payload, checksum) = self
            .undo
            .read_record_with_trailer(FileLocation::new(node.file, node.undo_pos))?;
        if undo_checksum(prev_block, &payload) != checksum {
            return Err(ChainStateError::Corrupt(format!(
                "undo checksum mismatch for {}",
                coind_consensus::hash256_to_hex(&node.hash)
            )));
        }
        Ok(BlockUndo::decode(&payload)?)
    }

    /// Syncs the current block and undo files. `finalize` also truncates
    /// them to their recorded sizes.
    pub fn flush(&self, finalize: bool) -> Result<(), FlatFileError> {
        let Some(info) = self.files.get(self.last_file as usize) else {
            return Ok(());
        };
        self.blocks.flush_file(self.last_file, info.size, finalize)?;
        self.undo.flush_file(self.last_file, info.undo_size, finalize)
    }

    /// Statistics changed since the last call.
    pub fn take_dirty(&mut self) -> Vec<(u32, BlockFileInfo)> {
        let dirty = std::mem::take(&mut self.dirty);
        dirty
            .into_iter()
            .filter_map(|file| self.files.get(file as usize).map(|info| (file, *info)))
            .collect()
    }
}
