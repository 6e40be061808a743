use coind_consensus::Hash256;
use coind_primitives::encoding::{DecodeError, Decoder, Encoder};
use coind_storage::{Column, KeyValueStore, StoreError, WriteBatch};
use std::sync::Arc;

use crate::blockindex::{BlockIndex, BlockIndexNode, NodeId, BLOCK_HAVE_DATA, BLOCK_HAVE_UNDO};
use crate::filemeta::{
    block_file_info_key, parse_block_file_info_key, BlockFileInfo, META_LAST_BLOCK_FILE_KEY,
    META_REINDEXING_KEY,
};

/// Persistent form of a [`BlockIndexNode`]. Links and chain work are
/// rebuilt on load.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DiskBlockIndex {
    pub hash: Hash256,
    pub prev_hash: Hash256,
    pub height: i32,
    pub status: u32,
    pub tx_count: u32,
    pub file: u32,
    pub data_pos: u32,
    pub undo_pos: u32,
    pub version: i32,
    pub merkle_root: Hash256,
    pub time: u32,
    pub bits: u32,
    pub nonce: u32,
}

impl DiskBlockIndex {
    pub fn from_node(node: &BlockIndexNode) -> Self {
        Self {
            hash: node.hash,
            prev_hash: node.prev_hash,
            height: node.height,
            status: node.status,
            tx_count: node.tx_count,
            file: node.file,
            data_pos: node.data_pos,
            undo_pos: node.undo_pos,
            version: node.version,
            merkle_root: node.merkle_root,
            time: node.time,
            bits: node.bits,
            nonce: node.nonce,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        encoder.write_compact_size(self.height as u64);
        encoder.write_compact_size(u64::from(self.status));
        encoder.write_compact_size(u64::from(self.tx_count));
        if self.status & (BLOCK_HAVE_DATA | BLOCK_HAVE_UNDO) != 0 {
            encoder.write_compact_size(u64::from(self.file));
        }
        if self.status & BLOCK_HAVE_DATA != 0 {
            encoder.write_compact_size(u64::from(self.data_pos));
        }
        if self.status & BLOCK_HAVE_UNDO != 0 {
            encoder.write_compact_size(u64::from(self.undo_pos));
        }
        encoder.write_i32_le(self.version);
        encoder.write_hash_le(&self.prev_hash);
        encoder.write_hash_le(&self.merkle_root);
        encoder.write_u32_le(self.time);
        encoder.write_u32_le(self.bits);
        encoder.write_u32_le(self.nonce);
        encoder.into_inner()
    }

    pub fn decode(hash: Hash256, bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let height = read_u32_compact_size(&mut decoder)? as i32;
        let status = read_u32_compact_size(&mut decoder)?;
        let tx_count = read_u32_compact_size(&mut decoder)?;
        let file = if status & (BLOCK_HAVE_DATA | BLOCK_HAVE_UNDO) != 0 {
            read_u32_compact_size(&mut decoder)?
        } else {
            0
        };
        let data_pos = if status & BLOCK_HAVE_DATA != 0 {
            read_u32_compact_size(&mut decoder)?
        } else {
            0
        };
        let undo_pos = if status & BLOCK_HAVE_UNDO != 0 {
            read_u32_compact_size(&mut decoder)?
        } else {
            0
        };
        let version = decoder.read_i32_le()?;
        let prev_hash = decoder.read_hash_le()?;
        let merkle_root = decoder.read_hash_le()?;
        let time = decoder.read_u32_le()?;
        let bits = decoder.read_u32_le()?;
        let nonce = decoder.read_u32_le()?;
        if !decoder.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(Self {
            hash,
            prev_hash,
            height,
            status,
            tx_count,
            file,
            data_pos,
            undo_pos,
            version,
            merkle_root,
            time,
            bits,
            nonce,
        })
    }

    fn into_node(self) -> BlockIndexNode {
        BlockIndexNode {
            hash: self.hash,
            prev_hash: self.prev_hash,
            prev: None,
            skip: None,
            height: self.height,
            file: self.file,
            data_pos: self.data_pos,
            undo_pos: self.undo_pos,
            chain_work: Default::default(),
            tx_count: self.tx_count,
            chain_tx: 0,
            status: self.status,
            sequence_id: 0,
            version: self.version,
            merkle_root: self.merkle_root,
            time: self.time,
            bits: self.bits,
            nonce: self.nonce,
        }
    }
}

fn read_u32_compact_size(decoder: &mut Decoder<'_>) -> Result<u32, DecodeError> {
    let value = decoder.read_compact_size()?;
    u32::try_from(value).map_err(|_| DecodeError::InvalidData("block index field overflow"))
}

/// Block tree database: index records, block file statistics and flags.
pub struct BlockTreeDb<S> {
    store: Arc<S>,
}

impl<S: KeyValueStore> BlockTreeDb<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Writes file statistics, the last file number and index records in
    /// one batch, then syncs.
    pub fn write_batch_sync<'a>(
        &self,
        files: impl IntoIterator<Item = (u32, &'a BlockFileInfo)>,
        last_file: u32,
        nodes: impl IntoIterator<Item = &'a BlockIndexNode>,
    ) -> Result<(), StoreError> {
        let mut batch = WriteBatch::new();
        for (file, info) in files {
            batch.put(Column::BlockFileInfo, block_file_info_key(file), info.encode());
        }
        batch.put(Column::Meta, META_LAST_BLOCK_FILE_KEY, last_file.to_le_bytes());
        for node in nodes {
            batch.put(Column::BlockIndex, node.hash, DiskBlockIndex::from_node(node).encode());
        }
        self.store.write_batch(&batch)?;
        self.store.sync()
    }

    pub fn read_block_file_info(&self, file: u32) -> Result<Option<BlockFileInfo>, StoreError> {
        match self.store.get(Column::BlockFileInfo, &block_file_info_key(file))? {
            Some(bytes) => BlockFileInfo::decode(&bytes)
                .map(Some)
                .map_err(|err| StoreError::Backend(err.to_string())),
            None => Ok(None),
        }
    }

    pub fn read_block_file_infos(&self) -> Result<Vec<(u32, BlockFileInfo)>, StoreError> {
        let mut out = Vec::new();
        for (key, value) in self.store.scan_prefix(Column::BlockFileInfo, &[])? {
            let file = parse_block_file_info_key(&key)
                .ok_or_else(|| StoreError::Backend("invalid block file key".to_string()))?;
            let info =
                BlockFileInfo::decode(&value).map_err(|err| StoreError::Backend(err.to_string()))?;
            out.push((file, info));
        }
        out.sort_by_key(|(file, _)| *file);
        Ok(out)
    }

    pub fn read_last_block_file(&self) -> Result<Option<u32>, StoreError> {
        let Some(bytes) = self.store.get(Column::Meta, META_LAST_BLOCK_FILE_KEY)? else {
            return Ok(None);
        };
        let raw: [u8; 4] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| StoreError::Backend("invalid last block file".to_string()))?;
        Ok(Some(u32::from_le_bytes(raw)))
    }

    pub fn write_reindexing(&self, reindexing: bool) -> Result<(), StoreError> {
        if reindexing {
            self.store.put(Column::Meta, META_REINDEXING_KEY, &[1])
        } else {
            self.store.delete(Column::Meta, META_REINDEXING_KEY)
        }
    }

    pub fn read_reindexing(&self) -> Result<bool, StoreError> {
        Ok(self.store.get(Column::Meta, META_REINDEXING_KEY)?.is_some())
    }

    pub fn write_flag(&self, name: &str, value: bool) -> Result<(), StoreError> {
        let key = flag_key(name);
        self.store.put(Column::Meta, &key, &[u8::from(value)])
    }

    pub fn read_flag(&self, name: &str) -> Result<Option<bool>, StoreError> {
        Ok(self
            .store
            .get(Column::Meta, &flag_key(name))?
            .map(|bytes| bytes.first() == Some(&1)))
    }

    /// Loads every index record into `index`, parents before children.
    /// Returns the ids in height order.
    pub fn load_block_index(&self, index: &mut BlockIndex) -> Result<Vec<NodeId>, StoreError> {
        let mut records = Vec::new();
        for (key, value) in self.store.scan_prefix(Column::BlockIndex, &[])? {
            let hash: Hash256 = key
                .as_slice()
                .try_into()
                .map_err(|_| StoreError::Backend("invalid block index key".to_string()))?;
            let record = DiskBlockIndex::decode(hash, &value)
                .map_err(|err| StoreError::Backend(err.to_string()))?;
            records.push(record);
        }
        records.sort_by_key(|record| record.height);

        let mut ids = Vec::with_capacity(records.len());
        for record in records {
            if index.lookup(&record.hash).is_some() {
                continue;
            }
            let stored_height = record.height;
            let mut node = record.into_node();
            node.prev = index.lookup(&node.prev_hash);
            if node.prev.is_none() && stored_height != 0 {
                return Err(StoreError::Backend(format!(
                    "block index record at height {stored_height} has no parent"
                )));
            }
            let id = index.push_linked(node);
            if index.node(id).height != stored_height {
                return Err(StoreError::Backend(format!(
                    "block index height mismatch at {stored_height}"
                )));
            }
            ids.push(id);
        }
        Ok(ids)
    }
}

fn flag_key(name: &str) -> Vec<u8> {
    let mut key = b"flag:".to_vec();
    key.extend_from_slice(name.as_bytes());
    key
}

#[cfg(test)]
mod tests {
    use super::*;
    use coind_primitives::block::BlockHeader;
    use coind_storage::memory::MemoryStore;

    fn header(prev: Hash256, nonce: u32) -> BlockHeader {
        BlockHeader {
            version: 4,
            prev_block: prev,
            merkle_root: [nonce as u8; 32],
            time: 1_000 + nonce,
            bits: 0x207fffff,
            nonce,
        }
    }

    #[test]
    fn index_reloads_with_links_and_work() {
        let store = Arc::new(MemoryStore::new());
        let db = BlockTreeDb::new(Arc::clone(&store));

        let mut index = BlockIndex::new();
        let mut prev = [0u8; 32];
        for nonce in 0..5u32 {
            let mut hash = [0u8; 32];
            hash[0] = nonce as u8 + 1;
            let id = index.insert_header(hash, &header(prev, nonce));
            let node = index.node_mut(id);
            node.status |= BLOCK_HAVE_DATA;
            node.file = 0;
            node.data_pos = 8 + nonce * 100;
            node.tx_count = 1;
            prev = hash;
        }
        let mut info = BlockFileInfo::default();
        info.add_block(0, 1_000);
        let nodes: Vec<_> = index.iter().map(|(_, node)| node).collect();
        db.write_batch_sync([(0u32, &info)], 0, nodes).expect("write");

        let mut reloaded = BlockIndex::new();
        let ids = db.load_block_index(&mut reloaded).expect("load");
        assert_eq!(ids.len(), 5);
        let tip = reloaded.lookup(&prev).expect("tip");
        assert_eq!(reloaded.node(tip).height, 4);
        assert_eq!(reloaded.node(tip).data_pos, 408);
        assert_eq!(reloaded.node(tip).chain_work, index.node(4).chain_work);
        assert_eq!(db.read_last_block_file().expect("last"), Some(0));
        assert_eq!(db.read_block_file_infos().expect("infos").len(), 1);
    }

    #[test]
    fn flags_and_reindex_marker() {
        let db = BlockTreeDb::new(Arc::new(MemoryStore::new()));
        assert!(!db.read_reindexing().expect("read"));
        db.write_reindexing(true).expect("write");
        assert!(db.read_reindexing().expect("read"));
        db.write_reindexing(false).expect("write");
        assert!(!db.read_reindexing().expect("read"));

        assert_eq!(db.read_flag("txindex").expect("flag"), None);
        db.write_flag("txindex", true).expect("flag");
        assert_eq!(db.read_flag("txindex").expect("flag"), Some(true));
    }
}
