use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::RwLock;

use crate::{Column, KeyValueStore, PrefixVisitor, ScanResult, StoreError, WriteBatch, WriteOp};

type MemoryStoreMap = BTreeMap<(Column, Vec<u8>), Vec<u8>>;

/// Ordered in-memory store. Nothing survives the process.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<MemoryStoreMap>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self, column: Column) -> usize {
        self.inner
            .read()
            .map(|guard| guard.keys().filter(|(col, _)| *col == column).count())
            .unwrap_or(0)
    }

    fn visit_prefix(
        guard: &MemoryStoreMap,
        column: Column,
        prefix: &[u8],
        visitor: &mut PrefixVisitor<'_>,
    ) -> Result<(), StoreError> {
        let start = (column, prefix.to_vec());
        for ((entry_column, key), value) in guard.range((Bound::Included(start), Bound::Unbounded)) {
            if *entry_column != column || !key.starts_with(prefix) {
                break;
            }
            visitor(key.as_slice(), value.as_slice())?;
        }
        Ok(())
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let guard = self.inner.read().map_err(|_| StoreError::Poisoned)?;
        Ok(guard.get(&(column, key.to_vec())).cloned())
    }

    fn put(&self, column: Column, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        let mut guard = self.inner.write().map_err(|_| StoreError::Poisoned)?;
        guard.insert((column, key.to_vec()), value.to_vec());
        Ok(())
    }

    fn delete(&self, column: Column, key: &[u8]) -> Result<(), StoreError> {
        let mut guard = self.inner.write().map_err(|_| StoreError::Poisoned)?;
        guard.remove(&(column, key.to_vec()));
        Ok(())
    }

    fn scan_prefix(&self, column: Column, prefix: &[u8]) -> Result<ScanResult, StoreError> {
        let guard = self.inner.read().map_err(|_| StoreError::Poisoned)?;
        let mut results = Vec::new();
        Self::visit_prefix(&guard, column, prefix, &mut |key, value| {
            results.push((key.to_vec(), value.to_vec()));
            Ok(())
        })?;
        Ok(results)
    }

    fn for_each_prefix<'a>(
        &self,
        column: Column,
        prefix: &[u8],
        visitor: &mut PrefixVisitor<'a>,
    ) -> Result<(), StoreError> {
        let guard = self.inner.read().map_err(|_| StoreError::Poisoned)?;
        Self::visit_prefix(&guard, column, prefix, visitor)
    }

    fn write_batch(&self, batch: &WriteBatch) -> Result<(), StoreError> {
        let mut guard = self.inner.write().map_err(|_| StoreError::Poisoned)?;
        for op in batch.iter() {
            match op {
                WriteOp::Put { column, key, value } => {
                    guard.insert((*column, key.as_slice().to_vec()), value.as_slice().to_vec());
                }
                WriteOp::Delete { column, key } => {
                    guard.remove(&(*column, key.as_slice().to_vec()));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_scan_stays_inside_column() {
        let store = MemoryStore::new();
        store.put(Column::Coins, b"ab1", b"x").expect("put");
        store.put(Column::Coins, b"ab2", b"y").expect("put");
        store.put(Column::Coins, b"ac1", b"z").expect("put");
        store.put(Column::Meta, b"ab3", b"w").expect("put");

        let hits = store.scan_prefix(Column::Coins, b"ab").expect("scan");
        assert_eq!(
            hits,
            vec![
                (b"ab1".to_vec(), b"x".to_vec()),
                (b"ab2".to_vec(), b"y".to_vec())
            ]
        );
        assert_eq!(store.len(Column::Coins), 3);
    }

    #[test]
    fn batch_applies_in_order() {
        let store = MemoryStore::new();
        let mut batch = WriteBatch::new();
        batch.put(Column::Meta, b"k", b"1");
        batch.delete(Column::Meta, b"k");
        batch.put(Column::Meta, b"k", b"2");
        assert_eq!(batch.touched(), Column::Meta.bit());
        store.write_batch(&batch).expect("batch");
        assert_eq!(store.get(Column::Meta, b"k").expect("get"), Some(b"2".to_vec()));
    }
}
