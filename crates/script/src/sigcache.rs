//! Bounded cache of signatures already verified.

use std::collections::BTreeSet;
use std::ops::Bound;
use std::sync::RwLock;

use coind_consensus::Hash256;
use coind_primitives::hash::sha256;

pub const DEFAULT_MAX_SIG_CACHE_SIZE: usize = 50_000;

pub struct SignatureCache {
    entries: RwLock<BTreeSet<Hash256>>,
    max_entries: usize,
}

impl SignatureCache {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: RwLock::new(BTreeSet::new()),
            max_entries,
        }
    }

    pub fn entry_key(sighash: &Hash256, pubkey: &[u8], sig: &[u8]) -> Hash256 {
        let mut preimage = Vec::with_capacity(32 + pubkey.len() + sig.len());
        preimage.extend_from_slice(sighash);
        preimage.extend_from_slice(pubkey);
        preimage.extend_from_slice(sig);
        sha256(&preimage)
    }

    pub fn contains(&self, key: &Hash256) -> bool {
        match self.entries.read() {
            Ok(entries) => entries.contains(key),
            Err(_) => false,
        }
    }

    /// Inserts `key`, evicting the first entry at or after it (wrapping) when full.
    pub fn insert(&self, key: Hash256) {
        if self.max_entries == 0 {
            return;
        }
        let Ok(mut entries) = self.entries.write() else {
            return;
        };
        while entries.len() >= self.max_entries {
            let victim = entries
                .range((Bound::Included(key), Bound::Unbounded))
                .next()
                .or_else(|| entries.iter().next())
                .copied();
            match victim {
                Some(victim) => {
                    entries.remove(&victim);
                }
                None => break,
            }
        }
        entries.insert(key);
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|entries| entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for SignatureCache {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_SIG_CACHE_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stays_within_bound() {
        let cache = SignatureCache::new(3);
        for byte in 0u8..10 {
            cache.insert([byte; 32]);
            assert!(cache.len() <= 3);
            assert!(cache.contains(&[byte; 32]));
        }
    }

    #[test]
    fn zero_capacity_stores_nothing() {
        let cache = SignatureCache::new(0);
        cache.insert([1u8; 32]);
        assert!(cache.is_empty());
    }
}
