//! Merkle root computation with duplicate-subtree detection.
//!
//! Odd levels duplicate their last hash, so the transaction lists `[a, b, c]`
//! and `[a, b, c, c]` share a root. A block whose list can be mutated this way
//! without changing the root is flagged so callers reject it without marking
//! the header itself invalid.

use coind_consensus::Hash256;

use crate::hash::hash_pair;

/// Returns the merkle root of `leaves` and whether two identical sibling
/// hashes were combined at any level. An empty list yields the zero hash.
pub fn compute_merkle_root(leaves: &[Hash256]) -> (Hash256, bool) {
    if leaves.is_empty() {
        return ([0u8; 32], false);
    }
    let mut mutated = false;
    let mut level: Vec<Hash256> = leaves.to_vec();
    while level.len() > 1 {
        let mut next = Vec::with_capacity(level.len().div_ceil(2));
        for pair in level.chunks(2) {
            match pair {
                [left, right] => {
                    if left == right {
                        mutated = true;
                    }
                    next.push(hash_pair(left, right));
                }
                [single] => next.push(hash_pair(single, single)),
                _ => {}
            }
        }
        level = next;
    }
    (level[0], mutated)
}
