//! Merkle root computation over transaction ids.

use cinder_consensus::{Hash256, ZERO_HASH};

use crate::hash::sha256d;

/// Pairwise double-SHA-256 tree; an odd node at any level pairs with itself.
pub fn merkle_root(txids: &[Hash256]) -> Hash256 {
    if txids.is_empty() {
        return ZERO_HASH;
    }

    let mut level: Vec<Hash256> = txids.to_vec();
    while level.len() > 1 {
        let mut next = Vec::with_capacity(level.len().div_ceil(2));
        for pair in level.chunks(2) {
            let left = pair[0];
            let right = if pair.len() == 2 { pair[1] } else { pair[0] };
            let mut buf = [0u8; 64];
            buf[..32].copy_from_slice(&left);
            buf[32..].copy_from_slice(&right);
            next.push(sha256d(&buf));
        }
        level = next;
    }
    level[0]
}
