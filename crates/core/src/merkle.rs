//! Merkle roots over a block's ordered transaction hashes.

use crate::hash::{hash_concat, Hash};

/// Compute the merkle root of an ordered list of leaf hashes.
///
/// An empty list maps to [`Hash::ZERO`] and a single leaf is its own root.
/// Larger lists are combined pairwise bottom-up; a level with an odd count
/// pairs its last node with itself. Position matters: swapping two leaves
/// changes the root.
pub fn merkle_root(leaves: &[Hash]) -> Hash {
    match leaves {
        [] => Hash::ZERO,
        [single] => *single,
        _ => {
            let mut level = leaves.to_vec();
            while level.len() > 1 {
                level = next_level(&level);
            }
            level[0]
        }
    }
}

fn next_level(level: &[Hash]) -> Vec<Hash> {
    level
        .chunks(2)
        .map(|pair| {
            let left = &pair[0];
            let right = pair.get(1).unwrap_or(left);
            hash_concat(&[left.as_ref(), right.as_ref()])
        })
        .collect()
}
