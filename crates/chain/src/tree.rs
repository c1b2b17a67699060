//! In-memory block tree: the canonical chain plus competing fork branches.
//!
//! Every connected block lives in one hash-keyed map. The canonical chain is
//! a vector of hashes indexed by block index. Each fork branch is keyed by its
//! tip hash and records the canonical index it forked from, the hashes after
//! that point and the ledger state at its tip.

use powchain_consensus::LedgerState;
use powchain_core::{Block, Hash};
use std::collections::{HashMap, HashSet};

/// A non-canonical branch.
#[derive(Debug, Clone)]
pub struct Branch {
    /// Index of the last block shared with the canonical chain.
    pub fork_point: u64,
    /// Hashes after the fork point, oldest first. The last one is the tip.
    pub hashes: Vec<Hash>,
    /// Ledger state after the branch tip.
    pub ledger: LedgerState,
}

impl Branch {
    pub fn tip_index(&self) -> u64 {
        self.fork_point + self.hashes.len() as u64
    }

    pub fn tip(&self) -> Option<&Hash> {
        self.hashes.last()
    }
}

/// Where a block's parent sits in the tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParentPosition {
    CanonicalTip,
    ForkTip,
    /// Anywhere else; attaching here opens a new branch.
    Interior,
}

pub struct BlockTree {
    blocks: HashMap<Hash, Block>,
    canonical: Vec<Hash>,
    forks: HashMap<Hash, Branch>,
}

impl BlockTree {
    /// Build from a non-empty canonical chain, genesis first.
    pub fn from_canonical(chain: Vec<Block>) -> Self {
        let mut tree = Self {
            blocks: HashMap::with_capacity(chain.len()),
            canonical: Vec::with_capacity(chain.len()),
            forks: HashMap::new(),
        };
        for block in chain {
            tree.push_canonical(block);
        }
        tree
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub fn genesis(&self) -> &Block {
        &self.blocks[&self.canonical[0]]
    }

    pub fn tip(&self) -> &Block {
        &self.blocks[self.tip_hash()]
    }

    pub fn tip_hash(&self) -> &Hash {
        self.canonical
            .last()
            .expect("canonical chain always holds genesis")
    }

    pub fn tip_index(&self) -> u64 {
        self.canonical.len() as u64 - 1
    }

    /// Canonical chain length, genesis included.
    pub fn len(&self) -> u64 {
        self.canonical.len() as u64
    }

    pub fn get(&self, hash: &Hash) -> Option<&Block> {
        self.blocks.get(hash)
    }

    pub fn contains(&self, hash: &Hash) -> bool {
        self.blocks.contains_key(hash)
    }

    pub fn canonical_at(&self, index: u64) -> Option<&Block> {
        let hash = self.canonical.get(usize::try_from(index).ok()?)?;
        self.blocks.get(hash)
    }

    pub fn is_canonical(&self, hash: &Hash) -> bool {
        self.blocks
            .get(hash)
            .and_then(|b| self.canonical.get(b.index() as usize))
            == Some(hash)
    }

    /// Canonical blocks `from..=to`. Callers check the bounds.
    pub fn canonical_range(&self, from: u64, to: u64) -> Vec<Block> {
        (from..=to)
            .filter_map(|i| self.canonical_at(i).cloned())
            .collect()
    }

    /// The block before `block`, if it is known.
    pub fn parent_of(&self, block: &Block) -> Option<&Block> {
        if block.is_genesis() {
            return None;
        }
        self.blocks.get(&block.header.prev_hash)
    }

    pub fn branch(&self, tip: &Hash) -> Option<&Branch> {
        self.forks.get(tip)
    }

    pub fn branches(&self) -> impl Iterator<Item = (&Hash, &Branch)> {
        self.forks.iter()
    }

    pub fn fork_count(&self) -> usize {
        self.forks.len()
    }

    pub fn classify(&self, parent: &Hash) -> Option<ParentPosition> {
        if !self.blocks.contains_key(parent) {
            return None;
        }
        Some(if parent == self.tip_hash() {
            ParentPosition::CanonicalTip
        } else if self.forks.contains_key(parent) {
            ParentPosition::ForkTip
        } else {
            ParentPosition::Interior
        })
    }

    /// Walk back from `hash` to the first canonical ancestor.
    ///
    /// Returns that ancestor's index and the non-canonical hashes after it,
    /// oldest first. For a canonical `hash` the list is empty.
    pub fn path_from_fork(&self, hash: &Hash) -> (u64, Vec<Hash>) {
        let mut hashes = Vec::new();
        let mut cursor = *hash;
        loop {
            if self.is_canonical(&cursor) {
                hashes.reverse();
                let index = self.blocks[&cursor].index();
                return (index, hashes);
            }
            match self.blocks.get(&cursor) {
                Some(block) => {
                    hashes.push(cursor);
                    cursor = block.header.prev_hash;
                }
                // Disconnected; treat genesis as the fork point.
                None => {
                    hashes.reverse();
                    return (0, hashes);
                }
            }
        }
    }

    /// All blocks from genesis to `hash` inclusive, genesis first.
    pub fn path_from_genesis(&self, hash: &Hash) -> Vec<&Block> {
        let (fork_point, branch) = self.path_from_fork(hash);
        self.canonical[..=fork_point as usize]
            .iter()
            .chain(branch.iter())
            .filter_map(|h| self.blocks.get(h))
            .collect()
    }

    // =========================================================================
    // Mutation
    // =========================================================================

    /// Append to the canonical chain. The block must extend the tip.
    pub fn push_canonical(&mut self, block: Block) {
        let hash = block.hash();
        self.canonical.push(hash);
        self.blocks.insert(hash, block);
    }

    /// Attach `block` as the new tip of a non-canonical branch.
    pub fn attach_to_branch(&mut self, block: Block, branch: Branch) {
        let hash = block.hash();
        self.forks.remove(&block.header.prev_hash);
        self.blocks.insert(hash, block);
        self.forks.insert(hash, branch);
    }

    /// Make `block`, the tip of `branch`, canonical.
    ///
    /// The old canonical suffix becomes a branch carrying `old_ledger`, every
    /// other branch is re-rooted against the new canonical chain, and the
    /// dropped blocks are returned oldest first.
    pub fn reorganize(&mut self, block: Block, branch: Branch, old_ledger: LedgerState) -> Vec<Block> {
        let new_tip = block.hash();
        self.forks.remove(&block.header.prev_hash);
        self.blocks.insert(new_tip, block);

        let fork_point = branch.fork_point as usize;
        let dropped: Vec<Hash> = self.canonical.split_off(fork_point + 1);
        self.canonical.extend(branch.hashes.iter().copied());

        if let Some(old_tip) = dropped.last() {
            self.forks.insert(
                *old_tip,
                Branch {
                    fork_point: branch.fork_point,
                    hashes: dropped.clone(),
                    ledger: old_ledger,
                },
            );
        }
        self.rebase_branches();

        dropped
            .iter()
            .filter_map(|h| self.blocks.get(h).cloned())
            .collect()
    }

    fn rebase_branches(&mut self) {
        let tips: Vec<Hash> = self.forks.keys().copied().collect();
        for tip in tips {
            let (fork_point, hashes) = self.path_from_fork(&tip);
            if hashes.is_empty() {
                // The branch tip is now canonical.
                self.forks.remove(&tip);
            } else if let Some(branch) = self.forks.get_mut(&tip) {
                branch.fork_point = fork_point;
                branch.hashes = hashes;
            }
        }
    }

    /// Drop branches whose tip is more than `max_depth` below the canonical
    /// tip, and any block no longer reachable from a kept branch.
    ///
    /// Returns the hashes of the blocks dropped.
    pub fn prune(&mut self, max_depth: u64) -> Vec<Hash> {
        let horizon = self.tip_index().saturating_sub(max_depth);
        let before = self.forks.len();
        self.forks.retain(|_, branch| branch.tip_index() >= horizon);

        let mut dropped = Vec::new();
        if self.forks.len() < before {
            let live: HashSet<Hash> = self
                .canonical
                .iter()
                .chain(self.forks.values().flat_map(|b| b.hashes.iter()))
                .copied()
                .collect();
            self.blocks.retain(|hash, _| {
                let keep = live.contains(hash);
                if !keep {
                    dropped.push(*hash);
                }
                keep
            });
        }
        dropped
    }
}
