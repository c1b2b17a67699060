//! Buffer for blocks whose parent has not arrived yet.

use powchain_core::{Block, Hash};
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

struct OrphanEntry {
    block: Block,
    received: Instant,
}

/// Orphans keyed by hash and indexed by missing parent, bounded in count and age.
pub struct OrphanPool {
    entries: HashMap<Hash, OrphanEntry>,
    by_parent: HashMap<Hash, Vec<Hash>>,
    /// Arrival order, for evicting the oldest when full.
    order: VecDeque<Hash>,
    max_orphans: usize,
    ttl: Duration,
}

impl OrphanPool {
    pub fn new(max_orphans: usize, ttl: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            by_parent: HashMap::new(),
            order: VecDeque::new(),
            max_orphans,
            ttl,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, hash: &Hash) -> bool {
        self.entries.contains_key(hash)
    }

    /// Buffer a block. Returns false if it was already buffered.
    pub fn insert(&mut self, block: Block) -> bool {
        self.insert_at(block, Instant::now())
    }

    pub fn insert_at(&mut self, block: Block, received: Instant) -> bool {
        let hash = block.hash();
        if self.entries.contains_key(&hash) || self.max_orphans == 0 {
            return false;
        }
        while self.entries.len() >= self.max_orphans {
            match self.order.front().copied() {
                Some(oldest) => {
                    tracing::debug!(hash = %oldest, "evicting oldest orphan");
                    self.remove(&oldest);
                }
                None => break,
            }
        }

        self.by_parent
            .entry(block.header.prev_hash)
            .or_default()
            .push(hash);
        self.order.push_back(hash);
        self.entries.insert(hash, OrphanEntry { block, received });
        true
    }

    /// Remove and return every orphan waiting on `parent`.
    pub fn take_children(&mut self, parent: &Hash) -> Vec<Block> {
        let Some(children) = self.by_parent.remove(parent) else {
            return Vec::new();
        };
        children
            .iter()
            .filter_map(|hash| {
                self.order.retain(|h| h != hash);
                self.entries.remove(hash).map(|e| e.block)
            })
            .collect()
    }

    /// Drop orphans older than the TTL. Returns how many were dropped.
    pub fn prune_expired(&mut self) -> usize {
        self.prune_expired_at(Instant::now())
    }

    pub fn prune_expired_at(&mut self, now: Instant) -> usize {
        let expired: Vec<Hash> = self
            .entries
            .iter()
            .filter(|(_, e)| now.saturating_duration_since(e.received) > self.ttl)
            .map(|(h, _)| *h)
            .collect();
        for hash in &expired {
            self.remove(hash);
        }
        expired.len()
    }

    fn remove(&mut self, hash: &Hash) -> Option<Block> {
        let entry = self.entries.remove(hash)?;
        self.order.retain(|h| h != hash);
        let parent = entry.block.header.prev_hash;
        if let Some(siblings) = self.by_parent.get_mut(&parent) {
            siblings.retain(|h| h != hash);
            if siblings.is_empty() {
                self.by_parent.remove(&parent);
            }
        }
        Some(entry.block)
    }
}
