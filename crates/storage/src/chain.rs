//! Canonical chain persistence.
//!
//! Only the canonical branch is written to disk. Fork branches and orphans
//! live in memory and are rebuilt from the network after a restart.

use crate::db::{BatchOp, Result, Storage, StorageError};
use powchain_core::{Block, Hash};

/// Keys for chain metadata.
const CHAIN_HEAD_KEY: &[u8] = b"chain:head";
/// Index of the canonical tip (not the chain length).
const CHAIN_HEIGHT_KEY: &[u8] = b"chain:height";

/// Manages block storage and chain state.
pub struct ChainStore<'a> {
    storage: &'a Storage,
}

impl<'a> ChainStore<'a> {
    /// Create a new ChainStore wrapping the given storage.
    pub fn new(storage: &'a Storage) -> Self {
        Self { storage }
    }

    // =========================================================================
    // Block Lookup
    // =========================================================================

    /// Get a block by its hash.
    pub fn get_block_by_hash(&self, hash: &Hash) -> Result<Option<Block>> {
        let key = Storage::block_hash_key(hash);
        self.storage.get(key)
    }

    /// Get a canonical block by its index.
    ///
    /// Two lookups: `block:height:{n}` → hash, then hash → block.
    pub fn get_block_by_height(&self, height: u64) -> Result<Option<Block>> {
        let height_key = Storage::block_height_key(height);
        let hash: Option<Hash> = self.storage.get(&height_key)?;

        match hash {
            Some(h) => self.get_block_by_hash(&h),
            None => Ok(None),
        }
    }

    // =========================================================================
    // Chain Head Tracking
    // =========================================================================

    /// Get the current chain head hash.
    pub fn get_head(&self) -> Result<Option<Hash>> {
        self.storage.get(CHAIN_HEAD_KEY)
    }

    /// Index of the canonical tip. Returns 0 if the chain is not initialized.
    pub fn get_height(&self) -> Result<u64> {
        Ok(self.storage.get::<_, u64>(CHAIN_HEIGHT_KEY)?.unwrap_or(0))
    }

    /// Check if the chain is initialized (has a genesis block).
    pub fn is_initialized(&self) -> Result<bool> {
        Ok(self.get_head()?.is_some())
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Initialize the chain with a genesis block.
    pub fn init_genesis(&self, genesis: &Block) -> Result<()> {
        if !genesis.is_genesis() {
            return Err(StorageError::InvalidGenesis(
                "Genesis block must have index 0 and a zero parent".into(),
            ));
        }
        if self.is_initialized()? {
            return Err(StorageError::InvalidGenesis(
                "Chain already initialized".into(),
            ));
        }
        self.commit_canonical(std::slice::from_ref(genesis), 0)
    }

    /// Replace the canonical chain from `blocks[0].index()` upward in one
    /// atomic batch.
    ///
    /// `blocks` must be consecutive and end at the new tip. Height index
    /// entries above the new tip, up to `old_tip_index`, are removed so a
    /// reorg onto a shorter-by-index branch never leaves stale pointers.
    /// Bodies of blocks leaving the canonical chain stay addressable by hash
    /// until [`remove_blocks`](Self::remove_blocks) drops them.
    pub fn commit_canonical(&self, blocks: &[Block], old_tip_index: u64) -> Result<()> {
        let Some(tip) = blocks.last() else {
            return Ok(());
        };

        let mut ops = Vec::with_capacity(blocks.len() * 2 + 2);
        for block in blocks {
            let hash = block.hash();
            ops.push(BatchOp::put(Storage::block_hash_key(&hash), block)?);
            ops.push(BatchOp::put(Storage::block_height_key(block.index()), &hash)?);
        }
        for stale in (tip.index() + 1)..=old_tip_index {
            ops.push(BatchOp::remove(Storage::block_height_key(stale)));
        }
        ops.push(BatchOp::put(CHAIN_HEAD_KEY, &tip.hash())?);
        ops.push(BatchOp::put(CHAIN_HEIGHT_KEY, &tip.index())?);

        self.storage.batch(ops)
    }

    /// Delete the bodies of pruned fork blocks in one batch.
    ///
    /// Callers must not pass canonical hashes.
    pub fn remove_blocks(&self, hashes: &[Hash]) -> Result<()> {
        if hashes.is_empty() {
            return Ok(());
        }
        let ops = hashes
            .iter()
            .map(|hash| BatchOp::remove(Storage::block_hash_key(hash)))
            .collect();
        self.storage.batch(ops)
    }

    // =========================================================================
    // Bulk Reads
    // =========================================================================

    /// Get canonical blocks in a range [from_height, to_height].
    pub fn get_blocks_range(&self, from_height: u64, to_height: u64) -> Result<Vec<Block>> {
        let mut blocks = Vec::new();
        for height in from_height..=to_height {
            if let Some(block) = self.get_block_by_height(height)? {
                blocks.push(block);
            } else {
                break; // Stop at first missing block
            }
        }
        Ok(blocks)
    }

    /// Load the whole canonical chain, genesis first.
    ///
    /// Returns an empty vector for an uninitialized store and `Corrupt` when
    /// the height index has a gap or the head pointer disagrees with it.
    pub fn load_canonical(&self) -> Result<Vec<Block>> {
        let Some(head) = self.get_head()? else {
            return Ok(Vec::new());
        };
        let tip_index = self.get_height()?;
        let blocks = self.get_blocks_range(0, tip_index)?;

        if blocks.len() as u64 != tip_index + 1 {
            return Err(StorageError::Corrupt(format!(
                "expected {} canonical blocks, found {}",
                tip_index + 1,
                blocks.len()
            )));
        }
        if blocks.last().map(Block::hash) != Some(head) {
            return Err(StorageError::Corrupt("head does not match tip".into()));
        }
        Ok(blocks)
    }
}
