//! Main blockchain orchestration.
//!
//! `Blockchain` owns the block tree, the canonical ledger, the pending pool,
//! the orphan buffer and the difficulty controller. Every mutation goes
//! through it; share it between threads as a [`SharedChain`].

use crate::error::{CapacityError, ChainError, LinkageError, Result};
use crate::mempool::{Mempool, MempoolConfig};
use crate::orphans::OrphanPool;
use crate::signal::TipSignal;
use crate::tree::{BlockTree, Branch, ParentPosition};
use parking_lot::Mutex;
use powchain_consensus::{
    validate_block, validate_transaction, BlockValidator, ConsensusParams, DifficultyConfig,
    DifficultyController, LedgerState, SequentialLedger, TransactionValidator,
};
use powchain_core::{Address, Block, BlockHeader, Hash, Transaction};
use powchain_storage::{ChainStore, Storage};
use serde::Serialize;
use std::borrow::Cow;
use std::sync::Arc;
use std::time::Duration;

/// The chain shared between the miner, the network and the API.
pub type SharedChain = Arc<Mutex<Blockchain>>;

/// Blockchain configuration.
#[derive(Debug, Clone)]
pub struct BlockchainConfig {
    /// Validation limits and block reward.
    pub consensus: ConsensusParams,
    /// Retarget window and genesis difficulty.
    pub difficulty: DifficultyConfig,
    /// Pending pool limits.
    pub mempool: MempoolConfig,
    /// How far below the canonical tip a fork may attach.
    pub max_fork_depth: u64,
    /// Maximum buffered orphan blocks.
    pub max_orphans: usize,
    /// How long an orphan waits for its parent.
    pub orphan_ttl: Duration,
    /// Transactions older than this many seconds are refused by the pool.
    pub tx_max_age: u64,
    /// Balances minted by the genesis block.
    pub genesis_allocations: Vec<(Address, u64)>,
}

impl Default for BlockchainConfig {
    fn default() -> Self {
        Self {
            consensus: ConsensusParams::default(),
            difficulty: DifficultyConfig::default(),
            mempool: MempoolConfig::default(),
            max_fork_depth: 64,
            max_orphans: 256,
            orphan_ttl: Duration::from_secs(600),
            tx_max_age: 86_400,
            genesis_allocations: Vec::new(),
        }
    }
}

/// What an accepted block did to the chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppendOutcome {
    /// The block extended the canonical tip.
    Extended,
    /// The block was stored on a branch that is not (yet) longer.
    SideBranch,
    /// A branch overtook the canonical chain.
    Reorganized {
        old_tip: Hash,
        new_tip: Hash,
        /// Canonical blocks that were rolled back.
        depth: u64,
        /// Transactions returned to the pending pool.
        returned: usize,
    },
}

impl AppendOutcome {
    pub fn tip_changed(&self) -> bool {
        !matches!(self, AppendOutcome::SideBranch)
    }
}

/// Result of a successful append.
#[derive(Debug, Clone)]
pub struct AppendReport {
    pub hash: Hash,
    pub index: u64,
    pub outcome: AppendOutcome,
    /// Orphans that connected behind this block, in connection order.
    pub reconnected: Vec<Hash>,
}

/// Snapshot for status queries.
#[derive(Debug, Clone, Serialize)]
pub struct ChainStatus {
    /// Canonical chain length, genesis included.
    pub height: u64,
    pub tip: Hash,
    /// Difficulty the next canonical block must declare.
    pub difficulty: u32,
    pub pending: usize,
    pub forks: usize,
    pub orphans: usize,
}

/// Main blockchain struct that orchestrates all components.
pub struct Blockchain {
    /// Storage backend (canonical chain only).
    storage: Storage,
    /// Configuration.
    config: BlockchainConfig,
    /// Canonical chain and fork branches.
    tree: BlockTree,
    /// Ledger after the canonical tip.
    ledger: LedgerState,
    /// Transaction mempool.
    mempool: Mempool,
    /// Blocks waiting for their parent.
    orphans: OrphanPool,
    /// Difficulty for the next canonical block.
    difficulty: DifficultyController,
    /// Bumped on every canonical tip change.
    signal: TipSignal,
}

impl Blockchain {
    /// Open the chain in `storage`, writing genesis if the store is empty.
    ///
    /// A non-empty store is re-verified block by block; a genesis that does
    /// not match `config` is refused.
    pub fn open(storage: Storage, config: BlockchainConfig) -> Result<Self> {
        let genesis = Block::genesis(
            config.difficulty.initial_difficulty,
            &config.genesis_allocations,
        );

        let store = ChainStore::new(&storage);
        let mut blocks = store.load_canonical()?;
        if blocks.is_empty() {
            store.init_genesis(&genesis)?;
            tracing::info!(hash = %genesis.hash(), "initialized chain with genesis block");
            blocks.push(genesis);
        } else if blocks[0].hash() != genesis.hash() {
            return Err(ChainError::GenesisMismatch {
                stored: blocks[0].hash(),
                expected: genesis.hash(),
            });
        }

        let ledger = Self::verify_stored(&blocks.iter().collect::<Vec<_>>(), &config)?;
        let tree = BlockTree::from_canonical(blocks);

        let mut difficulty = DifficultyController::new(config.difficulty.clone());
        let tip = tree.tip();
        difficulty.set_target(
            config
                .difficulty
                .expected_difficulty(&tip.header, tree.parent_of(tip).map(|b| &b.header)),
        );

        let signal = TipSignal::new(tree.len());
        tracing::info!(
            height = tree.len(),
            tip = %tree.tip_hash(),
            difficulty = difficulty.target(),
            "chain loaded"
        );

        Ok(Self {
            storage,
            mempool: Mempool::with_config(config.mempool.clone()),
            orphans: OrphanPool::new(config.max_orphans, config.orphan_ttl),
            config,
            tree,
            ledger,
            difficulty,
            signal,
        })
    }

    /// Open over a throwaway in-memory database.
    pub fn in_memory(config: BlockchainConfig) -> Result<Self> {
        Self::open(Storage::open_temporary()?, config)
    }

    /// Wrap for sharing across threads.
    pub fn shared(self) -> SharedChain {
        Arc::new(Mutex::new(self))
    }

    fn verify_stored(blocks: &[&Block], config: &BlockchainConfig) -> Result<LedgerState> {
        let mut ledger = LedgerState::replay(blocks.first().copied());
        for i in 1..blocks.len() {
            let (block, parent) = (blocks[i], blocks[i - 1]);
            let grandparent = i.checked_sub(2).map(|g| &blocks[g].header);
            let expected = config
                .difficulty
                .expected_difficulty(&parent.header, grandparent);
            // Stored blocks were accepted once, so skip the future-drift check.
            ledger = validate_block(block, parent, expected, &ledger, &config.consensus, u64::MAX)
                .map_err(|e| ChainError::CorruptChain {
                    index: block.index(),
                    reason: e.to_string(),
                })?;
        }
        Ok(ledger)
    }

    /// Re-validate the canonical chain from genesis.
    ///
    /// Every block is checked against its parent the same way it was when it
    /// arrived, and the replayed balances must equal the live ledger.
    pub fn verify(&self) -> Result<()> {
        let expected = Block::genesis(
            self.config.difficulty.initial_difficulty,
            &self.config.genesis_allocations,
        )
        .hash();
        if self.genesis_hash() != expected {
            return Err(ChainError::GenesisMismatch {
                stored: self.genesis_hash(),
                expected,
            });
        }

        let canonical = self.tree.path_from_genesis(self.tree.tip_hash());
        let replayed = Self::verify_stored(&canonical, &self.config)?;
        if replayed != self.ledger {
            return Err(ChainError::CorruptChain {
                index: self.tree.tip_index(),
                reason: "replayed balances differ from the live ledger".into(),
            });
        }
        tracing::debug!(height = self.height(), "canonical chain verified");
        Ok(())
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub fn config(&self) -> &BlockchainConfig {
        &self.config
    }

    pub fn genesis_hash(&self) -> Hash {
        self.tree.genesis().hash()
    }

    /// The last canonical block.
    pub fn tip(&self) -> &Block {
        self.tree.tip()
    }

    pub fn tip_hash(&self) -> Hash {
        *self.tree.tip_hash()
    }

    /// Canonical chain length, genesis included.
    pub fn height(&self) -> u64 {
        self.tree.len()
    }

    /// Canonical blocks `from..=to`.
    pub fn get_range(&self, from: u64, to: u64) -> Result<Vec<Block>> {
        let height = self.height();
        if from > to || to >= height {
            return Err(ChainError::OutOfRange { from, to, height });
        }
        Ok(self.tree.canonical_range(from, to))
    }

    /// Any connected block, canonical or not.
    pub fn block_by_hash(&self, hash: &Hash) -> Option<&Block> {
        self.tree.get(hash)
    }

    pub fn block_by_index(&self, index: u64) -> Option<&Block> {
        self.tree.canonical_at(index)
    }

    pub fn contains_block(&self, hash: &Hash) -> bool {
        self.tree.contains(hash)
    }

    pub fn is_orphan(&self, hash: &Hash) -> bool {
        self.orphans.contains(hash)
    }

    /// Confirmed balance on the canonical chain.
    pub fn balance(&self, address: &Address) -> u64 {
        self.ledger.balance(address)
    }

    /// Difficulty the next canonical block must declare.
    pub fn difficulty(&self) -> u32 {
        self.difficulty.target()
    }

    /// Difficulty a child of `parent` must declare.
    pub fn expected_difficulty_for_child(&self, parent: &Block) -> u32 {
        self.config.difficulty.expected_difficulty(
            &parent.header,
            self.tree.parent_of(parent).map(|b| &b.header),
        )
    }

    pub fn mempool(&self) -> &Mempool {
        &self.mempool
    }

    pub fn signal(&self) -> TipSignal {
        self.signal.clone()
    }

    pub fn status(&self) -> ChainStatus {
        ChainStatus {
            height: self.height(),
            tip: self.tip_hash(),
            difficulty: self.difficulty(),
            pending: self.mempool.len(),
            forks: self.tree.fork_count(),
            orphans: self.orphans.len(),
        }
    }

    // =========================================================================
    // Transactions
    // =========================================================================

    /// Validate a transaction against the canonical tip and queue it.
    pub fn submit_transaction(&mut self, tx: Transaction) -> Result<Hash> {
        let hash = tx.hash();
        if self.mempool.contains(&hash) {
            return Err(ChainError::DuplicateTransaction(hash));
        }

        let age = BlockHeader::current_timestamp().saturating_sub(tx.timestamp);
        if age > self.config.tx_max_age {
            return Err(ChainError::ExpiredTransaction {
                age,
                max_age: self.config.tx_max_age,
            });
        }

        validate_transaction(&tx, &self.ledger, &self.config.consensus)
            .map_err(ChainError::InvalidTransaction)?;
        self.mempool.add(tx)?;

        tracing::debug!(hash = %hash, pending = self.mempool.len(), "transaction queued");
        Ok(hash)
    }

    /// Build an unmined block on the canonical tip.
    ///
    /// The reward comes first, followed by the highest-fee pending
    /// transactions that are valid in sequence, until the transaction count
    /// or byte limit is reached. The pool itself is left untouched.
    pub fn assemble_candidate(&self, miner: Address, now: u64) -> Block {
        let params = &self.config.consensus;
        let tip = self.tree.tip();
        let index = tip.index() + 1;
        let timestamp = now.max(tip.header.timestamp);
        let difficulty = self.expected_difficulty_for_child(tip);

        let reward = Transaction::reward(miner, params.mining_reward, index, timestamp);
        let mut size = Block::new(index, tip.hash(), vec![reward.clone()], difficulty, timestamp)
            .encoded_size();
        let mut sequence = SequentialLedger::new(&self.ledger, Some(miner));
        sequence.apply_reward(&reward);

        let mut transactions = vec![reward];
        for tx in self.mempool.by_fee() {
            if transactions.len() >= params.max_transactions_per_block {
                break;
            }
            let tx_size = tx.encoded_size();
            if size + tx_size > params.max_block_size {
                break;
            }
            match sequence.push(&tx, params) {
                Ok(()) => {
                    size += tx_size;
                    transactions.push(tx);
                }
                Err(e) => tracing::trace!(hash = %tx.hash(), error = %e, "skipping pending transaction"),
            }
        }

        Block::new(index, tip.hash(), transactions, difficulty, timestamp)
    }

    // =========================================================================
    // Blocks
    // =========================================================================

    /// Validate and attach a block, then connect any orphans waiting on it.
    pub fn append_block(&mut self, block: Block) -> Result<AppendReport> {
        self.append_block_at(block, BlockHeader::current_timestamp())
    }

    /// [`append_block`](Self::append_block) with an explicit clock.
    pub fn append_block_at(&mut self, block: Block, now: u64) -> Result<AppendReport> {
        let mut report = self.append_one(block, now)?;
        report.reconnected = self.reconnect_orphans(report.hash, now);

        let pruned = self.tree.prune(self.config.max_fork_depth);
        if !pruned.is_empty() {
            // The block is already committed; a failed cleanup only leaks space.
            match ChainStore::new(&self.storage).remove_blocks(&pruned) {
                Ok(()) => tracing::debug!(blocks = pruned.len(), "pruned stale fork blocks"),
                Err(e) => tracing::warn!(error = %e, "failed to delete pruned fork blocks"),
            }
        }
        Ok(report)
    }

    /// Drop orphans that waited too long.
    pub fn prune_orphans(&mut self) -> usize {
        self.orphans.prune_expired()
    }

    /// Flush pending writes to disk.
    pub fn flush(&self) -> Result<()> {
        Ok(self.storage.flush()?)
    }

    fn reconnect_orphans(&mut self, parent: Hash, now: u64) -> Vec<Hash> {
        let mut connected = Vec::new();
        let mut queue = vec![parent];
        while let Some(parent) = queue.pop() {
            for child in self.orphans.take_children(&parent) {
                match self.append_one(child, now) {
                    Ok(report) => {
                        tracing::debug!(hash = %report.hash, "orphan reconnected");
                        connected.push(report.hash);
                        queue.push(report.hash);
                    }
                    Err(e) => tracing::warn!(error = %e, "dropping orphan that failed to connect"),
                }
            }
        }
        connected
    }

    fn append_one(&mut self, block: Block, now: u64) -> Result<AppendReport> {
        let hash = block.hash();
        if self.tree.contains(&hash) || self.orphans.contains(&hash) {
            return Err(LinkageError::AlreadyKnown(hash).into());
        }

        let max = self.config.consensus.max_block_size;
        let got = block.encoded_size();
        if got > max {
            return Err(CapacityError::BlockTooLarge { max, got }.into());
        }

        let parent_hash = block.header.prev_hash;
        let Some(position) = self.tree.classify(&parent_hash) else {
            BlockValidator::check_detached(&block, &self.config.consensus)
                .map_err(ChainError::InvalidBlock)?;
            tracing::debug!(hash = %hash, parent = %parent_hash, "buffering orphan block");
            self.orphans.insert(block);
            return Err(LinkageError::Orphan(parent_hash).into());
        };

        let tip_index = self.tree.tip_index();
        let next_ledger = {
            let parent = self
                .tree
                .get(&parent_hash)
                .ok_or(LinkageError::Orphan(parent_hash))?;

            if position != ParentPosition::CanonicalTip {
                let max_depth = self.config.max_fork_depth;
                if tip_index.saturating_sub(parent.index()) > max_depth {
                    return Err(LinkageError::TooDeep {
                        parent_index: parent.index(),
                        tip_index,
                        max_depth,
                    }
                    .into());
                }
            }

            let base: Cow<'_, LedgerState> = match position {
                ParentPosition::CanonicalTip => Cow::Borrowed(&self.ledger),
                ParentPosition::ForkTip => match self.tree.branch(&parent_hash) {
                    Some(branch) => Cow::Borrowed(&branch.ledger),
                    None => Cow::Owned(LedgerState::replay(self.tree.path_from_genesis(&parent_hash))),
                },
                ParentPosition::Interior => {
                    Cow::Owned(LedgerState::replay(self.tree.path_from_genesis(&parent_hash)))
                }
            };

            let expected = self.expected_difficulty_for_child(parent);
            validate_block(&block, parent, expected, &base, &self.config.consensus, now)
                .map_err(ChainError::InvalidBlock)?
        };

        let index = block.index();
        let outcome = if position == ParentPosition::CanonicalTip {
            self.extend_canonical(block, next_ledger)?
        } else {
            let (fork_point, mut hashes) = self.tree.path_from_fork(&parent_hash);
            hashes.push(hash);
            let branch = Branch {
                fork_point,
                hashes,
                ledger: next_ledger,
            };
            if index > tip_index {
                self.reorganize(block, branch)?
            } else {
                tracing::debug!(hash = %hash, index, fork_point, "block stored on side branch");
                self.tree.attach_to_branch(block, branch);
                AppendOutcome::SideBranch
            }
        };

        Ok(AppendReport {
            hash,
            index,
            outcome,
            reconnected: Vec::new(),
        })
    }

    fn extend_canonical(&mut self, block: Block, next_ledger: LedgerState) -> Result<AppendOutcome> {
        let old_tip_index = self.tree.tip_index();
        ChainStore::new(&self.storage).commit_canonical(std::slice::from_ref(&block), old_tip_index)?;

        let interval = block
            .header
            .timestamp
            .saturating_sub(self.tree.tip().header.timestamp);
        let hash = block.hash();
        let index = block.index();

        self.tree.push_canonical(block);
        self.ledger = next_ledger;
        self.difficulty.on_block_accepted(Duration::from_secs(interval));
        self.refresh_mempool();
        self.signal.bump(self.tree.len());

        tracing::info!(index, hash = %hash, difficulty = self.difficulty.target(), "block appended");
        Ok(AppendOutcome::Extended)
    }

    fn reorganize(&mut self, block: Block, mut branch: Branch) -> Result<AppendOutcome> {
        let old_tip = self.tip_hash();
        let old_tip_index = self.tree.tip_index();
        let new_tip = block.hash();
        let depth = old_tip_index - branch.fork_point;

        // Everything after the fork point on the winning branch, in order.
        let mut promoted: Vec<Block> = branch.hashes[..branch.hashes.len() - 1]
            .iter()
            .filter_map(|h| self.tree.get(h).cloned())
            .collect();
        promoted.push(block.clone());
        ChainStore::new(&self.storage).commit_canonical(&promoted, old_tip_index)?;

        let next_ledger = std::mem::take(&mut branch.ledger);
        let old_ledger = std::mem::replace(&mut self.ledger, next_ledger);
        let dropped = self.tree.reorganize(block, branch, old_ledger);

        let params = &self.config.consensus;
        let ledger = &self.ledger;
        let orphaned_txs: Vec<Transaction> = dropped
            .into_iter()
            .flat_map(|b| b.transactions)
            .filter(|tx| !tx.is_reward() && validate_transaction(tx, ledger, params).is_ok())
            .collect();
        let returned = self.mempool.restore(orphaned_txs);
        self.refresh_mempool();

        let tip = self.tree.tip();
        let target = self.expected_difficulty_for_child(tip);
        self.difficulty.set_target(target);
        self.signal.bump(self.tree.len());

        tracing::warn!(
            old_tip = %old_tip,
            new_tip = %new_tip,
            depth,
            returned,
            "chain reorganized"
        );
        Ok(AppendOutcome::Reorganized {
            old_tip,
            new_tip,
            depth,
            returned,
        })
    }

    /// Drop pending transactions the canonical tip has confirmed or can no
    /// longer fund.
    fn refresh_mempool(&mut self) {
        let ledger = &self.ledger;
        let dropped = self.mempool.retain(|tx| {
            !ledger.is_confirmed(&tx.hash()) && TransactionValidator::check_funds(tx, ledger).is_ok()
        });
        if dropped > 0 {
            tracing::debug!(dropped, "removed confirmed or unfundable transactions from pool");
        }
    }
}
