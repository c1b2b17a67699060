//! Transaction mempool for pending transactions.
//!
//! The mempool stores transactions waiting to be included in a block. It is
//! bounded: when full it rejects new transactions with a capacity error and
//! never evicts what it already holds.

use crate::error::CapacityError;
use powchain_core::{Address, Hash, Transaction};
use std::collections::{HashMap, VecDeque};
use thiserror::Error;

/// Errors that can occur during mempool operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MempoolError {
    #[error("transaction {0} already in mempool")]
    DuplicateTransaction(Hash),

    #[error(transparent)]
    Capacity(#[from] CapacityError),

    #[error("transaction not found in mempool")]
    TransactionNotFound,
}

pub type Result<T> = std::result::Result<T, MempoolError>;

/// Configuration for the mempool.
#[derive(Debug, Clone)]
pub struct MempoolConfig {
    /// Maximum number of transactions in the mempool.
    pub max_transactions: usize,
    /// Maximum transactions per sender.
    pub max_per_account: usize,
}

impl Default for MempoolConfig {
    fn default() -> Self {
        Self {
            max_transactions: 10_000,
            max_per_account: 100,
        }
    }
}

/// Transaction mempool.
pub struct Mempool {
    /// Configuration.
    config: MempoolConfig,
    /// Transactions indexed by hash.
    transactions: HashMap<Hash, Transaction>,
    /// Transactions grouped by sender address, in arrival order.
    by_sender: HashMap<Address, VecDeque<Hash>>,
}

impl Mempool {
    /// Create a new mempool with default configuration.
    pub fn new() -> Self {
        Self::with_config(MempoolConfig::default())
    }

    /// Create a new mempool with the given configuration.
    pub fn with_config(config: MempoolConfig) -> Self {
        Self {
            config,
            transactions: HashMap::new(),
            by_sender: HashMap::new(),
        }
    }

    /// Get the number of transactions in the mempool.
    pub fn len(&self) -> usize {
        self.transactions.len()
    }

    /// Check if the mempool is empty.
    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }

    /// Check if a transaction is in the mempool.
    pub fn contains(&self, tx_hash: &Hash) -> bool {
        self.transactions.contains_key(tx_hash)
    }

    /// Add a transaction to the mempool.
    pub fn add(&mut self, tx: Transaction) -> Result<Hash> {
        let tx_hash = tx.hash();

        if self.contains(&tx_hash) {
            return Err(MempoolError::DuplicateTransaction(tx_hash));
        }

        if self.transactions.len() >= self.config.max_transactions {
            return Err(CapacityError::PoolFull(self.config.max_transactions).into());
        }

        let sender_txs = self.by_sender.entry(tx.sender).or_default();
        if sender_txs.len() >= self.config.max_per_account {
            return Err(CapacityError::SenderLimit(self.config.max_per_account).into());
        }

        sender_txs.push_back(tx_hash);
        self.transactions.insert(tx_hash, tx);

        Ok(tx_hash)
    }

    /// Remove a transaction from the mempool.
    pub fn remove(&mut self, tx_hash: &Hash) -> Result<Transaction> {
        let tx = self
            .transactions
            .remove(tx_hash)
            .ok_or(MempoolError::TransactionNotFound)?;

        if let Some(sender_txs) = self.by_sender.get_mut(&tx.sender) {
            sender_txs.retain(|h| h != tx_hash);
            if sender_txs.is_empty() {
                self.by_sender.remove(&tx.sender);
            }
        }

        Ok(tx)
    }

    /// Remove multiple transactions from the mempool, ignoring unknown ones.
    pub fn remove_batch(&mut self, tx_hashes: &[Hash]) {
        for hash in tx_hashes {
            let _ = self.remove(hash);
        }
    }

    /// Put back transactions from blocks dropped by a reorg.
    ///
    /// Goes through the normal admission limits; returns how many were
    /// actually re-admitted.
    pub fn restore(&mut self, txs: impl IntoIterator<Item = Transaction>) -> usize {
        let mut restored = 0;
        for tx in txs {
            match self.add(tx) {
                Ok(_) => restored += 1,
                Err(MempoolError::DuplicateTransaction(_)) => {}
                Err(e) => tracing::warn!(error = %e, "could not restore transaction to mempool"),
            }
        }
        restored
    }

    /// All transactions ordered by fee, highest first.
    ///
    /// Ties go to the older transaction, then to the lower hash, so every node
    /// orders the same pool the same way.
    pub fn by_fee(&self) -> Vec<Transaction> {
        let mut txs: Vec<_> = self.transactions.iter().collect();
        txs.sort_by(|(ha, a), (hb, b)| {
            b.fee
                .cmp(&a.fee)
                .then(a.timestamp.cmp(&b.timestamp))
                .then(ha.cmp(hb))
        });
        txs.into_iter().map(|(_, tx)| tx.clone()).collect()
    }

    /// Drop every transaction for which `keep` returns false.
    pub fn retain(&mut self, mut keep: impl FnMut(&Transaction) -> bool) -> usize {
        let doomed: Vec<Hash> = self
            .transactions
            .iter()
            .filter(|(_, tx)| !keep(tx))
            .map(|(h, _)| *h)
            .collect();
        self.remove_batch(&doomed);
        doomed.len()
    }
}

impl Default for Mempool {
    fn default() -> Self {
        Self::new()
    }
}
