//! Errors returned by the chain model.

use crate::mempool::MempoolError;
use powchain_consensus::ValidationError;
use powchain_core::Hash;
use powchain_storage::StorageError;
use thiserror::Error;

/// Why a block could not be attached where it claims to belong.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LinkageError {
    #[error("parent {0} is unknown; block buffered as orphan")]
    Orphan(Hash),

    #[error("block {0} is already known")]
    AlreadyKnown(Hash),

    #[error("parent at index {parent_index} is below the fork horizon (tip {tip_index}, max depth {max_depth})")]
    TooDeep {
        parent_index: u64,
        tip_index: u64,
        max_depth: u64,
    },
}

/// Backpressure: the item was well-formed but there is no room for it.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CapacityError {
    #[error("pending pool is full (capacity: {0})")]
    PoolFull(usize),

    #[error("sender has too many pending transactions (limit: {0})")]
    SenderLimit(usize),

    #[error("block too large (max {max} bytes, got {got})")]
    BlockTooLarge { max: usize, got: usize },
}

/// Errors from chain and pool operations.
#[derive(Debug, Error)]
pub enum ChainError {
    #[error("invalid block: {0}")]
    InvalidBlock(ValidationError),

    #[error("invalid linkage: {0}")]
    InvalidLinkage(#[from] LinkageError),

    #[error("capacity: {0}")]
    Capacity(#[from] CapacityError),

    #[error("invalid transaction: {0}")]
    InvalidTransaction(ValidationError),

    #[error("transaction {0} is already pending")]
    DuplicateTransaction(Hash),

    #[error("transaction not found")]
    TransactionNotFound,

    #[error("transaction is {age}s old (max {max_age}s)")]
    ExpiredTransaction { age: u64, max_age: u64 },

    #[error("range {from}..={to} out of bounds (height {height})")]
    OutOfRange { from: u64, to: u64, height: u64 },

    #[error("stored genesis {stored} does not match configured genesis {expected}")]
    GenesisMismatch { stored: Hash, expected: Hash },

    #[error("stored chain failed verification at index {index}: {reason}")]
    CorruptChain { index: u64, reason: String },

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

impl From<MempoolError> for ChainError {
    fn from(err: MempoolError) -> Self {
        match err {
            MempoolError::DuplicateTransaction(hash) => ChainError::DuplicateTransaction(hash),
            MempoolError::Capacity(capacity) => ChainError::Capacity(capacity),
            MempoolError::TransactionNotFound => ChainError::TransactionNotFound,
        }
    }
}

pub type Result<T> = std::result::Result<T, ChainError>;
