//! Proof-of-work consensus rules for powchain.
//!
//! This crate provides:
//! - Transaction and block validation against a branch's ledger state
//! - Ledger (balance) state replayed from blocks
//! - Bang-bang difficulty retargeting
//! - Proof-of-work nonce search
//!
//! # Example
//!
//! ```rust,no_run
//! use powchain_consensus::{validate_block, ConsensusParams, DifficultyConfig, LedgerState};
//! use powchain_core::{Block, BlockHeader};
//!
//! let params = ConsensusParams::default();
//! let difficulty = DifficultyConfig::default();
//! let genesis = Block::genesis(difficulty.initial_difficulty, &[]);
//! let ledger = LedgerState::replay([&genesis]);
//!
//! # let block: Block = unimplemented!();
//! let expected = difficulty.expected_difficulty(&genesis.header, None);
//! let next = validate_block(&block, &genesis, expected, &ledger, &params, BlockHeader::current_timestamp())
//!     .unwrap();
//! ```

pub mod difficulty;
pub mod ledger;
pub mod params;
pub mod pow;
pub mod validator;

// Re-export commonly used types
pub use difficulty::{DifficultyConfig, DifficultyController, MIN_DIFFICULTY};
pub use ledger::LedgerState;
pub use params::ConsensusParams;
pub use pow::{search_nonce, SearchOutcome};
pub use validator::{
    validate_block, validate_transaction, BlockValidator, SequentialLedger, TransactionValidator,
    ValidationError,
};
