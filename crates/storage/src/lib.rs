//! Persistent storage layer for powchain.
//!
//! This crate stores the canonical chain on disk:
//! - Blocks keyed by hash (bincode, header fields plus transactions)
//! - A height index pointing at canonical block hashes
//! - Head and tip index metadata
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                    Application Layer                     │
//! │              (Blockchain, fork tree, miner)              │
//! └────────────────────────┬────────────────────────────────┘
//!                          │
//! ┌────────────────────────▼────────────────────────────────┐
//! │                   Storage Layer                          │
//! │       ┌─────────────────┐   ┌─────────────────┐         │
//! │       │ ChainStore      │   │ Storage (DB)    │         │
//! │       │  - Blocks       │   │  - sled wrapper │         │
//! │       │  - Height index │   │  - bincode      │         │
//! │       │  - Head         │   │  - atomic batch │         │
//! │       └─────────────────┘   └─────────────────┘         │
//! └────────────────────────┬────────────────────────────────┘
//!                          │
//! ┌────────────────────────▼────────────────────────────────┐
//! │                    sled Database                         │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use powchain_storage::{ChainStore, Storage};
//! use powchain_core::Block;
//!
//! let storage = Storage::open("./chain_data").unwrap();
//! let chain = ChainStore::new(&storage);
//! chain.init_genesis(&Block::genesis(4, &[])).unwrap();
//! let blocks = chain.load_canonical().unwrap();
//! ```

pub mod chain;
pub mod db;

// Re-export commonly used types
pub use chain::ChainStore;
pub use db::{BatchOp, Result, Storage, StorageError};
