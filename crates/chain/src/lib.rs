//! Chain model for powchain.
//!
//! This crate brings the consensus rules and the block store together:
//! - **Tree**: canonical chain plus competing fork branches
//! - **Blockchain**: append, reorganization, orphan reconnection and queries
//! - **Mempool**: bounded pool of pending transactions
//! - **Miner**: proof-of-work block producer on its own thread
//!
//! # Example
//!
//! ```rust,no_run
//! use powchain_chain::{Blockchain, BlockchainConfig, Miner, MinerConfig};
//! use powchain_core::Keypair;
//! use powchain_storage::Storage;
//!
//! let storage = Storage::open("./chain_data").unwrap();
//! let chain = Blockchain::open(storage, BlockchainConfig::default())
//!     .unwrap()
//!     .shared();
//!
//! let miner = Miner::new(chain.clone(), MinerConfig::new(Keypair::generate().address()));
//! let handle = miner.spawn().unwrap();
//! // ...
//! handle.stop();
//! ```

pub mod blockchain;
pub mod error;
pub mod mempool;
pub mod miner;
pub mod orphans;
pub mod signal;
pub mod tree;

// Re-export commonly used types
pub use blockchain::{
    AppendOutcome, AppendReport, Blockchain, BlockchainConfig, ChainStatus, SharedChain,
};
pub use error::{CapacityError, ChainError, LinkageError, Result};
pub use mempool::{Mempool, MempoolConfig, MempoolError};
pub use miner::{MineOutcome, Miner, MinerConfig, MinerHandle, MinerState};
pub use orphans::OrphanPool;
pub use signal::TipSignal;
pub use tree::{BlockTree, Branch, ParentPosition};
