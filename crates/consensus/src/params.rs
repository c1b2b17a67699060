//! Network-wide consensus parameters.

use serde::{Deserialize, Serialize};

/// Limits and economics every node must agree on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsensusParams {
    /// Largest amount a single transfer may move.
    pub max_amount: u64,
    /// Largest fee a single transfer may pay.
    pub max_fee: u64,
    /// Exact amount of the block reward transaction.
    pub mining_reward: u64,
    /// Maximum transactions per block, reward included.
    pub max_transactions_per_block: usize,
    /// Maximum encoded block size in bytes.
    pub max_block_size: usize,
    /// How far a block timestamp may run ahead of local time, in seconds.
    pub max_future_drift: u64,
}

impl Default for ConsensusParams {
    fn default() -> Self {
        Self {
            max_amount: 1_000_000_000,
            max_fee: 1_000_000,
            mining_reward: 50,
            max_transactions_per_block: 100,
            max_block_size: 1_000_000,
            max_future_drift: 7_200,
        }
    }
}
