//! Block and block header structures.

use crate::crypto::Address;
use crate::hash::{hash, Hash};
use crate::merkle::merkle_root;
use crate::transaction::Transaction;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Fixed genesis timestamp so every node derives the same genesis block.
pub const GENESIS_TIMESTAMP: u64 = 1_700_000_000;

/// The proof-of-work header. Its hash is the block hash; it is never stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    /// Position in the chain (0 for genesis).
    pub index: u64,
    /// Hash of the parent block.
    pub prev_hash: Hash,
    /// Merkle root of the transaction hashes, in block order.
    pub merkle_root: Hash,
    /// Unix timestamp in seconds.
    pub timestamp: u64,
    /// Proof-of-work nonce.
    pub nonce: u64,
    /// Required leading zero bits of the header hash.
    pub difficulty: u32,
}

impl BlockHeader {
    pub fn hash(&self) -> Hash {
        let encoded = bincode::serialize(self).expect("serialization should not fail");
        hash(&encoded)
    }

    /// Whether the header hash satisfies the difficulty it declares.
    pub fn meets_difficulty(&self) -> bool {
        self.hash().meets_difficulty(self.difficulty)
    }

    pub fn current_timestamp() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("time went backwards")
            .as_secs()
    }
}

/// A block: header plus its ordered transactions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
}

impl Block {
    /// Assemble an unmined block (nonce 0) with its merkle root filled in.
    pub fn new(
        index: u64,
        prev_hash: Hash,
        transactions: Vec<Transaction>,
        difficulty: u32,
        timestamp: u64,
    ) -> Self {
        let merkle_root = Self::merkle_root_of(&transactions);
        Self {
            header: BlockHeader {
                index,
                prev_hash,
                merkle_root,
                timestamp,
                nonce: 0,
                difficulty,
            },
            transactions,
        }
    }

    /// The genesis block. `allocations` become reward-style transactions
    /// that seed balances; the same inputs always give the same hash.
    pub fn genesis(difficulty: u32, allocations: &[(Address, u64)]) -> Self {
        let transactions = allocations
            .iter()
            .enumerate()
            .map(|(i, (address, amount))| {
                Transaction::reward(*address, *amount, i as u64, GENESIS_TIMESTAMP)
            })
            .collect();
        Self::new(0, Hash::ZERO, transactions, difficulty, GENESIS_TIMESTAMP)
    }

    pub fn hash(&self) -> Hash {
        self.header.hash()
    }

    pub fn index(&self) -> u64 {
        self.header.index
    }

    pub fn is_genesis(&self) -> bool {
        self.header.index == 0 && self.header.prev_hash == Hash::ZERO
    }

    pub fn tx_count(&self) -> usize {
        self.transactions.len()
    }

    /// The leading reward transaction, if the block has one.
    pub fn reward(&self) -> Option<&Transaction> {
        self.transactions.first().filter(|tx| tx.is_reward())
    }

    fn merkle_root_of(transactions: &[Transaction]) -> Hash {
        let leaves: Vec<Hash> = transactions.iter().map(Transaction::hash).collect();
        merkle_root(&leaves)
    }

    pub fn compute_merkle_root(&self) -> Hash {
        Self::merkle_root_of(&self.transactions)
    }

    pub fn verify_merkle_root(&self) -> bool {
        self.compute_merkle_root() == self.header.merkle_root
    }

    /// Encoded size in bytes, as counted against the block size limit.
    pub fn encoded_size(&self) -> usize {
        bincode::serialized_size(self).expect("serialization should not fail") as usize
    }
}
