//! Core blockchain primitives for powchain.
//!
//! This crate provides the fundamental types used throughout the node:
//! - Blake3 hashing and leading-zero-bit difficulty checks
//! - Merkle roots over ordered transaction hashes
//! - Ed25519 keys, signatures and addresses
//! - Transactions and blocks

pub mod block;
pub mod crypto;
pub mod hash;
pub mod merkle;
pub mod transaction;

// Re-export commonly used types at the crate root
pub use block::{Block, BlockHeader, GENESIS_TIMESTAMP};
pub use crypto::{Address, CryptoError, Keypair, PublicKey, Signature};
pub use hash::{hash, hash_concat, Hash, H256};
pub use merkle::merkle_root;
pub use transaction::{Transaction, TransactionError};
