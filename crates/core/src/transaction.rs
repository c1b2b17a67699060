//! Transfer and reward transactions.

use crate::block::BlockHeader;
use crate::crypto::{Address, Keypair, PublicKey, Signature};
use crate::hash::{hash, Hash};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from checking a transaction's signature.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransactionError {
    #[error("missing signature or public key")]
    MissingSignature,
    #[error("public key does not own sender address {0}")]
    KeyMismatch(Address),
    #[error("signature verification failed")]
    VerificationFailed,
}

/// A value transfer, or the reward that pays a block's miner.
///
/// Reward transactions are sent from [`Address::ZERO`] and carry no key or
/// signature. Their nonce is the index of the block that mints them so two
/// rewards to the same miner never share an identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub sender: Address,
    pub recipient: Address,
    pub amount: u64,
    pub fee: u64,
    /// Caller-chosen value distinguishing otherwise identical transfers.
    pub nonce: u64,
    /// Unix seconds at creation.
    pub timestamp: u64,
    /// Sender's verifying key (None for rewards).
    pub public_key: Option<PublicKey>,
    pub signature: Signature,
}

#[derive(Serialize)]
struct SigningPayload<'a> {
    sender: &'a Address,
    recipient: &'a Address,
    amount: u64,
    fee: u64,
    nonce: u64,
    timestamp: u64,
}

impl Transaction {
    /// Create an unsigned transfer stamped with the current time.
    pub fn transfer(sender: Address, recipient: Address, amount: u64, fee: u64, nonce: u64) -> Self {
        Self {
            sender,
            recipient,
            amount,
            fee,
            nonce,
            timestamp: BlockHeader::current_timestamp(),
            public_key: None,
            signature: Signature::default(),
        }
    }

    /// Create the reward paid to the miner of block `index`.
    pub fn reward(recipient: Address, amount: u64, index: u64, timestamp: u64) -> Self {
        Self {
            sender: Address::ZERO,
            recipient,
            amount,
            fee: 0,
            nonce: index,
            timestamp,
            public_key: None,
            signature: Signature::default(),
        }
    }

    /// Override the creation time (must be called before signing).
    pub fn with_timestamp(mut self, timestamp: u64) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn is_reward(&self) -> bool {
        self.sender.is_zero() && self.public_key.is_none()
    }

    /// Hash of every field except the signature and key; this is what gets signed.
    pub fn signing_hash(&self) -> Hash {
        let payload = SigningPayload {
            sender: &self.sender,
            recipient: &self.recipient,
            amount: self.amount,
            fee: self.fee,
            nonce: self.nonce,
            timestamp: self.timestamp,
        };
        let encoded = bincode::serialize(&payload).expect("serialization should not fail");
        hash(&encoded)
    }

    /// Transaction identity: hash of the full signed encoding.
    pub fn hash(&self) -> Hash {
        let encoded = bincode::serialize(self).expect("serialization should not fail");
        hash(&encoded)
    }

    pub fn sign(&mut self, keypair: &Keypair) {
        self.public_key = Some(keypair.public_key.clone());
        self.signature = keypair.sign_hash(&self.signing_hash());
    }

    pub fn signed(mut self, keypair: &Keypair) -> Self {
        self.sign(keypair);
        self
    }

    /// Check that the attached key owns `sender` and signed this payload.
    pub fn verify_signature(&self) -> Result<(), TransactionError> {
        let key = self
            .public_key
            .as_ref()
            .ok_or(TransactionError::MissingSignature)?;
        if self.signature.is_empty() {
            return Err(TransactionError::MissingSignature);
        }
        if key.to_address() != self.sender {
            return Err(TransactionError::KeyMismatch(self.sender));
        }
        key.verify(self.signing_hash().as_bytes(), &self.signature)
            .map_err(|_| TransactionError::VerificationFailed)
    }

    /// Amount plus fee, or None on overflow.
    pub fn total_cost(&self) -> Option<u64> {
        self.amount.checked_add(self.fee)
    }

    /// Encoded size in bytes, as counted against the block size limit.
    pub fn encoded_size(&self) -> usize {
        bincode::serialized_size(self).expect("serialization should not fail") as usize
    }
}
