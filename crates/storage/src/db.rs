//! Thin sled handle: bincode-encoded reads and atomic write batches.
//!
//! Every mutation goes through [`Storage::batch`] so a block, its height
//! index entry and the head pointer always land together.

use powchain_core::Hash;
use sled::Db;
use std::path::Path;
use thiserror::Error;

const BLOCK_HASH_PREFIX: &[u8] = b"block:hash:";

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(#[from] sled::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("Invalid genesis: {0}")]
    InvalidGenesis(String),

    #[error("Corrupt chain data: {0}")]
    Corrupt(String),
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// Shared handle to the chain database. Clones point at the same tree.
#[derive(Clone)]
pub struct Storage {
    db: Db,
}

impl Storage {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Ok(Self {
            db: sled::open(path)?,
        })
    }

    /// In-memory database removed on drop.
    pub fn open_temporary() -> Result<Self> {
        Ok(Self {
            db: sled::Config::new().temporary(true).open()?,
        })
    }

    /// Decode the value under `key`, if any.
    pub fn get<K, V>(&self, key: K) -> Result<Option<V>>
    where
        K: AsRef<[u8]>,
        V: serde::de::DeserializeOwned,
    {
        self.db
            .get(key)?
            .map(|bytes| bincode::deserialize(&bytes))
            .transpose()
            .map_err(StorageError::from)
    }

    /// Apply `operations` atomically: all of them or none.
    pub fn batch(&self, operations: Vec<BatchOp>) -> Result<()> {
        let batch = operations
            .into_iter()
            .fold(sled::Batch::default(), |mut batch, op| {
                match op {
                    BatchOp::Insert { key, value } => batch.insert(key, value),
                    BatchOp::Remove { key } => batch.remove(key),
                }
                batch
            });
        self.db.apply_batch(batch)?;
        Ok(())
    }

    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }

    /// `block:height:<decimal height>`
    pub fn block_height_key(height: u64) -> Vec<u8> {
        format!("block:height:{height}").into_bytes()
    }

    /// `block:hash:` followed by the raw 32 hash bytes.
    pub fn block_hash_key(hash: &Hash) -> Vec<u8> {
        [BLOCK_HASH_PREFIX, &hash.0[..]].concat()
    }
}

/// One write inside an atomic [`Storage::batch`].
pub enum BatchOp {
    Insert { key: Vec<u8>, value: Vec<u8> },
    Remove { key: Vec<u8> },
}

impl BatchOp {
    pub fn put<V: serde::Serialize>(key: impl Into<Vec<u8>>, value: &V) -> Result<Self> {
        Ok(Self::Insert {
            key: key.into(),
            value: bincode::serialize(value)?,
        })
    }

    pub fn remove(key: impl Into<Vec<u8>>) -> Self {
        Self::Remove { key: key.into() }
    }
}
