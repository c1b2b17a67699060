//! Wire messages exchanged between peers.
//!
//! Every message is plain serde data; the HTTP transport carries it as JSON.

use powchain_core::{Block, Hash, Transaction};
use serde::{Deserialize, Serialize};

/// Bumped on any incompatible change to these messages or to consensus.
pub const PROTOCOL_VERSION: u32 = 1;

/// Sent in both directions when two nodes meet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Handshake {
    pub version: u32,
    pub genesis_hash: Hash,
    /// Canonical chain length of the sender.
    pub height: u64,
    /// Where the sender accepts connections, if it does.
    pub listen_addr: Option<String>,
}

/// Answer to a status probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainSummary {
    pub version: u32,
    pub genesis_hash: Hash,
    pub height: u64,
    pub tip: Hash,
    pub difficulty: u32,
}

/// Query for canonical blocks `from..=to`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeQuery {
    pub from: u64,
    pub to: u64,
}

/// A block pushed to a peer. `origin` is the sender's listen address, so the
/// receiver can sync from it and skip it when relaying.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockAnnouncement {
    pub block: Block,
    pub origin: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionAnnouncement {
    pub transaction: Transaction,
    pub origin: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerList {
    pub peers: Vec<String>,
}
