//! The seam between the sync protocol and the wire.

use crate::error::Result;
use crate::message::{BlockAnnouncement, ChainSummary, Handshake, TransactionAnnouncement};
use async_trait::async_trait;
use powchain_core::Block;

/// Outbound requests to a peer identified by its listen address.
///
/// Implementations need not enforce timeouts; the protocol wraps every call.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Exchange handshakes; returns the peer's.
    async fn handshake(&self, addr: &str, hello: &Handshake) -> Result<Handshake>;

    /// Canonical blocks `from..=to` of the peer. May return fewer.
    async fn request_range(&self, addr: &str, from: u64, to: u64) -> Result<Vec<Block>>;

    async fn send_block(&self, addr: &str, message: &BlockAnnouncement) -> Result<()>;

    async fn send_transaction(&self, addr: &str, message: &TransactionAnnouncement) -> Result<()>;

    async fn status(&self, addr: &str) -> Result<ChainSummary>;

    /// Listen addresses the peer knows about.
    async fn peers(&self, addr: &str) -> Result<Vec<String>>;
}
