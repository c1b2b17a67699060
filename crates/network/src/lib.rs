//! Peer-to-peer layer for powchain.
//!
//! - **Protocol**: bootstrap by role, fork-aware sync, relay and liveness
//! - **Peers**: table with failure counting, eviction and blacklist
//! - **Transport**: async trait over the wire, with an HTTP/JSON implementation
//!
//! # Example
//!
//! ```rust,no_run
//! use powchain_chain::{Blockchain, BlockchainConfig};
//! use powchain_network::{HttpTransport, NetworkConfig, NodeRole, PeerProtocol};
//! use std::sync::Arc;
//!
//! # async fn run() -> powchain_network::Result<()> {
//! let chain = Blockchain::in_memory(BlockchainConfig::default())?.shared();
//! let config = NetworkConfig {
//!     role: NodeRole::Regular,
//!     bootstrap: Some("10.0.0.1:8333".into()),
//!     ..NetworkConfig::default()
//! };
//! let protocol = Arc::new(PeerProtocol::new(chain, HttpTransport::new()?, config));
//! protocol.start().await?;
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod http;
pub mod message;
pub mod peer;
pub mod protocol;
pub mod transport;

// Re-export commonly used types
pub use error::{NetworkError, Result};
pub use http::HttpTransport;
pub use message::{
    BlockAnnouncement, ChainSummary, Handshake, PeerList, RangeQuery, TransactionAnnouncement,
    PROTOCOL_VERSION,
};
pub use peer::{FailureOutcome, Peer, PeerInfo, PeerTable};
pub use protocol::{
    BlockDisposition, NetworkConfig, NodeRole, PeerProtocol, ProbeReport, SyncReport, SyncState,
    TransactionDisposition,
};
pub use transport::Transport;
