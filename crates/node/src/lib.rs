//! powchain node: configuration, logging, HTTP API and lifecycle.
//!
//! A [`Node`] owns the shared chain, the peer protocol and, when a miner
//! address is configured, the mining thread. [`api::serve`] exposes it over
//! HTTP: the `/p2p/*` routes other nodes call, plus a small client surface.
//!
//! # Example
//!
//! ```rust,no_run
//! use powchain_node::{api, Node, NodeConfig};
//! use std::sync::Arc;
//!
//! # async fn run() -> anyhow::Result<()> {
//! let config = NodeConfig::from_toml_file("powchain.toml")?;
//! let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
//! let node = Arc::new(Node::open(config)?);
//!
//! tokio::spawn(api::serve(Arc::clone(&node), listener, node.shutdown_signal()));
//! node.start().await?;
//! # Ok(())
//! # }
//! ```

pub mod api;
pub mod config;
pub mod error;
pub mod logging;
pub mod node;

// Re-export commonly used types
pub use api::{router, serve, ApiError};
pub use config::{GenesisAllocation, NodeConfig};
pub use error::{NodeError, Result};
pub use logging::{init_logging, LogFormat};
pub use node::{ChainValidation, Node, NodeStatus};
