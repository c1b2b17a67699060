//! Node assembly: chain, peer protocol, miner and their lifecycle.

use crate::config::NodeConfig;
use crate::error::Result;
use parking_lot::Mutex;
use powchain_chain::{Blockchain, ChainError, Miner, MinerHandle, MinerState, SharedChain};
use powchain_core::{Address, Block, Hash, Transaction};
use powchain_network::{
    HttpTransport, NodeRole, PeerInfo, PeerProtocol, SyncState, TransactionAnnouncement,
    TransactionDisposition, Transport,
};
use powchain_storage::Storage;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

/// Snapshot returned by [`Node::status`].
#[derive(Debug, Clone, Serialize)]
pub struct NodeStatus {
    pub height: u64,
    pub peer_count: usize,
    pub difficulty: u32,
    pub tip: Hash,
    pub pending: usize,
    pub sync_state: SyncState,
    pub role: NodeRole,
    pub forks: usize,
    pub orphans: usize,
    pub mining: bool,
    /// Phase of the mining thread, absent when not mining.
    pub miner: Option<MinerState>,
}

/// Outcome of re-validating the canonical chain.
#[derive(Debug, Clone, Serialize)]
pub struct ChainValidation {
    pub valid: bool,
    pub height: u64,
    pub tip: Hash,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// A running powchain node.
pub struct Node<T: Transport = HttpTransport> {
    config: NodeConfig,
    chain: SharedChain,
    protocol: Arc<PeerProtocol<T>>,
    miner: Mutex<Option<MinerHandle>>,
    shutdown: watch::Sender<bool>,
}

impl Node<HttpTransport> {
    /// Open a node that talks to peers over HTTP.
    pub fn open(config: NodeConfig) -> Result<Self> {
        let transport = HttpTransport::with_timeout(
            std::time::Duration::from_millis(config.request_timeout_ms.max(1)),
        )?;
        Self::new(config, transport)
    }
}

impl<T: Transport> Node<T> {
    /// Open the chain under `config.data_dir`.
    pub fn new(config: NodeConfig, transport: T) -> Result<Self> {
        std::fs::create_dir_all(&config.data_dir)?;
        let storage = Storage::open(&config.data_dir)?;
        Self::with_storage(config, storage, transport)
    }

    pub fn with_storage(config: NodeConfig, storage: Storage, transport: T) -> Result<Self> {
        let chain = Blockchain::open(storage, config.blockchain_config()?)?.shared();
        let protocol = Arc::new(PeerProtocol::new(
            chain.clone(),
            transport,
            config.network_config(),
        ));
        let (shutdown, _) = watch::channel(false);

        {
            let chain = chain.lock();
            tracing::info!(
                role = %config.role,
                height = chain.height(),
                tip = %chain.tip_hash(),
                genesis = %chain.genesis_hash(),
                "node opened"
            );
        }

        Ok(Self {
            config,
            chain,
            protocol,
            miner: Mutex::new(None),
            shutdown,
        })
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn chain(&self) -> &SharedChain {
        &self.chain
    }

    pub fn protocol(&self) -> &Arc<PeerProtocol<T>> {
        &self.protocol
    }

    /// Join the network, then start maintenance and, if configured, mining.
    ///
    /// A regular node that cannot reach its bootstrap peer returns
    /// [`NodeError::BootstrapFailed`](crate::NodeError::BootstrapFailed) and starts nothing.
    pub async fn start(&self) -> Result<()> {
        let miner_config = self.config.miner_config()?;

        self.protocol.start().await?;

        tokio::spawn(Arc::clone(&self.protocol).run_maintenance(self.shutdown.subscribe()));

        if let Some(miner_config) = miner_config {
            let (announcer, blocks) = mpsc::unbounded_channel();
            tokio::spawn(Arc::clone(&self.protocol).run_announcer(blocks));
            let handle = Miner::new(self.chain.clone(), miner_config)
                .with_announcer(announcer)
                .spawn()?;
            *self.miner.lock() = Some(handle);
        }

        tracing::info!(
            role = %self.config.role,
            state = ?self.protocol.state(),
            peers = self.protocol.peer_count(),
            mining = self.is_mining(),
            "node started"
        );
        Ok(())
    }

    pub fn is_mining(&self) -> bool {
        self.miner.lock().is_some()
    }

    pub fn miner_state(&self) -> Option<MinerState> {
        self.miner.lock().as_ref().map(MinerHandle::state)
    }

    /// Queue a transaction and relay it to peers.
    pub fn submit_transaction(&self, tx: Transaction) -> Result<Hash> {
        let hash = tx.hash();
        let announcement = TransactionAnnouncement {
            transaction: tx,
            origin: None,
        };
        match self.protocol.on_transaction(announcement)? {
            TransactionDisposition::Accepted(hash) => Ok(hash),
            TransactionDisposition::Known => Err(ChainError::DuplicateTransaction(hash).into()),
        }
    }

    /// Canonical blocks `from..=to`.
    pub fn get_chain(&self, from: u64, to: u64) -> Result<Vec<Block>> {
        Ok(self.chain.lock().get_range(from, to)?)
    }

    pub fn balance(&self, address: &Address) -> u64 {
        self.chain.lock().balance(address)
    }

    pub fn peers(&self) -> Vec<PeerInfo> {
        self.protocol.peers()
    }

    pub fn status(&self) -> NodeStatus {
        let chain = self.chain.lock().status();
        NodeStatus {
            height: chain.height,
            peer_count: self.protocol.peer_count(),
            difficulty: chain.difficulty,
            tip: chain.tip,
            pending: chain.pending,
            sync_state: self.protocol.state(),
            role: self.config.role,
            forks: chain.forks,
            orphans: chain.orphans,
            mining: self.is_mining(),
            miner: self.miner_state(),
        }
    }

    /// Replay the canonical chain from genesis and report whether it holds.
    pub fn validate(&self) -> ChainValidation {
        let chain = self.chain.lock();
        let error = match chain.verify() {
            Ok(()) => None,
            Err(e) => {
                tracing::error!(error = %e, "canonical chain failed verification");
                Some(e.to_string())
            }
        };
        ChainValidation {
            valid: error.is_none(),
            height: chain.height(),
            tip: chain.tip_hash(),
            error,
        }
    }

    /// Resolves once [`Node::shutdown`] has been called.
    pub fn shutdown_signal(&self) -> impl Future<Output = ()> + Send + 'static {
        let mut stopped = self.shutdown.subscribe();
        async move {
            let _ = stopped.wait_for(|stop| *stop).await;
        }
    }

    /// Stop background work and flush the chain to disk.
    pub fn shutdown(&self) -> Result<()> {
        self.shutdown.send_replace(true);
        if let Some(miner) = self.miner.lock().take() {
            miner.stop();
        }
        self.chain.lock().flush()?;
        tracing::info!("node stopped");
        Ok(())
    }
}
