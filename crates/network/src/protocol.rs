//! Bootstrap, sync, relay and liveness.
//!
//! A node moves through `Unbootstrapped → Bootstrapping → Connected →
//! Syncing → Synced`. Every outbound call goes through the [`Transport`]
//! and is bounded by a timeout from [`NetworkConfig`]. The chain lock is
//! never held across an `.await`.

use crate::error::{NetworkError, Result};
use crate::message::{
    BlockAnnouncement, ChainSummary, Handshake, PeerList, TransactionAnnouncement,
    PROTOCOL_VERSION,
};
use crate::peer::{FailureOutcome, PeerInfo, PeerTable};
use crate::transport::Transport;
use futures::future::join_all;
use parking_lot::Mutex;
use powchain_chain::{AppendOutcome, ChainError, LinkageError, SharedChain};
use powchain_core::{Block, Hash};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

/// Where the node is in joining the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    Unbootstrapped,
    Bootstrapping,
    Connected,
    Syncing,
    Synced,
}

/// How a node joins the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NodeRole {
    /// First node of a network; starts connected without a handshake.
    Initial,
    /// Must complete the bootstrap handshake or refuse to start.
    #[default]
    Regular,
    /// Tries the bootstrap handshake but starts connected regardless.
    BootstrapSecondary,
}

impl NodeRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeRole::Initial => "initial",
            NodeRole::Regular => "regular",
            NodeRole::BootstrapSecondary => "bootstrap-secondary",
        }
    }
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeRole {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "initial" => Ok(NodeRole::Initial),
            "regular" => Ok(NodeRole::Regular),
            "bootstrap-secondary" | "bootstrap_secondary" => Ok(NodeRole::BootstrapSecondary),
            other => Err(format!(
                "unknown role '{other}' (expected initial, regular or bootstrap-secondary)"
            )),
        }
    }
}

/// Network configuration.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    pub role: NodeRole,
    /// Peer to bootstrap from.
    pub bootstrap: Option<String>,
    /// Address other nodes should use to reach this one.
    pub advertised_addr: Option<String>,
    pub max_peers: usize,
    /// Consecutive failures before a peer is evicted.
    pub failure_threshold: u32,
    pub blacklist_duration: Duration,
    pub liveness_interval: Duration,
    pub handshake_timeout: Duration,
    pub request_timeout: Duration,
    pub broadcast_timeout: Duration,
    pub probe_timeout: Duration,
    /// Blocks per range request.
    pub sync_batch_size: u64,
    /// How far back sync looks for a common ancestor.
    pub max_fork_depth: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            role: NodeRole::default(),
            bootstrap: None,
            advertised_addr: None,
            max_peers: 32,
            failure_threshold: 3,
            blacklist_duration: Duration::from_secs(600),
            liveness_interval: Duration::from_secs(30),
            handshake_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(10),
            broadcast_timeout: Duration::from_secs(5),
            probe_timeout: Duration::from_secs(5),
            sync_batch_size: 100,
            max_fork_depth: 64,
        }
    }
}

/// Outcome of a sync run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub remote_height: u64,
    /// Blocks connected, reconnected orphans included.
    pub appended: usize,
    pub reorganized: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockDisposition {
    Accepted(AppendOutcome),
    /// Parent unknown; a sync from the sender was started.
    Orphan,
    Known,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransactionDisposition {
    Accepted(Hash),
    Known,
}

/// Outcome of a liveness round.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProbeReport {
    pub alive: usize,
    pub evicted: Vec<String>,
    /// Peers we pulled new blocks from.
    pub synced: usize,
}

async fn bounded<R>(
    limit: Duration,
    operation: &'static str,
    addr: &str,
    call: impl Future<Output = Result<R>>,
) -> Result<R> {
    tokio::time::timeout(limit, call)
        .await
        .map_err(|_| NetworkError::Timeout {
            operation,
            addr: addr.to_string(),
        })?
}

fn is_unreachable(err: &NetworkError) -> bool {
    matches!(
        err,
        NetworkError::ConnectionRefused(_) | NetworkError::Timeout { .. }
    )
}

/// The peer protocol of one node.
pub struct PeerProtocol<T: Transport> {
    chain: SharedChain,
    transport: T,
    peers: Mutex<PeerTable>,
    state: Mutex<SyncState>,
    config: NetworkConfig,
}

impl<T: Transport> PeerProtocol<T> {
    pub fn new(chain: SharedChain, transport: T, config: NetworkConfig) -> Self {
        let peers = PeerTable::new(
            config.max_peers,
            config.failure_threshold,
            config.blacklist_duration,
        );
        Self {
            chain,
            transport,
            peers: Mutex::new(peers),
            state: Mutex::new(SyncState::Unbootstrapped),
            config,
        }
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    pub fn chain(&self) -> &SharedChain {
        &self.chain
    }

    pub fn state(&self) -> SyncState {
        *self.state.lock()
    }

    fn set_state(&self, state: SyncState) {
        let mut current = self.state.lock();
        if *current != state {
            tracing::debug!(from = ?*current, to = ?state, "sync state changed");
            *current = state;
        }
    }

    pub fn peer_count(&self) -> usize {
        self.peers.lock().len()
    }

    pub fn has_peer(&self, addr: &str) -> bool {
        self.peers.lock().contains(addr)
    }

    pub fn peer(&self, addr: &str) -> Option<PeerInfo> {
        self.peers.lock().get(addr).map(PeerInfo::from)
    }

    pub fn peers(&self) -> Vec<PeerInfo> {
        self.peers.lock().snapshot()
    }

    pub fn peer_list(&self) -> PeerList {
        PeerList {
            peers: self.peers.lock().addresses(),
        }
    }

    /// This node's chain as seen by a status probe.
    pub fn summary(&self) -> ChainSummary {
        let chain = self.chain.lock();
        ChainSummary {
            version: PROTOCOL_VERSION,
            genesis_hash: chain.genesis_hash(),
            height: chain.height(),
            tip: chain.tip_hash(),
            difficulty: chain.difficulty(),
        }
    }

    fn local_handshake(&self) -> Handshake {
        let chain = self.chain.lock();
        Handshake {
            version: PROTOCOL_VERSION,
            genesis_hash: chain.genesis_hash(),
            height: chain.height(),
            listen_addr: self.config.advertised_addr.clone(),
        }
    }

    fn check_compatible(&self, version: u32, genesis_hash: &Hash) -> Result<()> {
        if version != PROTOCOL_VERSION {
            return Err(NetworkError::Incompatible(format!(
                "protocol version {version}, expected {PROTOCOL_VERSION}"
            )));
        }
        let ours = self.chain.lock().genesis_hash();
        if *genesis_hash != ours {
            return Err(NetworkError::Incompatible(format!(
                "genesis {genesis_hash}, expected {ours}"
            )));
        }
        Ok(())
    }

    /// Count a failure against `addr`. Only regular nodes protect their
    /// bootstrap peer from eviction.
    fn note_failure(&self, addr: &str) -> FailureOutcome {
        let evict_bootstrap = self.config.role != NodeRole::Regular;
        let outcome = self.peers.lock().record_failure(addr, evict_bootstrap);
        match outcome {
            FailureOutcome::Evicted => tracing::warn!(peer = addr, "peer evicted and blacklisted"),
            FailureOutcome::Counted(failures) => tracing::debug!(peer = addr, failures, "peer failure recorded"),
            FailureOutcome::Unknown => {}
        }
        outcome
    }

    // =========================================================================
    // Startup
    // =========================================================================

    /// Join the network according to the configured role.
    ///
    /// For a regular node any bootstrap failure is returned as
    /// [`NetworkError::BootstrapFailed`] and the node stays unbootstrapped.
    pub async fn start(&self) -> Result<()> {
        match self.config.role {
            NodeRole::Initial => {
                tracing::info!("starting as initial node");
                self.set_state(SyncState::Connected);
                Ok(())
            }
            NodeRole::Regular => {
                let Some(addr) = self.config.bootstrap.clone() else {
                    return Err(NetworkError::BootstrapFailed {
                        addr: String::new(),
                        source: Box::new(NetworkError::Protocol(
                            "regular node has no bootstrap address".into(),
                        )),
                    });
                };
                if let Err(e) = self.bootstrap(&addr).await {
                    self.set_state(SyncState::Unbootstrapped);
                    return Err(NetworkError::BootstrapFailed {
                        addr,
                        source: Box::new(e),
                    });
                }
                Ok(())
            }
            NodeRole::BootstrapSecondary => {
                let joined = match self.config.bootstrap.clone() {
                    Some(addr) => match self.bootstrap(&addr).await {
                        Ok(()) => true,
                        Err(e) => {
                            tracing::warn!(bootstrap = %addr, error = %e, "bootstrap failed, starting without it");
                            false
                        }
                    },
                    None => false,
                };
                if !joined {
                    self.set_state(SyncState::Connected);
                }
                Ok(())
            }
        }
    }

    async fn bootstrap(&self, addr: &str) -> Result<()> {
        self.set_state(SyncState::Bootstrapping);
        self.handshake_with(addr, true).await?;
        self.set_state(SyncState::Connected);
        tracing::info!(bootstrap = addr, "bootstrap handshake complete");

        if let Err(e) = self.sync_from(addr).await {
            tracing::warn!(bootstrap = addr, error = %e, "initial sync failed");
        }
        Ok(())
    }

    // =========================================================================
    // Outbound
    // =========================================================================

    /// Handshake with `addr` and add it to the peer table.
    pub async fn handshake(&self, addr: &str) -> Result<PeerInfo> {
        self.handshake_with(addr, false).await
    }

    async fn handshake_with(&self, addr: &str, bootstrap: bool) -> Result<PeerInfo> {
        if self.peers.lock().is_blacklisted(addr) {
            return Err(NetworkError::Blacklisted(addr.to_string()));
        }
        let hello = self.local_handshake();
        let theirs = bounded(
            self.config.handshake_timeout,
            "handshake",
            addr,
            self.transport.handshake(addr, &hello),
        )
        .await?;
        self.check_compatible(theirs.version, &theirs.genesis_hash)?;

        let mut peers = self.peers.lock();
        if !peers.insert(addr, theirs.height, bootstrap) {
            return Err(NetworkError::Protocol(format!("peer table full, not adding {addr}")));
        }
        tracing::info!(peer = addr, height = theirs.height, "handshake complete");
        peers
            .get(addr)
            .map(PeerInfo::from)
            .ok_or_else(|| NetworkError::Protocol(format!("peer {addr} vanished after insert")))
    }

    /// Pull every block `addr` has that we do not.
    ///
    /// When the peer's next block does not connect, the request window steps
    /// back with doubling strides, no further than `max_fork_depth` blocks,
    /// to find the fork point. The first invalid block aborts the run and
    /// counts as a failure against the peer.
    pub async fn sync_from(&self, addr: &str) -> Result<SyncReport> {
        let remote = match bounded(
            self.config.probe_timeout,
            "status probe",
            addr,
            self.transport.status(addr),
        )
        .await
        {
            Ok(remote) => remote,
            Err(e) => {
                self.note_failure(addr);
                return Err(e);
            }
        };
        self.check_compatible(remote.version, &remote.genesis_hash)?;
        self.peers.lock().record_success(addr, remote.height);

        let local_height = self.chain.lock().height();
        if remote.height <= local_height {
            return Ok(SyncReport {
                remote_height: remote.height,
                ..SyncReport::default()
            });
        }

        let previous = self.state();
        self.set_state(SyncState::Syncing);
        tracing::info!(peer = addr, local_height, remote_height = remote.height, "syncing");

        match self.download(addr, remote.height, local_height).await {
            Ok(report) => {
                self.set_state(SyncState::Synced);
                tracing::info!(
                    peer = addr,
                    appended = report.appended,
                    reorganized = report.reorganized,
                    "sync complete"
                );
                Ok(report)
            }
            Err(e) => {
                self.set_state(previous);
                tracing::warn!(peer = addr, error = %e, "sync aborted");
                self.note_failure(addr);
                Err(e)
            }
        }
    }

    async fn download(&self, addr: &str, remote_height: u64, local_height: u64) -> Result<SyncReport> {
        let batch = self.config.sync_batch_size.max(1);
        let last_remote = remote_height - 1;
        let floor = local_height
            .saturating_sub(self.config.max_fork_depth)
            .max(1);

        let mut from = local_height;
        let mut stride = 1u64;
        let mut page = loop {
            let to = from.saturating_add(batch - 1).min(last_remote);
            let page = self.fetch(addr, from, to).await?;
            let connects = self.chain.lock().contains_block(&page[0].header.prev_hash);
            if connects {
                break page;
            }
            if from <= floor {
                return Err(NetworkError::Protocol(format!(
                    "no common ancestor with {addr} within {} blocks",
                    self.config.max_fork_depth
                )));
            }
            from = from.saturating_sub(stride).max(floor);
            stride = stride.saturating_mul(2);
            tracing::debug!(peer = addr, from, "stepping back to find fork point");
        };

        let mut report = SyncReport {
            remote_height,
            ..SyncReport::default()
        };
        loop {
            let last = page[page.len() - 1].index();
            self.apply_page(page, &mut report)?;
            if last >= last_remote {
                break;
            }
            let next = last + 1;
            page = self
                .fetch(addr, next, next.saturating_add(batch - 1).min(last_remote))
                .await?;
        }
        Ok(report)
    }

    /// A non-empty, in-order page starting at `from`.
    async fn fetch(&self, addr: &str, from: u64, to: u64) -> Result<Vec<Block>> {
        let mut page = bounded(
            self.config.request_timeout,
            "range request",
            addr,
            self.transport.request_range(addr, from, to),
        )
        .await?;
        page.truncate((to - from + 1) as usize);

        let in_order = page
            .iter()
            .enumerate()
            .all(|(offset, block)| block.index() == from + offset as u64);
        if page.is_empty() || !in_order {
            return Err(NetworkError::Protocol(format!(
                "peer {addr} answered range {from}..={to} with {} misplaced blocks",
                page.len()
            )));
        }
        Ok(page)
    }

    /// Blocks from earlier pages stay connected when this one fails.
    fn apply_page(&self, page: Vec<Block>, report: &mut SyncReport) -> Result<()> {
        let mut chain = self.chain.lock();
        for block in page {
            match chain.append_block(block) {
                Ok(appended) => {
                    report.appended += 1 + appended.reconnected.len();
                    if matches!(appended.outcome, AppendOutcome::Reorganized { .. }) {
                        report.reorganized = true;
                    }
                }
                Err(ChainError::InvalidLinkage(LinkageError::AlreadyKnown(_))) => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Send `block` to every peer but `except`. Returns how many accepted
    /// the delivery.
    pub async fn broadcast_block(&self, block: &Block, except: Option<&str>) -> usize {
        let message = BlockAnnouncement {
            block: block.clone(),
            origin: self.config.advertised_addr.clone(),
        };
        let targets = self.peers.lock().addresses_except(except);
        let sends = targets.iter().map(|addr| {
            let message = &message;
            async move {
                let result = bounded(
                    self.config.broadcast_timeout,
                    "block relay",
                    addr,
                    self.transport.send_block(addr, message),
                )
                .await;
                (addr.as_str(), result)
            }
        });
        let results = join_all(sends).await;
        self.tally("block", results)
    }

    pub async fn broadcast_transaction(
        &self,
        transaction: &powchain_core::Transaction,
        except: Option<&str>,
    ) -> usize {
        let message = TransactionAnnouncement {
            transaction: transaction.clone(),
            origin: self.config.advertised_addr.clone(),
        };
        let targets = self.peers.lock().addresses_except(except);
        let sends = targets.iter().map(|addr| {
            let message = &message;
            async move {
                let result = bounded(
                    self.config.broadcast_timeout,
                    "transaction relay",
                    addr,
                    self.transport.send_transaction(addr, message),
                )
                .await;
                (addr.as_str(), result)
            }
        });
        let results = join_all(sends).await;
        self.tally("transaction", results)
    }

    fn tally(&self, kind: &'static str, results: Vec<(&str, Result<()>)>) -> usize {
        let mut delivered = 0;
        for (addr, result) in results {
            match result {
                Ok(()) => delivered += 1,
                Err(e) => {
                    tracing::debug!(peer = addr, kind, error = %e, "relay failed");
                    if is_unreachable(&e) {
                        self.note_failure(addr);
                    }
                }
            }
        }
        delivered
    }

    /// Probe every peer; sync from any that is ahead.
    pub async fn probe_peers(&self) -> ProbeReport {
        let targets = self.peers.lock().addresses();
        let probes = targets.iter().map(|addr| async move {
            let result = bounded(
                self.config.probe_timeout,
                "status probe",
                addr,
                self.transport.status(addr),
            )
            .await;
            (addr.clone(), result)
        });
        let results = join_all(probes).await;

        let local_height = self.chain.lock().height();
        let mut report = ProbeReport::default();
        let mut ahead = Vec::new();
        for (addr, result) in results {
            let result = result.and_then(|summary| {
                self.check_compatible(summary.version, &summary.genesis_hash)
                    .map(|()| summary)
            });
            match result {
                Ok(summary) => {
                    self.peers.lock().record_success(&addr, summary.height);
                    report.alive += 1;
                    if summary.height > local_height {
                        ahead.push(addr);
                    }
                }
                Err(e) => {
                    tracing::debug!(peer = %addr, error = %e, "liveness probe failed");
                    if self.note_failure(&addr) == FailureOutcome::Evicted {
                        report.evicted.push(addr);
                    }
                }
            }
        }

        for addr in ahead {
            match self.sync_from(&addr).await {
                Ok(sync) if sync.appended > 0 => report.synced += 1,
                Ok(_) => {}
                Err(e) => tracing::warn!(peer = %addr, error = %e, "sync after probe failed"),
            }
        }
        report
    }

    /// Ask peers for their peers and handshake with new ones until full.
    pub async fn discover_peers(&self) -> usize {
        let known = self.peers.lock().addresses();
        let requests = known.iter().map(|addr| {
            bounded(
                self.config.request_timeout,
                "peer exchange",
                addr,
                self.transport.peers(addr),
            )
        });
        let mut candidates: Vec<String> = join_all(requests)
            .await
            .into_iter()
            .filter_map(|result| result.ok())
            .flatten()
            .collect();
        candidates.sort();
        candidates.dedup();

        let mut added = 0;
        for addr in candidates {
            if Some(&addr) == self.config.advertised_addr.as_ref() {
                continue;
            }
            {
                let peers = self.peers.lock();
                if peers.is_full() {
                    break;
                }
                if peers.contains(&addr) || peers.is_blacklisted(&addr) {
                    continue;
                }
            }
            match self.handshake(&addr).await {
                Ok(_) => added += 1,
                Err(e) => tracing::debug!(peer = %addr, error = %e, "discovered peer unreachable"),
            }
        }
        if added > 0 {
            tracing::info!(added, peers = self.peer_count(), "discovered new peers");
        }
        added
    }

    /// Liveness, discovery and housekeeping every `liveness_interval` until
    /// `shutdown` turns true.
    pub async fn run_maintenance(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.liveness_interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }

            let probe = self.probe_peers().await;
            let discovered = self.discover_peers().await;
            let orphans = self.chain.lock().prune_orphans();
            let unbanned = self.peers.lock().prune_blacklist();
            tracing::debug!(
                alive = probe.alive,
                evicted = probe.evicted.len(),
                discovered,
                orphans,
                unbanned,
                "maintenance round"
            );
        }
        tracing::debug!("maintenance stopped");
    }

    /// Relay blocks produced locally, e.g. by the miner.
    pub async fn run_announcer(self: Arc<Self>, mut blocks: mpsc::UnboundedReceiver<Block>) {
        while let Some(block) = blocks.recv().await {
            let delivered = self.broadcast_block(&block, None).await;
            tracing::debug!(index = block.index(), hash = %block.hash(), delivered, "announced block");
        }
    }

    // =========================================================================
    // Inbound
    // =========================================================================

    /// Answer a handshake, registering the caller's listen address.
    pub fn on_handshake(&self, hello: Handshake) -> Result<Handshake> {
        self.check_compatible(hello.version, &hello.genesis_hash)?;
        if let Some(addr) = hello.listen_addr.as_deref() {
            if Some(addr) != self.config.advertised_addr.as_deref() {
                let mut peers = self.peers.lock();
                if peers.is_blacklisted(addr) {
                    return Err(NetworkError::Blacklisted(addr.to_string()));
                }
                if peers.insert(addr, hello.height, false) {
                    tracing::debug!(peer = addr, height = hello.height, "registered inbound peer");
                }
            }
        }
        Ok(self.local_handshake())
    }

    /// Append a pushed block; relay it if new, sync from the sender if it
    /// does not connect.
    pub fn on_block(self: &Arc<Self>, message: BlockAnnouncement) -> Result<BlockDisposition> {
        let BlockAnnouncement { block, origin } = message;
        let result = self.chain.lock().append_block(block.clone());

        match result {
            Ok(report) => {
                tracing::debug!(index = report.index, hash = %report.hash, outcome = ?report.outcome, "received block");
                let this = Arc::clone(self);
                tokio::spawn(async move {
                    this.broadcast_block(&block, origin.as_deref()).await;
                });
                Ok(BlockDisposition::Accepted(report.outcome))
            }
            Err(ChainError::InvalidLinkage(LinkageError::Orphan(parent))) => {
                if let Some(origin) = origin {
                    tracing::debug!(peer = %origin, parent = %parent, "orphan received, syncing from sender");
                    let this = Arc::clone(self);
                    tokio::spawn(async move {
                        if let Err(e) = this.sync_from(&origin).await {
                            tracing::warn!(peer = %origin, error = %e, "orphan-triggered sync failed");
                        }
                    });
                }
                Ok(BlockDisposition::Orphan)
            }
            Err(ChainError::InvalidLinkage(LinkageError::AlreadyKnown(_))) => Ok(BlockDisposition::Known),
            Err(e) => {
                tracing::warn!(origin = ?origin, error = %e, "rejected pushed block");
                Err(e.into())
            }
        }
    }

    /// Queue a pushed transaction and relay it if new.
    pub fn on_transaction(
        self: &Arc<Self>,
        message: TransactionAnnouncement,
    ) -> Result<TransactionDisposition> {
        let TransactionAnnouncement { transaction, origin } = message;
        let result = self.chain.lock().submit_transaction(transaction.clone());

        match result {
            Ok(hash) => {
                let this = Arc::clone(self);
                tokio::spawn(async move {
                    this.broadcast_transaction(&transaction, origin.as_deref()).await;
                });
                Ok(TransactionDisposition::Accepted(hash))
            }
            Err(ChainError::DuplicateTransaction(_)) => Ok(TransactionDisposition::Known),
            Err(e) => Err(e.into()),
        }
    }

    /// Canonical blocks for a range request, capped at one sync batch.
    pub fn serve_range(&self, from: u64, to: u64) -> Result<Vec<Block>> {
        let chain = self.chain.lock();
        let cap = from.saturating_add(self.config.sync_batch_size.max(1) - 1);
        let to = to.min(cap).min(chain.height().saturating_sub(1));
        Ok(chain.get_range(from, to)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use powchain_chain::{Blockchain, BlockchainConfig};
    use powchain_consensus::{search_nonce, DifficultyConfig, SearchOutcome, ValidationError};
    use powchain_core::{Address, Keypair, Transaction};
    use std::collections::{HashMap, HashSet};
    use std::time::Instant;

    /// Routes transport calls straight into other protocols' inbound handlers.
    #[derive(Default)]
    struct MemoryNetwork {
        nodes: Mutex<HashMap<String, Arc<PeerProtocol<MemoryTransport>>>>,
        down: Mutex<HashSet<String>>,
        /// Node address to the block index it serves with a forged reward.
        forged: Mutex<HashMap<String, u64>>,
    }

    impl MemoryNetwork {
        fn node(&self, addr: &str) -> Result<Arc<PeerProtocol<MemoryTransport>>> {
            if self.down.lock().contains(addr) {
                return Err(NetworkError::ConnectionRefused(addr.to_string()));
            }
            self.nodes
                .lock()
                .get(addr)
                .cloned()
                .ok_or_else(|| NetworkError::ConnectionRefused(addr.to_string()))
        }

        fn take_down(&self, addr: &str) {
            self.down.lock().insert(addr.to_string());
        }
    }

    struct MemoryTransport {
        net: Arc<MemoryNetwork>,
    }

    #[async_trait]
    impl Transport for MemoryTransport {
        async fn handshake(&self, addr: &str, hello: &Handshake) -> Result<Handshake> {
            self.net.node(addr)?.on_handshake(hello.clone())
        }

        async fn request_range(&self, addr: &str, from: u64, to: u64) -> Result<Vec<Block>> {
            let mut blocks = self.net.node(addr)?.serve_range(from, to)?;
            if let Some(index) = self.net.forged.lock().get(addr).copied() {
                for block in blocks.iter_mut().filter(|b| b.index() == index) {
                    block.transactions[0].amount += 1;
                }
            }
            Ok(blocks)
        }

        async fn send_block(&self, addr: &str, message: &BlockAnnouncement) -> Result<()> {
            self.net.node(addr)?.on_block(message.clone()).map(|_| ())
        }

        async fn send_transaction(&self, addr: &str, message: &TransactionAnnouncement) -> Result<()> {
            self.net.node(addr)?.on_transaction(message.clone()).map(|_| ())
        }

        async fn status(&self, addr: &str) -> Result<ChainSummary> {
            Ok(self.net.node(addr)?.summary())
        }

        async fn peers(&self, addr: &str) -> Result<Vec<String>> {
            Ok(self.net.node(addr)?.peer_list().peers)
        }
    }

    /// Never answers.
    struct SilentTransport;

    #[async_trait]
    impl Transport for SilentTransport {
        async fn handshake(&self, _: &str, _: &Handshake) -> Result<Handshake> {
            std::future::pending().await
        }
        async fn request_range(&self, _: &str, _: u64, _: u64) -> Result<Vec<Block>> {
            std::future::pending().await
        }
        async fn send_block(&self, _: &str, _: &BlockAnnouncement) -> Result<()> {
            std::future::pending().await
        }
        async fn send_transaction(&self, _: &str, _: &TransactionAnnouncement) -> Result<()> {
            std::future::pending().await
        }
        async fn status(&self, _: &str) -> Result<ChainSummary> {
            std::future::pending().await
        }
        async fn peers(&self, _: &str) -> Result<Vec<String>> {
            std::future::pending().await
        }
    }

    fn chain_config(funded: &[Address]) -> BlockchainConfig {
        BlockchainConfig {
            difficulty: DifficultyConfig {
                initial_difficulty: 1,
                ..DifficultyConfig::default()
            },
            genesis_allocations: funded.iter().map(|a| (*a, 1_000)).collect(),
            ..BlockchainConfig::default()
        }
    }

    fn net_config(addr: &str, role: NodeRole, bootstrap: Option<&str>) -> NetworkConfig {
        NetworkConfig {
            role,
            bootstrap: bootstrap.map(str::to_string),
            advertised_addr: Some(addr.to_string()),
            ..NetworkConfig::default()
        }
    }

    fn spawn_node(
        net: &Arc<MemoryNetwork>,
        chain: BlockchainConfig,
        config: NetworkConfig,
    ) -> Arc<PeerProtocol<MemoryTransport>> {
        let addr = config.advertised_addr.clone().unwrap();
        let chain = Blockchain::in_memory(chain).unwrap().shared();
        let transport = MemoryTransport { net: net.clone() };
        let node = Arc::new(PeerProtocol::new(chain, transport, config));
        net.nodes.lock().insert(addr, node.clone());
        node
    }

    fn node(net: &Arc<MemoryNetwork>, addr: &str, role: NodeRole, bootstrap: Option<&str>) -> Arc<PeerProtocol<MemoryTransport>> {
        spawn_node(net, chain_config(&[]), net_config(addr, role, bootstrap))
    }

    /// Mine `count` blocks on the node's canonical tip, one hour apart.
    fn extend(node: &PeerProtocol<MemoryTransport>, count: usize, tag: u8) -> Vec<Block> {
        let mut chain = node.chain().lock();
        let mut mined = Vec::new();
        for _ in 0..count {
            let now = chain.tip().header.timestamp + 3_600;
            let candidate = chain.assemble_candidate(Address::from_bytes([tag; 20]), now);
            let SearchOutcome::Found(header) = search_nonce(&candidate.header, 1_000, || false) else {
                panic!("nonce search failed");
            };
            let block = Block {
                header,
                transactions: candidate.transactions,
            };
            chain.append_block(block.clone()).unwrap();
            mined.push(block);
        }
        mined
    }

    fn tip(node: &PeerProtocol<MemoryTransport>) -> Hash {
        node.chain().lock().tip_hash()
    }

    async fn eventually(mut check: impl FnMut() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_regular_node_with_refused_bootstrap_never_connects() {
        let net = Arc::new(MemoryNetwork::default());
        let regular = node(&net, "regular:1", NodeRole::Regular, Some("boot:1"));

        let err = regular.start().await.unwrap_err();
        let NetworkError::BootstrapFailed { addr, source } = err else {
            panic!("expected bootstrap failure");
        };
        assert_eq!(addr, "boot:1");
        assert!(matches!(*source, NetworkError::ConnectionRefused(_)));
        assert_eq!(regular.state(), SyncState::Unbootstrapped);
        assert_eq!(regular.peer_count(), 0);
    }

    #[tokio::test]
    async fn test_regular_node_requires_bootstrap_address() {
        let net = Arc::new(MemoryNetwork::default());
        let regular = node(&net, "regular:1", NodeRole::Regular, None);
        assert!(matches!(
            regular.start().await,
            Err(NetworkError::BootstrapFailed { .. })
        ));
        assert_ne!(regular.state(), SyncState::Connected);
    }

    #[tokio::test]
    async fn test_initial_and_secondary_start_connected() {
        let net = Arc::new(MemoryNetwork::default());
        let initial = node(&net, "initial:1", NodeRole::Initial, None);
        initial.start().await.unwrap();
        assert_eq!(initial.state(), SyncState::Connected);

        let secondary = node(&net, "secondary:1", NodeRole::BootstrapSecondary, Some("gone:1"));
        secondary.start().await.unwrap();
        assert_eq!(secondary.state(), SyncState::Connected);
    }

    #[tokio::test]
    async fn test_regular_node_bootstraps_and_syncs() {
        let net = Arc::new(MemoryNetwork::default());
        let boot = node(&net, "boot:1", NodeRole::Initial, None);
        boot.start().await.unwrap();
        extend(&boot, 3, 1);

        let regular = node(&net, "regular:1", NodeRole::Regular, Some("boot:1"));
        regular.start().await.unwrap();

        assert_eq!(regular.state(), SyncState::Synced);
        assert_eq!(tip(&regular), tip(&boot));
        assert_eq!(regular.chain().lock().height(), 4);
        assert!(regular.peer("boot:1").is_some_and(|p| p.bootstrap));
        // The bootstrap node learned the newcomer's listen address.
        assert!(boot.has_peer("regular:1"));
    }

    #[tokio::test]
    async fn test_genesis_mismatch_is_incompatible() {
        let net = Arc::new(MemoryNetwork::default());
        let funded = Address::from_bytes([5u8; 20]);
        spawn_node(
            &net,
            chain_config(&[funded]),
            net_config("boot:1", NodeRole::Initial, None),
        );
        let regular = node(&net, "regular:1", NodeRole::Regular, Some("boot:1"));

        let Err(NetworkError::BootstrapFailed { source, .. }) = regular.start().await else {
            panic!("expected bootstrap failure");
        };
        assert!(matches!(*source, NetworkError::Incompatible(_)));
    }

    #[tokio::test]
    async fn test_handshake_times_out() {
        let chain = Blockchain::in_memory(chain_config(&[])).unwrap().shared();
        let config = NetworkConfig {
            handshake_timeout: Duration::from_millis(20),
            ..net_config("a:1", NodeRole::Regular, Some("silent:1"))
        };
        let protocol = PeerProtocol::new(chain, SilentTransport, config);

        let Err(NetworkError::BootstrapFailed { source, .. }) = protocol.start().await else {
            panic!("expected bootstrap failure");
        };
        assert!(matches!(*source, NetworkError::Timeout { operation: "handshake", .. }));
    }

    #[tokio::test]
    async fn test_sync_across_fork() {
        let net = Arc::new(MemoryNetwork::default());
        let config = |addr| NetworkConfig {
            sync_batch_size: 2,
            ..net_config(addr, NodeRole::Initial, None)
        };
        let a = spawn_node(&net, chain_config(&[]), config("a:1"));
        let b = spawn_node(&net, chain_config(&[]), config("b:1"));
        extend(&a, 3, 1);
        let b_blocks = extend(&b, 5, 2);

        a.handshake("b:1").await.unwrap();
        let report = a.sync_from("b:1").await.unwrap();

        assert!(report.reorganized);
        assert_eq!(report.remote_height, 6);
        assert_eq!(report.appended, 5);
        assert_eq!(tip(&a), b_blocks[4].hash());
        assert_eq!(a.state(), SyncState::Synced);

        // Nothing left to pull.
        assert_eq!(a.sync_from("b:1").await.unwrap().appended, 0);
    }

    #[tokio::test]
    async fn test_sync_gives_up_beyond_fork_depth() {
        let net = Arc::new(MemoryNetwork::default());
        let a = spawn_node(
            &net,
            chain_config(&[]),
            NetworkConfig {
                max_fork_depth: 2,
                ..net_config("a:1", NodeRole::Initial, None)
            },
        );
        let b = node(&net, "b:1", NodeRole::Initial, None);
        extend(&a, 4, 1);
        extend(&b, 6, 2);

        a.handshake("b:1").await.unwrap();
        assert!(matches!(a.sync_from("b:1").await, Err(NetworkError::Protocol(_))));
        assert_eq!(a.chain().lock().height(), 5);
        assert_eq!(a.peer("b:1").map(|p| p.failures), Some(1));
    }

    #[tokio::test]
    async fn test_broadcast_block_reaches_peers() {
        let net = Arc::new(MemoryNetwork::default());
        let a = node(&net, "a:1", NodeRole::Initial, None);
        let b = node(&net, "b:1", NodeRole::Initial, None);
        let c = node(&net, "c:1", NodeRole::Initial, None);
        a.handshake("b:1").await.unwrap();
        a.handshake("c:1").await.unwrap();

        let block = extend(&a, 1, 1).remove(0);
        assert_eq!(a.broadcast_block(&block, None).await, 2);
        assert_eq!(tip(&b), block.hash());
        assert_eq!(tip(&c), block.hash());

        // Already known blocks are acknowledged without error.
        assert_eq!(a.broadcast_block(&block, Some("c:1")).await, 1);
    }

    #[tokio::test]
    async fn test_orphan_announcement_triggers_sync() {
        let net = Arc::new(MemoryNetwork::default());
        let a = node(&net, "a:1", NodeRole::Initial, None);
        let b = node(&net, "b:1", NodeRole::Initial, None);
        let blocks = extend(&a, 3, 1);

        let disposition = b
            .on_block(BlockAnnouncement {
                block: blocks[2].clone(),
                origin: Some("a:1".into()),
            })
            .unwrap();
        assert_eq!(disposition, BlockDisposition::Orphan);

        eventually(|| b.chain().lock().tip_hash() == blocks[2].hash()).await;
    }

    #[tokio::test]
    async fn test_transaction_relay() {
        let net = Arc::new(MemoryNetwork::default());
        let alice = Keypair::generate();
        let config = chain_config(&[alice.address()]);
        let a = spawn_node(&net, config.clone(), net_config("a:1", NodeRole::Initial, None));
        let b = spawn_node(&net, config, net_config("b:1", NodeRole::Initial, None));
        a.handshake("b:1").await.unwrap();

        let tx = Transaction::transfer(alice.address(), Address::from_bytes([2u8; 20]), 10, 1, 0)
            .signed(&alice);
        let announce = TransactionAnnouncement {
            transaction: tx.clone(),
            origin: None,
        };
        assert_eq!(
            a.on_transaction(announce.clone()).unwrap(),
            TransactionDisposition::Accepted(tx.hash())
        );
        assert_eq!(a.on_transaction(announce).unwrap(), TransactionDisposition::Known);

        eventually(|| b.chain().lock().mempool().contains(&tx.hash())).await;
    }

    #[tokio::test]
    async fn test_probe_evicts_dead_peer() {
        let net = Arc::new(MemoryNetwork::default());
        let a = node(&net, "a:1", NodeRole::Initial, None);
        node(&net, "b:1", NodeRole::Initial, None);
        a.handshake("b:1").await.unwrap();
        net.take_down("b:1");

        assert!(a.probe_peers().await.evicted.is_empty());
        assert!(a.probe_peers().await.evicted.is_empty());
        assert_eq!(a.probe_peers().await.evicted, vec!["b:1".to_string()]);

        assert_eq!(a.peer_count(), 0);
        assert!(matches!(a.handshake("b:1").await, Err(NetworkError::Blacklisted(_))));
    }

    #[tokio::test]
    async fn test_regular_node_keeps_bootstrap_peer() {
        let net = Arc::new(MemoryNetwork::default());
        node(&net, "boot:1", NodeRole::Initial, None);
        let regular = node(&net, "regular:1", NodeRole::Regular, Some("boot:1"));
        regular.start().await.unwrap();
        net.take_down("boot:1");

        for _ in 0..5 {
            assert!(regular.probe_peers().await.evicted.is_empty());
        }
        assert_eq!(regular.peer("boot:1").map(|p| p.failures), Some(5));
    }

    #[tokio::test]
    async fn test_probe_syncs_from_peer_ahead() {
        let net = Arc::new(MemoryNetwork::default());
        let a = node(&net, "a:1", NodeRole::Initial, None);
        let b = node(&net, "b:1", NodeRole::Initial, None);
        a.handshake("b:1").await.unwrap();
        extend(&b, 2, 2);

        let report = a.probe_peers().await;
        assert_eq!(report.alive, 1);
        assert_eq!(report.synced, 1);
        assert_eq!(tip(&a), tip(&b));
    }

    #[tokio::test]
    async fn test_discover_peers_through_neighbours() {
        let net = Arc::new(MemoryNetwork::default());
        let a = node(&net, "a:1", NodeRole::Initial, None);
        let b = node(&net, "b:1", NodeRole::Initial, None);
        node(&net, "c:1", NodeRole::Initial, None);
        b.handshake("c:1").await.unwrap();
        a.handshake("b:1").await.unwrap();

        assert_eq!(a.discover_peers().await, 1);
        assert!(a.has_peer("c:1"));
        assert_eq!(a.discover_peers().await, 0);
    }

    #[tokio::test]
    async fn test_serve_range_is_capped() {
        let net = Arc::new(MemoryNetwork::default());
        let a = spawn_node(
            &net,
            chain_config(&[]),
            NetworkConfig {
                sync_batch_size: 2,
                ..net_config("a:1", NodeRole::Initial, None)
            },
        );
        extend(&a, 4, 1);

        assert_eq!(a.serve_range(1, 4).unwrap().len(), 2);
        assert_eq!(a.serve_range(4, 10).unwrap().len(), 1);
        assert!(matches!(
            a.serve_range(9, 10),
            Err(NetworkError::Chain(ChainError::OutOfRange { .. }))
        ));
    }

    #[tokio::test]
    async fn test_sync_stops_at_first_invalid_block() {
        let net = Arc::new(MemoryNetwork::default());
        let a = spawn_node(
            &net,
            chain_config(&[]),
            NetworkConfig {
                sync_batch_size: 2,
                ..net_config("a:1", NodeRole::Initial, None)
            },
        );
        let b = node(&net, "b:1", NodeRole::Initial, None);
        let b_blocks = extend(&b, 4, 2);
        net.forged.lock().insert("b:1".into(), 3);

        a.handshake("b:1").await.unwrap();
        let err = a.sync_from("b:1").await.unwrap_err();

        assert!(matches!(
            err,
            NetworkError::Chain(ChainError::InvalidBlock(ValidationError::MerkleMismatch))
        ));
        // The first page was valid and stays applied.
        assert_eq!(a.chain().lock().height(), 3);
        assert_eq!(tip(&a), b_blocks[1].hash());
        assert!(!a.chain().lock().contains_block(&b_blocks[3].hash()));
        assert_eq!(a.peer("b:1").map(|p| p.failures), Some(1));
        assert_ne!(a.state(), SyncState::Synced);
    }

    #[tokio::test]
    async fn test_broadcast_bounded_by_timeout() {
        let chain = Blockchain::in_memory(chain_config(&[])).unwrap().shared();
        let genesis_hash = chain.lock().genesis_hash();
        let config = NetworkConfig {
            broadcast_timeout: Duration::from_millis(20),
            ..net_config("a:1", NodeRole::Initial, None)
        };
        let a = PeerProtocol::new(chain, SilentTransport, config);
        for peer in ["b:1", "c:1"] {
            a.on_handshake(Handshake {
                version: PROTOCOL_VERSION,
                genesis_hash,
                height: 1,
                listen_addr: Some(peer.into()),
            })
            .unwrap();
        }
        let block = a.chain().lock().tip().clone();
        let alice = Keypair::generate();
        let tx = Transaction::transfer(alice.address(), Address::ZERO, 1, 0, 0).signed(&alice);

        let started = Instant::now();
        let relays = async {
            (
                a.broadcast_block(&block, None).await,
                a.broadcast_transaction(&tx, Some("c:1")).await,
            )
        };
        let delivered = tokio::time::timeout(Duration::from_secs(5), relays)
            .await
            .unwrap();

        assert_eq!(delivered, (0, 0));
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(a.peer("b:1").map(|p| p.failures), Some(2));
        assert_eq!(a.peer("c:1").map(|p| p.failures), Some(1));
    }

    #[tokio::test]
    async fn test_pushed_invalid_block_rejected() {
        let net = Arc::new(MemoryNetwork::default());
        let a = node(&net, "a:1", NodeRole::Initial, None);
        let b = node(&net, "b:1", NodeRole::Initial, None);
        let genesis = tip(&a);
        let mut forged = extend(&b, 1, 2).remove(0);
        forged.transactions[0].amount += 1;

        let result = a.on_block(BlockAnnouncement {
            block: forged.clone(),
            origin: Some("b:1".into()),
        });

        assert!(matches!(
            result,
            Err(NetworkError::Chain(ChainError::InvalidBlock(ValidationError::MerkleMismatch)))
        ));
        assert_eq!(tip(&a), genesis);
        assert!(!a.chain().lock().contains_block(&forged.hash()));
        assert!(!a.chain().lock().is_orphan(&forged.hash()));
    }

    #[test]
    fn test_role_parsing() {
        assert_eq!("initial".parse::<NodeRole>(), Ok(NodeRole::Initial));
        assert_eq!("Bootstrap-Secondary".parse::<NodeRole>(), Ok(NodeRole::BootstrapSecondary));
        assert!("leader".parse::<NodeRole>().is_err());
        assert_eq!(NodeRole::BootstrapSecondary.to_string(), "bootstrap-secondary");
    }
}
