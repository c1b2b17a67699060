//! Proof-of-work block producer.
//!
//! The miner runs on its own OS thread. Each round it assembles a candidate
//! on the canonical tip under the chain lock, releases the lock, and searches
//! nonces in batches. Between batches it polls the [`TipSignal`]; a changed
//! generation means another block won and the candidate is abandoned.

use crate::blockchain::SharedChain;
use crate::error::ChainError;
use crate::signal::TipSignal;
use powchain_consensus::{search_nonce, SearchOutcome};
use powchain_core::{Address, Block, BlockHeader};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;

/// Observable miner state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum MinerState {
    Idle = 0,
    Assembling = 1,
    Searching = 2,
    Found = 3,
    Preempted = 4,
}

impl MinerState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => MinerState::Assembling,
            2 => MinerState::Searching,
            3 => MinerState::Found,
            4 => MinerState::Preempted,
            _ => MinerState::Idle,
        }
    }
}

/// Miner configuration.
#[derive(Debug, Clone)]
pub struct MinerConfig {
    /// Recipient of block rewards and fees.
    pub address: Address,
    /// Hashes tried between tip checks.
    pub nonce_batch: u64,
    /// Keep mining while the pending pool is empty.
    pub mine_empty_blocks: bool,
    /// Sleep between rounds when there is nothing to mine.
    pub idle_interval: Duration,
}

impl MinerConfig {
    pub fn new(address: Address) -> Self {
        Self {
            address,
            nonce_batch: 10_000,
            mine_empty_blocks: true,
            idle_interval: Duration::from_millis(500),
        }
    }
}

/// Result of one mining round.
#[derive(Debug)]
pub enum MineOutcome {
    /// The block was accepted by the chain.
    Mined(Block),
    /// The tip moved while searching.
    Preempted,
    /// The chain refused the solved block.
    Rejected(ChainError),
    /// Nothing to mine.
    Idle,
    /// The stop flag was raised.
    Stopped,
}

pub struct Miner {
    chain: SharedChain,
    config: MinerConfig,
    signal: TipSignal,
    state: Arc<AtomicU8>,
    stop: Arc<AtomicBool>,
    announce: Option<UnboundedSender<Block>>,
}

impl Miner {
    pub fn new(chain: SharedChain, config: MinerConfig) -> Self {
        let signal = chain.lock().signal();
        Self {
            chain,
            config,
            signal,
            state: Arc::new(AtomicU8::new(MinerState::Idle as u8)),
            stop: Arc::new(AtomicBool::new(false)),
            announce: None,
        }
    }

    /// Publish every accepted block on `sender`.
    pub fn with_announcer(mut self, sender: UnboundedSender<Block>) -> Self {
        self.announce = Some(sender);
        self
    }

    pub fn state(&self) -> MinerState {
        MinerState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn config(&self) -> &MinerConfig {
        &self.config
    }

    fn set_state(&self, state: MinerState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn stopped(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }

    /// Assemble, search and submit one candidate.
    pub fn mine_once(&self) -> MineOutcome {
        if self.stopped() {
            return MineOutcome::Stopped;
        }

        self.set_state(MinerState::Assembling);
        let (candidate, generation) = {
            let chain = self.chain.lock();
            if !self.config.mine_empty_blocks && chain.mempool().is_empty() {
                self.set_state(MinerState::Idle);
                return MineOutcome::Idle;
            }
            let candidate =
                chain.assemble_candidate(self.config.address, BlockHeader::current_timestamp());
            // Read under the lock so the generation matches the tip we built on.
            (candidate, self.signal.generation())
        };
        tracing::debug!(
            index = candidate.index(),
            txs = candidate.tx_count(),
            difficulty = candidate.header.difficulty,
            "searching for nonce"
        );

        self.set_state(MinerState::Searching);
        let mut header = candidate.header.clone();
        let solved = loop {
            let outcome = search_nonce(&header, self.config.nonce_batch, || {
                self.stopped() || self.signal.generation() != generation
            });
            match outcome {
                SearchOutcome::Found(solved) => break solved,
                SearchOutcome::Preempted => {
                    self.set_state(MinerState::Preempted);
                    if self.stopped() {
                        return MineOutcome::Stopped;
                    }
                    tracing::debug!(index = header.index, "tip changed, abandoning candidate");
                    self.set_state(MinerState::Idle);
                    return MineOutcome::Preempted;
                }
                SearchOutcome::Exhausted => {
                    header.timestamp = BlockHeader::current_timestamp().max(header.timestamp + 1);
                    header.nonce = 0;
                }
            }
        };

        self.set_state(MinerState::Found);
        let block = Block {
            header: solved,
            transactions: candidate.transactions,
        };
        let result = self.chain.lock().append_block(block.clone());
        self.set_state(MinerState::Idle);

        match result {
            Ok(report) => {
                tracing::info!(index = report.index, hash = %report.hash, "mined block");
                if let Some(sender) = &self.announce {
                    if sender.send(block.clone()).is_err() {
                        tracing::debug!("block announce channel closed");
                    }
                }
                MineOutcome::Mined(block)
            }
            Err(e) => {
                match &e {
                    ChainError::InvalidBlock(_) | ChainError::InvalidLinkage(_) => {
                        tracing::debug!(error = %e, "discarding mined candidate")
                    }
                    _ => tracing::error!(error = %e, "failed to append mined block"),
                }
                MineOutcome::Rejected(e)
            }
        }
    }

    /// Run rounds on a dedicated thread until stopped.
    pub fn spawn(self) -> std::io::Result<MinerHandle> {
        let stop = self.stop.clone();
        let state = self.state.clone();
        let thread = std::thread::Builder::new()
            .name("miner".into())
            .spawn(move || {
                tracing::info!(address = %self.config.address, "miner started");
                loop {
                    match self.mine_once() {
                        MineOutcome::Stopped => break,
                        MineOutcome::Idle => std::thread::sleep(self.config.idle_interval),
                        MineOutcome::Mined(_) | MineOutcome::Preempted | MineOutcome::Rejected(_) => {}
                    }
                }
                self.set_state(MinerState::Idle);
                tracing::info!("miner stopped");
            })?;

        Ok(MinerHandle {
            stop,
            state,
            thread: Some(thread),
        })
    }
}

/// Handle to a running miner thread.
pub struct MinerHandle {
    stop: Arc<AtomicBool>,
    state: Arc<AtomicU8>,
    thread: Option<JoinHandle<()>>,
}

impl MinerHandle {
    pub fn state(&self) -> MinerState {
        MinerState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Raise the stop flag and wait for the thread to exit.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::error!("miner thread panicked");
            }
        }
    }
}

impl Drop for MinerHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::{Blockchain, BlockchainConfig};
    use powchain_consensus::DifficultyConfig;
    use powchain_core::{Keypair, Transaction};
    use std::time::Instant;

    fn shared_chain(initial_difficulty: u32, funded: &Keypair) -> SharedChain {
        let config = BlockchainConfig {
            difficulty: DifficultyConfig {
                initial_difficulty,
                ..DifficultyConfig::default()
            },
            genesis_allocations: vec![(funded.address(), 1_000)],
            ..BlockchainConfig::default()
        };
        Blockchain::in_memory(config).unwrap().shared()
    }

    fn miner_config(mine_empty_blocks: bool) -> MinerConfig {
        MinerConfig {
            nonce_batch: 64,
            mine_empty_blocks,
            idle_interval: Duration::from_millis(5),
            ..MinerConfig::new(Address::from_bytes([7u8; 20]))
        }
    }

    #[test]
    fn test_mine_once_appends_block() {
        let alice = Keypair::generate();
        let chain = shared_chain(1, &alice);
        let tx = Transaction::transfer(alice.address(), Address::from_bytes([2u8; 20]), 10, 2, 0)
            .signed(&alice);
        chain.lock().submit_transaction(tx.clone()).unwrap();

        let (sender, mut receiver) = tokio::sync::mpsc::unbounded_channel();
        let miner = Miner::new(chain.clone(), miner_config(false)).with_announcer(sender);

        let MineOutcome::Mined(block) = miner.mine_once() else {
            panic!("expected a mined block");
        };
        assert_eq!(miner.state(), MinerState::Idle);
        assert_eq!(receiver.try_recv().unwrap(), block);

        let chain = chain.lock();
        assert_eq!(chain.height(), 2);
        assert_eq!(chain.tip_hash(), block.hash());
        assert!(block.transactions[0].is_reward());
        assert_eq!(block.transactions[1], tx);
        assert_eq!(chain.balance(&Address::from_bytes([7u8; 20])), 52);
        assert!(chain.mempool().is_empty());
    }

    #[test]
    fn test_idle_without_pending_transactions() {
        let chain = shared_chain(1, &Keypair::generate());
        let miner = Miner::new(chain.clone(), miner_config(false));
        assert!(matches!(miner.mine_once(), MineOutcome::Idle));
        assert_eq!(chain.lock().height(), 1);

        let eager = Miner::new(chain.clone(), miner_config(true));
        assert!(matches!(eager.mine_once(), MineOutcome::Mined(_)));
        assert_eq!(chain.lock().height(), 2);
    }

    #[test]
    fn test_tip_change_preempts_search() {
        // Unreachable difficulty keeps the search running until preempted.
        let chain = shared_chain(200, &Keypair::generate());
        let signal = chain.lock().signal();
        let miner = Arc::new(Miner::new(chain.clone(), miner_config(true)));

        let worker = {
            let miner = miner.clone();
            std::thread::spawn(move || miner.mine_once())
        };

        let deadline = Instant::now() + Duration::from_secs(10);
        while miner.state() != MinerState::Searching {
            assert!(Instant::now() < deadline, "miner never started searching");
            std::thread::sleep(Duration::from_millis(1));
        }
        signal.bump(1);

        assert!(matches!(worker.join().unwrap(), MineOutcome::Preempted));
        assert_eq!(chain.lock().height(), 1);
    }

    #[test]
    fn test_spawned_miner_stops() {
        let chain = shared_chain(1, &Keypair::generate());
        let handle = Miner::new(chain.clone(), miner_config(true)).spawn().unwrap();

        let deadline = Instant::now() + Duration::from_secs(30);
        while chain.lock().height() < 3 {
            assert!(Instant::now() < deadline, "miner made no progress");
            std::thread::sleep(Duration::from_millis(5));
        }
        handle.stop();

        let height = chain.lock().height();
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(chain.lock().height(), height);
    }

    #[test]
    fn test_stopped_miner_does_nothing() {
        let chain = shared_chain(1, &Keypair::generate());
        let miner = Miner::new(chain, miner_config(true));
        miner.stop.store(true, Ordering::Relaxed);
        assert!(matches!(miner.mine_once(), MineOutcome::Stopped));
    }
}
