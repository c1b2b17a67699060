//! Known peers, their liveness and the blacklist.

use serde::Serialize;
use std::collections::HashMap;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// A peer we have completed a handshake with.
#[derive(Debug, Clone)]
pub struct Peer {
    pub addr: String,
    /// Canonical length the peer last reported.
    pub height: u64,
    /// Unix seconds of the last successful exchange.
    pub last_seen: u64,
    /// Consecutive failed exchanges.
    pub failures: u32,
    /// The peer this node bootstrapped from.
    pub bootstrap: bool,
}

/// Serializable view of a peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeerInfo {
    pub addr: String,
    pub height: u64,
    pub last_seen: u64,
    pub failures: u32,
    pub bootstrap: bool,
}

impl From<&Peer> for PeerInfo {
    fn from(peer: &Peer) -> Self {
        Self {
            addr: peer.addr.clone(),
            height: peer.height,
            last_seen: peer.last_seen,
            failures: peer.failures,
            bootstrap: peer.bootstrap,
        }
    }
}

/// What a recorded failure did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Still a peer, with this many consecutive failures.
    Counted(u32),
    /// Removed and blacklisted.
    Evicted,
    /// Not in the table.
    Unknown,
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

pub struct PeerTable {
    peers: HashMap<String, Peer>,
    blacklist: HashMap<String, Instant>,
    max_peers: usize,
    failure_threshold: u32,
    blacklist_duration: Duration,
}

impl PeerTable {
    pub fn new(max_peers: usize, failure_threshold: u32, blacklist_duration: Duration) -> Self {
        Self {
            peers: HashMap::new(),
            blacklist: HashMap::new(),
            max_peers,
            failure_threshold: failure_threshold.max(1),
            blacklist_duration,
        }
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.peers.len() >= self.max_peers
    }

    pub fn contains(&self, addr: &str) -> bool {
        self.peers.contains_key(addr)
    }

    pub fn get(&self, addr: &str) -> Option<&Peer> {
        self.peers.get(addr)
    }

    pub fn is_blacklisted(&self, addr: &str) -> bool {
        self.blacklist
            .get(addr)
            .is_some_and(|until| Instant::now() < *until)
    }

    /// Add or refresh a peer after a successful handshake.
    ///
    /// Returns false if the peer is blacklisted, or new while the table is
    /// full. The bootstrap peer is always admitted.
    pub fn insert(&mut self, addr: &str, height: u64, bootstrap: bool) -> bool {
        if self.is_blacklisted(addr) {
            return false;
        }
        if let Some(peer) = self.peers.get_mut(addr) {
            peer.height = height;
            peer.last_seen = unix_now();
            peer.failures = 0;
            peer.bootstrap |= bootstrap;
            return true;
        }
        if self.is_full() && !bootstrap {
            return false;
        }
        self.blacklist.remove(addr);
        self.peers.insert(
            addr.to_string(),
            Peer {
                addr: addr.to_string(),
                height,
                last_seen: unix_now(),
                failures: 0,
                bootstrap,
            },
        );
        true
    }

    /// A successful exchange resets the failure count.
    pub fn record_success(&mut self, addr: &str, height: u64) {
        if let Some(peer) = self.peers.get_mut(addr) {
            peer.height = height;
            peer.last_seen = unix_now();
            peer.failures = 0;
        }
    }

    /// Count a failed exchange, evicting at the threshold.
    ///
    /// A bootstrap peer is only evicted when `evict_bootstrap` is set.
    pub fn record_failure(&mut self, addr: &str, evict_bootstrap: bool) -> FailureOutcome {
        let Some(peer) = self.peers.get_mut(addr) else {
            return FailureOutcome::Unknown;
        };
        peer.failures = peer.failures.saturating_add(1);
        if peer.failures < self.failure_threshold || (peer.bootstrap && !evict_bootstrap) {
            return FailureOutcome::Counted(peer.failures);
        }

        self.peers.remove(addr);
        self.blacklist
            .insert(addr.to_string(), Instant::now() + self.blacklist_duration);
        FailureOutcome::Evicted
    }

    /// Forget expired blacklist entries.
    pub fn prune_blacklist(&mut self) -> usize {
        let now = Instant::now();
        let before = self.blacklist.len();
        self.blacklist.retain(|_, until| now < *until);
        before - self.blacklist.len()
    }

    pub fn addresses(&self) -> Vec<String> {
        self.peers.keys().cloned().collect()
    }

    /// Every peer address except `skip`.
    pub fn addresses_except(&self, skip: Option<&str>) -> Vec<String> {
        self.peers
            .keys()
            .filter(|addr| Some(addr.as_str()) != skip)
            .cloned()
            .collect()
    }

    pub fn snapshot(&self) -> Vec<PeerInfo> {
        let mut peers: Vec<PeerInfo> = self.peers.values().map(PeerInfo::from).collect();
        peers.sort_by(|a, b| a.addr.cmp(&b.addr));
        peers
    }
}
