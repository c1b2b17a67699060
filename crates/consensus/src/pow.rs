//! Proof-of-work nonce search.

use powchain_core::BlockHeader;

/// Result of a nonce search.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SearchOutcome {
    /// A header whose hash meets its declared difficulty.
    Found(BlockHeader),
    /// `should_stop` asked us to give up.
    Preempted,
    /// Every nonce from the starting one up to `u64::MAX` failed.
    Exhausted,
}

/// Search nonces starting at `header.nonce`, `batch` hashes at a time.
///
/// `should_stop` is polled before every batch, so a stop request is honoured
/// within one batch of hashing.
pub fn search_nonce(
    header: &BlockHeader,
    batch: u64,
    mut should_stop: impl FnMut() -> bool,
) -> SearchOutcome {
    let batch = batch.max(1);
    let mut candidate = header.clone();

    loop {
        if should_stop() {
            return SearchOutcome::Preempted;
        }
        for _ in 0..batch {
            if candidate.meets_difficulty() {
                return SearchOutcome::Found(candidate);
            }
            match candidate.nonce.checked_add(1) {
                Some(next) => candidate.nonce = next,
                None => return SearchOutcome::Exhausted,
            }
        }
    }
}
