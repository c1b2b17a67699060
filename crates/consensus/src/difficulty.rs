//! Bang-bang difficulty retargeting.
//!
//! After each accepted block the observed interval since its parent is
//! compared against a window around the target interval. Faster than the
//! lower bound raises the difficulty by one bit, slower than the upper bound
//! lowers it by one bit (never below [`MIN_DIFFICULTY`]), anything in between
//! leaves it alone.

use powchain_core::BlockHeader;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Difficulty never drops below one leading zero bit.
pub const MIN_DIFFICULTY: u32 = 1;

/// Retarget configuration, in seconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DifficultyConfig {
    /// Desired time between blocks.
    pub target_interval: u64,
    /// Intervals shorter than this raise difficulty.
    pub lower_bound: u64,
    /// Intervals longer than this lower difficulty.
    pub upper_bound: u64,
    /// Difficulty of genesis and of its first child.
    pub initial_difficulty: u32,
}

impl Default for DifficultyConfig {
    fn default() -> Self {
        Self {
            target_interval: 3_600,
            lower_bound: 1_800,
            upper_bound: 7_200,
            initial_difficulty: 4,
        }
    }
}

impl DifficultyConfig {
    /// The difficulty that follows `current` after an `observed` interval.
    pub fn adjusted(&self, current: u32, observed: Duration) -> u32 {
        let secs = observed.as_secs();
        let current = current.max(MIN_DIFFICULTY);
        if secs < self.lower_bound {
            current.saturating_add(1)
        } else if secs > self.upper_bound {
            current.saturating_sub(1).max(MIN_DIFFICULTY)
        } else {
            current
        }
    }

    /// Difficulty a child of `parent` must declare.
    ///
    /// `grandparent` is `None` when `parent` is genesis, whose child keeps the
    /// genesis difficulty. Otherwise the parent's own interval drives the step.
    pub fn expected_difficulty(&self, parent: &BlockHeader, grandparent: Option<&BlockHeader>) -> u32 {
        match grandparent {
            None => parent.difficulty.max(MIN_DIFFICULTY),
            Some(gp) => {
                let observed = parent.timestamp.saturating_sub(gp.timestamp);
                self.adjusted(parent.difficulty, Duration::from_secs(observed))
            }
        }
    }
}

/// Stateful controller tracking the difficulty for the next canonical block.
#[derive(Debug, Clone)]
pub struct DifficultyController {
    config: DifficultyConfig,
    current: u32,
}

impl DifficultyController {
    pub fn new(config: DifficultyConfig) -> Self {
        let current = config.initial_difficulty.max(MIN_DIFFICULTY);
        Self { config, current }
    }

    /// Step the difficulty after a block arrived `observed` after its parent.
    /// Returns the new target.
    pub fn on_block_accepted(&mut self, observed: Duration) -> u32 {
        let next = self.config.adjusted(self.current, observed);
        if next != self.current {
            tracing::debug!(
                from = self.current,
                to = next,
                observed_secs = observed.as_secs(),
                "difficulty retargeted"
            );
        }
        self.current = next;
        next
    }

    /// Current target in leading zero bits.
    pub fn target(&self) -> u32 {
        self.current
    }

    /// Overwrite the target, e.g. after a reorg or a reload from disk.
    pub fn set_target(&mut self, target: u32) {
        self.current = target.max(MIN_DIFFICULTY);
    }

    pub fn config(&self) -> &DifficultyConfig {
        &self.config
    }
}
