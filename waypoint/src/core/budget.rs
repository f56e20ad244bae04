//! Budget checks for the build loop.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::build_state::BuildState;
use crate::core::types::BuildReason;

/// Limits that bound an otherwise unbounded plan/execute/verify loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Budgets {
    pub max_iterations: u32,
    pub max_minutes: u64,
    /// Consecutive identical failures that count as a doom loop (0 disables).
    pub doom_loop_threshold: u32,
}

impl Default for Budgets {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            max_minutes: 60,
            doom_loop_threshold: 3,
        }
    }
}

impl Budgets {
    pub fn max_duration(&self) -> Duration {
        Duration::from_secs(self.max_minutes.saturating_mul(60))
    }
}

/// Check whether the next iteration may start.
///
/// Checked in order: doom loop, iteration count, wall-clock minutes. Returns
/// the first budget that is exhausted.
pub fn exhausted_budget(state: &BuildState, budgets: &Budgets, elapsed: Duration) -> Option<BuildReason> {
    if budgets.doom_loop_threshold > 0 && state.consecutive_identical >= budgets.doom_loop_threshold
    {
        return Some(BuildReason::DoomLoop);
    }
    if state.completed_iterations >= budgets.max_iterations {
        return Some(BuildReason::MaxIterations);
    }
    if elapsed >= budgets.max_duration() {
        return Some(BuildReason::MaxMinutes);
    }
    None
}
