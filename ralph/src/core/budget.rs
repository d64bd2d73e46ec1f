//! Iteration and wall-clock budgets for a single `run` invocation.

use std::time::{Duration, Instant};

use crate::core::types::IncompleteReason;

/// Caps applied to one invocation of the loop. `None` means unlimited.
#[derive(Debug, Clone, Copy)]
pub struct RunBudget {
    max_iterations: Option<u32>,
    max_runtime: Option<Duration>,
    started: Instant,
}

impl RunBudget {
    pub fn new(max_iterations: Option<u32>, max_runtime: Option<Duration>) -> Self {
        Self {
            max_iterations,
            max_runtime,
            started: Instant::now(),
        }
    }

    pub fn unlimited() -> Self {
        Self::new(None, None)
    }

    /// Returns why no further iteration may start, if either cap is reached.
    pub fn exhausted(&self, iterations_run: u32) -> Option<IncompleteReason> {
        if let Some(max) = self.max_iterations
            && iterations_run >= max
        {
            return Some(IncompleteReason::IterationLimit {
                iterations: iterations_run,
            });
        }
        if let Some(max) = self.max_runtime {
            let elapsed = self.started.elapsed();
            if elapsed >= max {
                return Some(IncompleteReason::TimeLimit {
                    elapsed_secs: elapsed.as_secs(),
                });
            }
        }
        None
    }

    /// Timeout for the next agent invocation: the per-invocation limit,
    /// shortened to whatever is left of the overall runtime cap.
    pub fn agent_timeout(&self, per_invocation: Option<Duration>) -> Option<Duration> {
        let remaining = self
            .max_runtime
            .map(|max| max.saturating_sub(self.started.elapsed()));
        match (per_invocation, remaining) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }
}
