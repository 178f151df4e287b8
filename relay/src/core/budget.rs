//! Retry and time budget helpers.

use std::time::{Duration, Instant};

/// Time left until `deadline`, or `None` once it has passed.
pub fn remaining_budget(deadline: Instant) -> Option<Duration> {
    deadline
        .checked_duration_since(Instant::now())
        .filter(|remaining| !remaining.is_zero())
}

/// True once a stage has used its whole retry budget.
///
/// `attempts` counts stage starts, so a budget of 3 allows three runs; the
/// failure of the third run escalates instead of creating another fix task.
pub fn retry_budget_exhausted(attempts: u32, budget: u32) -> bool {
    attempts >= budget
}
