//! Stable exit codes for relay CLI commands.

use crate::relay::{FinalState, RelayOutcome};

/// Command succeeded; for `relay run`, the task was merged and closed.
pub const OK: i32 = 0;
/// Invalid workflow/config, missing task, lock timeout, or any other error.
pub const INVALID: i32 = 1;
/// The task ended `blocked` (integration failure, refused merge, routed to escalation).
pub const BLOCKED: i32 = 2;
/// The retry budget ran out and the task awaits a human.
pub const ESCALATED: i32 = 3;
/// The iteration ceiling stopped the run.
pub const MAX_ITERATIONS: i32 = 4;
/// A rebase or merge conflict blocked the task; `relay reserve` also uses it for a busy reservation.
pub const CONFLICT: i32 = 5;
/// A termination signal stopped the run; the task was left open for a rerun.
pub const INTERRUPTED: i32 = 130;

/// Exit code for a finished relay run.
pub fn for_outcome(outcome: &RelayOutcome) -> i32 {
    match outcome.final_state {
        FinalState::Complete => OK,
        FinalState::Blocked if outcome.conflict => CONFLICT,
        FinalState::Blocked => BLOCKED,
        FinalState::HumanEscalation => ESCALATED,
        FinalState::MaxIterationsExceeded => MAX_ITERATIONS,
        FinalState::Interrupted => INTERRUPTED,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::task::TaskStatus;

    fn outcome(final_state: FinalState, conflict: bool) -> RelayOutcome {
        RelayOutcome {
            task_id: "bd-1".to_string(),
            final_state,
            status: TaskStatus::Blocked,
            iterations: 1,
            reason: String::new(),
            conflict,
        }
    }

    #[test]
    fn conflicts_are_distinguished_from_other_blocks() {
        assert_eq!(for_outcome(&outcome(FinalState::Blocked, false)), BLOCKED);
        assert_eq!(for_outcome(&outcome(FinalState::Blocked, true)), CONFLICT);
        assert_eq!(for_outcome(&outcome(FinalState::Complete, false)), OK);
        assert_eq!(for_outcome(&outcome(FinalState::MaxIterationsExceeded, false)), MAX_ITERATIONS);
        assert_eq!(for_outcome(&outcome(FinalState::Interrupted, false)), INTERRUPTED);
    }
}
