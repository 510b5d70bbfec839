use crate::error::BatchError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle of one coordinator run.
///
/// `Idle -> PreStatement -> RowProcessing -> PostStatement -> Done`, with
/// `Failed` reachable from `PreStatement` and `RowProcessing`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BatchPhase {
    Idle,
    PreStatement,
    RowProcessing,
    PostStatement,
    Done,
    Failed,
}

impl BatchPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            BatchPhase::Idle => "idle",
            BatchPhase::PreStatement => "pre_statement",
            BatchPhase::RowProcessing => "row_processing",
            BatchPhase::PostStatement => "post_statement",
            BatchPhase::Done => "done",
            BatchPhase::Failed => "failed",
        }
    }

    pub fn can_transition_to(self, next: BatchPhase) -> bool {
        matches!(
            (self, next),
            (BatchPhase::Idle, BatchPhase::PreStatement)
                | (BatchPhase::PreStatement, BatchPhase::RowProcessing)
                | (BatchPhase::PreStatement, BatchPhase::Failed)
                | (BatchPhase::RowProcessing, BatchPhase::PostStatement)
                | (BatchPhase::RowProcessing, BatchPhase::Failed)
                | (BatchPhase::PostStatement, BatchPhase::Done)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, BatchPhase::Done | BatchPhase::Failed)
    }
}

impl fmt::Display for BatchPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tracks the current phase and refuses out-of-order transitions.
#[derive(Debug)]
pub(crate) struct PhaseMachine {
    phase: BatchPhase,
}

impl PhaseMachine {
    pub(crate) fn new() -> Self {
        Self {
            phase: BatchPhase::Idle,
        }
    }

    pub(crate) fn current(&self) -> BatchPhase {
        self.phase
    }

    pub(crate) fn advance(&mut self, next: BatchPhase) -> Result<(), BatchError> {
        if !self.phase.can_transition_to(next) {
            return Err(BatchError::InvalidTransition {
                from: self.phase,
                to: next,
            });
        }
        tracing::debug!(from = %self.phase, to = %next, "batch phase transition");
        self.phase = next;
        Ok(())
    }

    /// Moves to `Failed` if the current phase allows it.
    pub(crate) fn fail(&mut self) {
        if self.phase.can_transition_to(BatchPhase::Failed) {
            self.phase = BatchPhase::Failed;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{BatchPhase, PhaseMachine};
    use crate::error::BatchErrorCode;

    #[test]
    fn happy_path_reaches_done() {
        let mut machine = PhaseMachine::new();
        for next in [
            BatchPhase::PreStatement,
            BatchPhase::RowProcessing,
            BatchPhase::PostStatement,
            BatchPhase::Done,
        ] {
            machine.advance(next).expect("transition");
        }
        assert!(machine.current().is_terminal());
    }

    #[test]
    fn skipping_phases_is_refused() {
        let mut machine = PhaseMachine::new();
        let err = machine
            .advance(BatchPhase::RowProcessing)
            .expect_err("idle cannot jump to rows");
        assert_eq!(err.code(), BatchErrorCode::InvalidTransition);
        assert_eq!(machine.current(), BatchPhase::Idle);
    }

    #[test]
    fn failure_only_from_active_phases() {
        let mut idle = PhaseMachine::new();
        idle.fail();
        assert_eq!(idle.current(), BatchPhase::Idle);

        let mut active = PhaseMachine::new();
        active.advance(BatchPhase::PreStatement).expect("pre");
        active.fail();
        assert_eq!(active.current(), BatchPhase::Failed);
        assert!(!BatchPhase::PostStatement.can_transition_to(BatchPhase::Failed));
    }
}
