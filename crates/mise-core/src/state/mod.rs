//! Plan and task state machines.
//!
//! Both are pure transition tables. Persistence applies them through
//! compare-and-set updates guarded by the expected current state, so a
//! transition computed from a stale read fails instead of overwriting.

use mise_db::models::{PlanStatus, TaskStatus};

use crate::error::{EngineError, Result};

/// The meal plan state machine.
///
/// ```text
/// awaiting_votes      -> finalized            (deadline elapsed, quorum met)
/// awaiting_votes      -> finalization_failed  (deadline elapsed, no quorum)
/// finalization_failed -> awaiting_votes       (operator replay)
/// ```
///
/// `finalized` is terminal; task materialization only flips option flags.
pub struct PlanStateMachine;

impl PlanStateMachine {
    pub fn is_valid_transition(from: PlanStatus, to: PlanStatus) -> bool {
        matches!(
            (from, to),
            (PlanStatus::AwaitingVotes, PlanStatus::Finalized)
                | (PlanStatus::AwaitingVotes, PlanStatus::FinalizationFailed)
                | (PlanStatus::FinalizationFailed, PlanStatus::AwaitingVotes)
        )
    }

    pub fn check(from: PlanStatus, to: PlanStatus) -> Result<()> {
        if Self::is_valid_transition(from, to) {
            Ok(())
        } else {
            Err(EngineError::illegal_plan_transition(from, to))
        }
    }
}

/// The meal plan task state machine.
///
/// ```text
/// unfinished -> delayed | ignored | finished
/// delayed    -> finished | ignored
/// ```
pub struct TaskStateMachine;

impl TaskStateMachine {
    pub fn is_valid_transition(from: TaskStatus, to: TaskStatus) -> bool {
        matches!(
            (from, to),
            (TaskStatus::Unfinished, TaskStatus::Delayed)
                | (TaskStatus::Unfinished, TaskStatus::Ignored)
                | (TaskStatus::Unfinished, TaskStatus::Finished)
                | (TaskStatus::Delayed, TaskStatus::Finished)
                | (TaskStatus::Delayed, TaskStatus::Ignored)
        )
    }

    pub fn check(from: TaskStatus, to: TaskStatus) -> Result<()> {
        if Self::is_valid_transition(from, to) {
            Ok(())
        } else {
            Err(EngineError::illegal_task_transition(from, to))
        }
    }
}
