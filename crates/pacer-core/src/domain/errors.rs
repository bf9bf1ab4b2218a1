//! Domain errors.

use super::{TaskId, TaskStatus};

/// A status change that the task lifecycle does not allow.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("illegal transition for {task_id}: {from} -> {to}")]
pub struct TransitionError {
    pub task_id: TaskId,
    pub from: TaskStatus,
    pub to: TaskStatus,
}
