//! Scheduler error types.

use crate::task::{TaskId, TaskState};

pub type Result<T> = std::result::Result<T, SchedulerError>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchedulerError {
    #[error("task {0} is already registered")]
    DuplicateTask(TaskId),

    #[error("illegal task transition {from} -> {to}")]
    IllegalTransition { from: TaskState, to: TaskState },
}
