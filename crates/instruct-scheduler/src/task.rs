//! Task identity and lifecycle.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, SchedulerError};

/// Unique identifier of one generation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(Uuid);

impl TaskId {
    /// A fresh random id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Lifecycle of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskState {
    Waiting,
    Executing,
    Finished,
    Aborted,
    Error,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Finished | TaskState::Aborted | TaskState::Error)
    }

    pub fn can_advance_to(self, next: TaskState) -> bool {
        matches!(
            (self, next),
            (TaskState::Waiting, TaskState::Executing)
                | (TaskState::Waiting, TaskState::Aborted)
                | (TaskState::Executing, TaskState::Finished)
                | (TaskState::Executing, TaskState::Aborted)
                | (TaskState::Executing, TaskState::Error)
        )
    }

    /// Move to `next`, rejecting transitions the lifecycle does not allow.
    pub fn advance(self, next: TaskState) -> Result<TaskState> {
        if self.can_advance_to(next) {
            Ok(next)
        } else {
            Err(SchedulerError::IllegalTransition {
                from: self,
                to: next,
            })
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TaskState::Waiting => "waiting",
            TaskState::Executing => "executing",
            TaskState::Finished => "finished",
            TaskState::Aborted => "aborted",
            TaskState::Error => "error",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_ids_are_unique_and_parse_back() {
        let a = TaskId::new();
        let b = TaskId::new();
        assert_ne!(a, b);
        assert_eq!(a.to_string().parse::<TaskId>().unwrap(), a);
        assert!("not-a-uuid".parse::<TaskId>().is_err());
    }

    #[test]
    fn task_id_serializes_as_plain_string() {
        let id = TaskId::new();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{id}\""));
    }

    #[test]
    fn legal_transitions() {
        use TaskState::*;
        assert_eq!(Waiting.advance(Executing).unwrap(), Executing);
        assert_eq!(Waiting.advance(Aborted).unwrap(), Aborted);
        for end in [Finished, Aborted, Error] {
            assert_eq!(Executing.advance(end).unwrap(), end);
            assert!(end.is_terminal());
        }
    }

    #[test]
    fn illegal_transitions_are_rejected() {
        use TaskState::*;
        assert!(Waiting.advance(Finished).is_err());
        assert!(Waiting.advance(Error).is_err());
        assert!(Executing.advance(Waiting).is_err());
        for end in [Finished, Aborted, Error] {
            for next in [Waiting, Executing, Finished, Aborted, Error] {
                assert!(end.advance(next).is_err(), "{end} -> {next} must be illegal");
            }
        }
        let err = Finished.advance(Executing).unwrap_err();
        assert_eq!(err.to_string(), "illegal task transition finished -> executing");
    }
}
