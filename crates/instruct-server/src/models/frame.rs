//! Server-to-client status frames.

use instruct_scheduler::{TaskId, TaskState};
use serde::{Deserialize, Serialize};

/// Status tag carried by every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Starting,
    Waiting,
    Running,
    Finished,
    #[serde(rename = "abort")]
    Aborted,
    Error,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Finished | TaskStatus::Aborted | TaskStatus::Error
        )
    }
}

impl From<TaskState> for TaskStatus {
    fn from(state: TaskState) -> Self {
        match state {
            TaskState::Waiting => TaskStatus::Waiting,
            TaskState::Executing => TaskStatus::Running,
            TaskState::Finished => TaskStatus::Finished,
            TaskState::Aborted => TaskStatus::Aborted,
            TaskState::Error => TaskStatus::Error,
        }
    }
}

/// One JSON text frame sent to the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    /// Absent only for requests rejected before a task existed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<TaskId>,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_pos: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Frame {
    fn new(task_id: Option<TaskId>, status: TaskStatus) -> Self {
        Self {
            task_id,
            status,
            queue_pos: None,
            tokens: None,
            message: None,
        }
    }

    pub fn starting(task_id: TaskId) -> Self {
        Self::new(Some(task_id), TaskStatus::Starting)
    }

    pub fn waiting(task_id: TaskId, queue_pos: usize) -> Self {
        Self {
            queue_pos: Some(queue_pos),
            ..Self::new(Some(task_id), TaskStatus::Waiting)
        }
    }

    pub fn running(task_id: TaskId, tokens: impl Into<String>) -> Self {
        Self {
            tokens: Some(tokens.into()),
            ..Self::new(Some(task_id), TaskStatus::Running)
        }
    }

    pub fn finished(task_id: TaskId) -> Self {
        Self::new(Some(task_id), TaskStatus::Finished)
    }

    pub fn aborted(task_id: TaskId) -> Self {
        Self::new(Some(task_id), TaskStatus::Aborted)
    }

    pub fn error(task_id: Option<TaskId>, message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            ..Self::new(task_id, TaskStatus::Error)
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    #[test]
    fn statuses_are_lowercase_with_abort_token() {
        let id = TaskId::new();
        let value: Value = serde_json::to_value(Frame::aborted(id)).unwrap();
        assert_eq!(value, json!({ "task_id": id.to_string(), "status": "abort" }));

        let value: Value = serde_json::to_value(Frame::waiting(id, 3)).unwrap();
        assert_eq!(value["status"], "waiting");
        assert_eq!(value["queue_pos"], 3);
        assert!(value.get("tokens").is_none());
    }

    #[test]
    fn validation_error_has_no_task_id() {
        let value: Value = serde_json::to_value(Frame::error(None, "bad")).unwrap();
        assert_eq!(value, json!({ "status": "error", "message": "bad" }));
    }

    #[test]
    fn lifecycle_states_map_to_wire_statuses() {
        assert_eq!(TaskStatus::from(TaskState::Executing), TaskStatus::Running);
        for state in [TaskState::Finished, TaskState::Aborted, TaskState::Error] {
            assert!(TaskStatus::from(state).is_terminal());
        }
        assert!(!TaskStatus::from(TaskState::Waiting).is_terminal());
    }

    #[test]
    fn only_outcomes_are_terminal() {
        let id = TaskId::new();
        assert!(!Frame::starting(id).is_terminal());
        assert!(!Frame::waiting(id, 0).is_terminal());
        assert!(!Frame::running(id, "x").is_terminal());
        assert!(Frame::finished(id).is_terminal());
        assert!(Frame::aborted(id).is_terminal());
        assert!(Frame::error(Some(id), "x").is_terminal());
    }
}
