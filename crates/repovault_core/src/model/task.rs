//! Queued task records and reservation keys.
//!
//! # Invariants
//! - A reservation key is always `(resource type tag, resource id)`.
//! - At most one task per key is `Running` at any instant.
//! - `Completed`, `Failed` and `Canceled` are terminal.

use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use uuid::Uuid;

pub type TaskId = Uuid;

/// Resource kinds used to build reservation keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    Repository,
    Distribution,
}

impl ResourceType {
    pub fn as_tag(self) -> &'static str {
        match self {
            Self::Repository => "repository",
            Self::Distribution => "distribution",
        }
    }

    pub fn from_tag(value: &str) -> Option<Self> {
        match value {
            "repository" => Some(Self::Repository),
            "distribution" => Some(Self::Distribution),
            _ => None,
        }
    }
}

/// Serialization key for mutating work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReservationKey {
    pub resource_type: ResourceType,
    pub resource_id: Uuid,
}

impl ReservationKey {
    pub fn new(resource_type: ResourceType, resource_id: Uuid) -> Self {
        Self {
            resource_type,
            resource_id,
        }
    }

    pub fn repository(id: Uuid) -> Self {
        Self::new(ResourceType::Repository, id)
    }

    pub fn distribution(id: Uuid) -> Self {
        Self::new(ResourceType::Distribution, id)
    }
}

impl Display for ReservationKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.resource_type.as_tag(), self.resource_id)
    }
}

/// Task lifecycle in the status store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Waiting,
    Running,
    Completed,
    Failed,
    Canceled,
}

impl TaskState {
    pub fn as_db(self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        }
    }

    pub fn from_db(value: &str) -> Option<Self> {
        match value {
            "waiting" => Some(Self::Waiting),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "canceled" => Some(Self::Canceled),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Canceled)
    }
}

/// Handle returned to callers at enqueue time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskHandle {
    pub task_id: TaskId,
    pub key: ReservationKey,
}

/// Status-store view of one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: TaskId,
    /// Global submission order.
    pub seq: i64,
    pub name: String,
    pub args: serde_json::Value,
    pub key: ReservationKey,
    pub state: TaskState,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub worker: Option<String>,
    pub enqueued_at: i64,
    pub started_at: Option<i64>,
    pub finished_at: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::{ReservationKey, TaskState};
    use uuid::Uuid;

    #[test]
    fn reservation_key_display_is_type_and_id() {
        let id = Uuid::nil();
        assert_eq!(
            ReservationKey::repository(id).to_string(),
            format!("repository:{id}")
        );
    }

    #[test]
    fn terminal_states() {
        assert!(!TaskState::Waiting.is_terminal());
        assert!(!TaskState::Running.is_terminal());
        assert!(TaskState::Failed.is_terminal());
        assert_eq!(TaskState::from_db("canceled"), Some(TaskState::Canceled));
    }
}
