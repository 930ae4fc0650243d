use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use taskhub_core::{Cardinality, Entity, Patch, Relation, impl_uuid_newtype};

use crate::user::{User, UserId};

/// Task identifier.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(Uuid);

impl_uuid_newtype!(TaskId, "TaskId");

/// Task status lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Cancelled)
    }
}

/// A unit of tracked work owned by a user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub title: String,
    pub description: Option<String>,
    pub status: TaskStatus,
    pub user_id: UserId,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,

    /// Populated only when eager-loaded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<Box<User>>,
}

impl Task {
    /// Patch that moves a task to `Completed` and stamps `completed_at`.
    pub fn completion_patch(at: DateTime<Utc>) -> Patch {
        Patch::new()
            .set("status", TaskStatus::Completed)
            .set("completed_at", at)
            .set("updated_at", at)
    }
}

/// Input for creating a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewTask {
    pub title: String,
    pub description: Option<String>,
    pub status: TaskStatus,
    pub user_id: UserId,
    /// Defaults to the creation instant.
    pub created_at: Option<DateTime<Utc>>,
}

impl NewTask {
    pub fn new(user_id: UserId, title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            description: None,
            status: TaskStatus::Pending,
            user_id,
            created_at: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_status(mut self, status: TaskStatus) -> Self {
        self.status = status;
        self
    }

    pub fn created_at(mut self, at: DateTime<Utc>) -> Self {
        self.created_at = Some(at);
        self
    }
}

impl Entity for Task {
    type Id = TaskId;
    type Input = NewTask;

    const TABLE: &'static str = "tasks";
    const FIELDS: &'static [&'static str] = &[
        "id",
        "title",
        "description",
        "status",
        "user_id",
        "created_at",
        "updated_at",
        "completed_at",
    ];
    const RELATIONS: &'static [Relation] = &[Relation {
        name: "user",
        target: "users",
        local_field: "user_id",
        foreign_field: "id",
        cardinality: Cardinality::One,
    }];

    fn id(&self) -> &TaskId {
        &self.id
    }

    fn from_input(input: NewTask) -> Self {
        let now = Utc::now();
        let created_at = input.created_at.unwrap_or(now);
        let completed_at = (input.status == TaskStatus::Completed).then_some(created_at);
        Self {
            id: TaskId::new(),
            title: input.title,
            description: input.description,
            status: input.status,
            user_id: input.user_id,
            created_at,
            updated_at: created_at,
            completed_at,
            user: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use taskhub_core::entity::to_row;

    #[test]
    fn status_serializes_snake_case() {
        assert_eq!(serde_json::to_value(TaskStatus::InProgress).unwrap(), json!("in_progress"));
        assert!(TaskStatus::Cancelled.is_terminal());
        assert!(!TaskStatus::Pending.is_terminal());
    }

    #[test]
    fn created_completed_tasks_carry_completion_time() {
        let at = Utc::now();
        let task = Task::from_input(
            NewTask::new(UserId::new(), "ship it")
                .with_status(TaskStatus::Completed)
                .created_at(at),
        );
        assert_eq!(task.completed_at, Some(at));
    }

    #[test]
    fn completion_patch_only_touches_known_fields() {
        let patch = Task::completion_patch(Utc::now());
        assert!(patch.validate_for::<Task>().is_ok());

        let row = to_row(&Task::from_input(NewTask::new(UserId::new(), "t"))).unwrap();
        assert!(!row.contains_key("user"));
    }
}
