use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use taskhub_core::{Cardinality, Entity, Relation, impl_uuid_newtype};

use crate::task::Task;

/// User identifier.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(Uuid);

impl_uuid_newtype!(UserId, "UserId");

/// A user account owning tasks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub username: String,
    pub email: String,
    pub full_name: Option<String>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    /// Populated only when eager-loaded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tasks: Option<Vec<Task>>,
}

/// Input for creating a user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewUser {
    pub username: String,
    pub email: String,
    pub full_name: Option<String>,
}

impl NewUser {
    pub fn new(username: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            email: email.into(),
            full_name: None,
        }
    }

    pub fn with_full_name(mut self, full_name: impl Into<String>) -> Self {
        self.full_name = Some(full_name.into());
        self
    }
}

impl Entity for User {
    type Id = UserId;
    type Input = NewUser;

    const TABLE: &'static str = "users";
    const FIELDS: &'static [&'static str] = &[
        "id",
        "username",
        "email",
        "full_name",
        "is_active",
        "created_at",
        "updated_at",
    ];
    const UNIQUE_FIELDS: &'static [&'static str] = &["username", "email"];
    const RELATIONS: &'static [Relation] = &[Relation {
        name: "tasks",
        target: "tasks",
        local_field: "id",
        foreign_field: "user_id",
        cardinality: Cardinality::Many,
    }];

    fn id(&self) -> &UserId {
        &self.id
    }

    fn from_input(input: NewUser) -> Self {
        let now = Utc::now();
        Self {
            id: UserId::new(),
            username: input.username,
            email: input.email,
            full_name: input.full_name,
            is_active: true,
            created_at: now,
            updated_at: now,
            tasks: None,
        }
    }
}
