//! Core types for the task relay.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Task lifecycle status.
///
/// Owners may move a task through any of these states. The completion
/// scheduler only ever performs `pending -> completed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
        }
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "in_progress" => Ok(TaskStatus::InProgress),
            "completed" => Ok(TaskStatus::Completed),
            other => Err(format!("unknown task status: {}", other)),
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A task owned by a single user.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub id: String,
    /// Owning user id.
    #[serde(rename = "user_id")]
    pub owner_id: String,
    pub title: String,
    pub description: String,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

/// Record handed to the store on insert. The store assigns id and timestamps.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub owner_id: String,
    pub title: String,
    pub description: String,
    pub status: TaskStatus,
}

/// Partial update. `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct TaskPatch {
    pub title: Option<String>,
    pub description: Option<String>,
    pub status: Option<TaskStatus>,
}

impl TaskPatch {
    /// Patch that marks a task completed.
    pub fn completed() -> Self {
        Self {
            status: Some(TaskStatus::Completed),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.title.is_none() && self.description.is_none() && self.status.is_none()
    }
}

/// Conjunction of optional equality predicates over task fields.
///
/// An empty filter matches every task.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskFilter {
    pub id: Option<String>,
    pub owner_id: Option<String>,
    pub title: Option<String>,
    pub status: Option<TaskStatus>,
}

impl TaskFilter {
    pub fn by_id(id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            ..Self::default()
        }
    }

    pub fn by_owner(owner_id: impl Into<String>) -> Self {
        Self {
            owner_id: Some(owner_id.into()),
            ..Self::default()
        }
    }

    pub fn owned(id: impl Into<String>, owner_id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            owner_id: Some(owner_id.into()),
            ..Self::default()
        }
    }

    pub fn titled(title: impl Into<String>, owner_id: impl Into<String>) -> Self {
        Self {
            title: Some(title.into()),
            owner_id: Some(owner_id.into()),
            ..Self::default()
        }
    }
}

/// User role carried in access tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    #[default]
    User,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::User => "user",
        }
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "admin" => Ok(Role::Admin),
            "user" => Ok(Role::User),
            other => Err(format!("unknown role: {}", other)),
        }
    }
}

/// A registered user.
#[derive(Debug, Clone, Serialize)]
pub struct User {
    pub id: String,
    pub email: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub name: String,
    pub role: Role,
    pub created_at: DateTime<Utc>,
}

/// Input for creating a user; the password is already hashed.
#[derive(Debug, Clone)]
pub struct NewUser {
    pub email: String,
    pub password_hash: String,
    pub name: String,
    pub role: Role,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_str() {
        for status in [TaskStatus::Pending, TaskStatus::InProgress, TaskStatus::Completed] {
            assert_eq!(status.as_str().parse::<TaskStatus>().unwrap(), status);
        }
        assert!("done".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn status_serializes_snake_case() {
        let json = serde_json::to_string(&TaskStatus::InProgress).unwrap();
        assert_eq!(json, "\"in_progress\"");
    }

    #[test]
    fn task_serializes_owner_as_user_id() {
        let now = Utc::now();
        let task = Task {
            id: "t1".into(),
            owner_id: "u1".into(),
            title: "T1".into(),
            description: "d".into(),
            status: TaskStatus::Pending,
            created_at: now,
            updated_at: now,
            completed_at: None,
        };
        let value = serde_json::to_value(&task).unwrap();
        assert_eq!(value["user_id"], "u1");
        assert_eq!(value["status"], "pending");
        assert!(value.get("completed_at").is_none());
    }

    #[test]
    fn user_never_serializes_password_hash() {
        let user = User {
            id: "u1".into(),
            email: "a@x.com".into(),
            password_hash: "secret-hash".into(),
            name: "Alice".into(),
            role: Role::Admin,
            created_at: Utc::now(),
        };
        let json = serde_json::to_string(&user).unwrap();
        assert!(!json.contains("secret-hash"));
        assert!(json.contains("\"role\":\"admin\""));
    }

    #[test]
    fn empty_patch_detected() {
        assert!(TaskPatch::default().is_empty());
        assert!(!TaskPatch::completed().is_empty());
    }
}
