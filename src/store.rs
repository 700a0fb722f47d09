//! Task record store contract.
//!
//! Every operation is atomic for a single record. There are no multi-record
//! transactions, and the completion pipeline only relies on `update_one`
//! being atomic.

use async_trait::async_trait;

use crate::types::{NewTask, Task, TaskFilter, TaskPatch};

/// Failures surfaced by a [`TaskStore`].
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// A uniqueness constraint rejected the write.
    #[error("{0}")]
    Conflict(String),
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Durable task records.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Insert a record and return its new id.
    async fn insert(&self, task: NewTask) -> StoreResult<String>;

    async fn find_one(&self, filter: &TaskFilter) -> StoreResult<Option<Task>>;

    /// All matching records, oldest first.
    async fn find_many(&self, filter: &TaskFilter) -> StoreResult<Vec<Task>>;

    /// Apply `patch` to the first matching record. Returns the updated record,
    /// or `None` when nothing matched.
    async fn update_one(&self, filter: &TaskFilter, patch: &TaskPatch) -> StoreResult<Option<Task>>;

    /// Delete the first matching record. Returns whether a record was removed.
    async fn delete_one(&self, filter: &TaskFilter) -> StoreResult<bool>;
}
