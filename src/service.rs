//! Task operations for authenticated users.
//!
//! Every mutation is scoped to the calling owner. Creation hands the new
//! task to the completion scheduler and returns without waiting for it.

use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use uuid::Uuid;

use crate::error::{ApiError, ApiResult};
use crate::scheduler::CompletionScheduler;
use crate::store::{StoreError, TaskStore};
use crate::types::{NewTask, Task, TaskFilter, TaskPatch, TaskStatus};

/// Body of `POST /tasks/create`.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateTask {
    pub title: String,
    #[serde(default)]
    pub description: String,
    /// Only `pending` is accepted.
    #[serde(default)]
    pub status: Option<TaskStatus>,
}

pub struct TaskService {
    store: Arc<dyn TaskStore>,
    scheduler: Arc<dyn CompletionScheduler>,
    completion_delay: Duration,
}

impl TaskService {
    pub fn new(
        store: Arc<dyn TaskStore>,
        scheduler: Arc<dyn CompletionScheduler>,
        completion_delay: Duration,
    ) -> Self {
        Self {
            store,
            scheduler,
            completion_delay,
        }
    }

    pub fn scheduler(&self) -> &dyn CompletionScheduler {
        self.scheduler.as_ref()
    }

    /// Persist a pending task and schedule its completion.
    pub async fn create(&self, req: CreateTask, owner_id: &str) -> ApiResult<Task> {
        let title = req.title.trim().to_string();
        if title.is_empty() {
            return Err(ApiError::validation("title", "Title must not be empty"));
        }
        if let Some(status) = req.status {
            if status != TaskStatus::Pending {
                return Err(ApiError::validation(
                    "status",
                    "New tasks must have status 'pending'",
                ));
            }
        }

        if self
            .store
            .find_one(&TaskFilter::titled(&title, owner_id))
            .await?
            .is_some()
        {
            return Err(ApiError::already_exists("Task already exists"));
        }

        let id = self
            .store
            .insert(NewTask {
                owner_id: owner_id.to_string(),
                title,
                description: req.description,
                status: TaskStatus::Pending,
            })
            .await
            .map_err(duplicate_title)?;

        let task = self
            .store
            .find_one(&TaskFilter::by_id(&id))
            .await?
            .ok_or_else(|| ApiError::internal(format!("task {} missing after insert", id)))?;

        info!(task_id = %id, user_id = %owner_id, "Task created");

        if let Err(e) = self
            .scheduler
            .schedule(&id, owner_id, self.completion_delay)
            .await
        {
            error!(task_id = %id, strategy = self.scheduler.strategy().as_str(), error = %e, "Failed to schedule completion");
        }

        Ok(task)
    }

    /// Apply a partial update to a task the caller owns.
    pub async fn update(&self, task_id: &str, patch: TaskPatch, owner_id: &str) -> ApiResult<Task> {
        check_id(task_id)?;

        let title = match patch.title.as_deref().map(str::trim) {
            Some("") => return Err(ApiError::validation("title", "Title must not be empty")),
            other => other.map(str::to_string),
        };
        let patch = TaskPatch { title, ..patch };

        let filter = TaskFilter::owned(task_id, owner_id);
        if self.store.find_one(&filter).await?.is_none() {
            return Err(ApiError::task_not_found());
        }

        if let Some(title) = &patch.title {
            let clash = self
                .store
                .find_one(&TaskFilter::titled(title, owner_id))
                .await?;
            if clash.is_some_and(|other| other.id != task_id) {
                return Err(ApiError::already_exists("Task already exists"));
            }
        }

        let task = self
            .store
            .update_one(&filter, &patch)
            .await
            .map_err(duplicate_title)?
            .ok_or_else(ApiError::task_not_found)?;

        info!(task_id = %task_id, user_id = %owner_id, status = task.status.as_str(), "Task updated");
        Ok(task)
    }

    /// Hard-delete a task the caller owns.
    pub async fn delete(&self, task_id: &str, owner_id: &str) -> ApiResult<()> {
        check_id(task_id)?;

        if !self
            .store
            .delete_one(&TaskFilter::owned(task_id, owner_id))
            .await?
        {
            return Err(ApiError::task_not_found());
        }

        info!(task_id = %task_id, user_id = %owner_id, "Task deleted");
        Ok(())
    }

    /// Tasks of one owner, or of everyone when `owner_id` is `None`.
    pub async fn list(&self, owner_id: Option<&str>) -> ApiResult<Vec<Task>> {
        let filter = match owner_id {
            Some(owner) => TaskFilter::by_owner(owner),
            None => TaskFilter::default(),
        };
        Ok(self.store.find_many(&filter).await?)
    }
}

fn check_id(task_id: &str) -> ApiResult<()> {
    Uuid::parse_str(task_id)
        .map(|_| ())
        .map_err(|_| ApiError::invalid_id())
}

fn duplicate_title(err: StoreError) -> ApiError {
    match err {
        StoreError::Conflict(_) => ApiError::already_exists("Task already exists"),
        other => other.into(),
    }
}
