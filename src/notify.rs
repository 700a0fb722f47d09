//! Completion notifications.
//!
//! The dispatcher is the single seam between the completion pipeline and
//! whatever delivers messages to users. No retries, no buffering.

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

use crate::registry::{ConnectionRegistry, Delivery};

/// Message pushed to a user when one of their tasks completes.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskCompletedMessage {
    pub kind: &'static str,
    pub task_id: String,
    pub message: String,
}

impl TaskCompletedMessage {
    pub fn new(task_id: &str) -> Self {
        Self {
            kind: "task_completed",
            task_id: task_id.to_string(),
            message: format!("Task {} completed", task_id),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::json!({
            "type": self.kind,
            "task_id": self.task_id,
            "message": self.message,
        })
        .to_string()
    }
}

/// Delivers a text message to a user.
#[async_trait]
pub trait NotificationDispatcher: Send + Sync {
    async fn notify(&self, user_id: &str, message: &str) -> Result<Delivery>;
}

/// Dispatches through the in-process connection registry.
pub struct RegistryDispatcher {
    registry: Arc<ConnectionRegistry>,
}

impl RegistryDispatcher {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl NotificationDispatcher for RegistryDispatcher {
    async fn notify(&self, user_id: &str, message: &str) -> Result<Delivery> {
        self.registry.send_to(user_id, message).await
    }
}

/// Dispatcher for processes that hold no connections (standalone queue
/// workers). Every message is logged and dropped.
pub struct DetachedDispatcher;

#[async_trait]
impl NotificationDispatcher for DetachedDispatcher {
    async fn notify(&self, user_id: &str, message: &str) -> Result<Delivery> {
        info!(user_id = %user_id, message = %message, "No connection registry in this process, notification dropped");
        Ok(Delivery::NotConnected)
    }
}
