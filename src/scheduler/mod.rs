//! Deferred task completion.
//!
//! A scheduled completion moves through
//! `Scheduled -> Fired -> StoreUpdated -> Notified`, with two failure exits:
//! `StoreUpdateFailed` (retried only by queue redelivery) and `NotifyFailed`
//! (never retried). The store update is an unconditional
//! `status = completed`, so running it more than once is harmless.
//!
//! Two interchangeable strategies implement [`CompletionScheduler`]:
//! - [`bound::BoundDelayScheduler`] sleeps in a spawned task of this process.
//!   A completion still waiting when the process exits is lost.
//! - [`queue::DurableQueueScheduler`] publishes to a [`queue::Broker`]; queue
//!   workers execute it with at-least-once delivery.

pub mod bound;
pub mod queue;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::config::{CompletionStrategy, SchedulerConfig};
use crate::notify::{NotificationDispatcher, TaskCompletedMessage};
use crate::registry::Delivery;
use crate::store::TaskStore;
use crate::types::{TaskFilter, TaskPatch};

pub use bound::BoundDelayScheduler;
pub use queue::{Broker, DurableQueueScheduler, QueueWorker, WorkerPool};

/// A pending `pending -> completed` transition for one task.
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduledCompletion {
    pub task_id: String,
    pub owner_id: String,
    pub fire_at: DateTime<Utc>,
}

impl ScheduledCompletion {
    pub fn new(task_id: &str, owner_id: &str, delay: Duration) -> Self {
        let delay = chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero());
        Self {
            task_id: task_id.to_string(),
            owner_id: owner_id.to_string(),
            fire_at: Utc::now() + delay,
        }
    }
}

/// Where a completion attempt ended up.
#[derive(Debug, Clone, PartialEq)]
pub enum CompletionState {
    /// Store updated and one notification attempt made.
    Notified(Delivery),
    /// The store update failed; nothing was sent.
    StoreUpdateFailed(String),
    /// Store updated, but sending the notification failed.
    NotifyFailed(String),
    /// The task was deleted before the completion fired.
    TaskGone,
    /// A queue message that does not describe a completion. It was
    /// dead-lettered without touching the store.
    Rejected(String),
}

impl CompletionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompletionState::Notified(_) => "notified",
            CompletionState::StoreUpdateFailed(_) => "store_update_failed",
            CompletionState::NotifyFailed(_) => "notify_failed",
            CompletionState::TaskGone => "task_gone",
            CompletionState::Rejected(_) => "rejected",
        }
    }

    /// True when the store now shows the task completed.
    pub fn store_updated(&self) -> bool {
        matches!(
            self,
            CompletionState::Notified(_) | CompletionState::NotifyFailed(_)
        )
    }
}

/// The completion step shared by both strategies: update, then notify once.
pub struct CompletionHandler {
    store: Arc<dyn TaskStore>,
    dispatcher: Arc<dyn NotificationDispatcher>,
}

impl CompletionHandler {
    pub fn new(store: Arc<dyn TaskStore>, dispatcher: Arc<dyn NotificationDispatcher>) -> Self {
        Self { store, dispatcher }
    }

    /// Fire one completion. Never panics or returns an error; failures are
    /// logged and reported through the returned state.
    pub async fn run(&self, job: &ScheduledCompletion) -> CompletionState {
        debug!(task_id = %job.task_id, user_id = %job.owner_id, "Completion fired");

        let filter = TaskFilter::owned(&job.task_id, &job.owner_id);
        match self.store.update_one(&filter, &TaskPatch::completed()).await {
            Ok(Some(_)) => {
                debug!(task_id = %job.task_id, "Task marked completed");
            }
            Ok(None) => {
                warn!(task_id = %job.task_id, user_id = %job.owner_id, "Task no longer exists, completion discarded");
                return CompletionState::TaskGone;
            }
            Err(e) => {
                error!(task_id = %job.task_id, error = %e, "Failed to mark task completed");
                return CompletionState::StoreUpdateFailed(e.to_string());
            }
        }

        let message = TaskCompletedMessage::new(&job.task_id).to_json();
        match self.dispatcher.notify(&job.owner_id, &message).await {
            Ok(delivery) => {
                info!(
                    task_id = %job.task_id,
                    user_id = %job.owner_id,
                    delivered = delivery == Delivery::Delivered,
                    "Task completed"
                );
                CompletionState::Notified(delivery)
            }
            Err(e) => {
                warn!(task_id = %job.task_id, user_id = %job.owner_id, error = %e, "Completion notification failed");
                CompletionState::NotifyFailed(e.to_string())
            }
        }
    }
}

/// Accepts completions for later execution.
#[async_trait]
pub trait CompletionScheduler: Send + Sync {
    fn strategy(&self) -> CompletionStrategy;

    /// Arrange for the task to be completed after `delay`. Returns once the
    /// completion is handed off; the caller never waits for it to fire.
    async fn schedule(&self, task_id: &str, owner_id: &str, delay: Duration) -> Result<ScheduledCompletion>;
}

/// Build the scheduler selected by configuration.
pub fn build_scheduler(
    config: &SchedulerConfig,
    handler: Arc<CompletionHandler>,
    broker: Arc<dyn Broker>,
) -> Arc<dyn CompletionScheduler> {
    match config.strategy {
        CompletionStrategy::BoundDelay => Arc::new(BoundDelayScheduler::new(handler)),
        CompletionStrategy::DurableQueue => {
            Arc::new(DurableQueueScheduler::new(broker, config.queue.name.clone()))
        }
    }
}
