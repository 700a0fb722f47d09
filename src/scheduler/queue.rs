//! Durable completion through a message broker.
//!
//! The web process publishes a `tasks.complete_task` message that becomes
//! deliverable once the delay has passed. Workers, embedded in the web
//! process or running standalone, lease messages, run the completion
//! handler and then ack. A worker that dies mid-message leaves the lease to
//! expire so another worker picks it up.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::{CompletionHandler, CompletionScheduler, CompletionState, ScheduledCompletion};
use crate::config::{CompletionStrategy, QueueConfig};
use crate::db::now_ms;

/// Task name carried by completion messages.
pub const COMPLETE_TASK: &str = "tasks.complete_task";

const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// A leased message.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueMessage {
    pub id: i64,
    pub queue: String,
    pub task_name: String,
    pub payload: String,
    /// 1 on first delivery.
    pub attempt: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub ready: u64,
    pub reserved: u64,
    pub done: u64,
    pub dead: u64,
}

/// Durable at-least-once message transport.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Enqueue a message deliverable from `available_at` (unix ms).
    async fn publish(
        &self,
        queue: &str,
        task_name: &str,
        payload: serde_json::Value,
        available_at: i64,
    ) -> Result<i64>;

    /// Lease the next due message for `visibility`.
    async fn reserve(&self, queue: &str, visibility: Duration) -> Result<Option<QueueMessage>>;

    async fn ack(&self, id: i64) -> Result<()>;

    /// Release for retry; returns true if the message was dead-lettered instead.
    async fn nack(&self, id: i64, error: &str, retry_after: Duration, max_attempts: u32) -> Result<bool>;

    /// Dead-letter without retrying.
    async fn bury(&self, id: i64, error: &str) -> Result<()>;

    async fn stats(&self, queue: &str) -> Result<QueueStats>;

    /// Drop finished (`done` or `dead`) messages older than `retention`.
    async fn purge(&self, queue: &str, retention: Duration) -> Result<u64>;
}

/// Payload of a `tasks.complete_task` message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionJob {
    pub task_id: String,
    pub user_id: String,
}

/// Publishes completions to a broker queue.
pub struct DurableQueueScheduler {
    broker: Arc<dyn Broker>,
    queue: String,
}

impl DurableQueueScheduler {
    pub fn new(broker: Arc<dyn Broker>, queue: impl Into<String>) -> Self {
        Self {
            broker,
            queue: queue.into(),
        }
    }
}

#[async_trait]
impl CompletionScheduler for DurableQueueScheduler {
    fn strategy(&self) -> CompletionStrategy {
        CompletionStrategy::DurableQueue
    }

    async fn schedule(&self, task_id: &str, owner_id: &str, delay: Duration) -> Result<ScheduledCompletion> {
        let job = ScheduledCompletion::new(task_id, owner_id, delay);
        let payload = serde_json::to_value(CompletionJob {
            task_id: task_id.to_string(),
            user_id: owner_id.to_string(),
        })?;
        let available_at = now_ms() + delay.as_millis() as i64;

        let message_id = self
            .broker
            .publish(&self.queue, COMPLETE_TASK, payload, available_at)
            .await?;

        debug!(task_id = %task_id, message_id, queue = %self.queue, "Completion published");
        Ok(job)
    }
}

/// Consumes completion messages from one queue.
pub struct QueueWorker {
    id: usize,
    broker: Arc<dyn Broker>,
    handler: Arc<CompletionHandler>,
    config: QueueConfig,
}

impl QueueWorker {
    pub fn new(id: usize, broker: Arc<dyn Broker>, handler: Arc<CompletionHandler>, config: QueueConfig) -> Self {
        Self {
            id,
            broker,
            handler,
            config,
        }
    }

    /// Lease and process at most one message. `Ok(None)` when nothing is due.
    pub async fn process_next(&self) -> Result<Option<CompletionState>> {
        let visibility = Duration::from_secs(self.config.visibility_timeout_secs);
        let Some(message) = self.broker.reserve(&self.config.name, visibility).await? else {
            return Ok(None);
        };
        self.process(message).await.map(Some)
    }

    async fn process(&self, message: QueueMessage) -> Result<CompletionState> {
        if message.task_name != COMPLETE_TASK {
            warn!(message_id = message.id, task_name = %message.task_name, "Unknown task name, dead-lettering");
            let reason = format!("unknown task name: {}", message.task_name);
            self.broker.bury(message.id, &reason).await?;
            return Ok(CompletionState::Rejected(reason));
        }

        let job: CompletionJob = match serde_json::from_str(&message.payload) {
            Ok(job) => job,
            Err(e) => {
                warn!(message_id = message.id, error = %e, "Undecodable payload, dead-lettering");
                let reason = format!("bad payload: {}", e);
                self.broker.bury(message.id, &reason).await?;
                return Ok(CompletionState::Rejected(reason));
            }
        };

        debug!(
            worker = self.id,
            message_id = message.id,
            attempt = message.attempt,
            task_id = %job.task_id,
            "Processing completion"
        );

        let scheduled = ScheduledCompletion::new(&job.task_id, &job.user_id, Duration::ZERO);
        let state = self.handler.run(&scheduled).await;

        match &state {
            CompletionState::StoreUpdateFailed(reason) => {
                let retry_after = Duration::from_secs(self.config.retry_after_secs);
                let dead = self
                    .broker
                    .nack(message.id, reason, retry_after, self.config.max_attempts)
                    .await?;
                if dead {
                    error!(message_id = message.id, task_id = %job.task_id, attempts = message.attempt, "Completion dead-lettered");
                }
            }
            _ => {
                // Ack failure means redelivery; the handler tolerates that.
                if let Err(e) = self.broker.ack(message.id).await {
                    warn!(message_id = message.id, error = %e, "Ack failed, message will be redelivered");
                }
            }
        }

        Ok(state)
    }

    /// Delete finished messages past the retention window.
    pub async fn sweep(&self) -> Result<u64> {
        let retention = Duration::from_secs(self.config.retention_secs);
        let removed = self.broker.purge(&self.config.name, retention).await?;
        if removed > 0 {
            debug!(worker = self.id, removed, queue = %self.config.name, "Purged finished messages");
        }
        Ok(removed)
    }

    /// Poll until `shutdown` flips to true.
    ///
    /// Worker 0 also sweeps finished messages, at most once a minute.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let poll = Duration::from_millis(self.config.poll_interval_ms);
        let sweep_every = Duration::from_secs(self.config.retention_secs).min(SWEEP_INTERVAL);
        let mut last_sweep: Option<Instant> = None;
        info!(worker = self.id, queue = %self.config.name, "Queue worker started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.process_next().await {
                Ok(Some(_)) => continue,
                Ok(None) => {}
                Err(e) => error!(worker = self.id, error = %e, "Queue worker error"),
            }

            if self.id == 0 && last_sweep.is_none_or(|at| at.elapsed() >= sweep_every) {
                if let Err(e) = self.sweep().await {
                    warn!(worker = self.id, error = %e, "Queue sweep failed");
                }
                last_sweep = Some(Instant::now());
            }

            tokio::select! {
                _ = tokio::time::sleep(poll) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!(worker = self.id, "Queue worker stopped");
    }
}

/// A set of running queue workers sharing one shutdown signal.
pub struct WorkerPool {
    shutdown_tx: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn spawn(
        count: usize,
        broker: Arc<dyn Broker>,
        handler: Arc<CompletionHandler>,
        config: &QueueConfig,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handles = (0..count)
            .map(|id| {
                let worker = QueueWorker::new(id, Arc::clone(&broker), Arc::clone(&handler), config.clone());
                tokio::spawn(worker.run(shutdown_rx.clone()))
            })
            .collect();

        Self { shutdown_tx, handles }
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Signal every worker and wait for them to finish their current message.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        for handle in self.handles {
            if let Err(e) = handle.await {
                error!(error = %e, "Queue worker panicked");
            }
        }
    }
}
