//! In-process delayed completion.

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::debug;

use super::{CompletionHandler, CompletionScheduler, ScheduledCompletion};
use crate::config::CompletionStrategy;

/// Runs each completion in its own spawned task after a sleep.
///
/// Nothing is persisted: completions still sleeping when the process exits
/// are lost. There is no cancellation.
pub struct BoundDelayScheduler {
    handler: Arc<CompletionHandler>,
    in_flight: Arc<AtomicUsize>,
}

/// Decrements the in-flight counter when the spawned task ends, however it ends.
struct InFlightGuard(Arc<AtomicUsize>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

impl BoundDelayScheduler {
    pub fn new(handler: Arc<CompletionHandler>) -> Self {
        Self {
            handler,
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Completions scheduled but not yet finished.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }
}

#[async_trait]
impl CompletionScheduler for BoundDelayScheduler {
    fn strategy(&self) -> CompletionStrategy {
        CompletionStrategy::BoundDelay
    }

    async fn schedule(&self, task_id: &str, owner_id: &str, delay: Duration) -> Result<ScheduledCompletion> {
        let job = ScheduledCompletion::new(task_id, owner_id, delay);

        self.in_flight.fetch_add(1, Ordering::AcqRel);
        let guard = InFlightGuard(Arc::clone(&self.in_flight));
        let handler = Arc::clone(&self.handler);
        let spawned = job.clone();

        tokio::spawn(async move {
            let _guard = guard;
            tokio::time::sleep(delay).await;
            let state = handler.run(&spawned).await;
            debug!(task_id = %spawned.task_id, state = state.as_str(), "Bound completion finished");
        });

        debug!(task_id = %task_id, delay_ms = delay.as_millis() as u64, "Completion scheduled in-process");
        Ok(job)
    }
}

impl Drop for BoundDelayScheduler {
    fn drop(&mut self) {
        let pending = self.in_flight();
        if pending > 0 {
            tracing::warn!(pending, "Scheduler dropped with completions still waiting; they will be lost on exit");
        }
    }
}
