//! Task polling with idle backoff
//!
//! Workers poll the store for runnable tasks. While the queue is empty the
//! poll interval grows multiplicatively from the configured base up to a cap,
//! and resets to the base as soon as a task is claimed.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tracing::{debug, trace};

use crate::config::WorkerConfig;
use crate::persistence::{ClaimedTask, StoreError, WorkflowStore};

/// Claims tasks for one worker loop with adaptive idle backoff
pub struct TaskPoller {
    store: Arc<dyn WorkflowStore>,
    worker_id: String,
    base_interval: Duration,
    max_interval: Duration,
    backoff_multiplier: f64,
    current_interval: Duration,
    shutdown_rx: watch::Receiver<bool>,
}

impl TaskPoller {
    /// Create a poller for the given worker id
    pub fn new(
        store: Arc<dyn WorkflowStore>,
        worker_id: impl Into<String>,
        config: &WorkerConfig,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            store,
            worker_id: worker_id.into(),
            base_interval: config.poll_interval,
            max_interval: config.poll_max_interval,
            backoff_multiplier: config.poll_backoff_multiplier.max(1.0),
            current_interval: config.poll_interval,
            shutdown_rx,
        }
    }

    /// Try to claim one task, updating the backoff state
    pub async fn poll(&mut self) -> Result<Option<ClaimedTask>, StoreError> {
        if self.is_shutdown() {
            return Ok(None);
        }

        let task = self
            .store
            .claim_next_task(&self.worker_id, Utc::now())
            .await?;

        match &task {
            Some(claimed) => {
                self.reset_backoff();
                debug!(worker_id = %self.worker_id, task_id = %claimed.id, "claimed task");
            }
            None => {
                self.increase_backoff();
                trace!(
                    worker_id = %self.worker_id,
                    interval_ms = self.current_interval.as_millis() as u64,
                    "queue empty, backing off"
                );
            }
        }

        Ok(task)
    }

    /// Sleep for the current interval; returns true if shutdown was signalled
    pub async fn wait(&mut self) -> bool {
        if self.is_shutdown() {
            return true;
        }
        tokio::select! {
            _ = tokio::time::sleep(self.current_interval) => false,
            _ = self.shutdown_rx.changed() => {
                debug!(worker_id = %self.worker_id, "shutdown signal received during wait");
                true
            }
        }
    }

    /// Whether shutdown has been requested
    pub fn is_shutdown(&self) -> bool {
        *self.shutdown_rx.borrow()
    }

    /// The current poll interval
    pub fn current_interval(&self) -> Duration {
        self.current_interval
    }

    fn reset_backoff(&mut self) {
        self.current_interval = self.base_interval;
    }

    fn increase_backoff(&mut self) {
        let next = Duration::from_secs_f64(
            self.current_interval.as_secs_f64() * self.backoff_multiplier,
        );
        self.current_interval = next.min(self.max_interval);
    }
}
