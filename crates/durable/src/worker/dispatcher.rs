//! Task dispatch
//!
//! The dispatcher owns the per-task execution paths shared by the worker pool
//! and the embedded `run_once` API: Step tasks go to the replay engine,
//! Activity tasks execute a registered handler under its timeout and retry
//! policy, Timer tasks record their firing.

use std::sync::Arc;

use tracing::{debug, instrument, warn};

use crate::activity::ActivityError;
use crate::config::ActivityConfig;
use crate::engine::{EngineError, ReplayEngine};
use crate::persistence::{ClaimedTask, StoreError, TaskKind, WorkflowStore};
use crate::registry::Registry;
use crate::workflow::WorkflowEvent;

/// Worker-side errors
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    /// Store error
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Engine error
    #[error("engine error: {0}")]
    Engine(#[from] EngineError),

    /// Worker pool is already running
    #[error("worker pool is already running")]
    AlreadyRunning,

    /// Graceful shutdown timed out
    #[error("graceful shutdown timed out")]
    ShutdownTimeout,
}

/// Executes claimed tasks against the engine, registry and store
pub struct Dispatcher {
    store: Arc<dyn WorkflowStore>,
    registry: Arc<Registry>,
    engine: ReplayEngine,
    activity_defaults: ActivityConfig,
}

impl Dispatcher {
    /// Create a dispatcher (and its replay engine) over shared components
    pub fn new(
        store: Arc<dyn WorkflowStore>,
        registry: Arc<Registry>,
        activity_defaults: ActivityConfig,
    ) -> Self {
        let engine = ReplayEngine::new(
            Arc::clone(&store),
            Arc::clone(&registry),
            activity_defaults.clone(),
        );
        Self {
            store,
            registry,
            engine,
            activity_defaults,
        }
    }

    /// Run one claimed task to its task-level outcome
    ///
    /// Task-level failures (retry scheduling, parking) are handled internally;
    /// an `Err` from this function means the store itself failed.
    #[instrument(skip(self, task), fields(task_id = %task.id, kind = %task.kind, workflow_id = %task.workflow_id))]
    pub async fn dispatch(&self, task: ClaimedTask) -> Result<(), WorkerError> {
        match task.kind {
            TaskKind::Step => self.dispatch_step(task).await,
            TaskKind::Activity => self.dispatch_activity(task).await,
            TaskKind::Timer => self.dispatch_timer(task).await,
        }
    }

    async fn dispatch_step(&self, task: ClaimedTask) -> Result<(), WorkerError> {
        match self.engine.run_step(&task.workflow_id, &task.target).await {
            Ok(outcome) => {
                debug!(?outcome, "step task finished");
                self.store.complete_task(&task.id).await?;
                Ok(())
            }
            Err(err) => {
                // Store or registry trouble: retry the task with backoff, then
                // park it Failed; the workflow stays Running for inspection.
                let retry_in = task.has_attempts_remaining().then(|| {
                    self.activity_defaults
                        .default_retry_policy()
                        .delay_after_attempt(task.attempt)
                });
                warn!(error = %err, attempt = task.attempt, retrying = retry_in.is_some(), "step task failed");
                self.store
                    .fail_task(&task.id, &err.to_string(), retry_in)
                    .await?;
                Ok(())
            }
        }
    }

    async fn dispatch_activity(&self, task: ClaimedTask) -> Result<(), WorkerError> {
        let activity_id = task.target.clone();

        let record = self.store.load_workflow(&task.workflow_id).await?;
        if record.status.is_terminal() {
            // The workflow ended while this attempt waited in the queue
            debug!("skipping activity attempt for terminal workflow");
            self.store.complete_task(&task.id).await?;
            return Ok(());
        }

        // The task row carries only the activity id; name and args live in
        // the scheduling event.
        let history = self.store.load_history(&task.workflow_id).await?;
        let scheduled = history.iter().find_map(|e| match &e.event {
            WorkflowEvent::ActivityScheduled { activity_id: a, name, args, .. }
                if *a == activity_id =>
            {
                Some((name.clone(), args.clone()))
            }
            _ => None,
        });

        let Some((name, args)) = scheduled else {
            warn!(%activity_id, "no scheduling event for activity task");
            self.store
                .fail_task(&task.id, "no ACTIVITY_SCHEDULED event for task", None)
                .await?;
            return Ok(());
        };

        let default_policy = self.activity_defaults.default_retry_policy();
        let (outcome, policy) = match self.registry.get_activity(&name) {
            Ok(definition) => {
                let timeout = definition.timeout_or(self.activity_defaults.default_timeout);
                let policy = definition.retry_policy_or(&default_policy).clone();
                let handler = definition.handler();

                debug!(activity = %name, attempt = task.attempt, "executing activity");
                let outcome = match tokio::time::timeout(timeout, handler(args)).await {
                    Ok(result) => result,
                    Err(_) => Err(ActivityError::transient(format!(
                        "activity timed out after {timeout:?}"
                    ))
                    .with_kind("TIMEOUT")),
                };
                (outcome, policy)
            }
            Err(err) => (
                Err(ActivityError::permanent(err.to_string()).with_kind("UNREGISTERED")),
                default_policy,
            ),
        };

        match outcome {
            Ok(result) => {
                self.store
                    .complete_activity(&task.id, &task.workflow_id, &activity_id, result)
                    .await?;
                Ok(())
            }
            Err(error) => {
                if error.retryable && task.has_attempts_remaining() {
                    let delay = policy.delay_after_attempt(task.attempt);
                    debug!(
                        activity = %name,
                        attempt = task.attempt,
                        delay_ms = delay.as_millis() as u64,
                        "activity attempt failed, requeueing"
                    );
                    self.store
                        .fail_task(&task.id, &error.message, Some(delay))
                        .await?;
                } else {
                    warn!(activity = %name, attempts = task.attempt, "activity failed permanently");
                    self.store
                        .fail_activity(
                            &task.id,
                            &task.workflow_id,
                            &activity_id,
                            error,
                            task.attempt,
                        )
                        .await?;
                }
                Ok(())
            }
        }
    }

    async fn dispatch_timer(&self, task: ClaimedTask) -> Result<(), WorkerError> {
        self.store
            .fire_timer(&task.id, &task.workflow_id, &task.target)
            .await?;
        Ok(())
    }
}
