//! Control API
//!
//! The [`Client`] is the external surface of the engine: start workflows,
//! signal and cancel them, inspect histories, and - for embedded or test use -
//! drive the task queue inline with [`Client::run_once`]. Long-lived services
//! run a [`WorkerPool`](crate::worker::WorkerPool) instead.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tracing::instrument;
use uuid::Uuid;

use crate::config::LoomConfig;
use crate::persistence::{
    LogEntry, NewWorkflow, StoreError, WorkflowRecord, WorkflowStatus, WorkflowStore,
};
use crate::registry::{Registry, RegistryError};
use crate::worker::{Dispatcher, WorkerError};
use crate::workflow::{RecordedEvent, WorkflowEvent, WorkflowFailure};

/// Interval between polls inside [`WorkflowHandle::result`]
const RESULT_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Errors surfaced by the control API
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// Store error
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Registry error (unknown definition, conflicting registration)
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    /// Worker error (embedded dispatch)
    #[error("worker error: {0}")]
    Worker(#[from] WorkerError),

    /// The awaited workflow failed
    #[error("workflow failed: {0}")]
    WorkflowFailed(WorkflowFailure),

    /// The awaited workflow was cancelled
    #[error("workflow cancelled: {reason}")]
    WorkflowCancelled { reason: String },

    /// Input rejected before anything was persisted
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl ClientError {
    /// Exit code for CLI wrappers: 0 success, 1 generic failure,
    /// 2 misconfiguration, 3 workflow failed, 4 not found
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::WorkflowFailed(_) | Self::WorkflowCancelled { .. } => 3,
            Self::Store(StoreError::WorkflowNotFound(_))
            | Self::Store(StoreError::TaskNotFound(_)) => 4,
            Self::Registry(_) | Self::InvalidInput(_) => 2,
            _ => 1,
        }
    }
}

/// Handle to one workflow instance
#[derive(Clone)]
pub struct WorkflowHandle {
    id: String,
    store: Arc<dyn WorkflowStore>,
}

impl std::fmt::Debug for WorkflowHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowHandle").field("id", &self.id).finish()
    }
}

impl WorkflowHandle {
    /// The workflow id
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Current status
    pub async fn status(&self) -> Result<WorkflowStatus, ClientError> {
        Ok(self.store.load_workflow(&self.id).await?.status)
    }

    /// Block until the workflow is terminal; returns the final state
    ///
    /// Something must be driving the queue (a running
    /// [`WorkerPool`](crate::worker::WorkerPool) or `run_once` calls) or this
    /// will poll forever.
    pub async fn result(&self) -> Result<Value, ClientError> {
        loop {
            let record = self.store.load_workflow(&self.id).await?;
            if record.status.is_terminal() {
                return self.terminal_result(record.status).await;
            }
            tokio::time::sleep(RESULT_POLL_INTERVAL).await;
        }
    }

    /// Deliver a signal to the workflow
    pub async fn signal(&self, name: &str, payload: Value) -> Result<(), ClientError> {
        self.store.append_signal(&self.id, name, payload).await?;
        Ok(())
    }

    /// Cancel the workflow
    pub async fn cancel(&self, reason: &str) -> Result<(), ClientError> {
        self.store.cancel_workflow(&self.id, reason).await?;
        Ok(())
    }

    async fn terminal_result(&self, status: WorkflowStatus) -> Result<Value, ClientError> {
        let history = self.store.load_history(&self.id).await?;
        for event in history.iter().rev() {
            match &event.event {
                WorkflowEvent::WorkflowCompleted { final_state } => {
                    return Ok(final_state.clone());
                }
                WorkflowEvent::WorkflowFailed { error } => {
                    return Err(ClientError::WorkflowFailed(error.clone()));
                }
                WorkflowEvent::WorkflowCancelled { reason } => {
                    return Err(ClientError::WorkflowCancelled {
                        reason: reason.clone(),
                    });
                }
                _ => {}
            }
        }
        Err(ClientError::Store(StoreError::Database(format!(
            "workflow {} is {status} but has no terminal event",
            self.id
        ))))
    }
}

/// Engine control surface over a store and registry
pub struct Client {
    store: Arc<dyn WorkflowStore>,
    registry: Arc<Registry>,
    dispatcher: Dispatcher,
}

impl Client {
    /// Create a client over shared components
    pub fn new(store: Arc<dyn WorkflowStore>, registry: Arc<Registry>, config: &LoomConfig) -> Self {
        let dispatcher = Dispatcher::new(
            Arc::clone(&store),
            Arc::clone(&registry),
            config.activity.clone(),
        );
        Self {
            store,
            registry,
            dispatcher,
        }
    }

    /// Start a workflow with a generated id
    pub async fn start(
        &self,
        name: &str,
        version: &str,
        input: Value,
        initial_state: Value,
    ) -> Result<WorkflowHandle, ClientError> {
        let id = Uuid::now_v7().to_string();
        self.start_with_id(&id, name, version, input, initial_state)
            .await
    }

    /// Start a workflow with a client-assigned id
    #[instrument(skip(self, input, initial_state), fields(workflow_id = %id))]
    pub async fn start_with_id(
        &self,
        id: &str,
        name: &str,
        version: &str,
        input: Value,
        initial_state: Value,
    ) -> Result<WorkflowHandle, ClientError> {
        if id.is_empty() {
            return Err(ClientError::InvalidInput("workflow id is empty".to_string()));
        }
        if !matches!(initial_state, Value::Object(_) | Value::Null) {
            return Err(ClientError::InvalidInput(
                "initial_state must be a JSON object or null".to_string(),
            ));
        }

        let definition = self.registry.get_workflow(name, version)?;
        let first_step = definition
            .steps()
            .first()
            .map(|s| s.name().to_string())
            .unwrap_or_default();

        self.store
            .create_workflow(NewWorkflow {
                id: id.to_string(),
                name: name.to_string(),
                version: version.to_string(),
                input,
                initial_state,
                first_step,
            })
            .await?;

        Ok(self.handle(id))
    }

    /// Handle to an existing (or presumed) workflow
    pub fn handle(&self, id: &str) -> WorkflowHandle {
        WorkflowHandle {
            id: id.to_string(),
            store: Arc::clone(&self.store),
        }
    }

    /// Deliver a signal
    pub async fn signal(&self, id: &str, name: &str, payload: Value) -> Result<(), ClientError> {
        self.handle(id).signal(name, payload).await
    }

    /// Cancel a workflow
    pub async fn cancel(&self, id: &str, reason: &str) -> Result<(), ClientError> {
        self.handle(id).cancel(reason).await
    }

    /// List workflows, optionally filtered by status
    pub async fn list(
        &self,
        status: Option<WorkflowStatus>,
        limit: u32,
    ) -> Result<Vec<WorkflowRecord>, ClientError> {
        Ok(self.store.list_workflows(status, limit).await?)
    }

    /// Load a workflow row together with its full history
    pub async fn inspect(
        &self,
        id: &str,
    ) -> Result<(WorkflowRecord, Vec<RecordedEvent>), ClientError> {
        let record = self.store.load_workflow(id).await?;
        let history = self.store.load_history(id).await?;
        Ok((record, history))
    }

    /// Load a workflow's log lines
    pub async fn logs(&self, id: &str) -> Result<Vec<LogEntry>, ClientError> {
        Ok(self.store.load_logs(id).await?)
    }

    /// Claim and dispatch a single task; returns false when the queue is idle
    ///
    /// For embedded and test use; production deployments run a
    /// [`WorkerPool`](crate::worker::WorkerPool).
    pub async fn run_once(&self) -> Result<bool, ClientError> {
        let Some(task) = self.store.claim_next_task("embedded", Utc::now()).await? else {
            return Ok(false);
        };
        self.dispatcher.dispatch(task).await?;
        Ok(true)
    }

    /// Dispatch tasks until the queue has nothing runnable; returns the count
    ///
    /// Tasks whose `run_at` lies in the future (timers, backed-off retries)
    /// are left for a later call.
    pub async fn run_until_idle(&self) -> Result<usize, ClientError> {
        let mut dispatched = 0;
        while self.run_once().await? {
            dispatched += 1;
        }
        Ok(dispatched)
    }
}
