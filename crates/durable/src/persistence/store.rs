//! WorkflowStore trait definition

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::activity::ActivityError;
use crate::workflow::{RecordedEvent, WorkflowEvent};

/// Default retry budget for Step and Timer tasks
///
/// These tasks fail only on store or engine errors, which are retried with
/// backoff before the task is parked as Failed for operator inspection.
pub const DEFAULT_TASK_MAX_ATTEMPTS: u32 = 5;

/// Error type for store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Workflow not found
    #[error("workflow not found: {0}")]
    WorkflowNotFound(String),

    /// Task not found
    #[error("task not found: {0}")]
    TaskNotFound(String),

    /// Workflow id already taken
    #[error("workflow already exists: {0}")]
    WorkflowExists(String),

    /// Operation rejected because the workflow is terminal
    #[error("workflow {0} is in a terminal state")]
    WorkflowTerminal(String),

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Workflow status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowStatus {
    /// Workflow is in progress (running a step or parked on an external decision)
    Running,

    /// All steps completed
    Completed,

    /// Workflow failed terminally
    Failed,

    /// Workflow was cancelled externally
    Cancelled,
}

impl WorkflowStatus {
    /// No further events may be appended once terminal
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }

    /// Parse the stored column value
    pub fn parse(s: &str) -> Result<Self, StoreError> {
        match s {
            "RUNNING" => Ok(Self::Running),
            "COMPLETED" => Ok(Self::Completed),
            "FAILED" => Ok(Self::Failed),
            "CANCELLED" => Ok(Self::Cancelled),
            other => Err(StoreError::Database(format!(
                "unknown workflow status '{other}'"
            ))),
        }
    }
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "RUNNING"),
            Self::Completed => write!(f, "COMPLETED"),
            Self::Failed => write!(f, "FAILED"),
            Self::Cancelled => write!(f, "CANCELLED"),
        }
    }
}

/// Task status in the queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    /// Parse the stored column value
    pub fn parse(s: &str) -> Result<Self, StoreError> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "RUNNING" => Ok(Self::Running),
            "COMPLETED" => Ok(Self::Completed),
            "FAILED" => Ok(Self::Failed),
            other => Err(StoreError::Database(format!("unknown task status '{other}'"))),
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "PENDING"),
            Self::Running => write!(f, "RUNNING"),
            Self::Completed => write!(f, "COMPLETED"),
            Self::Failed => write!(f, "FAILED"),
        }
    }
}

/// Kind of deferred work a task represents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskKind {
    /// Resume workflow replay; target is the step name to reach
    Step,

    /// Execute one activity attempt; target is the activity id
    Activity,

    /// Fire a timer at `run_at`; target is the timer id
    Timer,
}

impl TaskKind {
    /// Parse the stored column value
    pub fn parse(s: &str) -> Result<Self, StoreError> {
        match s {
            "STEP" => Ok(Self::Step),
            "ACTIVITY" => Ok(Self::Activity),
            "TIMER" => Ok(Self::Timer),
            other => Err(StoreError::Database(format!("unknown task kind '{other}'"))),
        }
    }
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Step => write!(f, "STEP"),
            Self::Activity => write!(f, "ACTIVITY"),
            Self::Timer => write!(f, "TIMER"),
        }
    }
}

/// Workflow row as stored
#[derive(Debug, Clone)]
pub struct WorkflowRecord {
    pub id: String,
    pub name: String,
    pub version: String,
    pub status: WorkflowStatus,
    pub input: serde_json::Value,
    pub initial_state: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A workflow to create (client start or child spawn)
#[derive(Debug, Clone)]
pub struct NewWorkflow {
    pub id: String,
    pub name: String,
    pub version: String,
    pub input: serde_json::Value,
    pub initial_state: serde_json::Value,

    /// Target of the initial Step task (the definition's first step)
    pub first_step: String,
}

impl NewWorkflow {
    /// Build with a generated UUIDv7 id
    pub fn generate(
        name: impl Into<String>,
        version: impl Into<String>,
        input: serde_json::Value,
        initial_state: serde_json::Value,
        first_step: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::now_v7().to_string(),
            name: name.into(),
            version: version.into(),
            input,
            initial_state,
            first_step: first_step.into(),
        }
    }
}

/// Task row as stored
#[derive(Debug, Clone)]
pub struct TaskRecord {
    pub id: String,
    pub workflow_id: String,
    pub kind: TaskKind,
    pub target: String,
    pub run_at: DateTime<Utc>,
    pub status: TaskStatus,
    pub attempts: u32,
    pub max_attempts: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A task to enqueue
#[derive(Debug, Clone)]
pub struct NewTask {
    pub id: String,
    pub workflow_id: String,
    pub kind: TaskKind,
    pub target: String,
    pub run_at: DateTime<Utc>,
    pub max_attempts: u32,
}

impl NewTask {
    /// A Step task resuming the workflow at the given step
    pub fn step(workflow_id: &str, step_name: &str, run_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::now_v7().to_string(),
            workflow_id: workflow_id.to_string(),
            kind: TaskKind::Step,
            target: step_name.to_string(),
            run_at,
            max_attempts: DEFAULT_TASK_MAX_ATTEMPTS,
        }
    }

    /// An Activity task for the given scheduled activity
    pub fn activity(
        workflow_id: &str,
        activity_id: &str,
        run_at: DateTime<Utc>,
        max_attempts: u32,
    ) -> Self {
        Self {
            id: Uuid::now_v7().to_string(),
            workflow_id: workflow_id.to_string(),
            kind: TaskKind::Activity,
            target: activity_id.to_string(),
            run_at,
            max_attempts,
        }
    }

    /// A Timer task that becomes claimable at `fire_at`
    pub fn timer(workflow_id: &str, timer_id: &str, fire_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::now_v7().to_string(),
            workflow_id: workflow_id.to_string(),
            kind: TaskKind::Timer,
            target: timer_id.to_string(),
            run_at: fire_at,
            max_attempts: DEFAULT_TASK_MAX_ATTEMPTS,
        }
    }
}

/// A task handed to a worker by `claim_next_task`
#[derive(Debug, Clone)]
pub struct ClaimedTask {
    pub id: String,
    pub workflow_id: String,
    pub kind: TaskKind,
    pub target: String,
    /// Attempt number after the claim (1-based)
    pub attempt: u32,
    pub max_attempts: u32,
}

impl ClaimedTask {
    /// Whether another attempt remains after this one fails
    pub fn has_attempts_remaining(&self) -> bool {
        self.attempt < self.max_attempts
    }
}

/// Workflow log severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Debug => write!(f, "debug"),
            Self::Info => write!(f, "info"),
            Self::Warn => write!(f, "warn"),
            Self::Error => write!(f, "error"),
        }
    }
}

impl LogLevel {
    /// Parse the stored column value
    pub fn parse(s: &str) -> Result<Self, StoreError> {
        match s {
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warn" => Ok(Self::Warn),
            "error" => Ok(Self::Error),
            other => Err(StoreError::Database(format!("unknown log level '{other}'"))),
        }
    }
}

/// A workflow log line to append
#[derive(Debug, Clone)]
pub struct NewLog {
    pub level: LogLevel,
    pub message: String,
}

/// A workflow log line as stored
#[derive(Debug, Clone)]
pub struct LogEntry {
    pub id: i64,
    pub workflow_id: String,
    pub level: LogLevel,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

/// The atomic bundle flushed at a step boundary or suspension
///
/// Everything in a bundle lands in one transaction, or none of it does: a
/// crash between user code and the flush simply re-runs the step, which is
/// safe because replay is deterministic.
#[derive(Debug, Clone, Default)]
pub struct StepCommit {
    /// Events to append, in order
    pub events: Vec<WorkflowEvent>,

    /// Tasks to enqueue (activities, timers)
    pub tasks: Vec<NewTask>,

    /// Child workflows to create (each gets its own start event and Step task)
    pub children: Vec<NewWorkflow>,

    /// Workflow log lines emitted during live execution
    pub logs: Vec<NewLog>,

    /// Status transition, if the workflow reached a terminal outcome
    pub status: Option<WorkflowStatus>,
}

impl StepCommit {
    /// Whether the bundle carries nothing to persist
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
            && self.tasks.is_empty()
            && self.children.is_empty()
            && self.logs.is_empty()
            && self.status.is_none()
    }
}

/// Store for workflows, events, tasks and logs
///
/// Implementations must be thread-safe and give each listed operation
/// all-or-nothing semantics. Once an append has returned success the events
/// are recoverable.
#[async_trait]
pub trait WorkflowStore: Send + Sync + 'static {
    // =========================================================================
    // Workflow Operations
    // =========================================================================

    /// Create a workflow: row (Running) + `WorkflowStarted` event + initial
    /// Step task, in one transaction
    async fn create_workflow(&self, new: NewWorkflow) -> Result<(), StoreError>;

    /// Load a workflow row
    async fn load_workflow(&self, workflow_id: &str) -> Result<WorkflowRecord, StoreError>;

    /// List workflows, optionally filtered by status, newest first
    async fn list_workflows(
        &self,
        status: Option<WorkflowStatus>,
        limit: u32,
    ) -> Result<Vec<WorkflowRecord>, StoreError>;

    /// Load the ordered event history of a workflow
    async fn load_history(&self, workflow_id: &str) -> Result<Vec<RecordedEvent>, StoreError>;

    /// Flush a step's pending effects atomically
    ///
    /// If the workflow reached a terminal status concurrently (external
    /// cancel), the bundle's events and tasks are discarded: no event may
    /// follow a terminal event.
    async fn commit_step(&self, workflow_id: &str, commit: StepCommit) -> Result<(), StoreError>;

    // =========================================================================
    // Task Queue Operations
    // =========================================================================

    /// Atomically claim one runnable task
    ///
    /// Selects a Pending task with `run_at <= now`, skipping Step tasks whose
    /// workflow already has a Running Step task (at most one runner per
    /// workflow). Marks it Running and increments its attempt counter.
    async fn claim_next_task(
        &self,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<ClaimedTask>, StoreError>;

    /// Mark a claimed task completed
    async fn complete_task(&self, task_id: &str) -> Result<(), StoreError>;

    /// Record a task failure
    ///
    /// With `retry_in` the task is requeued Pending at `now + retry_in`;
    /// without it the task is parked Failed with the error.
    async fn fail_task(
        &self,
        task_id: &str,
        error: &str,
        retry_in: Option<Duration>,
    ) -> Result<(), StoreError>;

    /// Load a task row (inspection and tests)
    async fn load_task(&self, task_id: &str) -> Result<TaskRecord, StoreError>;

    /// Requeue Running tasks that have made no progress for `older_than`
    ///
    /// Recovers tasks orphaned by crashed workers; returns the requeued ids.
    async fn reclaim_stale_tasks(&self, older_than: Duration) -> Result<Vec<String>, StoreError>;

    // =========================================================================
    // Worker Completion Bundles
    // =========================================================================

    /// Activity attempt succeeded: append `ActivityCompleted`, enqueue a Step
    /// task if none is pending, complete the task - one transaction.
    /// Events are discarded if the workflow is already terminal.
    async fn complete_activity(
        &self,
        task_id: &str,
        workflow_id: &str,
        activity_id: &str,
        result: serde_json::Value,
    ) -> Result<(), StoreError>;

    /// Activity retries exhausted: append `ActivityFailed`, enqueue a Step
    /// task so the workflow observes the failure, park the task Failed.
    async fn fail_activity(
        &self,
        task_id: &str,
        workflow_id: &str,
        activity_id: &str,
        error: ActivityError,
        attempts_used: u32,
    ) -> Result<(), StoreError>;

    /// Timer elapsed: append `TimerFired`, enqueue a Step task, complete the
    /// task - one transaction.
    async fn fire_timer(
        &self,
        task_id: &str,
        workflow_id: &str,
        timer_id: &str,
    ) -> Result<(), StoreError>;

    // =========================================================================
    // External Operations
    // =========================================================================

    /// Deliver a signal: append `SignalReceived` and enqueue a Step task if
    /// none is pending. Rejected for terminal workflows.
    async fn append_signal(
        &self,
        workflow_id: &str,
        name: &str,
        payload: serde_json::Value,
    ) -> Result<(), StoreError>;

    /// Cancel a workflow: append `WorkflowCancelled`, set status Cancelled.
    /// No-op if already terminal.
    async fn cancel_workflow(&self, workflow_id: &str, reason: &str) -> Result<(), StoreError>;

    // =========================================================================
    // Log Sink
    // =========================================================================

    /// Append one workflow log line
    async fn append_log(
        &self,
        workflow_id: &str,
        level: LogLevel,
        message: &str,
    ) -> Result<(), StoreError>;

    /// Load a workflow's log lines in append order
    async fn load_logs(&self, workflow_id: &str) -> Result<Vec<LogEntry>, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip() {
        for status in [
            WorkflowStatus::Running,
            WorkflowStatus::Completed,
            WorkflowStatus::Failed,
            WorkflowStatus::Cancelled,
        ] {
            assert_eq!(WorkflowStatus::parse(&status.to_string()).unwrap(), status);
        }
        assert!(WorkflowStatus::parse("PAUSED").is_err());
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(!WorkflowStatus::Running.is_terminal());
        assert!(WorkflowStatus::Completed.is_terminal());
        assert!(WorkflowStatus::Failed.is_terminal());
        assert!(WorkflowStatus::Cancelled.is_terminal());
    }

    #[test]
    fn test_task_kind_round_trip() {
        for kind in [TaskKind::Step, TaskKind::Activity, TaskKind::Timer] {
            assert_eq!(TaskKind::parse(&kind.to_string()).unwrap(), kind);
        }
    }

    #[test]
    fn test_new_task_constructors() {
        let now = Utc::now();
        let step = NewTask::step("wf-1", "greet", now);
        assert_eq!(step.kind, TaskKind::Step);
        assert_eq!(step.target, "greet");
        assert_eq!(step.max_attempts, DEFAULT_TASK_MAX_ATTEMPTS);

        let activity = NewTask::activity("wf-1", "greet:1", now, 4);
        assert_eq!(activity.kind, TaskKind::Activity);
        assert_eq!(activity.max_attempts, 4);

        let timer = NewTask::timer("wf-1", "timer:1", now);
        assert_eq!(timer.kind, TaskKind::Timer);
        assert_eq!(timer.run_at, now);
    }

    #[test]
    fn test_claimed_task_attempt_accounting() {
        let task = ClaimedTask {
            id: "t-1".to_string(),
            workflow_id: "wf-1".to_string(),
            kind: TaskKind::Activity,
            target: "a:1".to_string(),
            attempt: 3,
            max_attempts: 4,
        };
        assert!(task.has_attempts_remaining());

        let exhausted = ClaimedTask { attempt: 4, ..task };
        assert!(!exhausted.has_attempts_remaining());
    }

    #[test]
    fn test_empty_commit() {
        assert!(StepCommit::default().is_empty());

        let with_status = StepCommit {
            status: Some(WorkflowStatus::Completed),
            ..Default::default()
        };
        assert!(!with_status.is_empty());
    }
}
