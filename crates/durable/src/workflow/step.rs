//! Step control flow
//!
//! A step body communicates with the engine exclusively through its returned
//! [`StepError`]. The `Suspended` variant is a structured interrupt, not a
//! failure: it tells the engine to commit pending effects and park the
//! workflow until an external event (activity completion, timer firing,
//! signal) resumes it.
//!
//! # Error handling contract for step code
//!
//! `ActivityFailed` is the only variant step code may handle; every other
//! variant MUST be propagated untouched (use `?`, or match `ActivityFailed`
//! specifically and re-return the rest). Swallowing `Suspended` would make
//! the engine believe the step ran to completion and corrupt the history.

use serde::{Deserialize, Serialize};

use crate::activity::ActivityError;

/// Why a step is parked
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Suspension {
    /// Waiting for an activity to complete or exhaust its retries
    Activity { activity_id: String },

    /// Waiting for a timer to fire
    Timer { timer_id: String },

    /// Waiting for an external signal
    Signal { name: String },
}

impl std::fmt::Display for Suspension {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Activity { activity_id } => write!(f, "pending activity {activity_id}"),
            Self::Timer { timer_id } => write!(f, "pending timer {timer_id}"),
            Self::Signal { name } => write!(f, "pending signal {name}"),
        }
    }
}

/// A recorded activity failure surfaced to the awaiting step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityFailure {
    /// The failed activity
    pub activity_id: String,

    /// Error from the final attempt
    pub error: ActivityError,

    /// Attempts made before giving up
    pub attempts_used: u32,
}

impl std::fmt::Display for ActivityFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "activity {} failed after {} attempts: {}",
            self.activity_id, self.attempts_used, self.error
        )
    }
}

impl std::error::Error for ActivityFailure {}

/// Result of running a step body
pub type StepResult = Result<(), StepError>;

/// Errors (and the structured interrupt) flowing out of step code
#[derive(Debug, thiserror::Error)]
pub enum StepError {
    /// The step is blocked on an external decision; the engine commits
    /// pending effects and pauses. Never handle this variant.
    #[error("step suspended: {0}")]
    Suspended(Suspension),

    /// An awaited activity exhausted its retries. The only variant step code
    /// may catch.
    #[error("{0}")]
    ActivityFailed(ActivityFailure),

    /// Step code diverged from the recorded history
    #[error("non-deterministic workflow: {0}")]
    NonDeterministic(String),

    /// Any other error raised by step code; terminal for the workflow
    #[error("workflow code error: {0}")]
    Fatal(#[from] anyhow::Error),
}

impl StepError {
    /// Build the terminal failure to record for this error, if it is one
    ///
    /// `Suspended` is not a failure and returns `None`.
    pub fn as_workflow_failure(&self) -> Option<WorkflowFailure> {
        match self {
            Self::Suspended(_) => None,
            Self::ActivityFailed(failure) => Some(WorkflowFailure {
                message: failure.to_string(),
                kind: FailureKind::ActivityFailure,
            }),
            Self::NonDeterministic(message) => Some(WorkflowFailure {
                message: message.clone(),
                kind: FailureKind::NonDeterminism,
            }),
            Self::Fatal(error) => Some(WorkflowFailure {
                message: format!("{error:#}"),
                kind: FailureKind::CodeError,
            }),
        }
    }
}

/// Classification of a terminal workflow failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// An uncaught activity failure reached the engine
    ActivityFailure,

    /// Replay detected divergence between code and history
    NonDeterminism,

    /// Step code raised an error of its own
    CodeError,
}

/// Terminal failure recorded in a `WorkflowFailed` event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowFailure {
    /// Human-readable failure message
    pub message: String,

    /// Failure classification
    pub kind: FailureKind,
}

impl std::fmt::Display for WorkflowFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for WorkflowFailure {}
