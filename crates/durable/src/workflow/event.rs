//! Workflow events for persistence

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::step::WorkflowFailure;
use crate::activity::ActivityError;

/// Events stored in the events table
///
/// These events form the append-only log for a workflow. They are used for:
/// - Persisting workflow progress
/// - Replaying workflows after recovery
/// - Auditing and debugging
///
/// Events are immutable once written. The workflow is resumed by re-executing
/// its step code against the recorded history in ordinal order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowEvent {
    // =========================================================================
    // Workflow Lifecycle Events
    // =========================================================================
    /// Workflow was created with the given input
    WorkflowStarted {
        /// The input provided when starting the workflow
        input: serde_json::Value,
    },

    /// All steps completed; carries the final folded state
    WorkflowCompleted {
        /// Snapshot of the folded state at completion
        final_state: serde_json::Value,
    },

    /// Workflow failed with a terminal error
    WorkflowFailed {
        /// Failure details
        error: WorkflowFailure,
    },

    /// Workflow was cancelled externally
    WorkflowCancelled {
        /// Reason for cancellation
        reason: String,
    },

    // =========================================================================
    // State Events
    // =========================================================================
    /// A single key was written via the context
    StateSet {
        /// State key
        key: String,

        /// New value for the key
        value: serde_json::Value,
    },

    /// The full state object was replaced
    StateUpdate {
        /// Complete replacement snapshot
        new_state: serde_json::Value,
    },

    // =========================================================================
    // Activity Events
    // =========================================================================
    /// A step reached an unrecorded activity call
    ActivityScheduled {
        /// Unique activity identifier within the workflow
        activity_id: String,

        /// Registered activity name
        name: String,

        /// Arguments passed by the step
        args: serde_json::Value,

        /// Attempt counter at scheduling time (always 0)
        attempt: u32,
    },

    /// Activity finished successfully
    ActivityCompleted {
        /// Activity identifier
        activity_id: String,

        /// Result returned by the activity
        result: serde_json::Value,
    },

    /// Activity failed after its final retry
    ActivityFailed {
        /// Activity identifier
        activity_id: String,

        /// Error from the last attempt
        error: ActivityError,

        /// Total attempts made
        attempts_used: u32,
    },

    // =========================================================================
    // Timer Events
    // =========================================================================
    /// A step reached an unrecorded sleep
    TimerScheduled {
        /// Timer identifier
        timer_id: String,

        /// Absolute wall-clock time at which the timer fires
        fire_at: DateTime<Utc>,
    },

    /// Timer duration elapsed
    TimerFired {
        /// Timer identifier
        timer_id: String,
    },

    // =========================================================================
    // Signal and Step Events
    // =========================================================================
    /// External signal was delivered
    SignalReceived {
        /// Signal name
        name: String,

        /// Signal payload
        payload: serde_json::Value,
    },

    /// A step returned normally
    StepCompleted {
        /// Name of the completed step
        step_name: String,
    },

    // =========================================================================
    // Child Workflow Events
    // =========================================================================
    /// A step spawned a child workflow
    ChildWorkflowStarted {
        /// Id of the spawned child (recorded for determinism)
        child_id: String,

        /// Child workflow definition name
        name: String,

        /// Child workflow definition version
        version: String,

        /// Input the child was started with
        input: serde_json::Value,
    },
}

impl WorkflowEvent {
    /// Get the activity_id if this is an activity-related event
    pub fn activity_id(&self) -> Option<&str> {
        match self {
            Self::ActivityScheduled { activity_id, .. }
            | Self::ActivityCompleted { activity_id, .. }
            | Self::ActivityFailed { activity_id, .. } => Some(activity_id),
            _ => None,
        }
    }

    /// Check if this is a terminal workflow event
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::WorkflowCompleted { .. }
                | Self::WorkflowFailed { .. }
                | Self::WorkflowCancelled { .. }
        )
    }

    /// Check if this event is emitted by step code itself
    ///
    /// Decision events are consumed strictly in order during replay; the
    /// remaining events are injected by workers or external callers and are
    /// matched by id or name when the step awaits them.
    pub fn is_decision(&self) -> bool {
        matches!(
            self,
            Self::StateSet { .. }
                | Self::StateUpdate { .. }
                | Self::ActivityScheduled { .. }
                | Self::TimerScheduled { .. }
                | Self::StepCompleted { .. }
                | Self::ChildWorkflowStarted { .. }
        )
    }

    /// The serialized type tag, for storage and diagnostics
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::WorkflowStarted { .. } => "WORKFLOW_STARTED",
            Self::WorkflowCompleted { .. } => "WORKFLOW_COMPLETED",
            Self::WorkflowFailed { .. } => "WORKFLOW_FAILED",
            Self::WorkflowCancelled { .. } => "WORKFLOW_CANCELLED",
            Self::StateSet { .. } => "STATE_SET",
            Self::StateUpdate { .. } => "STATE_UPDATE",
            Self::ActivityScheduled { .. } => "ACTIVITY_SCHEDULED",
            Self::ActivityCompleted { .. } => "ACTIVITY_COMPLETED",
            Self::ActivityFailed { .. } => "ACTIVITY_FAILED",
            Self::TimerScheduled { .. } => "TIMER_SCHEDULED",
            Self::TimerFired { .. } => "TIMER_FIRED",
            Self::SignalReceived { .. } => "SIGNAL_RECEIVED",
            Self::StepCompleted { .. } => "STEP_COMPLETED",
            Self::ChildWorkflowStarted { .. } => "CHILD_WORKFLOW_STARTED",
        }
    }
}

/// An event as recorded in the store
///
/// The ordinal is assigned by the store and is monotonic store-wide; within a
/// single workflow it defines the total history order.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedEvent {
    /// Store-assigned monotonic ordinal
    pub ordinal: i64,

    /// Owning workflow
    pub workflow_id: String,

    /// The event itself
    pub event: WorkflowEvent,

    /// Append time
    pub recorded_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_type_tags() {
        let event = WorkflowEvent::WorkflowStarted {
            input: json!({"order_id": "123"}),
        };

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"WORKFLOW_STARTED\""));

        let parsed: WorkflowEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(event, parsed);
    }

    #[test]
    fn test_activity_event_round_trip() {
        let event = WorkflowEvent::ActivityScheduled {
            activity_id: "greet:1".to_string(),
            name: "greet".to_string(),
            args: json!(["World"]),
            attempt: 0,
        };

        let json = serde_json::to_string(&event).unwrap();
        let parsed: WorkflowEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(event, parsed);
        assert_eq!(parsed.type_name(), "ACTIVITY_SCHEDULED");
    }

    #[test]
    fn test_activity_id_extraction() {
        let event = WorkflowEvent::ActivityCompleted {
            activity_id: "greet:1".to_string(),
            result: json!("Hello, World"),
        };
        assert_eq!(event.activity_id(), Some("greet:1"));

        let start = WorkflowEvent::WorkflowStarted { input: json!({}) };
        assert_eq!(start.activity_id(), None);
    }

    #[test]
    fn test_is_terminal() {
        assert!(WorkflowEvent::WorkflowCompleted {
            final_state: json!({})
        }
        .is_terminal());
        assert!(WorkflowEvent::WorkflowCancelled {
            reason: "operator".to_string()
        }
        .is_terminal());
        assert!(!WorkflowEvent::WorkflowStarted { input: json!({}) }.is_terminal());
        assert!(!WorkflowEvent::TimerFired {
            timer_id: "timer:1".to_string()
        }
        .is_terminal());
    }

    #[test]
    fn test_decision_classification() {
        assert!(WorkflowEvent::StateSet {
            key: "k".to_string(),
            value: json!(1),
        }
        .is_decision());
        assert!(WorkflowEvent::StepCompleted {
            step_name: "greet".to_string()
        }
        .is_decision());

        // Injected by workers or external callers, not by step code
        assert!(!WorkflowEvent::SignalReceived {
            name: "approve".to_string(),
            payload: json!({}),
        }
        .is_decision());
        assert!(!WorkflowEvent::ActivityCompleted {
            activity_id: "a:1".to_string(),
            result: json!(null),
        }
        .is_decision());
        assert!(!WorkflowEvent::WorkflowStarted { input: json!({}) }.is_decision());
    }
}
