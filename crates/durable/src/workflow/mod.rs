//! Workflow primitives and types
//!
//! This module contains the core workflow vocabulary:
//! - [`WorkflowEvent`] enum for persisted events
//! - [`WorkflowState`] folded from state events
//! - [`StepError`] / [`Suspension`] for step control flow

mod event;
mod state;
mod step;

pub use event::{RecordedEvent, WorkflowEvent};
pub use state::WorkflowState;
pub use step::{
    ActivityFailure, FailureKind, StepError, StepResult, Suspension, WorkflowFailure,
};
