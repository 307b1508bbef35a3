//! Workflow execution engine
//!
//! The engine module provides the [`ReplayEngine`], which re-executes step
//! code against recorded history and commits new decisions atomically.

mod replay;

pub use replay::{EngineConfig, EngineError, ReplayEngine, StepRunOutcome};
