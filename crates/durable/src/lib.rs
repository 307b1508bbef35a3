//! # Loom Durable Execution Engine
//!
//! A SQLite-backed workflow orchestration engine. User code expresses a
//! long-running business process as an ordered sequence of deterministic
//! steps that invoke activities, sleep on timers, and react to external
//! signals; the engine guarantees the workflow progresses exactly once to
//! completion across process crashes by persisting every observable decision
//! in an append-only event log and re-deriving in-memory state through
//! deterministic replay.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        ReplayEngine                          │
//! │  (re-runs step code against history, commits new decisions)  │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       WorkflowStore                          │
//! │     (SQLite / in-memory: workflows, events, tasks, logs)     │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        WorkerPool                            │
//! │   (claims tasks, runs steps and activity attempts, retries)  │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use loom_durable::prelude::*;
//! use serde_json::json;
//!
//! let mut builder = Registry::builder();
//! builder.register_activity(ActivityDefinition::new("greet", |args| async move {
//!     let name = args[0].as_str().unwrap_or_default().to_string();
//!     Ok(json!(format!("Hello, {name}")))
//! }))?;
//! builder.register_workflow(
//!     WorkflowDefinition::build("hello", "1")
//!         .step("greet", |ctx| {
//!             let name = ctx.input()["name"].clone();
//!             let greeting = ctx.activity("greet", json!([name]))?;
//!             ctx.set_state("greeting", greeting)?;
//!             Ok(())
//!         })
//!         .finish(),
//! )?;
//! let registry = Arc::new(builder.build());
//!
//! let config = LoomConfig::default().with_sqlite_path("loom.db");
//! let store = loom_durable::persistence::open_store(&config.store).await?;
//!
//! let pool = WorkerPool::new(store.clone(), registry.clone(), config.worker.clone(), config.activity.clone());
//! pool.start()?;
//!
//! let client = Client::new(store, registry, &config);
//! let handle = client.start("hello", "1", json!({"name": "World"}), json!({"greeting": null})).await?;
//! let final_state = handle.result().await?;
//! ```
//!
//! ## Error handling in step code
//!
//! Step bodies return [`StepError`]; the `Suspended` variant is the engine's
//! structured interrupt and must always be propagated (`?`). The only variant
//! a step may handle is `ActivityFailed` - match it specifically and
//! re-return everything else.

pub mod activity;
pub mod client;
pub mod config;
pub mod context;
pub mod engine;
pub mod persistence;
pub mod registry;
pub mod reliability;
pub mod worker;
pub mod workflow;

/// Prelude for common imports
pub mod prelude {
    pub use crate::activity::{ActivityDefinition, ActivityError};
    pub use crate::client::{Client, ClientError, WorkflowHandle};
    pub use crate::config::{LoomConfig, StoreBackend};
    pub use crate::context::ExecutionContext;
    pub use crate::engine::{EngineConfig, EngineError, ReplayEngine, StepRunOutcome};
    pub use crate::persistence::{
        InMemoryStore, SqliteStore, StoreError, WorkflowStatus, WorkflowStore,
    };
    pub use crate::registry::{Registry, RegistryError, WorkflowDefinition};
    pub use crate::reliability::RetryPolicy;
    pub use crate::worker::{WorkerPool, WorkerPoolStatus};
    pub use crate::workflow::{
        ActivityFailure, RecordedEvent, StepError, StepResult, Suspension, WorkflowEvent,
        WorkflowFailure,
    };
}

// Re-export key types at crate root
pub use activity::{ActivityDefinition, ActivityError};
pub use client::{Client, ClientError, WorkflowHandle};
pub use config::{LoomConfig, StoreBackend};
pub use context::ExecutionContext;
pub use engine::{EngineConfig, EngineError, ReplayEngine, StepRunOutcome};
pub use persistence::{
    InMemoryStore, SqliteStore, StoreError, TaskKind, TaskStatus, WorkflowStatus, WorkflowStore,
};
pub use registry::{Registry, RegistryError, StepFn, WorkflowDefinition};
pub use reliability::RetryPolicy;
pub use worker::{Dispatcher, WorkerError, WorkerPool, WorkerPoolStatus};
pub use workflow::{
    ActivityFailure, FailureKind, RecordedEvent, StepError, StepResult, Suspension, WorkflowEvent,
    WorkflowFailure, WorkflowState,
};
