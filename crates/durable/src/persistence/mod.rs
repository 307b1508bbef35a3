//! Persistence layer for durable execution
//!
//! This module provides:
//! - [`WorkflowStore`] trait for workflow, event, task and log persistence
//! - [`SqliteStore`] embedded production backend
//! - [`InMemoryStore`] for tests and embedded experiments

mod memory;
mod migrations;
mod sqlite;
mod store;

use std::sync::Arc;

pub use memory::InMemoryStore;
pub use sqlite::SqliteStore;
pub use store::{
    ClaimedTask, LogEntry, LogLevel, NewLog, NewTask, NewWorkflow, StepCommit, StoreError,
    TaskKind, TaskRecord, TaskStatus, WorkflowRecord, WorkflowStatus, WorkflowStore,
    DEFAULT_TASK_MAX_ATTEMPTS,
};

use crate::config::{StoreBackend, StoreConfig};

/// Open the store backend selected by the configuration
pub async fn open_store(config: &StoreConfig) -> Result<Arc<dyn WorkflowStore>, StoreError> {
    match config.backend {
        StoreBackend::Memory => Ok(Arc::new(InMemoryStore::new())),
        StoreBackend::Sqlite => {
            let path = config.path.clone().ok_or_else(|| {
                StoreError::Database("store.path is required for the sqlite backend".to_string())
            })?;
            Ok(Arc::new(SqliteStore::open(path).await?))
        }
    }
}
