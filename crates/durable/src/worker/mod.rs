//! Worker pool and task dispatch
//!
//! This module provides:
//! - [`WorkerPool`] - cooperative worker loops with graceful shutdown
//! - [`Dispatcher`] - per-task execution paths (step replay, activity
//!   attempts with retry/timeout, timer firing)
//! - [`TaskPoller`] - store polling with idle backoff
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                       WorkerPool                          │
//! │  ┌────────────┐ ┌────────────┐      ┌─────────────────┐  │
//! │  │ worker-0   │ │ worker-N   │ ...  │ stale reclaimer │  │
//! │  │ TaskPoller │ │ TaskPoller │      │   (interval)    │  │
//! │  └─────┬──────┘ └─────┬──────┘      └─────────────────┘  │
//! │        ▼              ▼                                   │
//! │  ┌──────────────────────────────────────────────────┐    │
//! │  │                   Dispatcher                      │    │
//! │  │  STEP → ReplayEngine   ACTIVITY → handler+retry   │    │
//! │  │  TIMER → fire          (one task at a time each)  │    │
//! │  └──────────────────────────────────────────────────┘    │
//! └──────────────────────────────────────────────────────────┘
//! ```

mod dispatcher;
mod poller;
mod pool;

pub use dispatcher::{Dispatcher, WorkerError};
pub use poller::TaskPoller;
pub use pool::{WorkerPool, WorkerPoolStatus};
