//! Reliability policies
//!
//! Retry policy for activity attempts. Activity execution timeouts are
//! enforced by the worker dispatcher with [`tokio::time::timeout`].

mod retry;

pub use retry::RetryPolicy;
