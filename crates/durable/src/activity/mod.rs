//! Activity definitions
//!
//! Activities are the side-effecting functions a workflow invokes through its
//! context. They run on workers, outside the deterministic step code, and are
//! retried and timed independently per their policy.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::reliability::RetryPolicy;

/// Error type for activity failures
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActivityError {
    /// Error message
    pub message: String,

    /// Error kind for programmatic handling
    pub kind: Option<String>,

    /// Whether this error is transient
    ///
    /// Permanent errors fail the activity immediately without consuming the
    /// remaining retry budget.
    pub retryable: bool,

    /// Additional error details (for debugging)
    pub details: Option<serde_json::Value>,
}

impl ActivityError {
    /// Create a transient (retryable) error
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: None,
            retryable: true,
            details: None,
        }
    }

    /// Create a permanent (non-retryable) error
    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: None,
            retryable: false,
            details: None,
        }
    }

    /// Set the error kind
    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = Some(kind.into());
        self
    }

    /// Add error details
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

impl std::fmt::Display for ActivityError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ActivityError {}

impl From<anyhow::Error> for ActivityError {
    fn from(err: anyhow::Error) -> Self {
        Self::transient(format!("{err:#}"))
    }
}

/// Boxed async activity function: JSON args in, JSON result out
pub type ActivityHandler = Arc<
    dyn Fn(serde_json::Value) -> BoxFuture<'static, Result<serde_json::Value, ActivityError>>
        + Send
        + Sync,
>;

/// A named activity plus its execution policy
///
/// Retry policy and timeout default to the engine-wide activity configuration
/// when not set here.
///
/// # Example
///
/// ```ignore
/// let greet = ActivityDefinition::new("greet", |args| async move {
///     let name = args[0].as_str().unwrap_or_default().to_string();
///     Ok(json!(format!("Hello, {name}")))
/// })
/// .with_timeout(Duration::from_secs(10));
/// ```
#[derive(Clone)]
pub struct ActivityDefinition {
    name: String,
    handler: ActivityHandler,
    retry_policy: Option<RetryPolicy>,
    timeout: Option<Duration>,
}

impl ActivityDefinition {
    /// Create a definition from an async closure
    pub fn new<F, Fut>(name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(serde_json::Value) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<serde_json::Value, ActivityError>>
            + Send
            + 'static,
    {
        let handler: ActivityHandler = Arc::new(move |args| Box::pin(handler(args)));
        Self {
            name: name.into(),
            handler,
            retry_policy: None,
            timeout: None,
        }
    }

    /// Override the engine-wide retry policy for this activity
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    /// Override the engine-wide execution timeout for this activity
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Activity name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The executable handler
    pub fn handler(&self) -> ActivityHandler {
        Arc::clone(&self.handler)
    }

    /// Effective retry policy, falling back to the given default
    pub fn retry_policy_or<'a>(&'a self, default: &'a RetryPolicy) -> &'a RetryPolicy {
        self.retry_policy.as_ref().unwrap_or(default)
    }

    /// Effective timeout, falling back to the given default
    pub fn timeout_or(&self, default: Duration) -> Duration {
        self.timeout.unwrap_or(default)
    }

    /// Fingerprint of the definition's policy surface, for idempotent
    /// registration checks
    pub(crate) fn fingerprint(&self) -> String {
        use sha2::{Digest, Sha256};

        let mut hasher = Sha256::new();
        hasher.update(self.name.as_bytes());
        if let Some(policy) = &self.retry_policy {
            hasher.update(format!("{policy:?}").as_bytes());
        }
        if let Some(timeout) = self.timeout {
            hasher.update(format!("{timeout:?}").as_bytes());
        }
        format!("{:x}", hasher.finalize())
    }
}

impl std::fmt::Debug for ActivityDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActivityDefinition")
            .field("name", &self.name)
            .field("retry_policy", &self.retry_policy)
            .field("timeout", &self.timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_transient_error() {
        let error = ActivityError::transient("timeout");
        assert!(error.retryable);
        assert_eq!(error.to_string(), "timeout");
    }

    #[test]
    fn test_permanent_error() {
        let error = ActivityError::permanent("invalid input").with_kind("INVALID_INPUT");
        assert!(!error.retryable);
        assert_eq!(error.kind, Some("INVALID_INPUT".to_string()));
    }

    #[test]
    fn test_error_serialization() {
        let error = ActivityError::transient("test error")
            .with_kind("TEST")
            .with_details(json!({"key": "value"}));

        let json = serde_json::to_string(&error).unwrap();
        let parsed: ActivityError = serde_json::from_str(&json).unwrap();
        assert_eq!(error, parsed);
    }

    #[tokio::test]
    async fn test_definition_handler() {
        let def = ActivityDefinition::new("double", |args| async move {
            let n = args.as_i64().unwrap_or(0);
            Ok(json!(n * 2))
        });

        let result = (def.handler())(json!(21)).await.unwrap();
        assert_eq!(result, json!(42));
    }

    #[test]
    fn test_policy_fallbacks() {
        let default_policy = RetryPolicy::default();
        let def = ActivityDefinition::new("noop", |_| async { Ok(json!(null)) });

        assert_eq!(
            def.retry_policy_or(&default_policy).retry_count,
            default_policy.retry_count
        );
        assert_eq!(
            def.timeout_or(Duration::from_secs(30)),
            Duration::from_secs(30)
        );

        let custom = def.with_timeout(Duration::from_secs(5));
        assert_eq!(
            custom.timeout_or(Duration::from_secs(30)),
            Duration::from_secs(5)
        );
    }

    #[test]
    fn test_fingerprint_reflects_policy() {
        let a = ActivityDefinition::new("x", |_| async { Ok(json!(null)) });
        let b = ActivityDefinition::new("x", |_| async { Ok(json!(null)) });
        assert_eq!(a.fingerprint(), b.fingerprint());

        let c = ActivityDefinition::new("x", |_| async { Ok(json!(null)) })
            .with_timeout(Duration::from_secs(1));
        assert_ne!(a.fingerprint(), c.fingerprint());
    }
}
