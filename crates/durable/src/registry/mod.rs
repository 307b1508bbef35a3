//! Workflow and activity registry
//!
//! The registry is the process-wide catalog of workflow definitions (keyed by
//! name + version, each an ordered list of steps) and activity definitions
//! (keyed by name). It is assembled once at startup via [`RegistryBuilder`]
//! and immutable afterwards; the engine and workers hold it behind an `Arc`.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use sha2::{Digest, Sha256};

use crate::activity::ActivityDefinition;
use crate::context::ExecutionContext;
use crate::workflow::StepResult;

/// A step body: deterministic, synchronous, all effects through the context
pub type StepFn = Arc<dyn Fn(&mut ExecutionContext) -> StepResult + Send + Sync>;

/// A named step within a workflow definition
#[derive(Clone)]
pub struct StepDefinition {
    name: String,
    run: StepFn,
}

impl StepDefinition {
    /// Step name (recorded in `StepCompleted` events)
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The step body
    pub fn run(&self, ctx: &mut ExecutionContext) -> StepResult {
        (self.run)(ctx)
    }
}

impl fmt::Debug for StepDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepDefinition")
            .field("name", &self.name)
            .finish()
    }
}

/// A named, versioned workflow: an ordered list of steps
///
/// # Example
///
/// ```ignore
/// let definition = WorkflowDefinition::build("order", "1")
///     .step("reserve", |ctx| {
///         let reservation = ctx.activity("reserve_stock", json!([1234]))?;
///         ctx.set_state("reservation", reservation)?;
///         Ok(())
///     })
///     .step("charge", |ctx| {
///         ctx.activity("charge_card", json!([4200]))?;
///         Ok(())
///     })
///     .finish();
/// ```
#[derive(Clone)]
pub struct WorkflowDefinition {
    name: String,
    version: String,
    steps: Vec<StepDefinition>,
}

impl WorkflowDefinition {
    /// Start building a definition
    pub fn build(name: impl Into<String>, version: impl Into<String>) -> WorkflowDefinitionBuilder {
        WorkflowDefinitionBuilder {
            name: name.into(),
            version: version.into(),
            steps: Vec::new(),
        }
    }

    /// Definition name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Definition version
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Steps in execution order
    pub fn steps(&self) -> &[StepDefinition] {
        &self.steps
    }

    /// Whether the definition contains the named step
    pub fn has_step(&self, step_name: &str) -> bool {
        self.steps.iter().any(|s| s.name == step_name)
    }

    /// Fingerprint over name, version and step order, for idempotent
    /// registration checks
    fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.name.as_bytes());
        hasher.update([0]);
        hasher.update(self.version.as_bytes());
        for step in &self.steps {
            hasher.update([0]);
            hasher.update(step.name.as_bytes());
        }
        format!("{:x}", hasher.finalize())
    }
}

impl fmt::Debug for WorkflowDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkflowDefinition")
            .field("name", &self.name)
            .field("version", &self.version)
            .field(
                "steps",
                &self.steps.iter().map(|s| s.name.as_str()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

/// Builder for [`WorkflowDefinition`]
pub struct WorkflowDefinitionBuilder {
    name: String,
    version: String,
    steps: Vec<StepDefinition>,
}

impl WorkflowDefinitionBuilder {
    /// Append a step
    pub fn step<F>(mut self, name: impl Into<String>, run: F) -> Self
    where
        F: Fn(&mut ExecutionContext) -> StepResult + Send + Sync + 'static,
    {
        self.steps.push(StepDefinition {
            name: name.into(),
            run: Arc::new(run),
        });
        self
    }

    /// Finish the definition
    pub fn finish(self) -> WorkflowDefinition {
        WorkflowDefinition {
            name: self.name,
            version: self.version,
            steps: self.steps,
        }
    }
}

/// Errors from registry operations
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// Workflow (name, version) not registered
    #[error("unknown workflow: {name} v{version}")]
    UnknownWorkflow { name: String, version: String },

    /// Activity name not registered
    #[error("unknown activity: {0}")]
    UnknownActivity(String),

    /// Re-registration with a different shape
    #[error("conflicting re-registration of {0}: fingerprint mismatch")]
    FingerprintMismatch(String),

    /// Definition rejected at registration
    #[error("invalid definition for {name}: {reason}")]
    InvalidDefinition { name: String, reason: String },
}

/// Builder for [`Registry`]
#[derive(Default)]
pub struct RegistryBuilder {
    workflows: HashMap<(String, String), Arc<WorkflowDefinition>>,
    workflow_fingerprints: HashMap<(String, String), String>,
    activities: HashMap<String, Arc<ActivityDefinition>>,
    activity_fingerprints: HashMap<String, String>,
}

impl RegistryBuilder {
    /// Create an empty builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a workflow definition
    ///
    /// Registration is idempotent: re-registering an identical definition is
    /// a no-op, while re-registering a differing one is an error.
    pub fn register_workflow(
        &mut self,
        definition: WorkflowDefinition,
    ) -> Result<&mut Self, RegistryError> {
        if definition.steps.is_empty() {
            return Err(RegistryError::InvalidDefinition {
                name: definition.name.clone(),
                reason: "definition has no steps".to_string(),
            });
        }

        let mut seen = std::collections::HashSet::new();
        for step in &definition.steps {
            if !seen.insert(step.name.as_str()) {
                return Err(RegistryError::InvalidDefinition {
                    name: definition.name.clone(),
                    reason: format!("duplicate step name '{}'", step.name),
                });
            }
        }

        let key = (definition.name.clone(), definition.version.clone());
        let fingerprint = definition.fingerprint();

        if let Some(existing) = self.workflow_fingerprints.get(&key) {
            if *existing != fingerprint {
                return Err(RegistryError::FingerprintMismatch(format!(
                    "workflow {} v{}",
                    key.0, key.1
                )));
            }
            return Ok(self);
        }

        self.workflow_fingerprints.insert(key.clone(), fingerprint);
        self.workflows.insert(key, Arc::new(definition));
        Ok(self)
    }

    /// Register an activity definition (idempotent, like workflows)
    pub fn register_activity(
        &mut self,
        definition: ActivityDefinition,
    ) -> Result<&mut Self, RegistryError> {
        let name = definition.name().to_string();
        let fingerprint = definition.fingerprint();

        if let Some(existing) = self.activity_fingerprints.get(&name) {
            if *existing != fingerprint {
                return Err(RegistryError::FingerprintMismatch(format!(
                    "activity {name}"
                )));
            }
            return Ok(self);
        }

        self.activity_fingerprints.insert(name.clone(), fingerprint);
        self.activities.insert(name, Arc::new(definition));
        Ok(self)
    }

    /// Freeze the registry
    pub fn build(self) -> Registry {
        Registry {
            workflows: self.workflows,
            activities: self.activities,
        }
    }
}

/// Immutable catalog of workflow and activity definitions
pub struct Registry {
    workflows: HashMap<(String, String), Arc<WorkflowDefinition>>,
    activities: HashMap<String, Arc<ActivityDefinition>>,
}

impl Registry {
    /// Start building a registry
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::new()
    }

    /// Look up a workflow by name and version
    pub fn get_workflow(
        &self,
        name: &str,
        version: &str,
    ) -> Result<Arc<WorkflowDefinition>, RegistryError> {
        self.workflows
            .get(&(name.to_string(), version.to_string()))
            .cloned()
            .ok_or_else(|| RegistryError::UnknownWorkflow {
                name: name.to_string(),
                version: version.to_string(),
            })
    }

    /// Look up an activity by name
    pub fn get_activity(&self, name: &str) -> Result<Arc<ActivityDefinition>, RegistryError> {
        self.activities
            .get(name)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownActivity(name.to_string()))
    }

    /// Number of registered workflow definitions
    pub fn workflow_count(&self) -> usize {
        self.workflows.len()
    }

    /// Number of registered activity definitions
    pub fn activity_count(&self) -> usize {
        self.activities.len()
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("workflows", &self.workflows.keys().collect::<Vec<_>>())
            .field("activities", &self.activities.keys().collect::<Vec<_>>())
            .finish()
    }
}
