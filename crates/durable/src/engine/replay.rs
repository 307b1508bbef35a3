//! Replay-driven workflow execution
//!
//! The `ReplayEngine` drives one workflow forward: it loads the recorded
//! history, re-executes step code from the first step (fast-skipping steps
//! whose completion is recorded), and commits each step's effects atomically
//! at step boundaries and suspension points. Crashing between user code and a
//! commit is safe: nothing was persisted, and the deterministic re-run emits
//! the same effects.

use std::sync::Arc;

use tracing::{debug, error, instrument, warn};

use crate::config::ActivityConfig;
use crate::context::ExecutionContext;
use crate::persistence::{StepCommit, StoreError, WorkflowStatus, WorkflowStore};
use crate::registry::{Registry, RegistryError};
use crate::workflow::{FailureKind, StepError, Suspension, WorkflowEvent, WorkflowFailure};

/// Configuration for the replay engine
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Maximum events per workflow (runaway-history guard)
    pub max_events_per_workflow: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_events_per_workflow: 10_000,
        }
    }
}

/// Errors from engine operations
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Store error
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Registry error
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    /// Runaway history
    #[error("workflow {workflow_id} has too many events ({count} > {max})")]
    TooManyEvents {
        workflow_id: String,
        count: usize,
        max: usize,
    },

    /// History violates structural invariants
    #[error("corrupt history for workflow {workflow_id}: {reason}")]
    CorruptHistory { workflow_id: String, reason: String },
}

/// Result of one `run_step` invocation
#[derive(Debug, Clone)]
pub enum StepRunOutcome {
    /// Every step completed; the workflow is done
    Completed,

    /// The workflow failed terminally
    Failed(WorkflowFailure),

    /// The workflow is parked awaiting an external decision
    Blocked(Suspension),

    /// The workflow was already terminal when the task ran
    AlreadyTerminal(WorkflowStatus),
}

/// Drives workflow replay against a store and registry
pub struct ReplayEngine {
    store: Arc<dyn WorkflowStore>,
    registry: Arc<Registry>,
    activity_defaults: ActivityConfig,
    config: EngineConfig,
}

impl ReplayEngine {
    /// Create an engine with default configuration
    pub fn new(
        store: Arc<dyn WorkflowStore>,
        registry: Arc<Registry>,
        activity_defaults: ActivityConfig,
    ) -> Self {
        Self {
            store,
            registry,
            activity_defaults,
            config: EngineConfig::default(),
        }
    }

    /// Create an engine with custom configuration
    pub fn with_config(
        store: Arc<dyn WorkflowStore>,
        registry: Arc<Registry>,
        activity_defaults: ActivityConfig,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            registry,
            activity_defaults,
            config,
        }
    }

    /// Re-derive state and advance the workflow as far as it will go
    ///
    /// Executes the target step and any earlier step whose completion is
    /// missing from history; later steps run too if nothing blocks. Returns
    /// once the workflow completes, fails, or parks on an external decision.
    #[instrument(skip(self), fields(workflow_id = %workflow_id, step = %target_step))]
    pub async fn run_step(
        &self,
        workflow_id: &str,
        target_step: &str,
    ) -> Result<StepRunOutcome, EngineError> {
        let record = self.store.load_workflow(workflow_id).await?;
        if record.status.is_terminal() {
            debug!(status = %record.status, "workflow already terminal");
            return Ok(StepRunOutcome::AlreadyTerminal(record.status));
        }

        let history = self.store.load_history(workflow_id).await?;
        if history.len() > self.config.max_events_per_workflow {
            return Err(EngineError::TooManyEvents {
                workflow_id: workflow_id.to_string(),
                count: history.len(),
                max: self.config.max_events_per_workflow,
            });
        }
        match history.first() {
            Some(first) if matches!(first.event, WorkflowEvent::WorkflowStarted { .. }) => {}
            Some(_) => {
                return Err(EngineError::CorruptHistory {
                    workflow_id: workflow_id.to_string(),
                    reason: "first event is not WORKFLOW_STARTED".to_string(),
                })
            }
            None => {
                return Err(EngineError::CorruptHistory {
                    workflow_id: workflow_id.to_string(),
                    reason: "history is empty".to_string(),
                })
            }
        }
        // An external cancel may land between the row load and the history
        // load; the terminal event wins and this run exits without effects.
        if let Some(terminal) = history.iter().find(|e| e.event.is_terminal()) {
            let status = match &terminal.event {
                WorkflowEvent::WorkflowCompleted { .. } => WorkflowStatus::Completed,
                WorkflowEvent::WorkflowFailed { .. } => WorkflowStatus::Failed,
                _ => WorkflowStatus::Cancelled,
            };
            debug!(event = terminal.event.type_name(), "terminal event in history");
            return Ok(StepRunOutcome::AlreadyTerminal(status));
        }

        let definition = self.registry.get_workflow(&record.name, &record.version)?;
        if !definition.has_step(target_step) {
            warn!("task targets a step missing from the registered definition");
        }

        let mut ctx = ExecutionContext::new(
            workflow_id,
            record.input.clone(),
            &record.initial_state,
            history,
            Arc::clone(&self.registry),
            self.activity_defaults.clone(),
        );

        for step in definition.steps() {
            if ctx.fast_forward_completed_step(step.name()) {
                continue;
            }

            debug!(step = step.name(), replaying = ctx.is_replaying(), "entering step");

            match step.run(&mut ctx) {
                Ok(()) => {
                    if ctx.is_replaying() {
                        // Recorded decisions remain that the step never made:
                        // the code no longer matches its own history.
                        let failure = WorkflowFailure {
                            message: format!(
                                "step '{}' returned before consuming its recorded history",
                                step.name()
                            ),
                            kind: FailureKind::NonDeterminism,
                        };
                        return self.fail_workflow(workflow_id, &mut ctx, failure).await;
                    }

                    ctx.record_step_completed(step.name());
                    let commit = ctx.take_commit();
                    self.store.commit_step(workflow_id, commit).await?;
                    debug!(step = step.name(), "step completed");
                }

                Err(StepError::Suspended(suspension)) => {
                    let commit = ctx.take_commit();
                    if !commit.is_empty() {
                        self.store.commit_step(workflow_id, commit).await?;
                    }
                    debug!(%suspension, "workflow parked");
                    return Ok(StepRunOutcome::Blocked(suspension));
                }

                Err(err) => {
                    let failure = err.as_workflow_failure().unwrap_or_else(|| WorkflowFailure {
                        message: err.to_string(),
                        kind: FailureKind::CodeError,
                    });
                    return self.fail_workflow(workflow_id, &mut ctx, failure).await;
                }
            }
        }

        let commit = StepCommit {
            events: vec![WorkflowEvent::WorkflowCompleted {
                final_state: ctx.state_snapshot(),
            }],
            status: Some(WorkflowStatus::Completed),
            ..Default::default()
        };
        self.store.commit_step(workflow_id, commit).await?;
        debug!("workflow completed");

        Ok(StepRunOutcome::Completed)
    }

    /// Record a terminal failure, discarding the failed step's partial effects
    async fn fail_workflow(
        &self,
        workflow_id: &str,
        ctx: &mut ExecutionContext,
        failure: WorkflowFailure,
    ) -> Result<StepRunOutcome, EngineError> {
        ctx.discard_pending();
        let commit = StepCommit {
            events: vec![WorkflowEvent::WorkflowFailed {
                error: failure.clone(),
            }],
            status: Some(WorkflowStatus::Failed),
            ..Default::default()
        };
        self.store.commit_step(workflow_id, commit).await?;
        error!(kind = ?failure.kind, "workflow failed: {}", failure.message);

        Ok(StepRunOutcome::Failed(failure))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::ActivityDefinition;
    use crate::persistence::{InMemoryStore, NewWorkflow, TaskKind};
    use crate::registry::WorkflowDefinition;
    use crate::workflow::FailureKind;
    use serde_json::json;

    fn hello_registry() -> Arc<Registry> {
        let mut builder = Registry::builder();
        builder
            .register_activity(ActivityDefinition::new("greet", |args| async move {
                let name = args[0].as_str().unwrap_or_default().to_string();
                Ok(json!(format!("Hello, {name}")))
            }))
            .unwrap();
        builder
            .register_workflow(
                WorkflowDefinition::build("hello", "1")
                    .step("greet", |ctx| {
                        let name = ctx.input()["name"].clone();
                        let greeting = ctx.activity("greet", json!([name]))?;
                        ctx.set_state("greeting", greeting)?;
                        Ok(())
                    })
                    .finish(),
            )
            .unwrap();
        Arc::new(builder.build())
    }

    async fn seeded(store: &InMemoryStore, id: &str) {
        store
            .create_workflow(NewWorkflow {
                id: id.to_string(),
                name: "hello".to_string(),
                version: "1".to_string(),
                input: json!({"name": "World"}),
                initial_state: json!({"greeting": null}),
                first_step: "greet".to_string(),
            })
            .await
            .unwrap();
    }

    fn engine(store: Arc<InMemoryStore>, registry: Arc<Registry>) -> ReplayEngine {
        ReplayEngine::new(store, registry, ActivityConfig::default())
    }

    #[tokio::test]
    async fn test_first_run_blocks_on_activity() {
        let store = Arc::new(InMemoryStore::new());
        seeded(&store, "wf-1").await;
        let engine = engine(Arc::clone(&store), hello_registry());

        let outcome = engine.run_step("wf-1", "greet").await.unwrap();
        assert!(matches!(outcome, StepRunOutcome::Blocked(Suspension::Activity { .. })));

        let history = store.load_history("wf-1").await.unwrap();
        let types: Vec<_> = history.iter().map(|e| e.event.type_name()).collect();
        assert_eq!(types, vec!["WORKFLOW_STARTED", "ACTIVITY_SCHEDULED"]);
    }

    #[tokio::test]
    async fn test_completion_resumes_and_finishes() {
        let store = Arc::new(InMemoryStore::new());
        seeded(&store, "wf-1").await;
        let engine = engine(Arc::clone(&store), hello_registry());

        engine.run_step("wf-1", "greet").await.unwrap();

        // The activity worker completes the scheduled activity
        let now = chrono::Utc::now();
        let step_task = store.claim_next_task("w-1", now).await.unwrap().unwrap();
        assert_eq!(step_task.kind, TaskKind::Step);
        store.complete_task(&step_task.id).await.unwrap();

        let activity_task = store.claim_next_task("w-1", now).await.unwrap().unwrap();
        assert_eq!(activity_task.kind, TaskKind::Activity);
        store
            .complete_activity(
                &activity_task.id,
                "wf-1",
                &activity_task.target,
                json!("Hello, World"),
            )
            .await
            .unwrap();

        let outcome = engine.run_step("wf-1", "greet").await.unwrap();
        assert!(matches!(outcome, StepRunOutcome::Completed));

        let record = store.load_workflow("wf-1").await.unwrap();
        assert_eq!(record.status, WorkflowStatus::Completed);

        let history = store.load_history("wf-1").await.unwrap();
        let types: Vec<_> = history.iter().map(|e| e.event.type_name()).collect();
        assert_eq!(
            types,
            vec![
                "WORKFLOW_STARTED",
                "ACTIVITY_SCHEDULED",
                "ACTIVITY_COMPLETED",
                "STATE_SET",
                "STEP_COMPLETED",
                "WORKFLOW_COMPLETED",
            ]
        );

        match &history.last().unwrap().event {
            WorkflowEvent::WorkflowCompleted { final_state } => {
                assert_eq!(final_state["greeting"], json!("Hello, World"));
            }
            other => panic!("expected WorkflowCompleted, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_rerun_after_completion_is_terminal() {
        let store = Arc::new(InMemoryStore::new());
        seeded(&store, "wf-1").await;
        let engine = engine(Arc::clone(&store), hello_registry());

        engine.run_step("wf-1", "greet").await.unwrap();
        let now = chrono::Utc::now();
        let step_task = store.claim_next_task("w-1", now).await.unwrap().unwrap();
        store.complete_task(&step_task.id).await.unwrap();
        let activity_task = store.claim_next_task("w-1", now).await.unwrap().unwrap();
        store
            .complete_activity(&activity_task.id, "wf-1", &activity_task.target, json!("x"))
            .await
            .unwrap();
        engine.run_step("wf-1", "greet").await.unwrap();

        let before = store.load_history("wf-1").await.unwrap().len();
        let outcome = engine.run_step("wf-1", "greet").await.unwrap();
        assert!(matches!(
            outcome,
            StepRunOutcome::AlreadyTerminal(WorkflowStatus::Completed)
        ));
        let after = store.load_history("wf-1").await.unwrap().len();
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn test_uncaught_activity_failure_fails_workflow() {
        let store = Arc::new(InMemoryStore::new());
        seeded(&store, "wf-1").await;
        let engine = engine(Arc::clone(&store), hello_registry());

        engine.run_step("wf-1", "greet").await.unwrap();
        let now = chrono::Utc::now();
        let step_task = store.claim_next_task("w-1", now).await.unwrap().unwrap();
        store.complete_task(&step_task.id).await.unwrap();
        let activity_task = store.claim_next_task("w-1", now).await.unwrap().unwrap();
        store
            .fail_activity(
                &activity_task.id,
                "wf-1",
                &activity_task.target,
                crate::activity::ActivityError::transient("smtp down"),
                4,
            )
            .await
            .unwrap();

        let outcome = engine.run_step("wf-1", "greet").await.unwrap();
        match outcome {
            StepRunOutcome::Failed(failure) => {
                assert_eq!(failure.kind, FailureKind::ActivityFailure);
            }
            other => panic!("expected Failed, got {other:?}"),
        }

        let record = store.load_workflow("wf-1").await.unwrap();
        assert_eq!(record.status, WorkflowStatus::Failed);
    }

    #[tokio::test]
    async fn test_changed_code_is_non_deterministic() {
        let store = Arc::new(InMemoryStore::new());
        seeded(&store, "wf-1").await;

        // First deploy schedules greet with the input name
        let engine_v1 = engine(Arc::clone(&store), hello_registry());
        engine_v1.run_step("wf-1", "greet").await.unwrap();

        // "Redeployed" code passes different args for the same step
        let mut builder = Registry::builder();
        builder
            .register_activity(ActivityDefinition::new("greet", |_| async {
                Ok(json!("unused"))
            }))
            .unwrap();
        builder
            .register_workflow(
                WorkflowDefinition::build("hello", "1")
                    .step("greet", |ctx| {
                        let greeting = ctx.activity("greet", json!(["Mars"]))?;
                        ctx.set_state("greeting", greeting)?;
                        Ok(())
                    })
                    .finish(),
            )
            .unwrap();
        let engine_v2 = engine(Arc::clone(&store), Arc::new(builder.build()));

        let outcome = engine_v2.run_step("wf-1", "greet").await.unwrap();
        match outcome {
            StepRunOutcome::Failed(failure) => {
                assert_eq!(failure.kind, FailureKind::NonDeterminism);
            }
            other => panic!("expected Failed, got {other:?}"),
        }

        // Terminal: nothing further may be appended
        let record = store.load_workflow("wf-1").await.unwrap();
        assert_eq!(record.status, WorkflowStatus::Failed);
        let history = store.load_history("wf-1").await.unwrap();
        assert!(matches!(
            history.last().unwrap().event,
            WorkflowEvent::WorkflowFailed { .. }
        ));
    }

    #[tokio::test]
    async fn test_fatal_step_error_fails_workflow() {
        let store = Arc::new(InMemoryStore::new());
        store
            .create_workflow(NewWorkflow {
                id: "wf-err".to_string(),
                name: "broken".to_string(),
                version: "1".to_string(),
                input: json!({}),
                initial_state: json!({}),
                first_step: "explode".to_string(),
            })
            .await
            .unwrap();

        let mut builder = Registry::builder();
        builder
            .register_workflow(
                WorkflowDefinition::build("broken", "1")
                    .step("explode", |_ctx| {
                        Err(anyhow::anyhow!("division by zero"))?;
                        Ok(())
                    })
                    .finish(),
            )
            .unwrap();
        let engine = engine(Arc::clone(&store), Arc::new(builder.build()));

        let outcome = engine.run_step("wf-err", "explode").await.unwrap();
        match outcome {
            StepRunOutcome::Failed(failure) => {
                assert_eq!(failure.kind, FailureKind::CodeError);
                assert!(failure.message.contains("division by zero"));
            }
            other => panic!("expected Failed, got {other:?}"),
        }
    }
}
