//! Workflow execution context
//!
//! The [`ExecutionContext`] is the narrow, deterministic API handed to step
//! code. Every operation that introduces non-determinism (activity calls,
//! timers, signals, state writes, child workflows, logging) flows through it;
//! between those calls step code is ordinary sequential Rust.
//!
//! # Replay discipline
//!
//! The context holds the workflow's recorded history and a cursor over it.
//! Events fall in two classes:
//!
//! - *decision events* (`StateSet`, `StateUpdate`, `ActivityScheduled`,
//!   `TimerScheduled`, `ChildWorkflowStarted`, `StepCompleted`) were emitted
//!   by step code and are consumed strictly in order. A context call that
//!   does not match the next unconsumed decision event is non-deterministic
//!   and fails the workflow.
//! - *injected events* (`ActivityCompleted`, `ActivityFailed`, `TimerFired`,
//!   `SignalReceived`, lifecycle events) were appended by workers or external
//!   callers and are consumed by id or name when the step awaits them.
//!
//! The context is in *replay* mode while unconsumed decision events remain,
//! and *live* mode once the cursor has passed them all. History writes, task
//! enqueues and workflow logs happen only in live mode; determinism checks
//! happen only in replay mode.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::activity::ActivityError;
use crate::config::ActivityConfig;
use crate::persistence::{LogLevel, NewLog, NewTask, NewWorkflow, StepCommit};
use crate::registry::Registry;
use crate::workflow::{
    ActivityFailure, RecordedEvent, StepError, Suspension, WorkflowEvent, WorkflowState,
};

/// Collects key writes inside [`ExecutionContext::state_batch`]
pub struct StateBatch {
    entries: Vec<(String, Value)>,
}

impl StateBatch {
    /// Record one key write; applied as a single `StateUpdate` at scope exit
    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.entries.push((key.into(), value));
    }
}

/// Per-run deterministic handle injected into step code
pub struct ExecutionContext {
    workflow_id: String,
    input: Value,
    history: Vec<RecordedEvent>,
    cursor: usize,
    consumed: Vec<bool>,
    state: WorkflowState,
    pending: StepCommit,
    registry: Arc<Registry>,
    activity_defaults: ActivityConfig,
    now: DateTime<Utc>,
    activity_seq: u32,
    timer_seq: u32,
}

impl ExecutionContext {
    /// Build a context positioned at the start of history
    pub(crate) fn new(
        workflow_id: impl Into<String>,
        input: Value,
        initial_state: &Value,
        history: Vec<RecordedEvent>,
        registry: Arc<Registry>,
        activity_defaults: ActivityConfig,
    ) -> Self {
        let consumed = vec![false; history.len()];
        Self {
            workflow_id: workflow_id.into(),
            input,
            state: WorkflowState::from_initial(initial_state),
            history,
            cursor: 0,
            consumed,
            pending: StepCommit::default(),
            registry,
            activity_defaults,
            now: Utc::now(),
            activity_seq: 0,
            timer_seq: 0,
        }
    }

    // =========================================================================
    // Step-facing API
    // =========================================================================

    /// The workflow id
    pub fn workflow_id(&self) -> &str {
        &self.workflow_id
    }

    /// The immutable workflow input
    pub fn input(&self) -> &Value {
        &self.input
    }

    /// Whether the context is replaying recorded decisions
    pub fn is_replaying(&self) -> bool {
        self.next_decision().is_some()
    }

    /// Invoke an activity and wait for its result
    ///
    /// Suspends the step until a completion is recorded; surfaces a recorded
    /// failure as [`StepError::ActivityFailed`], the only error variant step
    /// code may handle.
    pub fn activity(&mut self, name: &str, args: Value) -> Result<Value, StepError> {
        self.activity_seq += 1;

        match self.next_decision() {
            Some(idx) => {
                let recorded = self.history[idx].event.clone();
                match recorded {
                    WorkflowEvent::ActivityScheduled {
                        activity_id,
                        name: recorded_name,
                        args: recorded_args,
                        ..
                    } => {
                        if recorded_name != name || recorded_args != args {
                            return Err(StepError::NonDeterministic(format!(
                                "history records activity '{recorded_name}' with args \
                                 {recorded_args}, step code invoked '{name}' with args {args}"
                            )));
                        }
                        self.consume(idx);
                        self.resolve_activity(activity_id)
                    }
                    other => Err(self.unexpected_event(&format!("activity '{name}'"), &other, idx)),
                }
            }
            None => {
                let definition = self
                    .registry
                    .get_activity(name)
                    .map_err(|e| StepError::Fatal(anyhow::Error::new(e)))?;
                let default_policy = self.activity_defaults.default_retry_policy();
                let max_attempts = definition.retry_policy_or(&default_policy).max_attempts();

                let activity_id = format!("{name}:{}", self.activity_seq);
                self.pending.events.push(WorkflowEvent::ActivityScheduled {
                    activity_id: activity_id.clone(),
                    name: name.to_string(),
                    args,
                    attempt: 0,
                });
                self.pending.tasks.push(NewTask::activity(
                    &self.workflow_id,
                    &activity_id,
                    self.now,
                    max_attempts,
                ));

                Err(StepError::Suspended(Suspension::Activity { activity_id }))
            }
        }
    }

    /// Durable sleep
    ///
    /// The absolute fire time is computed once, at the first live encounter,
    /// and recorded; replays reuse the recorded time.
    pub fn sleep(&mut self, duration: Duration) -> Result<(), StepError> {
        self.timer_seq += 1;

        match self.next_decision() {
            Some(idx) => {
                let recorded = self.history[idx].event.clone();
                match recorded {
                    WorkflowEvent::TimerScheduled { timer_id, .. } => {
                        self.consume(idx);
                        match self.find_unconsumed(|e| {
                            matches!(e, WorkflowEvent::TimerFired { timer_id: t } if *t == timer_id)
                        }) {
                            Some(fired_idx) => {
                                self.consume(fired_idx);
                                Ok(())
                            }
                            None => Err(StepError::Suspended(Suspension::Timer { timer_id })),
                        }
                    }
                    other => Err(self.unexpected_event("sleep", &other, idx)),
                }
            }
            None => {
                let delay = chrono::Duration::from_std(duration).map_err(|e| {
                    StepError::Fatal(anyhow::anyhow!("sleep duration out of range: {e}"))
                })?;
                let timer_id = format!("timer:{}", self.timer_seq);
                let fire_at = self.now + delay;

                self.pending.events.push(WorkflowEvent::TimerScheduled {
                    timer_id: timer_id.clone(),
                    fire_at,
                });
                self.pending
                    .tasks
                    .push(NewTask::timer(&self.workflow_id, &timer_id, fire_at));

                Err(StepError::Suspended(Suspension::Timer { timer_id }))
            }
        }
    }

    /// Wait for a named external signal; returns its payload
    ///
    /// Consumes the earliest unconsumed `SignalReceived` with this name, so a
    /// signal delivered before the step reached this point is picked up
    /// immediately.
    pub fn wait_for_signal(&mut self, name: &str) -> Result<Value, StepError> {
        let found = self.find_unconsumed(|e| {
            matches!(e, WorkflowEvent::SignalReceived { name: n, .. } if n == name)
        });

        match found {
            Some(idx) => {
                let payload = match &self.history[idx].event {
                    WorkflowEvent::SignalReceived { payload, .. } => payload.clone(),
                    _ => unreachable!("predicate matched SignalReceived"),
                };
                self.consume(idx);
                Ok(payload)
            }
            None => Err(StepError::Suspended(Suspension::Signal {
                name: name.to_string(),
            })),
        }
    }

    /// Write one state key
    pub fn set_state(&mut self, key: &str, value: Value) -> Result<(), StepError> {
        match self.next_decision() {
            Some(idx) => {
                let recorded = self.history[idx].event.clone();
                match recorded {
                    WorkflowEvent::StateSet {
                        key: recorded_key,
                        value: recorded_value,
                    } => {
                        if recorded_key != key || recorded_value != value {
                            return Err(StepError::NonDeterministic(format!(
                                "history records state set '{recorded_key}'={recorded_value}, \
                                 step code wrote '{key}'={value}"
                            )));
                        }
                        self.consume(idx);
                        self.state.set(key, value);
                        Ok(())
                    }
                    other => {
                        Err(self.unexpected_event(&format!("state set '{key}'"), &other, idx))
                    }
                }
            }
            None => {
                self.pending.events.push(WorkflowEvent::StateSet {
                    key: key.to_string(),
                    value: value.clone(),
                });
                self.state.set(key, value);
                Ok(())
            }
        }
    }

    /// Replace the state through a closure over the current map
    ///
    /// Emits a single `StateUpdate` carrying the complete new state.
    pub fn update_state<F>(&mut self, f: F) -> Result<(), StepError>
    where
        F: FnOnce(&mut Map<String, Value>),
    {
        let mut next = self.state.as_map().clone();
        f(&mut next);
        self.apply_state_update(Value::Object(next))
    }

    /// Collect several key writes into one `StateUpdate` event
    pub fn state_batch<F>(&mut self, f: F) -> Result<(), StepError>
    where
        F: FnOnce(&mut StateBatch),
    {
        let mut batch = StateBatch {
            entries: Vec::new(),
        };
        f(&mut batch);

        let mut next = self.state.as_map().clone();
        for (key, value) in batch.entries {
            next.insert(key, value);
        }
        self.apply_state_update(Value::Object(next))
    }

    /// Read one state key
    pub fn get_state(&self, key: &str) -> Option<Value> {
        self.state.get(key).cloned()
    }

    /// Read one state key with a fallback
    pub fn get_state_or(&self, key: &str, default: Value) -> Value {
        self.state.get(key).cloned().unwrap_or(default)
    }

    /// Snapshot the full folded state
    pub fn state_snapshot(&self) -> Value {
        self.state.snapshot()
    }

    /// Spawn a child workflow; returns its id
    ///
    /// The child id is generated at the first live encounter and recorded, so
    /// replays observe the same id. The child is created atomically with this
    /// step's commit.
    pub fn start_child_workflow(
        &mut self,
        name: &str,
        version: &str,
        input: Value,
        initial_state: Value,
    ) -> Result<String, StepError> {
        match self.next_decision() {
            Some(idx) => {
                let recorded = self.history[idx].event.clone();
                match recorded {
                    WorkflowEvent::ChildWorkflowStarted {
                        child_id,
                        name: recorded_name,
                        version: recorded_version,
                        input: recorded_input,
                    } => {
                        if recorded_name != name
                            || recorded_version != version
                            || recorded_input != input
                        {
                            return Err(StepError::NonDeterministic(format!(
                                "history records child workflow '{recorded_name}' \
                                 v{recorded_version}, step code spawned '{name}' v{version}"
                            )));
                        }
                        self.consume(idx);
                        Ok(child_id)
                    }
                    other => Err(self.unexpected_event(
                        &format!("child workflow '{name}'"),
                        &other,
                        idx,
                    )),
                }
            }
            None => {
                // Validate eagerly so a bad name fails the spawning workflow
                // instead of stranding a child no worker can run.
                let child_definition = self
                    .registry
                    .get_workflow(name, version)
                    .map_err(|e| StepError::Fatal(anyhow::Error::new(e)))?;
                let first_step = child_definition
                    .steps()
                    .first()
                    .map(|s| s.name().to_string())
                    .unwrap_or_default();

                let child_id = Uuid::now_v7().to_string();
                self.pending.events.push(WorkflowEvent::ChildWorkflowStarted {
                    child_id: child_id.clone(),
                    name: name.to_string(),
                    version: version.to_string(),
                    input: input.clone(),
                });
                self.pending.children.push(NewWorkflow {
                    id: child_id.clone(),
                    name: name.to_string(),
                    version: version.to_string(),
                    input,
                    initial_state,
                    first_step,
                });
                Ok(child_id)
            }
        }
    }

    /// Workflow-visible debug log (suppressed during replay)
    pub fn log_debug(&mut self, message: impl Into<String>) {
        self.log(LogLevel::Debug, message.into());
    }

    /// Workflow-visible info log (suppressed during replay)
    pub fn log_info(&mut self, message: impl Into<String>) {
        self.log(LogLevel::Info, message.into());
    }

    /// Workflow-visible warning log (suppressed during replay)
    pub fn log_warn(&mut self, message: impl Into<String>) {
        self.log(LogLevel::Warn, message.into());
    }

    /// Workflow-visible error log (suppressed during replay)
    pub fn log_error(&mut self, message: impl Into<String>) {
        self.log(LogLevel::Error, message.into());
    }

    // =========================================================================
    // Engine-facing API
    // =========================================================================

    /// Fast-skip a step whose `StepCompleted` is recorded
    ///
    /// Consumes every event up to and including the step's completion marker,
    /// applying state events and advancing the deterministic id counters so
    /// later live scheduling continues the sequence. Signals inside the
    /// skipped range count as consumed by that step; the rule is applied
    /// identically on every replay.
    pub(crate) fn fast_forward_completed_step(&mut self, step_name: &str) -> bool {
        let end = match self.find_unconsumed(|e| {
            matches!(e, WorkflowEvent::StepCompleted { step_name: s } if s == step_name)
        }) {
            Some(idx) => idx,
            None => return false,
        };

        for idx in 0..=end {
            if self.consumed[idx] {
                continue;
            }
            match &self.history[idx].event {
                WorkflowEvent::StateSet { key, value } => {
                    let (key, value) = (key.clone(), value.clone());
                    self.state.set(&key, value);
                }
                WorkflowEvent::StateUpdate { new_state } => {
                    let new_state = new_state.clone();
                    self.state.replace(new_state);
                }
                WorkflowEvent::ActivityScheduled { .. } => self.activity_seq += 1,
                WorkflowEvent::TimerScheduled { .. } => self.timer_seq += 1,
                _ => {}
            }
            self.consumed[idx] = true;
        }

        self.cursor = self.cursor.max(end + 1);
        self.advance_cursor();
        true
    }

    /// Record a step's normal completion
    pub(crate) fn record_step_completed(&mut self, step_name: &str) {
        self.pending.events.push(WorkflowEvent::StepCompleted {
            step_name: step_name.to_string(),
        });
    }

    /// Take the pending commit bundle, leaving an empty one behind
    pub(crate) fn take_commit(&mut self) -> StepCommit {
        std::mem::take(&mut self.pending)
    }

    /// Drop any pending effects (failure paths commit only the terminal event)
    pub(crate) fn discard_pending(&mut self) {
        self.pending = StepCommit::default();
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn resolve_activity(&mut self, activity_id: String) -> Result<Value, StepError> {
        let completed = self.find_unconsumed(|e| {
            matches!(e, WorkflowEvent::ActivityCompleted { activity_id: a, .. } if *a == activity_id)
        });
        if let Some(idx) = completed {
            let result = match &self.history[idx].event {
                WorkflowEvent::ActivityCompleted { result, .. } => result.clone(),
                _ => unreachable!("predicate matched ActivityCompleted"),
            };
            self.consume(idx);
            return Ok(result);
        }

        let failed = self.find_unconsumed(|e| {
            matches!(e, WorkflowEvent::ActivityFailed { activity_id: a, .. } if *a == activity_id)
        });
        if let Some(idx) = failed {
            let (error, attempts_used) = match &self.history[idx].event {
                WorkflowEvent::ActivityFailed {
                    error,
                    attempts_used,
                    ..
                } => (error.clone(), *attempts_used),
                _ => unreachable!("predicate matched ActivityFailed"),
            };
            self.consume(idx);
            return Err(StepError::ActivityFailed(ActivityFailure {
                activity_id,
                error,
                attempts_used,
            }));
        }

        Err(StepError::Suspended(Suspension::Activity { activity_id }))
    }

    fn apply_state_update(&mut self, new_state: Value) -> Result<(), StepError> {
        match self.next_decision() {
            Some(idx) => {
                let recorded = self.history[idx].event.clone();
                match recorded {
                    WorkflowEvent::StateUpdate {
                        new_state: recorded_state,
                    } => {
                        if recorded_state != new_state {
                            return Err(StepError::NonDeterministic(format!(
                                "history records state update {recorded_state}, step code \
                                 produced {new_state}"
                            )));
                        }
                        self.consume(idx);
                        self.state.replace(new_state);
                        Ok(())
                    }
                    other => Err(self.unexpected_event("state update", &other, idx)),
                }
            }
            None => {
                self.pending.events.push(WorkflowEvent::StateUpdate {
                    new_state: new_state.clone(),
                });
                self.state.replace(new_state);
                Ok(())
            }
        }
    }

    fn log(&mut self, level: LogLevel, message: String) {
        if self.is_replaying() {
            return;
        }
        tracing::debug!(workflow_id = %self.workflow_id, %level, "{message}");
        self.pending.logs.push(NewLog { level, message });
    }

    /// First unconsumed decision event at or after the cursor
    fn next_decision(&self) -> Option<usize> {
        (self.cursor..self.history.len())
            .find(|&i| !self.consumed[i] && self.history[i].event.is_decision())
    }

    /// First unconsumed event anywhere in history matching the predicate
    fn find_unconsumed<F>(&self, pred: F) -> Option<usize>
    where
        F: Fn(&WorkflowEvent) -> bool,
    {
        (0..self.history.len()).find(|&i| !self.consumed[i] && pred(&self.history[i].event))
    }

    fn consume(&mut self, idx: usize) {
        self.consumed[idx] = true;
        self.advance_cursor();
    }

    fn advance_cursor(&mut self) {
        while self.cursor < self.history.len() && self.consumed[self.cursor] {
            self.cursor += 1;
        }
    }

    fn unexpected_event(
        &self,
        performed: &str,
        recorded: &WorkflowEvent,
        idx: usize,
    ) -> StepError {
        StepError::NonDeterministic(format!(
            "history records {} at ordinal {}, step code performed {performed}",
            recorded.type_name(),
            self.history[idx].ordinal
        ))
    }
}
