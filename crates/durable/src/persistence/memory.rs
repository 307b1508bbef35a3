//! In-memory implementation of WorkflowStore
//!
//! Primarily for tests and embedded experiments. A single lock guards all
//! tables so every multi-table operation gets the same all-or-nothing
//! semantics as the SQLite backend, without the durability.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::debug;

use super::store::*;
use crate::activity::ActivityError;
use crate::workflow::{RecordedEvent, WorkflowEvent};

struct TaskEntry {
    record: TaskRecord,
    claimed_by: Option<String>,
}

#[derive(Default)]
struct Inner {
    workflows: HashMap<String, WorkflowRecord>,
    events: Vec<RecordedEvent>,
    tasks: HashMap<String, TaskEntry>,
    logs: Vec<LogEntry>,
    next_ordinal: i64,
    next_log_id: i64,
}

impl Inner {
    fn append_event(&mut self, workflow_id: &str, event: WorkflowEvent) {
        self.next_ordinal += 1;
        self.events.push(RecordedEvent {
            ordinal: self.next_ordinal,
            workflow_id: workflow_id.to_string(),
            event,
            recorded_at: Utc::now(),
        });
    }

    fn enqueue(&mut self, task: NewTask) {
        let now = Utc::now();
        self.tasks.insert(
            task.id.clone(),
            TaskEntry {
                record: TaskRecord {
                    id: task.id,
                    workflow_id: task.workflow_id,
                    kind: task.kind,
                    target: task.target,
                    run_at: task.run_at,
                    status: TaskStatus::Pending,
                    attempts: 0,
                    max_attempts: task.max_attempts,
                    last_error: None,
                    created_at: now,
                    updated_at: now,
                },
                claimed_by: None,
            },
        );
    }

    fn has_pending_step_task(&self, workflow_id: &str) -> bool {
        self.tasks.values().any(|t| {
            t.record.workflow_id == workflow_id
                && t.record.kind == TaskKind::Step
                && t.record.status == TaskStatus::Pending
        })
    }

    fn has_running_task(&self, workflow_id: &str, kind: Option<TaskKind>) -> bool {
        self.tasks.values().any(|t| {
            t.record.workflow_id == workflow_id
                && t.record.status == TaskStatus::Running
                && kind.map_or(true, |k| t.record.kind == k)
        })
    }

    /// Target of the most recently created Step task, used as the resume hint
    fn latest_step_target(&self, workflow_id: &str) -> String {
        self.tasks
            .values()
            .filter(|t| t.record.workflow_id == workflow_id && t.record.kind == TaskKind::Step)
            .max_by(|a, b| {
                a.record
                    .created_at
                    .cmp(&b.record.created_at)
                    .then_with(|| a.record.id.cmp(&b.record.id))
            })
            .map(|t| t.record.target.clone())
            .unwrap_or_default()
    }

    fn activity_has_outcome(&self, workflow_id: &str, activity_id: &str) -> bool {
        self.events.iter().any(|e| {
            e.workflow_id == workflow_id
                && matches!(
                    &e.event,
                    WorkflowEvent::ActivityCompleted { activity_id: a, .. }
                    | WorkflowEvent::ActivityFailed { activity_id: a, .. } if a == activity_id
                )
        })
    }

    fn timer_already_fired(&self, workflow_id: &str, timer_id: &str) -> bool {
        self.events.iter().any(|e| {
            e.workflow_id == workflow_id
                && matches!(
                    &e.event,
                    WorkflowEvent::TimerFired { timer_id: t } if t == timer_id
                )
        })
    }

    fn enqueue_resume_step(&mut self, workflow_id: &str) {
        if self.has_pending_step_task(workflow_id) {
            return;
        }
        let target = self.latest_step_target(workflow_id);
        self.enqueue(NewTask::step(workflow_id, &target, Utc::now()));
    }

    fn create_workflow_locked(&mut self, new: NewWorkflow) -> Result<(), StoreError> {
        if self.workflows.contains_key(&new.id) {
            return Err(StoreError::WorkflowExists(new.id));
        }

        let now = Utc::now();
        self.workflows.insert(
            new.id.clone(),
            WorkflowRecord {
                id: new.id.clone(),
                name: new.name,
                version: new.version,
                status: WorkflowStatus::Running,
                input: new.input.clone(),
                initial_state: new.initial_state,
                created_at: now,
                updated_at: now,
            },
        );
        self.append_event(&new.id, WorkflowEvent::WorkflowStarted { input: new.input });
        self.enqueue(NewTask::step(&new.id, &new.first_step, now));
        Ok(())
    }
}

/// In-memory implementation of [`WorkflowStore`]
///
/// # Example
///
/// ```
/// use loom_durable::InMemoryStore;
///
/// let store = InMemoryStore::new();
/// ```
#[derive(Default)]
pub struct InMemoryStore {
    inner: RwLock<Inner>,
}

impl InMemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of workflows
    pub fn workflow_count(&self) -> usize {
        self.inner.read().workflows.len()
    }

    /// Number of Pending tasks
    pub fn pending_task_count(&self) -> usize {
        self.inner
            .read()
            .tasks
            .values()
            .filter(|t| t.record.status == TaskStatus::Pending)
            .count()
    }

    /// Total number of recorded events (across workflows)
    pub fn event_count(&self) -> usize {
        self.inner.read().events.len()
    }
}

#[async_trait]
impl WorkflowStore for InMemoryStore {
    async fn create_workflow(&self, new: NewWorkflow) -> Result<(), StoreError> {
        self.inner.write().create_workflow_locked(new)
    }

    async fn load_workflow(&self, workflow_id: &str) -> Result<WorkflowRecord, StoreError> {
        self.inner
            .read()
            .workflows
            .get(workflow_id)
            .cloned()
            .ok_or_else(|| StoreError::WorkflowNotFound(workflow_id.to_string()))
    }

    async fn list_workflows(
        &self,
        status: Option<WorkflowStatus>,
        limit: u32,
    ) -> Result<Vec<WorkflowRecord>, StoreError> {
        let inner = self.inner.read();
        let mut records: Vec<_> = inner
            .workflows
            .values()
            .filter(|w| status.map_or(true, |s| w.status == s))
            .cloned()
            .collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));
        records.truncate(limit as usize);
        Ok(records)
    }

    async fn load_history(&self, workflow_id: &str) -> Result<Vec<RecordedEvent>, StoreError> {
        let inner = self.inner.read();
        if !inner.workflows.contains_key(workflow_id) {
            return Err(StoreError::WorkflowNotFound(workflow_id.to_string()));
        }
        Ok(inner
            .events
            .iter()
            .filter(|e| e.workflow_id == workflow_id)
            .cloned()
            .collect())
    }

    async fn commit_step(&self, workflow_id: &str, commit: StepCommit) -> Result<(), StoreError> {
        let mut inner = self.inner.write();

        let status = inner
            .workflows
            .get(workflow_id)
            .map(|w| w.status)
            .ok_or_else(|| StoreError::WorkflowNotFound(workflow_id.to_string()))?;

        if status.is_terminal() {
            debug!(%workflow_id, "discarding commit for terminal workflow");
            return Ok(());
        }

        // Validate child ids up front; the bundle lands whole or not at all
        for child in &commit.children {
            if inner.workflows.contains_key(&child.id) {
                return Err(StoreError::WorkflowExists(child.id.clone()));
            }
        }

        for event in commit.events {
            inner.append_event(workflow_id, event);
        }
        for task in commit.tasks {
            inner.enqueue(task);
        }
        for child in commit.children {
            inner.create_workflow_locked(child)?;
        }
        for log in commit.logs {
            inner.next_log_id += 1;
            let entry = LogEntry {
                id: inner.next_log_id,
                workflow_id: workflow_id.to_string(),
                level: log.level,
                message: log.message,
                created_at: Utc::now(),
            };
            inner.logs.push(entry);
        }
        if let Some(new_status) = commit.status {
            if let Some(workflow) = inner.workflows.get_mut(workflow_id) {
                workflow.status = new_status;
                workflow.updated_at = Utc::now();
            }
        }

        Ok(())
    }

    async fn claim_next_task(
        &self,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<ClaimedTask>, StoreError> {
        let mut inner = self.inner.write();

        let mut candidates: Vec<(DateTime<Utc>, String)> = inner
            .tasks
            .values()
            .filter(|t| t.record.status == TaskStatus::Pending && t.record.run_at <= now)
            .map(|t| (t.record.run_at, t.record.id.clone()))
            .collect();
        candidates.sort();

        for (_, task_id) in candidates {
            let (workflow_id, kind) = {
                let entry = &inner.tasks[&task_id];
                (entry.record.workflow_id.clone(), entry.record.kind)
            };

            // A Step serializes all work on its workflow: it neither starts
            // while any task of the workflow runs, nor shares it with one.
            let blocked = match kind {
                TaskKind::Step => inner.has_running_task(&workflow_id, None),
                TaskKind::Activity | TaskKind::Timer => {
                    inner.has_running_task(&workflow_id, Some(TaskKind::Step))
                }
            };
            if blocked {
                continue;
            }

            let entry = inner
                .tasks
                .get_mut(&task_id)
                .ok_or_else(|| StoreError::TaskNotFound(task_id.clone()))?;
            entry.record.status = TaskStatus::Running;
            entry.record.attempts += 1;
            entry.record.updated_at = now;
            entry.claimed_by = Some(worker_id.to_string());

            return Ok(Some(ClaimedTask {
                id: entry.record.id.clone(),
                workflow_id: entry.record.workflow_id.clone(),
                kind: entry.record.kind,
                target: entry.record.target.clone(),
                attempt: entry.record.attempts,
                max_attempts: entry.record.max_attempts,
            }));
        }

        Ok(None)
    }

    async fn complete_task(&self, task_id: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        let entry = inner
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| StoreError::TaskNotFound(task_id.to_string()))?;
        entry.record.status = TaskStatus::Completed;
        entry.record.updated_at = Utc::now();
        entry.claimed_by = None;
        Ok(())
    }

    async fn fail_task(
        &self,
        task_id: &str,
        error: &str,
        retry_in: Option<Duration>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        let entry = inner
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| StoreError::TaskNotFound(task_id.to_string()))?;

        let now = Utc::now();
        entry.record.last_error = Some(error.to_string());
        entry.record.updated_at = now;
        entry.claimed_by = None;

        match retry_in {
            Some(delay) => {
                entry.record.status = TaskStatus::Pending;
                entry.record.run_at = now
                    + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
            }
            None => {
                entry.record.status = TaskStatus::Failed;
            }
        }
        Ok(())
    }

    async fn load_task(&self, task_id: &str) -> Result<TaskRecord, StoreError> {
        self.inner
            .read()
            .tasks
            .get(task_id)
            .map(|t| t.record.clone())
            .ok_or_else(|| StoreError::TaskNotFound(task_id.to_string()))
    }

    async fn reclaim_stale_tasks(&self, older_than: Duration) -> Result<Vec<String>, StoreError> {
        let mut inner = self.inner.write();
        let now = Utc::now();
        let cutoff =
            now - chrono::Duration::from_std(older_than).unwrap_or_else(|_| chrono::Duration::zero());

        let mut reclaimed = Vec::new();
        for entry in inner.tasks.values_mut() {
            if entry.record.status == TaskStatus::Running && entry.record.updated_at < cutoff {
                entry.record.status = TaskStatus::Pending;
                entry.record.run_at = now;
                entry.record.updated_at = now;
                entry.claimed_by = None;
                reclaimed.push(entry.record.id.clone());
            }
        }
        Ok(reclaimed)
    }

    async fn complete_activity(
        &self,
        task_id: &str,
        workflow_id: &str,
        activity_id: &str,
        result: serde_json::Value,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write();

        let status = inner
            .workflows
            .get(workflow_id)
            .map(|w| w.status)
            .ok_or_else(|| StoreError::WorkflowNotFound(workflow_id.to_string()))?;

        // Results arriving after a terminal event are dropped; a second
        // completion for the same activity id is dropped too.
        if !status.is_terminal() && !inner.activity_has_outcome(workflow_id, activity_id) {
            inner.append_event(
                workflow_id,
                WorkflowEvent::ActivityCompleted {
                    activity_id: activity_id.to_string(),
                    result,
                },
            );
            inner.enqueue_resume_step(workflow_id);
        } else {
            debug!(%workflow_id, %activity_id, "discarding activity result");
        }

        let entry = inner
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| StoreError::TaskNotFound(task_id.to_string()))?;
        entry.record.status = TaskStatus::Completed;
        entry.record.updated_at = Utc::now();
        entry.claimed_by = None;
        Ok(())
    }

    async fn fail_activity(
        &self,
        task_id: &str,
        workflow_id: &str,
        activity_id: &str,
        error: ActivityError,
        attempts_used: u32,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write();

        let status = inner
            .workflows
            .get(workflow_id)
            .map(|w| w.status)
            .ok_or_else(|| StoreError::WorkflowNotFound(workflow_id.to_string()))?;

        let message = error.message.clone();
        if !status.is_terminal() && !inner.activity_has_outcome(workflow_id, activity_id) {
            inner.append_event(
                workflow_id,
                WorkflowEvent::ActivityFailed {
                    activity_id: activity_id.to_string(),
                    error,
                    attempts_used,
                },
            );
            inner.enqueue_resume_step(workflow_id);
        }

        let entry = inner
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| StoreError::TaskNotFound(task_id.to_string()))?;
        entry.record.status = TaskStatus::Failed;
        entry.record.last_error = Some(message);
        entry.record.updated_at = Utc::now();
        entry.claimed_by = None;
        Ok(())
    }

    async fn fire_timer(
        &self,
        task_id: &str,
        workflow_id: &str,
        timer_id: &str,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write();

        let status = inner
            .workflows
            .get(workflow_id)
            .map(|w| w.status)
            .ok_or_else(|| StoreError::WorkflowNotFound(workflow_id.to_string()))?;

        if !status.is_terminal() && !inner.timer_already_fired(workflow_id, timer_id) {
            inner.append_event(
                workflow_id,
                WorkflowEvent::TimerFired {
                    timer_id: timer_id.to_string(),
                },
            );
            inner.enqueue_resume_step(workflow_id);
        }

        let entry = inner
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| StoreError::TaskNotFound(task_id.to_string()))?;
        entry.record.status = TaskStatus::Completed;
        entry.record.updated_at = Utc::now();
        entry.claimed_by = None;
        Ok(())
    }

    async fn append_signal(
        &self,
        workflow_id: &str,
        name: &str,
        payload: serde_json::Value,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write();

        let status = inner
            .workflows
            .get(workflow_id)
            .map(|w| w.status)
            .ok_or_else(|| StoreError::WorkflowNotFound(workflow_id.to_string()))?;
        if status.is_terminal() {
            return Err(StoreError::WorkflowTerminal(workflow_id.to_string()));
        }

        inner.append_event(
            workflow_id,
            WorkflowEvent::SignalReceived {
                name: name.to_string(),
                payload,
            },
        );
        inner.enqueue_resume_step(workflow_id);
        Ok(())
    }

    async fn cancel_workflow(&self, workflow_id: &str, reason: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.write();

        let status = inner
            .workflows
            .get(workflow_id)
            .map(|w| w.status)
            .ok_or_else(|| StoreError::WorkflowNotFound(workflow_id.to_string()))?;
        if status.is_terminal() {
            debug!(%workflow_id, "cancel of terminal workflow is a no-op");
            return Ok(());
        }

        inner.append_event(
            workflow_id,
            WorkflowEvent::WorkflowCancelled {
                reason: reason.to_string(),
            },
        );
        if let Some(workflow) = inner.workflows.get_mut(workflow_id) {
            workflow.status = WorkflowStatus::Cancelled;
            workflow.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn append_log(
        &self,
        workflow_id: &str,
        level: LogLevel,
        message: &str,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        if !inner.workflows.contains_key(workflow_id) {
            return Err(StoreError::WorkflowNotFound(workflow_id.to_string()));
        }
        inner.next_log_id += 1;
        let entry = LogEntry {
            id: inner.next_log_id,
            workflow_id: workflow_id.to_string(),
            level,
            message: message.to_string(),
            created_at: Utc::now(),
        };
        inner.logs.push(entry);
        Ok(())
    }

    async fn load_logs(&self, workflow_id: &str) -> Result<Vec<LogEntry>, StoreError> {
        let inner = self.inner.read();
        Ok(inner
            .logs
            .iter()
            .filter(|l| l.workflow_id == workflow_id)
            .cloned()
            .collect())
    }
}
