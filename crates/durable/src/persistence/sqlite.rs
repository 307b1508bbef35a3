//! SQLite implementation of WorkflowStore
//!
//! Embedded single-file persistence using sqlx with:
//! - WAL journaling and a busy timeout for concurrent workers
//! - Transactional commit bundles (events + tasks + status in one commit)
//! - Atomic task claiming via a single `UPDATE ... RETURNING` statement

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow,
    SqliteSynchronous,
};
use sqlx::Row;
use tracing::{debug, instrument};

use super::migrations::run_migrations;
use super::store::*;
use crate::activity::ActivityError;
use crate::workflow::{RecordedEvent, WorkflowEvent};

/// SQLite implementation of [`WorkflowStore`]
///
/// # Example
///
/// ```ignore
/// use loom_durable::SqliteStore;
///
/// let store = SqliteStore::open("loom.db").await?;
/// ```
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (creating if missing) a database file and apply migrations
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5))
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        run_migrations(&pool).await?;
        Ok(Self { pool })
    }

    /// Open a private in-memory database (tests)
    ///
    /// A single connection keeps every operation on the same database.
    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| StoreError::Database(e.to_string()))?
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        run_migrations(&pool).await?;
        Ok(Self { pool })
    }

    /// The underlying connection pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn db_err(e: sqlx::Error) -> StoreError {
    StoreError::Database(e.to_string())
}

fn encode_json(value: &serde_json::Value) -> String {
    value.to_string()
}

fn decode_json(text: &str) -> Result<serde_json::Value, StoreError> {
    serde_json::from_str(text).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn encode_event(event: &WorkflowEvent) -> Result<String, StoreError> {
    serde_json::to_string(event).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn row_to_workflow(row: &SqliteRow) -> Result<WorkflowRecord, StoreError> {
    let status: String = row.get("status");
    let input: String = row.get("input");
    let initial_state: String = row.get("initial_state");

    Ok(WorkflowRecord {
        id: row.get("id"),
        name: row.get("name"),
        version: row.get("version"),
        status: WorkflowStatus::parse(&status)?,
        input: decode_json(&input)?,
        initial_state: decode_json(&initial_state)?,
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn row_to_task(row: &SqliteRow) -> Result<TaskRecord, StoreError> {
    let kind: String = row.get("kind");
    let status: String = row.get("status");

    Ok(TaskRecord {
        id: row.get("id"),
        workflow_id: row.get("workflow_id"),
        kind: TaskKind::parse(&kind)?,
        target: row.get("target"),
        run_at: row.get("run_at"),
        status: TaskStatus::parse(&status)?,
        attempts: row.get::<i64, _>("attempts") as u32,
        max_attempts: row.get::<i64, _>("max_attempts") as u32,
        last_error: row.get("last_error"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

type Tx<'a> = sqlx::Transaction<'a, sqlx::Sqlite>;

/// Fetch a workflow's status inside a transaction
async fn workflow_status(tx: &mut Tx<'_>, workflow_id: &str) -> Result<WorkflowStatus, StoreError> {
    let row = sqlx::query("SELECT status FROM workflows WHERE id = ?1")
        .bind(workflow_id)
        .fetch_optional(&mut **tx)
        .await
        .map_err(db_err)?
        .ok_or_else(|| StoreError::WorkflowNotFound(workflow_id.to_string()))?;

    let status: String = row.get("status");
    WorkflowStatus::parse(&status)
}

async fn insert_event(
    tx: &mut Tx<'_>,
    workflow_id: &str,
    event: &WorkflowEvent,
) -> Result<(), StoreError> {
    sqlx::query(
        "INSERT INTO events (workflow_id, type, payload, created_at) VALUES (?1, ?2, ?3, ?4)",
    )
    .bind(workflow_id)
    .bind(event.type_name())
    .bind(encode_event(event)?)
    .bind(Utc::now())
    .execute(&mut **tx)
    .await
    .map_err(db_err)?;
    Ok(())
}

async fn insert_task(tx: &mut Tx<'_>, task: &NewTask) -> Result<(), StoreError> {
    let now = Utc::now();
    sqlx::query(
        r#"
        INSERT INTO tasks (id, workflow_id, kind, target, run_at, status, attempts,
                           max_attempts, created_at, updated_at)
        VALUES (?1, ?2, ?3, ?4, ?5, 'PENDING', 0, ?6, ?7, ?8)
        "#,
    )
    .bind(&task.id)
    .bind(&task.workflow_id)
    .bind(task.kind.to_string())
    .bind(&task.target)
    .bind(task.run_at)
    .bind(task.max_attempts as i64)
    .bind(now)
    .bind(now)
    .execute(&mut **tx)
    .await
    .map_err(db_err)?;
    Ok(())
}

/// Enqueue a Step task unless one is already Pending for the workflow
async fn enqueue_resume_step(tx: &mut Tx<'_>, workflow_id: &str) -> Result<(), StoreError> {
    let pending: Option<i64> = sqlx::query_scalar(
        "SELECT 1 FROM tasks WHERE workflow_id = ?1 AND kind = 'STEP' AND status = 'PENDING' LIMIT 1",
    )
    .bind(workflow_id)
    .fetch_optional(&mut **tx)
    .await
    .map_err(db_err)?;
    if pending.is_some() {
        return Ok(());
    }

    let target: Option<String> = sqlx::query_scalar(
        r#"
        SELECT target FROM tasks
        WHERE workflow_id = ?1 AND kind = 'STEP'
        ORDER BY created_at DESC, id DESC
        LIMIT 1
        "#,
    )
    .bind(workflow_id)
    .fetch_optional(&mut **tx)
    .await
    .map_err(db_err)?;

    insert_task(
        tx,
        &NewTask::step(workflow_id, &target.unwrap_or_default(), Utc::now()),
    )
    .await
}

/// Whether a completion or failure is already recorded for the activity
async fn activity_has_outcome(
    tx: &mut Tx<'_>,
    workflow_id: &str,
    activity_id: &str,
) -> Result<bool, StoreError> {
    let row: Option<i64> = sqlx::query_scalar(
        r#"
        SELECT 1 FROM events
        WHERE workflow_id = ?1
          AND type IN ('ACTIVITY_COMPLETED', 'ACTIVITY_FAILED')
          AND json_extract(payload, '$.activity_id') = ?2
        LIMIT 1
        "#,
    )
    .bind(workflow_id)
    .bind(activity_id)
    .fetch_optional(&mut **tx)
    .await
    .map_err(db_err)?;
    Ok(row.is_some())
}

async fn create_workflow_tx(tx: &mut Tx<'_>, new: &NewWorkflow) -> Result<(), StoreError> {
    let exists: Option<i64> = sqlx::query_scalar("SELECT 1 FROM workflows WHERE id = ?1")
        .bind(&new.id)
        .fetch_optional(&mut **tx)
        .await
        .map_err(db_err)?;
    if exists.is_some() {
        return Err(StoreError::WorkflowExists(new.id.clone()));
    }

    let now = Utc::now();
    sqlx::query(
        r#"
        INSERT INTO workflows (id, name, version, status, input, initial_state,
                               created_at, updated_at)
        VALUES (?1, ?2, ?3, 'RUNNING', ?4, ?5, ?6, ?7)
        "#,
    )
    .bind(&new.id)
    .bind(&new.name)
    .bind(&new.version)
    .bind(encode_json(&new.input))
    .bind(encode_json(&new.initial_state))
    .bind(now)
    .bind(now)
    .execute(&mut **tx)
    .await
    .map_err(db_err)?;

    insert_event(
        tx,
        &new.id,
        &WorkflowEvent::WorkflowStarted {
            input: new.input.clone(),
        },
    )
    .await?;
    insert_task(tx, &NewTask::step(&new.id, &new.first_step, now)).await?;
    Ok(())
}

#[async_trait]
impl WorkflowStore for SqliteStore {
    #[instrument(skip(self, new), fields(workflow_id = %new.id))]
    async fn create_workflow(&self, new: NewWorkflow) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        create_workflow_tx(&mut tx, &new).await?;
        tx.commit().await.map_err(db_err)?;
        debug!("created workflow");
        Ok(())
    }

    async fn load_workflow(&self, workflow_id: &str) -> Result<WorkflowRecord, StoreError> {
        let row = sqlx::query(
            "SELECT id, name, version, status, input, initial_state, created_at, updated_at \
             FROM workflows WHERE id = ?1",
        )
        .bind(workflow_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?
        .ok_or_else(|| StoreError::WorkflowNotFound(workflow_id.to_string()))?;

        row_to_workflow(&row)
    }

    async fn list_workflows(
        &self,
        status: Option<WorkflowStatus>,
        limit: u32,
    ) -> Result<Vec<WorkflowRecord>, StoreError> {
        let rows = match status {
            Some(status) => {
                sqlx::query(
                    "SELECT id, name, version, status, input, initial_state, created_at, \
                     updated_at FROM workflows WHERE status = ?1 \
                     ORDER BY created_at DESC, id DESC LIMIT ?2",
                )
                .bind(status.to_string())
                .bind(limit as i64)
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query(
                    "SELECT id, name, version, status, input, initial_state, created_at, \
                     updated_at FROM workflows ORDER BY created_at DESC, id DESC LIMIT ?1",
                )
                .bind(limit as i64)
                .fetch_all(&self.pool)
                .await
            }
        }
        .map_err(db_err)?;

        rows.iter().map(row_to_workflow).collect()
    }

    async fn load_history(&self, workflow_id: &str) -> Result<Vec<RecordedEvent>, StoreError> {
        let exists: Option<i64> = sqlx::query_scalar("SELECT 1 FROM workflows WHERE id = ?1")
            .bind(workflow_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        if exists.is_none() {
            return Err(StoreError::WorkflowNotFound(workflow_id.to_string()));
        }

        let rows = sqlx::query(
            "SELECT id, workflow_id, payload, created_at FROM events \
             WHERE workflow_id = ?1 ORDER BY id",
        )
        .bind(workflow_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        let mut events = Vec::with_capacity(rows.len());
        for row in rows {
            let payload: String = row.get("payload");
            let event: WorkflowEvent = serde_json::from_str(&payload)
                .map_err(|e| StoreError::Serialization(e.to_string()))?;
            events.push(RecordedEvent {
                ordinal: row.get("id"),
                workflow_id: row.get("workflow_id"),
                event,
                recorded_at: row.get("created_at"),
            });
        }
        Ok(events)
    }

    #[instrument(skip(self, commit), fields(workflow_id = %workflow_id))]
    async fn commit_step(&self, workflow_id: &str, commit: StepCommit) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let status = workflow_status(&mut tx, workflow_id).await?;
        if status.is_terminal() {
            debug!("discarding commit for terminal workflow");
            tx.rollback().await.map_err(db_err)?;
            return Ok(());
        }

        for event in &commit.events {
            insert_event(&mut tx, workflow_id, event).await?;
        }
        for task in &commit.tasks {
            insert_task(&mut tx, task).await?;
        }
        for child in &commit.children {
            create_workflow_tx(&mut tx, child).await?;
        }
        for log in &commit.logs {
            sqlx::query(
                "INSERT INTO logs (workflow_id, level, message, created_at) \
                 VALUES (?1, ?2, ?3, ?4)",
            )
            .bind(workflow_id)
            .bind(log.level.to_string())
            .bind(&log.message)
            .bind(Utc::now())
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }
        if let Some(new_status) = commit.status {
            sqlx::query("UPDATE workflows SET status = ?1, updated_at = ?2 WHERE id = ?3")
                .bind(new_status.to_string())
                .bind(Utc::now())
                .bind(workflow_id)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
        }

        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    async fn claim_next_task(
        &self,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<ClaimedTask>, StoreError> {
        // A Step serializes all work on its workflow: it is not handed out
        // while any task of the workflow runs, and activities/timers are not
        // handed out while a Step runs. A single UPDATE keeps the claim
        // atomic across workers sharing the file.
        let row = sqlx::query(
            r#"
            UPDATE tasks
            SET status = 'RUNNING', attempts = attempts + 1, claimed_by = ?2, updated_at = ?3
            WHERE id = (
                SELECT t.id FROM tasks t
                WHERE t.status = 'PENDING'
                  AND t.run_at <= ?1
                  AND (
                    (t.kind = 'STEP' AND NOT EXISTS (
                        SELECT 1 FROM tasks r
                        WHERE r.workflow_id = t.workflow_id AND r.status = 'RUNNING'))
                    OR
                    (t.kind <> 'STEP' AND NOT EXISTS (
                        SELECT 1 FROM tasks r
                        WHERE r.workflow_id = t.workflow_id
                          AND r.kind = 'STEP' AND r.status = 'RUNNING'))
                  )
                ORDER BY t.run_at, t.id
                LIMIT 1
            )
            RETURNING id, workflow_id, kind, target, attempts, max_attempts
            "#,
        )
        .bind(now)
        .bind(worker_id)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        let Some(row) = row else {
            return Ok(None);
        };

        let kind: String = row.get("kind");
        Ok(Some(ClaimedTask {
            id: row.get("id"),
            workflow_id: row.get("workflow_id"),
            kind: TaskKind::parse(&kind)?,
            target: row.get("target"),
            attempt: row.get::<i64, _>("attempts") as u32,
            max_attempts: row.get::<i64, _>("max_attempts") as u32,
        }))
    }

    async fn complete_task(&self, task_id: &str) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE tasks SET status = 'COMPLETED', claimed_by = NULL, updated_at = ?1 \
             WHERE id = ?2",
        )
        .bind(Utc::now())
        .bind(task_id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::TaskNotFound(task_id.to_string()));
        }
        Ok(())
    }

    async fn fail_task(
        &self,
        task_id: &str,
        error: &str,
        retry_in: Option<Duration>,
    ) -> Result<(), StoreError> {
        let now = Utc::now();
        let result = match retry_in {
            Some(delay) => {
                let run_at =
                    now + chrono::Duration::from_std(delay)
                        .unwrap_or_else(|_| chrono::Duration::zero());
                sqlx::query(
                    "UPDATE tasks SET status = 'PENDING', run_at = ?1, last_error = ?2, \
                     claimed_by = NULL, updated_at = ?3 WHERE id = ?4",
                )
                .bind(run_at)
                .bind(error)
                .bind(now)
                .bind(task_id)
                .execute(&self.pool)
                .await
            }
            None => {
                sqlx::query(
                    "UPDATE tasks SET status = 'FAILED', last_error = ?1, claimed_by = NULL, \
                     updated_at = ?2 WHERE id = ?3",
                )
                .bind(error)
                .bind(now)
                .bind(task_id)
                .execute(&self.pool)
                .await
            }
        }
        .map_err(db_err)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::TaskNotFound(task_id.to_string()));
        }
        Ok(())
    }

    async fn load_task(&self, task_id: &str) -> Result<TaskRecord, StoreError> {
        let row = sqlx::query(
            "SELECT id, workflow_id, kind, target, run_at, status, attempts, max_attempts, \
             last_error, created_at, updated_at FROM tasks WHERE id = ?1",
        )
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?
        .ok_or_else(|| StoreError::TaskNotFound(task_id.to_string()))?;

        row_to_task(&row)
    }

    async fn reclaim_stale_tasks(&self, older_than: Duration) -> Result<Vec<String>, StoreError> {
        let now = Utc::now();
        let cutoff = now
            - chrono::Duration::from_std(older_than).unwrap_or_else(|_| chrono::Duration::zero());

        let rows = sqlx::query(
            "UPDATE tasks SET status = 'PENDING', run_at = ?1, claimed_by = NULL, \
             updated_at = ?1 WHERE status = 'RUNNING' AND updated_at < ?2 RETURNING id",
        )
        .bind(now)
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(rows.iter().map(|r| r.get("id")).collect())
    }

    #[instrument(skip(self, result), fields(workflow_id = %workflow_id))]
    async fn complete_activity(
        &self,
        task_id: &str,
        workflow_id: &str,
        activity_id: &str,
        result: serde_json::Value,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let status = workflow_status(&mut tx, workflow_id).await?;
        let already = activity_has_outcome(&mut tx, workflow_id, activity_id).await?;
        if !status.is_terminal() && !already {
            insert_event(
                &mut tx,
                workflow_id,
                &WorkflowEvent::ActivityCompleted {
                    activity_id: activity_id.to_string(),
                    result,
                },
            )
            .await?;
            enqueue_resume_step(&mut tx, workflow_id).await?;
        } else {
            debug!(%activity_id, "discarding activity result");
        }

        sqlx::query(
            "UPDATE tasks SET status = 'COMPLETED', claimed_by = NULL, updated_at = ?1 \
             WHERE id = ?2",
        )
        .bind(Utc::now())
        .bind(task_id)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    #[instrument(skip(self, error), fields(workflow_id = %workflow_id))]
    async fn fail_activity(
        &self,
        task_id: &str,
        workflow_id: &str,
        activity_id: &str,
        error: ActivityError,
        attempts_used: u32,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let status = workflow_status(&mut tx, workflow_id).await?;
        let already = activity_has_outcome(&mut tx, workflow_id, activity_id).await?;
        let message = error.message.clone();
        if !status.is_terminal() && !already {
            insert_event(
                &mut tx,
                workflow_id,
                &WorkflowEvent::ActivityFailed {
                    activity_id: activity_id.to_string(),
                    error,
                    attempts_used,
                },
            )
            .await?;
            enqueue_resume_step(&mut tx, workflow_id).await?;
        }

        sqlx::query(
            "UPDATE tasks SET status = 'FAILED', last_error = ?1, claimed_by = NULL, \
             updated_at = ?2 WHERE id = ?3",
        )
        .bind(&message)
        .bind(Utc::now())
        .bind(task_id)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    #[instrument(skip(self), fields(workflow_id = %workflow_id))]
    async fn fire_timer(
        &self,
        task_id: &str,
        workflow_id: &str,
        timer_id: &str,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let status = workflow_status(&mut tx, workflow_id).await?;
        let already: Option<i64> = sqlx::query_scalar(
            r#"
            SELECT 1 FROM events
            WHERE workflow_id = ?1 AND type = 'TIMER_FIRED'
              AND json_extract(payload, '$.timer_id') = ?2
            LIMIT 1
            "#,
        )
        .bind(workflow_id)
        .bind(timer_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?;

        if !status.is_terminal() && already.is_none() {
            insert_event(
                &mut tx,
                workflow_id,
                &WorkflowEvent::TimerFired {
                    timer_id: timer_id.to_string(),
                },
            )
            .await?;
            enqueue_resume_step(&mut tx, workflow_id).await?;
        }

        sqlx::query(
            "UPDATE tasks SET status = 'COMPLETED', claimed_by = NULL, updated_at = ?1 \
             WHERE id = ?2",
        )
        .bind(Utc::now())
        .bind(task_id)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    #[instrument(skip(self, payload), fields(workflow_id = %workflow_id))]
    async fn append_signal(
        &self,
        workflow_id: &str,
        name: &str,
        payload: serde_json::Value,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let status = workflow_status(&mut tx, workflow_id).await?;
        if status.is_terminal() {
            return Err(StoreError::WorkflowTerminal(workflow_id.to_string()));
        }

        insert_event(
            &mut tx,
            workflow_id,
            &WorkflowEvent::SignalReceived {
                name: name.to_string(),
                payload,
            },
        )
        .await?;
        enqueue_resume_step(&mut tx, workflow_id).await?;

        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    #[instrument(skip(self), fields(workflow_id = %workflow_id))]
    async fn cancel_workflow(&self, workflow_id: &str, reason: &str) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let status = workflow_status(&mut tx, workflow_id).await?;
        if status.is_terminal() {
            debug!("cancel of terminal workflow is a no-op");
            tx.rollback().await.map_err(db_err)?;
            return Ok(());
        }

        insert_event(
            &mut tx,
            workflow_id,
            &WorkflowEvent::WorkflowCancelled {
                reason: reason.to_string(),
            },
        )
        .await?;
        sqlx::query("UPDATE workflows SET status = 'CANCELLED', updated_at = ?1 WHERE id = ?2")
            .bind(Utc::now())
            .bind(workflow_id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    async fn append_log(
        &self,
        workflow_id: &str,
        level: LogLevel,
        message: &str,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO logs (workflow_id, level, message, created_at) VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(workflow_id)
        .bind(level.to_string())
        .bind(message)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn load_logs(&self, workflow_id: &str) -> Result<Vec<LogEntry>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, workflow_id, level, message, created_at FROM logs \
             WHERE workflow_id = ?1 ORDER BY id",
        )
        .bind(workflow_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            let level: String = row.get("level");
            entries.push(LogEntry {
                id: row.get("id"),
                workflow_id: row.get("workflow_id"),
                level: LogLevel::parse(&level)?,
                message: row.get("message"),
                created_at: row.get("created_at"),
            });
        }
        Ok(entries)
    }
}
