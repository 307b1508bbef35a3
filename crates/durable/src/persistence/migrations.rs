//! Numbered forward migrations for the SQLite store
//!
//! Each script runs at most once, inside its own transaction, and is tracked
//! in `_loom_migrations`. Scripts are forward-only and append-only: published
//! versions are never edited.

use sqlx::SqlitePool;

use super::store::StoreError;

pub(crate) struct Migration {
    pub version: i64,
    pub name: &'static str,
    pub sql: &'static str,
}

pub(crate) const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "workflows",
        sql: r#"
            CREATE TABLE IF NOT EXISTS workflows (
                id            TEXT PRIMARY KEY,
                name          TEXT NOT NULL,
                version       TEXT NOT NULL,
                status        TEXT NOT NULL
                              CHECK (status IN ('RUNNING','COMPLETED','FAILED','CANCELLED')),
                input         TEXT NOT NULL,
                initial_state TEXT NOT NULL,
                created_at    TEXT NOT NULL,
                updated_at    TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_workflows_status ON workflows (status);
        "#,
    },
    Migration {
        version: 2,
        name: "events",
        sql: r#"
            CREATE TABLE IF NOT EXISTS events (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                workflow_id TEXT NOT NULL REFERENCES workflows (id) ON DELETE CASCADE,
                type        TEXT NOT NULL,
                payload     TEXT NOT NULL,
                created_at  TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_events_workflow ON events (workflow_id);
        "#,
    },
    Migration {
        version: 3,
        name: "tasks",
        sql: r#"
            CREATE TABLE IF NOT EXISTS tasks (
                id           TEXT PRIMARY KEY,
                workflow_id  TEXT NOT NULL REFERENCES workflows (id) ON DELETE CASCADE,
                kind         TEXT NOT NULL CHECK (kind IN ('STEP','ACTIVITY','TIMER')),
                target       TEXT NOT NULL,
                run_at       TEXT NOT NULL,
                status       TEXT NOT NULL
                             CHECK (status IN ('PENDING','RUNNING','COMPLETED','FAILED')),
                attempts     INTEGER NOT NULL DEFAULT 0,
                max_attempts INTEGER NOT NULL,
                last_error   TEXT,
                claimed_by   TEXT,
                created_at   TEXT NOT NULL,
                updated_at   TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_tasks_status_run_at ON tasks (status, run_at);
            CREATE INDEX IF NOT EXISTS idx_tasks_workflow ON tasks (workflow_id);
        "#,
    },
    Migration {
        version: 4,
        name: "logs",
        sql: r#"
            CREATE TABLE IF NOT EXISTS logs (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                workflow_id TEXT NOT NULL REFERENCES workflows (id) ON DELETE CASCADE,
                level       TEXT NOT NULL,
                message     TEXT NOT NULL,
                created_at  TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_logs_workflow ON logs (workflow_id);
        "#,
    },
];

/// Apply all unapplied migrations, oldest first
pub(crate) async fn run_migrations(pool: &SqlitePool) -> Result<(), StoreError> {
    sqlx::raw_sql(
        r#"
        CREATE TABLE IF NOT EXISTS _loom_migrations (
            version    INTEGER PRIMARY KEY,
            name       TEXT NOT NULL,
            applied_at TEXT NOT NULL
        );
        "#,
    )
    .execute(pool)
    .await
    .map_err(|e| StoreError::Database(e.to_string()))?;

    for migration in MIGRATIONS {
        let applied: Option<i64> =
            sqlx::query_scalar("SELECT version FROM _loom_migrations WHERE version = ?1")
                .bind(migration.version)
                .fetch_optional(pool)
                .await
                .map_err(|e| StoreError::Database(e.to_string()))?;
        if applied.is_some() {
            continue;
        }

        let mut tx = pool
            .begin()
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        sqlx::raw_sql(migration.sql)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                StoreError::Database(format!(
                    "migration {} ({}) failed: {e}",
                    migration.version, migration.name
                ))
            })?;

        sqlx::query("INSERT INTO _loom_migrations (version, name, applied_at) VALUES (?1, ?2, ?3)")
            .bind(migration.version)
            .bind(migration.name)
            .bind(chrono::Utc::now())
            .execute(&mut *tx)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        tx.commit()
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        tracing::info!(
            version = migration.version,
            name = migration.name,
            "applied migration"
        );
    }

    Ok(())
}
