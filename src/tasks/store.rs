use anyhow::Context;
use rusqlite::{params, OptionalExtension, Row};

use super::{SyncTaskDefinition, TaskError, TaskFilter, ValidTask};
use crate::source::SourceKind;
use crate::storage::{now_rfc3339, Pool};

const TASK_COLUMNS: &str = "id, name, description, source_kind, cron_expr, selection_json, \
     params_json, enabled, created_by, created_at, updated_at";

/// SQLite-backed task definitions. Deleted tasks keep their row with
/// `deleted = 1` and are invisible to every query here.
#[derive(Clone)]
pub struct TaskStore {
    pool: Pool,
}

impl TaskStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub(crate) fn insert(&self, task: &ValidTask) -> Result<SyncTaskDefinition, TaskError> {
        let selection = serde_json::to_string(&task.selection).context("failed to encode selection")?;
        let params = serde_json::to_string(&task.params).context("failed to encode params")?;
        let now = now_rfc3339();

        let conn = self.pool.get().map_err(anyhow::Error::from)?;
        let result = conn.execute(
            "INSERT INTO sync_tasks (
                name, description, source_kind, cron_expr, selection_json, params_json,
                enabled, created_by, created_at, updated_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)",
            params![
                task.name,
                task.description,
                task.source_kind.as_str(),
                task.cron_expr,
                selection,
                params,
                task.enabled,
                task.created_by,
                now
            ],
        );
        if let Err(e) = result {
            return Err(map_write_error(e, &task.name));
        }
        let id = conn.last_insert_rowid();
        drop(conn);

        self.get(id)?.ok_or(TaskError::NotFound(id))
    }

    pub(crate) fn update(&self, id: i64, task: &ValidTask) -> Result<SyncTaskDefinition, TaskError> {
        let selection = serde_json::to_string(&task.selection).context("failed to encode selection")?;
        let params = serde_json::to_string(&task.params).context("failed to encode params")?;

        let conn = self.pool.get().map_err(anyhow::Error::from)?;
        let changed = conn
            .execute(
                "UPDATE sync_tasks SET
                    name = ?2, description = ?3, source_kind = ?4, cron_expr = ?5,
                    selection_json = ?6, params_json = ?7, updated_at = ?8
                 WHERE id = ?1 AND deleted = 0",
                params![
                    id,
                    task.name,
                    task.description,
                    task.source_kind.as_str(),
                    task.cron_expr,
                    selection,
                    params,
                    now_rfc3339()
                ],
            )
            .map_err(|e| map_write_error(e, &task.name))?;
        if changed == 0 {
            return Err(TaskError::NotFound(id));
        }
        drop(conn);

        self.get(id)?.ok_or(TaskError::NotFound(id))
    }

    pub fn set_enabled(&self, id: i64, enabled: bool) -> Result<SyncTaskDefinition, TaskError> {
        let conn = self.pool.get().map_err(anyhow::Error::from)?;
        let changed = conn
            .execute(
                "UPDATE sync_tasks SET enabled = ?2, updated_at = ?3 WHERE id = ?1 AND deleted = 0",
                params![id, enabled, now_rfc3339()],
            )
            .context("failed to toggle task")?;
        if changed == 0 {
            return Err(TaskError::NotFound(id));
        }
        drop(conn);

        self.get(id)?.ok_or(TaskError::NotFound(id))
    }

    /// Flag the task deleted; the row is kept.
    pub fn soft_delete(&self, id: i64) -> Result<(), TaskError> {
        let conn = self.pool.get().map_err(anyhow::Error::from)?;
        let changed = conn
            .execute(
                "UPDATE sync_tasks SET deleted = 1, enabled = 0, updated_at = ?2
                 WHERE id = ?1 AND deleted = 0",
                params![id, now_rfc3339()],
            )
            .context("failed to delete task")?;
        if changed == 0 {
            return Err(TaskError::NotFound(id));
        }
        Ok(())
    }

    pub fn get(&self, id: i64) -> Result<Option<SyncTaskDefinition>, TaskError> {
        let conn = self.pool.get().map_err(anyhow::Error::from)?;
        let task = conn
            .query_row(
                &format!("SELECT {} FROM sync_tasks WHERE id = ?1 AND deleted = 0", TASK_COLUMNS),
                params![id],
                task_from_row,
            )
            .optional()
            .context("failed to load task")?;
        Ok(task)
    }

    pub fn list(&self, filter: &TaskFilter) -> Result<Vec<SyncTaskDefinition>, TaskError> {
        let conn = self.pool.get().map_err(anyhow::Error::from)?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM sync_tasks
                 WHERE deleted = 0
                   AND (?1 IS NULL OR source_kind = ?1)
                   AND (?2 = 0 OR enabled = 1)
                 ORDER BY id ASC",
                TASK_COLUMNS
            ))
            .context("failed to prepare task listing")?;

        let rows = stmt
            .query_map(
                params![filter.source_kind.map(|k| k.as_str()), filter.enabled_only],
                task_from_row,
            )
            .context("failed to list tasks")?;

        let mut list = Vec::new();
        for r in rows {
            list.push(r.context("failed to decode task row")?);
        }
        Ok(list)
    }
}

fn task_from_row(row: &Row<'_>) -> rusqlite::Result<SyncTaskDefinition> {
    let source: String = row.get(3)?;
    let selection: String = row.get(5)?;
    let params: String = row.get(6)?;
    Ok(SyncTaskDefinition {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        source_kind: source
            .parse::<SourceKind>()
            .map_err(|e| conversion_error(3, e))?,
        cron_expr: row.get(4)?,
        selection: serde_json::from_str(&selection).map_err(|e| conversion_error(5, e))?,
        params: serde_json::from_str(&params).map_err(|e| conversion_error(6, e))?,
        enabled: row.get(7)?,
        created_by: row.get(8)?,
        created_at: row.get(9)?,
        updated_at: row.get(10)?,
    })
}

fn conversion_error(
    idx: usize,
    e: impl Into<Box<dyn std::error::Error + Send + Sync + 'static>>,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, e.into())
}

/// Only a unique-index hit means the name is taken; other constraint
/// failures are storage errors.
fn map_write_error(e: rusqlite::Error, name: &str) -> TaskError {
    match e {
        rusqlite::Error::SqliteFailure(ref err, _)
            if err.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE =>
        {
            TaskError::DuplicateName(name.to_string())
        }
        other => TaskError::Storage(anyhow::Error::from(other).context("failed to write task")),
    }
}
