//! Database schema and migrations.

use anyhow::Result;
use rusqlite::Connection;

/// Run all pending migrations.
pub fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS locations (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            pattern TEXT NOT NULL,
            priority INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS hosts (
            id INTEGER PRIMARY KEY,
            address TEXT NOT NULL UNIQUE,
            display_name TEXT NOT NULL,
            location_id INTEGER REFERENCES locations(id),
            remark TEXT,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            updated_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS host_metrics (
            id INTEGER PRIMARY KEY,
            host_id INTEGER NOT NULL UNIQUE REFERENCES hosts(id),
            address TEXT NOT NULL,
            cpu_max REAL NOT NULL,
            cpu_avg REAL NOT NULL,
            cpu_min REAL NOT NULL,
            mem_max REAL NOT NULL,
            mem_avg REAL NOT NULL,
            mem_min REAL NOT NULL,
            disk_max REAL NOT NULL,
            disk_avg REAL NOT NULL,
            disk_min REAL NOT NULL,
            captured_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS sync_tasks (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            description TEXT NOT NULL DEFAULT '',
            source_kind TEXT NOT NULL,
            cron_expr TEXT NOT NULL,
            selection_json TEXT NOT NULL,
            params_json TEXT NOT NULL,
            enabled INTEGER NOT NULL DEFAULT 1,
            deleted INTEGER NOT NULL DEFAULT 0,
            created_by TEXT NOT NULL DEFAULT '',
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            updated_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS sync_executions (
            id TEXT PRIMARY KEY,
            task_id INTEGER REFERENCES sync_tasks(id),
            task_name TEXT,
            source_kind TEXT NOT NULL,
            status TEXT NOT NULL,
            total INTEGER NOT NULL DEFAULT 0,
            succeeded INTEGER NOT NULL DEFAULT 0,
            failed INTEGER NOT NULL DEFAULT 0,
            not_in_source INTEGER NOT NULL DEFAULT 0,
            duration_ms INTEGER,
            error TEXT,
            started_at TEXT NOT NULL,
            finished_at TEXT
        );

        CREATE TABLE IF NOT EXISTS sync_execution_details (
            id INTEGER PRIMARY KEY,
            execution_id TEXT NOT NULL REFERENCES sync_executions(id),
            address TEXT NOT NULL,
            host_name TEXT,
            outcome TEXT NOT NULL,
            cpu_max REAL,
            cpu_avg REAL,
            mem_max REAL,
            mem_avg REAL,
            disk_max REAL,
            disk_avg REAL,
            error TEXT,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE UNIQUE INDEX IF NOT EXISTS idx_sync_tasks_live_name
            ON sync_tasks(name) WHERE deleted = 0;
        CREATE INDEX IF NOT EXISTS idx_sync_tasks_source ON sync_tasks(source_kind);
        CREATE INDEX IF NOT EXISTS idx_sync_executions_started ON sync_executions(started_at);
        CREATE INDEX IF NOT EXISTS idx_sync_executions_task ON sync_executions(task_id);
        CREATE INDEX IF NOT EXISTS idx_sync_details_execution ON sync_execution_details(execution_id);",
    )?;

    Ok(())
}
