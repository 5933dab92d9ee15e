//! Execution records for sync runs.
//!
//! A run opens one `sync_executions` row in `running` state, appends one
//! detail row per host while running, and is finalized exactly once. Detail
//! inserts are rejected once the parent has left `running`, and aggregate
//! counts are always recomputed from the detail rows.

use std::fmt;
use std::str::FromStr;

use anyhow::{Context, Result};
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::source::{HostMetrics, SourceKind};
use crate::storage::{now_rfc3339, Pool};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Running,
    Success,
    Partial,
    Failed,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Running => "running",
            ExecutionStatus::Success => "success",
            ExecutionStatus::Partial => "partial",
            ExecutionStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "running" => Ok(ExecutionStatus::Running),
            "success" => Ok(ExecutionStatus::Success),
            "partial" => Ok(ExecutionStatus::Partial),
            "failed" => Ok(ExecutionStatus::Failed),
            other => anyhow::bail!("unknown execution status '{}'", other),
        }
    }
}

/// Per-host outcome bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostOutcome {
    Success,
    Failed,
    NotInSource,
}

impl HostOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            HostOutcome::Success => "success",
            HostOutcome::Failed => "failed",
            HostOutcome::NotInSource => "not_in_source",
        }
    }
}

impl FromStr for HostOutcome {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "success" => Ok(HostOutcome::Success),
            "failed" => Ok(HostOutcome::Failed),
            "not_in_source" => Ok(HostOutcome::NotInSource),
            other => anyhow::bail!("unknown host outcome '{}'", other),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecutionRecord {
    pub id: String,
    pub task_id: Option<i64>,
    pub task_name: Option<String>,
    pub source_kind: SourceKind,
    pub status: ExecutionStatus,
    pub total: i64,
    pub succeeded: i64,
    pub failed: i64,
    pub not_in_source: i64,
    pub duration_ms: Option<i64>,
    pub error: Option<String>,
    pub started_at: String,
    pub finished_at: Option<String>,
}

const EXECUTION_COLUMNS: &str = "id, task_id, task_name, source_kind, status, total, succeeded, \
     failed, not_in_source, duration_ms, error, started_at, finished_at";

impl ExecutionRecord {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let source: String = row.get(3)?;
        let status: String = row.get(4)?;
        Ok(Self {
            id: row.get(0)?,
            task_id: row.get(1)?,
            task_name: row.get(2)?,
            source_kind: source
                .parse::<SourceKind>()
                .map_err(|e| conversion_error(3, e))?,
            status: status
                .parse::<ExecutionStatus>()
                .map_err(|e| conversion_error(4, e))?,
            total: row.get(5)?,
            succeeded: row.get(6)?,
            failed: row.get(7)?,
            not_in_source: row.get(8)?,
            duration_ms: row.get(9)?,
            error: row.get(10)?,
            started_at: row.get(11)?,
            finished_at: row.get(12)?,
        })
    }
}

fn conversion_error(
    idx: usize,
    e: impl Into<Box<dyn std::error::Error + Send + Sync + 'static>>,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, e.into())
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecutionDetail {
    pub id: i64,
    pub execution_id: String,
    pub address: String,
    pub host_name: Option<String>,
    pub outcome: HostOutcome,
    pub cpu_max: Option<f64>,
    pub cpu_avg: Option<f64>,
    pub mem_max: Option<f64>,
    pub mem_avg: Option<f64>,
    pub disk_max: Option<f64>,
    pub disk_avg: Option<f64>,
    pub error: Option<String>,
}

/// A detail row about to be written.
#[derive(Debug, Clone)]
pub struct DetailEntry {
    pub address: String,
    pub host_name: Option<String>,
    pub outcome: HostOutcome,
    pub metrics: Option<HostMetrics>,
    pub error: Option<String>,
}

impl DetailEntry {
    pub fn success(metrics: HostMetrics, host_name: Option<String>) -> Self {
        Self {
            address: metrics.address.clone(),
            host_name,
            outcome: HostOutcome::Success,
            metrics: Some(metrics),
            error: None,
        }
    }

    pub fn failed(address: &str, host_name: Option<String>, error: impl Into<String>) -> Self {
        Self {
            address: address.to_string(),
            host_name,
            outcome: HostOutcome::Failed,
            metrics: None,
            error: Some(error.into()),
        }
    }

    pub fn not_in_source(address: &str) -> Self {
        Self {
            address: address.to_string(),
            host_name: None,
            outcome: HostOutcome::NotInSource,
            metrics: None,
            error: None,
        }
    }
}

/// Aggregate counts, computed from detail rows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ExecutionCounts {
    pub total: i64,
    pub succeeded: i64,
    pub failed: i64,
    pub not_in_source: i64,
}

/// Final status from the outcome counts. No failures is `success` (this
/// includes a run with nothing to do); failures alongside successes is
/// `partial`; failures with no successes is `failed`.
pub fn derive_status(counts: &ExecutionCounts) -> ExecutionStatus {
    if counts.failed == 0 {
        ExecutionStatus::Success
    } else if counts.succeeded > 0 {
        ExecutionStatus::Partial
    } else {
        ExecutionStatus::Failed
    }
}

/// Filter for execution listings, most recent first.
#[derive(Debug, Clone, Default)]
pub struct ExecutionFilter {
    pub task_id: Option<i64>,
    pub source_kind: Option<SourceKind>,
    pub limit: usize,
}

#[derive(Clone)]
pub struct Auditor {
    pool: Pool,
}

impl Auditor {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Open a new execution in `running` state.
    pub fn open(
        &self,
        task_id: Option<i64>,
        task_name: Option<&str>,
        source: SourceKind,
        total: usize,
    ) -> Result<ExecutionRecord> {
        let id = Uuid::new_v4().to_string();
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO sync_executions (id, task_id, task_name, source_kind, status, total, started_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                id,
                task_id,
                task_name,
                source.as_str(),
                ExecutionStatus::Running.as_str(),
                total as i64,
                now_rfc3339()
            ],
        )
        .context("failed to open execution record")?;
        drop(conn);

        self.get(&id)?
            .ok_or_else(|| anyhow::anyhow!("execution {} vanished after insert", id))
    }

    /// Back-fill the target count once it is known (full sync).
    pub fn set_total(&self, id: &str, total: usize) -> Result<()> {
        let conn = self.pool.get()?;
        conn.execute(
            "UPDATE sync_executions SET total = ?2 WHERE id = ?1 AND status = 'running'",
            params![id, total as i64],
        )?;
        Ok(())
    }

    /// Append one detail row. Fails if the execution is unknown or already
    /// finalized.
    pub fn append_detail(&self, id: &str, entry: &DetailEntry) -> Result<()> {
        let m = entry.metrics.as_ref();
        let conn = self.pool.get()?;
        let inserted = conn
            .execute(
                "INSERT INTO sync_execution_details (
                    execution_id, address, host_name, outcome,
                    cpu_max, cpu_avg, mem_max, mem_avg, disk_max, disk_avg,
                    error, created_at
                 )
                 SELECT ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12
                 WHERE EXISTS (
                    SELECT 1 FROM sync_executions WHERE id = ?1 AND status = 'running'
                 )",
                params![
                    id,
                    entry.address,
                    entry.host_name,
                    entry.outcome.as_str(),
                    m.map(|m| m.cpu.max),
                    m.map(|m| m.cpu.avg),
                    m.map(|m| m.memory.max),
                    m.map(|m| m.memory.avg),
                    m.map(|m| m.disk.max),
                    m.map(|m| m.disk.avg),
                    entry.error,
                    now_rfc3339()
                ],
            )
            .with_context(|| format!("failed to record detail for {}", entry.address))?;

        if inserted == 0 {
            anyhow::bail!("execution {} is not running; detail for {} rejected", id, entry.address);
        }
        Ok(())
    }

    pub fn counts(&self, id: &str) -> Result<ExecutionCounts> {
        let conn = self.pool.get()?;
        let counts = conn.query_row(
            "SELECT COUNT(*),
                    COALESCE(SUM(outcome = 'success'), 0),
                    COALESCE(SUM(outcome = 'failed'), 0),
                    COALESCE(SUM(outcome = 'not_in_source'), 0)
             FROM sync_execution_details WHERE execution_id = ?1",
            params![id],
            |row| {
                Ok(ExecutionCounts {
                    total: row.get(0)?,
                    succeeded: row.get(1)?,
                    failed: row.get(2)?,
                    not_in_source: row.get(3)?,
                })
            },
        )?;
        Ok(counts)
    }

    /// Close the execution. Only the first call for an id succeeds.
    pub fn finalize(
        &self,
        id: &str,
        status: ExecutionStatus,
        counts: &ExecutionCounts,
        duration_ms: i64,
        error: Option<&str>,
    ) -> Result<ExecutionRecord> {
        if status == ExecutionStatus::Running {
            anyhow::bail!("cannot finalize execution {} as running", id);
        }

        let conn = self.pool.get()?;
        let changed = conn
            .execute(
                "UPDATE sync_executions SET
                    status = ?2, total = ?3, succeeded = ?4, failed = ?5, not_in_source = ?6,
                    duration_ms = ?7, error = ?8, finished_at = ?9
                 WHERE id = ?1 AND status = 'running'",
                params![
                    id,
                    status.as_str(),
                    counts.total,
                    counts.succeeded,
                    counts.failed,
                    counts.not_in_source,
                    duration_ms,
                    error,
                    now_rfc3339()
                ],
            )
            .context("failed to finalize execution record")?;

        if changed == 0 {
            anyhow::bail!("execution {} is unknown or already finalized", id);
        }
        drop(conn);

        self.get(id)?
            .ok_or_else(|| anyhow::anyhow!("execution {} vanished after finalize", id))
    }

    /// Fail every execution still marked `running`, counting whatever detail
    /// rows it got. Only call this when no run can be active, i.e. at daemon
    /// start. Returns the number of records closed.
    pub fn fail_interrupted(&self, message: &str) -> Result<usize> {
        let conn = self.pool.get()?;
        let closed = conn
            .execute(
                "UPDATE sync_executions SET
                    status = 'failed',
                    total = (SELECT COUNT(*) FROM sync_execution_details d
                             WHERE d.execution_id = sync_executions.id),
                    succeeded = (SELECT COUNT(*) FROM sync_execution_details d
                                 WHERE d.execution_id = sync_executions.id AND d.outcome = 'success'),
                    failed = (SELECT COUNT(*) FROM sync_execution_details d
                              WHERE d.execution_id = sync_executions.id AND d.outcome = 'failed'),
                    not_in_source = (SELECT COUNT(*) FROM sync_execution_details d
                                     WHERE d.execution_id = sync_executions.id AND d.outcome = 'not_in_source'),
                    error = ?1,
                    finished_at = ?2
                 WHERE status = 'running'",
                params![message, now_rfc3339()],
            )
            .context("failed to close interrupted executions")?;
        Ok(closed)
    }

    pub fn get(&self, id: &str) -> Result<Option<ExecutionRecord>> {
        let conn = self.pool.get()?;
        let rec = conn
            .query_row(
                &format!("SELECT {} FROM sync_executions WHERE id = ?1", EXECUTION_COLUMNS),
                params![id],
                ExecutionRecord::from_row,
            )
            .optional()?;
        Ok(rec)
    }

    pub fn list(&self, filter: &ExecutionFilter) -> Result<Vec<ExecutionRecord>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM sync_executions
             WHERE (?1 IS NULL OR task_id = ?1)
               AND (?2 IS NULL OR source_kind = ?2)
             ORDER BY started_at DESC, rowid DESC
             LIMIT ?3",
            EXECUTION_COLUMNS
        ))?;

        let rows = stmt.query_map(
            params![
                filter.task_id,
                filter.source_kind.map(|k| k.as_str()),
                filter.limit.max(1) as i64
            ],
            ExecutionRecord::from_row,
        )?;

        let mut list = Vec::new();
        for r in rows {
            list.push(r?);
        }
        Ok(list)
    }

    pub fn details(&self, id: &str) -> Result<Vec<ExecutionDetail>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT id, execution_id, address, host_name, outcome,
                    cpu_max, cpu_avg, mem_max, mem_avg, disk_max, disk_avg, error
             FROM sync_execution_details WHERE execution_id = ?1 ORDER BY id ASC",
        )?;

        let rows = stmt.query_map(params![id], |row| {
            let outcome: String = row.get(4)?;
            Ok(ExecutionDetail {
                id: row.get(0)?,
                execution_id: row.get(1)?,
                address: row.get(2)?,
                host_name: row.get(3)?,
                outcome: outcome
                    .parse::<HostOutcome>()
                    .map_err(|e| conversion_error(4, e))?,
                cpu_max: row.get(5)?,
                cpu_avg: row.get(6)?,
                mem_max: row.get(7)?,
                mem_avg: row.get(8)?,
                disk_max: row.get(9)?,
                disk_avg: row.get(10)?,
                error: row.get(11)?,
            })
        })?;

        let mut list = Vec::new();
        for r in rows {
            list.push(r?);
        }
        Ok(list)
    }
}
