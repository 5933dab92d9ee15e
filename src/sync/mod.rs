//! Host metrics synchronization: target resolution, the run engine and the
//! recurring task scheduler.

pub mod engine;
pub mod scheduler;
pub mod targets;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::audit::ExecutionStatus;
use crate::source::{SourceError, SourceKind, SourceParams};

pub use self::engine::SyncEngine;
pub use self::scheduler::SyncScheduler;

/// Run-level failures. Per-host problems never surface here; they are
/// recorded as `failed` detail rows instead.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("source query failed: {0}")]
    Source(#[from] SourceError),

    #[error("storage error: {0:#}")]
    Storage(#[from] anyhow::Error),

    #[error("sync run task aborted: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Which hosts a run covers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum Selection {
    /// Explicit address list.
    Hosts { hosts: Vec<String> },
    /// Line-oriented host list read from a file when the run starts.
    File { path: String },
    /// Line-oriented host list supplied inline (uploaded text).
    Upload { content: String },
    /// Every host the source reports for a group ("full sync").
    Group { group: String },
}

impl Selection {
    /// Static checks that do not need I/O. File contents are checked when
    /// the run resolves its targets.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            Selection::Hosts { hosts } => {
                if targets::dedup_hosts(hosts).is_empty() {
                    return Err("host list is empty".to_string());
                }
            }
            Selection::File { path } => {
                if path.trim().is_empty() {
                    return Err("host file path is empty".to_string());
                }
            }
            Selection::Upload { content } => {
                if targets::parse_host_list(content).is_empty() {
                    return Err("uploaded host list contains no addresses".to_string());
                }
            }
            Selection::Group { group } => {
                if group.trim().is_empty() {
                    return Err("group name is empty".to_string());
                }
            }
        }
        Ok(())
    }

    pub fn mode(&self) -> &'static str {
        match self {
            Selection::Hosts { .. } => "hosts",
            Selection::File { .. } => "file",
            Selection::Upload { .. } => "upload",
            Selection::Group { .. } => "group",
        }
    }
}

/// Everything a single run needs.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub source: SourceKind,
    pub selection: Selection,
    pub params: SourceParams,
    pub task_id: Option<i64>,
    pub task_name: Option<String>,
}

impl RunRequest {
    /// An ad hoc run with no originating task.
    pub fn ad_hoc(source: SourceKind, selection: Selection) -> Self {
        Self {
            source,
            selection,
            params: SourceParams::default(),
            task_id: None,
            task_name: None,
        }
    }

    pub fn with_params(mut self, params: SourceParams) -> Self {
        self.params = params;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HostFailure {
    pub address: String,
    pub error: String,
}

/// Uniform outcome of a run, suitable for direct display.
#[derive(Debug, Clone, Serialize)]
pub struct RunResult {
    pub execution_id: String,
    pub source: SourceKind,
    pub status: ExecutionStatus,
    pub total: i64,
    pub succeeded: i64,
    pub failed: i64,
    pub not_in_source: i64,
    pub succeeded_hosts: Vec<String>,
    pub failed_hosts: Vec<HostFailure>,
    pub not_in_source_hosts: Vec<String>,
    /// Full sync only: hosts inserted into the pool by this run.
    pub new_hosts: Vec<String>,
    /// Full sync only: hosts that already existed.
    pub updated_hosts: Vec<String>,
    pub duration_ms: i64,
    pub message: Option<String>,
}
