//! Recurring sync task definitions.
//!
//! [`TaskStore`] persists definitions (soft delete, unique live names);
//! [`TaskService`] keeps the live scheduler in step with the store.

pub mod service;
pub mod store;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::source::{SourceKind, SourceParams};
use crate::sync::scheduler::parse_cron;
use crate::sync::{RunRequest, Selection};

pub use self::service::TaskService;
pub use self::store::TaskStore;

#[derive(Debug, Error)]
pub enum TaskError {
    #[error("{0}")]
    Validation(String),

    #[error("a task named '{0}' already exists")]
    DuplicateName(String),

    #[error("task {0} not found")]
    NotFound(i64),

    #[error("storage error: {0:#}")]
    Storage(#[from] anyhow::Error),
}

/// A persisted recurring sync task.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncTaskDefinition {
    pub id: i64,
    pub name: String,
    pub description: String,
    pub source_kind: SourceKind,
    pub cron_expr: String,
    pub selection: Selection,
    pub params: SourceParams,
    pub enabled: bool,
    pub created_by: String,
    pub created_at: String,
    pub updated_at: String,
}

impl SyncTaskDefinition {
    /// The run a firing of this task performs.
    pub fn run_request(&self) -> RunRequest {
        RunRequest {
            source: self.source_kind,
            selection: self.selection.clone(),
            params: self.params.clone(),
            task_id: Some(self.id),
            task_name: Some(self.name.clone()),
        }
    }
}

fn default_enabled() -> bool {
    true
}

/// Input for creating a task. `source` accepts "elasticsearch", "es" or
/// "cmsys" in any case.
#[derive(Debug, Clone, Deserialize)]
pub struct NewTask {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub source: String,
    pub cron_expr: String,
    pub selection: Selection,
    #[serde(default)]
    pub params: SourceParams,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub created_by: String,
}

/// Partial update; unset fields keep their current value.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TaskUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub source: Option<String>,
    pub cron_expr: Option<String>,
    pub selection: Option<Selection>,
    pub params: Option<SourceParams>,
}

#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub source_kind: Option<SourceKind>,
    pub enabled_only: bool,
}

/// A fully validated definition ready to be written.
#[derive(Debug, Clone)]
pub(crate) struct ValidTask {
    pub name: String,
    pub description: String,
    pub source_kind: SourceKind,
    pub cron_expr: String,
    pub selection: Selection,
    pub params: SourceParams,
    pub enabled: bool,
    pub created_by: String,
}

impl NewTask {
    pub(crate) fn validate(self) -> Result<ValidTask, TaskError> {
        let name = validate_name(&self.name)?;
        let source_kind = parse_source(&self.source)?;
        let cron_expr = validate_cron(&self.cron_expr)?;
        validate_selection(&self.selection)?;
        validate_params(&self.params)?;

        Ok(ValidTask {
            name,
            description: self.description.trim().to_string(),
            source_kind,
            cron_expr,
            selection: self.selection,
            params: self.params,
            enabled: self.enabled,
            created_by: self.created_by.trim().to_string(),
        })
    }
}

impl TaskUpdate {
    /// Merge onto `current` and validate the result.
    pub(crate) fn apply(self, current: &SyncTaskDefinition) -> Result<ValidTask, TaskError> {
        let name = match self.name {
            Some(n) => validate_name(&n)?,
            None => current.name.clone(),
        };
        let source_kind = match self.source {
            Some(s) => parse_source(&s)?,
            None => current.source_kind,
        };
        let cron_expr = match self.cron_expr {
            Some(c) => validate_cron(&c)?,
            None => current.cron_expr.clone(),
        };
        let selection = self.selection.unwrap_or_else(|| current.selection.clone());
        validate_selection(&selection)?;
        let params = self.params.unwrap_or_else(|| current.params.clone());
        validate_params(&params)?;

        Ok(ValidTask {
            name,
            description: self
                .description
                .map(|d| d.trim().to_string())
                .unwrap_or_else(|| current.description.clone()),
            source_kind,
            cron_expr,
            selection,
            params,
            enabled: current.enabled,
            created_by: current.created_by.clone(),
        })
    }
}

fn validate_name(name: &str) -> Result<String, TaskError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(TaskError::Validation("task name is required".into()));
    }
    Ok(name.to_string())
}

fn parse_source(source: &str) -> Result<SourceKind, TaskError> {
    source
        .parse::<SourceKind>()
        .map_err(|e| TaskError::Validation(e.to_string()))
}

fn validate_cron(expr: &str) -> Result<String, TaskError> {
    let expr = expr.split_whitespace().collect::<Vec<_>>().join(" ");
    parse_cron(&expr).map_err(|e| TaskError::Validation(e.to_string()))?;
    Ok(expr)
}

fn validate_selection(selection: &Selection) -> Result<(), TaskError> {
    selection.validate().map_err(TaskError::Validation)
}

fn validate_params(params: &SourceParams) -> Result<(), TaskError> {
    if let Some(minutes) = params.time_range_minutes {
        if minutes <= 0 {
            return Err(TaskError::Validation(
                "time_range_minutes must be positive".into(),
            ));
        }
    }
    if let Some(endpoint) = &params.endpoint {
        let endpoint = endpoint.trim();
        if !endpoint.starts_with("http://") && !endpoint.starts_with("https://") {
            return Err(TaskError::Validation(format!(
                "endpoint '{}' must start with http:// or https://",
                endpoint
            )));
        }
    }
    Ok(())
}
