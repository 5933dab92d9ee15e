//! API route definitions.

use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};

use super::state::AppState;
use super::ApiError;
use crate::audit::ExecutionFilter;
use crate::source::{SourceKind, SourceParams};
use crate::storage::blocking;
use crate::sync::{RunRequest, Selection};
use crate::tasks::{NewTask, TaskFilter, TaskUpdate};

pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/tasks", get(list_tasks).post(create_task))
        .route(
            "/tasks/{id}",
            get(get_task).put(update_task).delete(delete_task),
        )
        .route("/tasks/{id}/enable", post(enable_task))
        .route("/tasks/{id}/disable", post(disable_task))
        .route("/schedules/dry-run", get(schedule_dry_run))
        .route("/sync/hosts", post(sync_hosts))
        .route("/sync/file", post(sync_file))
        .route("/sync/group", post(sync_group))
        .route("/executions", get(list_executions))
        .route("/executions/{id}", get(get_execution))
}

fn envelope(data: impl serde::Serialize, meta: Value) -> Result<Json<Value>, ApiError> {
    let data = serde_json::to_value(data).map_err(anyhow::Error::from)?;
    Ok(Json(json!({ "data": data, "meta": meta })))
}

fn parse_source(raw: &str) -> Result<SourceKind, ApiError> {
    raw.parse::<SourceKind>()
        .map_err(|e| ApiError::InvalidInput(e.to_string()))
}

async fn health() -> Json<Value> {
    Json(json!({
        "data": {
            "status": "ok",
            "version": env!("CARGO_PKG_VERSION")
        },
        "meta": {
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "version": env!("CARGO_PKG_VERSION")
        }
    }))
}

// ---------------------------------------------------------------------------
// Tasks
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct TaskListQuery {
    source: Option<String>,
    #[serde(default)]
    enabled_only: bool,
}

async fn list_tasks(
    State(state): State<AppState>,
    Query(q): Query<TaskListQuery>,
) -> Result<Json<Value>, ApiError> {
    let source_kind = q.source.as_deref().map(parse_source).transpose()?;
    let tasks = state
        .tasks
        .list(TaskFilter {
            source_kind,
            enabled_only: q.enabled_only,
        })
        .await?;
    let total = tasks.len();
    envelope(tasks, json!({ "total": total }))
}

async fn create_task(
    State(state): State<AppState>,
    Json(new): Json<NewTask>,
) -> Result<Json<Value>, ApiError> {
    let task = state.tasks.create(new).await?;
    envelope(task, json!({}))
}

async fn get_task(State(state): State<AppState>, Path(id): Path<i64>) -> Result<Json<Value>, ApiError> {
    let task = state.tasks.get(id).await?;
    envelope(task, json!({}))
}

async fn update_task(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(update): Json<TaskUpdate>,
) -> Result<Json<Value>, ApiError> {
    let task = state.tasks.update(id, update).await?;
    envelope(task, json!({}))
}

async fn delete_task(State(state): State<AppState>, Path(id): Path<i64>) -> Result<Json<Value>, ApiError> {
    state.tasks.delete(id).await?;
    envelope(json!({ "id": id, "deleted": true }), json!({}))
}

async fn enable_task(State(state): State<AppState>, Path(id): Path<i64>) -> Result<Json<Value>, ApiError> {
    let task = state.tasks.set_enabled(id, true).await?;
    envelope(task, json!({}))
}

async fn disable_task(State(state): State<AppState>, Path(id): Path<i64>) -> Result<Json<Value>, ApiError> {
    let task = state.tasks.set_enabled(id, false).await?;
    envelope(task, json!({}))
}

#[derive(Debug, Deserialize)]
struct DryRunQuery {
    hours: Option<u64>,
}

async fn schedule_dry_run(
    State(state): State<AppState>,
    Query(q): Query<DryRunQuery>,
) -> Result<Json<Value>, ApiError> {
    let hours = q.hours.unwrap_or(24).min(24 * 7);
    let upcoming = state.tasks.scheduler().preview(hours).await;
    envelope(json!({ "upcoming": upcoming }), json!({ "hours": hours }))
}

// ---------------------------------------------------------------------------
// Run now
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct HostsRunBody {
    source: String,
    hosts: Vec<String>,
    #[serde(default)]
    params: SourceParams,
}

#[derive(Debug, Deserialize)]
struct GroupRunBody {
    source: String,
    group: String,
    #[serde(default)]
    params: SourceParams,
}

#[derive(Debug, Deserialize)]
struct FileRunQuery {
    source: String,
    time_range_minutes: Option<i64>,
}

async fn sync_hosts(
    State(state): State<AppState>,
    Json(body): Json<HostsRunBody>,
) -> Result<Json<Value>, ApiError> {
    let source = parse_source(&body.source)?;
    let request = RunRequest::ad_hoc(source, Selection::Hosts { hosts: body.hosts })
        .with_params(body.params);
    let result = state.engine.run_detached(request).await?;
    envelope(result, json!({}))
}

async fn sync_file(
    State(state): State<AppState>,
    Query(q): Query<FileRunQuery>,
    content: String,
) -> Result<Json<Value>, ApiError> {
    let source = parse_source(&q.source)?;
    let params = SourceParams {
        time_range_minutes: q.time_range_minutes,
        ..Default::default()
    };
    let request = RunRequest::ad_hoc(source, Selection::Upload { content }).with_params(params);
    let result = state.engine.run_detached(request).await?;
    envelope(result, json!({}))
}

async fn sync_group(
    State(state): State<AppState>,
    Json(body): Json<GroupRunBody>,
) -> Result<Json<Value>, ApiError> {
    let source = parse_source(&body.source)?;
    let request = RunRequest::ad_hoc(source, Selection::Group { group: body.group })
        .with_params(body.params);
    let result = state.engine.run_detached(request).await?;
    envelope(result, json!({}))
}

// ---------------------------------------------------------------------------
// Executions
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ExecutionListQuery {
    task_id: Option<i64>,
    source: Option<String>,
    limit: Option<usize>,
}

async fn list_executions(
    State(state): State<AppState>,
    Query(q): Query<ExecutionListQuery>,
) -> Result<Json<Value>, ApiError> {
    let config = state.engine.config();
    let filter = ExecutionFilter {
        task_id: q.task_id,
        source_kind: q.source.as_deref().map(parse_source).transpose()?,
        limit: q
            .limit
            .unwrap_or(config.default_list_limit)
            .clamp(1, config.max_list_limit.max(1)),
    };
    let limit = filter.limit;
    let auditor = state.engine.auditor().clone();
    let records = blocking(move || auditor.list(&filter)).await?;
    let total = records.len();
    envelope(records, json!({ "total": total, "limit": limit }))
}

async fn get_execution(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let auditor = state.engine.auditor().clone();
    let lookup = id.clone();
    let found = blocking(move || {
        let Some(record) = auditor.get(&lookup)? else {
            return Ok(None);
        };
        let details = auditor.details(&lookup)?;
        Ok(Some((record, details)))
    })
    .await?;

    let (record, details) = found.ok_or_else(|| ApiError::NotFound(format!("execution {}", id)))?;
    let count = details.len();
    envelope(
        json!({ "execution": record, "details": details }),
        json!({ "details": count }),
    )
}
