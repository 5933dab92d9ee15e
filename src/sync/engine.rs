//! The sync run engine.
//!
//! A run resolves its targets, opens an execution record, fans the hosts out
//! to a bounded set of workers, and finalizes the record from the detail rows
//! the workers wrote. Every host that reaches a worker ends in exactly one
//! detail row: `success`, `failed` or `not_in_source`.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

use super::targets::{dedup_hosts, parse_host_list};
use super::{HostFailure, RunRequest, RunResult, Selection, SyncError};
use crate::audit::{derive_status, Auditor, DetailEntry, ExecutionStatus, HostOutcome};
use crate::config::SyncConfig;
use crate::inventory::Inventory;
use crate::source::{HostMetrics, MetricsSource, SourceError, SourceFactory, SourceKind, TimeRange};
use crate::storage::{blocking, Pool};

enum Targets {
    List(Vec<String>),
    Group(String),
}

enum WorkItem {
    /// Query the source for this address.
    Lookup(String),
    /// Already returned by a group query.
    Prefetched(HostMetrics),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HostChange {
    New,
    Existing,
}

type WorkerOutput = Option<(String, HostChange)>;

pub struct SyncEngine {
    inventory: Inventory,
    auditor: Auditor,
    sources: Arc<dyn SourceFactory>,
    config: SyncConfig,
    runs: TaskTracker,
}

impl SyncEngine {
    pub fn new(pool: Pool, sources: Arc<dyn SourceFactory>, config: SyncConfig) -> Self {
        Self {
            inventory: Inventory::new(pool.clone()),
            auditor: Auditor::new(pool),
            sources,
            config,
            runs: TaskTracker::new(),
        }
    }

    pub fn inventory(&self) -> &Inventory {
        &self.inventory
    }

    pub fn auditor(&self) -> &Auditor {
        &self.auditor
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Start a run on its own task. Dropping the returned handle does not
    /// cancel the run; only the run timeout does. Spawned runs are tracked
    /// so shutdown can wait for them.
    pub fn spawn(self: &Arc<Self>, request: RunRequest) -> JoinHandle<Result<RunResult, SyncError>> {
        let engine = Arc::clone(self);
        self.runs.spawn(async move { engine.run(request).await })
    }

    /// Number of spawned runs that have not finished yet.
    pub fn runs_in_flight(&self) -> usize {
        self.runs.len()
    }

    /// Wait up to `grace` for spawned runs to finish. Returns `false` if
    /// some were still running when the grace period ran out.
    pub async fn drain(&self, grace: Duration) -> bool {
        self.runs.close();
        let drained = tokio::time::timeout(grace, self.runs.wait()).await.is_ok();
        self.runs.reopen();
        if !drained {
            warn!(
                in_flight = self.runs.len(),
                grace_secs = grace.as_secs(),
                "runs still in flight at shutdown; they will be marked interrupted on next start"
            );
        }
        drained
    }

    /// Run on a detached task and wait for it.
    pub async fn run_detached(self: &Arc<Self>, request: RunRequest) -> Result<RunResult, SyncError> {
        self.spawn(request).await?
    }

    /// Execute one run to completion.
    ///
    /// Validation problems return `Err` before any record is written. Once
    /// the execution record exists every outcome, including source failure
    /// and timeout, is returned as a finalized [`RunResult`].
    pub async fn run(&self, request: RunRequest) -> Result<RunResult, SyncError> {
        let targets = resolve_targets(&request.selection).await?;
        let source = self
            .sources
            .create(request.source, &request.params)
            .map_err(|e| match e {
                SourceError::InvalidParams(msg) => SyncError::Validation(msg),
                other => SyncError::Source(other),
            })?;
        let minutes = request
            .params
            .time_range_minutes
            .unwrap_or(self.config.default_time_range_minutes);
        let range = TimeRange::last_minutes(minutes);

        let initial_total = match &targets {
            Targets::List(hosts) => hosts.len(),
            Targets::Group(_) => 0,
        };
        let auditor = self.auditor.clone();
        let (task_id, task_name, kind) = (request.task_id, request.task_name.clone(), request.source);
        let record = blocking(move || auditor.open(task_id, task_name.as_deref(), kind, initial_total))
            .await?;

        let execution_id: Arc<str> = Arc::from(record.id.as_str());
        let started = Instant::now();
        let deadline =
            tokio::time::Instant::now() + Duration::from_secs(self.config.run_timeout_secs.max(1));
        info!(
            execution = %execution_id,
            source = %request.source,
            mode = request.selection.mode(),
            task = ?request.task_name,
            hosts = initial_total,
            "sync run started"
        );

        let (items, concurrency, full_sync) = match targets {
            Targets::List(hosts) => (
                hosts.into_iter().map(WorkItem::Lookup).collect::<Vec<_>>(),
                self.config.list_concurrency,
                false,
            ),
            Targets::Group(group) => {
                let queried = tokio::time::timeout_at(deadline, source.query_group(&group, &range)).await;
                let found = match queried {
                    Ok(Ok(found)) => found,
                    Ok(Err(e)) => {
                        error!(execution = %execution_id, group = %group, error = %e, "group query failed");
                        let msg = format!("group query for '{}' failed: {}", group, e);
                        return self.finish(&execution_id, request.source, started, Some(msg), true, Vec::new()).await;
                    }
                    Err(_) => {
                        let msg = format!("run timed out after {}s during group query", self.config.run_timeout_secs);
                        warn!(execution = %execution_id, group = %group, "{}", msg);
                        return self.finish(&execution_id, request.source, started, Some(msg), true, Vec::new()).await;
                    }
                };

                let items = dedup_metrics(found);
                let auditor = self.auditor.clone();
                let (id, total) = (execution_id.clone(), items.len());
                blocking(move || auditor.set_total(&id, total)).await?;
                info!(execution = %execution_id, group = %group, hosts = total, "group query returned hosts");
                (items, self.config.group_concurrency, true)
            }
        };

        let cancel = CancellationToken::new();
        let worker = Worker {
            source,
            inventory: self.inventory.clone(),
            auditor: self.auditor.clone(),
            execution_id: execution_id.clone(),
            range,
            cancel: cancel.clone(),
        };
        let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
        let mut workers: JoinSet<WorkerOutput> = JoinSet::new();
        let mut changes = Vec::new();

        let completed = tokio::time::timeout_at(deadline, async {
            for item in items {
                let permit = match semaphore.clone().acquire_owned().await {
                    Ok(p) => p,
                    Err(_) => break,
                };
                let worker = worker.clone();
                workers.spawn(async move {
                    let _permit = permit;
                    worker.sync_host(item).await
                });
            }
            while let Some(joined) = workers.join_next().await {
                collect(joined, &mut changes);
            }
        })
        .await
        .is_ok();

        let mut error = None;
        if !completed {
            cancel.cancel();
            warn!(
                execution = %execution_id,
                in_flight = workers.len(),
                timeout_secs = self.config.run_timeout_secs,
                "sync run timed out; no further hosts will be started"
            );
            while let Some(joined) = workers.join_next().await {
                collect(joined, &mut changes);
            }
            error = Some(format!("run timed out after {}s", self.config.run_timeout_secs));
        }

        self.finish(&execution_id, request.source, started, error, full_sync, changes)
            .await
    }

    /// Finalize the record from its detail rows and build the result.
    async fn finish(
        &self,
        execution_id: &str,
        source: SourceKind,
        started: Instant,
        error: Option<String>,
        full_sync: bool,
        changes: Vec<(String, HostChange)>,
    ) -> Result<RunResult, SyncError> {
        let duration_ms = started.elapsed().as_millis() as i64;
        let auditor = self.auditor.clone();
        let id = execution_id.to_string();
        let failure = error.clone();

        let (record, details) = blocking(move || {
            let counts = auditor.counts(&id)?;
            let status = if failure.is_some() {
                ExecutionStatus::Failed
            } else {
                derive_status(&counts)
            };
            let record = auditor.finalize(&id, status, &counts, duration_ms, failure.as_deref())?;
            let details = auditor.details(&id)?;
            Ok((record, details))
        })
        .await?;

        let mut result = RunResult {
            execution_id: record.id.clone(),
            source,
            status: record.status,
            total: record.total,
            succeeded: record.succeeded,
            failed: record.failed,
            not_in_source: record.not_in_source,
            succeeded_hosts: Vec::new(),
            failed_hosts: Vec::new(),
            not_in_source_hosts: Vec::new(),
            new_hosts: Vec::new(),
            updated_hosts: Vec::new(),
            duration_ms,
            message: error,
        };

        for d in details {
            match d.outcome {
                HostOutcome::Success => result.succeeded_hosts.push(d.address),
                HostOutcome::Failed => result.failed_hosts.push(HostFailure {
                    address: d.address,
                    error: d.error.unwrap_or_default(),
                }),
                HostOutcome::NotInSource => result.not_in_source_hosts.push(d.address),
            }
        }

        if full_sync {
            for (address, change) in changes {
                match change {
                    HostChange::New => result.new_hosts.push(address),
                    HostChange::Existing => result.updated_hosts.push(address),
                }
            }
        }

        if result.total == 0 && result.message.is_none() {
            result.message = Some("no hosts to sync".to_string());
        }

        info!(
            execution = %result.execution_id,
            status = %result.status,
            total = result.total,
            succeeded = result.succeeded,
            failed = result.failed,
            not_in_source = result.not_in_source,
            duration_ms,
            "sync run finished"
        );
        Ok(result)
    }
}

#[derive(Clone)]
struct Worker {
    source: Arc<dyn MetricsSource>,
    inventory: Inventory,
    auditor: Auditor,
    execution_id: Arc<str>,
    range: TimeRange,
    cancel: CancellationToken,
}

impl Worker {
    async fn sync_host(self, item: WorkItem) -> WorkerOutput {
        if self.cancel.is_cancelled() {
            return None;
        }

        let metrics = match item {
            WorkItem::Prefetched(m) => m,
            WorkItem::Lookup(address) => {
                let queried = tokio::select! {
                    _ = self.cancel.cancelled() => return None,
                    r = self.source.query_one(&address, &self.range) => r,
                };
                match queried {
                    Ok(Some(mut m)) => {
                        m.address = address;
                        m
                    }
                    Ok(None) => {
                        self.record(DetailEntry::not_in_source(&address)).await;
                        return None;
                    }
                    Err(e) => {
                        warn!(execution = %self.execution_id, host = %address, error = %e, "source query failed");
                        self.record(DetailEntry::failed(&address, None, e.to_string()))
                            .await;
                        return None;
                    }
                }
            }
        };

        let address = metrics.address.clone();
        let (inventory, auditor, id) = (
            self.inventory.clone(),
            self.auditor.clone(),
            self.execution_id.clone(),
        );
        match blocking(move || reconcile(&inventory, &auditor, &id, metrics)).await {
            Ok(change) => change.map(|c| (address, c)),
            Err(e) => {
                error!(execution = %self.execution_id, host = %address, error = %format!("{:#}", e), "failed to record host outcome");
                None
            }
        }
    }

    async fn record(&self, entry: DetailEntry) {
        let (auditor, id) = (self.auditor.clone(), self.execution_id.clone());
        let address = entry.address.clone();
        if let Err(e) = blocking(move || auditor.append_detail(&id, &entry)).await {
            error!(execution = %self.execution_id, host = %address, error = %format!("{:#}", e), "failed to record host outcome");
        }
    }
}

/// Persist one host's metrics and write its detail row.
///
/// Returns `Ok(None)` when persistence failed and a `failed` row was written
/// instead; `Err` only when the detail row itself could not be written.
fn reconcile(
    inventory: &Inventory,
    auditor: &Auditor,
    execution_id: &str,
    metrics: HostMetrics,
) -> anyhow::Result<Option<HostChange>> {
    let host_name = metrics.host_name.clone();
    match persist_host(inventory, &metrics) {
        Ok(change) => {
            auditor.append_detail(execution_id, &DetailEntry::success(metrics, host_name))?;
            Ok(Some(change))
        }
        Err(e) => {
            warn!(execution = %execution_id, host = %metrics.address, error = %format!("{:#}", e), "failed to persist host");
            auditor.append_detail(
                execution_id,
                &DetailEntry::failed(&metrics.address, host_name, format!("{:#}", e)),
            )?;
            Ok(None)
        }
    }
}

fn persist_host(inventory: &Inventory, metrics: &HostMetrics) -> anyhow::Result<HostChange> {
    let ensured = inventory.ensure_host(&metrics.address, metrics.host_name.as_deref(), None)?;
    let host = &ensured.host;

    // Location lookup is best effort and never fails the host.
    if host.location_id.is_none() {
        match inventory.match_location(&host.address) {
            Ok(Some(loc)) => {
                if let Err(e) = inventory.assign_location(host.id, loc.id) {
                    warn!(host = %host.address, location = %loc.name, error = %e, "failed to assign location");
                }
            }
            Ok(None) => {}
            Err(e) => warn!(host = %host.address, error = %e, "location lookup failed"),
        }
    }

    inventory.upsert_metrics(host.id, &host.address, metrics)?;
    Ok(if ensured.created {
        HostChange::New
    } else {
        HostChange::Existing
    })
}

async fn resolve_targets(selection: &Selection) -> Result<Targets, SyncError> {
    selection.validate().map_err(SyncError::Validation)?;
    match selection {
        Selection::Hosts { hosts } => Ok(Targets::List(dedup_hosts(hosts))),
        Selection::Upload { content } => Ok(Targets::List(parse_host_list(content))),
        Selection::File { path } => {
            let content = tokio::fs::read_to_string(path)
                .await
                .map_err(|e| SyncError::Validation(format!("cannot read host file {}: {}", path, e)))?;
            let hosts = parse_host_list(&content);
            if hosts.is_empty() {
                return Err(SyncError::Validation(format!(
                    "host file {} contains no addresses",
                    path
                )));
            }
            Ok(Targets::List(hosts))
        }
        Selection::Group { group } => Ok(Targets::Group(group.trim().to_string())),
    }
}

/// Group results can repeat an address; the first occurrence wins.
fn dedup_metrics(found: Vec<HostMetrics>) -> Vec<WorkItem> {
    let mut seen = HashSet::new();
    found
        .into_iter()
        .filter_map(|mut m| {
            m.address = m.address.trim().to_string();
            if m.address.is_empty() || !seen.insert(m.address.clone()) {
                return None;
            }
            Some(WorkItem::Prefetched(m))
        })
        .collect()
}

fn collect(joined: Result<WorkerOutput, JoinError>, changes: &mut Vec<(String, HostChange)>) {
    match joined {
        Ok(Some(change)) => changes.push(change),
        Ok(None) => {}
        Err(e) => error!(error = %e, "host worker aborted"),
    }
}
