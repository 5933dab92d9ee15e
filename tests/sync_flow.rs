//! End-to-end sync runs against an in-process metrics source.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio_test::{assert_err, assert_ok};

use hostsync::audit::{ExecutionFilter, ExecutionStatus, HostOutcome};
use hostsync::config::SyncConfig;
use hostsync::source::{
    HostMetrics, MetricsSource, SourceError, SourceFactory, SourceKind, SourceParams, TimeRange,
    Utilization,
};
use hostsync::storage::{open_pool, Pool};
use hostsync::sync::{RunRequest, Selection, SyncEngine, SyncError};

fn util(max: f64) -> Utilization {
    Utilization {
        max,
        avg: max / 2.0,
        min: 1.0,
    }
}

fn metrics(address: &str, cpu: f64) -> HostMetrics {
    HostMetrics {
        address: address.to_string(),
        host_name: Some(format!("host-{}", address.replace('.', "-"))),
        cpu: util(cpu),
        memory: util(40.0),
        disk: util(70.0),
        points: 60,
    }
}

/// Source backed by an in-memory table, with optional per-query latency and
/// in-flight tracking.
#[derive(Default)]
struct TableSource {
    hosts: Mutex<HashMap<String, HostMetrics>>,
    failing: HashSet<String>,
    groups: HashMap<String, Vec<String>>,
    latency: Duration,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl TableSource {
    fn with_hosts(hosts: &[(&str, f64)]) -> Self {
        let table = hosts
            .iter()
            .map(|(a, cpu)| (a.to_string(), metrics(a, *cpu)))
            .collect();
        Self {
            hosts: Mutex::new(table),
            ..Default::default()
        }
    }

    fn set_cpu(&self, address: &str, cpu: f64) {
        self.hosts
            .lock()
            .unwrap()
            .insert(address.to_string(), metrics(address, cpu));
    }
}

#[async_trait]
impl MetricsSource for TableSource {
    fn kind(&self) -> SourceKind {
        SourceKind::Elasticsearch
    }

    async fn query_one(
        &self,
        address: &str,
        _range: &TimeRange,
    ) -> Result<Option<HostMetrics>, SourceError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.failing.contains(address) {
            return Err(SourceError::Status {
                status: 503,
                body: "shard unavailable".to_string(),
            });
        }
        Ok(self.hosts.lock().unwrap().get(address).cloned())
    }

    async fn query_many(
        &self,
        addresses: &[String],
        _range: &TimeRange,
    ) -> Result<Vec<HostMetrics>, SourceError> {
        let table = self.hosts.lock().unwrap();
        Ok(addresses.iter().filter_map(|a| table.get(a).cloned()).collect())
    }

    async fn query_group(
        &self,
        group: &str,
        _range: &TimeRange,
    ) -> Result<Vec<HostMetrics>, SourceError> {
        let table = self.hosts.lock().unwrap();
        Ok(self
            .groups
            .get(group)
            .map(|members| members.iter().filter_map(|a| table.get(a).cloned()).collect())
            .unwrap_or_default())
    }
}

struct Shared(Arc<TableSource>);

impl SourceFactory for Shared {
    fn create(
        &self,
        _kind: SourceKind,
        _params: &SourceParams,
    ) -> Result<Arc<dyn MetricsSource>, SourceError> {
        let source: Arc<dyn MetricsSource> = self.0.clone();
        Ok(source)
    }
}

fn setup(source: TableSource, config: SyncConfig) -> (TempDir, Pool, Arc<TableSource>, Arc<SyncEngine>) {
    let dir = TempDir::new().unwrap();
    let pool = open_pool(&dir.path().join("hostsync.db"), 16).unwrap();
    let source = Arc::new(source);
    let engine = Arc::new(SyncEngine::new(
        pool.clone(),
        Arc::new(Shared(source.clone())),
        config,
    ));
    (dir, pool, source, engine)
}

fn list(hosts: &[&str]) -> Selection {
    Selection::Hosts {
        hosts: hosts.iter().map(|h| h.to_string()).collect(),
    }
}

fn count(pool: &Pool, sql: &str) -> i64 {
    pool.get().unwrap().query_row(sql, [], |r| r.get(0)).unwrap()
}

#[tokio::test]
async fn test_every_host_gets_exactly_one_detail_row() {
    let mut source = TableSource::with_hosts(&[("10.0.0.1", 80.0), ("10.0.0.2", 20.0)]);
    source.failing.insert("10.0.0.3".to_string());
    let (_dir, _pool, _src, engine) = setup(source, SyncConfig::default());

    let result = engine
        .run_detached(RunRequest::ad_hoc(
            SourceKind::Elasticsearch,
            list(&["10.0.0.1", "10.0.0.2", "10.0.0.3", "10.0.0.4", "10.0.0.2"]),
        ))
        .await
        .unwrap();

    assert_eq!(result.status, ExecutionStatus::Partial);
    assert_eq!(result.total, 4);
    assert_eq!(
        result.total,
        result.succeeded + result.failed + result.not_in_source
    );
    assert_eq!((result.succeeded, result.failed, result.not_in_source), (2, 1, 1));
    assert!(result.failed_hosts[0].error.contains("503"));
    assert_eq!(result.not_in_source_hosts, vec!["10.0.0.4"]);

    let record = engine.auditor().get(&result.execution_id).unwrap().unwrap();
    let details = engine.auditor().details(&result.execution_id).unwrap();
    assert_eq!(details.len() as i64, record.total);
    assert!(record.finished_at.is_some());
    assert!(record.duration_ms.is_some());

    let mut addresses: Vec<_> = details.iter().map(|d| d.address.clone()).collect();
    addresses.sort();
    addresses.dedup();
    assert_eq!(addresses.len(), 4, "one row per host");

    let ok = details.iter().find(|d| d.address == "10.0.0.1").unwrap();
    assert_eq!(ok.outcome, HostOutcome::Success);
    assert_eq!(ok.cpu_max, Some(80.0));
    assert_eq!(ok.host_name.as_deref(), Some("host-10-0-0-1"));
}

#[tokio::test]
async fn test_absent_hosts_are_not_failures() {
    let source = TableSource::with_hosts(&[("10.0.0.1", 50.0)]);
    let (_dir, pool, _src, engine) = setup(source, SyncConfig::default());

    let result = engine
        .run(RunRequest::ad_hoc(
            SourceKind::Elasticsearch,
            list(&["10.0.0.1", "10.9.9.9"]),
        ))
        .await
        .unwrap();

    assert_eq!(result.status, ExecutionStatus::Success);
    assert_eq!(result.failed, 0);
    assert_eq!(result.not_in_source, 1);
    assert_eq!(count(&pool, "SELECT COUNT(*) FROM hosts WHERE address = '10.9.9.9'"), 0);
}

#[tokio::test]
async fn test_group_sync_then_resync_overwrites_metrics() {
    let mut source = TableSource::with_hosts(&[("10.2.0.1", 90.0), ("10.2.0.2", 10.0)]);
    source.groups.insert(
        "payments".to_string(),
        vec!["10.2.0.1".to_string(), "10.2.0.2".to_string()],
    );
    let (_dir, pool, src, engine) = setup(source, SyncConfig::default());
    let group = || RunRequest::ad_hoc(SourceKind::Elasticsearch, Selection::Group { group: "payments".into() });

    let first = engine.run(group()).await.unwrap();
    assert_eq!(first.status, ExecutionStatus::Success);
    assert_eq!(first.new_hosts.len(), 2);
    assert!(first.updated_hosts.is_empty());

    src.set_cpu("10.2.0.1", 15.0);
    let second = engine.run(group()).await.unwrap();
    assert!(second.new_hosts.is_empty());
    assert_eq!(second.updated_hosts.len(), 2);

    let snap = engine.inventory().current_metrics("10.2.0.1").unwrap().unwrap();
    assert_eq!(snap.cpu.max, 15.0);
    assert_eq!(count(&pool, "SELECT COUNT(*) FROM hosts"), 2);
    assert_eq!(count(&pool, "SELECT COUNT(*) FROM host_metrics"), 2);

    let host = engine.inventory().get_host("10.2.0.1").unwrap().unwrap();
    assert_eq!(host.display_name, "host-10-2-0-1");
}

#[tokio::test]
async fn test_persistence_failure_marks_hosts_failed() {
    let source = TableSource::with_hosts(&[("10.3.0.1", 30.0), ("10.3.0.2", 30.0)]);
    let (_dir, pool, _src, engine) = setup(source, SyncConfig::default());
    pool.get()
        .unwrap()
        .execute_batch("DROP TABLE host_metrics;")
        .unwrap();

    let result = engine
        .run(RunRequest::ad_hoc(
            SourceKind::Elasticsearch,
            list(&["10.3.0.1", "10.3.0.2"]),
        ))
        .await
        .unwrap();

    assert_eq!(result.status, ExecutionStatus::Failed);
    assert_eq!(result.failed, 2);
    assert!(result
        .failed_hosts
        .iter()
        .all(|f| f.error.contains("failed to upsert metrics")));
}

#[tokio::test]
async fn test_worker_budget_bounds_concurrency() {
    let hosts: Vec<String> = (1..=40).map(|i| format!("10.4.0.{}", i)).collect();
    let table: Vec<(&str, f64)> = hosts.iter().map(|h| (h.as_str(), 5.0)).collect();
    let mut source = TableSource::with_hosts(&table);
    source.latency = Duration::from_millis(20);
    let config = SyncConfig {
        list_concurrency: 4,
        ..SyncConfig::default()
    };
    let (_dir, _pool, src, engine) = setup(source, config);

    let result = engine
        .run(RunRequest::ad_hoc(
            SourceKind::Elasticsearch,
            Selection::Hosts { hosts: hosts.clone() },
        ))
        .await
        .unwrap();

    assert_eq!(result.succeeded, 40);
    let peak = src.peak.load(Ordering::SeqCst);
    assert!(peak <= 4, "peak concurrency {} exceeded budget", peak);
    assert!(peak >= 2, "workers did not overlap");
}

#[tokio::test]
async fn test_concurrent_runs_do_not_duplicate_hosts() {
    let mut source = TableSource::with_hosts(&[("10.5.0.1", 1.0), ("10.5.0.2", 2.0), ("10.5.0.3", 3.0)]);
    source.latency = Duration::from_millis(5);
    let (_dir, pool, _src, engine) = setup(source, SyncConfig::default());
    let req = || RunRequest::ad_hoc(SourceKind::Elasticsearch, list(&["10.5.0.1", "10.5.0.2", "10.5.0.3"]));

    let runs: Vec<_> = (0..4).map(|_| engine.spawn(req())).collect();
    for run in runs {
        let result = run.await.unwrap().unwrap();
        assert_eq!(result.status, ExecutionStatus::Success);
    }

    assert_eq!(count(&pool, "SELECT COUNT(*) FROM hosts"), 3);
    assert_eq!(count(&pool, "SELECT COUNT(*) FROM host_metrics"), 3);

    let executions = engine
        .auditor()
        .list(&ExecutionFilter {
            limit: 10,
            ..Default::default()
        })
        .unwrap();
    assert_eq!(executions.len(), 4);
    assert!(executions.iter().all(|e| e.total == 3 && e.succeeded == 3));
}

#[tokio::test]
async fn test_invalid_selection_opens_no_execution() {
    let (_dir, pool, _src, engine) = setup(TableSource::default(), SyncConfig::default());

    let err = assert_err!(
        engine
            .run(RunRequest::ad_hoc(SourceKind::Elasticsearch, list(&[])))
            .await
    );
    assert!(matches!(err, SyncError::Validation(_)));

    let missing = Selection::File {
        path: "/nonexistent/hosts.txt".to_string(),
    };
    assert_err!(engine.run(RunRequest::ad_hoc(SourceKind::Elasticsearch, missing)).await);
    assert_eq!(count(&pool, "SELECT COUNT(*) FROM sync_executions"), 0);

    let upload = Selection::Upload {
        content: "# exported\n10.6.0.1\n\n10.6.0.1, dup\n".to_string(),
    };
    let result = assert_ok!(engine.run(RunRequest::ad_hoc(SourceKind::Elasticsearch, upload)).await);
    assert_eq!(result.total, 1);
    assert_eq!(result.not_in_source_hosts, vec!["10.6.0.1"]);
}
