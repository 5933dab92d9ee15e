//! hostsync -- host pool inventory kept current from external metrics sources.
//!
//! This crate provides the sync engine that pulls per-host CPU, memory and
//! disk utilization from a search-index source or the CMSYS inventory API,
//! the host pool it reconciles into, execution auditing, and the cron-driven
//! task scheduler that runs syncs on a recurrence.

pub mod api;
pub mod audit;
pub mod config;
pub mod inventory;
pub mod source;
pub mod storage;
pub mod sync;
pub mod tasks;

use std::sync::Arc;

use anyhow::{Context, Result};

use crate::audit::Auditor;
use crate::config::{AppConfig, LocationRule};
use crate::inventory::Inventory;
use crate::source::HttpSourceFactory;
use crate::storage::Pool;
use crate::sync::{SyncEngine, SyncScheduler};
use crate::tasks::{TaskService, TaskStore};

/// Open the configured database.
pub fn open_database(config: &AppConfig) -> Result<Pool> {
    tracing::info!(path = %config.database.path.display(), "Initializing database");
    storage::open_pool(&config.database.path, config.database.max_connections)
}

/// Sync engine over the real HTTP sources.
pub fn build_engine(config: &AppConfig, pool: Pool) -> Arc<SyncEngine> {
    let factory = HttpSourceFactory::new(config.elasticsearch.clone(), config.cmsys.clone());
    Arc::new(SyncEngine::new(pool, Arc::new(factory), config.sync.clone()))
}

/// Task service with its own live scheduler.
pub fn build_task_service(engine: Arc<SyncEngine>, pool: Pool) -> TaskService {
    TaskService::new(TaskStore::new(pool), SyncScheduler::new(engine))
}

/// Write the configured location rules into the registry. Bad rules are
/// logged and skipped.
pub fn seed_locations(inventory: &Inventory, rules: &[LocationRule]) -> usize {
    let mut seeded = 0;
    for rule in rules {
        match inventory.add_location(&rule.name, &rule.pattern, rule.priority) {
            Ok(_) => seeded += 1,
            Err(e) => tracing::warn!(location = %rule.name, error = %format!("{:#}", e), "skipping location rule"),
        }
    }
    seeded
}

/// Fail executions a previous daemon left `running` when it stopped
/// mid-run. Returns how many were closed.
pub fn close_interrupted_runs(pool: &Pool) -> Result<usize> {
    let closed = Auditor::new(pool.clone())
        .fail_interrupted("interrupted: hostsync stopped before the run finished")?;
    if closed > 0 {
        tracing::warn!(closed, "closed executions interrupted by a previous shutdown");
    }
    Ok(closed)
}

/// Start the hostsync daemon: API server and task scheduler.
pub async fn serve(config: AppConfig) -> Result<()> {
    // 1. Initialize Storage
    let pool = open_database(&config)?;

    // 2. Runs a previous process never finished
    close_interrupted_runs(&pool)?;

    // 3. Locations from config
    let seeded = seed_locations(&Inventory::new(pool.clone()), &config.locations);
    tracing::info!(seeded, "Location rules loaded");

    // 4. Engine, tasks and scheduler
    let engine = build_engine(&config, pool.clone());
    let tasks = build_task_service(engine.clone(), pool);
    tasks.restore_schedules().await?;

    // 5. Start API Server
    let addr: std::net::SocketAddr = config
        .server
        .bind
        .parse()
        .with_context(|| format!("invalid bind address '{}'", config.server.bind))?;
    let scheduler = tasks.scheduler().clone();
    let app = api::router(api::state::AppState::new(tasks, engine));

    tracing::info!(%addr, "hostsync listening");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Stops the job loops and waits out in-flight runs.
    scheduler.shutdown().await;
    tracing::info!("hostsync stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown signal received");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{DetailEntry, ExecutionStatus};
    use crate::source::SourceKind;
    use crate::storage::testing::temp_pool;

    #[test]
    fn test_close_interrupted_runs_at_startup() {
        let (_dir, pool) = temp_pool();
        let auditor = Auditor::new(pool.clone());
        let left = auditor.open(None, None, SourceKind::Cmsys, 2).unwrap();
        auditor
            .append_detail(&left.id, &DetailEntry::not_in_source("10.0.0.1"))
            .unwrap();

        assert_eq!(close_interrupted_runs(&pool).unwrap(), 1);
        let rec = auditor.get(&left.id).unwrap().unwrap();
        assert_eq!(rec.status, ExecutionStatus::Failed);
        assert!(rec.error.unwrap().starts_with("interrupted"));
        assert_eq!(rec.total, 1);

        assert_eq!(close_interrupted_runs(&pool).unwrap(), 0);
    }
}
