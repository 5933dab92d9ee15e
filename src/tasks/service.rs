//! Task administration: persist first, then bring the live scheduler in line.
//!
//! A live-scheduler failure after a successful write is logged and does not
//! roll the write back. Mutations are serialized so the stored `enabled`
//! flag and the live schedule never end up out of step.

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{error, info, warn};

use super::{NewTask, SyncTaskDefinition, TaskError, TaskFilter, TaskStore, TaskUpdate};
use crate::storage;
use crate::sync::SyncScheduler;

#[derive(Clone)]
pub struct TaskService {
    store: TaskStore,
    scheduler: SyncScheduler,
    /// Held across a store write and the matching scheduler change.
    writes: Arc<Mutex<()>>,
}

impl TaskService {
    pub fn new(store: TaskStore, scheduler: SyncScheduler) -> Self {
        Self {
            store,
            scheduler,
            writes: Arc::new(Mutex::new(())),
        }
    }

    pub fn scheduler(&self) -> &SyncScheduler {
        &self.scheduler
    }

    pub async fn create(&self, new: NewTask) -> Result<SyncTaskDefinition, TaskError> {
        let valid = new.validate()?;
        let _write = self.writes.lock().await;
        let store = self.store.clone();
        let task = blocking(move || store.insert(&valid)).await?;
        info!(task = %task.name, task_id = task.id, source = %task.source_kind, "task created");

        if task.enabled {
            self.schedule(&task).await;
        }
        Ok(task)
    }

    pub async fn update(&self, id: i64, update: TaskUpdate) -> Result<SyncTaskDefinition, TaskError> {
        let _write = self.writes.lock().await;
        let current = self.get(id).await?;
        let valid = update.apply(&current)?;
        let store = self.store.clone();
        let task = blocking(move || store.update(id, &valid)).await?;
        info!(task = %task.name, task_id = task.id, "task updated");

        if task.enabled {
            self.schedule(&task).await;
        } else {
            self.scheduler.unregister(task.id).await;
        }
        Ok(task)
    }

    /// Persist the flag, then register or unregister. A disable has taken
    /// effect in the live scheduler by the time this returns.
    pub async fn set_enabled(&self, id: i64, enabled: bool) -> Result<SyncTaskDefinition, TaskError> {
        let _write = self.writes.lock().await;
        let store = self.store.clone();
        let task = blocking(move || store.set_enabled(id, enabled)).await?;
        info!(task = %task.name, task_id = task.id, enabled, "task toggled");

        if enabled {
            self.schedule(&task).await;
        } else {
            self.scheduler.unregister(task.id).await;
        }
        Ok(task)
    }

    pub async fn delete(&self, id: i64) -> Result<(), TaskError> {
        let _write = self.writes.lock().await;
        let store = self.store.clone();
        blocking(move || store.soft_delete(id)).await?;
        self.scheduler.unregister(id).await;
        info!(task_id = id, "task deleted");
        Ok(())
    }

    pub async fn get(&self, id: i64) -> Result<SyncTaskDefinition, TaskError> {
        let store = self.store.clone();
        blocking(move || store.get(id))
            .await?
            .ok_or(TaskError::NotFound(id))
    }

    pub async fn list(&self, filter: TaskFilter) -> Result<Vec<SyncTaskDefinition>, TaskError> {
        let store = self.store.clone();
        blocking(move || store.list(&filter)).await
    }

    /// Register every enabled task. Tasks whose stored expression no longer
    /// parses are logged and skipped. Returns how many were scheduled.
    pub async fn restore_schedules(&self) -> Result<usize, TaskError> {
        let _write = self.writes.lock().await;
        let tasks = self
            .list(TaskFilter {
                source_kind: None,
                enabled_only: true,
            })
            .await?;

        let mut scheduled = 0;
        for task in &tasks {
            match self.scheduler.register(task).await {
                Ok(()) => scheduled += 1,
                Err(e) => warn!(task = %task.name, task_id = task.id, error = %e, "skipping task at startup"),
            }
        }
        info!(scheduled, total = tasks.len(), "restored task schedules");
        Ok(scheduled)
    }

    async fn schedule(&self, task: &SyncTaskDefinition) {
        if let Err(e) = self.scheduler.register(task).await {
            error!(task = %task.name, task_id = task.id, error = %e, "failed to update live schedule");
        }
    }
}

async fn blocking<T, F>(f: F) -> Result<T, TaskError>
where
    F: FnOnce() -> Result<T, TaskError> + Send + 'static,
    T: Send + 'static,
{
    storage::blocking(move || Ok(f())).await?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncConfig;
    use crate::source::{HttpSourceFactory, SourceParams};
    use crate::storage::testing::temp_pool;
    use crate::sync::{Selection, SyncEngine};
    use futures::future::join_all;

    fn service(pool: crate::storage::Pool) -> TaskService {
        let factory = HttpSourceFactory::new(Default::default(), Default::default());
        let engine = Arc::new(SyncEngine::new(pool.clone(), Arc::new(factory), SyncConfig::default()));
        TaskService::new(TaskStore::new(pool), SyncScheduler::new(engine))
    }

    fn new_task(name: &str, enabled: bool) -> NewTask {
        NewTask {
            name: name.to_string(),
            description: String::new(),
            source: "cmsys".to_string(),
            cron_expr: "0 0 3 * * *".to_string(),
            selection: Selection::Group {
                group: "payments".to_string(),
            },
            params: SourceParams::default(),
            enabled,
            created_by: "ops".to_string(),
        }
    }

    #[tokio::test]
    async fn test_create_registers_enabled_task_only() {
        let (_dir, pool) = temp_pool();
        let svc = service(pool);

        let on = svc.create(new_task("on", true)).await.unwrap();
        let off = svc.create(new_task("off", false)).await.unwrap();

        assert!(svc.scheduler().is_registered(on.id).await);
        assert!(!svc.scheduler().is_registered(off.id).await);
    }

    #[tokio::test]
    async fn test_toggle_keeps_store_and_scheduler_in_step() {
        let (_dir, pool) = temp_pool();
        let svc = service(pool);
        let task = svc.create(new_task("nightly", true)).await.unwrap();

        let disabled = svc.set_enabled(task.id, false).await.unwrap();
        assert!(!disabled.enabled);
        assert!(!svc.scheduler().is_registered(task.id).await);

        let enabled = svc.set_enabled(task.id, true).await.unwrap();
        assert!(enabled.enabled);
        assert!(svc.scheduler().is_registered(task.id).await);
    }

    #[tokio::test]
    async fn test_update_reregisters_with_new_expression() {
        let (_dir, pool) = temp_pool();
        let svc = service(pool);
        let task = svc.create(new_task("nightly", true)).await.unwrap();

        let updated = svc
            .update(
                task.id,
                TaskUpdate {
                    cron_expr: Some("0 15 * * * *".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.cron_expr, "0 15 * * * *");
        assert_eq!(updated.name, "nightly");

        let preview = svc.scheduler().preview(3).await;
        assert!(preview.len() >= 2);
        assert!(preview.iter().all(|p| p.at.format("%M").to_string() == "15"));

        let err = svc
            .update(
                task.id,
                TaskUpdate {
                    cron_expr: Some("bogus".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, TaskError::Validation(_)));
    }

    #[tokio::test]
    async fn test_delete_unregisters_and_hides() {
        let (_dir, pool) = temp_pool();
        let svc = service(pool);
        let task = svc.create(new_task("nightly", true)).await.unwrap();

        svc.delete(task.id).await.unwrap();
        assert!(!svc.scheduler().is_registered(task.id).await);
        assert!(matches!(svc.get(task.id).await, Err(TaskError::NotFound(_))));
        assert!(matches!(svc.delete(task.id).await, Err(TaskError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_duplicate_name_conflict() {
        let (_dir, pool) = temp_pool();
        let svc = service(pool);
        svc.create(new_task("nightly", true)).await.unwrap();
        let err = svc.create(new_task("nightly", false)).await.unwrap_err();
        assert!(matches!(err, TaskError::DuplicateName(_)));
    }

    #[tokio::test]
    async fn test_restore_schedules_registers_enabled_tasks() {
        let (_dir, pool) = temp_pool();
        let svc = service(pool.clone());
        let a = svc.create(new_task("a", true)).await.unwrap();
        svc.create(new_task("b", false)).await.unwrap();

        // A fresh process over the same database.
        let restarted = service(pool);
        assert_eq!(restarted.restore_schedules().await.unwrap(), 1);
        assert_eq!(restarted.scheduler().registered().await, vec![a.id]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_mutations_leave_schedule_matching_store() {
        let (_dir, pool) = temp_pool();
        let svc = service(pool);
        let task = svc.create(new_task("contended", true)).await.unwrap();

        for round in 0..5 {
            let calls = (0..16).map(|i| {
                let svc = svc.clone();
                let id = task.id;
                tokio::spawn(async move {
                    if i % 5 == 4 {
                        let update = TaskUpdate {
                            description: Some(format!("round {} call {}", round, i)),
                            ..Default::default()
                        };
                        svc.update(id, update).await.map(|_| ())
                    } else {
                        svc.set_enabled(id, (i + round) % 2 == 0).await.map(|_| ())
                    }
                })
            });
            for joined in join_all(calls).await {
                joined.unwrap().unwrap();
            }

            let stored = svc.get(task.id).await.unwrap();
            assert_eq!(
                svc.scheduler().is_registered(task.id).await,
                stored.enabled,
                "round {}",
                round
            );
        }
    }
}
