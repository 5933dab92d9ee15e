use std::sync::Arc;

use crate::sync::SyncEngine;
use crate::tasks::TaskService;

#[derive(Clone)]
pub struct AppState {
    pub tasks: TaskService,
    pub engine: Arc<SyncEngine>,
}

impl AppState {
    pub fn new(tasks: TaskService, engine: Arc<SyncEngine>) -> Self {
        Self { tasks, engine }
    }
}
