//! Task operations exposed to the HTTP layer.

use std::sync::Arc;

use thiserror::Error;

use crate::engine::{EngineError, ExecutionEngine};
use crate::executor::ExecError;
use crate::store::TaskStore;
use crate::task::{Task, TaskExecution};
use crate::validator;

#[derive(Debug, Error)]
pub enum TaskError {
    #[error("{0}")]
    Validation(String),

    #[error("Task not found with id: {0}")]
    NotFound(String),

    #[error(transparent)]
    Execution(ExecError),

    #[error("Task store error: {0}")]
    Persistence(String),

    #[error("{0}")]
    Internal(String),
}

impl From<EngineError> for TaskError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::NotFound(id) => TaskError::NotFound(id),
            EngineError::Execution(e) => TaskError::Execution(e),
            EngineError::Persistence(e) => TaskError::Persistence(e),
            e @ EngineError::Aborted(_) => TaskError::Internal(e.to_string()),
        }
    }
}

/// Check a task before it is saved: command first, then name, then owner.
pub fn validate_task(task: &Task) -> Result<(), TaskError> {
    if let Some(reason) = validator::validation_error(&task.command) {
        return Err(TaskError::Validation(reason));
    }
    if task.name.trim().is_empty() {
        return Err(TaskError::Validation("Task name is required".to_string()));
    }
    if task.owner.trim().is_empty() {
        return Err(TaskError::Validation("Task owner is required".to_string()));
    }
    Ok(())
}

pub struct TaskService {
    store: Arc<dyn TaskStore>,
    engine: Arc<ExecutionEngine>,
}

impl TaskService {
    pub fn new(store: Arc<dyn TaskStore>, engine: Arc<ExecutionEngine>) -> Self {
        Self { store, engine }
    }

    pub fn store_is_persistent(&self) -> bool {
        self.store.is_persistent()
    }

    pub fn backend_name(&self) -> &'static str {
        self.engine.backend_name()
    }

    /// Cancel running executions; they are recorded as cancelled.
    pub fn shutdown(&self) {
        self.engine.shutdown();
    }

    /// Validate and save a task. An existing id updates that task in place.
    pub async fn create_task(&self, task: Task) -> Result<Task, TaskError> {
        if let Err(e) = validate_task(&task) {
            tracing::warn!(name = %task.name, "Rejected task: {}", e);
            return Err(e);
        }
        let saved = self
            .store
            .save(task)
            .await
            .map_err(TaskError::Persistence)?;
        tracing::info!(task_id = %saved.id_str(), name = %saved.name, "Task saved");
        Ok(saved)
    }

    pub async fn get_task(&self, id: &str) -> Result<Task, TaskError> {
        self.store
            .find_by_id(id)
            .await
            .map_err(TaskError::Persistence)?
            .ok_or_else(|| TaskError::NotFound(id.to_string()))
    }

    pub async fn list_tasks(&self) -> Result<Vec<Task>, TaskError> {
        self.store.find_all().await.map_err(TaskError::Persistence)
    }

    /// Tasks whose name contains `query`, ignoring case. May be empty.
    pub async fn search_by_name(&self, query: &str) -> Result<Vec<Task>, TaskError> {
        self.store
            .find_by_name_contains(query.trim())
            .await
            .map_err(TaskError::Persistence)
    }

    pub async fn delete_task(&self, id: &str) -> Result<(), TaskError> {
        if !self
            .store
            .delete_by_id(id)
            .await
            .map_err(TaskError::Persistence)?
        {
            return Err(TaskError::NotFound(id.to_string()));
        }
        tracing::info!(task_id = %id, "Task deleted");
        Ok(())
    }

    pub async fn execute_task(&self, id: &str) -> Result<TaskExecution, TaskError> {
        Ok(self.engine.execute(id).await?)
    }
}
