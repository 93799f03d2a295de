//! Task storage module with pluggable backends.
//!
//! Supports:
//! - `memory`: In-memory storage (non-persistent, for testing)
//! - `file`: JSON snapshot file
//! - `sqlite`: SQLite database with one row per execution

mod file;
mod memory;
mod sqlite;

pub use file::FileTaskStore;
pub use memory::InMemoryTaskStore;
pub use sqlite::SqliteTaskStore;

use async_trait::async_trait;
use chrono::Utc;
use std::path::PathBuf;
use uuid::Uuid;

use crate::task::Task;

/// Task store trait - implemented by all storage backends.
///
/// Errors are plain strings; callers decide how to classify them.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Whether this store persists data across restarts.
    fn is_persistent(&self) -> bool;

    /// Get a single task by ID.
    async fn find_by_id(&self, id: &str) -> Result<Option<Task>, String>;

    /// List all tasks, oldest first.
    async fn find_all(&self) -> Result<Vec<Task>, String>;

    /// Tasks whose name contains `needle`, ignoring case.
    async fn find_by_name_contains(&self, needle: &str) -> Result<Vec<Task>, String>;

    /// Insert or replace a task, assigning an id on first save.
    ///
    /// Executions already stored for the task are kept; executions beyond
    /// them are appended.
    async fn save(&self, task: Task) -> Result<Task, String>;

    /// Delete a task and its history. Returns whether it existed.
    async fn delete_by_id(&self, id: &str) -> Result<bool, String>;
}

/// Task store type selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TaskStoreType {
    Memory,
    File,
    #[default]
    Sqlite,
}

impl TaskStoreType {
    /// Parse from environment variable value.
    pub fn from_str(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "memory" => Self::Memory,
            "file" | "json" => Self::File,
            "sqlite" | "db" => Self::Sqlite,
            _ => Self::default(),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::File => "file",
            Self::Sqlite => "sqlite",
        }
    }
}

/// Create a task store based on type and configuration.
pub async fn create_task_store(
    store_type: TaskStoreType,
    base_dir: PathBuf,
) -> Result<Box<dyn TaskStore>, String> {
    match store_type {
        TaskStoreType::Memory => Ok(Box::new(InMemoryTaskStore::new())),
        TaskStoreType::File => {
            let store = FileTaskStore::new(base_dir).await?;
            Ok(Box::new(store))
        }
        TaskStoreType::Sqlite => {
            let store = SqliteTaskStore::new(base_dir).await?;
            Ok(Box::new(store))
        }
    }
}

/// Fill in the id and creation time of a task that has never been saved.
pub(crate) fn assign_identity(task: &mut Task) {
    if task.id.as_deref().map_or(true, |id| id.trim().is_empty()) {
        task.id = Some(Uuid::new_v4().to_string());
    }
    if task.created_at.is_none() {
        task.created_at = Some(Utc::now());
    }
}

/// Merge an incoming save onto the stored version of the same task.
///
/// History is append-only: the stored executions stay in place and only the
/// incoming executions past their count are added.
pub(crate) fn merge_for_save(existing: Option<&Task>, mut incoming: Task) -> Task {
    if let Some(existing) = existing {
        let stored = existing.task_executions.len();
        let mut executions = existing.task_executions.clone();
        executions.extend(incoming.task_executions.into_iter().skip(stored));
        incoming.task_executions = executions;
        incoming.created_at = existing.created_at.or(incoming.created_at);
    }
    assign_identity(&mut incoming);
    incoming
}

pub(crate) fn name_matches(name: &str, needle: &str) -> bool {
    name.to_lowercase().contains(&needle.to_lowercase())
}

pub(crate) fn sort_oldest_first(tasks: &mut [Task]) {
    tasks.sort_by(|a, b| {
        a.created_at
            .cmp(&b.created_at)
            .then_with(|| a.id.cmp(&b.id))
    });
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::task::TaskExecution;

    /// Behavior every backend must share.
    pub(crate) async fn exercise_store(store: &dyn TaskStore) {
        let created = store
            .save(Task::new("Print Hello", "alice", "echo hello"))
            .await
            .expect("save");
        let id = created.id.clone().expect("id assigned");
        assert!(created.created_at.is_some());

        let fetched = store.find_by_id(&id).await.unwrap().expect("found");
        assert_eq!(fetched.name, "Print Hello");
        assert_eq!(fetched.owner, "alice");
        assert_eq!(fetched.command, "echo hello");
        assert!(fetched.task_executions.is_empty());

        // Read path is idempotent.
        let again = store.find_by_id(&id).await.unwrap().expect("found");
        assert_eq!(fetched, again);

        store
            .save(Task::new("List files", "bob", "ls"))
            .await
            .expect("save");

        let all = store.find_all().await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].name, "Print Hello");

        let hits = store.find_by_name_contains("HELLO").await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id.as_deref(), Some(id.as_str()));
        assert!(store.find_by_name_contains("zzz").await.unwrap().is_empty());

        // Append an execution and persist.
        let mut task = fetched;
        let now = Utc::now();
        task.record_execution(TaskExecution::new(now, now, "hello".to_string()));
        store.save(task.clone()).await.expect("save execution");
        task.record_execution(TaskExecution::new(now, now, "hello again".to_string()));
        store.save(task).await.expect("save second execution");

        let stored = store.find_by_id(&id).await.unwrap().expect("found");
        assert_eq!(stored.task_executions.len(), 2);
        assert_eq!(stored.task_executions[0].output, "hello");
        assert_eq!(stored.task_executions[1].output, "hello again");

        assert!(store.delete_by_id(&id).await.unwrap());
        assert!(!store.delete_by_id(&id).await.unwrap());
        assert!(store.find_by_id(&id).await.unwrap().is_none());
        assert_eq!(store.find_all().await.unwrap().len(), 1);
    }

    /// A stale copy of a task must not drop executions stored meanwhile.
    pub(crate) async fn exercise_append_only(store: &dyn TaskStore) {
        let task = store
            .save(Task::new("t", "o", "date"))
            .await
            .expect("save");
        let id = task.id.clone().unwrap();
        let stale = task.clone();

        let mut fresh = task;
        let now = Utc::now();
        fresh.record_execution(TaskExecution::new(now, now, "one".to_string()));
        store.save(fresh).await.unwrap();

        let mut renamed = stale;
        renamed.name = "renamed".to_string();
        store.save(renamed).await.unwrap();

        let stored = store.find_by_id(&id).await.unwrap().unwrap();
        assert_eq!(stored.name, "renamed");
        assert_eq!(stored.task_executions.len(), 1);
    }

    #[test]
    fn store_type_parsing() {
        assert_eq!(TaskStoreType::from_str("memory"), TaskStoreType::Memory);
        assert_eq!(TaskStoreType::from_str("JSON"), TaskStoreType::File);
        assert_eq!(TaskStoreType::from_str("db"), TaskStoreType::Sqlite);
        assert_eq!(TaskStoreType::from_str("bogus"), TaskStoreType::Sqlite);
    }

    #[test]
    fn merge_keeps_stored_history() {
        let now = Utc::now();
        let mut existing = Task::new("a", "o", "date");
        existing.id = Some("x".to_string());
        existing.created_at = Some(now);
        existing.record_execution(TaskExecution::new(now, now, "kept".to_string()));

        let mut incoming = Task::new("b", "o", "date");
        incoming.id = Some("x".to_string());
        let merged = merge_for_save(Some(&existing), incoming);

        assert_eq!(merged.name, "b");
        assert_eq!(merged.task_executions.len(), 1);
        assert_eq!(merged.created_at, Some(now));
    }

    #[test]
    fn blank_id_is_replaced() {
        let mut task = Task::new("a", "o", "date");
        task.id = Some("  ".to_string());
        assign_identity(&mut task);
        assert_ne!(task.id.as_deref(), Some("  "));
    }
}
