//! JSON file-based task store.

use super::{merge_for_save, name_matches, sort_oldest_first, TaskStore};
use crate::task::Task;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs;
use tokio::sync::RwLock;

#[derive(Debug, Serialize, Deserialize, Default)]
struct TaskStoreSnapshot {
    tasks: HashMap<String, Task>,
}

#[derive(Serialize)]
struct TaskStoreSnapshotRef<'a> {
    tasks: &'a HashMap<String, Task>,
}

#[derive(Clone)]
pub struct FileTaskStore {
    path: PathBuf,
    tasks: Arc<RwLock<HashMap<String, Task>>>,
}

impl FileTaskStore {
    pub async fn new(base_dir: PathBuf) -> Result<Self, String> {
        fs::create_dir_all(&base_dir)
            .await
            .map_err(|e| format!("Failed to create task store dir: {}", e))?;
        let path = base_dir.join("tasks.json");
        let snapshot = match fs::read(&path).await {
            Ok(bytes) => match serde_json::from_slice::<TaskStoreSnapshot>(&bytes) {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    tracing::warn!("Failed to parse task store {}: {}", path.display(), e);
                    TaskStoreSnapshot::default()
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => TaskStoreSnapshot::default(),
            Err(err) => {
                tracing::warn!("Failed to read task store {}: {}", path.display(), err);
                TaskStoreSnapshot::default()
            }
        };
        tracing::debug!(
            path = %path.display(),
            tasks = snapshot.tasks.len(),
            "Loaded task store"
        );

        Ok(Self {
            path,
            tasks: Arc::new(RwLock::new(snapshot.tasks)),
        })
    }

    /// Write `tasks` to disk. Callers hold the write lock so the file and the
    /// map change together.
    async fn persist(&self, tasks: &HashMap<String, Task>) -> Result<(), String> {
        let snapshot = TaskStoreSnapshotRef { tasks };
        let data = serde_json::to_vec_pretty(&snapshot)
            .map_err(|e| format!("Failed to serialize task store: {}", e))?;
        let tmp_path = self.path.with_extension("json.tmp");
        fs::write(&tmp_path, data)
            .await
            .map_err(|e| format!("Failed to write task store: {}", e))?;
        fs::rename(&tmp_path, &self.path)
            .await
            .map_err(|e| format!("Failed to finalize task store: {}", e))?;
        Ok(())
    }
}

/// Undo an in-memory change after a failed write.
fn restore(tasks: &mut HashMap<String, Task>, id: String, previous: Option<Task>) {
    match previous {
        Some(task) => {
            tasks.insert(id, task);
        }
        None => {
            tasks.remove(&id);
        }
    }
}

#[async_trait]
impl TaskStore for FileTaskStore {
    fn is_persistent(&self) -> bool {
        true
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<Task>, String> {
        Ok(self.tasks.read().await.get(id).cloned())
    }

    async fn find_all(&self) -> Result<Vec<Task>, String> {
        let mut tasks: Vec<Task> = self.tasks.read().await.values().cloned().collect();
        sort_oldest_first(&mut tasks);
        Ok(tasks)
    }

    async fn find_by_name_contains(&self, needle: &str) -> Result<Vec<Task>, String> {
        let mut tasks: Vec<Task> = self
            .tasks
            .read()
            .await
            .values()
            .filter(|t| name_matches(&t.name, needle))
            .cloned()
            .collect();
        sort_oldest_first(&mut tasks);
        Ok(tasks)
    }

    async fn save(&self, task: Task) -> Result<Task, String> {
        let mut tasks = self.tasks.write().await;
        let existing = task.id.as_deref().and_then(|id| tasks.get(id));
        let merged = merge_for_save(existing, task);
        let id = merged.id_str().to_string();
        let previous = tasks.insert(id.clone(), merged.clone());
        if let Err(e) = self.persist(&tasks).await {
            restore(&mut tasks, id, previous);
            return Err(e);
        }
        Ok(merged)
    }

    async fn delete_by_id(&self, id: &str) -> Result<bool, String> {
        let mut tasks = self.tasks.write().await;
        let Some(removed) = tasks.remove(id) else {
            return Ok(false);
        };
        if let Err(e) = self.persist(&tasks).await {
            tasks.insert(id.to_string(), removed);
            return Err(e);
        }
        Ok(true)
    }
}
