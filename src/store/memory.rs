//! In-memory task store (non-persistent).

use super::{merge_for_save, name_matches, sort_oldest_first, TaskStore};
use crate::task::Task;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Clone)]
pub struct InMemoryTaskStore {
    tasks: Arc<RwLock<HashMap<String, Task>>>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self {
            tasks: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

impl Default for InMemoryTaskStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    fn is_persistent(&self) -> bool {
        false
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
        tasks.insert(merged.id_str().to_string(), merged.clone());
        Ok(merged)
    }

    async fn delete_by_id(&self, id: &str) -> Result<bool, String> {
        Ok(self.tasks.write().await.remove(id).is_some())
    }
}
