//! API request and response types.

use serde::{Deserialize, Serialize};

use crate::task::Task;

/// Body of `PUT /tasks`.
///
/// Missing fields default to empty so they fail validation with a message
/// instead of a deserialization error.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TaskRequest {
    /// Present when updating an existing task
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub owner: String,
    #[serde(default)]
    pub command: String,
}

impl TaskRequest {
    pub fn into_task(self) -> Task {
        let mut task = Task::new(self.name, self.owner, self.command);
        task.id = self.id.filter(|id| !id.trim().is_empty());
        task
    }
}

/// Query of `GET /tasks`.
#[derive(Debug, Default, Deserialize)]
pub struct TaskQuery {
    pub id: Option<String>,
}

/// Query of `GET /tasks/search`.
#[derive(Debug, Default, Deserialize)]
pub struct SearchQuery {
    pub name: Option<String>,
}

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// Service status
    pub status: String,

    /// Service version
    pub version: String,

    /// `kubernetes` or `local`
    pub backend: String,

    /// Whether tasks survive a restart
    pub store_persistent: bool,
}
