//! Task record and its execution history.
//!
//! # Invariants
//! - A stored task always has an `id` and a command that passed validation
//! - `task_executions` is append-only; index order is execution order
//! - A `TaskExecution` is only constructed once its attempt has concluded,
//!   so `end_time` and `output` are always set

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A named shell command owned by someone, plus every attempt to run it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    /// Assigned by the store on first save
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    pub owner: String,
    pub command: String,
    #[serde(default)]
    pub task_executions: Vec<TaskExecution>,
    /// Set by the store on first save
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Create an unsaved task with an empty history.
    pub fn new(
        name: impl Into<String>,
        owner: impl Into<String>,
        command: impl Into<String>,
    ) -> Self {
        Self {
            id: None,
            name: name.into(),
            owner: owner.into(),
            command: command.into(),
            task_executions: Vec::new(),
            created_at: None,
        }
    }

    /// The store-assigned id, or an empty string for an unsaved task.
    pub fn id_str(&self) -> &str {
        self.id.as_deref().unwrap_or("")
    }

    /// Append a concluded attempt.
    pub fn record_execution(&mut self, execution: TaskExecution) {
        self.task_executions.push(execution);
    }

    pub fn last_execution(&self) -> Option<&TaskExecution> {
        self.task_executions.last()
    }
}

/// One timed attempt to run a task's command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskExecution {
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    /// Captured output on success, a failure description otherwise
    pub output: String,
}

impl TaskExecution {
    pub fn new(start_time: DateTime<Utc>, end_time: DateTime<Utc>, output: String) -> Self {
        Self {
            start_time,
            end_time,
            output,
        }
    }

    pub fn duration(&self) -> chrono::Duration {
        self.end_time - self.start_time
    }
}
