//! SQLite-based task store.

use super::{merge_for_save, TaskStore};
use crate::task::{Task, TaskExecution};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::functions::FunctionFlags;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;

const SCHEMA: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS tasks (
    id TEXT PRIMARY KEY NOT NULL,
    name TEXT NOT NULL,
    owner TEXT NOT NULL,
    command TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_tasks_created_at ON tasks(created_at);

CREATE TABLE IF NOT EXISTS task_executions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    task_id TEXT NOT NULL,
    sequence INTEGER NOT NULL,
    start_time TEXT NOT NULL,
    end_time TEXT NOT NULL,
    output TEXT NOT NULL,
    FOREIGN KEY (task_id) REFERENCES tasks(id) ON DELETE CASCADE
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_executions_task ON task_executions(task_id, sequence);
"#;

const TASK_COLUMNS: &str = "id, name, owner, command, created_at";

pub struct SqliteTaskStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteTaskStore {
    pub async fn new(base_dir: PathBuf) -> Result<Self, String> {
        let db_path = base_dir.join("tasks.db");

        tokio::fs::create_dir_all(&base_dir)
            .await
            .map_err(|e| format!("Failed to create task store dir: {}", e))?;

        let conn = tokio::task::spawn_blocking(move || Self::open(&db_path))
            .await
            .map_err(|e| format!("Task join error: {}", e))??;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory database (for tests).
    pub fn in_memory() -> Result<Self, String> {
        let conn = Connection::open_in_memory()
            .map_err(|e| format!("Failed to open SQLite database: {}", e))?;
        Self::prepare(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn open(db_path: &std::path::Path) -> Result<Connection, String> {
        let conn = Connection::open(db_path)
            .map_err(|e| format!("Failed to open SQLite database: {}", e))?;
        Self::prepare(&conn)?;
        tracing::debug!(path = %db_path.display(), "Opened task database");
        Ok(conn)
    }

    /// Schema plus `unicode_lower()`, since SQLite's own `lower()` and
    /// `LIKE` only fold ASCII.
    fn prepare(conn: &Connection) -> Result<(), String> {
        conn.execute_batch(SCHEMA)
            .map_err(|e| format!("Failed to run schema: {}", e))?;
        conn.create_scalar_function(
            "unicode_lower",
            1,
            FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
            |ctx| {
                let value: String = ctx.get(0)?;
                Ok(value.to_lowercase())
            },
        )
        .map_err(|e| format!("Failed to register unicode_lower: {}", e))
    }

    fn load_executions(conn: &Connection, task_id: &str) -> Result<Vec<TaskExecution>, String> {
        let mut stmt = conn
            .prepare(
                "SELECT start_time, end_time, output FROM task_executions
                 WHERE task_id = ?1 ORDER BY sequence ASC",
            )
            .map_err(|e| e.to_string())?;
        let rows = stmt
            .query_map(params![task_id], |row| {
                let start: String = row.get(0)?;
                let end: String = row.get(1)?;
                Ok(TaskExecution {
                    start_time: parse_time(&start),
                    end_time: parse_time(&end),
                    output: row.get(2)?,
                })
            })
            .map_err(|e| e.to_string())?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| e.to_string())?;
        Ok(rows)
    }

    /// Run a task query and attach each task's executions.
    fn query_tasks(
        conn: &Connection,
        sql: &str,
        args: &[&dyn rusqlite::ToSql],
    ) -> Result<Vec<Task>, String> {
        let mut stmt = conn.prepare(sql).map_err(|e| e.to_string())?;
        let mut tasks = stmt
            .query_map(args, row_to_task)
            .map_err(|e| e.to_string())?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| e.to_string())?;
        for task in &mut tasks {
            task.task_executions = Self::load_executions(conn, task.id_str())?;
        }
        Ok(tasks)
    }

    fn load_task(conn: &Connection, id: &str) -> Result<Option<Task>, String> {
        let task = conn
            .query_row(
                &format!("SELECT {} FROM tasks WHERE id = ?1", TASK_COLUMNS),
                params![id],
                row_to_task,
            )
            .optional()
            .map_err(|e| e.to_string())?;
        match task {
            Some(mut task) => {
                task.task_executions = Self::load_executions(conn, id)?;
                Ok(Some(task))
            }
            None => Ok(None),
        }
    }
}

fn row_to_task(row: &rusqlite::Row<'_>) -> rusqlite::Result<Task> {
    let created_at: String = row.get(4)?;
    Ok(Task {
        id: Some(row.get(0)?),
        name: row.get(1)?,
        owner: row.get(2)?,
        command: row.get(3)?,
        task_executions: Vec::new(),
        created_at: Some(parse_time(&created_at)),
    })
}

fn format_time(time: &DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_time(value: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(|e| {
            tracing::warn!("Invalid timestamp '{}' in task store: {}", value, e);
            DateTime::<Utc>::default()
        })
}

#[async_trait]
impl TaskStore for SqliteTaskStore {
    fn is_persistent(&self) -> bool {
        true
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<Task>, String> {
        let conn = self.conn.clone();
        let id = id.to_string();
        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            Self::load_task(&conn, &id)
        })
        .await
        .map_err(|e| e.to_string())?
    }

    async fn find_all(&self) -> Result<Vec<Task>, String> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            Self::query_tasks(
                &conn,
                &format!(
                    "SELECT {} FROM tasks ORDER BY created_at ASC, id ASC",
                    TASK_COLUMNS
                ),
                params![],
            )
        })
        .await
        .map_err(|e| e.to_string())?
    }

    async fn find_by_name_contains(&self, needle: &str) -> Result<Vec<Task>, String> {
        let conn = self.conn.clone();
        let needle = needle.to_lowercase();
        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            Self::query_tasks(
                &conn,
                &format!(
                    "SELECT {} FROM tasks
                     WHERE instr(unicode_lower(name), ?1) > 0
                     ORDER BY created_at ASC, id ASC",
                    TASK_COLUMNS
                ),
                params![needle],
            )
        })
        .await
        .map_err(|e| e.to_string())?
    }

    async fn save(&self, task: Task) -> Result<Task, String> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.blocking_lock();
            let tx = conn.transaction().map_err(|e| e.to_string())?;

            let existing = match task.id.as_deref() {
                Some(id) if !id.trim().is_empty() => Self::load_task(&tx, id)?,
                _ => None,
            };
            let stored_count = existing
                .as_ref()
                .map(|t| t.task_executions.len())
                .unwrap_or(0);
            let merged = merge_for_save(existing.as_ref(), task);
            let created_at = merged.created_at.unwrap_or_else(Utc::now);

            tx.execute(
                "INSERT INTO tasks (id, name, owner, command, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(id) DO UPDATE SET
                     name = excluded.name,
                     owner = excluded.owner,
                     command = excluded.command",
                params![
                    merged.id_str(),
                    merged.name,
                    merged.owner,
                    merged.command,
                    format_time(&created_at),
                ],
            )
            .map_err(|e| format!("Failed to save task: {}", e))?;

            for (sequence, execution) in merged
                .task_executions
                .iter()
                .enumerate()
                .skip(stored_count)
            {
                tx.execute(
                    "INSERT INTO task_executions (task_id, sequence, start_time, end_time, output)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        merged.id_str(),
                        sequence as i64,
                        format_time(&execution.start_time),
                        format_time(&execution.end_time),
                        execution.output,
                    ],
                )
                .map_err(|e| format!("Failed to save task execution: {}", e))?;
            }

            tx.commit().map_err(|e| e.to_string())?;
            Ok(merged)
        })
        .await
        .map_err(|e| e.to_string())?
    }

    async fn delete_by_id(&self, id: &str) -> Result<bool, String> {
        let conn = self.conn.clone();
        let id = id.to_string();
        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            let deleted = conn
                .execute("DELETE FROM tasks WHERE id = ?1", params![id])
                .map_err(|e| e.to_string())?;
            Ok(deleted > 0)
        })
        .await
        .map_err(|e| e.to_string())?
    }
}
