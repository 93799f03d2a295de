//! Task endpoints.
//!
//! Errors are plain-text bodies:
//! - validation failures are 400 `Validation error: <reason>`
//! - unknown ids are 404 `Task not found with id: <id>`
//! - everything else is 500 with an operation-specific prefix

use std::sync::Arc;

use axum::{
    extract::{Path as AxumPath, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{delete, get, put},
    Router,
};

use super::routes::AppState;
use super::types::{SearchQuery, TaskQuery, TaskRequest};
use crate::service::TaskError;
use crate::task::{Task, TaskExecution};

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(get_tasks).put(put_task))
        .route("/search", get(search_tasks))
        .route("/:id", delete(delete_task))
        .route("/:id/execute", put(execute_task))
}

fn error_response(err: TaskError, context: &str) -> (StatusCode, String) {
    match err {
        TaskError::Validation(reason) => (
            StatusCode::BAD_REQUEST,
            format!("Validation error: {}", reason),
        ),
        e @ TaskError::NotFound(_) => (StatusCode::NOT_FOUND, e.to_string()),
        e => {
            tracing::error!("{}: {}", context, e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("{}: {}", context, e),
            )
        }
    }
}

/// GET /tasks - List all tasks, or one task with `?id=`.
pub async fn get_tasks(
    State(state): State<Arc<AppState>>,
    Query(query): Query<TaskQuery>,
) -> Result<Response, (StatusCode, String)> {
    match query.id.as_deref().map(str::trim).filter(|id| !id.is_empty()) {
        Some(id) => state
            .service
            .get_task(id)
            .await
            .map(|task| Json(task).into_response())
            .map_err(|e| error_response(e, "Error retrieving tasks")),
        None => state
            .service
            .list_tasks()
            .await
            .map(|tasks| Json(tasks).into_response())
            .map_err(|e| error_response(e, "Error retrieving tasks")),
    }
}

/// PUT /tasks - Create a task, or update it when the body carries an id.
pub async fn put_task(
    State(state): State<Arc<AppState>>,
    Json(req): Json<TaskRequest>,
) -> Result<(StatusCode, Json<Task>), (StatusCode, String)> {
    let task = state
        .service
        .create_task(req.into_task())
        .await
        .map_err(|e| error_response(e, "Error creating task"))?;
    Ok((StatusCode::CREATED, Json(task)))
}

/// DELETE /tasks/:id
pub async fn delete_task(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
) -> Result<&'static str, (StatusCode, String)> {
    state
        .service
        .delete_task(&id)
        .await
        .map_err(|e| error_response(e, "Error deleting task"))?;
    Ok("Task deleted successfully")
}

/// GET /tasks/search?name= - Case-insensitive substring match on the name.
pub async fn search_tasks(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SearchQuery>,
) -> Result<Json<Vec<Task>>, (StatusCode, String)> {
    let name = query.name.unwrap_or_default();
    if name.trim().is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            "Search name parameter is required".to_string(),
        ));
    }

    let tasks = state
        .service
        .search_by_name(&name)
        .await
        .map_err(|e| error_response(e, "Error searching tasks"))?;
    if tasks.is_empty() {
        return Err((
            StatusCode::NOT_FOUND,
            format!("No tasks found with name containing: {}", name),
        ));
    }
    Ok(Json(tasks))
}

/// PUT /tasks/:id/execute - Run the task once and return the new execution.
pub async fn execute_task(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
) -> Result<Json<TaskExecution>, (StatusCode, String)> {
    state
        .service
        .execute_task(&id)
        .await
        .map(Json)
        .map_err(|e| error_response(e, "Error executing task"))
}
