//! HTTP API for the task runner.
//!
//! ## Endpoints
//!
//! - `GET /health` - Health check
//! - `GET /tasks` - List tasks, or get one with `?id=`
//! - `PUT /tasks` - Create or update a task
//! - `DELETE /tasks/{id}` - Delete a task
//! - `GET /tasks/search?name=` - Find tasks by name
//! - `PUT /tasks/{id}/execute` - Run a task and record the execution

mod routes;
pub mod tasks;
pub mod types;

pub use routes::{router, serve, AppState};
pub use types::*;
