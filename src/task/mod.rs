//! Task module - the task record and its execution history.

pub mod task;

pub use task::{Task, TaskExecution};
