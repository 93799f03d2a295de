//! # task-runner
//!
//! Stores named shell commands and runs them on demand, recording every
//! attempt with its timing and output.
//!
//! ## Architecture
//!
//! ```text
//!   HTTP (api) ──▶ TaskService ──▶ validator
//!                      │
//!                      ▼
//!               ExecutionEngine ──▶ TaskStore (memory | file | sqlite)
//!                      │
//!                      ▼
//!          ExecutionBackend (fixed at startup)
//!            ├─ PodBackend ──▶ Kubernetes API (kube)
//!            └─ LocalProcessBackend ──▶ sh -c
//! ```
//!
//! ## Modules
//! - `validator`: denylist and shell-syntax checks on commands
//! - `engine`: runs a task once and appends the attempt to its history
//! - `executor`: pod and local-process backends
//! - `kube`: minimal Kubernetes REST client
//! - `store`: pluggable task persistence

pub mod api;
pub mod config;
pub mod engine;
pub mod executor;
pub mod kube;
pub mod service;
pub mod store;
pub mod task;
pub mod util;
pub mod validator;

pub use config::Config;
pub use engine::{EngineError, ExecutionEngine};
pub use service::{TaskError, TaskService};
pub use task::{Task, TaskExecution};
