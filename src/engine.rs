//! Task execution engine.
//!
//! `execute` is the single place where an attempt is recorded:
//! look up the task, run it on the startup-selected backend, append exactly
//! one [`TaskExecution`], save once, then surface the backend's error if any.
//! Executions of the same task are serialized; different tasks run in parallel.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Instant;

use chrono::Utc;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::executor::{BackendRef, ExecError};
use crate::store::TaskStore;
use crate::task::{Task, TaskExecution};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Task not found with id: {0}")]
    NotFound(String),

    #[error(transparent)]
    Execution(#[from] ExecError),

    #[error("Failed to save task: {0}")]
    Persistence(String),

    #[error("Execution task aborted: {0}")]
    Aborted(String),
}

/// Per-task mutual exclusion.
///
/// Entries exist only while some request holds or waits for them.
#[derive(Default)]
pub struct TaskLocks {
    inner: Arc<StdMutex<HashMap<String, Arc<Semaphore>>>>,
}

/// Held for the duration of one execution.
pub struct TaskLockGuard {
    key: String,
    locks: Arc<StdMutex<HashMap<String, Arc<Semaphore>>>>,
    _permit: OwnedSemaphorePermit,
}

impl TaskLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, task_id: &str) -> TaskLockGuard {
        let semaphore = {
            let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            map.entry(task_id.to_string())
                .or_insert_with(|| Arc::new(Semaphore::new(1)))
                .clone()
        };
        let permit = semaphore
            .acquire_owned()
            .await
            .expect("task lock semaphore is never closed");
        TaskLockGuard {
            key: task_id.to_string(),
            locks: Arc::clone(&self.inner),
            _permit: permit,
        }
    }

    /// Number of tasks currently locked or awaited.
    pub fn active(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

impl Drop for TaskLockGuard {
    fn drop(&mut self) {
        let mut map = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        // Map entry plus our permit: nobody else is waiting.
        if map
            .get(&self.key)
            .is_some_and(|sem| Arc::strong_count(sem) <= 2)
        {
            map.remove(&self.key);
        }
    }
}

pub struct ExecutionEngine {
    store: Arc<dyn TaskStore>,
    backend: BackendRef,
    locks: TaskLocks,
    shutdown: CancellationToken,
}

impl ExecutionEngine {
    pub fn new(store: Arc<dyn TaskStore>, backend: BackendRef) -> Self {
        Self {
            store,
            backend,
            locks: TaskLocks::new(),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Stop every running attempt. Each is still recorded, as cancelled.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Run a task once and record the attempt.
    ///
    /// Unknown ids fail before anything runs. Once the backend has been
    /// invoked, the attempt is appended and saved even if the backend failed;
    /// the backend error is returned afterwards.
    ///
    /// The attempt runs on its own tokio task: dropping the returned future
    /// does not stop it, and it is still recorded. Only [`shutdown`] cancels it.
    ///
    /// [`shutdown`]: ExecutionEngine::shutdown
    pub async fn execute(&self, task_id: &str) -> Result<TaskExecution, EngineError> {
        let guard = self.locks.acquire(task_id).await;

        let task = self
            .store
            .find_by_id(task_id)
            .await
            .map_err(EngineError::Persistence)?
            .ok_or_else(|| EngineError::NotFound(task_id.to_string()))?;

        let attempt = tokio::spawn(run_attempt(
            Arc::clone(&self.store),
            Arc::clone(&self.backend),
            task,
            self.shutdown.child_token(),
            guard,
        ));
        attempt.await.map_err(|e| {
            tracing::error!(task_id = %task_id, "Execution task aborted: {}", e);
            EngineError::Aborted(e.to_string())
        })?
    }
}

/// Run on the backend, append the outcome, save once.
async fn run_attempt(
    store: Arc<dyn TaskStore>,
    backend: BackendRef,
    mut task: Task,
    cancel: CancellationToken,
    _guard: TaskLockGuard,
) -> Result<TaskExecution, EngineError> {
    let task_id = task.id_str().to_string();
    let backend_name = backend.name();
    tracing::info!(task_id = %task_id, backend = backend_name, "Executing task");

    let started = Instant::now();
    let start_time = Utc::now();
    let result = backend.run(&task, &cancel).await;
    let end_time = Utc::now();
    let elapsed_ms = started.elapsed().as_millis() as u64;

    let output = match &result {
        Ok(output) => {
            tracing::info!(
                task_id = %task_id,
                backend = backend_name,
                elapsed_ms,
                "Task execution completed"
            );
            output.clone()
        }
        Err(e) => {
            tracing::error!(
                task_id = %task_id,
                backend = backend_name,
                elapsed_ms,
                timed_out = e.is_timeout(),
                "Task execution failed: {}",
                e
            );
            e.failure_output()
        }
    };

    let execution = TaskExecution::new(start_time, end_time, output);
    task.record_execution(execution.clone());
    store.save(task).await.map_err(|e| {
        tracing::error!(task_id = %task_id, "Failed to persist task execution: {}", e);
        EngineError::Persistence(e)
    })?;

    result?;
    Ok(execution)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{ExecutionBackend, LocalProcessBackend};
    use crate::store::InMemoryTaskStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct FailingBackend;

    #[async_trait]
    impl ExecutionBackend for FailingBackend {
        fn name(&self) -> &'static str {
            "failing"
        }

        async fn run(&self, _task: &Task, _cancel: &CancellationToken) -> Result<String, ExecError> {
            Err(ExecError::Orchestrator("connection refused".to_string()))
        }
    }

    /// Counts concurrent runs and remembers the peak.
    #[derive(Default)]
    struct SlowBackend {
        running: AtomicUsize,
        peak: AtomicUsize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ExecutionBackend for SlowBackend {
        fn name(&self) -> &'static str {
            "slow"
        }

        async fn run(&self, _task: &Task, _cancel: &CancellationToken) -> Result<String, ExecError> {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            self.running.fetch_sub(1, Ordering::SeqCst);
            Ok("done".to_string())
        }
    }

    /// Store whose saves always fail.
    struct ReadOnlyStore {
        inner: InMemoryTaskStore,
    }

    #[async_trait]
    impl TaskStore for ReadOnlyStore {
        fn is_persistent(&self) -> bool {
            false
        }
        async fn find_by_id(&self, id: &str) -> Result<Option<Task>, String> {
            self.inner.find_by_id(id).await
        }
        async fn find_all(&self) -> Result<Vec<Task>, String> {
            self.inner.find_all().await
        }
        async fn find_by_name_contains(&self, needle: &str) -> Result<Vec<Task>, String> {
            self.inner.find_by_name_contains(needle).await
        }
        async fn save(&self, _task: Task) -> Result<Task, String> {
            Err("disk full".to_string())
        }
        async fn delete_by_id(&self, id: &str) -> Result<bool, String> {
            self.inner.delete_by_id(id).await
        }
    }

    async fn seeded(command: &str) -> (Arc<dyn TaskStore>, String) {
        let store: Arc<dyn TaskStore> = Arc::new(InMemoryTaskStore::new());
        let task = store.save(Task::new("t", "o", command)).await.unwrap();
        let id = task.id.unwrap();
        (store, id)
    }

    #[tokio::test]
    async fn successful_run_appends_one_execution() {
        let (store, id) = seeded("echo hello").await;
        let engine = ExecutionEngine::new(store.clone(), Arc::new(LocalProcessBackend::new()));

        let execution = engine.execute(&id).await.unwrap();
        assert_eq!(execution.output, "hello");
        assert!(execution.end_time >= execution.start_time);

        let task = store.find_by_id(&id).await.unwrap().unwrap();
        assert_eq!(task.task_executions, vec![execution]);
    }

    #[tokio::test]
    async fn execute_is_not_idempotent() {
        let (store, id) = seeded("echo again").await;
        let engine = ExecutionEngine::new(store.clone(), Arc::new(LocalProcessBackend::new()));

        engine.execute(&id).await.unwrap();
        engine.execute(&id).await.unwrap();

        let task = store.find_by_id(&id).await.unwrap().unwrap();
        assert_eq!(task.task_executions.len(), 2);
    }

    #[tokio::test]
    async fn unknown_task_runs_nothing() {
        let store: Arc<dyn TaskStore> = Arc::new(InMemoryTaskStore::new());
        let backend = Arc::new(SlowBackend::default());
        let engine = ExecutionEngine::new(store.clone(), backend.clone());

        let err = engine.execute("missing").await.unwrap_err();
        assert!(matches!(err, EngineError::NotFound(ref id) if id == "missing"));
        assert_eq!(backend.calls.load(Ordering::SeqCst), 0);
        assert!(store.find_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn backend_failure_is_recorded_then_returned() {
        let (store, id) = seeded("date").await;
        let engine = ExecutionEngine::new(store.clone(), Arc::new(FailingBackend));

        let err = engine.execute(&id).await.unwrap_err();
        assert!(matches!(err, EngineError::Execution(ExecError::Orchestrator(_))));

        let task = store.find_by_id(&id).await.unwrap().unwrap();
        assert_eq!(task.task_executions.len(), 1);
        assert_eq!(
            task.task_executions[0].output,
            "Execution failed: Kubernetes execution failed: connection refused"
        );
    }

    #[tokio::test]
    async fn timeout_is_recorded_with_end_time() {
        let (store, id) = seeded("sleep 5").await;
        let backend = LocalProcessBackend::with_timeout(Duration::from_millis(200));
        let engine = ExecutionEngine::new(store.clone(), Arc::new(backend));

        let err = engine.execute(&id).await.unwrap_err();
        assert!(matches!(err, EngineError::Execution(ref e) if e.is_timeout()));

        let task = store.find_by_id(&id).await.unwrap().unwrap();
        let execution = task.last_execution().unwrap();
        assert!(execution.output.contains("timeout"));
        assert!(execution.end_time > execution.start_time);
    }

    #[tokio::test]
    async fn persistence_failure_surfaces() {
        let inner = InMemoryTaskStore::new();
        let task = inner.save(Task::new("t", "o", "echo hi")).await.unwrap();
        let store: Arc<dyn TaskStore> = Arc::new(ReadOnlyStore { inner });
        let engine = ExecutionEngine::new(store, Arc::new(LocalProcessBackend::new()));

        let err = engine.execute(task.id_str()).await.unwrap_err();
        assert!(matches!(err, EngineError::Persistence(ref msg) if msg == "disk full"));
    }

    #[tokio::test]
    async fn same_task_executions_are_serialized() {
        let (store, id) = seeded("date").await;
        let backend = Arc::new(SlowBackend::default());
        let engine = Arc::new(ExecutionEngine::new(store.clone(), backend.clone()));

        let runs: Vec<_> = (0..4)
            .map(|_| {
                let engine = engine.clone();
                let id = id.clone();
                tokio::spawn(async move { engine.execute(&id).await })
            })
            .collect();
        for run in runs {
            run.await.unwrap().unwrap();
        }

        assert_eq!(backend.peak.load(Ordering::SeqCst), 1);
        let task = store.find_by_id(&id).await.unwrap().unwrap();
        assert_eq!(task.task_executions.len(), 4);
        assert_eq!(engine.locks.active(), 0);
    }

    #[tokio::test]
    async fn different_tasks_run_concurrently() {
        let store: Arc<dyn TaskStore> = Arc::new(InMemoryTaskStore::new());
        let a = store.save(Task::new("a", "o", "date")).await.unwrap();
        let b = store.save(Task::new("b", "o", "date")).await.unwrap();
        let backend = Arc::new(SlowBackend::default());
        let engine = Arc::new(ExecutionEngine::new(store, backend.clone()));

        let (ra, rb) = tokio::join!(engine.execute(a.id_str()), engine.execute(b.id_str()));
        ra.unwrap();
        rb.unwrap();
        assert_eq!(backend.peak.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn abandoned_call_still_records_the_attempt() {
        let (store, id) = seeded("date").await;
        let backend = Arc::new(SlowBackend::default());
        let engine = ExecutionEngine::new(store.clone(), backend.clone());

        let abandoned = tokio::time::timeout(Duration::from_millis(10), engine.execute(&id)).await;
        assert!(abandoned.is_err());

        tokio::time::sleep(Duration::from_millis(300)).await;
        let task = store.find_by_id(&id).await.unwrap().unwrap();
        assert_eq!(task.task_executions.len(), 1);
        assert_eq!(task.task_executions[0].output, "done");
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
        assert_eq!(engine.locks.active(), 0);
    }

    #[tokio::test]
    async fn shutdown_cancels_and_records_running_attempts() {
        let (store, id) = seeded("sleep 5").await;
        let engine = Arc::new(ExecutionEngine::new(
            store.clone(),
            Arc::new(LocalProcessBackend::new()),
        ));

        let trigger = engine.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.shutdown();
        });
        let started = std::time::Instant::now();
        let err = engine.execute(&id).await.unwrap_err();

        assert!(matches!(err, EngineError::Execution(ExecError::Cancelled)));
        assert!(started.elapsed() < Duration::from_secs(4));
        let task = store.find_by_id(&id).await.unwrap().unwrap();
        assert_eq!(
            task.task_executions[0].output,
            "Execution failed: Execution cancelled"
        );
    }
}
