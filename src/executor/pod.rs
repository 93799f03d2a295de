//! Kubernetes pod backend.
//!
//! Each attempt runs in its own disposable pod:
//! 1. create a pod named after the task with a random suffix
//! 2. poll its phase once per interval, up to a fixed number of attempts
//! 3. on `Succeeded`/`Failed`, read the full container log
//! 4. delete the pod, exactly once, whatever happened before
//!
//! A single failed status read ends the attempt. Deletion failures are logged
//! and swallowed; a leaked pod never changes the caller's result.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::{ExecError, ExecutionBackend};
use crate::kube::KubeError;
use crate::task::Task;

/// Delay between two phase reads.
pub const POD_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Phase reads before the attempt is declared timed out.
pub const POD_POLL_ATTEMPTS: u32 = 60;

/// Output recorded when the pod finished without writing any log.
pub const POD_NO_OUTPUT: &str = "Command executed (no output)";

const POD_NAME_PREFIX: &str = "task-exec-";
const MAX_NAME_LEN: usize = 63;
const SUFFIX_LEN: usize = 8;

/// The subset of the Kubernetes API the pod backend needs.
#[async_trait]
pub trait OrchestratorClient: Send + Sync {
    async fn create_pod(&self, namespace: &str, pod: &PodManifest) -> Result<(), KubeError>;

    /// Current phase, or `None` if the pod has no status yet.
    async fn pod_phase(&self, name: &str, namespace: &str) -> Result<Option<PodPhase>, KubeError>;

    /// Complete log of the pod's container (not following, current instance).
    async fn pod_logs(&self, name: &str, namespace: &str) -> Result<String, KubeError>;

    async fn delete_pod(&self, name: &str, namespace: &str) -> Result<(), KubeError>;
}

/// Pod lifecycle phase as reported in `status.phase`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PodPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown(String),
}

impl PodPhase {
    pub fn parse(value: &str) -> Self {
        match value {
            "Pending" => Self::Pending,
            "Running" => Self::Running,
            "Succeeded" => Self::Succeeded,
            "Failed" => Self::Failed,
            other => Self::Unknown(other.to_string()),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

/// Pod object submitted to the API server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodManifest {
    pub api_version: String,
    pub kind: String,
    pub metadata: PodMetadata,
    pub spec: PodSpec,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PodMetadata {
    pub name: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodSpec {
    pub restart_policy: String,
    pub containers: Vec<ContainerSpec>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub command: Vec<String>,
}

impl PodManifest {
    /// Single container, never restarted, running `sh -c <command>`.
    ///
    /// The command is passed as one argument and is never re-parsed here.
    pub fn for_command(pod_name: &str, task_id: &str, image: &str, command: &str) -> Self {
        let mut labels = BTreeMap::new();
        labels.insert("app".to_string(), "task-executor".to_string());
        labels.insert("task-id".to_string(), label_value(task_id));
        Self {
            api_version: "v1".to_string(),
            kind: "Pod".to_string(),
            metadata: PodMetadata {
                name: pod_name.to_string(),
                labels,
            },
            spec: PodSpec {
                restart_policy: "Never".to_string(),
                containers: vec![ContainerSpec {
                    name: "task-container".to_string(),
                    image: image.to_string(),
                    command: vec!["sh".to_string(), "-c".to_string(), command.to_string()],
                }],
            },
        }
    }
}

/// Unique pod name for one attempt: `task-exec-<task id>-<8 hex>`.
///
/// The task id is lowercased and reduced to DNS label characters so the
/// result is always a valid pod name.
pub fn pod_name_for(task_id: &str) -> String {
    let suffix: String = Uuid::new_v4()
        .simple()
        .to_string()
        .chars()
        .take(SUFFIX_LEN)
        .collect();
    let mut base: String = task_id
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    base.truncate(MAX_NAME_LEN - POD_NAME_PREFIX.len() - 1 - SUFFIX_LEN);
    let base = base.trim_matches('-');
    if base.is_empty() {
        format!("{}{}", POD_NAME_PREFIX, suffix)
    } else {
        format!("{}{}-{}", POD_NAME_PREFIX, base, suffix)
    }
}

fn label_value(value: &str) -> String {
    let mut out: String = value
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '-'
            }
        })
        .collect();
    out.truncate(MAX_NAME_LEN);
    out.trim_matches(|c: char| !c.is_ascii_alphanumeric())
        .to_string()
}

#[derive(Clone)]
pub struct PodBackend {
    client: Arc<dyn OrchestratorClient>,
    namespace: String,
    image: String,
    poll_interval: Duration,
    poll_attempts: u32,
}

impl PodBackend {
    pub fn new(client: Arc<dyn OrchestratorClient>, namespace: String, image: String) -> Self {
        Self {
            client,
            namespace,
            image,
            poll_interval: POD_POLL_INTERVAL,
            poll_attempts: POD_POLL_ATTEMPTS,
        }
    }

    /// Override the polling budget (tests use a millisecond interval).
    pub fn with_polling(mut self, interval: Duration, attempts: u32) -> Self {
        self.poll_interval = interval;
        self.poll_attempts = attempts;
        self
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Poll until the pod reaches a terminal phase, then fetch its log.
    async fn wait_for_output(
        &self,
        pod_name: &str,
        cancel: &CancellationToken,
    ) -> Result<String, ExecError> {
        for attempt in 0..self.poll_attempts {
            let phase = self
                .client
                .pod_phase(pod_name, &self.namespace)
                .await
                .map_err(|e| {
                    tracing::error!(pod = %pod_name, "Error checking pod status: {}", e);
                    ExecError::Orchestrator(format!("Failed to check pod status: {}", e))
                })?;

            if let Some(phase) = phase.filter(PodPhase::is_terminal) {
                tracing::debug!(pod = %pod_name, ?phase, attempt, "Pod finished");
                let logs = self.client.pod_logs(pod_name, &self.namespace).await?;
                if logs.trim().is_empty() {
                    return Ok(POD_NO_OUTPUT.to_string());
                }
                return Ok(logs);
            }

            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                _ = cancel.cancelled() => return Err(ExecError::Cancelled),
            }
        }

        Err(ExecError::Timeout {
            what: "Pod",
            after: self.poll_interval * self.poll_attempts,
        })
    }

    async fn delete_pod(&self, pod_name: &str) {
        match self.client.delete_pod(pod_name, &self.namespace).await {
            Ok(()) => tracing::info!(pod = %pod_name, "Pod deleted"),
            Err(e) => tracing::warn!(pod = %pod_name, "Failed to delete pod: {}", e),
        }
    }
}

#[async_trait]
impl ExecutionBackend for PodBackend {
    fn name(&self) -> &'static str {
        "kubernetes"
    }

    /// The attempt runs on its own tokio task, so the pod is deleted even if
    /// the caller stops waiting.
    async fn run(&self, task: &Task, cancel: &CancellationToken) -> Result<String, ExecError> {
        let backend = self.clone();
        let task = task.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { backend.attempt(&task, &cancel).await })
            .await
            .map_err(|e| ExecError::Orchestrator(format!("Pod attempt aborted: {}", e)))?
    }
}

impl PodBackend {
    /// Create, wait, read logs, then delete exactly once.
    async fn attempt(&self, task: &Task, cancel: &CancellationToken) -> Result<String, ExecError> {
        let pod_name = pod_name_for(task.id_str());
        tracing::info!(
            pod = %pod_name,
            task_id = %task.id_str(),
            namespace = %self.namespace,
            "Creating Kubernetes pod"
        );

        let manifest = PodManifest::for_command(&pod_name, task.id_str(), &self.image, &task.command);
        let result = match self.client.create_pod(&self.namespace, &manifest).await {
            Ok(()) => {
                tracing::info!(pod = %pod_name, "Pod created successfully");
                self.wait_for_output(&pod_name, cancel).await
            }
            Err(e) => {
                tracing::error!(pod = %pod_name, "Kubernetes API error: {}", e);
                Err(e.into())
            }
        };

        self.delete_pod(&pod_name).await;
        result
    }
}
