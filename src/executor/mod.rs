//! Command execution backends.
//!
//! Two strategies run a task's command:
//! - [`PodBackend`]: an ephemeral single-container pod on Kubernetes
//! - [`LocalProcessBackend`]: `sh -c` on the host, used when no cluster is reachable
//!
//! The strategy is chosen once at startup by [`ExecutorConfig::resolve`] and
//! never re-evaluated. Backends only produce output or an error; recording the
//! attempt on the task is the engine's job.

mod local;
mod pod;

pub use local::{LocalProcessBackend, LOCAL_NO_OUTPUT, LOCAL_TIMEOUT};
pub use pod::{
    pod_name_for, OrchestratorClient, PodBackend, PodManifest, PodPhase, POD_NO_OUTPUT,
    POD_POLL_ATTEMPTS, POD_POLL_INTERVAL,
};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::config::{Config, ExecutorMode};
use crate::kube::{KubeClient, KubeError};
use crate::task::Task;

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("Failed to start command: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("Failed to collect command output: {0}")]
    Io(#[from] std::io::Error),

    #[error("Kubernetes execution failed: {0}")]
    Orchestrator(String),

    #[error("{what} execution timeout ({secs} seconds)", secs = .after.as_secs())]
    Timeout { what: &'static str, after: Duration },

    #[error("Execution cancelled")]
    Cancelled,
}

impl ExecError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, ExecError::Timeout { .. })
    }

    /// Text stored as the output of a failed attempt.
    pub fn failure_output(&self) -> String {
        format!("Execution failed: {}", self)
    }
}

impl From<KubeError> for ExecError {
    fn from(err: KubeError) -> Self {
        ExecError::Orchestrator(err.to_string())
    }
}

/// A way of running a task's command to completion.
#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    /// Short name for logs and the health endpoint.
    fn name(&self) -> &'static str;

    /// Run the task's command and return its captured output.
    ///
    /// Implementations enforce their own deadline and stop early when
    /// `cancel` fires.
    async fn run(&self, task: &Task, cancel: &CancellationToken) -> Result<String, ExecError>;
}

pub type BackendRef = Arc<dyn ExecutionBackend>;

/// Which backend this process uses, fixed at startup.
#[derive(Clone)]
pub enum BackendChoice {
    Orchestrator {
        client: Arc<dyn OrchestratorClient>,
        namespace: String,
        image: String,
    },
    Local,
}

impl std::fmt::Debug for BackendChoice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendChoice::Orchestrator {
                namespace, image, ..
            } => f
                .debug_struct("Orchestrator")
                .field("namespace", namespace)
                .field("image", image)
                .finish(),
            BackendChoice::Local => f.write_str("Local"),
        }
    }
}

/// Execution configuration resolved once during process initialization.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub backend: BackendChoice,
}

impl ExecutorConfig {
    pub fn local() -> Self {
        Self {
            backend: BackendChoice::Local,
        }
    }

    pub fn orchestrator(
        client: Arc<dyn OrchestratorClient>,
        namespace: impl Into<String>,
        image: impl Into<String>,
    ) -> Self {
        Self {
            backend: BackendChoice::Orchestrator {
                client,
                namespace: namespace.into(),
                image: image.into(),
            },
        }
    }

    /// Decide the backend from configuration and cluster reachability.
    ///
    /// In `auto` mode an unreachable cluster falls back to local execution.
    /// In `kubernetes` mode it is an error.
    pub async fn resolve(config: &Config) -> Result<Self, KubeError> {
        match config.executor_mode {
            ExecutorMode::Local => {
                tracing::info!("Executor backend forced to local processes");
                Ok(Self::local())
            }
            ExecutorMode::Kubernetes => {
                let client = KubeClient::connect(&config.kube).await?;
                tracing::info!(
                    server = %client.server(),
                    namespace = %config.namespace,
                    "Kubernetes client initialized successfully"
                );
                Ok(Self::orchestrator(
                    Arc::new(client),
                    &config.namespace,
                    &config.pod_image,
                ))
            }
            ExecutorMode::Auto => match KubeClient::connect(&config.kube).await {
                Ok(client) => {
                    tracing::info!(
                        server = %client.server(),
                        namespace = %config.namespace,
                        "Kubernetes client initialized successfully"
                    );
                    Ok(Self::orchestrator(
                        Arc::new(client),
                        &config.namespace,
                        &config.pod_image,
                    ))
                }
                Err(e) => {
                    tracing::warn!(
                        "Failed to initialize Kubernetes client. Will use local execution: {}",
                        e
                    );
                    Ok(Self::local())
                }
            },
        }
    }

    /// Build the backend this configuration selects.
    pub fn build(&self) -> BackendRef {
        match &self.backend {
            BackendChoice::Orchestrator {
                client,
                namespace,
                image,
            } => Arc::new(PodBackend::new(
                Arc::clone(client),
                namespace.clone(),
                image.clone(),
            )),
            BackendChoice::Local => {
                tracing::warn!(
                    "Local execution runs task commands unsandboxed on this host; \
                     set EXECUTOR_BACKEND=kubernetes to require pod isolation"
                );
                Arc::new(LocalProcessBackend::new())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_message_names_the_ceiling() {
        let err = ExecError::Timeout {
            what: "Command",
            after: LOCAL_TIMEOUT,
        };
        assert_eq!(err.to_string(), "Command execution timeout (30 seconds)");
        assert!(err.is_timeout());
        assert_eq!(
            err.failure_output(),
            "Execution failed: Command execution timeout (30 seconds)"
        );
    }

    #[test]
    fn kube_errors_become_orchestrator_errors() {
        let err: ExecError = KubeError::Api {
            status: 403,
            body: "forbidden".to_string(),
        }
        .into();
        assert!(matches!(err, ExecError::Orchestrator(_)));
        assert!(!err.is_timeout());
        assert!(err.to_string().contains("403"));
    }

    #[tokio::test]
    async fn forced_local_mode_selects_local_backend() {
        let mut config = Config::for_tests();
        config.executor_mode = ExecutorMode::Local;
        let resolved = ExecutorConfig::resolve(&config).await.unwrap();
        assert!(matches!(resolved.backend, BackendChoice::Local));
        assert_eq!(resolved.build().name(), "local");
    }

    fn unreachable_cluster(mode: ExecutorMode) -> Config {
        let mut config = Config::for_tests();
        config.executor_mode = mode;
        config.kube.api_url = Some("http://127.0.0.1:1".to_string());
        config
    }

    #[tokio::test]
    async fn auto_mode_falls_back_to_local() {
        let resolved = ExecutorConfig::resolve(&unreachable_cluster(ExecutorMode::Auto))
            .await
            .unwrap();
        assert!(matches!(resolved.backend, BackendChoice::Local));
    }

    #[tokio::test]
    async fn kubernetes_mode_requires_a_cluster() {
        let err = ExecutorConfig::resolve(&unreachable_cluster(ExecutorMode::Kubernetes))
            .await
            .unwrap_err();
        assert!(matches!(err, KubeError::Http(_)));
    }

    #[test]
    fn orchestrator_choice_builds_pod_backend() {
        let client = crate::kube::KubeClient::from_endpoint(crate::kube::ClusterEndpoint {
            server: "http://127.0.0.1:8001".to_string(),
            token: None,
            ca_pem: None,
            insecure: false,
            source: "test",
        })
        .unwrap();
        let config = ExecutorConfig::orchestrator(Arc::new(client), "jobs", "busybox:latest");
        assert!(format!("{:?}", config).contains("jobs"));
        assert_eq!(config.build().name(), "kubernetes");
    }
}
