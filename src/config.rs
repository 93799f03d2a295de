//! Configuration management for the task runner.
//!
//! Configuration is set via environment variables:
//! - `HOST` - Optional. Server host. Defaults to `127.0.0.1`.
//! - `PORT` - Optional. Server port. Defaults to `8080`.
//! - `WORKING_DIR` - Optional. Base directory for persisted tasks. Defaults to current directory.
//! - `TASK_STORE` - Optional. `memory`, `file` or `sqlite`. Unknown values mean `sqlite`.
//! - `KUBERNETES_NAMESPACE` - Optional. Namespace for execution pods. Defaults to `default`.
//! - `EXECUTOR_BACKEND` - Optional. `auto`, `local` or `kubernetes`. Defaults to `auto`.
//! - `TASK_POD_IMAGE` - Optional. Image for execution pods. Defaults to `busybox:latest`.
//! - `KUBE_API_URL`, `KUBE_TOKEN`, `KUBE_CA_CERT` - Optional. Explicit API server.
//! - `KUBECONFIG` - Optional. Kubeconfig path. Defaults to `~/.kube/config`.
//! - `KUBE_INSECURE_SKIP_TLS_VERIFY` - Optional. Defaults to `false`.

use std::path::PathBuf;
use std::str::FromStr;

use thiserror::Error;

use crate::kube::KubeSettings;
use crate::store::TaskStoreType;
use crate::util::env_var_bool;

pub const DEFAULT_POD_IMAGE: &str = "busybox:latest";
pub const DEFAULT_NAMESPACE: &str = "default";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

/// How the execution backend is chosen at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExecutorMode {
    /// Kubernetes when reachable, local processes otherwise.
    #[default]
    Auto,
    Local,
    /// Refuse to start without a reachable cluster.
    Kubernetes,
}

impl FromStr for ExecutorMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "" | "auto" => Ok(Self::Auto),
            "local" | "process" => Ok(Self::Local),
            "kubernetes" | "k8s" | "pod" => Ok(Self::Kubernetes),
            other => Err(format!(
                "unknown executor backend '{}' (expected auto, local or kubernetes)",
                other
            )),
        }
    }
}

/// Service configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Server host
    pub host: String,

    /// Server port
    pub port: u16,

    /// Base directory for the file and SQLite stores
    pub working_dir: PathBuf,

    pub store_type: TaskStoreType,

    /// Namespace execution pods are created in
    pub namespace: String,

    pub executor_mode: ExecutorMode,

    /// Container image for execution pods
    pub pod_image: String,

    pub kube: KubeSettings,
}

fn non_empty_var(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` if a variable is set but unparseable.
    pub fn from_env() -> Result<Self, ConfigError> {
        let host = std::env::var("HOST").unwrap_or_else(|_| "127.0.0.1".to_string());

        let port = std::env::var("PORT")
            .unwrap_or_else(|_| "8080".to_string())
            .parse()
            .map_err(|e| ConfigError::InvalidValue("PORT".to_string(), format!("{}", e)))?;

        let working_dir = std::env::var("WORKING_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));

        let store_type = TaskStoreType::from_str(
            &std::env::var("TASK_STORE").unwrap_or_else(|_| "sqlite".to_string()),
        );

        let executor_mode = std::env::var("EXECUTOR_BACKEND")
            .unwrap_or_else(|_| "auto".to_string())
            .parse()
            .map_err(|e| ConfigError::InvalidValue("EXECUTOR_BACKEND".to_string(), e))?;

        let namespace =
            non_empty_var("KUBERNETES_NAMESPACE").unwrap_or_else(|| DEFAULT_NAMESPACE.to_string());
        let pod_image =
            non_empty_var("TASK_POD_IMAGE").unwrap_or_else(|| DEFAULT_POD_IMAGE.to_string());

        let kube = KubeSettings {
            api_url: non_empty_var("KUBE_API_URL"),
            token: non_empty_var("KUBE_TOKEN"),
            ca_cert: non_empty_var("KUBE_CA_CERT").map(PathBuf::from),
            kubeconfig: non_empty_var("KUBECONFIG").map(PathBuf::from),
            insecure_skip_tls_verify: env_var_bool("KUBE_INSECURE_SKIP_TLS_VERIFY", false),
        };

        Ok(Self {
            host,
            port,
            working_dir,
            store_type,
            namespace,
            executor_mode,
            pod_image,
            kube,
        })
    }

    /// In-memory store and local execution, for tests.
    pub fn for_tests() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 0,
            working_dir: std::env::temp_dir(),
            store_type: TaskStoreType::Memory,
            namespace: DEFAULT_NAMESPACE.to_string(),
            executor_mode: ExecutorMode::Local,
            pod_image: DEFAULT_POD_IMAGE.to_string(),
            kube: KubeSettings::default(),
        }
    }
}
