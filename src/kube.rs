//! Minimal Kubernetes core/v1 client over `reqwest`.
//!
//! Only what the pod backend needs: create, read, log and delete a pod.
//! Cluster discovery tries, in order:
//! - `KUBE_API_URL` (with optional `KUBE_TOKEN` / `KUBE_CA_CERT`)
//! - the in-cluster service account
//! - the current context of a kubeconfig file
//!
//! Only bearer-token authentication is supported.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use crate::executor::{OrchestratorClient, PodManifest, PodPhase};

const SERVICE_ACCOUNT_DIR: &str = "/var/run/secrets/kubernetes.io/serviceaccount";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum KubeError {
    #[error("No Kubernetes configuration found: {0}")]
    NotConfigured(String),

    #[error("Invalid kubeconfig {path}: {reason}")]
    Kubeconfig { path: PathBuf, reason: String },

    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid cluster CA certificate: {0}")]
    Certificate(String),

    #[error("Kubernetes request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Kubernetes API returned {status}: {body}")]
    Api { status: u16, body: String },
}

/// Connection settings taken from the environment.
#[derive(Debug, Clone, Default)]
pub struct KubeSettings {
    pub api_url: Option<String>,
    pub token: Option<String>,
    pub ca_cert: Option<PathBuf>,
    pub kubeconfig: Option<PathBuf>,
    pub insecure_skip_tls_verify: bool,
}

/// A resolved API server plus credentials.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ClusterEndpoint {
    pub server: String,
    pub token: Option<String>,
    pub ca_pem: Option<Vec<u8>>,
    pub insecure: bool,
    pub source: &'static str,
}

fn read_file(path: &Path) -> Result<Vec<u8>, KubeError> {
    std::fs::read(path).map_err(|source| KubeError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn read_token(path: &Path) -> Result<String, KubeError> {
    let bytes = read_file(path)?;
    Ok(String::from_utf8_lossy(&bytes).trim().to_string())
}

pub(crate) fn discover(settings: &KubeSettings) -> Result<ClusterEndpoint, KubeError> {
    if let Some(url) = settings.api_url.as_deref().filter(|u| !u.trim().is_empty()) {
        let ca_pem = settings.ca_cert.as_deref().map(read_file).transpose()?;
        return Ok(ClusterEndpoint {
            server: url.trim().trim_end_matches('/').to_string(),
            token: settings.token.clone(),
            ca_pem,
            insecure: settings.insecure_skip_tls_verify,
            source: "KUBE_API_URL",
        });
    }

    if let Some(mut endpoint) = in_cluster_endpoint(
        std::env::var("KUBERNETES_SERVICE_HOST").ok(),
        std::env::var("KUBERNETES_SERVICE_PORT").ok(),
        Path::new(SERVICE_ACCOUNT_DIR),
    )? {
        endpoint.insecure |= settings.insecure_skip_tls_verify;
        return Ok(endpoint);
    }

    let path = settings
        .kubeconfig
        .clone()
        .unwrap_or_else(|| PathBuf::from(crate::util::home_dir()).join(".kube/config"));
    if !path.exists() {
        return Err(KubeError::NotConfigured(format!(
            "not running in a cluster and {} does not exist",
            path.display()
        )));
    }
    let text = String::from_utf8_lossy(&read_file(&path)?).into_owned();
    let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut endpoint =
        endpoint_from_kubeconfig(&text, base_dir).map_err(|reason| KubeError::Kubeconfig {
            path: path.clone(),
            reason,
        })?;
    endpoint.insecure |= settings.insecure_skip_tls_verify;
    Ok(endpoint)
}

/// Service account discovery. Returns `None` when not running in a pod.
pub(crate) fn in_cluster_endpoint(
    host: Option<String>,
    port: Option<String>,
    sa_dir: &Path,
) -> Result<Option<ClusterEndpoint>, KubeError> {
    let (Some(host), Some(port)) = (host, port) else {
        return Ok(None);
    };
    let token_path = sa_dir.join("token");
    if !token_path.exists() {
        return Ok(None);
    }
    let ca_path = sa_dir.join("ca.crt");
    let ca_pem = if ca_path.exists() {
        Some(read_file(&ca_path)?)
    } else {
        None
    };
    let host = if host.contains(':') {
        format!("[{}]", host)
    } else {
        host
    };
    Ok(Some(ClusterEndpoint {
        server: format!("https://{}:{}", host, port),
        token: Some(read_token(&token_path)?),
        ca_pem,
        insecure: false,
        source: "in-cluster service account",
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct Kubeconfig {
    #[serde(default)]
    clusters: Vec<NamedCluster>,
    #[serde(default)]
    contexts: Vec<NamedContext>,
    #[serde(default)]
    users: Vec<NamedUser>,
    current_context: Option<String>,
}

#[derive(Debug, Deserialize)]
struct NamedCluster {
    name: String,
    cluster: ClusterEntry,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct ClusterEntry {
    server: String,
    certificate_authority: Option<PathBuf>,
    certificate_authority_data: Option<String>,
    #[serde(default)]
    insecure_skip_tls_verify: bool,
}

#[derive(Debug, Deserialize)]
struct NamedContext {
    name: String,
    context: ContextEntry,
}

#[derive(Debug, Deserialize)]
struct ContextEntry {
    cluster: String,
    user: Option<String>,
}

#[derive(Debug, Deserialize)]
struct NamedUser {
    name: String,
    #[serde(default)]
    user: UserEntry,
}

#[derive(Debug, Default, Deserialize)]
struct UserEntry {
    token: Option<String>,
    #[serde(rename = "tokenFile")]
    token_file: Option<PathBuf>,
}

/// Resolve the current context of a kubeconfig document.
///
/// Relative file references are resolved against `base_dir`.
pub(crate) fn endpoint_from_kubeconfig(
    text: &str,
    base_dir: &Path,
) -> Result<ClusterEndpoint, String> {
    let config: Kubeconfig = serde_yaml::from_str(text).map_err(|e| e.to_string())?;

    let context_name = config
        .current_context
        .as_deref()
        .filter(|c| !c.is_empty())
        .ok_or_else(|| "current-context is not set".to_string())?;
    let context = config
        .contexts
        .iter()
        .find(|c| c.name == context_name)
        .map(|c| &c.context)
        .ok_or_else(|| format!("context '{}' not found", context_name))?;
    let cluster = config
        .clusters
        .iter()
        .find(|c| c.name == context.cluster)
        .map(|c| &c.cluster)
        .ok_or_else(|| format!("cluster '{}' not found", context.cluster))?;

    let resolve = |p: &Path| {
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            base_dir.join(p)
        }
    };

    let ca_pem = if let Some(data) = &cluster.certificate_authority_data {
        Some(
            base64::engine::general_purpose::STANDARD
                .decode(data.trim())
                .map_err(|e| format!("certificate-authority-data: {}", e))?,
        )
    } else if let Some(path) = &cluster.certificate_authority {
        let path = resolve(path);
        Some(std::fs::read(&path).map_err(|e| format!("{}: {}", path.display(), e))?)
    } else {
        None
    };

    let user = context
        .user
        .as_deref()
        .and_then(|name| config.users.iter().find(|u| u.name == name))
        .map(|u| &u.user);
    let token = match user {
        Some(UserEntry {
            token: Some(token), ..
        }) => Some(token.clone()),
        Some(UserEntry {
            token_file: Some(path),
            ..
        }) => {
            let path = resolve(path);
            Some(
                std::fs::read_to_string(&path)
                    .map_err(|e| format!("{}: {}", path.display(), e))?
                    .trim()
                    .to_string(),
            )
        }
        _ => None,
    };

    Ok(ClusterEndpoint {
        server: cluster.server.trim_end_matches('/').to_string(),
        token,
        ca_pem,
        insecure: cluster.insecure_skip_tls_verify,
        source: "kubeconfig",
    })
}

/// REST client bound to one API server.
#[derive(Clone)]
pub struct KubeClient {
    http: reqwest::Client,
    server: String,
    token: Option<String>,
}

impl std::fmt::Debug for KubeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeClient")
            .field("server", &self.server)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl KubeClient {
    /// Discover the cluster and check that the API server answers.
    pub async fn connect(settings: &KubeSettings) -> Result<Self, KubeError> {
        let endpoint = discover(settings)?;
        tracing::debug!(
            server = %endpoint.server,
            source = endpoint.source,
            "Discovered Kubernetes API server"
        );
        let client = Self::from_endpoint(endpoint)?;
        let version = client.server_version().await?;
        tracing::info!(server = %client.server, version = %version, "Connected to Kubernetes");
        Ok(client)
    }

    pub(crate) fn from_endpoint(endpoint: ClusterEndpoint) -> Result<Self, KubeError> {
        let mut builder = reqwest::Client::builder().timeout(REQUEST_TIMEOUT);
        if let Some(pem) = &endpoint.ca_pem {
            let cert = reqwest::Certificate::from_pem(pem)
                .map_err(|e| KubeError::Certificate(e.to_string()))?;
            builder = builder.add_root_certificate(cert);
        }
        if endpoint.insecure {
            tracing::warn!("TLS verification of the Kubernetes API server is disabled");
            builder = builder.danger_accept_invalid_certs(true);
        }
        Ok(Self {
            http: builder.build()?,
            server: endpoint.server,
            token: endpoint.token,
        })
    }

    pub fn server(&self) -> &str {
        &self.server
    }

    /// `gitVersion` reported by `GET /version`.
    pub async fn server_version(&self) -> Result<String, KubeError> {
        let value: Value = self
            .send(self.request(Method::GET, "/version"))
            .await?
            .json()
            .await?;
        Ok(value
            .get("gitVersion")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string())
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let builder = self
            .http
            .request(method, format!("{}{}", self.server, path));
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn send(&self, builder: RequestBuilder) -> Result<Response, KubeError> {
        let response = builder.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(KubeError::Api {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }
}

fn pods_path(namespace: &str) -> String {
    format!("/api/v1/namespaces/{}/pods", namespace)
}

/// `status.phase` of a pod object, if it has one.
pub(crate) fn phase_of(pod: &Value) -> Option<PodPhase> {
    pod.pointer("/status/phase")
        .and_then(Value::as_str)
        .map(PodPhase::parse)
}

#[async_trait]
impl OrchestratorClient for KubeClient {
    async fn create_pod(&self, namespace: &str, pod: &PodManifest) -> Result<(), KubeError> {
        self.send(self.request(Method::POST, &pods_path(namespace)).json(pod))
            .await?;
        Ok(())
    }

    async fn pod_phase(&self, name: &str, namespace: &str) -> Result<Option<PodPhase>, KubeError> {
        let path = format!("{}/{}", pods_path(namespace), name);
        let pod: Value = self.send(self.request(Method::GET, &path)).await?.json().await?;
        Ok(phase_of(&pod))
    }

    async fn pod_logs(&self, name: &str, namespace: &str) -> Result<String, KubeError> {
        let path = format!(
            "{}/{}/log?follow=false&previous=false&timestamps=false",
            pods_path(namespace),
            name
        );
        Ok(self.send(self.request(Method::GET, &path)).await?.text().await?)
    }

    async fn delete_pod(&self, name: &str, namespace: &str) -> Result<(), KubeError> {
        let path = format!("{}/{}", pods_path(namespace), name);
        match self.send(self.request(Method::DELETE, &path)).await {
            Err(KubeError::Api { status, .. }) if status == StatusCode::NOT_FOUND.as_u16() => {
                tracing::debug!(pod = %name, "Pod already gone");
                Ok(())
            }
            other => other.map(|_| ()),
        }
    }
}
