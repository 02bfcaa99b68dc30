use std::time::Duration;

use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::Client;

use crate::error::{AppError, AppResult};

/// Bundle names carrying this prefix are the agent's own deployment; they get
/// the forced-redeploy treatment on every change.
pub const AGENT_BUNDLE_PREFIX: &str = "flotilla-agent";

/// Runtime configuration for the agent process, read once from the
/// environment at startup.
#[derive(Clone, Debug)]
pub struct AgentConfig {
    /// The namespace on the upstream cluster that holds this cluster's
    /// BundleDeployments and their sidecar Secrets.
    pub namespace: String,
    /// Name the agent registers under; used for log context only.
    pub agent_name: String,
    /// Namespace on the local cluster where impersonation service accounts
    /// live.
    pub agent_namespace: String,
    /// Fallback install namespace when a bundle specifies none.
    pub default_namespace: String,
    /// Parallel reconciles for the bundle and drift controllers.
    pub concurrency: u16,
    /// Interval between orphan-release sweeps.
    pub gc_interval: Duration,
}

impl AgentConfig {
    pub fn from_env() -> AppResult<Self> {
        let namespace = std::env::var("FLOTILLA_NAMESPACE")
            .map_err(|_| AppError::Config("FLOTILLA_NAMESPACE must be set".to_string()))?;

        let agent_name =
            std::env::var("FLOTILLA_AGENT_NAME").unwrap_or_else(|_| AGENT_BUNDLE_PREFIX.to_string());

        let agent_namespace =
            std::env::var("FLOTILLA_AGENT_NAMESPACE").unwrap_or_else(|_| "flotilla-system".to_string());

        let default_namespace =
            std::env::var("FLOTILLA_DEFAULT_NAMESPACE").unwrap_or_else(|_| "default".to_string());

        let concurrency = std::env::var("FLOTILLA_CONCURRENCY")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(50);

        let gc_interval = std::env::var("FLOTILLA_GC_INTERVAL_SECONDS")
            .ok()
            .and_then(|v| v.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(15 * 60));

        Ok(Self {
            namespace,
            agent_name,
            agent_namespace,
            default_namespace,
            concurrency,
            gc_interval,
        })
    }
}

/// Client for the upstream management cluster, scoped to the agent's
/// namespace there. Reads the kubeconfig produced by cluster registration.
pub async fn upstream_client() -> AppResult<Client> {
    let path = std::env::var("UPSTREAM_KUBECONFIG")
        .map_err(|_| AppError::Config("UPSTREAM_KUBECONFIG must be set".to_string()))?;

    let kubeconfig = Kubeconfig::read_from(&path)
        .map_err(|e| AppError::KubernetesConfig(format!("reading {}: {}", path, e)))?;
    let config = kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .map_err(|e| AppError::KubernetesConfig(e.to_string()))?;

    Client::try_from(config).map_err(AppError::Kubernetes)
}

/// Client for the cluster the agent manages. In-cluster config when deployed,
/// local kubeconfig during development.
pub async fn local_client() -> AppResult<Client> {
    Client::try_default().await.map_err(AppError::Kubernetes)
}
