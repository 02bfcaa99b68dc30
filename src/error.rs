use std::fmt::Write;
use std::time::Duration;
use thiserror::Error;

/// Formats an error and its entire source chain with each error on a new line
///
/// This produces output like:
/// ```
/// Error message
///   Caused by: First cause
///   Caused by: Second cause
///   Caused by: Root cause
/// ```
pub fn format_error_chain(err: &dyn std::error::Error) -> String {
    let mut output = String::new();
    write!(&mut output, "{}", err).ok();

    let mut source = err.source();
    while let Some(err) = source {
        write!(&mut output, "\n  Caused by: {}", err).ok();
        source = err.source();
    }

    output
}

/// Central application error type
#[derive(Error, Debug)]
pub enum AppError {
    /// Kubernetes-related errors
    #[error("Kubernetes error: {0}")]
    Kubernetes(#[from] kube::Error),

    #[error("Kubernetes config error: {0}")]
    KubernetesConfig(String),

    #[error("Kubernetes resource not found: {0}")]
    KubernetesNotFound(String),

    /// Helm invocations that failed without a recognised failure class
    #[error("Helm error: {0}")]
    Helm(String),

    /// Helm failures that are surfaced on conditions instead of retried
    /// (wait timeouts, manifest validation, atomic rollback, kubeVersion)
    #[error("{message}")]
    HelmFailure { message: String },

    /// A release reference that cannot be resolved to stored revision data.
    /// Callers use this sentinel to skip dependent work without requeueing.
    #[error("no resource ID available for {0}")]
    NoResourceId(String),

    /// The sidecar values Secret does not (yet) match the declared hash
    #[error("values hash mismatch for {0}")]
    ValuesHashMismatch(String),

    /// A bundle this one depends on has not reported Ready yet
    #[error("dependent bundle {name} is not ready")]
    DependencyNotReady {
        name: String,
        requeue_after: Duration,
    },

    /// Kustomize invocation errors
    #[error("Kustomize error: {0}")]
    Kustomize(String),

    /// The release target namespace fails the bundle's namespace selector
    #[error("namespace {0} does not match AllowedTargetNamespaceSelector")]
    TargetNamespaceMismatch(String),

    /// Bundle content errors (missing, corrupt, checksum mismatch)
    #[error("Content error: {0}")]
    Content(String),

    /// Serialization/Deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Environment variable error: {0}")]
    EnvVar(#[from] std::env::VarError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal errors with context
    #[error("Internal error: {0}")]
    Internal(String),

    /// Not found errors
    #[error("Not found: {0}")]
    NotFound(String),
}

/// Convenience type alias for Results using AppError
pub type AppResult<T> = Result<T, AppError>;

impl AppError {
    /// Status-write conflicts are swallowed; the next reconcile retries.
    pub fn is_conflict(&self) -> bool {
        matches!(self, AppError::Kubernetes(kube::Error::Api(e)) if e.code == 409)
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            AppError::Kubernetes(kube::Error::Api(e)) => e.code == 404,
            AppError::KubernetesNotFound(_) | AppError::NotFound(_) => true,
            _ => false,
        }
    }
}

// Implement From for common error types that don't have automatic conversion
impl From<String> for AppError {
    fn from(s: String) -> Self {
        AppError::Internal(s)
    }
}

impl From<&str> for AppError {
    fn from(s: &str) -> Self {
        AppError::Internal(s.to_string())
    }
}

impl From<anyhow::Error> for AppError {
    fn from(e: anyhow::Error) -> Self {
        AppError::Internal(format!("{:#}", e))
    }
}

/// Accumulates the per-step failures of a reconcile pass. Status is patched
/// as best-effort before the list is returned to the work-queue.
#[derive(Debug, Default)]
pub struct ErrorList(pub Vec<AppError>);

impl std::fmt::Display for ErrorList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let messages: Vec<String> = self.0.iter().map(|e| e.to_string()).collect();
        write!(f, "{}", messages.join("; "))
    }
}

impl std::error::Error for ErrorList {}

impl ErrorList {
    pub fn push(&mut self, err: AppError) {
        self.0.push(err);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Collapses the accumulator: `Ok(())` when nothing failed, the single
    /// error when exactly one step failed, the full list otherwise.
    pub fn into_result(mut self) -> AppResult<()> {
        match self.0.len() {
            0 => Ok(()),
            1 => Err(self.0.remove(0)),
            _ => Err(AppError::Internal(self.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_chain_formats_causes_on_separate_lines() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk gone");
        let err = AppError::Io(io);
        let chain = format_error_chain(&err);
        assert!(chain.starts_with("I/O error"));
    }

    #[test]
    fn conflict_detection() {
        let err = AppError::Kubernetes(kube::Error::Api(kube::error::ErrorResponse {
            status: "Failure".to_string(),
            message: "conflict".to_string(),
            reason: "Conflict".to_string(),
            code: 409,
        }));
        assert!(err.is_conflict());
        assert!(!err.is_not_found());
    }

    #[test]
    fn error_list_collapses() {
        let mut list = ErrorList::default();
        assert!(list.is_empty());
        list.push(AppError::Helm("install failed".to_string()));
        list.push(AppError::NotFound("secret".to_string()));
        let err = list.into_result().unwrap_err();
        let text = err.to_string();
        assert!(text.contains("install failed"));
        assert!(text.contains("secret"));
    }

    #[test]
    fn empty_error_list_is_ok() {
        assert!(ErrorList::default().into_result().is_ok());
    }
}
