//! Controller-specific error types.
//!
//! Errors are classified by how the reconcile loop reacts to them: conflicts
//! requeue immediately, transient errors back off without touching status,
//! everything else is recorded as a status condition and backs off.

use crds::CrdError;
use kube::Error as KubeError;
use search_client::SearchError;
use thiserror::Error;

/// Errors that can occur in the monitoring controller.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Kubernetes API error
    #[error("Kubernetes error: {0}")]
    Kube(#[from] KubeError),

    /// Optimistic-concurrency conflict or create race on an object
    #[error("Conflict on {0}")]
    Conflict(String),

    /// Object vanished between read and write
    #[error("Not found: {0}")]
    NotFound(String),

    /// Search cluster API error
    #[error("Search cluster error: {0}")]
    Search(#[from] SearchError),

    /// The instance spec cannot be rendered
    #[error("Invalid spec: {0}")]
    InvalidSpec(#[from] CrdError),

    /// A required metadata field is missing on a resource
    #[error("Missing field: {0}")]
    MissingField(String),

    /// Invalid process configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Operator settings object absent or malformed
    #[error("Invalid operator settings: {0}")]
    Settings(String),

    /// Password generation failed
    #[error("Credential generation failed: {0}")]
    Credential(String),

    /// Certificate generation or parsing failed
    #[error("Certificate error: {0}")]
    Certificate(#[from] openssl::error::ErrorStack),

    /// Filesystem error
    #[error("I/O error on {path}: {source}")]
    Io {
        /// Path being read or written
        path: String,
        /// Underlying error
        source: std::io::Error,
    },

    /// JSON serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML rendering error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Resource watch failed
    #[error("Resource watch failed: {0}")]
    Watch(String),

    /// HTTP listener failed
    #[error("Server error: {0}")]
    Server(String),
}

impl ControllerError {
    /// Maps a kube error, turning 409 and 404 responses into dedicated variants.
    pub fn from_kube(err: KubeError, what: impl Into<String>) -> Self {
        match err {
            KubeError::Api(ae) if ae.code == 409 => ControllerError::Conflict(what.into()),
            KubeError::Api(ae) if ae.code == 404 => ControllerError::NotFound(what.into()),
            other => ControllerError::Kube(other),
        }
    }

    /// Wraps an I/O error with the path it happened on.
    pub fn io(path: &std::path::Path, source: std::io::Error) -> Self {
        ControllerError::Io {
            path: path.display().to_string(),
            source,
        }
    }

    /// Requeue immediately, without backoff.
    pub fn is_conflict(&self) -> bool {
        matches!(self, ControllerError::Conflict(_) | ControllerError::NotFound(_))
    }

    /// Retry with backoff but do not record as an instance failure.
    pub fn is_transient(&self) -> bool {
        match self {
            ControllerError::Kube(KubeError::Api(ae)) => ae.code == 429 || ae.code >= 500,
            ControllerError::Kube(_) | ControllerError::Search(_) | ControllerError::Watch(_) => true,
            _ => false,
        }
    }

    /// Short machine readable reason used in status conditions.
    pub fn reason(&self) -> &'static str {
        match self {
            ControllerError::InvalidSpec(_) | ControllerError::MissingField(_) => "InvalidSpec",
            ControllerError::Credential(_) => "CredentialFailed",
            _ => "ApplyFailed",
        }
    }
}
