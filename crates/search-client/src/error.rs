//! Search client errors

use thiserror::Error;

/// Errors that can occur when talking to the search cluster
#[derive(Debug, Error)]
pub enum SearchError {
    /// HTTP request/response error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The cluster answered with a non-success status
    #[error("Search API error: {0}")]
    Api(String),

    /// Credentials were rejected
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// JSON serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The readiness deadline elapsed before the cluster became sufficient
    #[error("search cluster not ready after {waited_secs}s: {last_reason}")]
    ReadinessTimeout {
        /// Seconds spent polling
        waited_secs: u64,
        /// Reason reported by the final poll
        last_reason: String,
    },
}
