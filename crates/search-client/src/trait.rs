//! SearchClient trait for mocking
//!
//! This trait abstracts the SearchClient to enable mocking in unit tests.
//! The concrete SearchClient implements this trait, and tests can use mock implementations.

use crate::error::SearchError;
use crate::models::{ClusterHealth, NodeInfo};

/// Trait for search cluster API operations
///
/// All async methods must be `Send` to work with Tokio's work-stealing runtime.
#[async_trait::async_trait]
pub trait SearchClientTrait: Send + Sync {
    /// Get the base URL
    fn base_url(&self) -> &str;

    /// Cluster health summary
    async fn cluster_health(&self) -> Result<ClusterHealth, SearchError>;

    /// Every node with its version and role designator
    async fn nodes(&self) -> Result<Vec<NodeInfo>, SearchError>;
}
