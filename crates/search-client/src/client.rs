//! Search cluster API client
//!
//! Implements the health and node-topology calls the readiness gate needs.
//! Based on the cluster API structure: /_cluster/health and /_cat/nodes

use crate::error::SearchError;
use crate::models::{ClusterHealth, NodeInfo};
use crate::search_trait::SearchClientTrait;
use reqwest::{Client, RequestBuilder, StatusCode};
use std::time::Duration;
use tracing::debug;

/// Per-request timeout; the readiness deadline is enforced separately by the gate.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Basic-auth credentials for a secured cluster
#[derive(Clone)]
pub struct BasicAuth {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for BasicAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BasicAuth")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Search cluster API client
#[derive(Debug, Clone)]
pub struct SearchClient {
    client: Client,
    base_url: String,
    auth: Option<BasicAuth>,
}

impl SearchClient {
    /// Create a new search client
    ///
    /// # Arguments
    /// * `base_url` - Cluster base URL (e.g., "http://logs-search.monitoring.svc:9200")
    /// * `auth` - Optional basic-auth credentials
    pub fn new(base_url: String, auth: Option<BasicAuth>) -> Result<Self, SearchError> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(SearchError::Http)?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            auth,
        })
    }

    fn get(&self, path: &str) -> RequestBuilder {
        let url = format!("{}{}", self.base_url, path);
        let request = self.client.get(url).header("Accept", "application/json");
        match &self.auth {
            Some(auth) => request.basic_auth(&auth.username, Some(&auth.password)),
            None => request,
        }
    }

    async fn get_json<T: for<'de> serde::Deserialize<'de>>(&self, path: &str) -> Result<T, SearchError> {
        debug!("GET {}{}", self.base_url, path);

        let response = self.get(path).send().await?;
        let status = response.status();

        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            let body = response.text().await.unwrap_or_default();
            return Err(SearchError::Authentication(format!("{} - {}", status, body)));
        }

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SearchError::Api(format!(
                "GET {} failed: {} - {}",
                path, status, body
            )));
        }

        let text = response.text().await?;
        serde_json::from_str(&text).map_err(|e| {
            SearchError::Api(format!(
                "error decoding response body: {} - Response (first 500 chars): {}",
                e,
                text.chars().take(500).collect::<String>()
            ))
        })
    }
}

#[async_trait::async_trait]
impl SearchClientTrait for SearchClient {
    fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn cluster_health(&self) -> Result<ClusterHealth, SearchError> {
        self.get_json("/_cluster/health").await
    }

    async fn nodes(&self) -> Result<Vec<NodeInfo>, SearchError> {
        self.get_json("/_cat/nodes?format=json&h=name,version,node.role").await
    }
}
