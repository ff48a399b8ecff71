//! Dependency gate consulted before gated components are applied.

use crate::builder::meta::{search_credentials, search_service, service_url, SEARCH_HTTP_PORT, SEARCH_PASSWORD_KEY, SEARCH_USER};
use crate::cluster::ClusterClient;
use crate::error::ControllerError;
use crate::objects::{ManagedObject, ObjectKey, ResourceKind};
use crds::MonitoringInstance;
use search_client::{BasicAuth, ReadinessGate, ReadinessTarget, SearchClient, SearchClientTrait, SearchError};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Result of a gate check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateStatus {
    Ready,
    /// Not ready yet; carries the last reason.
    Waiting(String),
}

/// Decides whether the components that depend on the search cluster may roll out.
#[async_trait::async_trait]
pub trait DependencyGate: Send + Sync {
    async fn check(&self, instance: &MonitoringInstance) -> Result<GateStatus, ControllerError>;
}

/// Gate backed by the instance's own search cluster.
///
/// Polls the cluster's client Service with the generated superuser password
/// until every node runs the requested version, health is not red and enough
/// data nodes have joined, or `timeout` runs out.
pub struct SearchGate {
    client: Arc<dyn ClusterClient>,
    cluster_domain: String,
    timeout: Duration,
}

impl std::fmt::Debug for SearchGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SearchGate")
            .field("cluster_domain", &self.cluster_domain)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl SearchGate {
    pub fn new(client: Arc<dyn ClusterClient>, cluster_domain: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client,
            cluster_domain: cluster_domain.into(),
            timeout,
        }
    }

    async fn password(&self, namespace: &str, name: &str) -> Result<Option<String>, ControllerError> {
        let key = ObjectKey::new(ResourceKind::Secret, namespace, search_credentials(name));
        let Some(ManagedObject::Secret(secret)) = self.client.get(&key).await? else {
            return Ok(None);
        };
        let value = secret
            .data
            .as_ref()
            .and_then(|data| data.get(SEARCH_PASSWORD_KEY))
            .map(|bytes| String::from_utf8_lossy(&bytes.0).into_owned());
        Ok(value)
    }
}

#[async_trait::async_trait]
impl DependencyGate for SearchGate {
    async fn check(&self, instance: &MonitoringInstance) -> Result<GateStatus, ControllerError> {
        let (Some(namespace), Some(name)) = (instance.metadata.namespace.as_deref(), instance.metadata.name.as_deref())
        else {
            return Err(ControllerError::MissingField("metadata.namespace/name".to_string()));
        };

        let Some(password) = self.password(namespace, name).await? else {
            return Ok(GateStatus::Waiting("search credentials not created yet".to_string()));
        };

        let url = service_url(&search_service(name), namespace, &self.cluster_domain, SEARCH_HTTP_PORT);
        let client = SearchClient::new(
            url,
            Some(BasicAuth {
                username: SEARCH_USER.to_string(),
                password,
            }),
        )?;
        let target = ReadinessTarget::new(
            instance.spec.search.version.clone(),
            instance.spec.search.required_data_nodes(),
        );
        wait_for(&client, &target, self.timeout).await
    }
}

/// Runs the readiness gate, turning a timeout into [`GateStatus::Waiting`].
pub async fn wait_for(
    client: &dyn SearchClientTrait,
    target: &ReadinessTarget,
    timeout: Duration,
) -> Result<GateStatus, ControllerError> {
    match ReadinessGate::new(client).wait(target, timeout).await {
        Ok(_) => Ok(GateStatus::Ready),
        Err(SearchError::ReadinessTimeout { waited_secs, last_reason }) => {
            debug!(url = %client.base_url(), waited_secs, reason = %last_reason, "Search cluster not ready");
            Ok(GateStatus::Waiting(last_reason))
        }
        Err(e) => Err(e.into()),
    }
}
