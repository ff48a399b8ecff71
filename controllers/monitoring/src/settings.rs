//! Operator settings.
//!
//! Cluster-wide defaults read from a ConfigMap in the controller namespace at
//! startup. The object must exist and carry a valid `metricsPort`; everything
//! else has a default.

use crate::cluster::ClusterClient;
use crate::error::ControllerError;
use crate::objects::{ManagedObject, ObjectKey, ResourceKind};
use std::collections::BTreeMap;
use tracing::info;

pub const DEFAULT_CLUSTER_DOMAIN: &str = "cluster.local";
pub const DEFAULT_SEARCH_IMAGE: &str = "docker.elastic.co/elasticsearch/elasticsearch";
pub const DEFAULT_VISUALIZER_IMAGE: &str = "docker.elastic.co/kibana/kibana";
pub const DEFAULT_DASHBOARDS_IMAGE: &str = "grafana/grafana:10.4.2";
pub const DEFAULT_METRICS_IMAGE: &str = "prom/prometheus:v2.53.0";
pub const DEFAULT_ALERTING_IMAGE: &str = "prom/alertmanager:v0.27.0";
pub const DEFAULT_OPERATOR_IMAGE: &str = "ghcr.io/microscaler/monitoring-operator:latest";

/// Cluster-wide defaults applied by the builder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperatorSettings {
    /// Port the controller serves `/metrics` on
    pub metrics_port: u16,
    /// Search image repository; tagged with the instance's search version
    pub search_image: String,
    /// Visualizer image repository; tagged with the instance's search version
    pub visualizer_image: String,
    pub dashboards_image: String,
    pub metrics_image: String,
    pub alerting_image: String,
    /// Image carrying the `readiness-check` program
    pub operator_image: String,
    /// Storage class for volumes that do not name one
    pub storage_class: Option<String>,
    pub cluster_domain: String,
}

impl OperatorSettings {
    /// Parses the settings object's data. Pure; unknown keys are ignored.
    pub fn from_data(data: &BTreeMap<String, String>) -> Result<Self, ControllerError> {
        let raw_port = data
            .get("metricsPort")
            .ok_or_else(|| ControllerError::Settings("metricsPort is required".to_string()))?;
        let metrics_port = raw_port
            .trim()
            .parse::<u16>()
            .ok()
            .filter(|port| *port != 0)
            .ok_or_else(|| ControllerError::Settings(format!("metricsPort {raw_port:?} is not a valid port")))?;

        let text = |key: &str, default: &str| -> String {
            data.get(key)
                .map(|v| v.trim())
                .filter(|v| !v.is_empty())
                .unwrap_or(default)
                .to_string()
        };

        let cluster_domain = text("clusterDomain", DEFAULT_CLUSTER_DOMAIN);
        if cluster_domain.split('.').any(|label| !crds::validation::is_dns_label(label)) {
            return Err(ControllerError::Settings(format!(
                "clusterDomain {cluster_domain:?} is not a valid domain"
            )));
        }

        Ok(Self {
            metrics_port,
            search_image: text("searchImage", DEFAULT_SEARCH_IMAGE),
            visualizer_image: text("visualizerImage", DEFAULT_VISUALIZER_IMAGE),
            dashboards_image: text("dashboardsImage", DEFAULT_DASHBOARDS_IMAGE),
            metrics_image: text("metricsImage", DEFAULT_METRICS_IMAGE),
            alerting_image: text("alertingImage", DEFAULT_ALERTING_IMAGE),
            operator_image: text("operatorImage", DEFAULT_OPERATOR_IMAGE),
            storage_class: data
                .get("storageClass")
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty()),
            cluster_domain,
        })
    }

    /// Reads the settings ConfigMap. Absence is an error.
    pub async fn load(client: &dyn ClusterClient, namespace: &str, name: &str) -> Result<Self, ControllerError> {
        let key = ObjectKey::new(ResourceKind::ConfigMap, namespace, name);
        let data = match client.get(&key).await? {
            Some(ManagedObject::ConfigMap(cm)) => cm.data.unwrap_or_default(),
            Some(other) => {
                return Err(ControllerError::Settings(format!("{} is not a ConfigMap", other.key())));
            }
            None => {
                return Err(ControllerError::Settings(format!("settings object {key} not found")));
            }
        };
        let settings = Self::from_data(&data)?;
        info!(
            "Loaded operator settings from {}/{} (metrics port {}, cluster domain {})",
            namespace, name, settings.metrics_port, settings.cluster_domain
        );
        Ok(settings)
    }
}
