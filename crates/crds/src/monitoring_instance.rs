//! MonitoringInstance CRD
//!
//! Declares a complete observability stack: a search cluster made of one or
//! more node sets, an optional visualizer, dashboards, metrics/alerting,
//! ingress routing and index-lifecycle policies.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::status::MonitoringInstanceStatus;

/// API group of every resource owned by this operator.
pub const API_GROUP: &str = "monitoring.microscaler.io";

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[kube(
    group = "monitoring.microscaler.io",
    version = "v1alpha1",
    kind = "MonitoringInstance",
    namespaced,
    status = "MonitoringInstanceStatus",
    shortname = "mi",
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Version","type":"string","jsonPath":".spec.search.version"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct MonitoringInstanceSpec {
    /// Search/indexing cluster topology
    pub search: SearchSpec,

    /// Log visualizer (omit to disable)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub visualizer: Option<VisualizerSpec>,

    /// Dashboards frontend (omit to disable)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dashboards: Option<DashboardsSpec>,

    /// Metrics collection and alerting (omit to disable)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<MetricsSpec>,

    /// External HTTP routing (omit to disable)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ingress: Option<IngressSpec>,

    /// Index-lifecycle policies applied to the search cluster
    #[serde(default)]
    pub policies: PolicySpec,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SearchSpec {
    /// Search engine version (e.g. "7.5.0"); every node must run it before
    /// dependent components are rolled out
    pub version: String,

    /// Image override (defaults to the operator settings image tagged with `version`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    /// JVM heap size passed to every node (e.g. "1g")
    #[serde(default = "default_heap_size")]
    pub heap_size: String,

    /// Node sets; each becomes one StatefulSet
    pub node_sets: Vec<NodeSetSpec>,
}

fn default_heap_size() -> String {
    "1g".to_string()
}

impl SearchSpec {
    /// Number of data-role nodes the cluster must report before it counts as ready.
    pub fn required_data_nodes(&self) -> u32 {
        self.node_sets
            .iter()
            .filter(|set| set.roles.contains(&NodeRole::Data))
            .map(|set| u32::try_from(set.replicas).unwrap_or(0))
            .sum()
    }

    /// Node sets that may be elected master.
    pub fn master_sets(&self) -> impl Iterator<Item = &NodeSetSpec> {
        self.node_sets
            .iter()
            .filter(|set| set.roles.contains(&NodeRole::Master))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodeSetSpec {
    /// Node set name, unique within the instance
    pub name: String,

    /// Roles held by every node of the set
    pub roles: Vec<NodeRole>,

    /// Number of nodes
    pub replicas: i32,

    /// Persistent volume size per node (e.g. "50Gi")
    pub storage_size: String,

    /// Storage class (defaults to the operator settings storage class)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class: Option<String>,
}

/// Role of a search cluster node.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    /// Master-eligible
    Master,
    /// Holds data
    Data,
    /// Runs ingest pipelines
    Ingest,
}

impl NodeRole {
    /// Single-letter designator used by the search cluster's node listing.
    pub fn flag(self) -> char {
        match self {
            NodeRole::Master => 'm',
            NodeRole::Data => 'd',
            NodeRole::Ingest => 'i',
        }
    }

    /// Setting name used in the node configuration.
    pub fn setting(self) -> &'static str {
        match self {
            NodeRole::Master => "node.master",
            NodeRole::Data => "node.data",
            NodeRole::Ingest => "node.ingest",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VisualizerSpec {
    /// Number of replicas
    #[serde(default = "default_replicas")]
    pub replicas: i32,

    /// Image override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DashboardsSpec {
    /// Number of replicas
    #[serde(default = "default_replicas")]
    pub replicas: i32,

    /// Image override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSpec {
    /// Image override for the metrics server
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    /// Time series retention (e.g. "15d")
    #[serde(default = "default_retention")]
    pub retention: String,

    /// Persistent volume size
    #[serde(default = "default_metrics_storage")]
    pub storage_size: String,

    /// Global scrape interval
    #[serde(default = "default_scrape_interval")]
    pub scrape_interval: String,

    /// Alert routing (omit to disable)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alerting: Option<AlertingSpec>,
}

fn default_retention() -> String {
    "15d".to_string()
}

fn default_metrics_storage() -> String {
    "10Gi".to_string()
}

fn default_scrape_interval() -> String {
    "30s".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AlertingSpec {
    /// Number of replicas
    #[serde(default = "default_replicas")]
    pub replicas: i32,

    /// Image override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IngressSpec {
    /// Public host name
    pub host: String,

    /// Ingress class
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ingress_class_name: Option<String>,

    /// Secret holding the TLS certificate for `host`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls_secret_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PolicySpec {
    /// Install the bundled index-lifecycle policies
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Cron schedule for a periodic force-merge of rolled-over indices
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub force_merge_schedule: Option<String>,
}

impl Default for PolicySpec {
    fn default() -> Self {
        Self {
            enabled: true,
            force_merge_schedule: None,
        }
    }
}

fn default_replicas() -> i32 {
    1
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node_set(name: &str, roles: &[NodeRole], replicas: i32) -> NodeSetSpec {
        NodeSetSpec {
            name: name.to_string(),
            roles: roles.to_vec(),
            replicas,
            storage_size: "10Gi".to_string(),
            storage_class: None,
        }
    }

    #[test]
    fn test_required_data_nodes_counts_only_data_sets() {
        let search = SearchSpec {
            version: "7.5.0".to_string(),
            image: None,
            heap_size: default_heap_size(),
            node_sets: vec![
                node_set("masters", &[NodeRole::Master], 3),
                node_set("hot", &[NodeRole::Data, NodeRole::Ingest], 2),
                node_set("warm", &[NodeRole::Data], 1),
            ],
        };
        assert_eq!(search.required_data_nodes(), 3);
        assert_eq!(search.master_sets().count(), 1);
    }

    #[test]
    fn test_minimal_spec_defaults() {
        let spec: MonitoringInstanceSpec = serde_json::from_value(serde_json::json!({
            "search": {
                "version": "7.5.0",
                "nodeSets": [{"name": "all", "roles": ["master", "data"], "replicas": 1, "storageSize": "1Gi"}]
            },
            "metrics": {}
        }))
        .expect("spec should parse");

        assert_eq!(spec.search.heap_size, "1g");
        assert!(spec.policies.enabled);
        assert!(spec.visualizer.is_none());
        let metrics = spec.metrics.expect("metrics should be set");
        assert_eq!(metrics.retention, "15d");
        assert_eq!(metrics.scrape_interval, "30s");
        assert!(metrics.alerting.is_none());
    }

    #[test]
    fn test_role_flags() {
        assert_eq!(NodeRole::Master.flag(), 'm');
        assert_eq!(NodeRole::Data.flag(), 'd');
        assert_eq!(NodeRole::Ingest.flag(), 'i');
    }
}
