//! Response models for the search cluster API

use serde::{Deserialize, Serialize};

/// Health status value that marks the cluster as unusable.
pub const HEALTH_RED: &str = "red";

/// `GET /_cluster/health`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClusterHealth {
    /// "green", "yellow" or "red"
    pub status: String,

    #[serde(default)]
    pub cluster_name: Option<String>,

    #[serde(default)]
    pub number_of_nodes: Option<u32>,

    #[serde(default)]
    pub number_of_data_nodes: Option<u32>,
}

impl ClusterHealth {
    /// Health with only a status, used by tests and the mock.
    pub fn with_status(status: impl Into<String>) -> Self {
        Self {
            status: status.into(),
            cluster_name: None,
            number_of_nodes: None,
            number_of_data_nodes: None,
        }
    }
}

/// One row of `GET /_cat/nodes?format=json&h=name,version,node.role`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeInfo {
    #[serde(default)]
    pub name: String,

    pub version: String,

    /// Role designator, one letter per role (e.g. "dim")
    #[serde(rename = "node.role")]
    pub node_role: String,
}

impl NodeInfo {
    /// Builds a node entry from a version and role designator.
    pub fn new(name: impl Into<String>, version: impl Into<String>, node_role: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            node_role: node_role.into(),
        }
    }

    /// Whether the role designator carries the data flag.
    pub fn is_data(&self) -> bool {
        self.node_role.contains('d')
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cat_nodes_row_parses() {
        let nodes: Vec<NodeInfo> = serde_json::from_str(
            r#"[{"name":"logs-search-hot-0","version":"7.5.0","node.role":"dil"}]"#,
        )
        .expect("row should parse");
        assert_eq!(nodes[0].version, "7.5.0");
        assert!(nodes[0].is_data());
    }

    #[test]
    fn test_health_ignores_extra_fields() {
        let health: ClusterHealth = serde_json::from_str(
            r#"{"cluster_name":"logs","status":"yellow","timed_out":false,"number_of_nodes":3}"#,
        )
        .expect("health should parse");
        assert_eq!(health.status, "yellow");
        assert_eq!(health.number_of_nodes, Some(3));
    }
}
