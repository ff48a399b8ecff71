//! Readiness gate for the search cluster.
//!
//! Dependent components (visualizer, dashboards, lifecycle policies, ingress)
//! are only rolled out once every node runs the target version, the cluster is
//! not red, and enough data nodes have joined.

use crate::error::SearchError;
use crate::models::{ClusterHealth, NodeInfo, HEALTH_RED};
use crate::search_trait::SearchClientTrait;
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

/// Interval between two polls.
pub const POLL_INTERVAL: Duration = Duration::from_secs(5);

/// What the cluster has to satisfy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadinessTarget {
    pub version: String,
    pub required_data_nodes: u32,
}

impl ReadinessTarget {
    pub fn new(version: impl Into<String>, required_data_nodes: u32) -> Self {
        Self {
            version: version.into(),
            required_data_nodes,
        }
    }
}

/// Why a poll did not satisfy the target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Insufficient {
    HealthUnavailable,
    NodesUnavailable,
    Red,
    VersionMismatch { node: String, version: String },
    NotEnoughDataNodes { found: u32, required: u32 },
}

impl fmt::Display for Insufficient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Insufficient::HealthUnavailable => write!(f, "cluster health unavailable"),
            Insufficient::NodesUnavailable => write!(f, "node list unavailable"),
            Insufficient::Red => write!(f, "cluster health is {HEALTH_RED}"),
            Insufficient::VersionMismatch { node, version } => {
                write!(f, "node {node:?} still runs version {version}")
            }
            Insufficient::NotEnoughDataNodes { found, required } => {
                write!(f, "{found} data node(s) on target version, {required} required")
            }
        }
    }
}

/// Evaluates one observation against the target.
///
/// Every node must run the target version, whatever its role; only data-role
/// nodes count toward the quorum.
pub fn check_sufficient(
    health: Option<&ClusterHealth>,
    nodes: Option<&[NodeInfo]>,
    target: &ReadinessTarget,
) -> Result<(), Insufficient> {
    let health = health.ok_or(Insufficient::HealthUnavailable)?;
    let nodes = nodes.ok_or(Insufficient::NodesUnavailable)?;

    if health.status == HEALTH_RED {
        return Err(Insufficient::Red);
    }

    if let Some(stale) = nodes.iter().find(|n| n.version != target.version) {
        return Err(Insufficient::VersionMismatch {
            node: stale.name.clone(),
            version: stale.version.clone(),
        });
    }

    let found = nodes.iter().filter(|n| n.is_data()).count();
    let found = u32::try_from(found).unwrap_or(u32::MAX);
    if found < target.required_data_nodes {
        return Err(Insufficient::NotEnoughDataNodes {
            found,
            required: target.required_data_nodes,
        });
    }

    Ok(())
}

/// State of a single check cycle; dropped once the gate resolves.
#[derive(Debug, Clone)]
pub struct ReadinessRecord {
    pub target: ReadinessTarget,
    pub health: Option<ClusterHealth>,
    pub nodes: Option<Vec<NodeInfo>>,
}

impl ReadinessRecord {
    pub fn evaluate(&self) -> Result<(), Insufficient> {
        check_sufficient(self.health.as_ref(), self.nodes.as_deref(), &self.target)
    }
}

/// Polls a search cluster until it satisfies a [`ReadinessTarget`].
pub struct ReadinessGate<'a> {
    client: &'a dyn SearchClientTrait,
    poll_interval: Duration,
}

impl fmt::Debug for ReadinessGate<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadinessGate")
            .field("url", &self.client.base_url())
            .field("poll_interval", &self.poll_interval)
            .finish()
    }
}

impl<'a> ReadinessGate<'a> {
    pub fn new(client: &'a dyn SearchClientTrait) -> Self {
        Self {
            client,
            poll_interval: POLL_INTERVAL,
        }
    }

    /// One observation. I/O failures are recorded as missing data, never returned.
    pub async fn poll(&self, target: &ReadinessTarget) -> ReadinessRecord {
        let health = match self.client.cluster_health().await {
            Ok(health) => Some(health),
            Err(e) => {
                debug!(url = %self.client.base_url(), error = %e, "cluster health request failed");
                None
            }
        };
        let nodes = match self.client.nodes().await {
            Ok(nodes) => Some(nodes),
            Err(e) => {
                debug!(url = %self.client.base_url(), error = %e, "node list request failed");
                None
            }
        };
        ReadinessRecord {
            target: target.clone(),
            health,
            nodes,
        }
    }

    /// Polls until the target holds or `deadline` has elapsed.
    pub async fn wait(&self, target: &ReadinessTarget, deadline: Duration) -> Result<ReadinessRecord, SearchError> {
        let started = Instant::now();
        loop {
            let record = self.poll(target).await;
            let reason = match record.evaluate() {
                Ok(()) => {
                    info!(
                        url = %self.client.base_url(),
                        version = %target.version,
                        data_nodes = target.required_data_nodes,
                        "search cluster ready"
                    );
                    return Ok(record);
                }
                Err(reason) => reason,
            };

            let waited = started.elapsed();
            if waited >= deadline {
                return Err(SearchError::ReadinessTimeout {
                    waited_secs: waited.as_secs(),
                    last_reason: reason.to_string(),
                });
            }

            info!(url = %self.client.base_url(), reason = %reason, "search cluster not ready yet");
            tokio::time::sleep(self.poll_interval.min(deadline - waited)).await;
        }
    }
}
