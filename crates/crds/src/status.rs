//! MonitoringInstance status types

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MonitoringInstanceStatus {
    /// Lifecycle phase of the stack
    #[serde(default)]
    pub phase: InstancePhase,

    /// One condition per stack component
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<ComponentCondition>,

    /// Generation of the spec the last completed reconcile attempt acted on
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl MonitoringInstanceStatus {
    /// Looks up the condition for a component.
    pub fn condition(&self, type_: &str) -> Option<&ComponentCondition> {
        self.conditions.iter().find(|c| c.type_ == type_)
    }
}

/// Instance lifecycle phase
///
/// Serializes as PascalCase ("Ready", "Degraded", etc.) to match the CRD schema.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "PascalCase")]
pub enum InstancePhase {
    /// Accepted, nothing rendered yet
    #[default]
    Initializing,
    /// Owned resources are being created or updated
    Provisioning,
    /// Waiting for the search cluster before rolling out dependents
    WaitingForDependencies,
    /// Every component converged
    Ready,
    /// Was ready, a later pass or readiness check failed
    Degraded,
    /// Deletion requested; owned resources are garbage collected
    Terminating,
}

impl InstancePhase {
    /// PascalCase name as stored in the status subresource.
    pub fn as_str(self) -> &'static str {
        match self {
            InstancePhase::Initializing => "Initializing",
            InstancePhase::Provisioning => "Provisioning",
            InstancePhase::WaitingForDependencies => "WaitingForDependencies",
            InstancePhase::Ready => "Ready",
            InstancePhase::Degraded => "Degraded",
            InstancePhase::Terminating => "Terminating",
        }
    }
}

impl std::fmt::Display for InstancePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ComponentCondition {
    /// Component name (e.g. "Search", "Visualizer")
    #[serde(rename = "type")]
    pub type_: String,

    /// Whether the component is converged
    pub status: ConditionStatus,

    /// Machine readable reason (e.g. "Applied", "WaitingForSearch", "InvalidSpec")
    pub reason: String,

    /// Human readable detail
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Last time `status` changed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    /// Converged
    True,
    /// Not converged
    False,
    /// Not evaluated yet
    Unknown,
}
