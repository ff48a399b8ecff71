//! Phase transitions and status conditions.

use crate::builder::Component;
use chrono::{DateTime, Utc};
use crds::{ComponentCondition, ConditionStatus, InstancePhase, MonitoringInstanceStatus};

pub const REASON_APPLIED: &str = "Applied";
pub const REASON_PENDING: &str = "Pending";
pub const REASON_WAITING: &str = "WaitingForSearch";

/// How a reconcile pass ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassResult {
    /// Every group applied and pruned.
    Converged,
    /// Infrastructure applied, gated groups held back.
    Waiting,
    /// A recorded failure (build or apply).
    Failed,
    /// Deletion requested.
    Deleting,
}

pub fn next_phase(current: InstancePhase, result: PassResult) -> InstancePhase {
    let was_ready = matches!(current, InstancePhase::Ready | InstancePhase::Degraded);
    match result {
        PassResult::Deleting => InstancePhase::Terminating,
        PassResult::Converged => InstancePhase::Ready,
        PassResult::Waiting | PassResult::Failed if was_ready => InstancePhase::Degraded,
        PassResult::Waiting => InstancePhase::WaitingForDependencies,
        PassResult::Failed => InstancePhase::Provisioning,
    }
}

/// Condition of one component as observed by the current pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConditionUpdate {
    pub component: Component,
    pub status: ConditionStatus,
    pub reason: String,
    pub message: Option<String>,
}

impl ConditionUpdate {
    pub fn applied(component: Component) -> Self {
        Self {
            component,
            status: ConditionStatus::True,
            reason: REASON_APPLIED.to_string(),
            message: None,
        }
    }

    pub fn pending(component: Component) -> Self {
        Self {
            component,
            status: ConditionStatus::Unknown,
            reason: REASON_PENDING.to_string(),
            message: None,
        }
    }

    pub fn waiting(component: Component, reason: &str) -> Self {
        Self {
            component,
            status: ConditionStatus::False,
            reason: REASON_WAITING.to_string(),
            message: Some(reason.to_string()),
        }
    }

    pub fn failed(component: Component, reason: &str, message: String) -> Self {
        Self {
            component,
            status: ConditionStatus::False,
            reason: reason.to_string(),
            message: Some(message),
        }
    }
}

/// Computes the status to publish after a pass.
///
/// `lastTransitionTime` is carried over whenever a condition keeps its status,
/// so two identical passes produce identical statuses. A deleting instance
/// keeps its conditions and observed generation.
pub fn next_status(
    previous: Option<&MonitoringInstanceStatus>,
    generation: Option<i64>,
    result: PassResult,
    updates: Vec<ConditionUpdate>,
    now: DateTime<Utc>,
) -> MonitoringInstanceStatus {
    let phase = next_phase(previous.map(|s| s.phase).unwrap_or_default(), result);
    if result == PassResult::Deleting {
        let mut status = previous.cloned().unwrap_or_default();
        status.phase = phase;
        return status;
    }

    let conditions = updates
        .into_iter()
        .map(|update| {
            let type_ = update.component.as_str();
            let last_transition_time = match previous.and_then(|s| s.condition(type_)) {
                Some(prior) if prior.status == update.status => prior.last_transition_time,
                _ => Some(now),
            };
            ComponentCondition {
                type_: type_.to_string(),
                status: update.status,
                reason: update.reason,
                message: update.message,
                last_transition_time,
            }
        })
        .collect();

    MonitoringInstanceStatus {
        phase,
        conditions,
        observed_generation: generation.or_else(|| previous.and_then(|s| s.observed_generation)),
    }
}
