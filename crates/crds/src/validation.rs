//! Structural validation of `MonitoringInstance` specs.
//!
//! Shared by the reconciler (a failed validation becomes a status condition)
//! and the admission webhook (a failed validation denies the request).

use std::collections::HashSet;

use crate::error::CrdError;
use crate::monitoring_instance::{MonitoringInstanceSpec, NodeRole};

/// Longest node set name; keeps `<instance>-search-<set>-<ordinal>` a valid pod name.
pub const MAX_NODE_SET_NAME: usize = 24;

impl MonitoringInstanceSpec {
    /// Validates the spec without touching the cluster.
    pub fn validate(&self) -> Result<(), CrdError> {
        let search = &self.search;
        if search.version.trim().is_empty() {
            return Err(CrdError::invalid("spec.search.version", "must not be empty"));
        }
        if search.node_sets.is_empty() {
            return Err(CrdError::Incomplete(
                "spec.search.nodeSets must declare at least one node set".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for (idx, set) in search.node_sets.iter().enumerate() {
            let field = format!("spec.search.nodeSets[{idx}]");
            if !is_dns_label(&set.name) || set.name.len() > MAX_NODE_SET_NAME {
                return Err(CrdError::invalid(
                    format!("{field}.name"),
                    format!("{:?} must be a DNS-1123 label of at most {MAX_NODE_SET_NAME} characters", set.name),
                ));
            }
            if !seen.insert(set.name.as_str()) {
                return Err(CrdError::invalid(
                    format!("{field}.name"),
                    format!("duplicate node set name {:?}", set.name),
                ));
            }
            if set.replicas < 0 {
                return Err(CrdError::invalid(format!("{field}.replicas"), "must not be negative"));
            }
            if set.roles.is_empty() {
                return Err(CrdError::invalid(format!("{field}.roles"), "must hold at least one role"));
            }
            if set.storage_size.trim().is_empty() {
                return Err(CrdError::invalid(format!("{field}.storageSize"), "must not be empty"));
            }
        }

        if !search.master_sets().any(|set| set.replicas > 0) {
            return Err(CrdError::Incomplete(
                "at least one node set with the master role and replicas > 0 is required".to_string(),
            ));
        }
        if !search
            .node_sets
            .iter()
            .any(|set| set.roles.contains(&NodeRole::Data) && set.replicas > 0)
        {
            return Err(CrdError::Incomplete(
                "at least one node set with the data role and replicas > 0 is required".to_string(),
            ));
        }

        let replicas = [
            ("spec.visualizer.replicas", self.visualizer.as_ref().map(|v| v.replicas)),
            ("spec.dashboards.replicas", self.dashboards.as_ref().map(|d| d.replicas)),
            (
                "spec.metrics.alerting.replicas",
                self.metrics.as_ref().and_then(|m| m.alerting.as_ref()).map(|a| a.replicas),
            ),
        ];
        for (field, value) in replicas {
            if value.is_some_and(|r| r < 0) {
                return Err(CrdError::invalid(field, "must not be negative"));
            }
        }

        if let Some(ingress) = &self.ingress {
            if !is_host_name(&ingress.host) {
                return Err(CrdError::invalid(
                    "spec.ingress.host",
                    format!("{:?} is not a valid host name", ingress.host),
                ));
            }
        }

        if let Some(schedule) = &self.policies.force_merge_schedule {
            if schedule.split_whitespace().count() != 5 {
                return Err(CrdError::invalid(
                    "spec.policies.forceMergeSchedule",
                    "must be a five-field cron expression",
                ));
            }
        }

        Ok(())
    }
}

/// RFC 1123 label: lowercase alphanumerics and '-', alphanumeric at both ends, at most 63 chars.
pub fn is_dns_label(value: &str) -> bool {
    let bytes = value.as_bytes();
    if bytes.is_empty() || bytes.len() > 63 {
        return false;
    }
    let alnum = |b: &u8| b.is_ascii_lowercase() || b.is_ascii_digit();
    bytes.iter().all(|b| alnum(b) || *b == b'-')
        && bytes.first().is_some_and(alnum)
        && bytes.last().is_some_and(alnum)
}

fn is_host_name(value: &str) -> bool {
    let host = value.strip_prefix("*.").unwrap_or(value);
    !host.is_empty() && host.len() <= 253 && host.split('.').all(is_dns_label)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitoring_instance::*;

    fn valid_spec() -> MonitoringInstanceSpec {
        MonitoringInstanceSpec {
            search: SearchSpec {
                version: "7.5.0".to_string(),
                image: None,
                heap_size: "1g".to_string(),
                node_sets: vec![NodeSetSpec {
                    name: "default".to_string(),
                    roles: vec![NodeRole::Master, NodeRole::Data],
                    replicas: 3,
                    storage_size: "10Gi".to_string(),
                    storage_class: None,
                }],
            },
            visualizer: None,
            dashboards: None,
            metrics: None,
            ingress: None,
            policies: PolicySpec::default(),
        }
    }

    #[test]
    fn test_valid_spec_passes() {
        assert_eq!(valid_spec().validate(), Ok(()));
    }

    #[test]
    fn test_empty_node_sets_rejected() {
        let mut spec = valid_spec();
        spec.search.node_sets.clear();
        assert!(matches!(spec.validate(), Err(CrdError::Incomplete(_))));
    }

    #[test]
    fn test_duplicate_node_set_rejected() {
        let mut spec = valid_spec();
        let dup = spec.search.node_sets[0].clone();
        spec.search.node_sets.push(dup);
        let err = spec.validate().expect_err("duplicate names must fail");
        assert!(err.to_string().contains("duplicate"), "unexpected error: {err}");
    }

    #[test]
    fn test_missing_master_rejected() {
        let mut spec = valid_spec();
        spec.search.node_sets[0].roles = vec![NodeRole::Data];
        assert!(matches!(spec.validate(), Err(CrdError::Incomplete(_))));
    }

    #[test]
    fn test_bad_names_rejected() {
        for name in ["Upper", "-lead", "trail-", "with_underscore", "a-name-that-is-much-too-long-for-a-set"] {
            let mut spec = valid_spec();
            spec.search.node_sets[0].name = name.to_string();
            assert!(spec.validate().is_err(), "{name} should be rejected");
        }
    }

    #[test]
    fn test_negative_replicas_rejected() {
        let mut spec = valid_spec();
        spec.visualizer = Some(VisualizerSpec { replicas: -1, image: None });
        assert_eq!(
            spec.validate(),
            Err(CrdError::invalid("spec.visualizer.replicas", "must not be negative"))
        );
    }

    #[test]
    fn test_ingress_host_checked() {
        let mut spec = valid_spec();
        spec.ingress = Some(IngressSpec {
            host: "logs.example.com".to_string(),
            ingress_class_name: None,
            tls_secret_name: None,
        });
        assert_eq!(spec.validate(), Ok(()));

        spec.ingress = Some(IngressSpec {
            host: "not a host".to_string(),
            ingress_class_name: None,
            tls_secret_name: None,
        });
        assert!(spec.validate().is_err());
    }

    #[test]
    fn test_force_merge_schedule_shape() {
        let mut spec = valid_spec();
        spec.policies.force_merge_schedule = Some("0 3 * * *".to_string());
        assert_eq!(spec.validate(), Ok(()));
        spec.policies.force_merge_schedule = Some("daily".to_string());
        assert!(spec.validate().is_err());
    }
}
