//! Desired-state builder.
//!
//! Renders a `MonitoringInstance` plus the operator settings into ordered
//! groups of owned objects, one group per stack component. Building is a pure
//! function: no cluster I/O, and the same input always yields the same objects
//! and fingerprints.
//!
//! Group order is the write order. Search and metrics are infrastructure and
//! are applied unconditionally; every later group depends on a ready search
//! cluster and is applied only once the readiness gate passes.

mod dashboards;
mod ingress;
pub mod meta;
mod metrics;
mod policies;
mod search;
mod visualizer;
mod workload;

use crate::error::ControllerError;
use crate::objects::{ManagedObject, ObjectKey};
use crate::settings::OperatorSettings;
use crds::{CrdError, MonitoringInstance, MonitoringInstanceSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::Resource;
use std::collections::BTreeSet;
use std::fmt;

/// Longest instance name; leaves room for the longest derived object name.
pub const MAX_INSTANCE_NAME: usize = 28;

/// Stack component; each one is a group of objects and a status condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Component {
    Search,
    Metrics,
    Visualizer,
    Dashboards,
    Policies,
    Ingress,
}

impl Component {
    /// Every component, in build order.
    pub const ALL: [Component; 6] = [
        Component::Search,
        Component::Metrics,
        Component::Visualizer,
        Component::Dashboards,
        Component::Policies,
        Component::Ingress,
    ];

    /// Condition type in the instance status.
    pub fn as_str(self) -> &'static str {
        match self {
            Component::Search => "Search",
            Component::Metrics => "Metrics",
            Component::Visualizer => "Visualizer",
            Component::Dashboards => "Dashboards",
            Component::Policies => "Policies",
            Component::Ingress => "Ingress",
        }
    }

    /// Value of the `app.kubernetes.io/component` label.
    pub fn label(self) -> &'static str {
        match self {
            Component::Search => "search",
            Component::Metrics => "metrics",
            Component::Visualizer => "visualizer",
            Component::Dashboards => "dashboards",
            Component::Policies => "policies",
            Component::Ingress => "ingress",
        }
    }

    /// Whether the component waits for the search cluster.
    pub fn is_gated(self) -> bool {
        !matches!(self, Component::Search | Component::Metrics)
    }

    /// Components a spec turns on, in build order. Does not validate the spec.
    pub fn enabled_in(spec: &MonitoringInstanceSpec) -> Vec<Component> {
        Component::ALL
            .into_iter()
            .filter(|c| match c {
                Component::Search => true,
                Component::Metrics => spec.metrics.is_some(),
                Component::Visualizer => spec.visualizer.is_some(),
                Component::Dashboards => spec.dashboards.is_some(),
                Component::Policies => spec.policies.enabled,
                Component::Ingress => spec.ingress.is_some(),
            })
            .collect()
    }
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Objects of one component, in write order.
#[derive(Debug, Clone, PartialEq)]
pub struct ComponentGroup {
    pub component: Component,
    pub objects: Vec<ManagedObject>,
}

/// Everything an instance should own.
#[derive(Debug, Clone, PartialEq)]
pub struct DesiredState {
    pub groups: Vec<ComponentGroup>,
}

impl DesiredState {
    /// Keys of every emitted object; anything else the instance owns is pruned.
    pub fn keys(&self) -> BTreeSet<ObjectKey> {
        self.groups
            .iter()
            .flat_map(|g| g.objects.iter().map(ManagedObject::key))
            .collect()
    }

    #[cfg(test)]
    pub fn components(&self) -> impl Iterator<Item = Component> + '_ {
        self.groups.iter().map(|g| g.component)
    }

    #[cfg(test)]
    pub fn group(&self, component: Component) -> Option<&ComponentGroup> {
        self.groups.iter().find(|g| g.component == component)
    }
}

/// Inputs shared by the component builders.
pub(crate) struct BuildContext<'a> {
    pub spec: &'a MonitoringInstanceSpec,
    pub settings: &'a OperatorSettings,
    pub name: &'a str,
    pub namespace: &'a str,
    owner: OwnerReference,
}

impl<'a> BuildContext<'a> {
    fn new(instance: &'a MonitoringInstance, settings: &'a OperatorSettings) -> Result<Self, ControllerError> {
        let name = instance
            .metadata
            .name
            .as_deref()
            .ok_or_else(|| ControllerError::MissingField("metadata.name".to_string()))?;
        let namespace = instance
            .metadata
            .namespace
            .as_deref()
            .ok_or_else(|| ControllerError::MissingField("metadata.namespace".to_string()))?;
        if name.len() > MAX_INSTANCE_NAME {
            return Err(CrdError::invalid(
                "metadata.name",
                format!("must be at most {MAX_INSTANCE_NAME} characters"),
            )
            .into());
        }
        let owner = instance
            .controller_owner_ref(&())
            .ok_or_else(|| ControllerError::MissingField("metadata.uid".to_string()))?;

        Ok(Self {
            spec: &instance.spec,
            settings,
            name,
            namespace,
            owner,
        })
    }

    /// `<instance>-<suffix>`
    pub fn child(&self, suffix: &str) -> String {
        format!("{}-{}", self.name, suffix)
    }

    /// Metadata for an owned object: name, namespace, labels and owner.
    pub fn meta(&self, name: impl Into<String>, component: &str) -> ObjectMeta {
        ObjectMeta {
            name: Some(name.into()),
            namespace: Some(self.namespace.to_string()),
            labels: Some(meta::labels(self.name, component)),
            owner_references: Some(vec![self.owner.clone()]),
            ..Default::default()
        }
    }

    /// In-cluster base URL of a Service port.
    pub fn service_url(&self, service: &str, port: i32) -> String {
        meta::service_url(service, self.namespace, &self.settings.cluster_domain, port)
    }

    pub fn search_image(&self) -> String {
        let search = &self.spec.search;
        search
            .image
            .clone()
            .unwrap_or_else(|| format!("{}:{}", self.settings.search_image, search.version))
    }
}

/// Renders the desired state of an instance.
pub fn build(instance: &MonitoringInstance, settings: &OperatorSettings) -> Result<DesiredState, ControllerError> {
    let ctx = BuildContext::new(instance, settings)?;
    ctx.spec.validate()?;

    let mut rendered = vec![(Component::Search, search::build(&ctx)?)];
    if let Some(spec) = &ctx.spec.metrics {
        rendered.push((Component::Metrics, metrics::build(&ctx, spec)?));
    }
    if let Some(spec) = &ctx.spec.visualizer {
        rendered.push((Component::Visualizer, visualizer::build(&ctx, spec)));
    }
    if let Some(spec) = &ctx.spec.dashboards {
        rendered.push((Component::Dashboards, dashboards::build(&ctx, spec)?));
    }
    if ctx.spec.policies.enabled {
        rendered.push((Component::Policies, policies::build(&ctx)?));
    }
    if let Some(spec) = &ctx.spec.ingress {
        rendered.push((Component::Ingress, ingress::build(&ctx, spec)));
    }

    let groups = rendered
        .into_iter()
        .map(|(component, mut objects)| {
            for object in &mut objects {
                meta::stamp_fingerprint(object)?;
            }
            Ok(ComponentGroup { component, objects })
        })
        .collect::<Result<Vec<_>, ControllerError>>()?;

    Ok(DesiredState { groups })
}
