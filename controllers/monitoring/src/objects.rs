//! Managed object model.
//!
//! Every object the controller owns is one variant of [`ManagedObject`], so
//! fetching, comparing and writing stay typed end to end.

use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::batch::v1::{CronJob, Job};
use k8s_openapi::api::core::v1::{ConfigMap, Container, EnvVar, PodSpec, Secret, Service};
use k8s_openapi::api::networking::v1::Ingress;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde_json::{json, Value};
use std::fmt;

/// Annotation holding the SHA-256 of the desired object.
pub const ANNOTATION_FINGERPRINT: &str = "monitoring.microscaler.io/fingerprint";

/// Annotation listing the keys a credential Secret must hold.
pub const ANNOTATION_GENERATED_KEYS: &str = "monitoring.microscaler.io/generated-keys";

/// Kinds of objects the controller manages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceKind {
    Secret,
    ConfigMap,
    Service,
    StatefulSet,
    Deployment,
    Job,
    CronJob,
    Ingress,
}

impl ResourceKind {
    /// Every managed kind, in the order pruning visits them.
    pub const ALL: [ResourceKind; 8] = [
        ResourceKind::Ingress,
        ResourceKind::CronJob,
        ResourceKind::Job,
        ResourceKind::Deployment,
        ResourceKind::StatefulSet,
        ResourceKind::Service,
        ResourceKind::ConfigMap,
        ResourceKind::Secret,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ResourceKind::Secret => "Secret",
            ResourceKind::ConfigMap => "ConfigMap",
            ResourceKind::Service => "Service",
            ResourceKind::StatefulSet => "StatefulSet",
            ResourceKind::Deployment => "Deployment",
            ResourceKind::Job => "Job",
            ResourceKind::CronJob => "CronJob",
            ResourceKind::Ingress => "Ingress",
        }
    }

    /// Jobs cannot be updated in place; a changed Job gets a new name instead.
    pub fn is_immutable(self) -> bool {
        matches!(self, ResourceKind::Job)
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of a managed object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub kind: ResourceKind,
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(kind: ResourceKind, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind,
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}/{}", self.kind, self.namespace, self.name)
    }
}

/// A typed object owned by a MonitoringInstance.
#[derive(Debug, Clone, PartialEq)]
pub enum ManagedObject {
    Secret(Secret),
    ConfigMap(ConfigMap),
    Service(Service),
    StatefulSet(StatefulSet),
    Deployment(Deployment),
    Job(Job),
    CronJob(CronJob),
    Ingress(Ingress),
}

macro_rules! on_inner {
    ($obj:expr, $inner:ident => $body:expr) => {
        match $obj {
            ManagedObject::Secret($inner) => $body,
            ManagedObject::ConfigMap($inner) => $body,
            ManagedObject::Service($inner) => $body,
            ManagedObject::StatefulSet($inner) => $body,
            ManagedObject::Deployment($inner) => $body,
            ManagedObject::Job($inner) => $body,
            ManagedObject::CronJob($inner) => $body,
            ManagedObject::Ingress($inner) => $body,
        }
    };
}

impl ManagedObject {
    pub fn kind(&self) -> ResourceKind {
        match self {
            ManagedObject::Secret(_) => ResourceKind::Secret,
            ManagedObject::ConfigMap(_) => ResourceKind::ConfigMap,
            ManagedObject::Service(_) => ResourceKind::Service,
            ManagedObject::StatefulSet(_) => ResourceKind::StatefulSet,
            ManagedObject::Deployment(_) => ResourceKind::Deployment,
            ManagedObject::Job(_) => ResourceKind::Job,
            ManagedObject::CronJob(_) => ResourceKind::CronJob,
            ManagedObject::Ingress(_) => ResourceKind::Ingress,
        }
    }

    pub fn meta(&self) -> &ObjectMeta {
        on_inner!(self, o => &o.metadata)
    }

    pub fn meta_mut(&mut self) -> &mut ObjectMeta {
        on_inner!(self, o => &mut o.metadata)
    }

    pub fn name(&self) -> &str {
        self.meta().name.as_deref().unwrap_or_default()
    }

    pub fn namespace(&self) -> &str {
        self.meta().namespace.as_deref().unwrap_or_default()
    }

    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(self.kind(), self.namespace(), self.name())
    }

    pub fn to_json(&self) -> Result<Value, serde_json::Error> {
        on_inner!(self, o => serde_json::to_value(o))
    }

    pub fn fingerprint(&self) -> Option<&str> {
        self.annotation(ANNOTATION_FINGERPRINT)
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.meta()
            .annotations
            .as_ref()
            .and_then(|a| a.get(key))
            .map(String::as_str)
    }

    /// UID of the controlling owner, if any.
    pub fn owner_uid(&self) -> Option<&str> {
        self.meta()
            .owner_references
            .as_ref()?
            .iter()
            .find(|r| r.controller == Some(true))
            .map(|r| r.uid.as_str())
    }

    /// Fields the builder sets and the API server leaves alone.
    ///
    /// Two objects with equal projections (and equal fingerprints) need no write.
    pub fn drift_projection(&self) -> Value {
        match self {
            ManagedObject::Secret(_) => Value::Null,
            ManagedObject::ConfigMap(cm) => json!({ "data": cm.data }),
            ManagedObject::Service(svc) => {
                let spec = svc.spec.as_ref();
                let ports: Vec<Value> = spec
                    .and_then(|s| s.ports.as_ref())
                    .map(|ports| {
                        ports
                            .iter()
                            .map(|p| json!({ "name": p.name, "port": p.port, "targetPort": p.target_port }))
                            .collect()
                    })
                    .unwrap_or_default();
                json!({
                    "ports": ports,
                    "selector": spec.and_then(|s| s.selector.as_ref()),
                    "headless": spec.and_then(|s| s.cluster_ip.as_deref()) == Some("None"),
                })
            }
            ManagedObject::StatefulSet(sts) => {
                let spec = sts.spec.as_ref();
                json!({
                    "replicas": spec.and_then(|s| s.replicas),
                    "serviceName": spec.and_then(|s| s.service_name.as_ref()),
                    "pod": project_pod(spec.and_then(|s| s.template.spec.as_ref())),
                })
            }
            ManagedObject::Deployment(deploy) => {
                let spec = deploy.spec.as_ref();
                json!({
                    "replicas": spec.and_then(|s| s.replicas),
                    "pod": project_pod(spec.and_then(|s| s.template.spec.as_ref())),
                })
            }
            ManagedObject::Job(job) => json!({
                "pod": project_pod(job.spec.as_ref().and_then(|s| s.template.spec.as_ref())),
            }),
            ManagedObject::CronJob(cron) => {
                let spec = cron.spec.as_ref();
                json!({
                    "schedule": spec.map(|s| s.schedule.as_str()),
                    "pod": project_pod(
                        spec.and_then(|s| s.job_template.spec.as_ref())
                            .and_then(|j| j.template.spec.as_ref())
                    ),
                })
            }
            ManagedObject::Ingress(ing) => {
                let spec = ing.spec.as_ref();
                json!({
                    "ingressClassName": spec.and_then(|s| s.ingress_class_name.as_ref()),
                    "rules": spec.and_then(|s| s.rules.as_ref()),
                    "tls": spec.and_then(|s| s.tls.as_ref()),
                })
            }
        }
    }
}

fn project_pod(spec: Option<&PodSpec>) -> Value {
    let Some(spec) = spec else {
        return Value::Null;
    };
    json!({
        "initContainers": spec.init_containers.as_deref().map(project_containers),
        "containers": project_containers(&spec.containers),
    })
}

fn project_containers(containers: &[Container]) -> Vec<Value> {
    containers
        .iter()
        .map(|c| {
            json!({
                "name": c.name,
                "image": c.image,
                "command": c.command.as_ref().filter(|v| !v.is_empty()),
                "args": c.args.as_ref().filter(|v| !v.is_empty()),
                "env": project_env(c.env.as_deref().unwrap_or_default()),
            })
        })
        .collect()
}

/// Env vars as the API server stores them: empty values dropped, `fieldRef.apiVersion` defaulted.
fn project_env(env: &[EnvVar]) -> Vec<Value> {
    env.iter()
        .map(|var| {
            let mut source = var.value_from.clone();
            if let Some(field) = source.as_mut().and_then(|s| s.field_ref.as_mut()) {
                field.api_version.get_or_insert_with(|| "v1".to_string());
            }
            json!({
                "name": var.name,
                "value": var.value.as_deref().filter(|v| !v.is_empty()),
                "valueFrom": source,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::apps::v1::StatefulSetSpec;
    use k8s_openapi::api::core::v1::ServiceSpec;

    fn sts(replicas: i32) -> ManagedObject {
        ManagedObject::StatefulSet(StatefulSet {
            metadata: ObjectMeta {
                name: Some("logs-search-hot".to_string()),
                namespace: Some("observability".to_string()),
                ..Default::default()
            },
            spec: Some(StatefulSetSpec {
                replicas: Some(replicas),
                ..Default::default()
            }),
            status: None,
        })
    }

    #[test]
    fn test_key_and_kind() {
        let obj = sts(1);
        assert_eq!(obj.kind(), ResourceKind::StatefulSet);
        assert_eq!(
            obj.key(),
            ObjectKey::new(ResourceKind::StatefulSet, "observability", "logs-search-hot")
        );
        assert_eq!(obj.key().to_string(), "StatefulSet observability/logs-search-hot");
    }

    #[test]
    fn test_projection_tracks_replicas() {
        assert_eq!(sts(3).drift_projection(), sts(3).drift_projection());
        assert_ne!(sts(3).drift_projection(), sts(1).drift_projection());
    }

    #[test]
    fn test_projection_ignores_cluster_ip() {
        let svc = |ip: Option<&str>| {
            ManagedObject::Service(Service {
                metadata: ObjectMeta::default(),
                spec: Some(ServiceSpec {
                    cluster_ip: ip.map(str::to_string),
                    ..Default::default()
                }),
                status: None,
            })
        };
        assert_eq!(svc(None).drift_projection(), svc(Some("10.0.0.12")).drift_projection());
        assert_ne!(svc(None).drift_projection(), svc(Some("None")).drift_projection());
    }

    #[test]
    fn test_projection_ignores_server_defaulted_env() {
        let with_env = |env: Vec<EnvVar>| {
            let mut obj = sts(2);
            if let ManagedObject::StatefulSet(s) = &mut obj {
                let spec = s.spec.get_or_insert_with(Default::default);
                spec.template.spec = Some(PodSpec {
                    containers: vec![Container {
                        name: "search".to_string(),
                        env: Some(env),
                        ..Default::default()
                    }],
                    ..Default::default()
                });
            }
            obj.drift_projection()
        };
        let node_name = |api_version: Option<&str>| EnvVar {
            name: "node.name".to_string(),
            value: None,
            value_from: Some(k8s_openapi::api::core::v1::EnvVarSource {
                field_ref: Some(k8s_openapi::api::core::v1::ObjectFieldSelector {
                    field_path: "metadata.name".to_string(),
                    api_version: api_version.map(str::to_string),
                }),
                ..Default::default()
            }),
        };
        let empty = |value: Option<&str>| EnvVar {
            name: "EXTRA".to_string(),
            value: value.map(str::to_string),
            value_from: None,
        };

        assert_eq!(
            with_env(vec![node_name(None), empty(Some(""))]),
            with_env(vec![node_name(Some("v1")), empty(None)])
        );
        assert_ne!(
            with_env(vec![node_name(Some("v1"))]),
            with_env(vec![node_name(Some("v2"))])
        );
    }
}
