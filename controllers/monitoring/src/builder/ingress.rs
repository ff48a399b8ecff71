//! External routing: `/` to the visualizer, sub-paths to dashboards and metrics.

use super::dashboards::{DASHBOARDS_PATH, DASHBOARDS_PORT};
use super::metrics::{METRICS_PATH, METRICS_PORT};
use super::visualizer::VISUALIZER_PORT;
use super::{BuildContext, Component};
use crate::objects::ManagedObject;
use crds::IngressSpec;
use k8s_openapi::api::networking::v1::{
    HTTPIngressPath, HTTPIngressRuleValue, Ingress, IngressBackend, IngressRule, IngressServiceBackend,
    IngressSpec as IngressObjectSpec, IngressTLS, ServiceBackendPort,
};

/// Returns nothing when no routable component is enabled.
pub(super) fn build(ctx: &BuildContext<'_>, spec: &IngressSpec) -> Vec<ManagedObject> {
    let mut paths = Vec::new();
    if ctx.spec.dashboards.is_some() {
        paths.push(path(DASHBOARDS_PATH, ctx.child(Component::Dashboards.label()), DASHBOARDS_PORT));
    }
    if ctx.spec.metrics.is_some() {
        paths.push(path(METRICS_PATH, ctx.child(Component::Metrics.label()), METRICS_PORT));
    }
    if ctx.spec.visualizer.is_some() {
        paths.push(path("/", ctx.child(Component::Visualizer.label()), VISUALIZER_PORT));
    }
    if paths.is_empty() {
        return Vec::new();
    }

    let tls = spec.tls_secret_name.as_ref().map(|secret| {
        vec![IngressTLS {
            hosts: Some(vec![spec.host.clone()]),
            secret_name: Some(secret.clone()),
        }]
    });

    vec![ManagedObject::Ingress(Ingress {
        metadata: ctx.meta(ctx.child("ingress"), Component::Ingress.label()),
        spec: Some(IngressObjectSpec {
            ingress_class_name: spec.ingress_class_name.clone(),
            rules: Some(vec![IngressRule {
                host: Some(spec.host.clone()),
                http: Some(HTTPIngressRuleValue { paths }),
            }]),
            tls,
            ..Default::default()
        }),
        status: None,
    })]
}

fn path(prefix: &str, service: String, port: i32) -> HTTPIngressPath {
    HTTPIngressPath {
        path: Some(prefix.to_string()),
        path_type: "Prefix".to_string(),
        backend: IngressBackend {
            service: Some(IngressServiceBackend {
                name: service,
                port: Some(ServiceBackendPort {
                    number: Some(port),
                    name: None,
                }),
            }),
            resource: None,
        },
    }
}
