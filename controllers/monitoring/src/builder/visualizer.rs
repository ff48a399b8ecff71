//! Log visualizer.

use super::meta::{self, SEARCH_HTTP_PORT, SEARCH_PASSWORD_KEY, SEARCH_USER};
use super::workload::{container_port, deployment, env, http_probe, pod_template, secret_env, service, service_port};
use super::{BuildContext, Component};
use crate::objects::ManagedObject;
use crds::VisualizerSpec;
use k8s_openapi::api::core::v1::{Container, PodSpec};

pub const VISUALIZER_PORT: i32 = 5601;

pub(super) fn build(ctx: &BuildContext<'_>, spec: &VisualizerSpec) -> Vec<ManagedObject> {
    let component = Component::Visualizer.label();
    let name = ctx.child(component);
    let image = spec.image.clone().unwrap_or_else(|| {
        format!("{}:{}", ctx.settings.visualizer_image, ctx.spec.search.version)
    });

    let container = Container {
        name: component.to_string(),
        image: Some(image),
        env: Some(vec![
            env("SERVER_NAME", name.clone()),
            env(
                "ELASTICSEARCH_HOSTS",
                ctx.service_url(&meta::search_service(ctx.name), SEARCH_HTTP_PORT),
            ),
            env("ELASTICSEARCH_USERNAME", SEARCH_USER),
            secret_env(
                "ELASTICSEARCH_PASSWORD",
                &meta::search_credentials(ctx.name),
                SEARCH_PASSWORD_KEY,
            ),
        ]),
        ports: Some(vec![container_port("http", VISUALIZER_PORT)]),
        readiness_probe: Some(http_probe("/api/status", VISUALIZER_PORT)),
        ..Default::default()
    };

    vec![
        ManagedObject::Deployment(deployment(
            ctx.meta(name.clone(), component),
            spec.replicas,
            meta::selector(ctx.name, component),
            pod_template(
                meta::labels(ctx.name, component),
                PodSpec {
                    containers: vec![container],
                    ..Default::default()
                },
            ),
        )),
        ManagedObject::Service(service(
            ctx.meta(name, component),
            meta::selector(ctx.name, component),
            vec![service_port("http", VISUALIZER_PORT)],
            false,
        )),
    ]
}
