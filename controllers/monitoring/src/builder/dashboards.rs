//! Dashboards frontend with provisioned search and metrics datasources.

use super::meta::{self, SEARCH_HTTP_PORT, SEARCH_PASSWORD_KEY, SEARCH_USER};
use super::metrics::{METRICS_PATH, METRICS_PORT};
use super::workload::{
    config_map, config_volume, container_port, credentials_secret, deployment, env, mount, pod_template, secret_env,
    service, service_port, tcp_probe,
};
use super::{BuildContext, Component};
use crate::error::ControllerError;
use crate::objects::ManagedObject;
use crds::DashboardsSpec;
use k8s_openapi::api::core::v1::{Container, PodSpec};
use serde_json::json;
use std::collections::BTreeMap;

pub const DASHBOARDS_PORT: i32 = 3000;

/// Path prefix the frontend is served under.
pub const DASHBOARDS_PATH: &str = "/dashboards";

const ADMIN_PASSWORD_KEY: &str = "admin-password";

pub(super) fn build(ctx: &BuildContext<'_>, spec: &DashboardsSpec) -> Result<Vec<ManagedObject>, ControllerError> {
    let component = Component::Dashboards.label();
    let name = ctx.child(component);
    let credentials = ctx.child("dashboards-credentials");
    let datasources = ctx.child("dashboards-datasources");

    let mut sources = vec![json!({
        "name": "Logs",
        "type": "elasticsearch",
        "access": "proxy",
        "url": ctx.service_url(&meta::search_service(ctx.name), SEARCH_HTTP_PORT),
        "database": "logs-*",
        "basicAuth": true,
        "basicAuthUser": SEARCH_USER,
        "secureJsonData": { "basicAuthPassword": "${ELASTIC_PASSWORD}" },
        "jsonData": { "timeField": "@timestamp", "esVersion": ctx.spec.search.version },
        "isDefault": ctx.spec.metrics.is_none(),
    })];
    if ctx.spec.metrics.is_some() {
        sources.push(json!({
            "name": "Metrics",
            "type": "prometheus",
            "access": "proxy",
            "url": format!("{}{METRICS_PATH}", ctx.service_url(&ctx.child("metrics"), METRICS_PORT)),
            "isDefault": true,
        }));
    }
    let provisioning = json!({ "apiVersion": 1, "datasources": sources });

    let container = Container {
        name: component.to_string(),
        image: Some(spec.image.clone().unwrap_or_else(|| ctx.settings.dashboards_image.clone())),
        env: Some(vec![
            env("GF_SECURITY_ADMIN_USER", "admin"),
            secret_env("GF_SECURITY_ADMIN_PASSWORD", &credentials, ADMIN_PASSWORD_KEY),
            env("GF_SERVER_ROOT_URL", format!("%(protocol)s://%(domain)s{DASHBOARDS_PATH}/")),
            env("GF_SERVER_SERVE_FROM_SUB_PATH", "true"),
            secret_env("ELASTIC_PASSWORD", &meta::search_credentials(ctx.name), SEARCH_PASSWORD_KEY),
        ]),
        ports: Some(vec![container_port("http", DASHBOARDS_PORT)]),
        volume_mounts: Some(vec![mount("datasources", "/etc/grafana/provisioning/datasources")]),
        readiness_probe: Some(tcp_probe(DASHBOARDS_PORT)),
        ..Default::default()
    };

    Ok(vec![
        ManagedObject::Secret(credentials_secret(
            ctx.meta(credentials.clone(), component),
            &[ADMIN_PASSWORD_KEY],
        )),
        ManagedObject::ConfigMap(config_map(
            ctx.meta(datasources.clone(), component),
            BTreeMap::from([("datasources.yaml".to_string(), serde_yaml::to_string(&provisioning)?)]),
        )),
        ManagedObject::Deployment(deployment(
            ctx.meta(name.clone(), component),
            spec.replicas,
            meta::selector(ctx.name, component),
            pod_template(
                meta::labels(ctx.name, component),
                PodSpec {
                    containers: vec![container],
                    volumes: Some(vec![config_volume("datasources", &datasources)]),
                    ..Default::default()
                },
            ),
        )),
        ManagedObject::Service(service(
            ctx.meta(name, component),
            meta::selector(ctx.name, component),
            vec![service_port("http", DASHBOARDS_PORT)],
            false,
        )),
    ])
}

#[cfg(test)]
mod tests {
    use crate::builder::{build, Component};
    use crate::objects::{ManagedObject, ANNOTATION_GENERATED_KEYS};
    use crate::test_utils::{full_spec, test_instance, test_settings};

    #[test]
    fn test_credentials_and_datasources() {
        let desired = build(&test_instance(full_spec()), &test_settings()).expect("build");
        let group = desired.group(Component::Dashboards).expect("dashboards group");

        let secret = group
            .objects
            .iter()
            .find(|o| matches!(o, ManagedObject::Secret(_)))
            .expect("credentials secret");
        assert_eq!(secret.name(), "logs-dashboards-credentials");
        assert_eq!(secret.annotation(ANNOTATION_GENERATED_KEYS), Some("admin-password"));

        let datasources = group
            .objects
            .iter()
            .find_map(|o| match o {
                ManagedObject::ConfigMap(cm) => cm.data.as_ref().and_then(|d| d.get("datasources.yaml").cloned()),
                _ => None,
            })
            .expect("datasources");
        assert!(datasources.contains("http://logs-search.observability.svc.cluster.local:9200"));
        assert!(datasources.contains("http://logs-metrics.observability.svc.cluster.local:9090/prometheus"));
    }
}
