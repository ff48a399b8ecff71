//! Metrics server and, when enabled, alert routing.

use super::workload::{
    config_map, config_volume, container_port, deployment, http_probe, label_selector, mount, pod_template, service,
    service_port, volume_claim,
};
use super::{BuildContext, Component};
use crate::error::ControllerError;
use crate::objects::ManagedObject;
use crds::{AlertingSpec, MetricsSpec};
use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetSpec};
use k8s_openapi::api::core::v1::{Container, EmptyDirVolumeSource, PodSecurityContext, PodSpec, Volume};
use serde_json::{json, Value};
use std::collections::BTreeMap;

pub const METRICS_PORT: i32 = 9090;
pub const ALERTING_PORT: i32 = 9093;

/// Path prefix the metrics server is served under, so the ingress can route to it.
pub const METRICS_PATH: &str = "/prometheus";

const ALERTING_LABEL: &str = "alerting";

pub(super) fn build(ctx: &BuildContext<'_>, spec: &MetricsSpec) -> Result<Vec<ManagedObject>, ControllerError> {
    let component = Component::Metrics.label();
    let name = ctx.child("metrics");
    let config_name = ctx.child("metrics-config");

    let mut objects = vec![
        ManagedObject::ConfigMap(config_map(
            ctx.meta(config_name.clone(), component),
            BTreeMap::from([("prometheus.yml".to_string(), serde_yaml::to_string(&scrape_config(ctx, spec))?)]),
        )),
        ManagedObject::StatefulSet(server(ctx, spec, &name, &config_name)),
        ManagedObject::Service(service(
            ctx.meta(name, component),
            super::meta::selector(ctx.name, component),
            vec![service_port("http", METRICS_PORT)],
            false,
        )),
    ];

    if let Some(alerting) = &spec.alerting {
        objects.extend(alert_routing(ctx, alerting)?);
    }
    Ok(objects)
}

fn scrape_config(ctx: &BuildContext<'_>, spec: &MetricsSpec) -> Value {
    let mut config = json!({
        "global": {
            "scrape_interval": spec.scrape_interval,
            "evaluation_interval": spec.scrape_interval,
        },
        "scrape_configs": [
            {
                "job_name": "metrics",
                "metrics_path": format!("{METRICS_PATH}/metrics"),
                "static_configs": [{ "targets": [format!("localhost:{METRICS_PORT}")] }],
            },
            {
                "job_name": "pods",
                "kubernetes_sd_configs": [{ "role": "pod", "namespaces": { "names": [ctx.namespace] } }],
                "relabel_configs": [
                    {
                        "source_labels": ["__meta_kubernetes_pod_annotation_prometheus_io_scrape"],
                        "action": "keep",
                        "regex": "true",
                    },
                    {
                        "source_labels": ["__meta_kubernetes_pod_label_monitoring_microscaler_io_instance"],
                        "target_label": "instance_name",
                    },
                ],
            },
        ],
    });
    if spec.alerting.is_some() {
        config["alerting"] = json!({
            "alertmanagers": [{
                "static_configs": [{ "targets": [format!("{}:{ALERTING_PORT}", ctx.child(ALERTING_LABEL))] }],
            }],
        });
    }
    config
}

fn server(ctx: &BuildContext<'_>, spec: &MetricsSpec, name: &str, config_name: &str) -> StatefulSet {
    let component = Component::Metrics.label();
    let image = spec
        .image
        .clone()
        .unwrap_or_else(|| ctx.settings.metrics_image.clone());

    let container = Container {
        name: "prometheus".to_string(),
        image: Some(image),
        args: Some(vec![
            "--config.file=/etc/prometheus/prometheus.yml".to_string(),
            "--storage.tsdb.path=/prometheus".to_string(),
            format!("--storage.tsdb.retention.time={}", spec.retention),
            format!("--web.external-url={METRICS_PATH}"),
        ]),
        ports: Some(vec![container_port("http", METRICS_PORT)]),
        volume_mounts: Some(vec![mount("config", "/etc/prometheus"), mount("data", "/prometheus")]),
        readiness_probe: Some(http_probe(&format!("{METRICS_PATH}/-/ready"), METRICS_PORT)),
        ..Default::default()
    };

    StatefulSet {
        metadata: ctx.meta(name, component),
        spec: Some(StatefulSetSpec {
            replicas: Some(1),
            service_name: Some(name.to_string()),
            selector: label_selector(super::meta::selector(ctx.name, component)),
            template: pod_template(
                super::meta::labels(ctx.name, component),
                PodSpec {
                    containers: vec![container],
                    volumes: Some(vec![config_volume("config", config_name)]),
                    security_context: Some(PodSecurityContext {
                        fs_group: Some(65534),
                        run_as_user: Some(65534),
                        run_as_non_root: Some(true),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
            ),
            volume_claim_templates: Some(vec![volume_claim(
                "data",
                &spec.storage_size,
                ctx.settings.storage_class.as_deref(),
            )]),
            ..Default::default()
        }),
        status: None,
    }
}

fn alert_routing(ctx: &BuildContext<'_>, spec: &AlertingSpec) -> Result<Vec<ManagedObject>, ControllerError> {
    let name = ctx.child(ALERTING_LABEL);
    let config_name = ctx.child("alerting-config");
    let config = json!({
        "route": { "receiver": "default", "group_by": ["alertname"] },
        "receivers": [{ "name": "default" }],
    });

    let container = Container {
        name: "alertmanager".to_string(),
        image: Some(spec.image.clone().unwrap_or_else(|| ctx.settings.alerting_image.clone())),
        args: Some(vec![
            "--config.file=/etc/alertmanager/alertmanager.yml".to_string(),
            "--storage.path=/alertmanager".to_string(),
        ]),
        ports: Some(vec![container_port("http", ALERTING_PORT)]),
        volume_mounts: Some(vec![mount("config", "/etc/alertmanager"), mount("storage", "/alertmanager")]),
        readiness_probe: Some(http_probe("/-/ready", ALERTING_PORT)),
        ..Default::default()
    };

    let pod = PodSpec {
        containers: vec![container],
        volumes: Some(vec![
            config_volume("config", &config_name),
            Volume {
                name: "storage".to_string(),
                empty_dir: Some(EmptyDirVolumeSource::default()),
                ..Default::default()
            },
        ]),
        ..Default::default()
    };

    Ok(vec![
        ManagedObject::ConfigMap(config_map(
            ctx.meta(config_name.clone(), ALERTING_LABEL),
            BTreeMap::from([("alertmanager.yml".to_string(), serde_yaml::to_string(&config)?)]),
        )),
        ManagedObject::Deployment(deployment(
            ctx.meta(name.clone(), ALERTING_LABEL),
            spec.replicas,
            super::meta::selector(ctx.name, ALERTING_LABEL),
            pod_template(super::meta::labels(ctx.name, ALERTING_LABEL), pod),
        )),
        ManagedObject::Service(service(
            ctx.meta(name, ALERTING_LABEL),
            super::meta::selector(ctx.name, ALERTING_LABEL),
            vec![service_port("http", ALERTING_PORT)],
            false,
        )),
    ])
}
