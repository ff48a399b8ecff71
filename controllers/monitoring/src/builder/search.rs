//! Search cluster: credentials, configuration, client Service and one
//! StatefulSet plus headless Service per node set.

use super::meta::{self, LABEL_NODE_SET, SEARCH_HTTP_PORT, SEARCH_PASSWORD_KEY};
use super::workload::{
    config_volume, container_port, credentials_secret, env, field_env, label_selector, mount, pod_template,
    secret_env, service, service_port, tcp_probe, volume_claim,
};
use super::{BuildContext, Component};
use crate::error::ControllerError;
use crate::objects::ManagedObject;
use crds::{NodeRole, NodeSetSpec};
use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetSpec};
use k8s_openapi::api::core::v1::{Container, PodSecurityContext, PodSpec, SecurityContext, VolumeMount};
use serde_json::json;
use std::collections::BTreeMap;

const TRANSPORT_PORT: i32 = 9300;
const CONFIG_FILE: &str = "elasticsearch.yml";
const HOME: &str = "/usr/share/elasticsearch";

pub(super) fn build(ctx: &BuildContext<'_>) -> Result<Vec<ManagedObject>, ControllerError> {
    let component = Component::Search.label();
    let config_name = ctx.child("search-config");

    let mut objects = vec![
        ManagedObject::Secret(credentials_secret(
            ctx.meta(meta::search_credentials(ctx.name), component),
            &[SEARCH_PASSWORD_KEY],
        )),
        ManagedObject::ConfigMap(super::workload::config_map(
            ctx.meta(config_name.clone(), component),
            BTreeMap::from([(CONFIG_FILE.to_string(), config_file()?)]),
        )),
        ManagedObject::Service(service(
            ctx.meta(meta::search_service(ctx.name), component),
            meta::selector(ctx.name, component),
            vec![service_port("http", SEARCH_HTTP_PORT)],
            false,
        )),
    ];

    for set in &ctx.spec.search.node_sets {
        let name = meta::node_set(ctx.name, &set.name);
        let mut selector = meta::selector(ctx.name, component);
        selector.insert(LABEL_NODE_SET.to_string(), set.name.clone());

        let mut svc_meta = ctx.meta(name.clone(), component);
        svc_meta
            .labels
            .get_or_insert_with(BTreeMap::new)
            .insert(LABEL_NODE_SET.to_string(), set.name.clone());
        objects.push(ManagedObject::Service(service(
            svc_meta,
            selector.clone(),
            vec![
                service_port("http", SEARCH_HTTP_PORT),
                service_port("transport", TRANSPORT_PORT),
            ],
            true,
        )));
        objects.push(ManagedObject::StatefulSet(node_set(ctx, set, &name, selector, &config_name)));
    }

    Ok(objects)
}

fn config_file() -> Result<String, ControllerError> {
    Ok(serde_yaml::to_string(&json!({
        "network.host": "0.0.0.0",
        "http.port": SEARCH_HTTP_PORT,
        "transport.port": TRANSPORT_PORT,
        "path.data": format!("{HOME}/data"),
        "xpack.security.enabled": true,
    }))?)
}

/// Headless Service names of the master-eligible sets.
fn seed_hosts(ctx: &BuildContext<'_>) -> String {
    ctx.spec
        .search
        .master_sets()
        .map(|set| meta::node_set(ctx.name, &set.name))
        .collect::<Vec<_>>()
        .join(",")
}

/// Pod names of every master-eligible node, for the first cluster bootstrap.
fn initial_masters(ctx: &BuildContext<'_>) -> String {
    ctx.spec
        .search
        .master_sets()
        .flat_map(|set| {
            let sts = meta::node_set(ctx.name, &set.name);
            (0..set.replicas.max(0)).map(move |ordinal| format!("{sts}-{ordinal}"))
        })
        .collect::<Vec<_>>()
        .join(",")
}

fn node_set(
    ctx: &BuildContext<'_>,
    set: &NodeSetSpec,
    name: &str,
    selector: BTreeMap<String, String>,
    config_name: &str,
) -> StatefulSet {
    let component = Component::Search.label();
    let search = &ctx.spec.search;
    let image = ctx.search_image();

    let mut env_vars = vec![
        env("cluster.name", ctx.name),
        field_env("node.name", "metadata.name"),
        env("discovery.seed_hosts", seed_hosts(ctx)),
        env("cluster.initial_master_nodes", initial_masters(ctx)),
        env("ES_JAVA_OPTS", format!("-Xms{0} -Xmx{0}", search.heap_size)),
        secret_env("ELASTIC_PASSWORD", &meta::search_credentials(ctx.name), SEARCH_PASSWORD_KEY),
    ];
    for role in [NodeRole::Master, NodeRole::Data, NodeRole::Ingest] {
        env_vars.push(env(role.setting(), set.roles.contains(&role).to_string()));
    }

    let sysctl = Container {
        name: "sysctl".to_string(),
        image: Some(image.clone()),
        command: Some(vec![
            "sysctl".to_string(),
            "-w".to_string(),
            "vm.max_map_count=262144".to_string(),
        ]),
        security_context: Some(SecurityContext {
            privileged: Some(true),
            run_as_user: Some(0),
            ..Default::default()
        }),
        ..Default::default()
    };

    let node = Container {
        name: "search".to_string(),
        image: Some(image),
        env: Some(env_vars),
        ports: Some(vec![
            container_port("http", SEARCH_HTTP_PORT),
            container_port("transport", TRANSPORT_PORT),
        ]),
        volume_mounts: Some(vec![
            mount("data", &format!("{HOME}/data")),
            VolumeMount {
                sub_path: Some(CONFIG_FILE.to_string()),
                ..mount("config", &format!("{HOME}/config/{CONFIG_FILE}"))
            },
        ]),
        readiness_probe: Some(tcp_probe(SEARCH_HTTP_PORT)),
        ..Default::default()
    };

    let mut pod_labels = meta::labels(ctx.name, component);
    pod_labels.insert(LABEL_NODE_SET.to_string(), set.name.clone());

    let mut sts_meta = ctx.meta(name, component);
    sts_meta
        .labels
        .get_or_insert_with(BTreeMap::new)
        .insert(LABEL_NODE_SET.to_string(), set.name.clone());

    let storage_class = set
        .storage_class
        .as_deref()
        .or(ctx.settings.storage_class.as_deref());

    StatefulSet {
        metadata: sts_meta,
        spec: Some(StatefulSetSpec {
            replicas: Some(set.replicas),
            service_name: Some(name.to_string()),
            pod_management_policy: Some("Parallel".to_string()),
            selector: label_selector(selector),
            template: pod_template(
                pod_labels,
                PodSpec {
                    init_containers: Some(vec![sysctl]),
                    containers: vec![node],
                    volumes: Some(vec![config_volume("config", config_name)]),
                    security_context: Some(PodSecurityContext {
                        fs_group: Some(1000),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
            ),
            volume_claim_templates: Some(vec![volume_claim("data", &set.storage_size, storage_class)]),
            ..Default::default()
        }),
        status: None,
    }
}

#[cfg(test)]
mod tests {
    use crate::builder::{build, Component};
    use crate::objects::ManagedObject;
    use crate::test_utils::{full_spec, test_instance, test_settings};
    use k8s_openapi::api::apps::v1::StatefulSet;

    fn statefulset(name: &str) -> StatefulSet {
        let desired = build(&test_instance(full_spec()), &test_settings()).expect("build");
        let group = desired.group(Component::Search).expect("search group");
        group
            .objects
            .iter()
            .find_map(|o| match o {
                ManagedObject::StatefulSet(sts) if sts.metadata.name.as_deref() == Some(name) => Some(sts.clone()),
                _ => None,
            })
            .expect("statefulset")
    }

    fn env_value(sts: &StatefulSet, name: &str) -> Option<String> {
        let pod = sts.spec.as_ref()?.template.spec.as_ref()?;
        pod.containers[0]
            .env
            .as_ref()?
            .iter()
            .find(|e| e.name == name)
            .and_then(|e| e.value.clone())
    }

    #[test]
    fn test_roles_and_discovery() {
        let masters = statefulset("logs-search-masters");
        assert_eq!(env_value(&masters, "node.master").as_deref(), Some("true"));
        assert_eq!(env_value(&masters, "node.data").as_deref(), Some("false"));

        let hot = statefulset("logs-search-hot");
        assert_eq!(env_value(&hot, "node.data").as_deref(), Some("true"));
        assert_eq!(env_value(&hot, "node.ingest").as_deref(), Some("true"));
        assert_eq!(env_value(&hot, "discovery.seed_hosts").as_deref(), Some("logs-search-masters"));
        assert_eq!(
            env_value(&hot, "cluster.initial_master_nodes").as_deref(),
            Some("logs-search-masters-0,logs-search-masters-1,logs-search-masters-2")
        );
        assert_eq!(env_value(&hot, "ES_JAVA_OPTS").as_deref(), Some("-Xms2g -Xmx2g"));
    }

    #[test]
    fn test_image_tagged_with_version_and_storage() {
        let hot = statefulset("logs-search-hot");
        let spec = hot.spec.as_ref().expect("spec");
        let pod = spec.template.spec.as_ref().expect("pod");
        assert_eq!(
            pod.containers[0].image.as_deref(),
            Some("docker.elastic.co/elasticsearch/elasticsearch:7.5.0")
        );
        assert_eq!(spec.replicas, Some(2));
        assert_eq!(spec.service_name.as_deref(), Some("logs-search-hot"));
        let claims = spec.volume_claim_templates.as_ref().expect("claims");
        assert_eq!(claims.len(), 1);
        assert_eq!(claims[0].metadata.name.as_deref(), Some("data"));
    }
}
