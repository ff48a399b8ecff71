//! Index-lifecycle policies.
//!
//! The bundled policy documents ship in a ConfigMap. A Job waits for the search
//! cluster with the `readiness-check` program, then uploads each document.
//! Jobs are immutable, so the Job name carries a digest of everything it runs:
//! a changed policy or search version yields a new Job and the old one is
//! pruned.

use super::meta::{self, SEARCH_HTTP_PORT, SEARCH_PASSWORD_KEY, SEARCH_USER};
use super::workload::{config_map, config_volume, env, mount, pod_template, secret_env};
use super::{BuildContext, Component};
use crate::error::ControllerError;
use crate::objects::ManagedObject;
use k8s_openapi::api::batch::v1::{CronJob, CronJobSpec, Job, JobSpec, JobTemplateSpec};
use k8s_openapi::api::core::v1::{Container, EnvVar, PodSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde_json::json;
use std::collections::BTreeMap;

/// Policy documents, keyed by file name; the policy name is the file stem.
pub const POLICIES: [(&str, &str); 2] = [
    ("logs-default.json", include_str!("assets/logs-default.json")),
    ("logs-short-retention.json", include_str!("assets/logs-short-retention.json")),
];

const UPLOAD_SCRIPT: &str = "upload-policies.sh";
const UPLOAD_SCRIPT_BODY: &str = include_str!("assets/upload-policies.sh");
const MOUNT_PATH: &str = "/policies";

/// Seconds the init container waits for the search cluster.
const READINESS_TIMEOUT_SECS: u32 = 600;

pub(super) fn build(ctx: &BuildContext<'_>) -> Result<Vec<ManagedObject>, ControllerError> {
    let component = Component::Policies.label();
    let config_name = ctx.child("policies");

    let mut data: BTreeMap<String, String> = POLICIES
        .iter()
        .map(|(file, body)| ((*file).to_string(), (*body).to_string()))
        .collect();
    data.insert(UPLOAD_SCRIPT.to_string(), UPLOAD_SCRIPT_BODY.to_string());

    let pod = upload_pod(ctx, &config_name);
    let digest = meta::digest(&serde_json::to_vec(&json!({ "data": data, "pod": pod }))?);
    let job_name = format!("{}-{}", config_name, &digest[..8]);

    let mut objects = vec![
        ManagedObject::ConfigMap(config_map(ctx.meta(config_name.clone(), component), data)),
        ManagedObject::Job(Job {
            metadata: ctx.meta(job_name, component),
            spec: Some(JobSpec {
                backoff_limit: Some(6),
                template: pod_template(meta::labels(ctx.name, component), pod),
                ..Default::default()
            }),
            status: None,
        }),
    ];

    if let Some(schedule) = &ctx.spec.policies.force_merge_schedule {
        objects.push(ManagedObject::CronJob(force_merge(ctx, schedule)));
    }
    Ok(objects)
}

fn search_env(ctx: &BuildContext<'_>) -> Vec<EnvVar> {
    vec![
        env(
            "SEARCH_URL",
            ctx.service_url(&meta::search_service(ctx.name), SEARCH_HTTP_PORT),
        ),
        env("SEARCH_USERNAME", SEARCH_USER),
        secret_env("SEARCH_PASSWORD", &meta::search_credentials(ctx.name), SEARCH_PASSWORD_KEY),
    ]
}

fn upload_pod(ctx: &BuildContext<'_>, config_name: &str) -> PodSpec {
    let search = &ctx.spec.search;

    let mut wait_env = search_env(ctx);
    wait_env.extend([
        env("SEARCH_VERSION", search.version.clone()),
        env("SEARCH_DATA_NODES", search.required_data_nodes().to_string()),
        env("SEARCH_TIMEOUT_SECS", READINESS_TIMEOUT_SECS.to_string()),
    ]);

    let wait = Container {
        name: "wait-for-search".to_string(),
        image: Some(ctx.settings.operator_image.clone()),
        command: Some(vec!["readiness-check".to_string()]),
        env: Some(wait_env),
        ..Default::default()
    };

    let upload = Container {
        name: "upload".to_string(),
        image: Some(ctx.search_image()),
        command: Some(vec!["/bin/bash".to_string(), format!("{MOUNT_PATH}/{UPLOAD_SCRIPT}")]),
        env: Some(search_env(ctx)),
        volume_mounts: Some(vec![mount("policies", MOUNT_PATH)]),
        ..Default::default()
    };

    PodSpec {
        init_containers: Some(vec![wait]),
        containers: vec![upload],
        restart_policy: Some("OnFailure".to_string()),
        volumes: Some(vec![config_volume("policies", config_name)]),
        ..Default::default()
    }
}

fn force_merge(ctx: &BuildContext<'_>, schedule: &str) -> CronJob {
    let component = Component::Policies.label();
    let merge = Container {
        name: "forcemerge".to_string(),
        image: Some(ctx.search_image()),
        command: Some(vec![
            "/bin/bash".to_string(),
            "-c".to_string(),
            r#"curl --silent --show-error --fail --user "${SEARCH_USERNAME}:${SEARCH_PASSWORD}" --request POST "${SEARCH_URL}/logs-*/_forcemerge?max_num_segments=1""#
                .to_string(),
        ]),
        env: Some(search_env(ctx)),
        ..Default::default()
    };

    CronJob {
        metadata: ctx.meta(ctx.child("forcemerge"), component),
        spec: Some(CronJobSpec {
            schedule: schedule.to_string(),
            concurrency_policy: Some("Forbid".to_string()),
            successful_jobs_history_limit: Some(1),
            failed_jobs_history_limit: Some(3),
            job_template: JobTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(meta::labels(ctx.name, component)),
                    ..Default::default()
                }),
                spec: Some(JobSpec {
                    backoff_limit: Some(2),
                    template: pod_template(
                        meta::labels(ctx.name, component),
                        PodSpec {
                            containers: vec![merge],
                            restart_policy: Some("OnFailure".to_string()),
                            ..Default::default()
                        },
                    ),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        status: None,
    }
}
