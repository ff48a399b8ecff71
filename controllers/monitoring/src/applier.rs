//! Applier and differ.
//!
//! Converges live objects onto the builder's output: absent objects are
//! created, drifted ones updated from the live copy so cluster-assigned fields
//! survive, unchanged ones left alone. Objects the instance owns that the
//! builder no longer emits are pruned.

use crate::builder::meta::instance_selector;
use crate::builder::ComponentGroup;
use crate::cluster::ClusterClient;
use crate::credentials::{generate_password, PASSWORD_LENGTH};
use crate::error::ControllerError;
use crate::metrics::Metrics;
use crate::objects::{ManagedObject, ObjectKey, ResourceKind, ANNOTATION_GENERATED_KEYS};
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::ByteString;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info};

/// What happened to one object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Created,
    Updated,
    Unchanged,
}

/// Per-group tally.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ApplySummary {
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
}

impl ApplySummary {
    pub fn writes(&self) -> usize {
        self.created + self.updated
    }

    fn record(&mut self, outcome: ApplyOutcome) {
        match outcome {
            ApplyOutcome::Created => self.created += 1,
            ApplyOutcome::Updated => self.updated += 1,
            ApplyOutcome::Unchanged => self.unchanged += 1,
        }
    }
}

pub struct Applier<'a> {
    client: &'a dyn ClusterClient,
    metrics: &'a Metrics,
}

impl std::fmt::Debug for Applier<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Applier").finish_non_exhaustive()
    }
}

impl<'a> Applier<'a> {
    pub fn new(client: &'a dyn ClusterClient, metrics: &'a Metrics) -> Self {
        Self { client, metrics }
    }

    /// Applies a group in order, stopping at the first failure.
    pub async fn apply_group(&self, group: &ComponentGroup) -> Result<ApplySummary, ControllerError> {
        let mut summary = ApplySummary::default();
        for object in &group.objects {
            summary.record(self.apply_object(object).await?);
        }
        debug!(
            component = %group.component,
            created = summary.created,
            updated = summary.updated,
            unchanged = summary.unchanged,
            "Applied group"
        );
        Ok(summary)
    }

    pub async fn apply_object(&self, desired: &ManagedObject) -> Result<ApplyOutcome, ControllerError> {
        let key = desired.key();
        let Some(live) = self.client.get(&key).await? else {
            let mut object = desired.clone();
            if let ManagedObject::Secret(secret) = &mut object {
                fill_credentials(secret, &generated_keys(desired))?;
            }
            self.client.create(&object).await?;
            self.metrics.record_write(key.kind.as_str(), "create");
            info!(kind = %key.kind, namespace = %key.namespace, name = %key.name, "Created object");
            return Ok(ApplyOutcome::Created);
        };

        let mut merged = match (desired, &live) {
            (ManagedObject::Secret(_), ManagedObject::Secret(live_secret)) => {
                let mut secret = live_secret.clone();
                let filled = fill_credentials(&mut secret, &generated_keys(desired))?;
                if !filled && in_sync(desired, &live) {
                    return Ok(ApplyOutcome::Unchanged);
                }
                let mut object = desired.clone();
                if let ManagedObject::Secret(target) = &mut object {
                    target.data = secret.data;
                    target.type_ = secret.type_;
                }
                object
            }
            _ if key.kind.is_immutable() => return Ok(ApplyOutcome::Unchanged),
            _ if in_sync(desired, &live) => return Ok(ApplyOutcome::Unchanged),
            _ => desired.clone(),
        };

        merge_live(&mut merged, &live);
        self.client.replace(&merged).await?;
        self.metrics.record_write(key.kind.as_str(), "update");
        info!(kind = %key.kind, namespace = %key.namespace, name = %key.name, "Updated object");
        Ok(ApplyOutcome::Updated)
    }

    /// Deletes every object labelled for the instance, controlled by `owner_uid`,
    /// and missing from `keep`.
    pub async fn prune(
        &self,
        namespace: &str,
        instance: &str,
        owner_uid: &str,
        keep: &BTreeSet<ObjectKey>,
    ) -> Result<usize, ControllerError> {
        let selector = instance_selector(instance);
        let mut deleted = 0;
        for kind in ResourceKind::ALL {
            for object in self.client.list(kind, namespace, &selector).await? {
                let key = object.key();
                if object.owner_uid() != Some(owner_uid) || keep.contains(&key) {
                    continue;
                }
                self.client.delete(&key).await?;
                self.metrics.record_write(kind.as_str(), "delete");
                info!(kind = %key.kind, namespace = %key.namespace, name = %key.name, "Pruned object");
                deleted += 1;
            }
        }
        Ok(deleted)
    }
}

fn in_sync(desired: &ManagedObject, live: &ManagedObject) -> bool {
    desired.fingerprint().is_some()
        && desired.fingerprint() == live.fingerprint()
        && desired.owner_uid() == live.owner_uid()
        && desired.drift_projection() == live.drift_projection()
}

fn generated_keys(object: &ManagedObject) -> Vec<String> {
    object
        .annotation(ANNOTATION_GENERATED_KEYS)
        .map(|keys| {
            keys.split(',')
                .map(str::trim)
                .filter(|k| !k.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// Generates a password for each missing key. Existing values are never touched.
fn fill_credentials(secret: &mut Secret, keys: &[String]) -> Result<bool, ControllerError> {
    let data = secret.data.get_or_insert_with(BTreeMap::new);
    let mut filled = false;
    for key in keys {
        if !data.contains_key(key) {
            data.insert(key.clone(), ByteString(generate_password(PASSWORD_LENGTH)?.into_bytes()));
            filled = true;
        }
    }
    Ok(filled)
}

fn merge_maps(live: Option<&BTreeMap<String, String>>, desired: &mut Option<BTreeMap<String, String>>) {
    let Some(live) = live else {
        return;
    };
    let merged = desired.get_or_insert_with(BTreeMap::new);
    for (k, v) in live {
        merged.entry(k.clone()).or_insert_with(|| v.clone());
    }
}

/// Carries cluster-owned state from the live object into the update body.
fn merge_live(merged: &mut ManagedObject, live: &ManagedObject) {
    let live_meta = live.meta();
    {
        let meta = merged.meta_mut();
        meta.resource_version.clone_from(&live_meta.resource_version);
        meta.uid.clone_from(&live_meta.uid);
        merge_maps(live_meta.labels.as_ref(), &mut meta.labels);
        merge_maps(live_meta.annotations.as_ref(), &mut meta.annotations);
    }

    match (merged, live) {
        (ManagedObject::Service(target), ManagedObject::Service(live)) => {
            if let (Some(spec), Some(live_spec)) = (target.spec.as_mut(), live.spec.as_ref()) {
                spec.cluster_ip.clone_from(&live_spec.cluster_ip);
                spec.cluster_ips.clone_from(&live_spec.cluster_ips);
            }
        }
        (ManagedObject::StatefulSet(target), ManagedObject::StatefulSet(live)) => {
            if let (Some(spec), Some(live_spec)) = (target.spec.as_mut(), live.spec.as_ref()) {
                spec.volume_claim_templates.clone_from(&live_spec.volume_claim_templates);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::{build, DesiredState};
    use crate::test_utils::{full_spec, test_instance, test_settings, MockClusterClient, TEST_NAMESPACE, TEST_UID};
    use k8s_openapi::api::apps::v1::StatefulSet;

    fn desired() -> DesiredState {
        build(&test_instance(full_spec()), &test_settings()).expect("build")
    }

    async fn apply_all(client: &MockClusterClient, metrics: &Metrics, state: &DesiredState) -> ApplySummary {
        let applier = Applier::new(client, metrics);
        let mut total = ApplySummary::default();
        for group in &state.groups {
            let summary = applier.apply_group(group).await.expect("apply");
            total.created += summary.created;
            total.updated += summary.updated;
            total.unchanged += summary.unchanged;
        }
        total
    }

    fn key(kind: ResourceKind, name: &str) -> ObjectKey {
        ObjectKey::new(kind, TEST_NAMESPACE, name)
    }

    #[tokio::test]
    async fn test_second_pass_writes_nothing() {
        let client = MockClusterClient::new();
        let metrics = Metrics::new().expect("metrics");
        let state = desired();

        let first = apply_all(&client, &metrics, &state).await;
        assert_eq!(first.created, state.keys().len());
        let writes = client.writes();

        let second = apply_all(&client, &metrics, &state).await;
        assert_eq!(second.writes(), 0);
        assert_eq!(client.writes(), writes);
    }

    #[tokio::test]
    async fn test_deleted_object_is_recreated() {
        let client = MockClusterClient::new();
        let metrics = Metrics::new().expect("metrics");
        let state = desired();
        apply_all(&client, &metrics, &state).await;

        let svc = key(ResourceKind::Service, "logs-visualizer");
        client.remove_object(&svc);
        let summary = apply_all(&client, &metrics, &state).await;
        assert_eq!(summary.created, 1);
        assert!(client.object(&svc).is_some());
    }

    #[tokio::test]
    async fn test_mutated_object_is_restored() {
        let client = MockClusterClient::new();
        let metrics = Metrics::new().expect("metrics");
        let state = desired();
        apply_all(&client, &metrics, &state).await;

        let sts_key = key(ResourceKind::StatefulSet, "logs-search-hot");
        let Some(ManagedObject::StatefulSet(mut sts)) = client.object(&sts_key) else {
            panic!("statefulset missing");
        };
        if let Some(spec) = sts.spec.as_mut() {
            spec.replicas = Some(7);
        }
        client.put_object(ManagedObject::StatefulSet(sts));

        let summary = apply_all(&client, &metrics, &state).await;
        assert_eq!(summary.updated, 1);
        let restored: Option<StatefulSet> = match client.object(&sts_key) {
            Some(ManagedObject::StatefulSet(sts)) => Some(sts),
            _ => None,
        };
        assert_eq!(restored.and_then(|s| s.spec).and_then(|s| s.replicas), Some(2));
    }

    #[tokio::test]
    async fn test_update_keeps_cluster_assigned_fields() {
        let client = MockClusterClient::new();
        let metrics = Metrics::new().expect("metrics");
        let state = desired();
        apply_all(&client, &metrics, &state).await;

        let svc_key = key(ResourceKind::Service, "logs-search");
        let Some(ManagedObject::Service(mut svc)) = client.object(&svc_key) else {
            panic!("service missing");
        };
        if let Some(spec) = svc.spec.as_mut() {
            spec.cluster_ip = Some("10.96.0.17".to_string());
            spec.ports = None;
        }
        svc.metadata
            .labels
            .get_or_insert_with(BTreeMap::new)
            .insert("team".to_string(), "observability".to_string());
        client.put_object(ManagedObject::Service(svc));

        apply_all(&client, &metrics, &state).await;
        let Some(ManagedObject::Service(svc)) = client.object(&svc_key) else {
            panic!("service missing");
        };
        let spec = svc.spec.expect("spec");
        assert_eq!(spec.cluster_ip.as_deref(), Some("10.96.0.17"));
        assert_eq!(spec.ports.map(|p| p.len()), Some(1));
        assert_eq!(
            svc.metadata.labels.and_then(|l| l.get("team").cloned()).as_deref(),
            Some("observability")
        );
    }

    #[tokio::test]
    async fn test_credentials_generated_once() {
        let client = MockClusterClient::new();
        let metrics = Metrics::new().expect("metrics");
        let state = desired();
        apply_all(&client, &metrics, &state).await;

        let secret_key = key(ResourceKind::Secret, "logs-search-credentials");
        let password = |client: &MockClusterClient| match client.object(&secret_key) {
            Some(ManagedObject::Secret(s)) => s.data.and_then(|d| d.get("elastic").cloned()),
            _ => None,
        };
        let first = password(&client).expect("password generated");
        assert_eq!(first.0.len(), PASSWORD_LENGTH);

        apply_all(&client, &metrics, &state).await;
        assert_eq!(password(&client), Some(first.clone()));

        // A key removed out of band is regenerated, others stay untouched.
        let Some(ManagedObject::Secret(mut secret)) = client.object(&secret_key) else {
            panic!("secret missing");
        };
        secret.data = Some(BTreeMap::from([("other".to_string(), ByteString(b"keep".to_vec()))]));
        client.put_object(ManagedObject::Secret(secret));
        let summary = apply_all(&client, &metrics, &state).await;
        assert_eq!(summary.updated, 1);
        let Some(ManagedObject::Secret(secret)) = client.object(&secret_key) else {
            panic!("secret missing");
        };
        let data = secret.data.expect("data");
        assert_eq!(data.get("other"), Some(&ByteString(b"keep".to_vec())));
        assert_ne!(data.get("elastic"), Some(&first));
        assert_eq!(data.get("elastic").map(|v| v.0.len()), Some(PASSWORD_LENGTH));
    }

    #[tokio::test]
    async fn test_prune_removes_only_stale_owned_objects() {
        let client = MockClusterClient::new();
        let metrics = Metrics::new().expect("metrics");
        let state = desired();
        apply_all(&client, &metrics, &state).await;

        let mut stale = state.groups[0].objects[1].clone();
        stale.meta_mut().name = Some("logs-search-retired".to_string());
        client.put_object(stale.clone());

        let mut foreign = stale.clone();
        foreign.meta_mut().name = Some("logs-foreign".to_string());
        foreign.meta_mut().owner_references = None;
        client.put_object(foreign.clone());

        let applier = Applier::new(&client, &metrics);
        let deleted = applier
            .prune(TEST_NAMESPACE, "logs", TEST_UID, &state.keys())
            .await
            .expect("prune");
        assert_eq!(deleted, 1);
        assert!(client.object(&stale.key()).is_none());
        assert!(client.object(&foreign.key()).is_some());
        assert_eq!(client.object_count(), state.keys().len() + 1);
        assert_eq!(metrics.writes("ConfigMap", "delete"), 1);
    }

    #[tokio::test]
    async fn test_stale_write_surfaces_as_conflict() {
        let client = MockClusterClient::new();
        let metrics = Metrics::new().expect("metrics");
        let state = desired();
        client.inject_conflicts(1);

        let applier = Applier::new(&client, &metrics);
        let err = applier.apply_group(&state.groups[0]).await.expect_err("conflict");
        assert!(err.is_conflict());
    }

    /// Fills in what the API server defaults on write and the builder may leave unset.
    fn apply_server_defaults(object: &mut ManagedObject) -> bool {
        let pod = match object {
            ManagedObject::StatefulSet(sts) => sts.spec.as_mut().and_then(|s| s.template.spec.as_mut()),
            ManagedObject::Deployment(deploy) => deploy.spec.as_mut().and_then(|s| s.template.spec.as_mut()),
            _ => None,
        };
        let Some(pod) = pod else {
            return false;
        };
        let mut defaulted = false;
        for container in pod.containers.iter_mut().chain(pod.init_containers.iter_mut().flatten()) {
            for var in container.env.iter_mut().flatten() {
                if let Some(field) = var.value_from.as_mut().and_then(|s| s.field_ref.as_mut()) {
                    field.api_version = Some("v1".to_string());
                    defaulted = true;
                }
            }
        }
        defaulted
    }

    #[tokio::test]
    async fn test_server_defaults_do_not_trigger_updates() {
        let client = MockClusterClient::new();
        let metrics = Metrics::new().expect("metrics");
        let state = desired();
        apply_all(&client, &metrics, &state).await;

        let mut defaulted = 0;
        for mut object in client.objects() {
            if apply_server_defaults(&mut object) {
                defaulted += 1;
                client.put_object(object);
            }
        }
        assert!(defaulted >= 2, "search statefulsets carry downward-API env");

        let writes = client.writes();
        let second = apply_all(&client, &metrics, &state).await;
        assert_eq!(second.updated, 0);
        assert_eq!(client.writes(), writes);
    }
}
