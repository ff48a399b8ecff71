//! Test utilities for unit testing the controller
//!
//! An in-memory [`ClusterClient`] plus fixtures for instances and settings.

use crate::cluster::ClusterClient;
use crate::error::ControllerError;
use crate::objects::{ManagedObject, ObjectKey, ResourceKind};
use crate::settings::OperatorSettings;
use crds::{
    AlertingSpec, DashboardsSpec, IngressSpec, MetricsSpec, MonitoringInstance, MonitoringInstanceSpec,
    MonitoringInstanceStatus, NodeRole, NodeSetSpec, PolicySpec, SearchSpec, VisualizerSpec,
};
use k8s_openapi::api::admissionregistration::v1::{ValidatingWebhook, ValidatingWebhookConfiguration, WebhookClientConfig};
use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use std::collections::BTreeMap;
use std::sync::Mutex;

pub const TEST_NAMESPACE: &str = "observability";
pub const TEST_NAME: &str = "logs";
pub const TEST_UID: &str = "uid-1";

#[derive(Default)]
struct MockState {
    instances: BTreeMap<(String, String), MonitoringInstance>,
    objects: BTreeMap<ObjectKey, ManagedObject>,
    webhook_configs: BTreeMap<String, ValidatingWebhookConfiguration>,
    next_version: u64,
    creates: usize,
    updates: usize,
    deletes: usize,
    status_patches: usize,
    webhook_patches: usize,
    injected_conflicts: usize,
}

impl MockState {
    fn bump(&mut self) -> String {
        self.next_version += 1;
        self.next_version.to_string()
    }
}

/// In-memory cluster with optimistic concurrency and write counters.
#[derive(Default)]
pub struct MockClusterClient {
    state: Mutex<MockState>,
}

impl std::fmt::Debug for MockClusterClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockClusterClient").finish_non_exhaustive()
    }
}

impl MockClusterClient {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().expect("mock state poisoned")
    }

    /// Stores an object out of band, as another actor would. Not counted.
    pub fn put_object(&self, mut object: ManagedObject) {
        let mut state = self.lock();
        let version = state.bump();
        object.meta_mut().resource_version = Some(version);
        state.objects.insert(object.key(), object);
    }

    /// Removes an object out of band. Not counted.
    pub fn remove_object(&self, key: &ObjectKey) -> Option<ManagedObject> {
        self.lock().objects.remove(key)
    }

    pub fn object(&self, key: &ObjectKey) -> Option<ManagedObject> {
        self.lock().objects.get(key).cloned()
    }

    pub fn objects(&self) -> Vec<ManagedObject> {
        self.lock().objects.values().cloned().collect()
    }

    pub fn object_count(&self) -> usize {
        self.lock().objects.len()
    }

    pub fn insert_instance(&self, instance: MonitoringInstance) {
        let key = (
            instance.metadata.namespace.clone().unwrap_or_default(),
            instance.metadata.name.clone().unwrap_or_default(),
        );
        self.lock().instances.insert(key, instance);
    }

    pub fn instance(&self, namespace: &str, name: &str) -> Option<MonitoringInstance> {
        self.lock()
            .instances
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    /// Marks an instance as being deleted.
    pub fn mark_deleting(&self, namespace: &str, name: &str) {
        if let Some(instance) = self
            .lock()
            .instances
            .get_mut(&(namespace.to_string(), name.to_string()))
        {
            instance.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
        }
    }

    /// Deletes an instance and garbage collects everything it controls.
    pub fn delete_instance(&self, namespace: &str, name: &str) {
        let mut state = self.lock();
        let Some(instance) = state.instances.remove(&(namespace.to_string(), name.to_string())) else {
            return;
        };
        let uid = instance.metadata.uid.unwrap_or_default();
        state.objects.retain(|_, obj| obj.owner_uid() != Some(uid.as_str()));
    }

    /// The next `count` create or replace calls fail with a conflict.
    pub fn inject_conflicts(&self, count: usize) {
        self.lock().injected_conflicts = count;
    }

    /// Create, replace and delete calls issued through the client.
    pub fn writes(&self) -> usize {
        let state = self.lock();
        state.creates + state.updates + state.deletes
    }

    pub fn creates(&self) -> usize {
        self.lock().creates
    }

    pub fn updates(&self) -> usize {
        self.lock().updates
    }

    pub fn deletes(&self) -> usize {
        self.lock().deletes
    }

    pub fn status_patches(&self) -> usize {
        self.lock().status_patches
    }

    /// Stores a webhook configuration out of band. Not counted.
    pub fn put_webhook_config(&self, mut config: ValidatingWebhookConfiguration) {
        let mut state = self.lock();
        config.metadata.resource_version = Some(state.bump());
        state
            .webhook_configs
            .insert(config.metadata.name.clone().unwrap_or_default(), config);
    }

    pub fn webhook_config(&self, name: &str) -> Option<ValidatingWebhookConfiguration> {
        self.lock().webhook_configs.get(name).cloned()
    }

    pub fn webhook_patches(&self) -> usize {
        self.lock().webhook_patches
    }
}

fn take_injected_conflict(state: &mut MockState, key: &ObjectKey) -> Result<(), ControllerError> {
    if state.injected_conflicts > 0 {
        state.injected_conflicts -= 1;
        return Err(ControllerError::Conflict(key.to_string()));
    }
    Ok(())
}

fn matches_selector(object: &ManagedObject, selector: &str) -> bool {
    let labels = object.meta().labels.clone().unwrap_or_default();
    selector
        .split(',')
        .filter(|term| !term.is_empty())
        .all(|term| match term.split_once('=') {
            Some((k, v)) => labels.get(k).map(String::as_str) == Some(v),
            None => labels.contains_key(term),
        })
}

#[async_trait::async_trait]
impl ClusterClient for MockClusterClient {
    async fn get_instance(&self, namespace: &str, name: &str) -> Result<Option<MonitoringInstance>, ControllerError> {
        Ok(self.instance(namespace, name))
    }

    async fn patch_instance_status(
        &self,
        namespace: &str,
        name: &str,
        status: &MonitoringInstanceStatus,
    ) -> Result<(), ControllerError> {
        let mut state = self.lock();
        state.status_patches += 1;
        let instance = state
            .instances
            .get_mut(&(namespace.to_string(), name.to_string()))
            .ok_or_else(|| ControllerError::NotFound(format!("MonitoringInstance {namespace}/{name}")))?;
        instance.status = Some(status.clone());
        Ok(())
    }

    async fn get(&self, key: &ObjectKey) -> Result<Option<ManagedObject>, ControllerError> {
        Ok(self.object(key))
    }

    async fn create(&self, object: &ManagedObject) -> Result<(), ControllerError> {
        let mut state = self.lock();
        let key = object.key();
        take_injected_conflict(&mut state, &key)?;
        if state.objects.contains_key(&key) {
            return Err(ControllerError::Conflict(key.to_string()));
        }
        let mut stored = object.clone();
        let version = state.bump();
        let meta = stored.meta_mut();
        meta.resource_version = Some(version);
        meta.uid = Some(format!("uid-{}", state.next_version));
        state.creates += 1;
        state.objects.insert(key, stored);
        Ok(())
    }

    async fn replace(&self, object: &ManagedObject) -> Result<(), ControllerError> {
        let mut state = self.lock();
        let key = object.key();
        take_injected_conflict(&mut state, &key)?;
        let live_version = match state.objects.get(&key) {
            Some(live) => live.meta().resource_version.clone(),
            None => return Err(ControllerError::NotFound(key.to_string())),
        };
        if object.meta().resource_version != live_version {
            return Err(ControllerError::Conflict(key.to_string()));
        }
        let mut stored = object.clone();
        stored.meta_mut().resource_version = Some(state.bump());
        state.updates += 1;
        state.objects.insert(key, stored);
        Ok(())
    }

    async fn delete(&self, key: &ObjectKey) -> Result<(), ControllerError> {
        let mut state = self.lock();
        state.deletes += 1;
        state.objects.remove(key);
        Ok(())
    }

    async fn list(
        &self,
        kind: ResourceKind,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<ManagedObject>, ControllerError> {
        Ok(self
            .lock()
            .objects
            .values()
            .filter(|o| o.kind() == kind && o.namespace() == namespace && matches_selector(o, label_selector))
            .cloned()
            .collect())
    }

    async fn get_webhook_config(&self, name: &str) -> Result<Option<ValidatingWebhookConfiguration>, ControllerError> {
        Ok(self.webhook_config(name))
    }

    async fn patch_webhook_config(&self, config: &ValidatingWebhookConfiguration) -> Result<(), ControllerError> {
        let mut state = self.lock();
        let name = config.metadata.name.clone().unwrap_or_default();
        let what = format!("ValidatingWebhookConfiguration {name}");
        let live_version = match state.webhook_configs.get(&name) {
            Some(live) => live.metadata.resource_version.clone(),
            None => return Err(ControllerError::NotFound(what)),
        };
        if config.metadata.resource_version != live_version {
            return Err(ControllerError::Conflict(what));
        }
        let version = state.bump();
        state.webhook_patches += 1;
        if let Some(live) = state.webhook_configs.get_mut(&name) {
            live.webhooks = config.webhooks.clone();
            live.metadata.resource_version = Some(version);
        }
        Ok(())
    }
}

/// Webhook configuration with `count` webhooks and no CA bundle.
pub fn webhook_config(name: &str, count: usize) -> ValidatingWebhookConfiguration {
    let webhook = |i: usize| ValidatingWebhook {
        name: format!("v{i}.monitoringinstances.monitoring.microscaler.io"),
        admission_review_versions: vec!["v1".to_string()],
        side_effects: "None".to_string(),
        client_config: WebhookClientConfig {
            ca_bundle: None,
            service: None,
            url: Some("https://monitoring-operator-webhook.monitoring.svc:9443/validate".to_string()),
        },
        ..Default::default()
    };
    ValidatingWebhookConfiguration {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        webhooks: Some((0..count).map(webhook).collect()),
    }
}

/// Helper to create a ConfigMap object
pub fn config_map(namespace: &str, name: &str, entries: &[(&str, &str)]) -> ManagedObject {
    ManagedObject::ConfigMap(ConfigMap {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        data: Some(
            entries
                .iter()
                .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                .collect(),
        ),
        ..Default::default()
    })
}

/// Settings with every default and metrics on 9102.
pub fn test_settings() -> OperatorSettings {
    let data = BTreeMap::from([("metricsPort".to_string(), "9102".to_string())]);
    OperatorSettings::from_data(&data).expect("test settings")
}

pub fn node_set(name: &str, roles: &[NodeRole], replicas: i32) -> NodeSetSpec {
    NodeSetSpec {
        name: name.to_string(),
        roles: roles.to_vec(),
        replicas,
        storage_size: "10Gi".to_string(),
        storage_class: None,
    }
}

/// Search-only spec: one master/data set, policies off.
pub fn minimal_spec() -> MonitoringInstanceSpec {
    MonitoringInstanceSpec {
        search: SearchSpec {
            version: "7.5.0".to_string(),
            image: None,
            heap_size: "1g".to_string(),
            node_sets: vec![node_set("all", &[NodeRole::Master, NodeRole::Data], 1)],
        },
        visualizer: None,
        dashboards: None,
        metrics: None,
        ingress: None,
        policies: PolicySpec {
            enabled: false,
            force_merge_schedule: None,
        },
    }
}

/// Every component enabled.
pub fn full_spec() -> MonitoringInstanceSpec {
    MonitoringInstanceSpec {
        search: SearchSpec {
            version: "7.5.0".to_string(),
            image: None,
            heap_size: "2g".to_string(),
            node_sets: vec![
                node_set("masters", &[NodeRole::Master], 3),
                node_set("hot", &[NodeRole::Data, NodeRole::Ingest], 2),
            ],
        },
        visualizer: Some(VisualizerSpec { replicas: 1, image: None }),
        dashboards: Some(DashboardsSpec { replicas: 1, image: None }),
        metrics: Some(MetricsSpec {
            image: None,
            retention: "15d".to_string(),
            storage_size: "10Gi".to_string(),
            scrape_interval: "30s".to_string(),
            alerting: Some(AlertingSpec { replicas: 1, image: None }),
        }),
        ingress: Some(IngressSpec {
            host: "monitoring.example.com".to_string(),
            ingress_class_name: Some("nginx".to_string()),
            tls_secret_name: Some("monitoring-tls".to_string()),
        }),
        policies: PolicySpec {
            enabled: true,
            force_merge_schedule: Some("0 3 * * *".to_string()),
        },
    }
}

/// Helper to create a test MonitoringInstance
pub fn test_instance(spec: MonitoringInstanceSpec) -> MonitoringInstance {
    let mut instance = MonitoringInstance::new(TEST_NAME, spec);
    instance.metadata.namespace = Some(TEST_NAMESPACE.to_string());
    instance.metadata.uid = Some(TEST_UID.to_string());
    instance.metadata.generation = Some(1);
    instance
}
