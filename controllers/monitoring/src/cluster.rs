//! Cluster API seam.
//!
//! The reconcile loop, applier and settings loader talk to Kubernetes only
//! through [`ClusterClient`]. [`KubeClusterClient`] is the real implementation;
//! tests use the in-memory client from `test_utils`.

use crate::error::ControllerError;
use crate::objects::{ManagedObject, ObjectKey, ResourceKind};
use crds::{MonitoringInstance, MonitoringInstanceStatus};
use k8s_openapi::api::admissionregistration::v1::ValidatingWebhookConfiguration;
use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::batch::v1::{CronJob, Job};
use k8s_openapi::api::core::v1::{ConfigMap, Secret, Service};
use k8s_openapi::api::networking::v1::Ingress;
use k8s_openapi::NamespaceResourceScope;
use kube::api::{DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::{Api, Client, Resource};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::Debug;
use std::time::Duration;
use tracing::debug;

/// Field manager recorded on every write.
pub const FIELD_MANAGER: &str = "monitoring-controller";

/// Builds the shared, rate-limited Kubernetes client.
///
/// `burst` requests are admitted per `window`, which averages out to the
/// configured QPS.
pub async fn connect(burst: u32, window: Duration) -> Result<Client, ControllerError> {
    let config = kube::Config::infer()
        .await
        .map_err(|e| ControllerError::InvalidConfig(format!("cannot load kubeconfig: {e}")))?;
    let client = kube::client::ClientBuilder::try_from(config)?
        .with_layer(&tower::limit::RateLimitLayer::new(u64::from(burst), window))
        .build();
    Ok(client)
}

/// Cluster operations used by the controller.
///
/// All async methods must be `Send` to work with Tokio's work-stealing runtime.
#[async_trait::async_trait]
pub trait ClusterClient: Send + Sync {
    /// Fetch an instance; `None` once it is gone.
    async fn get_instance(&self, namespace: &str, name: &str) -> Result<Option<MonitoringInstance>, ControllerError>;

    /// Replace the status subresource of an instance.
    async fn patch_instance_status(
        &self,
        namespace: &str,
        name: &str,
        status: &MonitoringInstanceStatus,
    ) -> Result<(), ControllerError>;

    async fn get(&self, key: &ObjectKey) -> Result<Option<ManagedObject>, ControllerError>;

    async fn create(&self, object: &ManagedObject) -> Result<(), ControllerError>;

    /// Full update; the object's resourceVersion guards against lost updates.
    async fn replace(&self, object: &ManagedObject) -> Result<(), ControllerError>;

    /// Background-propagation delete; an absent object is not an error.
    async fn delete(&self, key: &ObjectKey) -> Result<(), ControllerError>;

    async fn list(
        &self,
        kind: ResourceKind,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<ManagedObject>, ControllerError>;

    async fn get_webhook_config(&self, name: &str) -> Result<Option<ValidatingWebhookConfiguration>, ControllerError>;

    /// Writes back the `webhooks` of a configuration read with [`ClusterClient::get_webhook_config`].
    /// Its resourceVersion guards against lost updates.
    async fn patch_webhook_config(&self, config: &ValidatingWebhookConfiguration) -> Result<(), ControllerError>;
}

/// [`ClusterClient`] backed by the Kubernetes API.
#[derive(Clone)]
pub struct KubeClusterClient {
    client: Client,
}

impl std::fmt::Debug for KubeClusterClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeClusterClient").finish_non_exhaustive()
    }
}

trait Namespaced:
    Resource<Scope = NamespaceResourceScope, DynamicType = ()> + Clone + Debug + Serialize + DeserializeOwned
{
}

impl<K> Namespaced for K where
    K: Resource<Scope = NamespaceResourceScope, DynamicType = ()> + Clone + Debug + Serialize + DeserializeOwned
{
}

impl KubeClusterClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api<K: Namespaced>(&self, namespace: &str) -> Api<K> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn post_params() -> PostParams {
        PostParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        }
    }

    async fn get_typed<K: Namespaced>(&self, key: &ObjectKey) -> Result<Option<K>, ControllerError> {
        self.api::<K>(&key.namespace)
            .get_opt(&key.name)
            .await
            .map_err(|e| ControllerError::from_kube(e, key.to_string()))
    }

    async fn create_typed<K: Namespaced>(&self, key: ObjectKey, object: &K) -> Result<(), ControllerError> {
        self.api::<K>(&key.namespace)
            .create(&Self::post_params(), object)
            .await
            .map(|_| ())
            .map_err(|e| ControllerError::from_kube(e, key.to_string()))
    }

    async fn replace_typed<K: Namespaced>(&self, key: ObjectKey, object: &K) -> Result<(), ControllerError> {
        self.api::<K>(&key.namespace)
            .replace(&key.name, &Self::post_params(), object)
            .await
            .map(|_| ())
            .map_err(|e| ControllerError::from_kube(e, key.to_string()))
    }

    async fn delete_typed<K: Namespaced>(&self, key: &ObjectKey) -> Result<(), ControllerError> {
        match self
            .api::<K>(&key.namespace)
            .delete(&key.name, &DeleteParams::background())
            .await
        {
            Ok(_) => Ok(()),
            Err(e) => match ControllerError::from_kube(e, key.to_string()) {
                ControllerError::NotFound(_) => {
                    debug!("{} already gone", key);
                    Ok(())
                }
                other => Err(other),
            },
        }
    }

    async fn list_typed<K: Namespaced>(&self, namespace: &str, selector: &str) -> Result<Vec<K>, ControllerError> {
        let list = self
            .api::<K>(namespace)
            .list(&ListParams::default().labels(selector))
            .await?;
        Ok(list.items)
    }
}

#[async_trait::async_trait]
impl ClusterClient for KubeClusterClient {
    async fn get_instance(&self, namespace: &str, name: &str) -> Result<Option<MonitoringInstance>, ControllerError> {
        Ok(self.api::<MonitoringInstance>(namespace).get_opt(name).await?)
    }

    async fn patch_instance_status(
        &self,
        namespace: &str,
        name: &str,
        status: &MonitoringInstanceStatus,
    ) -> Result<(), ControllerError> {
        let patch = serde_json::json!({ "status": status });
        self.api::<MonitoringInstance>(namespace)
            .patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map(|_| ())
            .map_err(|e| ControllerError::from_kube(e, format!("MonitoringInstance {namespace}/{name}")))
    }

    async fn get(&self, key: &ObjectKey) -> Result<Option<ManagedObject>, ControllerError> {
        Ok(match key.kind {
            ResourceKind::Secret => self.get_typed::<Secret>(key).await?.map(ManagedObject::Secret),
            ResourceKind::ConfigMap => self.get_typed::<ConfigMap>(key).await?.map(ManagedObject::ConfigMap),
            ResourceKind::Service => self.get_typed::<Service>(key).await?.map(ManagedObject::Service),
            ResourceKind::StatefulSet => self.get_typed::<StatefulSet>(key).await?.map(ManagedObject::StatefulSet),
            ResourceKind::Deployment => self.get_typed::<Deployment>(key).await?.map(ManagedObject::Deployment),
            ResourceKind::Job => self.get_typed::<Job>(key).await?.map(ManagedObject::Job),
            ResourceKind::CronJob => self.get_typed::<CronJob>(key).await?.map(ManagedObject::CronJob),
            ResourceKind::Ingress => self.get_typed::<Ingress>(key).await?.map(ManagedObject::Ingress),
        })
    }

    async fn create(&self, object: &ManagedObject) -> Result<(), ControllerError> {
        let key = object.key();
        match object {
            ManagedObject::Secret(o) => self.create_typed(key, o).await,
            ManagedObject::ConfigMap(o) => self.create_typed(key, o).await,
            ManagedObject::Service(o) => self.create_typed(key, o).await,
            ManagedObject::StatefulSet(o) => self.create_typed(key, o).await,
            ManagedObject::Deployment(o) => self.create_typed(key, o).await,
            ManagedObject::Job(o) => self.create_typed(key, o).await,
            ManagedObject::CronJob(o) => self.create_typed(key, o).await,
            ManagedObject::Ingress(o) => self.create_typed(key, o).await,
        }
    }

    async fn replace(&self, object: &ManagedObject) -> Result<(), ControllerError> {
        let key = object.key();
        match object {
            ManagedObject::Secret(o) => self.replace_typed(key, o).await,
            ManagedObject::ConfigMap(o) => self.replace_typed(key, o).await,
            ManagedObject::Service(o) => self.replace_typed(key, o).await,
            ManagedObject::StatefulSet(o) => self.replace_typed(key, o).await,
            ManagedObject::Deployment(o) => self.replace_typed(key, o).await,
            ManagedObject::Job(o) => self.replace_typed(key, o).await,
            ManagedObject::CronJob(o) => self.replace_typed(key, o).await,
            ManagedObject::Ingress(o) => self.replace_typed(key, o).await,
        }
    }

    async fn delete(&self, key: &ObjectKey) -> Result<(), ControllerError> {
        match key.kind {
            ResourceKind::Secret => self.delete_typed::<Secret>(key).await,
            ResourceKind::ConfigMap => self.delete_typed::<ConfigMap>(key).await,
            ResourceKind::Service => self.delete_typed::<Service>(key).await,
            ResourceKind::StatefulSet => self.delete_typed::<StatefulSet>(key).await,
            ResourceKind::Deployment => self.delete_typed::<Deployment>(key).await,
            ResourceKind::Job => self.delete_typed::<Job>(key).await,
            ResourceKind::CronJob => self.delete_typed::<CronJob>(key).await,
            ResourceKind::Ingress => self.delete_typed::<Ingress>(key).await,
        }
    }

    async fn list(
        &self,
        kind: ResourceKind,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<ManagedObject>, ControllerError> {
        Ok(match kind {
            ResourceKind::Secret => collect(self.list_typed::<Secret>(namespace, label_selector).await?, ManagedObject::Secret),
            ResourceKind::ConfigMap => {
                collect(self.list_typed::<ConfigMap>(namespace, label_selector).await?, ManagedObject::ConfigMap)
            }
            ResourceKind::Service => {
                collect(self.list_typed::<Service>(namespace, label_selector).await?, ManagedObject::Service)
            }
            ResourceKind::StatefulSet => {
                collect(self.list_typed::<StatefulSet>(namespace, label_selector).await?, ManagedObject::StatefulSet)
            }
            ResourceKind::Deployment => {
                collect(self.list_typed::<Deployment>(namespace, label_selector).await?, ManagedObject::Deployment)
            }
            ResourceKind::Job => collect(self.list_typed::<Job>(namespace, label_selector).await?, ManagedObject::Job),
            ResourceKind::CronJob => {
                collect(self.list_typed::<CronJob>(namespace, label_selector).await?, ManagedObject::CronJob)
            }
            ResourceKind::Ingress => {
                collect(self.list_typed::<Ingress>(namespace, label_selector).await?, ManagedObject::Ingress)
            }
        })
    }

    async fn get_webhook_config(&self, name: &str) -> Result<Option<ValidatingWebhookConfiguration>, ControllerError> {
        Ok(Api::<ValidatingWebhookConfiguration>::all(self.client.clone())
            .get_opt(name)
            .await?)
    }

    async fn patch_webhook_config(&self, config: &ValidatingWebhookConfiguration) -> Result<(), ControllerError> {
        let name = config.metadata.name.clone().unwrap_or_default();
        let patch = serde_json::json!({
            "metadata": { "resourceVersion": config.metadata.resource_version },
            "webhooks": config.webhooks,
        });
        let params = PatchParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };
        Api::<ValidatingWebhookConfiguration>::all(self.client.clone())
            .patch(&name, &params, &Patch::Merge(&patch))
            .await
            .map(|_| ())
            .map_err(|e| ControllerError::from_kube(e, format!("ValidatingWebhookConfiguration {name}")))
    }
}

fn collect<K>(items: Vec<K>, wrap: fn(K) -> ManagedObject) -> Vec<ManagedObject> {
    items.into_iter().map(wrap).collect()
}
