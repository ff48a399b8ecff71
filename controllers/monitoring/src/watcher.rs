//! Kubernetes resource watchers.
//!
//! One watcher follows `MonitoringInstance` objects; one metadata watcher per
//! owned kind follows objects labelled as managed by this controller. Every
//! event is mapped to the owning instance key and pushed onto the work queue.
//! Watch failures are retried with backoff and never end the stream.

use crate::builder::meta::managed_selector;
use crate::error::ControllerError;
use crate::objects::ResourceKind;
use crate::queue::WorkQueue;
use crds::{MonitoringInstance, API_GROUP};
use futures::StreamExt;
use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::batch::v1::{CronJob, Job};
use k8s_openapi::api::core::v1::{ConfigMap, Secret, Service};
use k8s_openapi::api::networking::v1::Ingress;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::NamespaceResourceScope;
use kube::{Api, Client, Resource};
use kube_runtime::{metadata_watcher, watcher, WatchStreamExt};
use serde::de::DeserializeOwned;
use std::fmt::Debug;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Which instances this process is responsible for.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WatchScope {
    pub namespace: Option<String>,
    pub instance_name: Option<String>,
}

impl WatchScope {
    /// Queue key of an instance, or `None` when it is out of scope.
    pub fn instance_key(&self, meta: &ObjectMeta) -> Option<String> {
        let namespace = meta.namespace.as_deref()?;
        let name = meta.name.as_deref()?;
        if self.namespace.as_deref().is_some_and(|ns| ns != namespace)
            || self.instance_name.as_deref().is_some_and(|n| n != name)
        {
            return None;
        }
        Some(format!("{namespace}/{name}"))
    }

    /// Queue key of the instance controlling an owned object.
    pub fn owner_key(&self, meta: &ObjectMeta) -> Option<String> {
        let owner = meta.owner_references.as_ref()?.iter().find(|r| {
            r.controller == Some(true)
                && r.kind == MonitoringInstance::kind(&())
                && r.api_version.split('/').next() == Some(API_GROUP)
        })?;
        let owner_meta = ObjectMeta {
            name: Some(owner.name.clone()),
            namespace: meta.namespace.clone(),
            ..Default::default()
        };
        self.instance_key(&owner_meta)
    }
}

/// Splits a queue key back into namespace and name.
pub fn split_key(key: &str) -> Result<(&str, &str), ControllerError> {
    key.split_once('/')
        .filter(|(ns, name)| !ns.is_empty() && !name.is_empty())
        .ok_or_else(|| ControllerError::InvalidConfig(format!("malformed queue key {key:?}")))
}

/// Objects carried by an event that should trigger a reconcile.
fn touched<T>(event: &watcher::Event<T>) -> Option<&T> {
    match event {
        watcher::Event::Apply(obj) | watcher::Event::InitApply(obj) | watcher::Event::Delete(obj) => Some(obj),
        watcher::Event::Init | watcher::Event::InitDone => None,
    }
}

/// Watches Kubernetes resources and feeds the work queue.
pub struct Watcher {
    client: Client,
    queue: Arc<WorkQueue>,
    scope: WatchScope,
}

impl Debug for Watcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Watcher").field("scope", &self.scope).finish_non_exhaustive()
    }
}

impl Watcher {
    pub fn new(client: Client, queue: Arc<WorkQueue>, scope: WatchScope) -> Self {
        Self { client, queue, scope }
    }

    fn api<K>(&self) -> Api<K>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>,
    {
        match &self.scope.namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        }
    }

    /// Starts watching MonitoringInstance resources.
    pub async fn watch_instances(&self) -> Result<(), ControllerError> {
        info!(context = "controller", "Starting MonitoringInstance watcher");

        let mut config = watcher::Config::default();
        if let Some(name) = &self.scope.instance_name {
            config = config.fields(&format!("metadata.name={name}"));
        }

        let mut stream = watcher(self.api::<MonitoringInstance>(), config)
            .default_backoff()
            .boxed();
        while let Some(result) = stream.next().await {
            match result {
                Ok(watcher::Event::InitDone) => info!("MonitoringInstance watcher initialization complete"),
                Ok(event) => {
                    if let Some(key) = touched(&event).and_then(|i| self.scope.instance_key(&i.metadata)) {
                        debug!(instance = %key, "MonitoringInstance event");
                        self.queue.add(&key);
                    }
                }
                Err(e) => warn!("MonitoringInstance watch error (retrying): {}", e),
            }
        }

        Err(ControllerError::Watch("MonitoringInstance watch stream ended".to_string()))
    }

    /// Starts watching one owned kind.
    pub async fn watch_owned(&self, kind: ResourceKind) -> Result<(), ControllerError> {
        match kind {
            ResourceKind::Secret => self.watch_metadata::<Secret>(kind).await,
            ResourceKind::ConfigMap => self.watch_metadata::<ConfigMap>(kind).await,
            ResourceKind::Service => self.watch_metadata::<Service>(kind).await,
            ResourceKind::StatefulSet => self.watch_metadata::<StatefulSet>(kind).await,
            ResourceKind::Deployment => self.watch_metadata::<Deployment>(kind).await,
            ResourceKind::Job => self.watch_metadata::<Job>(kind).await,
            ResourceKind::CronJob => self.watch_metadata::<CronJob>(kind).await,
            ResourceKind::Ingress => self.watch_metadata::<Ingress>(kind).await,
        }
    }

    async fn watch_metadata<K>(&self, kind: ResourceKind) -> Result<(), ControllerError>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
            + Clone
            + DeserializeOwned
            + Debug
            + Send
            + Sync
            + 'static,
    {
        debug!(context = "controller", kind = %kind, "Starting owned object watcher");

        let config = watcher::Config::default().labels(&managed_selector());
        let mut stream = metadata_watcher(self.api::<K>(), config).default_backoff().boxed();
        while let Some(result) = stream.next().await {
            match result {
                Ok(event) => {
                    if let Some(key) = touched(&event).and_then(|o| self.scope.owner_key(&o.metadata)) {
                        debug!(instance = %key, kind = %kind, "Owned object event");
                        self.queue.add(&key);
                    }
                }
                Err(e) => warn!(kind = %kind, "Owned object watch error (retrying): {}", e),
            }
        }

        Err(ControllerError::Watch(format!("{kind} watch stream ended")))
    }
}
