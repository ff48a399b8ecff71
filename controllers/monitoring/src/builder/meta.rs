//! Labels, derived names and fingerprints shared by every component.

use crate::error::ControllerError;
use crate::objects::{ManagedObject, ANNOTATION_FINGERPRINT};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";
pub const LABEL_APP_INSTANCE: &str = "app.kubernetes.io/instance";
pub const LABEL_COMPONENT: &str = "app.kubernetes.io/component";
pub const LABEL_INSTANCE: &str = "monitoring.microscaler.io/instance";
pub const LABEL_NODE_SET: &str = "monitoring.microscaler.io/node-set";

/// Value of `app.kubernetes.io/managed-by` on every owned object.
pub const MANAGER: &str = "monitoring-controller";

/// Built-in superuser of the search cluster.
pub const SEARCH_USER: &str = "elastic";
pub const SEARCH_PASSWORD_KEY: &str = "elastic";
pub const SEARCH_HTTP_PORT: i32 = 9200;

/// Label selector matching every object owned by an instance.
pub fn instance_selector(instance: &str) -> String {
    format!("{LABEL_INSTANCE}={instance}")
}

/// Label selector matching every object this controller manages.
pub fn managed_selector() -> String {
    format!("{LABEL_MANAGED_BY}={MANAGER}")
}

pub fn labels(instance: &str, component: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (LABEL_MANAGED_BY.to_string(), MANAGER.to_string()),
        (LABEL_APP_INSTANCE.to_string(), instance.to_string()),
        (LABEL_COMPONENT.to_string(), component.to_string()),
        (LABEL_INSTANCE.to_string(), instance.to_string()),
    ])
}

/// Pod selector of a component's workload.
pub fn selector(instance: &str, component: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (LABEL_COMPONENT.to_string(), component.to_string()),
        (LABEL_INSTANCE.to_string(), instance.to_string()),
    ])
}

pub fn search_service(instance: &str) -> String {
    format!("{instance}-search")
}

pub fn search_credentials(instance: &str) -> String {
    format!("{instance}-search-credentials")
}

/// In-cluster base URL of a Service port.
pub fn service_url(service: &str, namespace: &str, cluster_domain: &str, port: i32) -> String {
    format!("http://{service}.{namespace}.svc.{cluster_domain}:{port}")
}

/// StatefulSet and headless Service of a node set.
pub fn node_set(instance: &str, set: &str) -> String {
    format!("{instance}-search-{set}")
}

/// SHA-256 over the serialized object, excluding its own fingerprint annotation.
pub fn fingerprint(object: &ManagedObject) -> Result<String, ControllerError> {
    let mut bare = object.clone();
    if let Some(annotations) = bare.meta_mut().annotations.as_mut() {
        annotations.remove(ANNOTATION_FINGERPRINT);
        if annotations.is_empty() {
            bare.meta_mut().annotations = None;
        }
    }
    let bytes = serde_json::to_vec(&bare.to_json()?)?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

/// Hex digest of arbitrary content, used for content-addressed names.
pub fn digest(content: &[u8]) -> String {
    hex::encode(Sha256::digest(content))
}

pub(super) fn stamp_fingerprint(object: &mut ManagedObject) -> Result<(), ControllerError> {
    let value = fingerprint(object)?;
    object
        .meta_mut()
        .annotations
        .get_or_insert_with(BTreeMap::new)
        .insert(ANNOTATION_FINGERPRINT.to_string(), value);
    Ok(())
}
