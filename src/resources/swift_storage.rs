use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Specification for the storage backend of a Swift object store
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
#[kube(
    kind = "SwiftStorage",
    group = "swift.openstack.org",
    version = "v1beta1",
    status = "SwiftStorageStatus",
    derive = "PartialEq",
    doc = "The storage nodes of a Swift object store",
    namespaced,
    shortname = "swiftstorage",
    printcolumn = r#"{ "name": "replicas", "type": "integer", "description": "desired storage replicas", "jsonPath": ".spec.replicas" }"#,
    printcolumn = r#"{ "name": "ready", "type": "integer", "description": "ready storage replicas", "jsonPath": ".status.readyCount" }"#,
    printcolumn = r#"{ "name": "status", "type": "string", "description": "ready condition", "jsonPath": ".status.conditions[?(@.type==\"Ready\")].status" }"#
)]
#[serde(rename_all = "camelCase")]
pub struct SwiftStorageSpec {
    /// Number of storage pods, each with its own persistent volume.
    #[serde(default = "defaults::replicas")]
    pub replicas: i32,

    /// Storage class used for the per-replica volume claim.
    ///
    /// When omitted, the cluster's default storage class is used.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class_name: Option<String>,

    /// Name of the ConfigMap holding the ring files.
    ///
    /// The ring data is owned by whatever builds the rings; it is only ever
    /// mounted read only by the storage pods.
    #[serde(default = "defaults::ring_config_map")]
    pub swift_ring_config_map: String,

    /// Image backing the account server, replicator, auditor and reaper.
    #[serde(default = "defaults::account_image")]
    pub container_image_account: String,

    /// Image backing the container server, replicator, auditor and updater.
    #[serde(default = "defaults::container_image")]
    pub container_image_container: String,

    /// Image backing the object server, replicator, auditor, updater and rsync.
    #[serde(default = "defaults::object_image")]
    pub container_image_object: String,

    /// Image backing the object expirer.
    #[serde(default = "defaults::proxy_image")]
    pub container_image_proxy: String,

    /// Image backing the memcached sidecar.
    #[serde(default = "defaults::memcached_image")]
    pub container_image_memcached: String,
}

/// The observed state of a swift storage instance
#[derive(Deserialize, Serialize, Clone, Default, Debug, JsonSchema, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct SwiftStorageStatus {
    /// Number of storage pods reporting ready
    pub ready_count: i32,

    /// The generation of the spec this status was computed from
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Currently only a `Ready` condition is reported
    pub conditions: Vec<Condition>,
}

/// Which image field of a [`SwiftStorageSpec`] backs a process role
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ImageSelector {
    Account,
    Container,
    Object,
    Proxy,
    Memcached,
}

impl SwiftStorageSpec {
    /// Resolve the image reference for a role
    pub fn image(&self, selector: ImageSelector) -> &str {
        match selector {
            ImageSelector::Account => &self.container_image_account,
            ImageSelector::Container => &self.container_image_container,
            ImageSelector::Object => &self.container_image_object,
            ImageSelector::Proxy => &self.container_image_proxy,
            ImageSelector::Memcached => &self.container_image_memcached,
        }
    }

    /// Reject values that no amount of retrying can turn into a working workload.
    pub fn validate(&self) -> Result<()> {
        if self.replicas < 0 {
            return Err(Error::IllegalSwiftStorage(format!(
                "replicas must not be negative, got {}",
                self.replicas
            )));
        }

        if self.swift_ring_config_map.trim().is_empty() {
            return Err(Error::IllegalSwiftStorage(
                "swiftRingConfigMap must not be empty".into(),
            ));
        }

        let images = [
            ("containerImageAccount", &self.container_image_account),
            ("containerImageContainer", &self.container_image_container),
            ("containerImageObject", &self.container_image_object),
            ("containerImageProxy", &self.container_image_proxy),
            ("containerImageMemcached", &self.container_image_memcached),
        ];
        if let Some((field, _)) = images.iter().find(|(_, image)| image.trim().is_empty()) {
            return Err(Error::IllegalSwiftStorage(format!("{field} must not be empty")));
        }

        Ok(())
    }
}

impl Default for SwiftStorageSpec {
    fn default() -> Self {
        Self {
            replicas: defaults::replicas(),
            storage_class_name: None,
            swift_ring_config_map: defaults::ring_config_map(),
            container_image_account: defaults::account_image(),
            container_image_container: defaults::container_image(),
            container_image_object: defaults::object_image(),
            container_image_proxy: defaults::proxy_image(),
            container_image_memcached: defaults::memcached_image(),
        }
    }
}

mod defaults {
    const REGISTRY: &str = "quay.io/podified-antelope-centos9";

    pub fn replicas() -> i32 {
        1
    }
    pub fn ring_config_map() -> String {
        "swift-ring-files".into()
    }
    pub fn account_image() -> String {
        format!("{REGISTRY}/openstack-swift-account:current-podified")
    }
    pub fn container_image() -> String {
        format!("{REGISTRY}/openstack-swift-container:current-podified")
    }
    pub fn object_image() -> String {
        format!("{REGISTRY}/openstack-swift-object:current-podified")
    }
    pub fn proxy_image() -> String {
        format!("{REGISTRY}/openstack-swift-proxy-server:current-podified")
    }
    pub fn memcached_image() -> String {
        format!("{REGISTRY}/openstack-memcached:current-podified")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absent_fields_take_defaults() {
        let spec: SwiftStorageSpec = serde_json::from_value(serde_json::json!({})).unwrap();

        assert_eq!(spec, SwiftStorageSpec::default());
        assert_eq!(spec.replicas, 1);
        assert_eq!(spec.swift_ring_config_map, "swift-ring-files");
        assert!(spec.storage_class_name.is_none());
    }

    #[test]
    fn images_are_selected_by_domain() {
        let spec: SwiftStorageSpec = serde_json::from_value(serde_json::json!({
            "containerImageAccount": "a",
            "containerImageContainer": "c",
            "containerImageObject": "o",
        }))
        .unwrap();

        assert_eq!(spec.image(ImageSelector::Account), "a");
        assert_eq!(spec.image(ImageSelector::Container), "c");
        assert_eq!(spec.image(ImageSelector::Object), "o");
        assert!(spec.image(ImageSelector::Memcached).ends_with("openstack-memcached:current-podified"));
    }

    #[test]
    fn negative_replicas_are_rejected() {
        let spec = SwiftStorageSpec {
            replicas: -1,
            ..Default::default()
        };

        assert!(matches!(spec.validate(), Err(Error::IllegalSwiftStorage(_))));
    }

    #[test]
    fn empty_ring_reference_is_rejected() {
        let spec = SwiftStorageSpec {
            swift_ring_config_map: " ".into(),
            ..Default::default()
        };

        let err = spec.validate().unwrap_err();
        assert!(err.to_string().contains("swiftRingConfigMap"));
    }

    #[test]
    fn empty_image_is_rejected() {
        let spec = SwiftStorageSpec {
            container_image_proxy: String::new(),
            ..Default::default()
        };

        let err = spec.validate().unwrap_err();
        assert!(err.to_string().contains("containerImageProxy"));
    }

    #[test]
    fn zero_replicas_are_valid() {
        let spec = SwiftStorageSpec {
            replicas: 0,
            ..Default::default()
        };

        assert!(spec.validate().is_ok());
    }
}
