use std::collections::BTreeMap;

use k8s_openapi::{
    api::{
        apps::v1::{StatefulSet, StatefulSetSpec},
        core::v1::{
            Capabilities, ConfigMapVolumeSource, Container, ContainerPort, EmptyDirVolumeSource,
            PersistentVolumeClaim, PersistentVolumeClaimSpec, PodSecurityContext, PodSpec,
            PodTemplateSpec, ResourceRequirements, SeccompProfile, SecurityContext, Sysctl,
            Volume, VolumeMount,
        },
    },
    apimachinery::pkg::{api::resource::Quantity, apis::meta::v1::LabelSelector},
};
use kube::ResourceExt as _;

use crate::{labels, meta, resources::SwiftStorage, FIELD_MANAGER};

pub mod roles;

use roles::{Mounts, Role, INIT_ROLES, RUN_AS_USER, SERVER_ROLES, UNPRIVILEGED_PORT_START};

/// Name of the per-replica claim template, and of the volume it provides
pub const STORAGE_VOLUME: &str = "srv";
pub const CONFIG_VOLUME: &str = "config-data";
pub const RING_VOLUME: &str = "ring-data";
pub const MERGED_CONFIG_VOLUME: &str = "config-data-merged";

pub const STORAGE_MOUNT_PATH: &str = "/srv/node/d1";
pub const CONFIG_MOUNT_PATH: &str = "/var/lib/config-data/default";
pub const RING_MOUNT_PATH: &str = "/var/lib/config-data/rings";
pub const MERGED_CONFIG_MOUNT_PATH: &str = "/etc/swift";

/// Capacity requested for each replica's claim
pub const STORAGE_REQUEST: &str = "1Gi";

/// Synthesize the storage StatefulSet for a `SwiftStorage`.
///
/// This is a pure function of its input: no owner reference, no cluster
/// assigned metadata. Identical inputs produce identical outputs.
pub fn synthesize(storage: &SwiftStorage) -> StatefulSet {
    let name = storage.name_any();
    let selector = labels! { instance: &name };

    StatefulSet {
        metadata: meta! {
            name: Some(name.clone()),
            namespace: storage.namespace(),
            labels: Some(labels! { instance: &name, "app.kubernetes.io/managed-by" => FIELD_MANAGER }),
        },
        spec: Some(StatefulSetSpec {
            replicas: Some(storage.spec.replicas),
            service_name: name.clone(),
            selector: LabelSelector {
                match_labels: Some(selector.clone()),
                match_expressions: None,
            },
            template: PodTemplateSpec {
                metadata: Some(meta! { labels: Some(selector) }),
                spec: Some(PodSpec {
                    security_context: Some(pod_security_context()),
                    volumes: Some(volumes(storage)),
                    init_containers: Some(containers(storage, INIT_ROLES)),
                    containers: containers(storage, SERVER_ROLES),
                    ..Default::default()
                }),
            },
            volume_claim_templates: Some(vec![storage_claim_template(storage)]),
            ..Default::default()
        }),
        status: None,
    }
}

fn containers(storage: &SwiftStorage, roles: &[Role]) -> Vec<Container> {
    roles
        .iter()
        .map(|role| Container {
            name: role.name.into(),
            image: Some(storage.spec.image(role.image).into()),
            image_pull_policy: Some("IfNotPresent".into()),
            command: Some(role.command.iter().map(|arg| arg.to_string()).collect()),
            ports: role.port.map(|port| {
                vec![ContainerPort {
                    name: Some(port.name.into()),
                    container_port: port.number,
                    ..Default::default()
                }]
            }),
            security_context: Some(container_security_context()),
            volume_mounts: match role.mounts {
                Mounts::Storage => Some(storage_volume_mounts()),
                Mounts::None => None,
            },
            ..Default::default()
        })
        .collect()
}

fn storage_volume_mounts() -> Vec<VolumeMount> {
    vec![
        VolumeMount {
            name: STORAGE_VOLUME.into(),
            mount_path: STORAGE_MOUNT_PATH.into(),
            ..Default::default()
        },
        VolumeMount {
            name: CONFIG_VOLUME.into(),
            mount_path: CONFIG_MOUNT_PATH.into(),
            read_only: Some(true),
            ..Default::default()
        },
        VolumeMount {
            name: RING_VOLUME.into(),
            mount_path: RING_MOUNT_PATH.into(),
            read_only: Some(true),
            ..Default::default()
        },
        VolumeMount {
            name: MERGED_CONFIG_VOLUME.into(),
            mount_path: MERGED_CONFIG_MOUNT_PATH.into(),
            ..Default::default()
        },
    ]
}

/// Pod volumes. The storage volume is not listed here: it is provided by the claim template.
fn volumes(storage: &SwiftStorage) -> Vec<Volume> {
    vec![
        Volume {
            name: CONFIG_VOLUME.into(),
            config_map: Some(ConfigMapVolumeSource {
                name: Some(format!("{}-config-data", storage.name_any())),
                ..Default::default()
            }),
            ..Default::default()
        },
        Volume {
            name: RING_VOLUME.into(),
            config_map: Some(ConfigMapVolumeSource {
                name: Some(storage.spec.swift_ring_config_map.clone()),
                ..Default::default()
            }),
            ..Default::default()
        },
        Volume {
            name: MERGED_CONFIG_VOLUME.into(),
            empty_dir: Some(EmptyDirVolumeSource::default()),
            ..Default::default()
        },
    ]
}

fn storage_claim_template(storage: &SwiftStorage) -> PersistentVolumeClaim {
    PersistentVolumeClaim {
        metadata: meta! { name: Some(STORAGE_VOLUME.into()) },
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteOnce".into()]),
            storage_class_name: storage.spec.storage_class_name.clone(),
            resources: Some(ResourceRequirements {
                requests: Some(BTreeMap::from([(
                    "storage".into(),
                    Quantity(STORAGE_REQUEST.into()),
                )])),
                ..Default::default()
            }),
            ..Default::default()
        }),
        status: None,
    }
}

fn pod_security_context() -> PodSecurityContext {
    PodSecurityContext {
        run_as_user: Some(RUN_AS_USER),
        run_as_non_root: Some(true),
        fs_group: Some(RUN_AS_USER),
        // Only chown the volume when its root does not already match
        fs_group_change_policy: Some("OnRootMismatch".into()),
        seccomp_profile: Some(SeccompProfile {
            type_: "RuntimeDefault".into(),
            localhost_profile: None,
        }),
        sysctls: Some(vec![Sysctl {
            name: "net.ipv4.ip_unprivileged_port_start".into(),
            value: UNPRIVILEGED_PORT_START.to_string(),
        }]),
        ..Default::default()
    }
}

fn container_security_context() -> SecurityContext {
    SecurityContext {
        run_as_user: Some(RUN_AS_USER),
        run_as_non_root: Some(true),
        allow_privilege_escalation: Some(false),
        capabilities: Some(Capabilities {
            drop: Some(vec!["ALL".into()]),
            add: None,
        }),
        ..Default::default()
    }
}
