//! Bring the live storage StatefulSet in line with the synthesized one.
//!
//! Only fields we set are compared and written. Everything else on the live
//! object (server defaults, status, fields owned by other managers) is left
//! alone.

use std::{future::Future, time::Duration};

use k8s_openapi::{
    api::apps::v1::StatefulSet, apimachinery::pkg::apis::meta::v1::OwnerReference,
};
use kube::{
    api::{Patch, PatchParams, PostParams},
    Api, ResourceExt as _,
};
use serde_json::Value;
use tracing::{debug, info};

use crate::{config::Settings, Error, Result};

/// What applying a target did to the cluster
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The object did not exist and was created
    Created,
    /// The live object already matches on every managed field
    Unchanged,
    /// The live object had drifted and was patched back
    Patched,
    /// Someone else wrote the object between our read and our write
    Retry,
}

impl ApplyOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApplyOutcome::Created => "created",
            ApplyOutcome::Unchanged => "unchanged",
            ApplyOutcome::Patched => "patched",
            ApplyOutcome::Retry => "retry",
        }
    }
}

/// Applies synthesized StatefulSets through the cluster API
pub struct Applier {
    api: Api<StatefulSet>,
    field_manager: String,
    timeout: Duration,
}

impl Applier {
    pub fn new(api: Api<StatefulSet>, settings: &Settings) -> Self {
        Self {
            api,
            field_manager: settings.field_manager.clone(),
            timeout: settings.api_timeout,
        }
    }

    /// Create, leave or patch the live object so that it matches `target`.
    ///
    /// Returns the resulting live object, unless the outcome is [`ApplyOutcome::Retry`].
    pub async fn apply(
        &self,
        target: StatefulSet,
        owner: OwnerReference,
    ) -> Result<(ApplyOutcome, Option<StatefulSet>)> {
        let mut target = target;
        target.metadata.owner_references = Some(vec![owner]);
        let name = target.name_any();

        let live = self.bounded(self.api.get_opt(&name)).await?;

        let Some(live) = live else {
            info!(r#"Creating StatefulSet "{name}""#);
            let params = PostParams {
                field_manager: Some(self.field_manager.clone()),
                ..Default::default()
            };
            return match self.bounded(self.api.create(&params, &target)).await {
                Ok(created) => Ok((ApplyOutcome::Created, Some(created))),
                Err(e) => classify(e).map(|outcome| (outcome, None)),
            };
        };

        if !drifted(&target, &live)? {
            debug!(r#"StatefulSet "{name}" is up to date"#);
            return Ok((ApplyOutcome::Unchanged, Some(live)));
        }

        info!(r#"Patching drifted StatefulSet "{name}""#);
        let patch = managed_patch(target, live.resource_version());
        let params = PatchParams::apply(&self.field_manager).force();
        match self
            .bounded(self.api.patch(&name, &params, &Patch::Apply(&patch)))
            .await
        {
            Ok(patched) => Ok((ApplyOutcome::Patched, Some(patched))),
            Err(e) => classify(e).map(|outcome| (outcome, None)),
        }
    }

    /// Bound a single cluster call by the configured timeout.
    ///
    /// Dropping the call on timeout aborts it, and every call is atomic on the
    /// server, so a timed out write is either fully applied or not at all.
    async fn bounded<T>(
        &self,
        call: impl Future<Output = Result<T, kube::Error>>,
    ) -> Result<T> {
        tokio::time::timeout(self.timeout, call)
            .await
            .map_err(|_| Error::Timeout(self.timeout))?
            .map_err(Error::KubeError)
    }
}

/// Sort a failed write into a retry or a terminal error
fn classify(error: Error) -> Result<ApplyOutcome> {
    match error {
        Error::KubeError(kube::Error::Api(response)) if response.code == 409 => {
            info!("Write conflicted with a concurrent change: {}", response.message);
            Ok(ApplyOutcome::Retry)
        }
        Error::KubeError(kube::Error::Api(response)) if response.code == 422 => {
            Err(Error::RejectedWorkload(response.message))
        }
        other => Err(other),
    }
}

/// The body of a server-side apply: the target plus the live resourceVersion as precondition
pub fn managed_patch(target: StatefulSet, resource_version: Option<String>) -> StatefulSet {
    let mut patch = target;
    patch.metadata.resource_version = resource_version;
    patch.status = None;
    patch
}

/// Whether any field set on `target` differs on `live`
pub fn drifted(target: &StatefulSet, live: &StatefulSet) -> Result<bool> {
    let target = serde_json::to_value(target).map_err(Error::SerializationError)?;
    let live = serde_json::to_value(live).map_err(Error::SerializationError)?;

    Ok(!is_subset(&target, &live))
}

/// Structural containment: every key of `want` is present in `have` with a contained value.
///
/// Keyed lists (containers, volumes, owner references, ...) only need each wanted entry
/// to be contained in the entry with the same key; entries we never set are ignored.
/// Plain arrays must have the same length and be contained element by element.
fn is_subset(want: &Value, have: &Value) -> bool {
    contains(None, want, have)
}

fn contains(field: Option<&str>, want: &Value, have: &Value) -> bool {
    match (want, have) {
        (Value::Object(want), Value::Object(have)) => want.iter().all(|(key, value)| {
            have.get(key)
                .is_some_and(|h| contains(Some(key.as_str()), value, h))
        }),
        (Value::Array(want), Value::Array(have)) => match field.and_then(merge_key) {
            Some(key) if want.iter().all(|w| key(w).is_some()) => {
                // Entries owned by other managers may sit anywhere in the list
                want.iter().all(|w| {
                    have.iter()
                        .find(|h| key(h) == key(w))
                        .is_some_and(|h| contains(None, w, h))
                })
            }
            _ => {
                want.len() == have.len()
                    && want.iter().zip(have).all(|(w, h)| contains(None, w, h))
            }
        },
        (want, have) => want == have,
    }
}

type MergeKey = fn(&Value) -> Option<&Value>;

/// How entries of a keyed list are identified when several managers share it
fn merge_key(field: &str) -> Option<MergeKey> {
    fn name(v: &Value) -> Option<&Value> {
        v.get("name")
    }
    fn metadata_name(v: &Value) -> Option<&Value> {
        v.pointer("/metadata/name")
    }
    fn container_port(v: &Value) -> Option<&Value> {
        v.get("containerPort")
    }
    fn uid(v: &Value) -> Option<&Value> {
        v.get("uid")
    }

    match field {
        "containers" | "initContainers" | "volumes" | "volumeMounts" => Some(name as MergeKey),
        "volumeClaimTemplates" => Some(metadata_name as MergeKey),
        "ports" => Some(container_port as MergeKey),
        "ownerReferences" => Some(uid as MergeKey),
        _ => None,
    }
}
