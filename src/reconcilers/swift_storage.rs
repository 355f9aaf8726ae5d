use std::{future::Future, sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::{
    api::apps::v1::StatefulSet,
    apimachinery::pkg::apis::meta::v1::{Condition, Time},
};
use kube::{
    api::{Patch, PatchParams},
    runtime::{
        controller::Action,
        events::{Event, EventType},
    },
    Api, Resource as _, ResourceExt as _,
};
use serde_json::json;
use tracing::{info, warn};

use crate::{
    apply::{ApplyOutcome, Applier},
    resources::{SwiftStorage, SwiftStorageStatus},
    workload::synthesize,
    Error, Result,
};

use super::{Context, Reconcile};

pub const READY_CONDITION: &str = "Ready";

/// One reconciliation pass for the `SwiftStorage` identified by `namespace/name`.
///
/// The object is always fetched fresh; a vanished object ends the pass
/// successfully since its StatefulSet is garbage collected through the owner
/// reference.
pub async fn run_pass(context: Arc<Context>, namespace: &str, name: &str) -> Result<Action> {
    let storages = Api::<SwiftStorage>::namespaced(context.client.clone(), namespace);

    let fetched = bounded(&context, storages.get_opt(name)).await?;
    let Some(storage) = fetched else {
        info!(r#"SwiftStorage "{namespace}/{name}" is gone, nothing to do"#);
        return Ok(Action::await_change());
    };

    storage.reconcile(context).await
}

#[async_trait]
impl Reconcile for SwiftStorage {
    async fn reconcile(&self, context: Arc<Context>) -> Result<Action, Error> {
        let result = match self.spec.validate() {
            Ok(()) => self.deploy_resources(context.clone()).await,
            Err(e) => Err(e),
        };

        match result {
            // Someone wrote the StatefulSet under us, go again right away with a fresh read
            Ok((ApplyOutcome::Retry, _)) => Ok(Action::requeue(Duration::ZERO)),

            Ok((outcome, live)) => {
                if matches!(outcome, ApplyOutcome::Created | ApplyOutcome::Patched) {
                    self.publish(&context, outcome).await;
                }

                let ready = live
                    .and_then(|sts| sts.status)
                    .and_then(|s| s.ready_replicas)
                    .unwrap_or_default();
                let condition = if ready == self.spec.replicas {
                    ReadyCondition::ready(format!("{ready} storage replicas ready"))
                } else {
                    ReadyCondition::deploying(format!(
                        "{ready}/{} storage replicas ready",
                        self.spec.replicas
                    ))
                };
                self.report(&context, ready, condition).await;

                // Any further change arrives through the watches
                Ok(Action::await_change())
            }

            Err(e) => {
                let ready = self.status.as_ref().map(|s| s.ready_count).unwrap_or_default();
                self.report(&context, ready, ReadyCondition::failed(&e)).await;
                Err(e)
            }
        }
    }

    async fn deploy_resources(
        &self,
        context: Arc<Context>,
    ) -> Result<(ApplyOutcome, Option<StatefulSet>), Error> {
        let namespace = self.namespace().ok_or_else(|| {
            Error::IllegalSwiftStorage(format!("{} has no namespace", self.name_any()))
        })?;
        let owner = self.controller_owner_ref(&()).ok_or_else(|| {
            Error::IllegalSwiftStorage(format!("{} has no uid", self.name_any()))
        })?;

        let applier = Applier::new(
            Api::namespaced(context.client.clone(), &namespace),
            &context.settings,
        );
        let (outcome, live) = applier.apply(synthesize(self), owner).await?;
        context.metrics.apply_outcome(outcome);

        info!(
            r#"Applied storage workload for "{namespace}/{}": {}"#,
            self.name_any(),
            outcome.as_str()
        );
        Ok((outcome, live))
    }
}

/// The pieces of the `Ready` condition we decide on
#[derive(Clone, Debug, PartialEq)]
struct ReadyCondition {
    status: &'static str,
    reason: &'static str,
    message: String,
}

impl ReadyCondition {
    fn ready(message: String) -> Self {
        Self { status: "True", reason: "Deployed", message }
    }

    fn deploying(message: String) -> Self {
        Self { status: "False", reason: "Deploying", message }
    }

    fn failed(error: &Error) -> Self {
        Self {
            status: "False",
            reason: "ReconcileError",
            message: error.to_string(),
        }
    }
}

impl SwiftStorage {
    /// Status as it should read after this pass
    fn next_status(&self, ready_count: i32, condition: ReadyCondition) -> SwiftStorageStatus {
        let generation = self.metadata.generation;
        let previous = self
            .status
            .as_ref()
            .and_then(|s| s.conditions.iter().find(|c| c.type_ == READY_CONDITION));

        // Keep the transition time unless the condition actually flipped
        let last_transition_time = previous
            .filter(|c| c.status == condition.status)
            .map(|c| c.last_transition_time.clone())
            .unwrap_or_else(|| Time(Utc::now()));

        SwiftStorageStatus {
            ready_count,
            observed_generation: generation,
            conditions: vec![Condition {
                type_: READY_CONDITION.into(),
                status: condition.status.into(),
                reason: condition.reason.into(),
                message: condition.message,
                observed_generation: generation,
                last_transition_time,
            }],
        }
    }

    /// Write the status if it changed. Failing to do so never fails the pass.
    async fn report(&self, context: &Context, ready_count: i32, condition: ReadyCondition) {
        let next = self.next_status(ready_count, condition);
        if !status_changed(self.status.as_ref(), &next) {
            return;
        }

        let (Some(namespace), name) = (self.namespace(), self.name_any()) else {
            return;
        };
        let storages = Api::<SwiftStorage>::namespaced(context.client.clone(), &namespace);
        let patch = Patch::Apply(json!({
            "apiVersion": SwiftStorage::api_version(&()),
            "kind": SwiftStorage::kind(&()),
            "status": next,
        }));
        let params = PatchParams::apply(&context.settings.field_manager).force();

        if let Err(e) = bounded(context, storages.patch_status(&name, &params, &patch)).await {
            warn!(r#"Could not update status of "{namespace}/{name}": {e}"#);
        }
    }

    /// Record an event against this object. Failing to do so never fails the pass.
    async fn publish(&self, context: &Context, outcome: ApplyOutcome) {
        let recorder = context
            .diagnostics
            .read()
            .await
            .recorder(context.client.clone(), self);

        let (reason, note) = match outcome {
            ApplyOutcome::Created => ("Created", "Created storage StatefulSet"),
            _ => ("Patched", "Patched drifted storage StatefulSet"),
        };
        let event = Event {
            type_: EventType::Normal,
            reason: reason.into(),
            note: Some(format!("{note} `{}`", self.name_any())),
            action: "Reconciling".into(),
            secondary: None,
        };

        let published = tokio::time::timeout(context.settings.api_timeout, recorder.publish(event)).await;
        match published {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Could not publish {reason} event: {e}"),
            Err(_) => warn!("Publishing {reason} event timed out"),
        }
    }
}

/// Compare everything but transition times
fn status_changed(current: Option<&SwiftStorageStatus>, next: &SwiftStorageStatus) -> bool {
    let Some(current) = current else {
        return true;
    };

    let key = |c: &Condition| {
        (
            c.type_.clone(),
            c.status.clone(),
            c.reason.clone(),
            c.message.clone(),
            c.observed_generation,
        )
    };

    current.ready_count != next.ready_count
        || current.observed_generation != next.observed_generation
        || current.conditions.iter().map(key).ne(next.conditions.iter().map(key))
}

async fn bounded<T>(
    context: &Context,
    call: impl Future<Output = Result<T, kube::Error>>,
) -> Result<T> {
    let timeout = context.settings.api_timeout;
    tokio::time::timeout(timeout, call)
        .await
        .map_err(|_| Error::Timeout(timeout))?
        .map_err(Error::KubeError)
}
