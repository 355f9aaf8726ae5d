use std::{collections::HashMap, sync::Arc, sync::Mutex, time::Duration};

use anyhow::Context as _;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use k8s_openapi::api::apps::v1::StatefulSet;
use kube::{
    api::ListParams,
    runtime::{
        controller::{Action, Error as ControllerError},
        events::{Recorder, Reporter},
        reflector::ObjectRef,
        watcher::{self, Config},
        Controller,
    },
    Api, Client, Resource, ResourceExt,
};
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{error, field, info, instrument, warn, Span};

use crate::{
    config::Settings,
    reconcilers::{swift_storage::run_pass, Context},
    resources::SwiftStorage,
    telemetry, Error, Metrics, Result,
};

/// Diagnostics to be exposed by the web server
#[derive(Clone, Serialize)]
pub struct Diagnostics {
    pub last_event: DateTime<Utc>,
    #[serde(skip)]
    pub reporter: Reporter,
}
impl Default for Diagnostics {
    fn default() -> Self {
        Self {
            last_event: Utc::now(),
            reporter: "swift-operator".into(),
        }
    }
}
impl Diagnostics {
    pub fn recorder(&self, client: Client, storage: &SwiftStorage) -> Recorder {
        Recorder::new(client, self.reporter.clone(), storage.object_ref(&()))
    }
}

/// State shared between the controller and the web server
#[derive(Clone, Default)]
pub struct State {
    /// Diagnostics populated by the reconciler
    diagnostics: Arc<RwLock<Diagnostics>>,
    /// Metrics registry
    registry: prometheus::Registry,
}

/// State wrapper around the controller outputs for the web server
impl State {
    /// Metrics getter
    pub fn metrics(&self) -> Vec<prometheus::proto::MetricFamily> {
        self.registry.gather()
    }

    /// State getter
    pub async fn diagnostics(&self) -> Diagnostics {
        self.diagnostics.read().await.clone()
    }

    // Create a Controller Context that can update State
    pub(crate) fn to_context(
        &self,
        client: Client,
        settings: Settings,
    ) -> Result<Arc<Context>, prometheus::Error> {
        let metrics = Metrics::default().register(&self.registry)?;
        Ok(Arc::new(Context::new(
            client,
            settings,
            metrics,
            self.diagnostics.clone(),
        )))
    }
}

/// Delays before retrying objects whose passes keep failing.
///
/// Each consecutive failure doubles the delay, starting at `base` and never
/// exceeding `max`. A successful pass, or the object's deletion, forgets it.
pub struct ErrorBackoff {
    base: Duration,
    max: Duration,
    failures: Mutex<HashMap<ObjectRef<SwiftStorage>, u32>>,
}

impl ErrorBackoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            failures: Mutex::default(),
        }
    }

    /// Count one more failure for `object` and return how long to wait
    pub fn next_delay(&self, object: &ObjectRef<SwiftStorage>) -> Duration {
        let mut failures = self.failures.lock().unwrap_or_else(|e| e.into_inner());
        let count = failures.entry(object.clone()).or_default();
        let exponent = *count;
        *count = count.saturating_add(1);

        2u32.checked_pow(exponent)
            .and_then(|factor| self.base.checked_mul(factor))
            .map_or(self.max, |delay| delay.min(self.max))
    }

    pub fn reset(&self, object: &ObjectRef<SwiftStorage>) {
        self.failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(object);
    }
}

/// Register what the controller watches: `SwiftStorage` objects, and the
/// StatefulSets they control so that edits or deletions of those trigger a
/// pass for the owner.
pub fn register(client: Client, config: Config) -> Controller<SwiftStorage> {
    let storages = Api::<SwiftStorage>::all(client.clone());
    let statefulsets = Api::<StatefulSet>::all(client);

    Controller::new(storages, config.clone()).owns(statefulsets, config)
}

pub struct SwiftStorageController {
    state: State,
}

impl SwiftStorageController {
    pub fn new(state: State) -> Self {
        Self { state }
    }

    /// Initialize the controller and shared state (given the crd is installed)
    pub async fn run(self, settings: Settings) -> anyhow::Result<()> {
        // Error handler for failed reconciliations
        fn error_policy(storage: Arc<SwiftStorage>, error: &Error, ctx: Arc<Context>) -> Action {
            let delay = ctx.backoff.next_delay(&ObjectRef::from_obj(storage.as_ref()));
            error!(
                "reconcile of {} failed, retrying in {delay:?}: {error:?}",
                storage.name_any()
            );
            ctx.metrics.reconcile_failure(&storage, error);
            Action::requeue(delay)
        }

        // Get a k8s client for communicating with the cluster
        let client = Client::try_default()
            .await
            .context("failed to create kube Client")?;

        // Test that we can actually query for our CRD (a.k.a. it is installed)
        let storages = Api::<SwiftStorage>::all(client.clone());
        if let Err(e) = storages.list(&ListParams::default().limit(1)).await {
            info!("Installation: cargo run --bin crdgen | kubectl apply -f -");
            return Err(e).context("SwiftStorage CRD is not queryable, is it installed?");
        }

        let context = self
            .state
            .to_context(client.clone(), settings)
            .context("failed to register metrics")?;

        let watching_config = Config::default().any_semantic();
        register(client, watching_config)
            .shutdown_on_signal()
            .run(reconcile, error_policy, context.clone())
            .for_each(|result| {
                forget_deleted(&context.backoff, &result);
                async move {
                    if let Err(e) = result {
                        warn!("controller: {e}");
                    }
                }
            })
            .await;

        Ok(())
    }
}

/// Drop the backoff of an object that was deleted while its passes kept failing
fn forget_deleted(
    backoff: &ErrorBackoff,
    result: &Result<(ObjectRef<SwiftStorage>, Action), ControllerError<Error, watcher::Error>>,
) {
    if let Err(ControllerError::ObjectNotFound(deleted)) = result {
        let mut object = ObjectRef::<SwiftStorage>::new(&deleted.name);
        object.namespace = deleted.namespace.clone();
        backoff.reset(&object);
    }
}

/// Main reconciler for `SwiftStorage` resources
#[instrument(skip(ctx, storage), fields(trace_id))]
async fn reconcile(storage: Arc<SwiftStorage>, ctx: Arc<Context>) -> Result<Action> {
    // Add some tracing for debugging's sake
    let trace_id = telemetry::get_trace_id();

    // Take some metrics to see the average reconcile time
    Span::current().record("trace_id", &field::display(&trace_id));
    let _timer = ctx.metrics.count_and_measure();
    ctx.diagnostics.write().await.last_event = Utc::now();

    let name = storage.name_any();
    let namespace = storage
        .namespace()
        .ok_or_else(|| Error::IllegalSwiftStorage(format!("{name} has no namespace")))?;

    info!(r#"Starting SwiftStorage reconciliation for "{namespace}/{name}""#);
    let action = run_pass(ctx.clone(), &namespace, &name).await?;
    ctx.backoff.reset(&ObjectRef::from_obj(storage.as_ref()));

    Ok(action)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{self, timeout_after_1s};

    fn object() -> ObjectRef<SwiftStorage> {
        ObjectRef::from_obj(&fixtures::swift_storage())
    }

    #[test]
    fn backoff_doubles_up_to_the_cap() {
        let backoff = ErrorBackoff::new(Duration::from_secs(5), Duration::from_secs(30));
        let delays: Vec<_> = (0..5).map(|_| backoff.next_delay(&object()).as_secs()).collect();

        assert_eq!(delays, vec![5, 10, 20, 30, 30]);
    }

    #[test]
    fn backoff_is_per_object() {
        let backoff = ErrorBackoff::new(Duration::from_secs(1), Duration::from_secs(60));
        let other = ObjectRef::<SwiftStorage>::new("other").within("openstack");

        backoff.next_delay(&object());
        backoff.next_delay(&object());
        assert_eq!(backoff.next_delay(&other), Duration::from_secs(1));
        assert_eq!(backoff.next_delay(&object()), Duration::from_secs(4));
    }

    #[test]
    fn backoff_resets_after_success() {
        let backoff = ErrorBackoff::new(Duration::from_secs(1), Duration::from_secs(60));
        backoff.next_delay(&object());
        backoff.next_delay(&object());

        backoff.reset(&object());
        assert_eq!(backoff.next_delay(&object()), Duration::from_secs(1));
    }

    #[test]
    fn backoff_survives_many_failures() {
        let backoff = ErrorBackoff::new(Duration::from_secs(5), Duration::from_secs(300));
        for _ in 0..100 {
            assert!(backoff.next_delay(&object()) <= Duration::from_secs(300));
        }
    }

    #[test]
    fn deleted_object_forgets_its_backoff() {
        let backoff = ErrorBackoff::new(Duration::from_secs(1), Duration::from_secs(60));
        backoff.next_delay(&object());
        backoff.next_delay(&object());

        let gone = Err(ControllerError::ObjectNotFound(object().erase()));
        forget_deleted(&backoff, &gone);
        assert_eq!(backoff.next_delay(&object()), Duration::from_secs(1));
    }

    #[test]
    fn other_controller_results_keep_backoff() {
        let backoff = ErrorBackoff::new(Duration::from_secs(1), Duration::from_secs(60));
        backoff.next_delay(&object());

        forget_deleted(&backoff, &Ok((object(), Action::await_change())));
        assert_eq!(backoff.next_delay(&object()), Duration::from_secs(2));
    }

    #[tokio::test]
    async fn context_registers_metrics_once_per_state() {
        let (client, _server) = fixtures::mock_client();
        let state = State::default();

        assert!(state.to_context(client.clone(), Settings::default()).is_ok());
        assert!(state.to_context(client, Settings::default()).is_err());
    }

    #[tokio::test]
    async fn successful_reconcile_resets_backoff() {
        let (client, mut server) = fixtures::mock_client();
        let ctx = Context::test(client);
        ctx.backoff.next_delay(&object());
        ctx.backoff.next_delay(&object());

        let scenario = tokio::spawn(async move {
            server.respond(404, fixtures::status_error(404, "NotFound")).await;
        });

        let action = reconcile(Arc::new(fixtures::swift_storage()), ctx.clone())
            .await
            .unwrap();
        assert_eq!(action, Action::await_change());
        assert_eq!(ctx.backoff.next_delay(&object()), ctx.settings.backoff_base);
        assert_eq!(ctx.metrics.reconciliations.get(), 1);
        timeout_after_1s(scenario).await;
    }
}
