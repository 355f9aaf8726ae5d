use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::StatefulSet;
use kube::{runtime::controller::Action, Client, CustomResourceExt, ResourceExt};
use tokio::sync::RwLock;

use crate::{
    apply::ApplyOutcome,
    config::Settings,
    operator::{Diagnostics, ErrorBackoff},
    Error, Metrics,
};

pub mod swift_storage;

/// The context passed around
pub struct Context {
    /// Kubernetes client
    pub client: Client,

    /// Diagnostics read by the web server
    pub diagnostics: Arc<RwLock<Diagnostics>>,

    /// Prometheus metrics
    pub metrics: Metrics,

    /// Operator settings
    pub settings: Settings,

    /// Delays for objects whose last pass failed
    pub backoff: ErrorBackoff,
}

impl Context {
    pub fn new(
        client: Client,
        settings: Settings,
        metrics: Metrics,
        diagnostics: Arc<RwLock<Diagnostics>>,
    ) -> Self {
        let backoff = ErrorBackoff::new(settings.backoff_base, settings.backoff_max);
        Self {
            client,
            diagnostics,
            metrics,
            settings,
            backoff,
        }
    }

    #[cfg(test)]
    pub fn test(client: Client) -> Arc<Self> {
        Arc::new(Self::new(
            client,
            Settings::default(),
            Metrics::default(),
            Default::default(),
        ))
    }
}

/// A resource that can be reconciled by a controller
#[async_trait]
pub(crate) trait Reconcile
where
    Self: CustomResourceExt + ResourceExt,
{
    /// Attempt to reconcile a resource
    async fn reconcile(&self, context: Arc<Context>) -> Result<Action, Error>;

    /// Synthesize and apply the workload for this resource.
    async fn deploy_resources(
        &self,
        context: Arc<Context>,
    ) -> Result<(ApplyOutcome, Option<StatefulSet>), Error>;
}
