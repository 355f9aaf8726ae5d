use thiserror::Error;

/// Build an `ObjectMeta` from a list of its fields, defaulting the rest.
macro_rules! meta {
    ($($lhs:ident : $rhs:expr),* $(,)?) => {{
        ::kube::core::ObjectMeta {
            $($lhs: $rhs,)*

            ..Default::default()
        }
    }};
}

/// Selector labels for a swift storage instance, optionally extended with extra pairs.
macro_rules! labels {
    (instance: $name:expr) => {{
        ::std::collections::BTreeMap::<String, String>::from_iter([
            ("app.kubernetes.io/name".to_string(), crate::APP_NAME.to_string()),
            ("app.kubernetes.io/instance".to_string(), $name.to_string()),
        ])
    }};

    (instance: $name:expr, $($key:expr => $value:expr),+ $(,)?) => {{
        let mut labels = crate::labels!(instance: $name);
        $(labels.insert($key.to_string(), $value.to_string());)+
        labels
    }};
}

pub(crate) use labels;
pub(crate) use meta;

/// Expose all controller components used by main
pub mod operator;
pub mod resources;

/// Settings read from the environment
pub mod config;

/// Desired workload synthesis
pub mod workload;

/// Drift detection and conflict-safe apply
pub mod apply;

/// The reconciliation pass
pub mod reconcilers;

/// Log and trace integrations
pub mod telemetry;

/// Metrics
mod metrics;
pub use metrics::Metrics;

#[cfg(test)]
pub(crate) mod fixtures;

/// Value of the `app.kubernetes.io/name` label on everything we manage
pub const APP_NAME: &str = "swift-storage";

/// Default field manager used for every write against the cluster
pub const FIELD_MANAGER: &str = "swift-operator";

#[derive(Error, Debug)]
pub enum Error {
    #[error("SerializationError: {0}")]
    SerializationError(#[source] serde_json::Error),

    #[error("Kube Error: {0}")]
    KubeError(#[source] kube::Error),

    #[error("IllegalSwiftStorage: {0}")]
    IllegalSwiftStorage(String),

    #[error("Workload rejected by the API server: {0}")]
    RejectedWorkload(String),

    #[error("Cluster API call timed out after {0:?}")]
    Timeout(std::time::Duration),
}
pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub fn metric_label(&self) -> String {
        match self {
            Error::SerializationError(_) => "serializationerror",
            Error::KubeError(_) => "kubeerror",
            Error::IllegalSwiftStorage(_) => "illegalswiftstorage",
            Error::RejectedWorkload(_) => "rejectedworkload",
            Error::Timeout(_) => "timeout",
        }
        .into()
    }

    /// Whether retrying without a change to the `SwiftStorage` could succeed
    pub fn is_validation(&self) -> bool {
        matches!(self, Error::IllegalSwiftStorage(_) | Error::RejectedWorkload(_))
    }
}
