use std::{net::SocketAddr, time::Duration};

use anyhow::Context as _;
use config::{Config, Environment, Source as _};
use serde::{Deserialize, Deserializer};

use crate::FIELD_MANAGER;

/// Prefix of every operator environment variable
pub const ENV_PREFIX: &str = "SWIFT_OPERATOR";

/// Output format of the log subscriber
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    #[serde(alias = "text")]
    Compact,
    Json,
}

/// Operator settings, initialized once at startup
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Field manager recorded on every object we write
    pub field_manager: String,

    /// Bind address of the metrics and diagnostics server
    pub listen_addr: SocketAddr,

    /// Upper bound for every single call against the cluster API
    #[serde(rename = "api_timeout_secs", deserialize_with = "seconds")]
    pub api_timeout: Duration,

    /// First delay after a failed reconciliation, doubled on each consecutive failure
    #[serde(rename = "backoff_base_secs", deserialize_with = "seconds")]
    pub backoff_base: Duration,

    /// Cap for the failed reconciliation delay
    #[serde(rename = "backoff_max_secs", deserialize_with = "seconds")]
    pub backoff_max: Duration,

    pub log_format: LogFormat,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            field_manager: FIELD_MANAGER.into(),
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            api_timeout: Duration::from_secs(30),
            backoff_base: Duration::from_secs(5),
            backoff_max: Duration::from_secs(5 * 60),
            log_format: LogFormat::Compact,
        }
    }
}

fn seconds<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    u64::deserialize(deserializer).map(Duration::from_secs)
}

impl Settings {
    /// Read `SWIFT_OPERATOR_*` settings and `LOG_FORMAT` from the process environment
    pub fn from_env() -> anyhow::Result<Self> {
        Self::load(
            Environment::with_prefix(ENV_PREFIX),
            Environment::default(),
        )
    }

    /// Build settings from a prefixed environment, taking `LOG_FORMAT` from `unprefixed`
    fn load(prefixed: Environment, unprefixed: Environment) -> anyhow::Result<Self> {
        let log_format = unprefixed
            .collect()?
            .remove("log_format")
            .map(|value| value.into_string())
            .transpose()?;

        let settings: Settings = Config::builder()
            .add_source(prefixed.try_parsing(true))
            .set_override_option("log_format", log_format)?
            .build()?
            .try_deserialize()
            .with_context(|| format!("invalid {ENV_PREFIX}_* or LOG_FORMAT settings"))?;

        anyhow::ensure!(
            !settings.field_manager.trim().is_empty(),
            "SWIFT_OPERATOR_FIELD_MANAGER must not be empty"
        );
        anyhow::ensure!(
            !settings.api_timeout.is_zero(),
            "SWIFT_OPERATOR_API_TIMEOUT_SECS must be positive"
        );
        anyhow::ensure!(
            settings.backoff_base <= settings.backoff_max,
            "SWIFT_OPERATOR_BACKOFF_BASE_SECS must not exceed SWIFT_OPERATOR_BACKOFF_MAX_SECS"
        );

        Ok(settings)
    }
}
