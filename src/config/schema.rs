//! Typed view of the merged configuration.
//!
//! Every section derives Serde traits and carries a `Default` that doubles as
//! the framework defaults layer (see `defaults.rs`), so the recognized options
//! and their default values are declared exactly once.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::error::ConfigError;
use crate::config::snapshot::ConfigSnapshot;
use crate::config::validation::validate_config;
use crate::transport::TransportKind;

/// Root configuration for one service instance.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct ServiceConfig {
    /// Identity of the service.
    pub service: ServiceSection,

    /// Cluster the instance runs in, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cluster: Option<PlacementSection>,

    /// Pod (instance) name within the cluster.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pod: Option<PlacementSection>,

    /// Container name within the pod.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container: Option<PlacementSection>,

    /// Listener layout.
    pub transport: TransportConfig,

    /// Registry and exporter settings.
    pub metrics: MetricsConfig,

    /// Drain behaviour.
    pub shutdown: ShutdownConfig,

    /// Process-wide log output.
    pub logging: LoggingConfig,
}

impl ServiceConfig {
    /// Deserialize and validate the typed view of a snapshot.
    pub fn from_snapshot(snapshot: &ConfigSnapshot) -> Result<Self, ConfigError> {
        let config: ServiceConfig = toml::Value::Table(snapshot.to_table())
            .try_into()
            .map_err(ConfigError::Deserialize)?;

        validate_config(&config).map_err(ConfigError::Validation)?;

        Ok(config)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct ServiceSection {
    pub name: String,
    pub admin: AdminConfig,
}

/// Dedicated admin listener used by grpc-only services.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct AdminConfig {
    /// 0 picks an ephemeral port.
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct PlacementSection {
    pub name: String,
}

/// Listener layout of the service.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct TransportConfig {
    /// Which listeners the service runs.
    pub kind: TransportKind,

    /// Interface every listener binds to.
    pub host: String,

    /// Primary port: grpc side for grpc/hybrid, http side for http.
    pub port: u16,

    /// Http side of a hybrid service.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http: Option<HttpPortConfig>,

    /// Pending connection queue length passed to `listen(2)`.
    pub backlog: u32,

    pub bind: BindConfig,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            kind: TransportKind::Http,
            host: "0.0.0.0".to_string(),
            port: 8080,
            http: None,
            backlog: 1024,
            bind: BindConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HttpPortConfig {
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct BindConfig {
    pub retry: BindRetryConfig,
}

/// Retry policy for listener binds. Zero attempts disables retrying.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct BindRetryConfig {
    pub max_attempts: u32,
    pub base_delay_millis: u64,
    pub max_delay_millis: u64,
}

impl Default for BindRetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 0,
            base_delay_millis: 100,
            max_delay_millis: 2000,
        }
    }
}

/// Registry and exporter configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct MetricsConfig {
    /// Exporter kinds to start: `scrape`, `push`, `jmx`, `console`.
    pub exporters: Vec<String>,

    /// Prepended to every metric name with `_`. Empty means no prefix.
    pub prefix: String,

    /// Labels merged into every metric, next to `app`.
    pub default_tags: BTreeMap<String, String>,

    pub histogram: HistogramConfig,

    pub push: PushConfig,

    pub console: ConsoleConfig,

    /// Upper bound for the final flush of all exporters at stop.
    pub stop_timeout_seconds: u64,
}

impl MetricsConfig {
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_seconds)
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            exporters: vec!["scrape".to_string()],
            prefix: String::new(),
            default_tags: BTreeMap::new(),
            histogram: HistogramConfig::default(),
            push: PushConfig::default(),
            console: ConsoleConfig::default(),
            stop_timeout_seconds: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct HistogramConfig {
    /// Upper bounds of the histogram buckets, in seconds for latencies.
    pub buckets: Vec<f64>,
}

impl Default for HistogramConfig {
    fn default() -> Self {
        Self {
            buckets: vec![
                0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
            ],
        }
    }
}

/// Push gateway settings.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct PushConfig {
    /// Base URL of the push gateway, e.g. `http://pushgateway:9091`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,

    /// Job name; falls back to the service name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_name: Option<String>,

    pub interval_seconds: u64,
}

impl Default for PushConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            job_name: None,
            interval_seconds: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct ConsoleConfig {
    pub interval_seconds: u64,
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            interval_seconds: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct ShutdownConfig {
    /// How long in-flight requests may run once draining starts.
    pub grace_period_seconds: u64,
}

impl ShutdownConfig {
    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_seconds)
    }
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            grace_period_seconds: 30,
        }
    }
}

/// Log output settings.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct LoggingConfig {
    /// `EnvFilter` directive; `RUST_LOG` wins when set.
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Compact,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Compact,
    Json,
}
