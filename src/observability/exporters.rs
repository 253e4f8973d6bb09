//! Metrics exporters.
//!
//! # Data Flow
//! ```text
//! MetricsConfig.exporters
//!     → ExporterSet::from_config (descriptors, duplicates collapsed)
//!     → start: scrape/jmx register admin handlers,
//!              push/console spawn interval tasks
//!     → stop_all: stop timers, final flush (bounded), unregister handlers
//! ```
//!
//! # Design Decisions
//! - Exporters are isolated: one failing never stops another
//! - Publish failures while running are logged and counted, never propagated
//! - Scrape renders on every request; nothing is cached

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::{
    http::header,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::config::{ConfigError, MetricsConfig};
use crate::http::admin::{AdminHandler, HandlerTable};
use crate::observability::diagnostics::{WorkerRole, WorkerTable};
use crate::observability::metrics::MetricsRegistry;

/// Path served by the scrape exporter.
pub const SCRAPE_PATH: &str = "/metrics";

/// Path served by the introspection exporter.
pub const INTROSPECT_PATH: &str = "/metrics/introspect";

const EXPOSITION_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExporterKind {
    /// Pull endpoint in Prometheus text format.
    Scrape,
    /// Periodic push to a push gateway.
    Push,
    /// Structured JSON introspection endpoint.
    Jmx,
    /// Periodic dump into the log.
    Console,
}

impl ExporterKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Scrape => "scrape",
            Self::Push => "push",
            Self::Jmx => "jmx",
            Self::Console => "console",
        }
    }
}

impl fmt::Display for ExporterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExporterKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "scrape" | "prometheus" => Ok(Self::Scrape),
            "push" | "pushgateway" => Ok(Self::Push),
            "jmx" => Ok(Self::Jmx),
            "console" => Ok(Self::Console),
            _ => Err(ConfigError::UnknownExporter(s.to_string())),
        }
    }
}

/// Non-fatal exporter failure, isolated to one exporter.
#[derive(Debug, Error)]
pub enum ExporterError {
    #[error("{kind} exporter: handler path {path} is already registered")]
    HandlerConflict { kind: ExporterKind, path: String },

    #[error("{kind} exporter: failed to build client: {reason}")]
    Client { kind: ExporterKind, reason: String },

    #[error("{kind} exporter: publish failed: {reason}")]
    Publish { kind: ExporterKind, reason: String },

    #[error("{kind} exporter: gateway rejected metrics with status {status}")]
    Rejected { kind: ExporterKind, status: u16 },

    #[error("{kind} exporter: final flush exceeded {timeout:?}")]
    FlushTimeout { kind: ExporterKind, timeout: Duration },
}

impl ExporterError {
    pub fn kind(&self) -> ExporterKind {
        match self {
            Self::HandlerConflict { kind, .. }
            | Self::Client { kind, .. }
            | Self::Publish { kind, .. }
            | Self::Rejected { kind, .. }
            | Self::FlushTimeout { kind, .. } => *kind,
        }
    }
}

/// What to start for one exporter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExporterDescriptor {
    pub kind: ExporterKind,
    /// Admin path for scrape/jmx, push URL for push.
    pub target: Option<String>,
    /// Flush interval for push/console.
    pub interval: Option<Duration>,
}

/// The exporters a service asked for.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExporterSet {
    descriptors: Vec<ExporterDescriptor>,
}

/// Exporters that came up, plus the ones that could not.
#[derive(Debug, Default)]
pub struct ExporterStart {
    pub active: Vec<ActiveExporter>,
    pub failures: Vec<ExporterError>,
}

impl ExporterSet {
    /// Build descriptors for the configured exporter kinds.
    pub fn from_config(config: &MetricsConfig, service: &str) -> Result<Self, ConfigError> {
        let mut descriptors: Vec<ExporterDescriptor> = Vec::new();
        for name in &config.exporters {
            let kind: ExporterKind = name.parse()?;
            if descriptors.iter().any(|d| d.kind == kind) {
                tracing::debug!(exporter = %kind, "Duplicate exporter collapsed");
                continue;
            }
            let descriptor = match kind {
                ExporterKind::Scrape => ExporterDescriptor {
                    kind,
                    target: Some(SCRAPE_PATH.to_string()),
                    interval: None,
                },
                ExporterKind::Jmx => ExporterDescriptor {
                    kind,
                    target: Some(INTROSPECT_PATH.to_string()),
                    interval: None,
                },
                ExporterKind::Push => {
                    let endpoint = config
                        .push
                        .endpoint
                        .as_deref()
                        .ok_or_else(|| ConfigError::MissingKey("metrics.push.endpoint".to_string()))?;
                    let job = config.push.job_name.as_deref().unwrap_or(service);
                    ExporterDescriptor {
                        kind,
                        target: Some(push_url(endpoint, job)),
                        interval: Some(Duration::from_secs(config.push.interval_seconds.max(1))),
                    }
                }
                ExporterKind::Console => ExporterDescriptor {
                    kind,
                    target: None,
                    interval: Some(Duration::from_secs(config.console.interval_seconds.max(1))),
                },
            };
            descriptors.push(descriptor);
        }
        Ok(Self { descriptors })
    }

    pub fn descriptors(&self) -> &[ExporterDescriptor] {
        &self.descriptors
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    /// Start every exporter. Must run inside a tokio runtime.
    pub fn start(
        &self,
        registry: &Arc<MetricsRegistry>,
        handlers: &HandlerTable,
        workers: &WorkerTable,
    ) -> ExporterStart {
        let mut started = ExporterStart::default();
        for descriptor in &self.descriptors {
            match start_one(descriptor, registry, handlers, workers) {
                Ok(active) => {
                    tracing::info!(
                        exporter = %descriptor.kind,
                        target = ?descriptor.target,
                        "Metrics exporter started"
                    );
                    started.active.push(active);
                }
                Err(err) => {
                    tracing::warn!(exporter = %descriptor.kind, error = %err, "Metrics exporter failed to start");
                    started.failures.push(err);
                }
            }
        }
        started
    }

    /// Stop exporters in order, sharing one deadline for their final flushes.
    pub async fn stop_all(active: Vec<ActiveExporter>, timeout: Duration) -> Vec<ExporterError> {
        let deadline = Instant::now() + timeout;
        let mut failures = Vec::new();
        for exporter in active {
            let kind = exporter.descriptor.kind;
            if let Err(err) = exporter.stop(deadline, timeout).await {
                tracing::warn!(exporter = %kind, error = %err, "Metrics exporter stopped with error");
                failures.push(err);
            } else {
                tracing::debug!(exporter = %kind, "Metrics exporter stopped");
            }
        }
        failures
    }
}

fn push_url(endpoint: &str, job: &str) -> String {
    format!("{}/metrics/job/{}", endpoint.trim_end_matches('/'), job)
}

fn start_one(
    descriptor: &ExporterDescriptor,
    registry: &Arc<MetricsRegistry>,
    handlers: &HandlerTable,
    workers: &WorkerTable,
) -> Result<ActiveExporter, ExporterError> {
    let kind = descriptor.kind;
    let state = match kind {
        ExporterKind::Scrape | ExporterKind::Jmx => {
            let path = descriptor
                .target
                .clone()
                .unwrap_or_else(|| SCRAPE_PATH.to_string());
            let registry = Arc::clone(registry);
            let handler: AdminHandler = if kind == ExporterKind::Scrape {
                Arc::new(move || scrape_response(&registry))
            } else {
                Arc::new(move || Json(registry.snapshot()).into_response())
            };
            if !handlers.register(&path, handler) {
                return Err(ExporterError::HandlerConflict { kind, path });
            }
            ExporterState::Handler {
                path,
                handlers: handlers.clone(),
            }
        }
        ExporterKind::Push => {
            let url = descriptor.target.clone().unwrap_or_default();
            let client = reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .map_err(|e| ExporterError::Client {
                    kind,
                    reason: e.to_string(),
                })?;
            let flusher = Arc::new(Flusher::Push(PushGateway {
                client,
                url,
                registry: Arc::clone(registry),
                failures: AtomicU64::new(0),
            }));
            spawn_periodic(kind, descriptor, flusher, workers)
        }
        ExporterKind::Console => {
            let flusher = Arc::new(Flusher::Console(Arc::clone(registry)));
            spawn_periodic(kind, descriptor, flusher, workers)
        }
    };
    Ok(ActiveExporter {
        descriptor: descriptor.clone(),
        state,
    })
}

fn scrape_response(registry: &MetricsRegistry) -> Response {
    (
        [
            (header::CONTENT_TYPE, EXPOSITION_CONTENT_TYPE),
            (header::CACHE_CONTROL, "no-store"),
        ],
        registry.render(),
    )
        .into_response()
}

fn spawn_periodic(
    kind: ExporterKind,
    descriptor: &ExporterDescriptor,
    flusher: Arc<Flusher>,
    workers: &WorkerTable,
) -> ExporterState {
    let interval = descriptor.interval.unwrap_or(Duration::from_secs(30));
    let (stop_tx, mut stop_rx) = watch::channel(false);
    let role = match kind {
        ExporterKind::Push => WorkerRole::PushExporter,
        _ => WorkerRole::ConsoleExporter,
    };
    let worker = workers.register(format!("metrics-{kind}"), role);
    let task_flusher = Arc::clone(&flusher);

    let task = tokio::spawn(async move {
        let _worker = worker;
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = stop_rx.changed() => break,
                _ = ticker.tick() => {
                    if let Err(err) = task_flusher.flush().await {
                        tracing::warn!(exporter = %kind, error = %err, "Metrics publish failed");
                    }
                }
            }
        }
    });

    ExporterState::Periodic {
        stop: stop_tx,
        task,
        flusher,
    }
}

/// A started exporter. Dropped once stopped.
#[derive(Debug)]
pub struct ActiveExporter {
    descriptor: ExporterDescriptor,
    state: ExporterState,
}

#[derive(Debug)]
enum ExporterState {
    Handler {
        path: String,
        handlers: HandlerTable,
    },
    Periodic {
        stop: watch::Sender<bool>,
        task: JoinHandle<()>,
        flusher: Arc<Flusher>,
    },
}

impl ActiveExporter {
    pub fn descriptor(&self) -> &ExporterDescriptor {
        &self.descriptor
    }

    pub fn kind(&self) -> ExporterKind {
        self.descriptor.kind
    }

    /// Publish failures since start (push only).
    pub fn publish_failures(&self) -> u64 {
        match &self.state {
            ExporterState::Periodic { flusher, .. } => flusher.failures(),
            ExporterState::Handler { .. } => 0,
        }
    }

    async fn stop(self, deadline: Instant, timeout: Duration) -> Result<(), ExporterError> {
        let kind = self.descriptor.kind;
        match self.state {
            ExporterState::Handler { path, handlers } => {
                handlers.unregister(&path);
                Ok(())
            }
            ExporterState::Periodic {
                stop,
                mut task,
                flusher,
            } => {
                let _ = stop.send(true);
                if tokio::time::timeout_at(deadline, &mut task).await.is_err() {
                    task.abort();
                    return Err(ExporterError::FlushTimeout { kind, timeout });
                }
                match tokio::time::timeout_at(deadline, flusher.flush()).await {
                    Ok(result) => result,
                    Err(_) => Err(ExporterError::FlushTimeout { kind, timeout }),
                }
            }
        }
    }
}

/// Final-flush capable exporter backends.
#[derive(Debug)]
enum Flusher {
    Push(PushGateway),
    Console(Arc<MetricsRegistry>),
}

impl Flusher {
    async fn flush(&self) -> Result<(), ExporterError> {
        match self {
            Self::Push(gateway) => gateway.publish().await,
            Self::Console(registry) => {
                log_snapshot(registry);
                Ok(())
            }
        }
    }

    fn failures(&self) -> u64 {
        match self {
            Self::Push(gateway) => gateway.failures.load(Ordering::Relaxed),
            Self::Console(_) => 0,
        }
    }
}

#[derive(Debug)]
struct PushGateway {
    client: reqwest::Client,
    url: String,
    registry: Arc<MetricsRegistry>,
    failures: AtomicU64,
}

impl PushGateway {
    async fn publish(&self) -> Result<(), ExporterError> {
        let kind = ExporterKind::Push;
        let result = self
            .client
            .post(&self.url)
            .header(header::CONTENT_TYPE.as_str(), EXPOSITION_CONTENT_TYPE)
            .body(self.registry.render())
            .send()
            .await;

        let outcome = match result {
            Ok(response) if response.status().is_success() => Ok(()),
            Ok(response) => Err(ExporterError::Rejected {
                kind,
                status: response.status().as_u16(),
            }),
            Err(e) => Err(ExporterError::Publish {
                kind,
                reason: e.to_string(),
            }),
        };

        match &outcome {
            Ok(()) => tracing::debug!(url = %self.url, "Metrics pushed"),
            Err(_) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
            }
        }
        outcome
    }
}

fn log_snapshot(registry: &MetricsRegistry) {
    let samples = registry.snapshot();
    tracing::info!(
        service = %registry.service(),
        metrics = samples.len(),
        "Metrics report"
    );
    for sample in samples {
        tracing::info!(
            metric = %sample.name,
            kind = %sample.kind,
            labels = ?sample.labels,
            value = sample.value,
            observations = sample.observations,
            "Metric"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observability::metrics::Labels;

    fn config(exporters: &[&str]) -> MetricsConfig {
        MetricsConfig {
            exporters: exporters.iter().map(|e| e.to_string()).collect(),
            ..MetricsConfig::default()
        }
    }

    fn registry() -> Arc<MetricsRegistry> {
        Arc::new(MetricsRegistry::new("orders", &MetricsConfig::default()).unwrap())
    }

    #[test]
    fn unknown_exporter_is_a_config_error() {
        let err = ExporterSet::from_config(&config(&["scrape", "graphite"]), "orders").unwrap_err();
        assert!(matches!(err, ConfigError::UnknownExporter(ref name) if name == "graphite"));
    }

    #[test]
    fn duplicates_collapse() {
        let set = ExporterSet::from_config(&config(&["scrape", "SCRAPE", "jmx"]), "orders").unwrap();
        let kinds: Vec<_> = set.descriptors().iter().map(|d| d.kind).collect();
        assert_eq!(kinds, vec![ExporterKind::Scrape, ExporterKind::Jmx]);
    }

    #[test]
    fn push_url_uses_job_name_or_service() {
        let mut cfg = config(&["push"]);
        cfg.push.endpoint = Some("http://gateway:9091/".to_string());
        let set = ExporterSet::from_config(&cfg, "orders").unwrap();
        assert_eq!(
            set.descriptors()[0].target.as_deref(),
            Some("http://gateway:9091/metrics/job/orders")
        );

        cfg.push.job_name = Some("orders-batch".to_string());
        let set = ExporterSet::from_config(&cfg, "orders").unwrap();
        assert_eq!(
            set.descriptors()[0].target.as_deref(),
            Some("http://gateway:9091/metrics/job/orders-batch")
        );
    }

    #[tokio::test]
    async fn scrape_and_jmx_register_and_unregister_handlers() {
        let registry = registry();
        let handlers = HandlerTable::new();
        let set = ExporterSet::from_config(&config(&["scrape", "jmx"]), "orders").unwrap();

        let started = set.start(&registry, &handlers, &WorkerTable::new());
        assert!(started.failures.is_empty());
        assert!(handlers.contains(SCRAPE_PATH));
        assert!(handlers.contains(INTROSPECT_PATH));

        let failures = ExporterSet::stop_all(started.active, Duration::from_secs(1)).await;
        assert!(failures.is_empty());
        assert!(handlers.paths().is_empty());
    }

    #[tokio::test]
    async fn taken_path_isolates_one_exporter() {
        let registry = registry();
        let handlers = HandlerTable::new();
        handlers.register(SCRAPE_PATH, Arc::new(|| "taken".into_response()));
        let set = ExporterSet::from_config(&config(&["scrape", "jmx"]), "orders").unwrap();

        let started = set.start(&registry, &handlers, &WorkerTable::new());
        assert_eq!(started.active.len(), 1);
        assert_eq!(started.active[0].kind(), ExporterKind::Jmx);
        assert!(matches!(started.failures[0], ExporterError::HandlerConflict { .. }));
    }

    #[tokio::test]
    async fn console_flushes_at_stop() {
        let registry = registry();
        let counter = registry.register_counter("jobs_total", &Labels::new()).unwrap();
        registry.record(&counter, 1.0);
        let workers = WorkerTable::new();
        let set = ExporterSet::from_config(&config(&["console"]), "orders").unwrap();

        let started = set.start(&registry, &HandlerTable::new(), &workers);
        assert_eq!(workers.running(), 1);

        let failures = ExporterSet::stop_all(started.active, Duration::from_secs(1)).await;
        assert!(failures.is_empty());
        assert_eq!(workers.running(), 0);
    }

    #[tokio::test]
    async fn unreachable_gateway_reports_final_flush_failure() {
        let registry = registry();
        let mut cfg = config(&["push"]);
        // Port 9 on loopback refuses connections.
        cfg.push.endpoint = Some("http://127.0.0.1:9".to_string());
        let set = ExporterSet::from_config(&cfg, "orders").unwrap();

        let started = set.start(&registry, &HandlerTable::new(), &WorkerTable::new());
        let failures = ExporterSet::stop_all(started.active, Duration::from_secs(5)).await;
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].kind(), ExporterKind::Push);
    }
}
