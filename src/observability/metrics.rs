//! The per-service metrics registry.
//!
//! # Responsibilities
//! - Hand out one handle per (name, label set) for the registry's lifetime
//! - Apply the configured name prefix and hold one kind per metric name
//! - Merge default labels (`app`, `metrics.defaultTags.*`) into every metric
//! - Record values into a Prometheus recorder that is never installed globally
//! - Render the exposition text and a structured snapshot for exporters
//!
//! # Design Decisions
//! - Handles are created through the `DashMap` entry API, so racing callers
//!   all receive the same allocation
//! - Every handle mirrors its own total/last/sum, which keeps introspection
//!   independent of the Prometheus text format
//! - After release, registration fails and recording is a no-op

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use metrics::{Key, Label, Level, Metadata, Recorder};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle, PrometheusRecorder};
use serde::Serialize;
use thiserror::Error;

use crate::config::MetricsConfig;
use crate::lifecycle::LifecycleError;

/// Sorted label set.
pub type Labels = BTreeMap<String, String>;

/// Counter emitted for every request cancelled at the drain deadline.
pub const DRAIN_FORCED_CANCELLATIONS: &str = "platform_drain_forced_cancellations_total";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    Counter,
    Gauge,
    Histogram,
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Counter => "counter",
            Self::Gauge => "gauge",
            Self::Histogram => "histogram",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    #[error("metric `{name}` is registered as a {existing}, not a {requested}")]
    KindMismatch {
        name: String,
        existing: MetricKind,
        requested: MetricKind,
    },

    #[error("invalid metric name {0:?}")]
    InvalidName(String),

    #[error("invalid histogram buckets: {0}")]
    Buckets(String),
}

/// Identity of a metric within one registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MetricId {
    pub name: String,
    pub labels: Labels,
}

enum Instrument {
    Counter(metrics::Counter),
    Gauge(metrics::Gauge),
    Histogram(metrics::Histogram),
}

struct MetricCell {
    id: MetricId,
    kind: MetricKind,
    instrument: Instrument,
    observations: AtomicU64,
    /// f64 bits: counter total, gauge last value, histogram sum.
    value_bits: AtomicU64,
}

/// Shared handle to one registered metric.
#[derive(Clone)]
pub struct MetricHandle {
    cell: Arc<MetricCell>,
}

impl MetricHandle {
    pub fn name(&self) -> &str {
        &self.cell.id.name
    }

    /// Labels including the registry defaults.
    pub fn labels(&self) -> &Labels {
        &self.cell.id.labels
    }

    pub fn kind(&self) -> MetricKind {
        self.cell.kind
    }

    /// Number of accepted `record` calls.
    pub fn observations(&self) -> u64 {
        self.cell.observations.load(Ordering::Acquire)
    }

    /// Counter total, gauge last value, or histogram sum.
    pub fn value(&self) -> f64 {
        f64::from_bits(self.cell.value_bits.load(Ordering::Acquire))
    }

    /// Whether both handles point at the same registration.
    pub fn same_as(&self, other: &MetricHandle) -> bool {
        Arc::ptr_eq(&self.cell, &other.cell)
    }

    fn apply(&self, value: f64) {
        let cell = &self.cell;
        match &cell.instrument {
            Instrument::Counter(counter) => {
                if !value.is_finite() || value < 0.0 {
                    tracing::warn!(metric = %cell.id.name, value, "Dropping invalid counter increment");
                    return;
                }
                let whole = value.trunc();
                counter.increment(whole as u64);
                self.add(whole);
            }
            Instrument::Gauge(gauge) => {
                if !value.is_finite() {
                    tracing::warn!(metric = %cell.id.name, value, "Dropping non-finite gauge value");
                    return;
                }
                gauge.set(value);
                cell.value_bits.store(value.to_bits(), Ordering::Release);
            }
            Instrument::Histogram(histogram) => {
                if !value.is_finite() {
                    tracing::warn!(metric = %cell.id.name, value, "Dropping non-finite observation");
                    return;
                }
                histogram.record(value);
                self.add(value);
            }
        }
        cell.observations.fetch_add(1, Ordering::AcqRel);
    }

    fn add(&self, delta: f64) {
        let _ = self
            .cell
            .value_bits
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |bits| {
                Some((f64::from_bits(bits) + delta).to_bits())
            });
    }

    fn sample(&self) -> MetricSample {
        MetricSample {
            name: self.name().to_string(),
            kind: self.kind(),
            labels: self.labels().clone(),
            observations: self.observations(),
            value: self.value(),
        }
    }
}

impl fmt::Debug for MetricHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetricHandle")
            .field("name", &self.cell.id.name)
            .field("labels", &self.cell.id.labels)
            .field("kind", &self.cell.kind)
            .field("observations", &self.observations())
            .finish()
    }
}

/// Point-in-time view of one metric.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricSample {
    pub name: String,
    pub kind: MetricKind,
    pub labels: Labels,
    pub observations: u64,
    pub value: f64,
}

/// The single metrics registry of a service instance.
pub struct MetricsRegistry {
    service: String,
    prefix: String,
    default_labels: Labels,
    recorder: PrometheusRecorder,
    exposition: PrometheusHandle,
    kinds: DashMap<String, MetricKind>,
    metrics: DashMap<MetricId, MetricHandle>,
    released: AtomicBool,
}

impl MetricsRegistry {
    /// Build the registry for `service`. Only the orchestrator calls this.
    pub(crate) fn new(service: &str, config: &MetricsConfig) -> Result<Self, RegistryError> {
        let recorder = PrometheusBuilder::new()
            .set_buckets(&config.histogram.buckets)
            .map_err(|e| RegistryError::Buckets(e.to_string()))?
            .build_recorder();
        let exposition = recorder.handle();

        let mut default_labels = config.default_tags.clone();
        default_labels.insert("app".to_string(), service.to_string());

        tracing::debug!(
            service,
            prefix = %config.prefix,
            default_labels = ?default_labels,
            "Metrics registry created"
        );

        Ok(Self {
            service: service.to_string(),
            prefix: config.prefix.clone(),
            default_labels,
            recorder,
            exposition,
            kinds: DashMap::new(),
            metrics: DashMap::new(),
            released: AtomicBool::new(false),
        })
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn register_counter(&self, name: &str, labels: &Labels) -> Result<MetricHandle, RegistryError> {
        self.register(name, labels, MetricKind::Counter)
    }

    pub fn register_gauge(&self, name: &str, labels: &Labels) -> Result<MetricHandle, RegistryError> {
        self.register(name, labels, MetricKind::Gauge)
    }

    pub fn register_histogram(&self, name: &str, labels: &Labels) -> Result<MetricHandle, RegistryError> {
        self.register(name, labels, MetricKind::Histogram)
    }

    /// Record `value` against `handle`. A no-op once the registry is released.
    pub fn record(&self, handle: &MetricHandle, value: f64) {
        if self.is_released() {
            tracing::trace!(metric = %handle.name(), "Ignoring record on released registry");
            return;
        }
        handle.apply(value);
    }

    /// Prometheus text exposition of current values.
    pub fn render(&self) -> String {
        self.exposition.render()
    }

    /// Structured point-in-time view, sorted by name then labels.
    pub fn snapshot(&self) -> Vec<MetricSample> {
        let mut samples: Vec<MetricSample> = self
            .metrics
            .iter()
            .map(|entry| entry.value().sample())
            .collect();
        samples.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.labels.cmp(&b.labels)));
        samples
    }

    /// Number of registered metrics.
    pub fn len(&self) -> usize {
        self.metrics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty()
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    /// Close the registry. Returns false if it was already released.
    pub(crate) fn release(&self) -> bool {
        let first = !self.released.swap(true, Ordering::AcqRel);
        if first {
            tracing::debug!(service = %self.service, metrics = self.len(), "Metrics registry released");
        }
        first
    }

    fn register(&self, name: &str, labels: &Labels, kind: MetricKind) -> Result<MetricHandle, RegistryError> {
        if self.is_released() {
            return Err(LifecycleError::RegistryReleased.into());
        }
        let name = self.qualified(name);
        if !is_valid_metric_name(&name) {
            return Err(RegistryError::InvalidName(name));
        }

        // One exposition family per name, whatever the labels.
        match self.kinds.entry(name.clone()) {
            Entry::Occupied(existing) if *existing.get() != kind => {
                return Err(RegistryError::KindMismatch {
                    existing: *existing.get(),
                    name,
                    requested: kind,
                });
            }
            Entry::Occupied(_) => {}
            Entry::Vacant(vacant) => {
                vacant.insert(kind);
            }
        }

        let mut merged = self.default_labels.clone();
        merged.extend(labels.iter().map(|(k, v)| (k.clone(), v.clone())));
        let id = MetricId { name, labels: merged };

        let handle = match self.metrics.entry(id) {
            Entry::Occupied(existing) => existing.get().clone(),
            Entry::Vacant(vacant) => {
                let handle = self.create(vacant.key(), kind);
                vacant.insert(handle.clone());
                handle
            }
        };
        Ok(handle)
    }

    fn qualified(&self, name: &str) -> String {
        if self.prefix.is_empty() {
            name.to_string()
        } else {
            format!("{}_{name}", self.prefix)
        }
    }

    fn create(&self, id: &MetricId, kind: MetricKind) -> MetricHandle {
        let labels: Vec<Label> = id
            .labels
            .iter()
            .map(|(k, v)| Label::new(k.clone(), v.clone()))
            .collect();
        let key = Key::from_parts(id.name.clone(), labels);
        let metadata = Metadata::new(module_path!(), Level::INFO, Some(module_path!()));

        let instrument = match kind {
            MetricKind::Counter => Instrument::Counter(self.recorder.register_counter(&key, &metadata)),
            MetricKind::Gauge => Instrument::Gauge(self.recorder.register_gauge(&key, &metadata)),
            MetricKind::Histogram => {
                Instrument::Histogram(self.recorder.register_histogram(&key, &metadata))
            }
        };

        tracing::debug!(metric = %id.name, kind = %kind, "Metric registered");

        MetricHandle {
            cell: Arc::new(MetricCell {
                id: id.clone(),
                kind,
                instrument,
                observations: AtomicU64::new(0),
                value_bits: AtomicU64::new(0f64.to_bits()),
            }),
        }
    }
}

impl fmt::Debug for MetricsRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetricsRegistry")
            .field("service", &self.service)
            .field("metrics", &self.metrics.len())
            .field("released", &self.is_released())
            .finish()
    }
}

pub(crate) fn is_valid_metric_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' || first == ':' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == ':')
}
