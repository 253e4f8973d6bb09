//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! Services and framework code produce:
//!     → logging.rs (structured tracing events)
//!     → metrics.rs (counters, gauges, histograms in one registry)
//!     → diagnostics.rs (framework worker table)
//!
//! Consumers:
//!     → exporters.rs: /metrics scrape, /metrics/introspect JSON,
//!       push gateway, console log
//!     → /threads admin endpoint
//! ```
//!
//! # Design Decisions
//! - One registry per service instance, passed explicitly; no global recorder
//! - Metrics are cheap (atomic increments)
//! - Exporters fail independently of each other and of the service

pub mod diagnostics;
pub mod exporters;
pub mod logging;
pub mod metrics;

pub use diagnostics::{ThreadDump, WorkerRole, WorkerTable};
pub use exporters::{ActiveExporter, ExporterDescriptor, ExporterError, ExporterKind, ExporterSet};
pub use metrics::{Labels, MetricHandle, MetricKind, MetricSample, MetricsRegistry, RegistryError};
