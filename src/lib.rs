//! Platform Service Framework
//!
//! Runs a service's grpc/http routers behind a managed lifecycle: layered
//! configuration, one metrics registry per instance with pluggable exporters,
//! admin endpoints, and a bounded graceful drain on stop.
//!
//! # Architecture Overview
//!
//! ```text
//!   ServiceDefinition + ConfigOverrides
//!            │
//!            ▼
//!   ┌──────────────────────────────────────────────────────────────┐
//!   │ lifecycle::LifecycleOrchestrator                              │
//!   │   Created → Configuring → Starting → Running → Draining → Stopped
//!   │                                                               │
//!   │   config      resolver layers → snapshot → ServiceConfig      │
//!   │   observability  MetricsRegistry, exporters, logging, workers │
//!   │   transport   grpc / http / hybrid listeners (net, resilience)│
//!   │   http        admin router: /health /threads + handler table  │
//!   └──────────────────────────────────────────────────────────────┘
//!            │
//!            ▼
//!   RunningService ── stop(grace) ──► ShutdownReport
//! ```

pub mod config;
pub mod http;
pub mod lifecycle;
pub mod net;
pub mod observability;
pub mod resilience;
pub mod service;
pub mod transport;

pub use config::{ConfigError, ConfigSnapshot, ServiceConfig};
pub use lifecycle::{
    LifecycleError, LifecycleObserver, LifecycleOrchestrator, LifecycleState, ShutdownReport, StartupError,
};
pub use net::ListenerRole;
pub use observability::{Labels, MetricHandle, MetricKind, MetricsRegistry, RegistryError};
pub use service::{start, ConfigOverrides, RunningService, ServiceDefinition};
pub use transport::TransportKind;
