//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! built-in defaults + files + overrides + environment
//!     → resolver.rs (flatten & layer, type-kind checks)
//!     → ConfigSnapshot (dotted keys, immutable)
//!     → schema.rs (typed serde view)
//!     → validation.rs (semantic checks)
//!     → ServiceConfig shared via Arc with the orchestrator
//! ```
//!
//! # Design Decisions
//! - The snapshot is immutable for a process run; there is no reload
//! - Later layers replace whole leaf values, arrays included
//! - Validation separates syntactic (serde) from semantic checks

pub mod defaults;
pub mod error;
pub mod resolver;
pub mod schema;
pub mod snapshot;
pub mod validation;

pub use error::ConfigError;
pub use resolver::{ConfigResolver, Environment, OverrideSource, ProcessEnvironment};
pub use schema::{
    BindRetryConfig, LogFormat, LoggingConfig, MetricsConfig, ServiceConfig, ShutdownConfig,
    TransportConfig,
};
pub use snapshot::{ConfigSnapshot, ValueKind};
pub use validation::ValidationError;
