//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (startup.rs):
//!     Resolve config → Validate → Registry → Exporters → Bind → Running
//!
//! Shutdown (shutdown.rs):
//!     stop() → Draining → Drain listeners → Stop exporters → Release → Stopped
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → shutdown hook → stop(configured grace)
//! ```
//!
//! # States
//! ```text
//! Created → Configuring → Starting → Running → Draining → Stopped
//!     any non-terminal state → Failed
//! ```
//!
//! # Design Decisions
//! - State lives in one atomic; every transition is a compare-and-swap
//! - Ordered startup: config first, then metrics, then listeners
//! - Ordered shutdown: stop accept, drain, stop exporters, release
//! - Drain has a deadline: requests still running are cancelled and counted

pub mod orchestrator;
pub mod shutdown;
pub mod signals;
pub mod startup;
pub mod state;

pub use orchestrator::{LifecycleOrchestrator, DEFAULT_GRACE_PERIOD};
pub use shutdown::{ExporterFailure, ShutdownReport};
pub use signals::{termination, ShutdownTrigger};
pub use startup::{StartupError, StartupPlan};
pub use state::{LifecycleError, LifecycleObserver, LifecycleState, StateCell};
