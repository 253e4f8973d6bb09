//! HTTP surface owned by the framework.
//!
//! # Data Flow
//! ```text
//! Admin listener (or the http listener in Http/Hybrid mode)
//!     → /health   lifecycle state + service health check
//!     → /threads  worker table and runtime stats
//!     → anything else → HandlerTable (exporters register /metrics here)
//! ```

pub mod admin;

pub use admin::{admin_router, admin_router_over, AdminHandler, AdminState, HandlerTable, HealthCheck};
