//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! ListenerSpec (role, address, backlog)
//!     → listener.rs (TcpSocket bind + listen, retry policy)
//!     → BoundListener handed to the transport accept loop
//!     → connection.rs (connection ids, in-flight request guards)
//! ```
//!
//! # Design Decisions
//! - A bound listener is inert until the transport starts its accept loop
//! - Every request is tracked so drain can count what it had to cancel

pub mod connection;
pub mod listener;

pub use connection::{ConnectionId, RequestGuard, RequestTracker};
pub use listener::{BindError, BoundListener, ListenerBinding, ListenerRole, ListenerSpec};
