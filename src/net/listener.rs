//! TCP listener binding.
//!
//! # Responsibilities
//! - Resolve the configured host and port into a socket address
//! - Create sockets with `SO_REUSEADDR` and the configured backlog
//! - Retry failed binds per the configured policy
//! - Report failures as [`BindError`] with role and address attached

use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use serde::Serialize;
use thiserror::Error;
use tokio::net::{TcpListener, TcpSocket, TcpStream};

use crate::resilience::RetryPolicy;

/// What a listener is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ListenerRole {
    /// HTTP/2 only, carries grpc routes.
    Grpc,
    /// HTTP/1.1 and HTTP/2, carries http routes and admin endpoints.
    Http,
    /// Admin endpoints of a grpc-only service.
    Admin,
}

impl ListenerRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Grpc => "grpc",
            Self::Http => "http",
            Self::Admin => "admin",
        }
    }
}

impl fmt::Display for ListenerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error type for listener binding.
#[derive(Debug, Error)]
pub enum BindError {
    #[error("invalid {role} listener host {host:?}")]
    InvalidAddress { role: ListenerRole, host: String },

    #[error("failed to bind {role} listener on {address}: {source}")]
    Io {
        role: ListenerRole,
        address: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("bind of {role} listener cancelled by a stop request")]
    Cancelled { role: ListenerRole },
}

impl BindError {
    /// Whether the failure was another socket holding the port.
    pub fn is_address_in_use(&self) -> bool {
        matches!(self, Self::Io { source, .. } if source.kind() == io::ErrorKind::AddrInUse)
    }
}

/// Where and how a listener should bind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerSpec {
    pub role: ListenerRole,
    pub address: SocketAddr,
    pub backlog: u32,
}

impl ListenerSpec {
    /// Build a spec from a configured host string and port.
    pub fn new(role: ListenerRole, host: &str, port: u16, backlog: u32) -> Result<Self, BindError> {
        let ip = match host {
            "localhost" => IpAddr::V4(Ipv4Addr::LOCALHOST),
            other => other.parse().map_err(|_| BindError::InvalidAddress {
                role,
                host: host.to_string(),
            })?,
        };
        Ok(Self {
            role,
            address: SocketAddr::new(ip, port),
            backlog,
        })
    }
}

/// A bound, listening socket that has not started accepting yet.
#[derive(Debug)]
pub struct BoundListener {
    role: ListenerRole,
    inner: TcpListener,
    local_addr: SocketAddr,
    backlog: u32,
}

impl BoundListener {
    /// Bind once, without retrying.
    pub fn bind(spec: &ListenerSpec) -> Result<Self, BindError> {
        let io_err = |source| BindError::Io {
            role: spec.role,
            address: spec.address,
            source,
        };

        let socket = if spec.address.is_ipv4() {
            TcpSocket::new_v4()
        } else {
            TcpSocket::new_v6()
        }
        .map_err(io_err)?;

        #[cfg(unix)]
        socket.set_reuseaddr(true).map_err(io_err)?;

        socket.bind(spec.address).map_err(io_err)?;
        let inner = socket.listen(spec.backlog).map_err(io_err)?;
        let local_addr = inner.local_addr().map_err(io_err)?;

        tracing::info!(
            role = %spec.role,
            address = %local_addr,
            backlog = spec.backlog,
            "Listener bound"
        );

        Ok(Self {
            role: spec.role,
            inner,
            local_addr,
            backlog: spec.backlog,
        })
    }

    /// Bind with retries. `cancelled` is polled before every attempt.
    pub async fn bind_with_retry(
        spec: &ListenerSpec,
        policy: &RetryPolicy,
        cancelled: &(dyn Fn() -> bool + Send + Sync),
    ) -> Result<Self, BindError> {
        let mut attempt = 0;
        loop {
            if cancelled() {
                return Err(BindError::Cancelled { role: spec.role });
            }
            match Self::bind(spec) {
                Ok(listener) => return Ok(listener),
                Err(err) if policy.allows(attempt) => {
                    attempt += 1;
                    let delay = policy.delay(attempt);
                    tracing::warn!(
                        role = %spec.role,
                        address = %spec.address,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Bind failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Accept the next connection.
    pub async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        self.inner.accept().await
    }

    pub fn role(&self) -> ListenerRole {
        self.role
    }

    /// Get the local address this listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn backlog(&self) -> u32 {
        self.backlog
    }

    /// Describe this listener for reports.
    pub fn binding(&self) -> ListenerBinding {
        ListenerBinding {
            role: self.role,
            address: self.local_addr,
            backlog: self.backlog,
        }
    }
}

/// Role, address and backlog of a bound listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ListenerBinding {
    pub role: ListenerRole,
    pub address: SocketAddr,
    pub backlog: u32,
}
