//! Transport servers.
//!
//! # Data Flow
//! ```text
//! TransportServer::from_config (which listeners, which routers)
//!     → bind()   all-or-nothing, listeners bound in order   → BoundServer
//!     → serve()  one accept loop per listener               → RunningServer
//!     → drain()  stop accepting, wait for in-flight, force  → DrainResult
//! ```
//!
//! # Listener roles
//! - `Grpc`   → grpc (HTTP/2 only) + admin (HTTP, `service.admin.port`)
//! - `Http`   → http (HTTP/1.1 + HTTP/2, admin routes mounted)
//! - `Hybrid` → the grpc server and the http server side by side
//!
//! # Design Decisions
//! - A bound server accepts nothing until `serve` runs
//! - Forced cancellations are an outcome reported in `DrainResult`, not an error

pub mod server;

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use axum::Router;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;
use tower_http::trace::TraceLayer;

use crate::config::ServiceConfig;
use crate::http::admin::{admin_router, admin_router_over, AdminState};
use crate::net::{BindError, BoundListener, ListenerBinding, ListenerRole, ListenerSpec};
use crate::observability::diagnostics::WorkerTable;
use crate::resilience::RetryPolicy;

pub use server::{ListenerDrain, RunningListener};

/// Which listeners a service runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Grpc,
    Http,
    Hybrid,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Grpc => "grpc",
            Self::Http => "http",
            Self::Hybrid => "hybrid",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("unknown transport kind {0:?}; expected grpc, http or hybrid")]
pub struct ParseTransportKindError(String);

impl FromStr for TransportKind {
    type Err = ParseTransportKindError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "grpc" => Ok(Self::Grpc),
            "http" => Ok(Self::Http),
            "hybrid" => Ok(Self::Hybrid),
            _ => Err(ParseTransportKindError(s.to_string())),
        }
    }
}

/// Application routers supplied by the service.
#[derive(Debug, Clone, Default)]
pub struct ServiceRoutes {
    /// Served on the grpc listener.
    pub grpc: Router,
    /// Served on the http listener, behind the admin routes. A fallback set
    /// here answers whatever neither side routes.
    pub http: Router,
}

/// One listener to bind and the router it will serve.
#[derive(Debug, Clone)]
pub struct ProtocolServer {
    spec: ListenerSpec,
    router: Router,
}

impl ProtocolServer {
    fn new(spec: ListenerSpec, router: Router) -> Self {
        Self {
            spec,
            router: router.layer(TraceLayer::new_for_http()),
        }
    }

    pub fn spec(&self) -> &ListenerSpec {
        &self.spec
    }
}

/// The grpc side: an HTTP/2 listener, plus an admin listener when it runs alone.
#[derive(Debug, Clone)]
pub struct GrpcServer {
    listener: ProtocolServer,
    admin: Option<ProtocolServer>,
}

/// The http side: one listener carrying application and admin routes.
#[derive(Debug, Clone)]
pub struct HttpServer {
    listener: ProtocolServer,
}

/// Transport of a service; Hybrid composes the two single-protocol servers.
#[derive(Debug, Clone)]
pub enum TransportServer {
    Grpc(GrpcServer),
    Http(HttpServer),
    Hybrid { grpc: GrpcServer, http: HttpServer },
}

impl TransportServer {
    /// Lay out listeners for the configured transport kind.
    pub fn from_config(config: &ServiceConfig, routes: ServiceRoutes, admin: AdminState) -> Result<Self, BindError> {
        let transport = &config.transport;
        let spec = |role, port| ListenerSpec::new(role, &transport.host, port, transport.backlog);

        let server = match transport.kind {
            TransportKind::Grpc => TransportServer::Grpc(GrpcServer {
                listener: ProtocolServer::new(spec(ListenerRole::Grpc, transport.port)?, routes.grpc),
                admin: Some(ProtocolServer::new(
                    spec(ListenerRole::Admin, config.service.admin.port)?,
                    admin_router(admin),
                )),
            }),
            TransportKind::Http => TransportServer::Http(HttpServer {
                listener: ProtocolServer::new(
                    spec(ListenerRole::Http, transport.port)?,
                    admin_router_over(admin, routes.http),
                ),
            }),
            TransportKind::Hybrid => {
                let http_port = transport.http.as_ref().map(|http| http.port).unwrap_or(8080);
                TransportServer::Hybrid {
                    grpc: GrpcServer {
                        listener: ProtocolServer::new(spec(ListenerRole::Grpc, transport.port)?, routes.grpc),
                        admin: None,
                    },
                    http: HttpServer {
                        listener: ProtocolServer::new(
                            spec(ListenerRole::Http, http_port)?,
                            admin_router_over(admin, routes.http),
                        ),
                    },
                }
            }
        };
        Ok(server)
    }

    pub fn kind(&self) -> TransportKind {
        match self {
            Self::Grpc(_) => TransportKind::Grpc,
            Self::Http(_) => TransportKind::Http,
            Self::Hybrid { .. } => TransportKind::Hybrid,
        }
    }

    /// Listeners in bind order.
    pub fn listeners(&self) -> Vec<&ProtocolServer> {
        match self {
            Self::Grpc(grpc) => grpc.listeners(),
            Self::Http(http) => vec![&http.listener],
            Self::Hybrid { grpc, http } => {
                let mut all = grpc.listeners();
                all.push(&http.listener);
                all
            }
        }
    }

    /// Bind every listener, or none.
    ///
    /// On failure the listeners bound so far are closed before the error is
    /// returned. `cancelled` is polled before each attempt.
    pub async fn bind(
        &self,
        policy: &RetryPolicy,
        cancelled: &(dyn Fn() -> bool + Send + Sync),
    ) -> Result<BoundServer, BindError> {
        let mut bound = Vec::new();
        for server in self.listeners() {
            match BoundListener::bind_with_retry(&server.spec, policy, cancelled).await {
                Ok(listener) => bound.push((listener, server.router.clone())),
                Err(err) => {
                    let closed = bound.len();
                    drop(bound);
                    tracing::warn!(
                        kind = %self.kind(),
                        role = %server.spec.role,
                        closed,
                        error = %err,
                        "Bind failed, closed listeners already bound"
                    );
                    return Err(err);
                }
            }
        }
        Ok(BoundServer {
            kind: self.kind(),
            listeners: bound,
        })
    }
}

impl GrpcServer {
    fn listeners(&self) -> Vec<&ProtocolServer> {
        let mut all = vec![&self.listener];
        all.extend(self.admin.as_ref());
        all
    }
}

/// Listeners bound but not yet accepting.
#[derive(Debug)]
pub struct BoundServer {
    kind: TransportKind,
    listeners: Vec<(BoundListener, Router)>,
}

impl BoundServer {
    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    pub fn bindings(&self) -> Vec<ListenerBinding> {
        self.listeners.iter().map(|(l, _)| l.binding()).collect()
    }

    pub fn local_addr(&self, role: ListenerRole) -> Option<SocketAddr> {
        self.listeners
            .iter()
            .find(|(l, _)| l.role() == role)
            .map(|(l, _)| l.local_addr())
    }

    /// Start one accept loop per listener.
    pub fn serve(self, workers: &WorkerTable) -> RunningServer {
        let listeners = self
            .listeners
            .into_iter()
            .map(|(listener, router)| RunningListener::spawn(listener, router, workers))
            .collect();
        RunningServer {
            kind: self.kind,
            listeners,
        }
    }

    /// Close every listener without serving.
    pub fn close(self) -> Vec<ListenerBinding> {
        let bindings = self.bindings();
        drop(self.listeners);
        tracing::info!(kind = %self.kind, listeners = bindings.len(), "Bound listeners closed");
        bindings
    }
}

/// Listeners with live accept loops.
#[derive(Debug)]
pub struct RunningServer {
    kind: TransportKind,
    listeners: Vec<RunningListener>,
}

impl RunningServer {
    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    pub fn local_addr(&self, role: ListenerRole) -> Option<SocketAddr> {
        self.listeners
            .iter()
            .find(|l| l.role() == role)
            .map(RunningListener::local_addr)
    }

    pub fn addresses(&self) -> Vec<(ListenerRole, SocketAddr)> {
        self.listeners.iter().map(|l| (l.role(), l.local_addr())).collect()
    }

    /// Drain every listener within one shared `grace` window.
    pub async fn drain(self, grace: Duration) -> DrainResult {
        let started = Instant::now();
        let deadline = started + grace;

        for listener in &self.listeners {
            listener.begin_drain();
        }

        let mut result = DrainResult::default();
        for listener in self.listeners {
            let drained = listener.finish_drain(started, deadline).await;
            result.forced_cancellations += drained.forced_cancellations;
            result.listeners.push(drained);
        }

        tracing::info!(
            kind = %self.kind,
            forced_cancellations = result.forced_cancellations,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Transport drained"
        );
        result
    }
}

/// Drain outcome for a whole transport.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DrainResult {
    pub listeners: Vec<ListenerDrain>,
    pub forced_cancellations: u64,
}
