//! Per-listener accept loop and drain.
//!
//! # Responsibilities
//! - Accept connections on a bound listener and serve them with hyper
//!   (HTTP/2 only for grpc, HTTP/1.1 + HTTP/2 otherwise)
//! - Route every request through the listener's axum router
//! - Track in-flight requests so drain can count forced cancellations
//!
//! # Drain sequence
//! ```text
//! stop signal ──► accept loop exits, listener dropped (no new connections)
//!             ──► every connection starts a graceful shutdown
//! wait until all connection tasks finish or the deadline passes
//! deadline    ──► count in-flight requests, abort remaining tasks
//! ```

use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use axum::Router;
use hyper::body::Incoming;
use hyper::server::conn::http2;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use hyper_util::server::graceful::GracefulConnection;
use serde::Serialize;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tower::ServiceExt;

use crate::net::{BoundListener, ConnectionId, ListenerRole, RequestTracker};
use crate::observability::diagnostics::{WorkerGuard, WorkerRole, WorkerTable};

/// Outcome of draining one listener.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ListenerDrain {
    pub role: ListenerRole,
    pub address: SocketAddr,
    /// Requests still in flight at the deadline; their connections were aborted.
    pub forced_cancellations: u64,
    /// Requests that finished over the listener's lifetime, aborted ones included.
    pub completed_requests: u64,
    pub elapsed_ms: u64,
}

/// A listener whose accept loop is running.
pub struct RunningListener {
    role: ListenerRole,
    local_addr: SocketAddr,
    stop: watch::Sender<bool>,
    accept: JoinHandle<JoinSet<()>>,
    requests: RequestTracker,
}

impl RunningListener {
    /// Start accepting on `listener`.
    pub fn spawn(listener: BoundListener, router: Router, workers: &WorkerTable) -> Self {
        let role = listener.role();
        let local_addr = listener.local_addr();
        let requests = RequestTracker::new();
        let (stop, stop_rx) = watch::channel(false);
        let worker = workers.register(format!("accept-{role}"), WorkerRole::Accept);

        let accept = tokio::spawn(accept_loop(listener, router, requests.clone(), stop_rx, worker));

        tracing::info!(role = %role, address = %local_addr, "Listener serving");

        Self {
            role,
            local_addr,
            stop,
            accept,
            requests,
        }
    }

    pub fn role(&self) -> ListenerRole {
        self.role
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Requests currently inside a handler.
    pub fn in_flight(&self) -> u64 {
        self.requests.in_flight()
    }

    /// Stop accepting and ask every connection to finish. Does not wait.
    pub(crate) fn begin_drain(&self) {
        let _ = self.stop.send(true);
    }

    /// Wait for connections to finish until `deadline`, then abort the rest.
    pub(crate) async fn finish_drain(self, started: Instant, deadline: Instant) -> ListenerDrain {
        self.begin_drain();

        let mut connections = match self.accept.await {
            Ok(connections) => connections,
            Err(err) => {
                tracing::error!(role = %self.role, error = %err, "Accept loop ended abnormally");
                JoinSet::new()
            }
        };

        let drained = tokio::time::timeout_at(deadline, async {
            while connections.join_next().await.is_some() {}
        })
        .await
        .is_ok();

        let forced_cancellations = if drained {
            0
        } else {
            let forced = self.requests.in_flight();
            connections.abort_all();
            while connections.join_next().await.is_some() {}
            forced
        };

        let result = ListenerDrain {
            role: self.role,
            address: self.local_addr,
            forced_cancellations,
            completed_requests: self.requests.completed(),
            elapsed_ms: started.elapsed().as_millis() as u64,
        };

        tracing::info!(
            role = %result.role,
            address = %result.address,
            forced_cancellations = result.forced_cancellations,
            elapsed_ms = result.elapsed_ms,
            "Listener drained"
        );
        result
    }

    /// Drain this listener alone.
    pub async fn drain(self, grace: Duration) -> ListenerDrain {
        let started = Instant::now();
        self.finish_drain(started, started + grace).await
    }
}

impl fmt::Debug for RunningListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunningListener")
            .field("role", &self.role)
            .field("local_addr", &self.local_addr)
            .field("in_flight", &self.requests.in_flight())
            .finish()
    }
}

async fn accept_loop(
    listener: BoundListener,
    router: Router,
    requests: RequestTracker,
    mut stop: watch::Receiver<bool>,
    _worker: WorkerGuard,
) -> JoinSet<()> {
    let role = listener.role();
    let address = listener.local_addr();
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            biased;
            _ = stop.changed() => break,
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(err) => {
                        tracing::warn!(role = %role, error = %err, "Accept failed");
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        continue;
                    }
                };
                let id = ConnectionId::new();
                tracing::trace!(connection_id = %id, role = %role, peer = %peer, "Connection accepted");
                connections.spawn(serve_connection(
                    stream,
                    role,
                    router.clone(),
                    requests.clone(),
                    stop.clone(),
                    id,
                ));
            }
        }
        while connections.try_join_next().is_some() {}
    }

    drop(listener);
    tracing::info!(role = %role, address = %address, "Listener closed");
    connections
}

async fn serve_connection(
    stream: TcpStream,
    role: ListenerRole,
    router: Router,
    requests: RequestTracker,
    shutdown: watch::Receiver<bool>,
    id: ConnectionId,
) {
    let io = TokioIo::new(stream);
    let service = service_fn(move |request: Request<Incoming>| {
        let guard = requests.track();
        let router = router.clone();
        async move {
            let response = router.oneshot(request).await;
            drop(guard);
            response
        }
    });

    match role {
        ListenerRole::Grpc => {
            let connection = http2::Builder::new(TokioExecutor::new()).serve_connection(io, service);
            drive(connection, shutdown, id, role).await;
        }
        ListenerRole::Http | ListenerRole::Admin => {
            let builder = auto::Builder::new(TokioExecutor::new());
            let connection = builder.serve_connection(io, service);
            drive(connection, shutdown, id, role).await;
        }
    }
}

/// Run a connection to completion, switching to graceful shutdown on the stop signal.
async fn drive<C>(connection: C, mut shutdown: watch::Receiver<bool>, id: ConnectionId, role: ListenerRole)
where
    C: GracefulConnection,
    C::Error: fmt::Display,
{
    tokio::pin!(connection);
    let mut draining = false;
    loop {
        tokio::select! {
            result = connection.as_mut() => {
                if let Err(err) = result {
                    tracing::debug!(connection_id = %id, role = %role, error = %err, "Connection ended with error");
                }
                break;
            }
            _ = shutdown.changed(), if !draining => {
                draining = true;
                connection.as_mut().graceful_shutdown();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::ListenerSpec;
    use axum::routing::get;

    fn bind() -> BoundListener {
        let spec = ListenerSpec::new(ListenerRole::Http, "127.0.0.1", 0, 64).unwrap();
        BoundListener::bind(&spec).unwrap()
    }

    #[tokio::test]
    async fn serves_and_drains_cleanly() {
        let router = Router::new().route("/ping", get(|| async { "pong" }));
        let listener = RunningListener::spawn(bind(), router, &WorkerTable::new());
        let url = format!("http://{}/ping", listener.local_addr());

        let body = reqwest::get(&url).await.unwrap().text().await.unwrap();
        assert_eq!(body, "pong");

        let drain = listener.drain(Duration::from_secs(5)).await;
        assert_eq!(drain.forced_cancellations, 0);
        assert_eq!(drain.completed_requests, 1);
    }

    #[tokio::test]
    async fn drained_listener_refuses_connections() {
        let listener = RunningListener::spawn(bind(), Router::new(), &WorkerTable::new());
        let address = listener.local_addr();
        listener.drain(Duration::from_secs(1)).await;

        assert!(TcpStream::connect(address).await.is_err());
    }
}
