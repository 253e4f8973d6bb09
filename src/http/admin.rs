//! Admin endpoints and the exporter handler table.
//!
//! `/health` and `/threads` are fixed routes. Everything else is looked up in
//! the [`HandlerTable`], which exporters fill and empty while the listeners
//! keep serving; readers always see a complete table.
//!
//! On the http listener the admin router sits in front of the service's
//! router. Paths the admin side does not answer are handed to the service
//! router unchanged, its own fallback included.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use arc_swap::ArcSwap;
use axum::{
    extract::{FromRef, Request, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use tower::ServiceExt;

use crate::lifecycle::{LifecycleObserver, LifecycleState};
use crate::observability::diagnostics::{ThreadDump, WorkerTable};

/// Produces the response for one admin path.
pub type AdminHandler = Arc<dyn Fn() -> Response + Send + Sync>;

/// Service-supplied liveness probe; `true` means healthy.
pub type HealthCheck = Arc<dyn Fn() -> bool + Send + Sync>;

/// Path → handler map, published through `ArcSwap`.
#[derive(Clone, Default)]
pub struct HandlerTable {
    inner: Arc<ArcSwap<HashMap<String, AdminHandler>>>,
}

impl HandlerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a handler. Returns false, leaving the table unchanged, if `path` is taken.
    pub fn register(&self, path: &str, handler: AdminHandler) -> bool {
        let mut added = false;
        self.inner.rcu(|current| {
            let mut next = HashMap::clone(current);
            added = !next.contains_key(path);
            if added {
                next.insert(path.to_string(), Arc::clone(&handler));
            }
            next
        });
        if added {
            tracing::debug!(path, "Admin handler registered");
        }
        added
    }

    /// Remove a handler. Returns whether it was present.
    pub fn unregister(&self, path: &str) -> bool {
        let mut removed = false;
        self.inner.rcu(|current| {
            let mut next = HashMap::clone(current);
            removed = next.remove(path).is_some();
            next
        });
        if removed {
            tracing::debug!(path, "Admin handler unregistered");
        }
        removed
    }

    pub fn contains(&self, path: &str) -> bool {
        self.inner.load().contains_key(path)
    }

    /// Registered paths, sorted.
    pub fn paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.inner.load().keys().cloned().collect();
        paths.sort();
        paths
    }

    /// Run the handler for `path`, if one is registered.
    pub fn dispatch(&self, path: &str) -> Option<Response> {
        let table = self.inner.load();
        table.get(path).map(|handler| handler())
    }
}

impl fmt::Debug for HandlerTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerTable")
            .field("paths", &self.paths())
            .finish()
    }
}

/// State shared by the admin routes.
#[derive(Clone)]
pub struct AdminState {
    pub handlers: HandlerTable,
    pub lifecycle: LifecycleObserver,
    pub health: HealthCheck,
    pub workers: WorkerTable,
}

/// Router with the fixed admin routes and handler-table dispatch as fallback.
pub fn admin_router(state: AdminState) -> Router {
    layered(state, None)
}

/// Admin routes in front of `service`.
pub fn admin_router_over(state: AdminState, service: Router) -> Router {
    layered(state, Some(service))
}

#[derive(Clone)]
struct AdminRoutes {
    admin: AdminState,
    service: Option<Router>,
}

impl FromRef<AdminRoutes> for AdminState {
    fn from_ref(routes: &AdminRoutes) -> Self {
        routes.admin.clone()
    }
}

fn layered(admin: AdminState, service: Option<Router>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/threads", get(threads))
        .fallback(dispatch)
        .with_state(AdminRoutes { admin, service })
}

async fn health(State(state): State<AdminState>) -> Response {
    let lifecycle = state.lifecycle.current();
    if lifecycle == LifecycleState::Running && (state.health)() {
        (StatusCode::OK, "OK").into_response()
    } else {
        tracing::debug!(state = %lifecycle, "Health check reported unavailable");
        (StatusCode::SERVICE_UNAVAILABLE, "UNAVAILABLE").into_response()
    }
}

async fn threads(State(state): State<AdminState>) -> Json<ThreadDump> {
    Json(ThreadDump::capture(&state.workers))
}

async fn dispatch(State(routes): State<AdminRoutes>, request: Request) -> Response {
    if let Some(response) = routes.admin.handlers.dispatch(request.uri().path()) {
        return response;
    }
    match routes.service {
        Some(service) => match service.oneshot(request).await {
            Ok(response) => response,
            Err(never) => match never {},
        },
        None => (StatusCode::NOT_FOUND, "Not Found").into_response(),
    }
}
