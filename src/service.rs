//! Embedding API.
//!
//! A service describes itself with a [`ServiceDefinition`], optionally
//! supplies [`ConfigOverrides`], and calls [`start`]. The returned
//! [`RunningService`] is the handle for metrics, admin handlers and stop.
//!
//! ```no_run
//! use axum::{routing::get, Router};
//! use platform_service_framework::{start, ConfigOverrides, ServiceDefinition, TransportKind};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let definition = ServiceDefinition::new("orders", TransportKind::Http)
//!     .with_http_routes(Router::new().route("/orders", get(|| async { "[]" })))
//!     .with_shutdown_hook();
//! let service = start(definition, ConfigOverrides::new()).await?;
//! let report = service.wait().await;
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use uuid::Uuid;

use crate::config::{ConfigResolver, ConfigSnapshot, OverrideSource, ServiceConfig};
use crate::http::admin::{HandlerTable, HealthCheck};
use crate::lifecycle::{
    termination, LifecycleError, LifecycleObserver, LifecycleOrchestrator, LifecycleState, ShutdownReport,
    ShutdownTrigger, StartupError, StartupPlan,
};
use crate::net::ListenerRole;
use crate::observability::metrics::MetricsRegistry;
use crate::transport::{ServiceRoutes, TransportKind};

/// What a service brings to the framework.
pub struct ServiceDefinition {
    name: String,
    kind: TransportKind,
    routes: ServiceRoutes,
    health: HealthCheck,
    required: Vec<String>,
    install_logging: bool,
    shutdown_hook: Option<ShutdownTrigger>,
}

impl ServiceDefinition {
    pub fn new(name: impl Into<String>, kind: TransportKind) -> Self {
        Self {
            name: name.into(),
            kind,
            routes: ServiceRoutes::default(),
            health: Arc::new(|| true),
            required: Vec::new(),
            install_logging: false,
            shutdown_hook: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    /// Routes served on the http listener.
    pub fn with_http_routes(mut self, router: Router) -> Self {
        self.routes.http = router;
        self
    }

    /// Routes served on the grpc listener (HTTP/2 only).
    pub fn with_grpc_routes(mut self, router: Router) -> Self {
        self.routes.grpc = router;
        self
    }

    /// Extra readiness condition for `/health`, checked only while Running.
    pub fn with_health_check(mut self, check: impl Fn() -> bool + Send + Sync + 'static) -> Self {
        self.health = Arc::new(check);
        self
    }

    /// Fail startup unless `key` resolves to a value.
    pub fn require_key(mut self, key: impl Into<String>) -> Self {
        self.required.push(key.into());
        self
    }

    /// Install the global tracing subscriber from the `logging` section.
    pub fn with_logging(mut self) -> Self {
        self.install_logging = true;
        self
    }

    /// Stop on SIGINT or SIGTERM. Armed from the first moment of startup, so a
    /// signal that arrives before Running cancels the start cleanly.
    pub fn with_shutdown_hook(self) -> Self {
        self.with_shutdown_trigger(termination())
    }

    /// Like [`with_shutdown_hook`](Self::with_shutdown_hook), with `trigger`
    /// in place of the OS signals.
    pub fn with_shutdown_trigger(mut self, trigger: impl Future<Output = ()> + Send + 'static) -> Self {
        self.shutdown_hook = Some(Box::pin(trigger));
        self
    }
}

impl std::fmt::Debug for ServiceDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceDefinition")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("required", &self.required)
            .field("install_logging", &self.install_logging)
            .field("shutdown_hook", &self.shutdown_hook.is_some())
            .finish_non_exhaustive()
    }
}

/// Where configuration comes from beyond the built-in defaults.
#[derive(Debug, Default)]
pub struct ConfigOverrides {
    config_dir: Option<PathBuf>,
    sources: Vec<OverrideSource>,
    environment: Option<HashMap<String, String>>,
}

impl ConfigOverrides {
    pub fn new() -> Self {
        Self::default()
    }

    /// Directory holding `common/` and `<service>/` configuration files.
    pub fn config_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config_dir = Some(dir.into());
        self
    }

    /// An explicit TOML file. Startup fails if it does not exist.
    pub fn override_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.sources.push(OverrideSource::Path(path.into()));
        self
    }

    /// One dotted key. Later calls win over earlier ones and over files
    /// added before them.
    pub fn set(mut self, key: impl Into<String>, value: impl Into<toml::Value>) -> Self {
        let entry = (key.into(), value.into());
        match self.sources.last_mut() {
            Some(OverrideSource::Inline(values)) => values.push(entry),
            _ => self.sources.push(OverrideSource::Inline(vec![entry])),
        }
        self
    }

    /// Replace the process environment with a fixed map.
    pub fn with_environment(mut self, environment: HashMap<String, String>) -> Self {
        self.environment = Some(environment);
        self
    }

    pub fn sources(&self) -> &[OverrideSource] {
        &self.sources
    }
}

/// Start a service and return once it is Running.
///
/// On failure every resource acquired so far has been released and the error
/// carries the shutdown report.
pub async fn start(definition: ServiceDefinition, overrides: ConfigOverrides) -> Result<RunningService, StartupError> {
    let ServiceDefinition {
        name,
        kind,
        routes,
        health,
        required,
        install_logging,
        shutdown_hook,
    } = definition;
    let ConfigOverrides {
        config_dir,
        sources,
        environment,
    } = overrides;

    let mut resolver = ConfigResolver::new(kind);
    if let Some(dir) = config_dir {
        resolver = resolver.with_config_dir(dir);
    }
    for key in required {
        resolver = resolver.require(key);
    }
    if let Some(environment) = environment {
        resolver = resolver.with_environment(environment);
    }

    let orchestrator = LifecycleOrchestrator::new(name, kind);
    orchestrator
        .start(StartupPlan {
            resolver,
            overrides: sources,
            routes,
            health,
            install_logging,
            shutdown_hook,
        })
        .await?;

    RunningService::new(orchestrator)
}

/// Handle to a service that reached Running.
#[derive(Debug, Clone)]
pub struct RunningService {
    orchestrator: Arc<LifecycleOrchestrator>,
    registry: Arc<MetricsRegistry>,
    config: Arc<ServiceConfig>,
    snapshot: Arc<ConfigSnapshot>,
}

impl RunningService {
    fn new(orchestrator: Arc<LifecycleOrchestrator>) -> Result<Self, StartupError> {
        let registry = orchestrator.registry()?;
        let unavailable = || LifecycleError::RegistryUnavailable {
            state: orchestrator.state(),
        };
        let config = orchestrator.config().ok_or_else(unavailable)?;
        let snapshot = orchestrator.snapshot().ok_or_else(unavailable)?;
        Ok(Self {
            orchestrator,
            registry,
            config,
            snapshot,
        })
    }

    pub fn instance_id(&self) -> Uuid {
        self.orchestrator.instance_id()
    }

    pub fn name(&self) -> &str {
        self.orchestrator.service()
    }

    pub fn state(&self) -> LifecycleState {
        self.orchestrator.state()
    }

    pub fn observer(&self) -> LifecycleObserver {
        self.orchestrator.observer()
    }

    /// The service's metrics registry. Registration fails once stopped.
    pub fn registry(&self) -> Arc<MetricsRegistry> {
        Arc::clone(&self.registry)
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn snapshot(&self) -> &ConfigSnapshot {
        &self.snapshot
    }

    /// Table for admin handlers; services may register their own paths.
    pub fn handlers(&self) -> &HandlerTable {
        self.orchestrator.handlers()
    }

    pub fn local_addr(&self, role: ListenerRole) -> Option<SocketAddr> {
        self.orchestrator.local_addr(role)
    }

    pub fn orchestrator(&self) -> &Arc<LifecycleOrchestrator> {
        &self.orchestrator
    }

    /// Drain with `grace` and release everything. Idempotent.
    pub async fn stop(&self, grace: Duration) -> Arc<ShutdownReport> {
        self.orchestrator.stop(grace).await
    }

    /// Stop with `shutdown.gracePeriodSeconds`.
    pub async fn stop_gracefully(&self) -> Arc<ShutdownReport> {
        self.orchestrator.stop(self.config.shutdown.grace_period()).await
    }

    /// Wait until something else stops the service.
    pub async fn wait(&self) -> Arc<ShutdownReport> {
        self.orchestrator.wait_report().await
    }

    pub fn install_shutdown_hook(&self) -> Result<(), LifecycleError> {
        self.orchestrator.install_shutdown_hook()
    }

    pub fn install_shutdown_hook_with<F>(&self, trigger: F) -> Result<(), LifecycleError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.orchestrator.install_shutdown_hook_with(trigger)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inline_values_group_between_files() {
        let overrides = ConfigOverrides::new()
            .set("transport.port", 0)
            .set("transport.host", "127.0.0.1")
            .override_path("/etc/orders.toml")
            .set("transport.port", 9000);

        let sources = overrides.sources();
        assert_eq!(sources.len(), 3);
        assert!(matches!(&sources[0], OverrideSource::Inline(values) if values.len() == 2));
        assert!(matches!(&sources[1], OverrideSource::Path(_)));
        assert!(matches!(&sources[2], OverrideSource::Inline(values) if values.len() == 1));
    }

    #[test]
    fn definition_defaults() {
        let definition = ServiceDefinition::new("orders", TransportKind::Grpc).require_key("db.url");
        assert_eq!(definition.name(), "orders");
        assert_eq!(definition.kind(), TransportKind::Grpc);
        assert!((definition.health)());
        assert_eq!(definition.required, vec!["db.url".to_string()]);
    }
}
