//! The lifecycle orchestrator.
//!
//! Owns the state cell and every resource that startup acquires: the config
//! snapshot, the metrics registry, the exporters and the transport. Startup
//! lives in `startup.rs`, the drain and release sequence in `shutdown.rs`.

use std::net::SocketAddr;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::{ConfigSnapshot, ServiceConfig};
use crate::http::admin::HandlerTable;
use crate::lifecycle::shutdown::ShutdownReport;
use crate::lifecycle::state::{LifecycleError, LifecycleObserver, LifecycleState, StateCell};
use crate::net::ListenerRole;
use crate::observability::diagnostics::WorkerTable;
use crate::observability::exporters::{ActiveExporter, ExporterError};
use crate::observability::metrics::MetricsRegistry;
use crate::transport::{BoundServer, RunningServer, TransportKind};

/// Grace period used by the shutdown hook when no configuration was resolved.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(30);

/// Resources handed from startup to shutdown.
#[derive(Debug, Default)]
pub(crate) struct Resources {
    pub(crate) exporters: Vec<ActiveExporter>,
    pub(crate) exporter_failures: Vec<ExporterError>,
    pub(crate) bound: Option<BoundServer>,
    pub(crate) transport: Option<RunningServer>,
}

/// Drives one service instance through its lifecycle.
pub struct LifecycleOrchestrator {
    pub(crate) instance_id: Uuid,
    pub(crate) service: String,
    pub(crate) kind: TransportKind,
    pub(crate) state: StateCell,
    pub(crate) snapshot: OnceLock<Arc<ConfigSnapshot>>,
    pub(crate) config: OnceLock<Arc<ServiceConfig>>,
    pub(crate) registry: OnceLock<Arc<MetricsRegistry>>,
    pub(crate) handlers: HandlerTable,
    pub(crate) workers: WorkerTable,
    pub(crate) resources: Mutex<Resources>,
    pub(crate) addresses: OnceLock<Vec<(ListenerRole, SocketAddr)>>,
    pub(crate) report: watch::Sender<Option<Arc<ShutdownReport>>>,
    pub(crate) hook: Mutex<Option<JoinHandle<()>>>,
    pub(crate) hook_installed: AtomicBool,
}

impl LifecycleOrchestrator {
    /// Create an orchestrator in the Created state.
    pub fn new(service: impl Into<String>, kind: TransportKind) -> Arc<Self> {
        let (report, _) = watch::channel(None);
        let orchestrator = Self {
            instance_id: Uuid::new_v4(),
            service: service.into(),
            kind,
            state: StateCell::new(),
            snapshot: OnceLock::new(),
            config: OnceLock::new(),
            registry: OnceLock::new(),
            handlers: HandlerTable::new(),
            workers: WorkerTable::new(),
            resources: Mutex::new(Resources::default()),
            addresses: OnceLock::new(),
            report,
            hook: Mutex::new(None),
            hook_installed: AtomicBool::new(false),
        };
        tracing::debug!(
            service = %orchestrator.service,
            instance_id = %orchestrator.instance_id,
            kind = %kind,
            "Orchestrator created"
        );
        Arc::new(orchestrator)
    }

    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    pub fn state(&self) -> LifecycleState {
        self.state.get()
    }

    pub fn observer(&self) -> LifecycleObserver {
        self.state.observer()
    }

    pub fn handlers(&self) -> &HandlerTable {
        &self.handlers
    }

    pub fn workers(&self) -> &WorkerTable {
        &self.workers
    }

    /// The resolved configuration, once Configuring has completed.
    pub fn config(&self) -> Option<Arc<ServiceConfig>> {
        self.config.get().cloned()
    }

    pub fn snapshot(&self) -> Option<Arc<ConfigSnapshot>> {
        self.snapshot.get().cloned()
    }

    /// The registry, available from Starting onwards.
    pub fn registry(&self) -> Result<Arc<MetricsRegistry>, LifecycleError> {
        self.registry
            .get()
            .cloned()
            .ok_or(LifecycleError::RegistryUnavailable { state: self.state() })
    }

    /// Address a listener of `role` is serving on.
    pub fn local_addr(&self, role: ListenerRole) -> Option<SocketAddr> {
        self.addresses
            .get()
            .and_then(|all| all.iter().find(|(r, _)| *r == role).map(|(_, addr)| *addr))
    }

    /// Grace period from configuration, or the built-in default.
    pub fn configured_grace(&self) -> Duration {
        self.config
            .get()
            .map(|config| config.shutdown.grace_period())
            .unwrap_or(DEFAULT_GRACE_PERIOD)
    }

    /// Create the registry. Succeeds exactly once per orchestrator.
    pub(crate) fn init_registry(&self, config: &ServiceConfig) -> Result<Arc<MetricsRegistry>, crate::observability::RegistryError> {
        if self.registry.get().is_some() {
            return Err(LifecycleError::RegistryAlreadyInitialized.into());
        }
        let registry = Arc::new(MetricsRegistry::new(&self.service, &config.metrics)?);
        self.registry
            .set(Arc::clone(&registry))
            .map_err(|_| LifecycleError::RegistryAlreadyInitialized)?;
        Ok(registry)
    }

    /// Request a stop.
    ///
    /// Exactly one caller performs the drain; every caller, concurrent or
    /// later, receives the same report.
    pub async fn stop(&self, grace: Duration) -> Arc<ShutdownReport> {
        use LifecycleState::*;
        loop {
            let current = self.state.get();
            match current {
                Created => {
                    if self.state.transition(Created, Stopped).is_ok() {
                        tracing::info!(service = %self.service, "Stopped before start");
                        return self.shutdown_sequence(Duration::ZERO, None).await;
                    }
                }
                Configuring | Starting => {
                    if self.state.transition(current, Draining).is_ok() {
                        tracing::info!(service = %self.service, state = %current, "Stop requested during startup");
                        return self.wait_report().await;
                    }
                }
                Running => {
                    if self.state.transition(Running, Draining).is_ok() {
                        tracing::info!(
                            service = %self.service,
                            grace_ms = grace.as_millis() as u64,
                            "Stop requested, draining"
                        );
                        return self.shutdown_sequence(grace, None).await;
                    }
                }
                Draining | Stopped | Failed => return self.wait_report().await,
            }
        }
    }

    /// Wait for the terminal report without requesting a stop.
    pub async fn wait_report(&self) -> Arc<ShutdownReport> {
        let mut receiver = self.report.subscribe();
        let published = receiver
            .wait_for(Option::is_some)
            .await
            .ok()
            .and_then(|report| report.clone());
        match published {
            Some(report) => report,
            None => Arc::new(ShutdownReport::empty(self.instance_id, &self.service, self.state())),
        }
    }

    /// The published report, if the orchestrator has finished.
    pub fn report(&self) -> Option<Arc<ShutdownReport>> {
        self.report.borrow().clone()
    }
}

impl std::fmt::Debug for LifecycleOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleOrchestrator")
            .field("instance_id", &self.instance_id)
            .field("service", &self.service)
            .field("kind", &self.kind)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Lock a mutex, recovering the data if a holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
