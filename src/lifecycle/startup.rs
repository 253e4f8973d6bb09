//! Startup orchestration.
//!
//! # Sequence
//! ```text
//! Created ──► Configuring: resolve layers, typed view, logging,
//!                          exporter descriptors, listener layout
//!         ──► registry created
//!         ──► Starting:    exporters started, listeners bound
//!         ──► Running:     accept loops spawned
//! ```
//!
//! # Design Decisions
//! - Any failure runs the shutdown sequence before `start` returns, so a
//!   failed start holds no ports, tasks, or handlers
//! - A stop requested during startup is observed at each checkpoint and
//!   during bind retries; startup then unwinds and reports `Cancelled`
//! - Listeners bind last, after exporters are up
//! - A shutdown hook carried by the plan is armed as soon as Configuring is
//!   entered, so a signal during bind retries cancels startup

use std::sync::Arc;

use thiserror::Error;

use crate::config::{ConfigError, ConfigResolver, OverrideSource, ServiceConfig, ValidationError};
use crate::http::admin::{AdminState, HealthCheck};
use crate::lifecycle::orchestrator::{lock, LifecycleOrchestrator};
use crate::lifecycle::shutdown::ShutdownReport;
use crate::lifecycle::signals::ShutdownTrigger;
use crate::lifecycle::state::{LifecycleError, LifecycleState};
use crate::net::BindError;
use crate::observability::exporters::ExporterSet;
use crate::observability::logging;
use crate::observability::metrics::RegistryError;
use crate::resilience::RetryPolicy;
use crate::transport::{BoundServer, ServiceRoutes, TransportServer};

/// Everything `start` needs from the embedding service.
pub struct StartupPlan {
    pub resolver: ConfigResolver,
    pub overrides: Vec<OverrideSource>,
    pub routes: ServiceRoutes,
    pub health: HealthCheck,
    /// Install the global tracing subscriber from `logging.*`.
    pub install_logging: bool,
    /// Armed when Configuring is entered. Ignored if a hook is already installed.
    pub shutdown_hook: Option<ShutdownTrigger>,
}

/// Why `start` did not reach Running.
///
/// Every variant except `Lifecycle` carries the report of the cleanup that
/// ran before `start` returned.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    #[error("configuration failed: {source}")]
    Config {
        source: ConfigError,
        report: Arc<ShutdownReport>,
    },

    #[error("metrics registry could not be created: {source}")]
    Registry {
        source: RegistryError,
        report: Arc<ShutdownReport>,
    },

    #[error("transport failed to bind: {source}")]
    Bind {
        source: BindError,
        report: Arc<ShutdownReport>,
    },

    #[error("startup cancelled by a stop request")]
    Cancelled { report: Arc<ShutdownReport> },
}

impl StartupError {
    pub fn report(&self) -> Option<&Arc<ShutdownReport>> {
        match self {
            Self::Lifecycle(_) => None,
            Self::Config { report, .. }
            | Self::Registry { report, .. }
            | Self::Bind { report, .. }
            | Self::Cancelled { report } => Some(report),
        }
    }
}

#[derive(Debug, Error)]
enum StartupFailure {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Bind(BindError),
    #[error("stop requested")]
    Cancelled,
}

impl From<BindError> for StartupFailure {
    fn from(err: BindError) -> Self {
        match err {
            BindError::Cancelled { .. } => Self::Cancelled,
            other => Self::Bind(other),
        }
    }
}

/// Output of the Configuring phase.
struct Configured {
    config: Arc<ServiceConfig>,
    exporters: ExporterSet,
    transport: TransportServer,
}

impl LifecycleOrchestrator {
    /// Drive Created → Running.
    ///
    /// Only one call can succeed; later calls fail with an invalid transition.
    pub async fn start(self: &Arc<Self>, mut plan: StartupPlan) -> Result<(), StartupError> {
        self.state.transition(LifecycleState::Created, LifecycleState::Configuring)?;
        tracing::info!(
            service = %self.service,
            instance_id = %self.instance_id,
            kind = %self.kind,
            "Service starting"
        );

        if let Some(trigger) = plan.shutdown_hook.take() {
            if let Err(err) = self.install_shutdown_hook_with(trigger) {
                tracing::debug!(service = %self.service, error = %err, "Keeping the existing shutdown hook");
            }
        }

        match self.run_startup(plan).await {
            Ok(()) => Ok(()),
            Err(failure) => Err(self.abort_startup(failure).await),
        }
    }

    async fn run_startup(&self, plan: StartupPlan) -> Result<(), StartupFailure> {
        let StartupPlan {
            resolver,
            overrides,
            routes,
            health,
            install_logging,
            shutdown_hook: _,
        } = plan;

        let configured = self.configure(&resolver, &overrides, routes, health, install_logging)?;
        self.checkpoint(LifecycleState::Configuring)?;

        let registry = self.init_registry(&configured.config)?;
        self.state
            .transition(LifecycleState::Configuring, LifecycleState::Starting)
            .map_err(|_| StartupFailure::Cancelled)?;

        let started = configured.exporters.start(&registry, &self.handlers, &self.workers);
        {
            let mut resources = lock(&self.resources);
            resources.exporters = started.active;
            resources.exporter_failures = started.failures;
        }
        self.checkpoint(LifecycleState::Starting)?;

        let policy = RetryPolicy::from(&configured.config.transport.bind.retry);
        let cancelled = || self.state.get() != LifecycleState::Starting;
        let bound = configured.transport.bind(&policy, &cancelled).await?;

        self.go_live(bound)?;
        tracing::info!(
            service = %self.service,
            addresses = ?self.addresses.get(),
            "Service running"
        );
        Ok(())
    }

    fn configure(
        &self,
        resolver: &ConfigResolver,
        overrides: &[OverrideSource],
        routes: ServiceRoutes,
        health: HealthCheck,
        install_logging: bool,
    ) -> Result<Configured, StartupFailure> {
        let snapshot = Arc::new(resolver.resolve(&self.service, overrides)?);
        let config = Arc::new(ServiceConfig::from_snapshot(&snapshot)?);

        if install_logging {
            logging::init(&config.logging).map_err(|err| {
                ConfigError::Validation(vec![ValidationError {
                    key: "logging.level".to_string(),
                    message: err.to_string(),
                }])
            })?;
        }

        let exporters = ExporterSet::from_config(&config.metrics, &self.service)?;
        let admin = AdminState {
            handlers: self.handlers.clone(),
            lifecycle: self.state.observer(),
            health,
            workers: self.workers.clone(),
        };
        let transport = TransportServer::from_config(&config, routes, admin)?;

        // Set once: Configuring is entered at most once per orchestrator.
        let _ = self.snapshot.set(Arc::clone(&snapshot));
        let _ = self.config.set(Arc::clone(&config));

        tracing::debug!(
            service = %self.service,
            keys = snapshot.len(),
            exporters = exporters.descriptors().len(),
            listeners = transport.listeners().len(),
            "Configuration resolved"
        );
        Ok(Configured {
            config,
            exporters,
            transport,
        })
    }

    fn checkpoint(&self, expected: LifecycleState) -> Result<(), StartupFailure> {
        if self.state.get() == expected {
            Ok(())
        } else {
            Err(StartupFailure::Cancelled)
        }
    }

    /// Starting → Running and spawn the accept loops, atomically with
    /// respect to `stop`.
    fn go_live(&self, bound: BoundServer) -> Result<(), StartupFailure> {
        let mut resources = lock(&self.resources);
        if self
            .state
            .transition(LifecycleState::Starting, LifecycleState::Running)
            .is_err()
        {
            resources.bound = Some(bound);
            return Err(StartupFailure::Cancelled);
        }
        let running = bound.serve(&self.workers);
        let _ = self.addresses.set(running.addresses());
        resources.transport = Some(running);
        Ok(())
    }

    async fn abort_startup(&self, failure: StartupFailure) -> StartupError {
        if let StartupFailure::Cancelled = failure {
            tracing::info!(service = %self.service, "Startup cancelled by stop request");
            let report = self.shutdown_sequence(std::time::Duration::ZERO, None).await;
            return StartupError::Cancelled { report };
        }

        let previous = self.state.fail();
        tracing::error!(
            service = %self.service,
            state = ?previous,
            error = %failure,
            "Startup failed"
        );
        let report = self
            .shutdown_sequence(std::time::Duration::ZERO, Some(failure.to_string()))
            .await;

        match failure {
            StartupFailure::Config(source) => StartupError::Config { source, report },
            StartupFailure::Registry(source) => StartupError::Registry { source, report },
            StartupFailure::Bind(source) => StartupError::Bind { source, report },
            StartupFailure::Cancelled => StartupError::Cancelled { report },
        }
    }
}
