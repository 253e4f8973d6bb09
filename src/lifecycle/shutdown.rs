//! Ordered shutdown.
//!
//! # Sequence
//! ```text
//! take resources ──► drain transport (or close bound listeners)
//!                ──► record forced cancellations
//!                ──► stop exporters (bounded final flush)
//!                ──► release registry
//!                ──► Draining → Stopped, publish report
//! ```
//!
//! Runs exactly once per orchestrator: either from `stop` after it won the
//! transition into Draining, or from startup when it aborts.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use uuid::Uuid;

use crate::lifecycle::orchestrator::{lock, LifecycleOrchestrator};
use crate::lifecycle::state::LifecycleState;
use crate::observability::exporters::{ExporterError, ExporterKind, ExporterSet};
use crate::observability::metrics::{Labels, DRAIN_FORCED_CANCELLATIONS};
use crate::transport::ListenerDrain;

/// Final stop timeout for exporters when no configuration was resolved.
const DEFAULT_EXPORTER_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// What happened during shutdown. Shared by every caller of `stop`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ShutdownReport {
    pub instance_id: Uuid,
    pub service: String,
    pub final_state: LifecycleState,
    /// In-flight requests aborted at the grace deadline, across all listeners.
    pub forced_cancellations: u64,
    pub listeners: Vec<ListenerDrain>,
    pub exporter_failures: Vec<ExporterFailure>,
    /// Set when startup failed and this report came from its cleanup.
    pub startup_error: Option<String>,
    pub elapsed_ms: u64,
}

impl ShutdownReport {
    pub(crate) fn empty(instance_id: Uuid, service: &str, final_state: LifecycleState) -> Self {
        Self {
            instance_id,
            service: service.to_string(),
            final_state,
            forced_cancellations: 0,
            listeners: Vec::new(),
            exporter_failures: Vec::new(),
            startup_error: None,
            elapsed_ms: 0,
        }
    }

    /// Stopped, nothing forced, every exporter flushed.
    pub fn is_clean(&self) -> bool {
        self.final_state == LifecycleState::Stopped
            && self.forced_cancellations == 0
            && self.exporter_failures.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExporterFailure {
    pub exporter: ExporterKind,
    pub message: String,
}

impl From<ExporterError> for ExporterFailure {
    fn from(err: ExporterError) -> Self {
        Self {
            exporter: err.kind(),
            message: err.to_string(),
        }
    }
}

impl LifecycleOrchestrator {
    /// Release everything startup acquired and publish the report.
    pub(crate) async fn shutdown_sequence(&self, grace: Duration, startup_error: Option<String>) -> Arc<ShutdownReport> {
        let started = Instant::now();
        let resources = std::mem::take(&mut *lock(&self.resources));

        if let Some(bound) = resources.bound {
            bound.close();
        }

        let (listeners, forced_cancellations) = match resources.transport {
            Some(running) => {
                let drained = running.drain(grace).await;
                (drained.listeners, drained.forced_cancellations)
            }
            None => (Vec::new(), 0),
        };

        if let Some(registry) = self.registry.get() {
            match registry.register_counter(DRAIN_FORCED_CANCELLATIONS, &Labels::new()) {
                Ok(counter) => registry.record(&counter, forced_cancellations as f64),
                Err(err) => tracing::debug!(error = %err, "Forced cancellation counter not recorded"),
            }
        }

        let stop_timeout = self
            .config
            .get()
            .map(|config| config.metrics.stop_timeout())
            .unwrap_or(DEFAULT_EXPORTER_STOP_TIMEOUT);
        let mut exporter_failures: Vec<ExporterFailure> = resources
            .exporter_failures
            .into_iter()
            .map(ExporterFailure::from)
            .collect();
        exporter_failures.extend(
            ExporterSet::stop_all(resources.exporters, stop_timeout)
                .await
                .into_iter()
                .map(ExporterFailure::from),
        );

        if let Some(registry) = self.registry.get() {
            registry.release();
        }

        let hook = lock(&self.hook).take();
        if let Some(hook) = hook {
            hook.abort();
        }

        if self.state.get() == LifecycleState::Draining {
            if let Err(err) = self.state.transition(LifecycleState::Draining, LifecycleState::Stopped) {
                tracing::warn!(error = %err, "Final transition lost");
            }
        }

        let report = Arc::new(ShutdownReport {
            instance_id: self.instance_id,
            service: self.service.clone(),
            final_state: self.state.get(),
            forced_cancellations,
            listeners,
            exporter_failures,
            startup_error,
            elapsed_ms: started.elapsed().as_millis() as u64,
        });

        if report.final_state == LifecycleState::Failed {
            tracing::error!(
                service = %report.service,
                instance_id = %report.instance_id,
                error = ?report.startup_error,
                "Service failed"
            );
        } else {
            tracing::info!(
                service = %report.service,
                instance_id = %report.instance_id,
                forced_cancellations = report.forced_cancellations,
                exporter_failures = report.exporter_failures.len(),
                elapsed_ms = report.elapsed_ms,
                "Service stopped"
            );
        }

        self.report.send_replace(Some(Arc::clone(&report)));
        report
    }
}
