//! OS signal handling.
//!
//! # Responsibilities
//! - Wait for SIGTERM or SIGINT
//! - Install the shutdown hook that turns a signal into `stop(grace)`
//!
//! # Design Decisions
//! - Uses Tokio's signal handling (async-safe)
//! - The hook spawns the stop and returns; it never blocks signal delivery
//! - Repeated signals land on an orchestrator that is already draining and
//!   are absorbed by `stop` idempotence

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::lifecycle::orchestrator::{lock, LifecycleOrchestrator};
use crate::lifecycle::state::LifecycleError;
use crate::observability::diagnostics::WorkerRole;

/// Future whose completion stops the service.
pub type ShutdownTrigger = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Resolves on the first SIGINT or SIGTERM.
pub async fn termination() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "Failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                tracing::error!(error = %err, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received SIGINT"),
        _ = terminate => tracing::info!("Received SIGTERM"),
    }
}

impl LifecycleOrchestrator {
    /// Stop with the configured grace period on SIGINT or SIGTERM.
    pub fn install_shutdown_hook(self: &Arc<Self>) -> Result<(), LifecycleError> {
        self.install_shutdown_hook_with(termination())
    }

    /// Stop with the configured grace period once `trigger` resolves.
    ///
    /// At most one hook per orchestrator. The hook is removed when shutdown
    /// completes.
    pub fn install_shutdown_hook_with<F>(self: &Arc<Self>, trigger: F) -> Result<(), LifecycleError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.hook_installed.swap(true, Ordering::AcqRel) {
            return Err(LifecycleError::HookAlreadyInstalled);
        }
        if self.state().is_terminal() {
            tracing::debug!(state = %self.state(), "Shutdown hook not armed, already terminal");
            return Ok(());
        }

        let orchestrator = Arc::clone(self);
        let worker = self.workers.register("shutdown-hook", WorkerRole::ShutdownHook);
        let handle = tokio::spawn(async move {
            let _worker = worker;
            trigger.await;
            let grace = orchestrator.configured_grace();
            tracing::info!(
                service = %orchestrator.service(),
                grace_ms = grace.as_millis() as u64,
                "Shutdown hook fired"
            );
            tokio::spawn(async move {
                orchestrator.stop(grace).await;
            });
        });

        *lock(&self.hook) = Some(handle);
        tracing::debug!(service = %self.service, "Shutdown hook installed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::state::LifecycleState;
    use crate::transport::TransportKind;
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn second_install_is_rejected() {
        let orchestrator = LifecycleOrchestrator::new("orders", TransportKind::Http);
        orchestrator.install_shutdown_hook_with(std::future::pending()).unwrap();
        assert_eq!(
            orchestrator.install_shutdown_hook_with(std::future::pending()),
            Err(LifecycleError::HookAlreadyInstalled)
        );
        orchestrator.stop(std::time::Duration::ZERO).await;
    }

    #[tokio::test]
    async fn trigger_stops_the_orchestrator() {
        let orchestrator = LifecycleOrchestrator::new("orders", TransportKind::Http);
        let (fire, fired) = oneshot::channel::<()>();
        orchestrator
            .install_shutdown_hook_with(async move {
                let _ = fired.await;
            })
            .unwrap();

        fire.send(()).unwrap();
        let report = orchestrator.wait_report().await;
        assert_eq!(report.final_state, LifecycleState::Stopped);
    }
}
