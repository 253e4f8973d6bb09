//! Lifecycle state cell.
//!
//! The state is a single `AtomicU8` mutated only by compare-and-swap, so every
//! transition has exactly one winner. A `watch` channel publishes each change
//! to observers.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;

/// Service lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "UPPERCASE")]
#[repr(u8)]
pub enum LifecycleState {
    Created = 0,
    Configuring = 1,
    Starting = 2,
    Running = 3,
    Draining = 4,
    Stopped = 5,
    Failed = 6,
}

impl LifecycleState {
    /// Stopped and Failed are final.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Failed)
    }

    /// Whether the machine permits `self → to`.
    pub fn allows(self, to: LifecycleState) -> bool {
        use LifecycleState::*;
        match (self, to) {
            (Created, Configuring) | (Configuring, Starting) | (Starting, Running) => true,
            (Running, Draining) | (Draining, Stopped) => true,
            // stop before or during startup
            (Created, Stopped) | (Configuring, Draining) | (Starting, Draining) => true,
            (from, Failed) => !from.is_terminal(),
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "CREATED",
            Self::Configuring => "CONFIGURING",
            Self::Starting => "STARTING",
            Self::Running => "RUNNING",
            Self::Draining => "DRAINING",
            Self::Stopped => "STOPPED",
            Self::Failed => "FAILED",
        }
    }
}

impl From<u8> for LifecycleState {
    fn from(v: u8) -> Self {
        match v {
            0 => Self::Created,
            1 => Self::Configuring,
            2 => Self::Starting,
            3 => Self::Running,
            4 => Self::Draining,
            5 => Self::Stopped,
            _ => Self::Failed,
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Misuse of the lifecycle or of the objects it owns.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LifecycleError {
    #[error("invalid lifecycle transition {from} -> {to}")]
    InvalidTransition {
        from: LifecycleState,
        to: LifecycleState,
    },

    #[error("metrics registry is not available while {state}")]
    RegistryUnavailable { state: LifecycleState },

    #[error("metrics registry was already initialized")]
    RegistryAlreadyInitialized,

    #[error("metrics registry has been released")]
    RegistryReleased,

    #[error("a shutdown hook is already installed")]
    HookAlreadyInstalled,
}

/// Owner side of the state. Held by exactly one orchestrator.
#[derive(Debug)]
pub struct StateCell {
    state: Arc<AtomicU8>,
    changes: watch::Sender<LifecycleState>,
}

impl StateCell {
    pub fn new() -> Self {
        let (changes, _) = watch::channel(LifecycleState::Created);
        Self {
            state: Arc::new(AtomicU8::new(LifecycleState::Created as u8)),
            changes,
        }
    }

    pub fn get(&self) -> LifecycleState {
        LifecycleState::from(self.state.load(Ordering::Acquire))
    }

    /// Move `from → to` if the cell still holds `from`.
    pub fn transition(&self, from: LifecycleState, to: LifecycleState) -> Result<(), LifecycleError> {
        if !from.allows(to) {
            return Err(LifecycleError::InvalidTransition { from, to });
        }
        match self
            .state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => {
                tracing::debug!(from = %from, to = %to, "Lifecycle transition");
                self.changes.send_replace(to);
                Ok(())
            }
            Err(actual) => Err(LifecycleError::InvalidTransition {
                from: LifecycleState::from(actual),
                to,
            }),
        }
    }

    /// Force Failed from any non-terminal state. Returns the state it replaced,
    /// or `None` if the cell was already terminal.
    pub fn fail(&self) -> Option<LifecycleState> {
        let mut current = self.get();
        loop {
            if current.is_terminal() {
                return None;
            }
            match self.state.compare_exchange_weak(
                current as u8,
                LifecycleState::Failed as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    tracing::debug!(from = %current, to = %LifecycleState::Failed, "Lifecycle transition");
                    self.changes.send_replace(LifecycleState::Failed);
                    return Some(current);
                }
                Err(actual) => current = LifecycleState::from(actual),
            }
        }
    }

    /// Read-only view for other components.
    pub fn observer(&self) -> LifecycleObserver {
        LifecycleObserver {
            state: Arc::clone(&self.state),
            changes: self.changes.subscribe(),
        }
    }
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new()
    }
}

/// Read-only lifecycle view that can await changes.
#[derive(Debug, Clone)]
pub struct LifecycleObserver {
    state: Arc<AtomicU8>,
    changes: watch::Receiver<LifecycleState>,
}

impl LifecycleObserver {
    pub fn current(&self) -> LifecycleState {
        LifecycleState::from(self.state.load(Ordering::Acquire))
    }

    /// Wait until the state satisfies `predicate`, returning that state.
    pub async fn wait_for(&mut self, mut predicate: impl FnMut(LifecycleState) -> bool) -> LifecycleState {
        let current = self.current();
        if predicate(current) {
            return current;
        }
        let result = self.changes.wait_for(|state| predicate(*state)).await.map(|state| *state);
        match result {
            Ok(state) => state,
            Err(_) => self.current(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use LifecycleState::*;

    #[test]
    fn u8_round_trip() {
        for state in [Created, Configuring, Starting, Running, Draining, Stopped, Failed] {
            assert_eq!(LifecycleState::from(state as u8), state);
        }
    }

    #[test]
    fn happy_path_transitions() {
        let cell = StateCell::new();
        cell.transition(Created, Configuring).unwrap();
        cell.transition(Configuring, Starting).unwrap();
        cell.transition(Starting, Running).unwrap();
        cell.transition(Running, Draining).unwrap();
        cell.transition(Draining, Stopped).unwrap();
        assert_eq!(cell.get(), Stopped);
    }

    #[test]
    fn only_one_cas_wins() {
        let cell = StateCell::new();
        cell.transition(Created, Configuring).unwrap();
        let err = cell.transition(Created, Configuring).unwrap_err();
        assert_eq!(err, LifecycleError::InvalidTransition { from: Configuring, to: Configuring });
    }

    #[test]
    fn illegal_edges_are_rejected() {
        let cell = StateCell::new();
        assert!(cell.transition(Created, Running).is_err());
        assert!(!Stopped.allows(Failed));
        assert!(!Running.allows(Starting));
        assert!(Starting.allows(Draining));
    }

    #[test]
    fn fail_reports_previous_state_once() {
        let cell = StateCell::new();
        cell.transition(Created, Configuring).unwrap();
        assert_eq!(cell.fail(), Some(Configuring));
        assert_eq!(cell.fail(), None);
        assert_eq!(cell.get(), Failed);
    }

    #[tokio::test]
    async fn observer_sees_changes() {
        let cell = StateCell::new();
        let mut observer = cell.observer();
        let waiter = tokio::spawn(async move { observer.wait_for(|s| s == Configuring).await });
        cell.transition(Created, Configuring).unwrap();
        assert_eq!(waiter.await.unwrap(), Configuring);
    }
}
