//! Lifecycle state machine for the launched app.
//!
//! The raw [`LifecycleState`] record is the single source of truth the menu
//! reads. Writers go through [`LifecycleStore::transition`], readers take
//! [`LifecycleStore::snapshot`]; both hold the same `RwLock` so a reader never
//! sees a half-applied event.

use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Raw lifecycle record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifecycleState {
    pub installed: bool,
    pub installing: bool,
    pub running: bool,
    pub endpoint: Option<String>,
}

/// The one phase derived from a [`LifecycleState`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "phase", content = "endpoint", rename_all = "snake_case")]
pub enum EffectiveState {
    NotInstalled,
    Installing,
    InstalledIdle,
    Running,
    RunningReady(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    InstallStarted,
    InstallFinished(bool),
    LaunchStarted,
    Ready(String),
    Stopped,
    /// Drops the installed flag so the app can be installed again.
    Uninstalled,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransitionError {
    #[error("invalid transition: {event:?} in state {from:?}")]
    InvalidTransition {
        from: EffectiveState,
        event: LifecycleEvent,
    },
    #[error("lifecycle lock poisoned")]
    LockPoisoned,
}

impl LifecycleState {
    /// State of an app whose environment already exists on disk.
    pub fn installed() -> Self {
        Self {
            installed: true,
            ..Self::default()
        }
    }

    pub fn effective(&self) -> EffectiveState {
        if self.installing {
            return EffectiveState::Installing;
        }
        if !self.installed {
            return EffectiveState::NotInstalled;
        }
        match (self.running, &self.endpoint) {
            (true, Some(url)) => EffectiveState::RunningReady(url.clone()),
            (true, None) => EffectiveState::Running,
            (false, _) => EffectiveState::InstalledIdle,
        }
    }

    /// Pure transition. Returns the next state or rejects the event.
    pub fn apply(&self, event: &LifecycleEvent) -> Result<Self, TransitionError> {
        use EffectiveState as S;
        use LifecycleEvent as E;

        let next = match (self.effective(), event) {
            (S::NotInstalled, E::InstallStarted) => Self {
                installing: true,
                ..Self::default()
            },
            (S::Installing, E::InstallFinished(true)) => Self::installed(),
            (S::Installing, E::InstallFinished(false)) => Self::default(),
            (S::InstalledIdle, E::LaunchStarted) => Self {
                running: true,
                ..Self::installed()
            },
            (S::InstalledIdle, E::Uninstalled) => Self::default(),
            (S::Running, E::Ready(url)) => Self {
                running: true,
                endpoint: Some(url.clone()),
                ..Self::installed()
            },
            (S::Running | S::RunningReady(_), E::Stopped) => Self::installed(),
            (from, event) => {
                return Err(TransitionError::InvalidTransition {
                    from,
                    event: event.clone(),
                })
            }
        };
        Ok(next)
    }
}

/// Process-wide holder of the lifecycle record.
#[derive(Debug, Default)]
pub struct LifecycleStore {
    state: RwLock<LifecycleState>,
}

impl LifecycleStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_state(state: LifecycleState) -> Self {
        Self {
            state: RwLock::new(state),
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, LifecycleState>, TransitionError> {
        self.state.read().map_err(|e| {
            tracing::error!("LifecycleStore lock poisoned: {}", e);
            TransitionError::LockPoisoned
        })
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, LifecycleState>, TransitionError> {
        self.state.write().map_err(|e| {
            tracing::error!("LifecycleStore lock poisoned: {}", e);
            TransitionError::LockPoisoned
        })
    }

    /// Copy of the last committed state.
    pub fn snapshot(&self) -> Result<LifecycleState, TransitionError> {
        Ok(self.read()?.clone())
    }

    pub fn effective(&self) -> Result<EffectiveState, TransitionError> {
        Ok(self.read()?.effective())
    }

    /// Apply `event` atomically. On rejection the stored state is untouched.
    pub fn transition(&self, event: LifecycleEvent) -> Result<LifecycleState, TransitionError> {
        let mut guard = self.write()?;
        let next = guard.apply(&event).map_err(|e| {
            tracing::error!("Rejected lifecycle event: {}", e);
            e
        })?;
        tracing::info!(
            "Lifecycle transition: {:?} -> {:?} ({:?})",
            guard.effective(),
            next.effective(),
            event
        );
        *guard = next.clone();
        Ok(next)
    }
}
