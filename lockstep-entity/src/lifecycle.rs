//! Entity lifecycle state machine.
//!
//! ```text
//! Uninitialized ──▶ AwaitingSetup ──▶ Running ──▶ ShuttingDown ──▶ Terminated
//!       │                 │                            ▲
//!       └─────────────────┴────────────────────────────┘
//! ```
//!
//! `AwaitingSetup → Running` happens exactly once, through a setup request or
//! a restore from storage.

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{EntityError, Result};

/// Lifecycle phase of an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityPhase {
    Uninitialized,
    AwaitingSetup,
    Running,
    ShuttingDown,
    Terminated,
}

impl EntityPhase {
    /// Whether `next` is a legal successor.
    pub fn can_transition_to(self, next: EntityPhase) -> bool {
        use EntityPhase::*;
        matches!(
            (self, next),
            (Uninitialized, AwaitingSetup)
                | (Uninitialized, ShuttingDown)
                | (AwaitingSetup, Running)
                | (AwaitingSetup, ShuttingDown)
                | (Running, ShuttingDown)
                | (ShuttingDown, Terminated)
        )
    }
}

/// Tracks the phase of one entity.
#[derive(Debug)]
pub struct Lifecycle {
    phase: EntityPhase,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            phase: EntityPhase::Uninitialized,
        }
    }

    pub fn phase(&self) -> EntityPhase {
        self.phase
    }

    pub fn is_running(&self) -> bool {
        self.phase == EntityPhase::Running
    }

    /// Fail with [`EntityError::NotRunning`] unless running.
    pub fn ensure_running(&self) -> Result<()> {
        if self.is_running() {
            Ok(())
        } else {
            Err(EntityError::NotRunning(self.phase))
        }
    }

    /// Move to `next`.
    ///
    /// A second transition into `Running` is reported as
    /// [`EntityError::DuplicateSetup`].
    pub fn transition(&mut self, next: EntityPhase) -> Result<()> {
        if !self.phase.can_transition_to(next) {
            if next == EntityPhase::Running && self.phase == EntityPhase::Running {
                return Err(EntityError::DuplicateSetup);
            }
            return Err(EntityError::InvalidTransition {
                from: self.phase,
                to: next,
            });
        }
        info!(from = ?self.phase, to = ?next, "Entity phase changed");
        self.phase = next;
        Ok(())
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}
