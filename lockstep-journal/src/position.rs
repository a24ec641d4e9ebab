//! Journal cursor positions.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Cursor into the journal: `(tick, operation within tick, step within operation)`.
///
/// Field order is significant: the derived ordering is lexicographic over
/// tick, then operation, then step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct JournalPosition {
    /// Simulated tick the cursor is in
    pub tick: u64,
    /// Index of the operation within the tick
    pub operation: u32,
    /// Index of the step within the operation
    pub step: u32,
}

impl JournalPosition {
    /// The minimum position.
    pub const EPOCH: JournalPosition = JournalPosition {
        tick: 0,
        operation: 0,
        step: 0,
    };

    /// Create a position from its parts.
    pub const fn new(tick: u64, operation: u32, step: u32) -> Self {
        Self {
            tick,
            operation,
            step,
        }
    }

    /// Position at the very start of a tick.
    pub const fn start_of_tick(tick: u64) -> Self {
        Self::new(tick, 0, 0)
    }

    /// Position at the start of an operation within a tick.
    pub const fn start_of_operation(tick: u64, operation: u32) -> Self {
        Self::new(tick, operation, 0)
    }

    /// Whether this position sits on an operation boundary.
    pub fn is_operation_boundary(&self) -> bool {
        self.step == 0
    }

    pub(crate) fn next_step(self) -> Self {
        Self::new(self.tick, self.operation, self.step + 1)
    }

    pub(crate) fn next_operation(self) -> Self {
        Self::new(self.tick, self.operation + 1, 0)
    }

    pub(crate) fn next_tick(self) -> Self {
        Self::start_of_tick(self.tick + 1)
    }
}

impl Default for JournalPosition {
    fn default() -> Self {
        Self::EPOCH
    }
}

impl fmt::Display for JournalPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.tick, self.operation, self.step)
    }
}
