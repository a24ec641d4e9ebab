//! Error types for the journal.

use crate::model::ActionError;
use crate::position::JournalPosition;

/// Error types for journal operations.
///
/// Apart from `ActionFailed` on a dry run, every variant signals a broken
/// invariant that the owning entity treats as fatal.
#[derive(Debug, thiserror::Error)]
pub enum JournalError {
    /// Model timeline cannot drive a journal
    #[error("Invalid model timeline: {0}")]
    InvalidTimeline(String),

    /// An action threw while being applied
    #[error("Action {action} failed at {position}: {source}")]
    ActionFailed {
        action: String,
        position: JournalPosition,
        #[source]
        source: ActionError,
    },

    /// The tick logic threw while being applied
    #[error("Tick {tick} failed: {source}")]
    TickFailed {
        tick: u64,
        #[source]
        source: ActionError,
    },

    /// Commit requested past the staged cursor
    #[error("Cannot commit to {requested}: staged position is {staged}")]
    CommitBeyondStaged {
        requested: JournalPosition,
        staged: JournalPosition,
    },

    /// Commit requested before the current checkpoint
    #[error("Cannot commit to {requested}: checkpoint is already {checkpoint}")]
    CommitBeforeCheckpoint {
        requested: JournalPosition,
        checkpoint: JournalPosition,
    },

    /// Commit requested in the middle of an operation
    #[error("Cannot commit to {0}: not an operation boundary")]
    CommitNotOnBoundary(JournalPosition),

    /// Position is older than the retained history
    #[error("Position {requested} is no longer retained (oldest is {oldest})")]
    PositionNotRetained {
        requested: JournalPosition,
        oldest: JournalPosition,
    },

    /// Position is ahead of the staged cursor
    #[error("Position {requested} is beyond staged position {staged}")]
    PositionBeyondStaged {
        requested: JournalPosition,
        staged: JournalPosition,
    },

    /// Model was mutated outside the journal
    #[error("Model mutated outside the journal at {position}: expected checksum {expected:#010x}, found {actual:#010x}")]
    ExternalMutation {
        position: JournalPosition,
        expected: u32,
        actual: u32,
    },

    /// Rolling back would undo committed operations
    #[error("Cannot roll back to {snapshot}: checkpoint is already {checkpoint}")]
    RollbackBeforeCheckpoint {
        snapshot: JournalPosition,
        checkpoint: JournalPosition,
    },

    /// No stage snapshot has been captured
    #[error("No stage snapshot captured")]
    NoStageSnapshot,

    /// Canonical encoding failed
    #[error("Encoding error: {0}")]
    Encoding(String),
}

pub type Result<T> = std::result::Result<T, JournalError>;
