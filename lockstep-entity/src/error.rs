//! Error types for the entity.

use lockstep_journal::JournalError;

use crate::lifecycle::EntityPhase;

/// Errors raised while reading or writing snapshots.
#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    /// The backing store failed
    #[error("Store error: {0}")]
    Store(String),

    /// Payload could not be encoded or decoded
    #[error("Snapshot codec error: {0}")]
    Codec(String),

    /// Stored schema predates every registered migration
    #[error("Schema version {stored} is older than the oldest supported version {oldest}")]
    SchemaTooOld { stored: u32, oldest: u32 },

    /// Stored schema was written by a newer build
    #[error("Schema version {stored} is newer than the current version {current}")]
    SchemaTooNew { stored: u32, current: u32 },

    /// A migration step failed
    #[error("Migration from schema version {from} failed: {reason}")]
    Migration { from: u32, reason: String },

    /// Write did not complete in time
    #[error("Write timed out after {0}ms")]
    Timeout(u64),
}

/// Errors raised by the entity.
///
/// Everything except [`EntityError::NotRunning`], [`EntityError::MailboxClosed`]
/// and [`EntityError::Terminated`] is fatal: the hosting actor stops.
#[derive(Debug, thiserror::Error)]
pub enum EntityError {
    /// Setup requested after the entity already has a model
    #[error("Entity is already set up")]
    DuplicateSetup,

    /// Request needs a running entity
    #[error("Entity is not running (phase {0:?})")]
    NotRunning(EntityPhase),

    /// Illegal lifecycle transition
    #[error("Invalid phase transition from {from:?} to {to:?}")]
    InvalidTransition { from: EntityPhase, to: EntityPhase },

    /// Tick update entered while already updating ticks
    #[error("Re-entrant tick update")]
    ReentrantTickUpdate,

    /// Wall clock ran too far ahead of the model
    #[error("Too many pending ticks: {pending} (limit {limit})")]
    TooManyPendingTicks { pending: u64, limit: u64 },

    /// Flush backlog is too large
    #[error("Too many pending operations: {pending} (limit {limit})")]
    TooManyPendingOperations { pending: usize, limit: usize },

    /// Model setup hook failed
    #[error("Model setup failed: {0}")]
    SetupFailed(String),

    /// Outbound payload could not be encoded
    #[error("Encoding error: {0}")]
    Encoding(String),

    #[error("Journal error: {0}")]
    Journal(#[from] JournalError),

    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    /// Entity task is gone
    #[error("Entity mailbox closed")]
    MailboxClosed,

    /// Entity stopped after a fatal error while handling the request
    #[error("Entity terminated: {0}")]
    Terminated(String),
}

impl EntityError {
    /// Whether the entity must stop.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            EntityError::NotRunning(_) | EntityError::MailboxClosed | EntityError::Terminated(_)
        )
    }
}

/// Result type for entity operations.
pub type Result<T> = std::result::Result<T, EntityError>;
