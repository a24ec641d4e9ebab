//! Lockstep Journal - deterministic operation log for replicated models
//!
//! Owns a replicated model and applies every change to it as a journaled
//! operation:
//!
//! - **Ticks** advance simulated time by one unit
//! - **Actions** are typed commands, server-issued or client-submitted
//! - **Steps** split an operation into its cascaded sub-effects
//!
//! # Positions
//!
//! ```text
//!   tick 7                                   tick 8
//!   ├─ op 0: action ─ step 0, step 1 ─┐      ├─ op 0 ...
//!   ├─ op 1: action ─ step 0 ─────────┤      │
//!   └─ op 2: tick ── step 0 ──────────┴──────┘
//!        ▲                        ▲
//!     checkpoint               staged
//! ```
//!
//! Everything between the checkpoint and the staged cursor has been applied
//! to the model but not yet delivered to clients. Checksums of the canonical
//! model encoding let every replica verify it replayed the same history.

pub mod checksum;
pub mod error;
pub mod journal;
pub mod model;
pub mod operation;
pub mod position;
pub mod walk;

// Re-export main types
pub use checksum::{
    compute_checksum, decode_canonical, encode_canonical, sorted_set, CHECKSUM_ENCODING_VERSION,
};
pub use error::{JournalError, Result};
pub use journal::{Journal, JournalOptions};
pub use model::{ActionError, Cascade, ExecuteFlags, Model, ModelAction, ModelTimeline};
pub use operation::{OperationKind, OperationSummary, StagedOperation, StepRecord};
pub use position::JournalPosition;
pub use walk::{JournalWalker, WalkEntry};
