//! Lockstep Entity - actor-hosted multiplayer entity
//!
//! Hosts one replicated model per entity and keeps every subscribed client
//! in lockstep with it:
//!
//! - **Ticks** are caught up from wall-clock time on a scheduled wake
//! - **Client batches** are validated item by item and dry-run before staging
//! - **Flushes** commit the journal and broadcast one timeline update
//! - **Desync reports** are matched against a short snapshot trace
//! - **Snapshots** are persisted periodically and on shutdown
//!
//! # Architecture
//!
//! ```text
//!   EntityHandle ──▶ mailbox ──▶ ┌──────────────────────────────┐
//!   tick timer ───▶ (mpsc)  ──▶  │ Entity                       │
//!                                │  ├─ Journal<M>               │
//!                                │  ├─ ClientPeerState × n ──────┼──▶ ClientMessage
//!                                │  ├─ TickScheduler            │
//!                                │  ├─ DesyncTracer             │
//!                                │  └─ PersistenceStore ─────────┼──▶ snapshots
//!                                └──────────────────────────────┘
//! ```

pub mod actor;
pub mod clock;
pub mod config;
pub mod desync;
pub mod entity;
pub mod error;
pub mod lifecycle;
pub mod logic;
pub mod persistence;
pub mod resources;
pub mod scheduler;
pub mod session;
pub mod types;

// Re-export main types
pub use actor::{spawn_entity, EntityHandle, EntityMessage};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::EntityConfig;
pub use desync::{ChecksumMismatchReport, DesyncDebugMode, DesyncDiagnosis, StateDifference};
pub use entity::{Entity, EntityServices, EntityStatus};
pub use error::{EntityError, PersistenceError, Result};
pub use lifecycle::EntityPhase;
pub use logic::{EntityContext, EntityLogic};
pub use persistence::{InMemoryStore, NoPersistence, PersistenceStore, SchemaMigrator};
pub use resources::{ResourceProvider, StaticResources};
pub use session::{
    ActionEnvelope, BatchReport, ClientInfo, ClientMessage, InitialState, PingTracePoint,
    SubscribeRequest, SubscribeResponse, TimelineUpdate,
};
pub use types::*;
