//! Identifiers and value types shared across the entity.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Identifier of one entity instance; also its persistence key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(String);

impl EntityId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One client session subscribed to an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    /// Allocate a fresh session id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The player behind a session.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlayerId(String);

impl PlayerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PlayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Logical client-side channel an entity is delivered on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientSlot(pub u32);

impl fmt::Display for ClientSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "slot#{}", self.0)
    }
}

/// Transport channel of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelId(pub u32);

/// Content hash of a game configuration / resource bundle.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentHash(String);

impl ContentHash {
    pub fn new(hash: impl Into<String>) -> Self {
        Self(hash.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Information a client needs to replace stale resources.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceCorrection {
    /// Version the client declared
    pub client_version: ContentHash,
    /// Version the server is running
    pub server_version: ContentHash,
}

/// Another entity delivered to subscribers alongside this one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssociatedEntityRef {
    pub slot: ClientSlot,
    pub entity: EntityId,
}

/// Typed refusal returned to a subscribing session.
///
/// Refusals never affect the entity itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum SubscribeRefusal {
    /// Entity has no model yet
    #[error("Entity is not set up")]
    NotSetUp,

    /// Rejected by the handshake hook
    #[error("Handshake refused: {reason}")]
    HandshakeRefused { reason: String },

    /// Client must download corrected resources first
    #[error("Resource correction required: client {}, server {}", .0.client_version, .0.server_version)]
    ResourceCorrectionRequired(ResourceCorrection),

    /// The session is already subscribed
    #[error("Session {session} is already subscribed")]
    AlreadySubscribed { session: SessionId },

    /// An associated entity refused the session and nobody handled it
    #[error("Associated entity on {slot} refused: {reason}")]
    AssociatedEntityRefused { slot: ClientSlot, reason: String },
}

/// Why one client-submitted action was dropped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum ActionRejection {
    #[error("Missing action")]
    Missing,

    #[error("Wrong action family: expected {expected}, got {actual}")]
    WrongFamily { expected: String, actual: String },

    #[error("Undecodable action payload: {reason}")]
    Undecodable { reason: String },

    #[error("Action is not client synchronized")]
    NotClientSynchronized,

    #[error("Development-only action from a player without development features")]
    DevelopmentOnly,

    #[error("Action rejected by validation")]
    ValidationFailed,

    #[error("Dry run failed: {reason}")]
    DryRunFailed { reason: String },

    #[error("Unknown session")]
    UnknownSession,
}
