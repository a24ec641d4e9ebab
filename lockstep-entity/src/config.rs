//! Configuration for a multiplayer entity.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::desync::DesyncDebugMode;
use crate::types::PlayerId;

/// Configuration for one entity kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EntityConfig {
    /// Automatic tick cadence
    pub tick_schedule: TickScheduleConfig,
    /// Sanity bounds on backlog
    pub limits: LimitsConfig,
    /// Desync debugging
    pub desync: DesyncConfig,
    /// Snapshot persistence
    pub persistence: PersistenceConfig,
    /// Client sessions
    pub session: SessionConfig,
    /// Mailbox capacity of the hosting actor
    pub mailbox_capacity: usize,
}

impl Default for EntityConfig {
    fn default() -> Self {
        Self {
            tick_schedule: TickScheduleConfig::default(),
            limits: LimitsConfig::default(),
            desync: DesyncConfig::default(),
            persistence: PersistenceConfig::default(),
            session: SessionConfig::default(),
            mailbox_capacity: 256,
        }
    }
}

impl EntityConfig {
    /// Load config from YAML.
    pub fn from_yaml(yaml: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(yaml)
    }

    /// Serialize to YAML.
    pub fn to_yaml(&self) -> Result<String, serde_yaml::Error> {
        serde_yaml::to_string(self)
    }

    pub(crate) fn mailbox_capacity(&self) -> usize {
        self.mailbox_capacity.max(1)
    }
}

/// Tick scheduling configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TickScheduleConfig {
    /// Wake interval while nobody is subscribed (ms)
    pub when_no_clients_connected_ms: u64,
    /// Wake interval while clients are subscribed (ms); 0 wakes on every tick boundary
    pub with_clients_connected_ms: u64,
}

impl TickScheduleConfig {
    pub fn interval(&self, has_clients: bool) -> Duration {
        if has_clients {
            Duration::from_millis(self.with_clients_connected_ms)
        } else {
            Duration::from_millis(self.when_no_clients_connected_ms)
        }
    }
}

impl Default for TickScheduleConfig {
    fn default() -> Self {
        Self {
            when_no_clients_connected_ms: 5_000,
            with_clients_connected_ms: 0,
        }
    }
}

/// Backlog limits. Exceeding either is fatal to the entity.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Maximum catch-up, in seconds of ticks
    pub max_pending_tick_seconds: u64,
    /// Maximum operations in one flush
    pub max_pending_operations: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_pending_tick_seconds: 60,
            max_pending_operations: 1000,
        }
    }
}

/// Desync debugging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DesyncConfig {
    /// What to trace; fixed for the entity's lifetime
    pub mode: DesyncDebugMode,
    /// How long trace entries are kept (ms)
    pub retention_ms: u64,
    /// How often old entries are pruned (ms)
    pub prune_interval_ms: u64,
}

impl DesyncConfig {
    pub fn retention(&self) -> Duration {
        Duration::from_millis(self.retention_ms)
    }
}

impl Default for DesyncConfig {
    fn default() -> Self {
        Self {
            mode: DesyncDebugMode::None,
            retention_ms: 5_000,
            prune_interval_ms: 1_000,
        }
    }
}

/// Snapshot persistence configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    /// Periodic snapshot interval (seconds); 0 disables the timer
    pub snapshot_interval_secs: u64,
    /// Bound on the final write during shutdown (ms)
    pub final_write_timeout_ms: u64,
    /// Schema version written with snapshots
    pub schema_version: u32,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            snapshot_interval_secs: 60,
            final_write_timeout_ms: 5_000,
            schema_version: 1,
        }
    }
}

/// Client session configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Refuse clients with stale resources instead of correcting them in place
    pub resource_corrections_mandatory: bool,
    /// Players allowed to submit development-only actions
    pub development_players: Vec<PlayerId>,
    /// Allow development-only actions from everyone
    pub development_features_for_all: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            resource_corrections_mandatory: true,
            development_players: vec![],
            development_features_for_all: false,
        }
    }
}
