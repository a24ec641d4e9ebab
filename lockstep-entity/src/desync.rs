//! Desync debugging.
//!
//! Keeps a short, pruned trace of canonical model snapshots so that a
//! client's checksum mismatch report can be compared against what the server
//! had at the same journal position.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::time::Duration;
use tracing::{debug, warn};

use lockstep_journal::{decode_canonical, JournalPosition};

use crate::types::SessionId;

/// What the entity records for desync debugging.
///
/// Fixed at construction; it only affects data collected from then on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DesyncDebugMode {
    /// No extra bookkeeping
    #[default]
    None,
    /// One snapshot per flush
    PerBatch,
    /// One snapshot per operation, plus per-step checksums
    PerOperation,
}

/// Snapshot of the model at `end`, covering positions in `[start, end)`.
#[derive(Debug, Clone)]
pub struct DesyncTraceEntry {
    pub created_at: DateTime<Utc>,
    pub start: JournalPosition,
    pub end: JournalPosition,
    /// Canonical encoding of the model at `end`
    pub snapshot: Vec<u8>,
}

impl DesyncTraceEntry {
    fn contains(&self, position: JournalPosition) -> bool {
        self.start <= position && position < self.end
    }
}

/// Client report of a checksum that did not match.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChecksumMismatchReport {
    pub session: SessionId,
    pub tick: u64,
    pub operation: u32,
    pub client_checksum: u32,
    /// Client's canonical encoding of its model at the mismatch
    pub client_snapshot: Vec<u8>,
}

impl ChecksumMismatchReport {
    pub fn position(&self) -> JournalPosition {
        JournalPosition::new(self.tick, self.operation, 0)
    }
}

/// One differing value between server and client state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateDifference {
    /// JSON-pointer-like path, e.g. `/players/alice/hp`
    pub path: String,
    pub server: Option<Value>,
    pub client: Option<Value>,
}

/// Outcome of looking up a mismatch report.
#[derive(Debug, Clone, PartialEq)]
pub enum DesyncDiagnosis {
    /// Tracing is off for this entity
    TracingDisabled,
    /// No retained entry covers the position
    PositionNotFound { position: JournalPosition },
    /// Client snapshot could not be decoded
    UnreadableClientSnapshot {
        start: JournalPosition,
        end: JournalPosition,
        reason: String,
    },
    /// Entry found and compared
    Compared {
        start: JournalPosition,
        end: JournalPosition,
        differences: Vec<StateDifference>,
    },
}

/// Retained snapshot trace of one entity.
#[derive(Debug)]
pub struct DesyncTracer {
    mode: DesyncDebugMode,
    retention: Duration,
    entries: VecDeque<DesyncTraceEntry>,
}

impl DesyncTracer {
    pub fn new(mode: DesyncDebugMode, retention: Duration) -> Self {
        Self {
            mode,
            retention,
            entries: VecDeque::new(),
        }
    }

    pub fn mode(&self) -> DesyncDebugMode {
        self.mode
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Append an entry. Ignored when tracing is off.
    pub fn record(
        &mut self,
        now: DateTime<Utc>,
        start: JournalPosition,
        end: JournalPosition,
        snapshot: Vec<u8>,
    ) {
        if self.mode == DesyncDebugMode::None {
            return;
        }
        self.entries.push_back(DesyncTraceEntry {
            created_at: now,
            start,
            end,
            snapshot,
        });
    }

    /// Drop entries older than the retention window. Returns how many went.
    pub fn prune(&mut self, now: DateTime<Utc>) -> usize {
        let retention = chrono::Duration::from_std(self.retention).unwrap_or(chrono::Duration::MAX);
        let before = self.entries.len();
        while self
            .entries
            .front()
            .is_some_and(|entry| now - entry.created_at > retention)
        {
            self.entries.pop_front();
        }
        let pruned = before - self.entries.len();
        if pruned > 0 {
            debug!(pruned, retained = self.entries.len(), "Pruned desync trace");
        }
        pruned
    }

    /// Find the entry covering the reported position and diff it against
    /// the client's snapshot.
    pub fn diagnose(&self, report: &ChecksumMismatchReport) -> DesyncDiagnosis {
        if self.mode == DesyncDebugMode::None {
            return DesyncDiagnosis::TracingDisabled;
        }
        let position = report.position();

        let mut found = None;
        for entry in &self.entries {
            if entry.start > position {
                break;
            }
            if entry.contains(position) {
                found = Some(entry);
                break;
            }
        }
        let Some(entry) = found else {
            warn!(session = %report.session, position = %position, "Could not match desync position in trace");
            return DesyncDiagnosis::PositionNotFound { position };
        };

        if entry.snapshot == report.client_snapshot {
            return DesyncDiagnosis::Compared {
                start: entry.start,
                end: entry.end,
                differences: vec![],
            };
        }

        let decoded = decode_canonical(&entry.snapshot)
            .and_then(|server| decode_canonical(&report.client_snapshot).map(|client| (server, client)));
        let (server, client) = match decoded {
            Ok(pair) => pair,
            Err(e) => {
                warn!(session = %report.session, position = %position, error = %e, "Unreadable desync snapshot");
                return DesyncDiagnosis::UnreadableClientSnapshot {
                    start: entry.start,
                    end: entry.end,
                    reason: e.to_string(),
                };
            }
        };

        let mut differences = Vec::new();
        diff_values(String::new(), Some(&server), Some(&client), &mut differences);

        for difference in &differences {
            warn!(
                session = %report.session,
                position = %position,
                path = %difference.path,
                server = ?difference.server,
                client = ?difference.client,
                "Desync difference"
            );
        }

        DesyncDiagnosis::Compared {
            start: entry.start,
            end: entry.end,
            differences,
        }
    }
}

/// Collect leaf-level differences between two value trees.
fn diff_values(path: String, server: Option<&Value>, client: Option<&Value>, out: &mut Vec<StateDifference>) {
    match (server, client) {
        (Some(Value::Object(s)), Some(Value::Object(c))) => {
            let mut keys: Vec<&String> = s.keys().chain(c.keys()).collect();
            keys.sort();
            keys.dedup();
            for key in keys {
                diff_values(format!("{path}/{key}"), s.get(key), c.get(key), out);
            }
        }
        (Some(Value::Array(s)), Some(Value::Array(c))) => {
            for index in 0..s.len().max(c.len()) {
                diff_values(format!("{path}/{index}"), s.get(index), c.get(index), out);
            }
        }
        (s, c) if s == c => {}
        (s, c) => out.push(StateDifference {
            path: if path.is_empty() { "/".to_string() } else { path },
            server: s.cloned(),
            client: c.cloned(),
        }),
    }
}
