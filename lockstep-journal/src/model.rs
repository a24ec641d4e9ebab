//! Traits a replicated model and its actions implement.
//!
//! A model is mutated only by the journal, one step at a time. Every step is
//! either a tick advance, an action execution, or a cascaded follow-up action
//! that an earlier step of the same operation pushed into the [`Cascade`].

use chrono::{DateTime, Duration, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::ops::BitOr;

const NANOS_PER_SECOND: u128 = 1_000_000_000;

/// Tick bookkeeping embedded in every model.
///
/// Establishes the mapping between simulated ticks and wall-clock time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelTimeline {
    /// Number of ticks applied so far
    pub current_tick: u64,
    /// Fixed tick cadence
    pub ticks_per_second: u32,
    /// When the model was created
    pub created_at: DateTime<Utc>,
    /// Wall-clock time of tick zero
    pub time_at_first_tick: DateTime<Utc>,
}

impl ModelTimeline {
    /// Create a timeline starting at `now`.
    pub fn new(ticks_per_second: u32, now: DateTime<Utc>) -> Self {
        Self {
            current_tick: 0,
            ticks_per_second,
            created_at: now,
            time_at_first_tick: now,
        }
    }

    /// Wall-clock time at which `tick` begins.
    ///
    /// Rounded up to the nanosecond so that `tick_at(time_of_tick(t)) == t`.
    pub fn time_of_tick(&self, tick: u64) -> DateTime<Utc> {
        let tps = u128::from(self.ticks_per_second.max(1));
        let nanos = (u128::from(tick) * NANOS_PER_SECOND).div_ceil(tps);
        let nanos = i64::try_from(nanos).unwrap_or(i64::MAX);
        self.time_at_first_tick + Duration::nanoseconds(nanos)
    }

    /// Number of whole ticks elapsed by wall-clock time `now`.
    pub fn tick_at(&self, now: DateTime<Utc>) -> u64 {
        if now <= self.time_at_first_tick {
            return 0;
        }
        let elapsed = (now - self.time_at_first_tick)
            .num_nanoseconds()
            .unwrap_or(i64::MAX);
        let elapsed = u128::try_from(elapsed).unwrap_or(0);
        let ticks = elapsed * u128::from(self.ticks_per_second) / NANOS_PER_SECOND;
        u64::try_from(ticks).unwrap_or(u64::MAX)
    }
}

/// The replicated state of one entity.
///
/// Implementations must be deterministic: the same sequence of ticks and
/// actions applied to equal models yields equal models. Fields that only
/// exist at runtime must be marked `#[serde(skip)]` so they never reach
/// checksums or snapshots.
///
/// Map entries are reordered before checksumming, so any map type and any
/// serializable key type is fine. Sequences keep their order. A `HashSet`
/// field must either become a `BTreeSet` or serialize through
/// [`sorted_set`](crate::sorted_set), otherwise equal models can disagree on
/// their checksum.
pub trait Model: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    /// The action type this model accepts.
    type Action: ModelAction<Self>;

    /// Tick bookkeeping.
    fn timeline(&self) -> &ModelTimeline;

    /// Mutable tick bookkeeping.
    fn timeline_mut(&mut self) -> &mut ModelTimeline;

    /// Game logic run after `current_tick` has been advanced.
    fn on_tick(&mut self, _cascade: &mut Cascade<Self::Action>) -> Result<(), ActionError> {
        Ok(())
    }
}

/// A typed command that mutates a model.
pub trait ModelAction<M>:
    Clone + fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// Name of the action family; clients must declare it on submission.
    const FAMILY: &'static str;

    /// Flags governing who may submit this action.
    fn execute_flags(&self) -> ExecuteFlags {
        ExecuteFlags::NONE
    }

    /// Apply the action to the model.
    fn execute(&self, model: &mut M, cascade: &mut Cascade<Self>) -> Result<(), ActionError>;
}

/// Submission flags of an action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct ExecuteFlags(u8);

impl ExecuteFlags {
    /// Server-issued only.
    pub const NONE: ExecuteFlags = ExecuteFlags(0);
    /// Clients may submit the action and replay it locally.
    pub const CLIENT_SYNCHRONIZED: ExecuteFlags = ExecuteFlags(0b01);
    /// Only accepted from players with development features enabled.
    pub const DEVELOPMENT_ONLY: ExecuteFlags = ExecuteFlags(0b10);

    /// Whether all bits of `other` are set.
    pub const fn contains(self, other: ExecuteFlags) -> bool {
        self.0 & other.0 == other.0
    }

    /// Raw bits.
    pub const fn bits(self) -> u8 {
        self.0
    }
}

impl BitOr for ExecuteFlags {
    type Output = ExecuteFlags;

    fn bitor(self, rhs: Self) -> Self::Output {
        ExecuteFlags(self.0 | rhs.0)
    }
}

/// Follow-up actions produced while applying a step.
///
/// Each queued action becomes one more step of the current operation. They
/// are applied in FIFO order until the cascade is empty.
#[derive(Debug)]
pub struct Cascade<A> {
    queue: VecDeque<A>,
}

impl<A> Cascade<A> {
    pub(crate) fn new() -> Self {
        Self {
            queue: VecDeque::new(),
        }
    }

    /// Queue a follow-up step.
    pub fn push(&mut self, action: A) {
        self.queue.push_back(action);
    }

    /// Number of queued follow-ups.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Whether nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub(crate) fn pop(&mut self) -> Option<A> {
        self.queue.pop_front()
    }
}

/// Error returned by a failing tick or action.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{reason}")]
pub struct ActionError {
    /// Human readable reason
    pub reason: String,
}

impl ActionError {
    /// Create an error with a reason.
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}
