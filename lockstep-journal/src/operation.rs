//! Staged operations and the step-wise runner shared by staging and replay.

use std::ops::ControlFlow;

use crate::error::{JournalError, Result};
use crate::model::{Cascade, Model, ModelAction};
use crate::position::JournalPosition;

/// What an operation does.
#[derive(Debug, Clone, PartialEq)]
pub enum OperationKind<A> {
    /// Advance simulated time by one tick
    Tick,
    /// Apply an action
    Action(A),
}

impl<A> OperationKind<A> {
    /// Whether this is a tick.
    pub fn is_tick(&self) -> bool {
        matches!(self, OperationKind::Tick)
    }

    /// Action payload, if any.
    pub fn action(&self) -> Option<&A> {
        match self {
            OperationKind::Tick => None,
            OperationKind::Action(action) => Some(action),
        }
    }
}

/// One applied step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepRecord {
    /// Cursor before the step
    pub before: JournalPosition,
    /// Cursor after the step
    pub after: JournalPosition,
    /// Model checksum after the step, when per-step checksums are enabled
    pub checksum: Option<u32>,
}

/// An operation retained in the journal.
#[derive(Debug, Clone)]
pub struct StagedOperation<A> {
    pub kind: OperationKind<A>,
    pub start: JournalPosition,
    pub end: JournalPosition,
    pub steps: Vec<StepRecord>,
}

/// Summary returned when an operation is staged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OperationSummary {
    pub start: JournalPosition,
    pub end: JournalPosition,
    pub step_count: usize,
    pub is_tick: bool,
}

impl<A> StagedOperation<A> {
    pub(crate) fn summary(&self) -> OperationSummary {
        OperationSummary {
            start: self.start,
            end: self.end,
            step_count: self.steps.len(),
            is_tick: self.kind.is_tick(),
        }
    }
}

/// Boundary reported after each step.
#[derive(Debug, Clone, Copy)]
pub(crate) struct StepBoundary {
    pub before: JournalPosition,
    pub after: JournalPosition,
}

/// Apply one operation to `model` step by step.
///
/// `on_step` runs after every step; returning `Break` stops the operation at
/// that boundary. Returns the position reached.
pub(crate) fn run_operation<M, F>(
    model: &mut M,
    kind: &OperationKind<M::Action>,
    start: JournalPosition,
    mut on_step: F,
) -> Result<JournalPosition>
where
    M: Model,
    F: FnMut(&M, StepBoundary) -> Result<ControlFlow<()>>,
{
    let mut cascade = Cascade::new();

    let end = match kind {
        OperationKind::Tick => {
            let tick = model.timeline().current_tick;
            model.timeline_mut().current_tick = tick + 1;
            model
                .on_tick(&mut cascade)
                .map_err(|source| JournalError::TickFailed { tick, source })?;
            start.next_tick()
        }
        OperationKind::Action(action) => {
            action
                .execute(model, &mut cascade)
                .map_err(|source| JournalError::ActionFailed {
                    action: format!("{action:?}"),
                    position: start,
                    source,
                })?;
            start.next_operation()
        }
    };

    let mut position = start;
    loop {
        let after = if cascade.is_empty() {
            end
        } else {
            position.next_step()
        };
        if on_step(model, StepBoundary { before: position, after })?.is_break() {
            return Ok(after);
        }
        position = after;

        let Some(follow_up) = cascade.pop() else {
            return Ok(end);
        };
        follow_up
            .execute(model, &mut cascade)
            .map_err(|source| JournalError::ActionFailed {
                action: format!("{follow_up:?}"),
                position,
                source,
            })?;
    }
}
