//! The operation journal that owns a model.
//!
//! Operations are staged (applied to the live model) ahead of the checkpoint
//! and committed once they have been delivered. Retained operations can be
//! walked, and replayed from the stage snapshot to reproduce checksums of any
//! intermediate position.

use std::collections::VecDeque;
use std::ops::ControlFlow;

use tracing::{debug, trace, warn};

use crate::checksum::{checksum_bytes, compute_checksum, encode_canonical};
use crate::error::{JournalError, Result};
use crate::model::Model;
use crate::operation::{run_operation, OperationKind, OperationSummary, StagedOperation, StepRecord};
use crate::position::JournalPosition;
use crate::walk::JournalWalker;

/// Journal behavior switches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JournalOptions {
    /// Compute and retain a checksum after every step
    pub compute_step_checksums: bool,
}

/// Copy of the model taken by [`Journal::capture_stage_snapshot`].
#[derive(Debug, Clone)]
struct StageSnapshot<M> {
    position: JournalPosition,
    checksum: u32,
    model: M,
}

/// Append/replay log of ticks and actions applied to a model.
pub struct Journal<M: Model> {
    model: M,
    options: JournalOptions,
    checkpoint: JournalPosition,
    staged: JournalPosition,
    operations: VecDeque<StagedOperation<M::Action>>,
    stage_snapshot: Option<StageSnapshot<M>>,
    scratch: Vec<u8>,
}

impl<M: Model> Journal<M> {
    /// Set up a journal whose cursor starts at the model's current tick.
    pub fn setup(model: M, options: JournalOptions) -> Result<Self> {
        let position = JournalPosition::start_of_tick(model.timeline().current_tick);
        Self::setup_at(model, position, options)
    }

    /// Set up a journal at an explicit initial position.
    pub fn setup_at(model: M, initial: JournalPosition, options: JournalOptions) -> Result<Self> {
        let timeline = model.timeline();
        if timeline.ticks_per_second == 0 {
            return Err(JournalError::InvalidTimeline(
                "ticks_per_second must be positive".to_string(),
            ));
        }
        if initial.tick != timeline.current_tick || !initial.is_operation_boundary() {
            return Err(JournalError::InvalidTimeline(format!(
                "initial position {initial} does not match model tick {}",
                timeline.current_tick
            )));
        }

        debug!(position = %initial, ?options, "Journal set up");

        Ok(Self {
            model,
            options,
            checkpoint: initial,
            staged: initial,
            operations: VecDeque::new(),
            stage_snapshot: None,
            scratch: Vec::new(),
        })
    }

    /// The live model.
    pub fn model(&self) -> &M {
        &self.model
    }

    /// Mutable access that bypasses the journal.
    ///
    /// Changes made here are invisible to replay; [`Journal::verify_stage_snapshot`]
    /// reports them as external mutations.
    pub fn model_mut_unchecked(&mut self) -> &mut M {
        &mut self.model
    }

    pub fn options(&self) -> JournalOptions {
        self.options
    }

    /// Last committed position.
    pub fn checkpoint_position(&self) -> JournalPosition {
        self.checkpoint
    }

    /// Current cursor.
    pub fn staged_position(&self) -> JournalPosition {
        self.staged
    }

    /// Oldest position that can still be walked.
    pub fn oldest_retained_position(&self) -> JournalPosition {
        self.operations
            .front()
            .map(|op| op.start)
            .unwrap_or(self.staged)
    }

    /// Number of operations staged after the checkpoint.
    pub fn pending_operation_count(&self) -> usize {
        self.operations
            .iter()
            .filter(|op| op.start >= self.checkpoint)
            .count()
    }

    /// Apply an action and advance the cursor.
    pub fn stage_action(&mut self, action: M::Action) -> Result<OperationSummary> {
        self.stage(OperationKind::Action(action))
    }

    /// Apply one tick and advance the cursor.
    pub fn stage_tick(&mut self) -> Result<OperationSummary> {
        self.stage(OperationKind::Tick)
    }

    fn stage(&mut self, kind: OperationKind<M::Action>) -> Result<OperationSummary> {
        let start = self.staged;
        let compute = self.options.compute_step_checksums;
        let scratch = &mut self.scratch;
        let mut steps = Vec::new();

        let end = run_operation(&mut self.model, &kind, start, |model, step| {
            let checksum = if compute {
                Some(compute_checksum(model, scratch)?)
            } else {
                None
            };
            steps.push(StepRecord {
                before: step.before,
                after: step.after,
                checksum,
            });
            Ok(ControlFlow::Continue(()))
        })?;

        let operation = StagedOperation {
            kind,
            start,
            end,
            steps,
        };
        let summary = operation.summary();
        trace!(start = %start, end = %end, steps = summary.step_count, tick = summary.is_tick, "Staged operation");

        self.staged = end;
        self.operations.push_back(operation);
        Ok(summary)
    }

    /// Execute an action against a throwaway copy of the model.
    pub fn dry_run_action(&self, action: &M::Action) -> Result<()> {
        let mut copy = self.model.clone();
        run_operation(
            &mut copy,
            &OperationKind::Action(action.clone()),
            self.staged,
            |_, _| Ok(ControlFlow::Continue(())),
        )?;
        Ok(())
    }

    /// Checksum of the live model.
    pub fn compute_checksum(&mut self) -> Result<u32> {
        compute_checksum(&self.model, &mut self.scratch)
    }

    /// Canonical bytes and checksum of the live model.
    pub fn checksum_snapshot(&mut self) -> Result<(u32, Vec<u8>)> {
        encode_canonical(&self.model, &mut self.scratch)?;
        Ok((checksum_bytes(&self.scratch), self.scratch.clone()))
    }

    /// Checksum of the model state as of `position`.
    ///
    /// Served from the live model, from a retained per-step checksum, or by
    /// replaying retained operations onto the stage snapshot.
    pub fn force_compute_checksum(&mut self, position: JournalPosition) -> Result<u32> {
        if position > self.staged {
            return Err(JournalError::PositionBeyondStaged {
                requested: position,
                staged: self.staged,
            });
        }
        if position == self.staged {
            return self.compute_checksum();
        }

        let recorded = self
            .operations
            .iter()
            .flat_map(|op| op.steps.iter())
            .find(|step| step.after == position)
            .and_then(|step| step.checksum);
        if let Some(checksum) = recorded {
            return Ok(checksum);
        }

        match &self.stage_snapshot {
            Some(snapshot) if snapshot.position == position => Ok(snapshot.checksum),
            Some(snapshot) if snapshot.position < position => {
                match replay_from(snapshot, &self.operations, Some(position))? {
                    Some(model) => compute_checksum(&model, &mut self.scratch),
                    None => Err(JournalError::PositionNotRetained {
                        requested: position,
                        oldest: snapshot.position,
                    }),
                }
            }
            _ => Err(JournalError::PositionNotRetained {
                requested: position,
                oldest: self.oldest_retained_position(),
            }),
        }
    }

    /// Take a copy of the live model for replay and consistency checks.
    pub fn capture_stage_snapshot(&mut self) -> Result<u32> {
        let checksum = self.compute_checksum()?;
        self.stage_snapshot = Some(StageSnapshot {
            position: self.staged,
            checksum,
            model: self.model.clone(),
        });
        trace!(position = %self.staged, checksum, "Captured stage snapshot");
        Ok(checksum)
    }

    /// Position of the captured stage snapshot.
    pub fn stage_snapshot_position(&self) -> Option<JournalPosition> {
        self.stage_snapshot.as_ref().map(|s| s.position)
    }

    /// Check that replaying from the stage snapshot reproduces the live model.
    pub fn verify_stage_snapshot(&mut self) -> Result<()> {
        let snapshot = self
            .stage_snapshot
            .as_ref()
            .ok_or(JournalError::NoStageSnapshot)?;

        let expected = match replay_from(snapshot, &self.operations, None)? {
            Some(replayed) => compute_checksum(&replayed, &mut self.scratch)?,
            None => snapshot.checksum,
        };
        let actual = compute_checksum(&self.model, &mut self.scratch)?;

        if expected != actual {
            warn!(position = %self.staged, expected, actual, "Model diverged from its journal");
            return Err(JournalError::ExternalMutation {
                position: self.staged,
                expected,
                actual,
            });
        }
        Ok(())
    }

    /// Restore the live model to the stage snapshot and drop later operations.
    pub fn rollback_to_snapshot(&mut self) -> Result<JournalPosition> {
        let snapshot = self
            .stage_snapshot
            .as_ref()
            .ok_or(JournalError::NoStageSnapshot)?;
        if snapshot.position < self.checkpoint {
            return Err(JournalError::RollbackBeforeCheckpoint {
                snapshot: snapshot.position,
                checkpoint: self.checkpoint,
            });
        }

        let position = snapshot.position;
        self.model = snapshot.model.clone();
        self.staged = position;
        self.operations.retain(|op| op.end <= position);
        debug!(position = %position, "Rolled back to stage snapshot");
        Ok(position)
    }

    /// Advance the checkpoint to `position`.
    ///
    /// Operations that end at or before both the checkpoint and the stage
    /// snapshot are discarded.
    pub fn commit(&mut self, position: JournalPosition) -> Result<()> {
        if position > self.staged {
            return Err(JournalError::CommitBeyondStaged {
                requested: position,
                staged: self.staged,
            });
        }
        if position < self.checkpoint {
            return Err(JournalError::CommitBeforeCheckpoint {
                requested: position,
                checkpoint: self.checkpoint,
            });
        }
        let on_boundary = position == self.staged
            || position == self.checkpoint
            || self.operations.iter().any(|op| op.end == position);
        if !on_boundary {
            return Err(JournalError::CommitNotOnBoundary(position));
        }

        self.checkpoint = position;

        let discard_before = match &self.stage_snapshot {
            Some(snapshot) => snapshot.position.min(position),
            None => position,
        };
        while self
            .operations
            .front()
            .is_some_and(|op| op.end <= discard_before)
        {
            self.operations.pop_front();
        }

        trace!(checkpoint = %position, retained = self.operations.len(), "Committed");
        Ok(())
    }

    /// Walk retained operations from `from` to the staged position.
    pub fn walk(&self, from: JournalPosition) -> Result<JournalWalker<'_, M::Action>> {
        if from > self.staged {
            return Err(JournalError::PositionBeyondStaged {
                requested: from,
                staged: self.staged,
            });
        }
        let oldest = self.oldest_retained_position();
        if from < oldest {
            return Err(JournalError::PositionNotRetained {
                requested: from,
                oldest,
            });
        }
        Ok(JournalWalker::new(self.operations.iter(), from))
    }

    /// Consume the journal, returning the live model.
    pub fn into_model(self) -> M {
        self.model
    }
}

/// Replay retained operations on a copy of the snapshot model.
///
/// With `stop_at`, stops at that exact step boundary and returns `None` if it
/// is never reached. Without it, replays everything after the snapshot and
/// returns `None` if nothing needed replaying.
fn replay_from<M: Model>(
    snapshot: &StageSnapshot<M>,
    operations: &VecDeque<StagedOperation<M::Action>>,
    stop_at: Option<JournalPosition>,
) -> Result<Option<M>> {
    let mut replay = operations
        .iter()
        .filter(|op| op.start >= snapshot.position)
        .peekable();
    if replay.peek().is_none() {
        return Ok(None);
    }

    let mut model = snapshot.model.clone();
    for op in replay {
        let mut reached = false;
        run_operation(&mut model, &op.kind, op.start, |_, step| {
            if Some(step.after) == stop_at {
                reached = true;
                Ok(ControlFlow::Break(()))
            } else {
                Ok(ControlFlow::Continue(()))
            }
        })?;
        if reached {
            return Ok(Some(model));
        }
        if stop_at.is_some_and(|target| op.end > target) {
            return Ok(None);
        }
    }

    Ok(if stop_at.is_some() { None } else { Some(model) })
}
