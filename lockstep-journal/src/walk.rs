//! Forward iteration over retained journal steps.

use std::collections::vec_deque;

use crate::operation::{OperationKind, StagedOperation};
use crate::position::JournalPosition;

/// One step yielded by [`JournalWalker`].
#[derive(Debug)]
pub struct WalkEntry<'a, A> {
    /// First step of a tick operation
    pub is_tick_first_step: bool,
    /// First step of an action operation
    pub is_action_first_step: bool,
    /// Payload of the action operation this step belongs to
    pub action: Option<&'a A>,
    pub position_before: JournalPosition,
    pub position_after: JournalPosition,
    /// Checksum after the step, only when per-step checksums are enabled
    pub checksum: Option<u32>,
}

/// Lazy, finite iterator from a start position to the staged position.
pub struct JournalWalker<'a, A> {
    operations: vec_deque::Iter<'a, StagedOperation<A>>,
    current: Option<(&'a StagedOperation<A>, usize)>,
    from: JournalPosition,
}

impl<'a, A> JournalWalker<'a, A> {
    pub(crate) fn new(operations: vec_deque::Iter<'a, StagedOperation<A>>, from: JournalPosition) -> Self {
        Self {
            operations,
            current: None,
            from,
        }
    }
}

impl<'a, A> Iterator for JournalWalker<'a, A> {
    type Item = WalkEntry<'a, A>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some((operation, index)) = self.current {
                if let Some(step) = operation.steps.get(index) {
                    let first = index == 0;
                    self.current = Some((operation, index + 1));
                    if step.before < self.from {
                        continue;
                    }
                    return Some(WalkEntry {
                        is_tick_first_step: first && operation.kind.is_tick(),
                        is_action_first_step: first && !operation.kind.is_tick(),
                        action: match &operation.kind {
                            OperationKind::Action(action) => Some(action),
                            OperationKind::Tick => None,
                        },
                        position_before: step.before,
                        position_after: step.after,
                        checksum: step.checksum,
                    });
                }
            }

            let operation = self.operations.next()?;
            self.current = Some((operation, 0));
        }
    }
}
