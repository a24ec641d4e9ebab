//! Journal integration tests
//!
//! Exercises staging, positions, checksums, replay, commit and walking
//! against a small ledger model with cascading actions.

use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{TimeZone, Utc};
use lockstep_journal::{
    compute_checksum, ActionError, Cascade, ExecuteFlags, Journal, JournalError, JournalOptions,
    JournalPosition, Model, ModelAction, ModelTimeline,
};
use serde::{Deserialize, Serialize};

// =============================================================================
// Test model
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Ledger {
    timeline: ModelTimeline,
    balances: BTreeMap<String, i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
enum LedgerAction {
    Deposit { who: String, amount: i64 },
    Withdraw { who: String, amount: i64 },
    /// Deposits 1 into `who` once per part, each as its own step
    Split { who: String, parts: u32 },
}

impl Model for Ledger {
    type Action = LedgerAction;

    fn timeline(&self) -> &ModelTimeline {
        &self.timeline
    }

    fn timeline_mut(&mut self) -> &mut ModelTimeline {
        &mut self.timeline
    }

    fn on_tick(&mut self, cascade: &mut Cascade<LedgerAction>) -> Result<(), ActionError> {
        if self.timeline.current_tick % 5 == 0 {
            cascade.push(LedgerAction::Deposit {
                who: "bank".to_string(),
                amount: 1,
            });
        }
        Ok(())
    }
}

impl ModelAction<Ledger> for LedgerAction {
    const FAMILY: &'static str = "ledger";

    fn execute_flags(&self) -> ExecuteFlags {
        ExecuteFlags::CLIENT_SYNCHRONIZED
    }

    fn execute(&self, model: &mut Ledger, cascade: &mut Cascade<Self>) -> Result<(), ActionError> {
        match self {
            LedgerAction::Deposit { who, amount } => {
                *model.balances.entry(who.clone()).or_default() += amount;
            }
            LedgerAction::Withdraw { who, amount } => {
                let balance = model.balances.entry(who.clone()).or_default();
                if *balance < *amount {
                    return Err(ActionError::new("insufficient funds"));
                }
                *balance -= amount;
            }
            LedgerAction::Split { who, parts } => {
                for _ in 0..*parts {
                    cascade.push(LedgerAction::Deposit {
                        who: who.clone(),
                        amount: 1,
                    });
                }
            }
        }
        Ok(())
    }
}

fn ledger() -> Ledger {
    Ledger {
        timeline: ModelTimeline::new(10, Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()),
        balances: BTreeMap::new(),
    }
}

fn deposit(who: &str, amount: i64) -> LedgerAction {
    LedgerAction::Deposit {
        who: who.to_string(),
        amount,
    }
}

fn journal() -> Journal<Ledger> {
    Journal::setup(ledger(), JournalOptions::default()).unwrap()
}

// =============================================================================
// Setup and positions
// =============================================================================

#[test]
fn test_setup_starts_at_model_tick() {
    let mut model = ledger();
    model.timeline.current_tick = 42;
    let journal = Journal::setup(model, JournalOptions::default()).unwrap();

    assert_eq!(journal.staged_position(), JournalPosition::start_of_tick(42));
    assert_eq!(journal.checkpoint_position(), JournalPosition::start_of_tick(42));
}

#[test]
fn test_setup_rejects_bad_timeline() {
    let mut model = ledger();
    model.timeline.ticks_per_second = 0;
    assert!(matches!(
        Journal::setup(model, JournalOptions::default()),
        Err(JournalError::InvalidTimeline(_))
    ));

    let result = Journal::setup_at(ledger(), JournalPosition::new(3, 0, 0), JournalOptions::default());
    assert!(matches!(result, Err(JournalError::InvalidTimeline(_))));
}

#[test]
fn test_action_and_tick_positions() {
    let mut journal = journal();

    let a = journal.stage_action(deposit("alice", 5)).unwrap();
    assert_eq!(a.start, JournalPosition::new(0, 0, 0));
    assert_eq!(a.end, JournalPosition::new(0, 1, 0));

    let b = journal.stage_action(deposit("bob", 5)).unwrap();
    assert_eq!(b.start, JournalPosition::new(0, 1, 0));
    assert_eq!(b.end, JournalPosition::new(0, 2, 0));

    let t = journal.stage_tick().unwrap();
    assert!(t.is_tick);
    assert_eq!(t.start, JournalPosition::new(0, 2, 0));
    assert_eq!(t.end, JournalPosition::start_of_tick(1));
    assert_eq!(journal.model().timeline.current_tick, 1);
    assert_eq!(journal.pending_operation_count(), 3);
}

#[test]
fn test_cascade_produces_steps() {
    let mut journal = journal();
    let summary = journal
        .stage_action(LedgerAction::Split {
            who: "carol".to_string(),
            parts: 3,
        })
        .unwrap();

    assert_eq!(summary.step_count, 4);
    assert_eq!(summary.end, JournalPosition::new(0, 1, 0));
    assert_eq!(journal.model().balances["carol"], 3);

    let befores: Vec<_> = journal
        .walk(JournalPosition::EPOCH)
        .unwrap()
        .map(|entry| (entry.position_before, entry.position_after))
        .collect();
    assert_eq!(
        befores,
        vec![
            (JournalPosition::new(0, 0, 0), JournalPosition::new(0, 0, 1)),
            (JournalPosition::new(0, 0, 1), JournalPosition::new(0, 0, 2)),
            (JournalPosition::new(0, 0, 2), JournalPosition::new(0, 0, 3)),
            (JournalPosition::new(0, 0, 3), JournalPosition::new(0, 1, 0)),
        ]
    );
}

#[test]
fn test_tick_cascade() {
    let mut journal = journal();
    for _ in 0..5 {
        journal.stage_tick().unwrap();
    }
    // Tick 4 -> 5 triggers a bank deposit as a second step.
    assert_eq!(journal.model().balances["bank"], 1);
    assert_eq!(journal.staged_position(), JournalPosition::start_of_tick(5));

    let last_tick_steps = journal
        .walk(JournalPosition::start_of_tick(4))
        .unwrap()
        .count();
    assert_eq!(last_tick_steps, 2);
}

#[test]
fn test_failed_action_is_reported() {
    let mut journal = journal();
    let err = journal
        .stage_action(LedgerAction::Withdraw {
            who: "alice".to_string(),
            amount: 10,
        })
        .unwrap_err();

    match err {
        JournalError::ActionFailed { position, source, .. } => {
            assert_eq!(position, JournalPosition::EPOCH);
            assert_eq!(source.reason, "insufficient funds");
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

// =============================================================================
// Checksums and determinism
// =============================================================================

#[test]
fn test_identical_histories_have_identical_checksums() {
    let script = |journal: &mut Journal<Ledger>| -> Vec<u32> {
        let mut checksums = Vec::new();
        for round in 0..12 {
            if round % 3 == 0 {
                journal.stage_action(deposit("alice", round)).unwrap();
            } else if round % 3 == 1 {
                journal
                    .stage_action(LedgerAction::Split {
                        who: "bob".to_string(),
                        parts: 2,
                    })
                    .unwrap();
            } else {
                journal.stage_tick().unwrap();
            }
            checksums.push(journal.force_compute_checksum(journal.staged_position()).unwrap());
        }
        checksums
    };

    let mut left = journal();
    let mut right = journal();
    assert_eq!(script(&mut left), script(&mut right));
    assert_eq!(left.model(), right.model());
}

#[test]
fn test_step_checksums_are_recorded() {
    let mut journal = Journal::setup(
        ledger(),
        JournalOptions {
            compute_step_checksums: true,
        },
    )
    .unwrap();
    journal
        .stage_action(LedgerAction::Split {
            who: "dave".to_string(),
            parts: 2,
        })
        .unwrap();

    let entries: Vec<_> = journal.walk(JournalPosition::EPOCH).unwrap().collect();
    assert_eq!(entries.len(), 3);
    assert!(entries.iter().all(|entry| entry.checksum.is_some()));

    let mid = entries[1].position_after;
    let recorded = entries[1].checksum.unwrap();
    let last = entries[2].checksum.unwrap();
    assert_eq!(journal.force_compute_checksum(mid).unwrap(), recorded);

    assert_eq!(journal.compute_checksum().unwrap(), last);
}

#[test]
fn test_replay_reproduces_historical_checksums() {
    let mut journal = journal();
    journal.capture_stage_snapshot().unwrap();

    let mut history = Vec::new();
    for i in 0..4 {
        journal.stage_action(deposit("erin", i + 1)).unwrap();
        journal.stage_tick().unwrap();
        let position = journal.staged_position();
        history.push((position, journal.compute_checksum().unwrap()));
    }

    for (position, checksum) in history {
        assert_eq!(journal.force_compute_checksum(position).unwrap(), checksum);
    }
}

#[test]
fn test_checksum_of_unretained_position_fails() {
    let mut journal = journal();
    journal.stage_action(deposit("frank", 1)).unwrap();
    journal.stage_action(deposit("frank", 1)).unwrap();

    let err = journal
        .force_compute_checksum(JournalPosition::new(0, 1, 0))
        .unwrap_err();
    assert!(matches!(err, JournalError::PositionNotRetained { .. }));

    let err = journal
        .force_compute_checksum(JournalPosition::start_of_tick(9))
        .unwrap_err();
    assert!(matches!(err, JournalError::PositionBeyondStaged { .. }));
}

#[derive(Serialize)]
struct Roster {
    #[serde(serialize_with = "lockstep_journal::sorted_set")]
    members: HashSet<String>,
    visits: HashMap<String, u32>,
}

fn roster<'a>(names: impl Iterator<Item = &'a String>) -> Roster {
    let mut roster = Roster {
        members: HashSet::new(),
        visits: HashMap::new(),
    };
    for name in names {
        roster.members.insert(name.clone());
        roster.visits.insert(name.clone(), name.len() as u32);
    }
    roster
}

#[test]
fn test_equal_sets_with_different_histories_share_a_checksum() {
    let names: Vec<String> = (0..16).map(|i| format!("player-{i}")).collect();
    let forward = roster(names.iter());
    let backward = roster(names.iter().rev());

    let mut scratch = Vec::new();
    assert_eq!(
        compute_checksum(&forward, &mut scratch).unwrap(),
        compute_checksum(&backward, &mut scratch).unwrap()
    );

    let fewer = roster(names.iter().skip(1));
    assert_ne!(
        compute_checksum(&forward, &mut scratch).unwrap(),
        compute_checksum(&fewer, &mut scratch).unwrap()
    );
}

#[test]
fn test_composite_map_keys_are_checksummed() {
    let cells: Vec<((u32, u32), i32)> = (0..8)
        .flat_map(|x| (0..8).map(move |y| ((x, y), (x * 8 + y) as i32)))
        .collect();

    let ordered: BTreeMap<(u32, u32), i32> = cells.iter().copied().collect();
    let forward: HashMap<(u32, u32), i32> = cells.iter().copied().collect();
    let backward: HashMap<(u32, u32), i32> = cells.iter().rev().copied().collect();

    let mut scratch = Vec::new();
    let expected = compute_checksum(&ordered, &mut scratch).unwrap();
    assert_eq!(compute_checksum(&forward, &mut scratch).unwrap(), expected);
    assert_eq!(compute_checksum(&backward, &mut scratch).unwrap(), expected);

    let mut changed = ordered.clone();
    changed.insert((3, 4), -1);
    assert_ne!(compute_checksum(&changed, &mut scratch).unwrap(), expected);
}

// =============================================================================
// Snapshots, dry run and rollback
// =============================================================================

#[test]
fn test_stage_snapshot_detects_external_mutation() {
    let mut journal = journal();
    journal.capture_stage_snapshot().unwrap();
    journal.stage_action(deposit("gina", 3)).unwrap();
    journal.verify_stage_snapshot().unwrap();

    journal
        .model_mut_unchecked()
        .balances
        .insert("gina".to_string(), 1_000);

    assert!(matches!(
        journal.verify_stage_snapshot(),
        Err(JournalError::ExternalMutation { .. })
    ));
}

#[test]
fn test_verify_without_snapshot_fails() {
    let mut journal = journal();
    assert!(matches!(
        journal.verify_stage_snapshot(),
        Err(JournalError::NoStageSnapshot)
    ));
}

#[test]
fn test_dry_run_leaves_model_untouched() {
    let mut journal = journal();
    journal.stage_action(deposit("hank", 5)).unwrap();
    let before = journal.model().clone();

    journal
        .dry_run_action(&LedgerAction::Withdraw {
            who: "hank".to_string(),
            amount: 5,
        })
        .unwrap();
    assert!(journal
        .dry_run_action(&LedgerAction::Withdraw {
            who: "hank".to_string(),
            amount: 6,
        })
        .is_err());

    assert_eq!(journal.model(), &before);
    assert_eq!(journal.staged_position(), JournalPosition::new(0, 1, 0));
}

#[test]
fn test_rollback_to_snapshot() {
    let mut journal = journal();
    journal.stage_action(deposit("ivy", 1)).unwrap();
    journal.capture_stage_snapshot().unwrap();
    let snapshot_model = journal.model().clone();

    journal.stage_action(deposit("ivy", 10)).unwrap();
    journal.stage_tick().unwrap();

    let position = journal.rollback_to_snapshot().unwrap();
    assert_eq!(position, JournalPosition::new(0, 1, 0));
    assert_eq!(journal.staged_position(), position);
    assert_eq!(journal.model(), &snapshot_model);
    assert_eq!(journal.walk(JournalPosition::EPOCH).unwrap().count(), 1);
}

#[test]
fn test_rollback_cannot_undo_commits() {
    let mut journal = journal();
    journal.capture_stage_snapshot().unwrap();
    journal.stage_action(deposit("jack", 1)).unwrap();
    journal.commit(journal.staged_position()).unwrap();

    assert!(matches!(
        journal.rollback_to_snapshot(),
        Err(JournalError::RollbackBeforeCheckpoint { .. })
    ));
}

// =============================================================================
// Commit
// =============================================================================

#[test]
fn test_commit_bounds() {
    let mut journal = journal();
    journal.stage_action(deposit("kim", 1)).unwrap();
    journal.stage_action(deposit("kim", 1)).unwrap();

    assert!(matches!(
        journal.commit(JournalPosition::start_of_tick(1)),
        Err(JournalError::CommitBeyondStaged { .. })
    ));
    assert!(matches!(
        journal.commit(JournalPosition::new(0, 0, 1)),
        Err(JournalError::CommitNotOnBoundary(_))
    ));

    journal.commit(JournalPosition::new(0, 1, 0)).unwrap();
    assert!(matches!(
        journal.commit(JournalPosition::EPOCH),
        Err(JournalError::CommitBeforeCheckpoint { .. })
    ));
}

#[test]
fn test_checkpoint_is_monotonic_and_bounded() {
    let mut journal = journal();
    let mut ends = Vec::new();
    for i in 0..10 {
        let summary = if i % 2 == 0 {
            journal.stage_tick().unwrap()
        } else {
            journal.stage_action(deposit("lee", 1)).unwrap()
        };
        ends.push(summary.end);
    }

    let mut last = journal.checkpoint_position();
    for (i, end) in ends.iter().enumerate() {
        if i % 3 == 1 {
            continue;
        }
        let attempt = journal.commit(*end);
        assert!(attempt.is_ok() || *end < last);
        assert!(journal.checkpoint_position() >= last);
        assert!(journal.checkpoint_position() <= journal.staged_position());
        last = journal.checkpoint_position();
    }
    assert_eq!(last, *ends.last().unwrap());
    assert_eq!(journal.pending_operation_count(), 0);
}

#[test]
fn test_commit_discards_history() {
    let mut journal = journal();
    journal.stage_action(deposit("mia", 1)).unwrap();
    journal.stage_tick().unwrap();
    journal.commit(journal.staged_position()).unwrap();

    assert!(matches!(
        journal.walk(JournalPosition::EPOCH),
        Err(JournalError::PositionNotRetained { .. })
    ));
    assert_eq!(journal.walk(journal.staged_position()).unwrap().count(), 0);
}

#[test]
fn test_commit_keeps_history_back_to_snapshot() {
    let mut journal = journal();
    journal.capture_stage_snapshot().unwrap();
    journal.stage_action(deposit("ned", 1)).unwrap();
    let mid = journal.staged_position();
    let mid_checksum = journal.compute_checksum().unwrap();
    journal.stage_action(deposit("ned", 1)).unwrap();
    journal.commit(journal.staged_position()).unwrap();

    assert_eq!(journal.force_compute_checksum(mid).unwrap(), mid_checksum);
}

// =============================================================================
// Walking
// =============================================================================

#[test]
fn test_walk_flags_and_payloads() {
    let mut journal = journal();
    journal.stage_action(deposit("olga", 2)).unwrap();
    journal.stage_tick().unwrap();
    journal
        .stage_action(LedgerAction::Split {
            who: "olga".to_string(),
            parts: 1,
        })
        .unwrap();

    let entries: Vec<_> = journal.walk(JournalPosition::EPOCH).unwrap().collect();
    assert_eq!(entries.len(), 4);

    assert!(entries[0].is_action_first_step);
    assert_eq!(entries[0].action, Some(&deposit("olga", 2)));
    assert!(entries[1].is_tick_first_step);
    assert!(entries[1].action.is_none());
    assert!(entries[2].is_action_first_step);
    assert!(!entries[3].is_action_first_step);
    assert!(!entries[3].is_tick_first_step);
    assert!(entries.iter().all(|e| e.checksum.is_none()));
}

#[test]
fn test_walk_from_middle() {
    let mut journal = journal();
    journal.stage_action(deposit("pat", 1)).unwrap();
    let from = journal.staged_position();
    journal.stage_action(deposit("pat", 2)).unwrap();
    journal.stage_action(deposit("pat", 3)).unwrap();

    let amounts: Vec<_> = journal
        .walk(from)
        .unwrap()
        .filter_map(|e| match e.action {
            Some(LedgerAction::Deposit { amount, .. }) => Some(*amount),
            _ => None,
        })
        .collect();
    assert_eq!(amounts, vec![2, 3]);
}
