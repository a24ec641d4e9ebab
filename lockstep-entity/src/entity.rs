//! The multiplayer entity.
//!
//! Owns the journal of one replicated model and drives it from ticks, server
//! actions and client batches. All methods assume a single caller at a time;
//! [`crate::actor`] provides that by running the entity on its own task.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};

use lockstep_journal::{ExecuteFlags, Journal, JournalOptions, JournalPosition, Model, ModelAction};

use crate::actor::EntityMessage;
use crate::clock::{Clock, SystemClock};
use crate::config::EntityConfig;
use crate::desync::{ChecksumMismatchReport, DesyncDebugMode, DesyncDiagnosis, DesyncTracer};
use crate::error::{EntityError, Result};
use crate::lifecycle::{EntityPhase, Lifecycle};
use crate::logic::{AssociationEdit, EntityContext, EntityLogic, HookEffects};
use crate::persistence::{
    decode_snapshot, encode_snapshot, log_restore_failure, NoPersistence, PersistenceStore,
    SchemaMigrator,
};
use crate::resources::ResourceProvider;
use crate::scheduler::TickScheduler;
use crate::session::{
    encode_action, ActionEnvelope, BatchReport, ClientMessage, ClientPeerState, InitialState,
    PingTracePoint, SubscribeRequest, SubscribeResponse, TimelineUpdate,
};
use crate::types::{
    ActionRejection, AssociatedEntityRef, ClientSlot, EntityId, SessionId, SubscribeRefusal,
};

/// Collaborators injected into an entity.
pub struct EntityServices {
    pub store: Arc<dyn PersistenceStore>,
    pub resources: Arc<dyn ResourceProvider>,
    pub clock: Arc<dyn Clock>,
    /// Defaults to a migrator accepting only the configured schema version
    pub migrator: Option<SchemaMigrator>,
}

impl EntityServices {
    /// Ephemeral entity on the system clock.
    pub fn new(resources: Arc<dyn ResourceProvider>) -> Self {
        Self {
            store: Arc::new(NoPersistence),
            resources,
            clock: Arc::new(SystemClock),
            migrator: None,
        }
    }

    pub fn with_store(mut self, store: Arc<dyn PersistenceStore>) -> Self {
        self.store = store;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_migrator(mut self, migrator: SchemaMigrator) -> Self {
        self.migrator = Some(migrator);
        self
    }
}

/// Point-in-time view of an entity.
#[derive(Debug, Clone, Serialize)]
pub struct EntityStatus {
    pub id: EntityId,
    pub phase: EntityPhase,
    pub current_tick: Option<u64>,
    pub checkpoint: Option<JournalPosition>,
    pub staged: Option<JournalPosition>,
    pub sessions: Vec<SessionId>,
    pub associated: Vec<AssociatedEntityRef>,
    pub desync_trace_len: usize,
    pub active_info: Option<serde_json::Value>,
}

/// One replicated model with its sessions, timers and persistence.
pub struct Entity<M: Model, L: EntityLogic<M>> {
    id: EntityId,
    config: EntityConfig,
    logic: L,
    store: Arc<dyn PersistenceStore>,
    resources: Arc<dyn ResourceProvider>,
    clock: Arc<dyn Clock>,
    migrator: SchemaMigrator,
    lifecycle: Lifecycle,
    journal: Option<Journal<M>>,
    peers: BTreeMap<SessionId, ClientPeerState>,
    associated: BTreeMap<ClientSlot, AssociatedEntityRef>,
    scheduler: TickScheduler,
    tracer: DesyncTracer,
    updating_ticks: bool,
    mailbox: Option<mpsc::WeakSender<EntityMessage<M, L>>>,
}

impl<M: Model, L: EntityLogic<M>> Entity<M, L> {
    pub fn new(id: EntityId, config: EntityConfig, logic: L, services: EntityServices) -> Self {
        let migrator = services
            .migrator
            .unwrap_or_else(|| SchemaMigrator::new(config.persistence.schema_version));
        if migrator.current_version() != config.persistence.schema_version {
            warn!(
                entity_id = %id,
                migrator = migrator.current_version(),
                configured = config.persistence.schema_version,
                "Schema migrator and configured schema version disagree"
            );
        }
        let scheduler = TickScheduler::new(config.tick_schedule.clone());
        let tracer = DesyncTracer::new(config.desync.mode, config.desync.retention());

        Self {
            id,
            config,
            logic,
            store: services.store,
            resources: services.resources,
            clock: services.clock,
            migrator,
            lifecycle: Lifecycle::new(),
            journal: None,
            peers: BTreeMap::new(),
            associated: BTreeMap::new(),
            scheduler,
            tracer,
            updating_ticks: false,
            mailbox: None,
        }
    }

    pub fn id(&self) -> &EntityId {
        &self.id
    }

    pub fn config(&self) -> &EntityConfig {
        &self.config
    }

    pub fn phase(&self) -> EntityPhase {
        self.lifecycle.phase()
    }

    pub fn model(&self) -> Option<&M> {
        self.journal.as_ref().map(|j| j.model())
    }

    pub fn checkpoint_position(&self) -> Option<JournalPosition> {
        self.journal.as_ref().map(|j| j.checkpoint_position())
    }

    pub fn staged_position(&self) -> Option<JournalPosition> {
        self.journal.as_ref().map(|j| j.staged_position())
    }

    pub fn connected_sessions(&self) -> Vec<SessionId> {
        self.peers.keys().copied().collect()
    }

    pub fn associated_entities(&self) -> Vec<AssociatedEntityRef> {
        self.associated.values().cloned().collect()
    }

    pub fn desync_trace_len(&self) -> usize {
        self.tracer.len()
    }

    pub(crate) fn attach_mailbox(&mut self, mailbox: mpsc::WeakSender<EntityMessage<M, L>>) {
        self.mailbox = Some(mailbox);
    }

    pub(crate) fn is_current_timer(&self, generation: u64) -> bool {
        self.scheduler.is_current(generation)
    }

    fn journal(&self) -> Result<&Journal<M>> {
        self.journal
            .as_ref()
            .ok_or(EntityError::NotRunning(self.lifecycle.phase()))
    }

    fn journal_mut(&mut self) -> Result<&mut Journal<M>> {
        let phase = self.lifecycle.phase();
        self.journal.as_mut().ok_or(EntityError::NotRunning(phase))
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Leave `Uninitialized`, restoring the model from storage if present.
    pub async fn start(&mut self) -> Result<()> {
        self.lifecycle.transition(EntityPhase::AwaitingSetup)?;

        let Some(payload) = self.store.try_read(&self.id).await? else {
            info!(entity_id = %self.id, "No snapshot stored, awaiting setup");
            return Ok(());
        };

        let mut model: M = match decode_snapshot(&payload, &self.migrator) {
            Ok(model) => model,
            Err(e) => {
                log_restore_failure(&self.id, &payload, &e);
                return Err(e.into());
            }
        };
        rebase_timeline(&mut model, self.clock.now());
        self.switch_to_model(model)?;
        info!(entity_id = %self.id, tick = ?self.model().map(|m| m.timeline().current_tick), "Entity restored");
        Ok(())
    }

    /// Set up a fresh model.
    pub async fn setup(&mut self, params: L::SetupParams) -> Result<()> {
        match self.lifecycle.phase() {
            EntityPhase::AwaitingSetup => {}
            EntityPhase::Running => {
                error!(entity_id = %self.id, "Setup requested for an entity that is already set up");
                return Err(EntityError::DuplicateSetup);
            }
            from => {
                return Err(EntityError::InvalidTransition {
                    from,
                    to: EntityPhase::Running,
                })
            }
        }

        let model = self
            .logic
            .set_up_model(&self.id, params, self.clock.now())
            .await?;
        self.switch_to_model(model)?;
        info!(entity_id = %self.id, "Entity set up");

        if let Err(e) = self.persist(false).await {
            warn!(entity_id = %self.id, error = %e, "Initial snapshot write failed");
        }
        Ok(())
    }

    fn switch_to_model(&mut self, model: M) -> Result<()> {
        let options = JournalOptions {
            compute_step_checksums: self.tracer.mode() == DesyncDebugMode::PerOperation,
        };
        let journal = Journal::setup(model, options)?;
        self.lifecycle.transition(EntityPhase::Running)?;
        self.logic.on_switched_to_model(journal.model());
        self.journal = Some(journal);

        let (_, effects) = self.run_hook(|logic, ctx| logic.on_entity_initialized(ctx))?;
        let actions = self.apply_effects(effects)?;
        self.drain_actions(actions)?;
        self.reschedule()
    }

    /// Stop timers, write a final snapshot within the configured bound and
    /// terminate.
    pub async fn shutdown(&mut self) -> Result<()> {
        if matches!(
            self.lifecycle.phase(),
            EntityPhase::ShuttingDown | EntityPhase::Terminated
        ) {
            return Ok(());
        }
        self.lifecycle.transition(EntityPhase::ShuttingDown)?;
        self.scheduler.cancel();

        if self.journal.is_some() {
            if let Err(e) = self.flush() {
                warn!(entity_id = %self.id, error = %e, "Final flush failed");
            }

            let bound = Duration::from_millis(self.config.persistence.final_write_timeout_ms);
            match tokio::time::timeout(bound, self.persist(true)).await {
                Ok(Ok(())) => debug!(entity_id = %self.id, "Final snapshot written"),
                Ok(Err(e)) => error!(entity_id = %self.id, error = %e, "Final snapshot write failed"),
                Err(_) => error!(
                    entity_id = %self.id,
                    timeout_ms = self.config.persistence.final_write_timeout_ms,
                    "Final snapshot write timed out"
                ),
            }
        }

        self.peers.clear();
        self.lifecycle.transition(EntityPhase::Terminated)?;
        info!(entity_id = %self.id, "Entity terminated");
        Ok(())
    }

    // =========================================================================
    // Hooks
    // =========================================================================

    fn run_hook<R, F>(&self, f: F) -> Result<(R, HookEffects<M::Action>)>
    where
        F: FnOnce(&L, &mut EntityContext<'_, M>) -> R,
    {
        let journal = self.journal()?;
        let mut effects = HookEffects::default();
        let mut ctx = EntityContext::new(
            &self.id,
            journal.model(),
            self.clock.now(),
            self.updating_ticks,
            &mut effects,
        );
        let result = f(&self.logic, &mut ctx);
        Ok((result, effects))
    }

    /// Apply association edits and client sends; return requested actions.
    fn apply_effects(&mut self, effects: HookEffects<M::Action>) -> Result<Vec<M::Action>> {
        if let Some(fatal) = effects.fatal {
            error!(entity_id = %self.id, error = %fatal, "Hook hit a fatal error");
            return Err(fatal);
        }

        for edit in effects.associations {
            match edit {
                AssociationEdit::Associate(slot, entity) => {
                    debug!(entity_id = %self.id, %slot, associated = %entity, "Associated entity");
                    self.associated
                        .insert(slot, AssociatedEntityRef { slot, entity });
                }
                AssociationEdit::Dissociate(slot) => {
                    if self.associated.remove(&slot).is_some() {
                        debug!(entity_id = %self.id, %slot, "Dissociated entity");
                    }
                }
            }
        }

        for (target, payload) in effects.outbound {
            match target {
                Some(session) => match self.peers.get(&session) {
                    Some(peer) => peer.send(ClientMessage::Envelope { payload }),
                    None => debug!(entity_id = %self.id, %session, "Envelope for unknown session dropped"),
                },
                None => {
                    for peer in self.peers.values() {
                        peer.send(ClientMessage::Envelope {
                            payload: payload.clone(),
                        });
                    }
                }
            }
        }

        Ok(effects.actions)
    }

    // =========================================================================
    // Operations
    // =========================================================================

    /// Record a per-operation desync trace entry.
    fn trace_operation(&mut self, start: JournalPosition, end: JournalPosition) -> Result<()> {
        if self.tracer.mode() != DesyncDebugMode::PerOperation {
            return Ok(());
        }
        let now = self.clock.now();
        let journal = self
            .journal
            .as_mut()
            .ok_or(EntityError::NotRunning(self.lifecycle.phase()))?;
        let (_, snapshot) = journal.checksum_snapshot()?;
        self.tracer.record(now, start, end, snapshot);
        Ok(())
    }

    /// Stage one action and run its hook; returns the actions it requested.
    fn apply_action(&mut self, action: M::Action) -> Result<Vec<M::Action>> {
        let summary = self.journal_mut()?.stage_action(action.clone())?;
        trace!(entity_id = %self.id, start = %summary.start, end = %summary.end, ?action, "Action staged");
        self.trace_operation(summary.start, summary.end)?;

        let (_, effects) = self.run_hook(|logic, ctx| logic.on_action_executed(ctx, &action))?;
        self.apply_effects(effects)
    }

    /// Run `initial` and everything the hooks request, depth-first.
    ///
    /// Actions requested while handling an action run before that action's
    /// later siblings.
    fn drain_actions(&mut self, initial: Vec<M::Action>) -> Result<()> {
        let mut frames: Vec<VecDeque<M::Action>> = vec![initial.into()];
        while let Some(frame) = frames.last_mut() {
            let Some(action) = frame.pop_front() else {
                frames.pop();
                continue;
            };
            let children = self.apply_action(action)?;
            if !children.is_empty() {
                frames.push(children.into());
            }
        }
        Ok(())
    }

    /// Run a server-issued action.
    ///
    /// With `run_pending_ticks_first`, ticks due by wall clock are applied
    /// first so the action lands on the correct tick.
    pub fn execute_action(&mut self, action: M::Action, run_pending_ticks_first: bool) -> Result<()> {
        self.lifecycle.ensure_running()?;
        if run_pending_ticks_first {
            self.update_ticks()?;
        }
        self.drain_actions(vec![action])
    }

    /// Outside any operation there is nothing pending, so the action runs
    /// immediately, after tick catch-up.
    pub fn execute_action_after_pending_actions(&mut self, action: M::Action) -> Result<()> {
        self.execute_action(action, true)
    }

    /// Apply every tick due by wall clock. Returns the number applied.
    pub fn update_ticks(&mut self) -> Result<u64> {
        if self.updating_ticks {
            error!(entity_id = %self.id, "Re-entrant tick update");
            return Err(EntityError::ReentrantTickUpdate);
        }
        self.updating_ticks = true;
        let result = self.run_pending_ticks();
        self.updating_ticks = false;
        result
    }

    fn run_pending_ticks(&mut self) -> Result<u64> {
        let now = self.clock.now();
        let timeline = self.journal()?.model().timeline();
        let current = timeline.current_tick;
        let pending = timeline.tick_at(now).saturating_sub(current);
        let limit = self
            .config
            .limits
            .max_pending_tick_seconds
            .saturating_mul(u64::from(timeline.ticks_per_second));

        if pending > limit {
            error!(entity_id = %self.id, current, pending, limit, "Too many pending ticks");
            return Err(EntityError::TooManyPendingTicks { pending, limit });
        }

        for _ in 0..pending {
            let summary = self.journal_mut()?.stage_tick()?;
            self.trace_operation(summary.start, summary.end)?;
            let tick = summary.end.tick;

            let (_, effects) = self.run_hook(|logic, ctx| logic.on_post_tick(ctx, tick))?;
            let actions = self.apply_effects(effects)?;
            self.drain_actions(actions)?;

            for peer in self.peers.values_mut() {
                peer.resolve_ping_markers(PingTracePoint::AfterTick, tick);
            }
        }

        if pending > 0 {
            trace!(entity_id = %self.id, from = current, to = current + pending, "Ticks updated");
        }
        Ok(pending)
    }

    /// Commit everything staged and send it to every session.
    ///
    /// Returns the update, or `None` if nothing was staged.
    pub fn flush(&mut self) -> Result<Option<TimelineUpdate>> {
        let now = self.clock.now();
        let limit = self.config.limits.max_pending_operations;
        let phase = self.lifecycle.phase();
        let journal = self.journal.as_mut().ok_or(EntityError::NotRunning(phase))?;

        let start = journal.checkpoint_position();
        let end = journal.staged_position();
        let pending = journal.pending_operation_count();

        if pending > limit {
            error!(entity_id = %self.id, pending, limit, "Too many pending operations");
            return Err(EntityError::TooManyPendingOperations { pending, limit });
        }
        if pending == 0 {
            for peer in self.peers.values_mut() {
                peer.resolve_ping_markers(PingTracePoint::AfterFlush, end.tick);
            }
            return Ok(None);
        }

        let mut operations = Vec::with_capacity(pending);
        let mut step_checksums = Vec::new();
        for entry in journal.walk(start)? {
            if entry.is_tick_first_step {
                operations.push(None);
            } else if entry.is_action_first_step {
                if let Some(action) = entry.action {
                    operations.push(Some(encode_action(action)?));
                }
            }
            if let Some(checksum) = entry.checksum {
                step_checksums.push(checksum);
            }
        }

        let final_checksum = if self.tracer.mode() == DesyncDebugMode::PerBatch {
            let (checksum, snapshot) = journal.checksum_snapshot()?;
            self.tracer.record(now, start, end, snapshot);
            checksum
        } else {
            match step_checksums.last() {
                Some(&checksum) => checksum,
                None => journal.force_compute_checksum(end)?,
            }
        };
        let step_checksums = journal
            .options()
            .compute_step_checksums
            .then_some(step_checksums);

        journal.commit(end)?;

        let update = TimelineUpdate {
            start,
            end,
            operations,
            final_checksum,
            step_checksums,
        };
        debug!(
            entity_id = %self.id,
            start = %start,
            end = %end,
            operations = update.operations.len(),
            checksum = final_checksum,
            sessions = self.peers.len(),
            "Flushed timeline"
        );

        for peer in self.peers.values_mut() {
            peer.send(ClientMessage::TimelineUpdate(update.clone()));
            peer.resolve_ping_markers(PingTracePoint::AfterFlush, end.tick);
        }
        Ok(Some(update))
    }

    // =========================================================================
    // Scheduling
    // =========================================================================

    fn reschedule(&mut self) -> Result<()> {
        let has_clients = !self.peers.is_empty();
        let now = self.clock.now();
        let phase = self.lifecycle.phase();
        let journal = self.journal.as_ref().ok_or(EntityError::NotRunning(phase))?;
        self.scheduler.arm(
            journal.model().timeline(),
            now,
            has_clients,
            self.mailbox.as_ref(),
            |generation| EntityMessage::TickTimer { generation },
        );
        Ok(())
    }

    fn reschedule_if_clients_changed(&mut self) -> Result<()> {
        if self.scheduler.needs_reschedule(!self.peers.is_empty()) {
            debug!(entity_id = %self.id, sessions = self.peers.len(), "Client set changed, rescheduling");
            self.reschedule()?;
        }
        Ok(())
    }

    /// Scheduled wake: run due ticks, flush and arm the next wake.
    pub fn wake(&mut self) -> Result<Option<TimelineUpdate>> {
        if !self.lifecycle.is_running() {
            return Ok(None);
        }
        self.update_ticks()?;
        let update = self.flush()?;
        self.reschedule()?;
        Ok(update)
    }

    // =========================================================================
    // Client sessions
    // =========================================================================

    /// Subscribe a session, or answer a dry-run request.
    pub async fn subscribe(&mut self, request: SubscribeRequest) -> Result<SubscribeResponse> {
        if !self.lifecycle.is_running() {
            return Ok(SubscribeResponse::Refused(SubscribeRefusal::NotSetUp));
        }

        if let Err(reason) = self.logic.on_client_session_handshake(&request).await {
            info!(entity_id = %self.id, session = %request.session, %reason, "Handshake refused");
            return Ok(SubscribeResponse::Refused(SubscribeRefusal::HandshakeRefused { reason }));
        }

        let correction = self.resources.correction_for(&request.resource_version);

        if request.is_dry_run {
            debug!(entity_id = %self.id, session = %request.session, stale = correction.is_some(), "Dry-run subscribe");
            return Ok(SubscribeResponse::DryRunSuccess { correction });
        }

        if let Some(correction) = &correction {
            if self.config.session.resource_corrections_mandatory {
                info!(
                    entity_id = %self.id,
                    session = %request.session,
                    client_version = %correction.client_version,
                    server_version = %correction.server_version,
                    "Subscribe refused, resources out of date"
                );
                return Ok(SubscribeResponse::Refused(
                    SubscribeRefusal::ResourceCorrectionRequired(correction.clone()),
                ));
            }
        }

        if self.peers.contains_key(&request.session) {
            return Ok(SubscribeResponse::Refused(SubscribeRefusal::AlreadySubscribed {
                session: request.session,
            }));
        }

        // Existing sessions get everything up to now before the newcomer's
        // snapshot is taken.
        self.update_ticks()?;
        self.flush()?;

        let journal = self.journal_mut()?;
        let position = journal.staged_position();
        let checksum = journal.compute_checksum()?;
        let model = rmp_serde::to_vec_named(journal.model())
            .map_err(|e| EntityError::Encoding(e.to_string()))?;

        let development_enabled = self.config.session.development_features_for_all
            || self.config.session.development_players.contains(&request.player)
            || self.logic.is_development_enabled_for(&request.player);
        let session = request.session;
        self.peers
            .insert(session, ClientPeerState::new(&request, development_enabled));
        info!(
            entity_id = %self.id,
            %session,
            player = %request.player,
            slot = %request.slot,
            position = %position,
            "Client session started"
        );

        let initial = InitialState {
            session,
            model,
            position,
            checksum,
            associated: self.associated_entities(),
            correction,
        };

        let (_, effects) = self.run_hook(|logic, ctx| logic.on_client_session_start(ctx, session))?;
        let actions = self.apply_effects(effects)?;
        self.drain_actions(actions)?;
        self.reschedule_if_clients_changed()?;

        Ok(SubscribeResponse::Subscribed(Box::new(initial)))
    }

    /// End a session. Returns whether it was subscribed.
    pub fn unsubscribe(&mut self, session: SessionId) -> Result<bool> {
        if self.peers.remove(&session).is_none() {
            return Ok(false);
        }
        info!(entity_id = %self.id, %session, "Client session ended");

        if self.journal.is_some() {
            let (_, effects) = self.run_hook(|logic, ctx| logic.on_client_session_end(ctx, session))?;
            let actions = self.apply_effects(effects)?;
            self.drain_actions(actions)?;
            self.reschedule_if_clients_changed()?;
        }
        Ok(true)
    }

    /// Validate and stage a client batch, then flush.
    ///
    /// Invalid items are dropped individually; the rest keep their order.
    pub fn handle_client_actions(
        &mut self,
        session: SessionId,
        batch: Vec<Option<ActionEnvelope>>,
    ) -> Result<BatchReport> {
        self.lifecycle.ensure_running()?;
        self.update_ticks()?;

        let mut report = BatchReport::default();
        for (index, item) in batch.into_iter().enumerate() {
            match self.validate_client_action(session, item) {
                Ok(action) => {
                    self.drain_actions(vec![action])?;
                    report.accepted += 1;
                }
                Err(rejection) => {
                    warn!(entity_id = %self.id, %session, index, %rejection, "Client action rejected");
                    report.rejected.push((index, rejection));
                }
            }
        }

        self.flush()?;
        Ok(report)
    }

    fn validate_client_action(
        &self,
        session: SessionId,
        item: Option<ActionEnvelope>,
    ) -> std::result::Result<M::Action, ActionRejection> {
        let peer = self
            .peers
            .get(&session)
            .ok_or(ActionRejection::UnknownSession)?;
        let envelope = item.ok_or(ActionRejection::Missing)?;

        let expected = <M::Action as ModelAction<M>>::FAMILY;
        if envelope.family != expected {
            return Err(ActionRejection::WrongFamily {
                expected: expected.to_string(),
                actual: envelope.family,
            });
        }

        let action: M::Action = rmp_serde::from_slice(&envelope.payload)
            .map_err(|e| ActionRejection::Undecodable { reason: e.to_string() })?;

        let flags = action.execute_flags();
        if !flags.contains(ExecuteFlags::CLIENT_SYNCHRONIZED) {
            return Err(ActionRejection::NotClientSynchronized);
        }
        if flags.contains(ExecuteFlags::DEVELOPMENT_ONLY) && !peer.development_enabled {
            return Err(ActionRejection::DevelopmentOnly);
        }
        if !self
            .logic
            .validate_client_originating_action(&peer.info(), &action)
        {
            return Err(ActionRejection::ValidationFailed);
        }

        let journal = self.journal().map_err(|_| ActionRejection::UnknownSession)?;
        journal
            .dry_run_action(&action)
            .map_err(|e| ActionRejection::DryRunFailed { reason: e.to_string() })?;

        Ok(action)
    }

    /// Hand a generic client envelope to the game logic.
    pub fn handle_client_envelope(&mut self, session: SessionId, payload: Vec<u8>) -> Result<()> {
        self.lifecycle.ensure_running()?;
        if !self.peers.contains_key(&session) {
            debug!(entity_id = %self.id, %session, "Envelope from unknown session dropped");
            return Ok(());
        }

        let (_, effects) = self.run_hook(|logic, ctx| logic.on_client_message(ctx, session, &payload))?;
        let actions = self.apply_effects(effects)?;
        if !actions.is_empty() {
            self.update_ticks()?;
            self.drain_actions(actions)?;
            self.flush()?;
        }
        Ok(())
    }

    /// Register a ping-trace marker for the next tick or flush.
    pub fn add_ping_trace(&mut self, session: SessionId, id: u32, point: PingTracePoint) {
        match self.peers.get_mut(&session) {
            Some(peer) => peer.add_ping_marker(id, point),
            None => debug!(entity_id = %self.id, %session, id, "Ping trace for unknown session dropped"),
        }
    }

    /// Let the game logic handle an associated entity's refusal.
    ///
    /// Returns the refusal to surface when nobody handled it.
    pub fn resolve_association_refusal(
        &mut self,
        slot: ClientSlot,
        reason: String,
    ) -> Result<Option<SubscribeRefusal>> {
        self.lifecycle.ensure_running()?;
        let (handled, effects) =
            self.run_hook(|logic, ctx| logic.on_associated_entity_refusal(ctx, slot, &reason))?;
        let actions = self.apply_effects(effects)?;
        self.drain_actions(actions)?;

        if handled {
            debug!(entity_id = %self.id, %slot, "Associated entity refusal handled");
            Ok(None)
        } else {
            warn!(entity_id = %self.id, %slot, %reason, "Associated entity refusal not handled");
            Ok(Some(SubscribeRefusal::AssociatedEntityRefused { slot, reason }))
        }
    }

    // =========================================================================
    // Desync
    // =========================================================================

    /// Diagnose a client's checksum mismatch. Never fatal.
    pub fn report_checksum_mismatch(&mut self, report: &ChecksumMismatchReport) -> DesyncDiagnosis {
        self.tracer.prune(self.clock.now());
        let diagnosis = self.tracer.diagnose(report);
        match &diagnosis {
            DesyncDiagnosis::Compared { start, end, differences } => warn!(
                entity_id = %self.id,
                session = %report.session,
                tick = report.tick,
                operation = report.operation,
                window_start = %start,
                window_end = %end,
                differences = differences.len(),
                "Client reported desync"
            ),
            other => info!(entity_id = %self.id, session = %report.session, diagnosis = ?other, "Client reported desync"),
        }
        diagnosis
    }

    /// Drop expired desync trace entries.
    pub fn prune_desync_trace(&mut self) -> usize {
        self.tracer.prune(self.clock.now())
    }

    // =========================================================================
    // Persistence and status
    // =========================================================================

    /// Write a snapshot of the current model.
    pub async fn persist(&mut self, is_final: bool) -> Result<()> {
        let Some(journal) = self.journal.as_ref() else {
            return Ok(());
        };
        if !self.store.is_persistent() {
            return Ok(());
        }
        let schema_version = self.config.persistence.schema_version;
        let payload = encode_snapshot(journal.model(), schema_version, self.clock.now())?;
        let size = payload.len();
        self.store
            .write(&self.id, payload, schema_version, is_final)
            .await?;
        debug!(entity_id = %self.id, size, is_final, "Snapshot persisted");
        Ok(())
    }

    pub fn status(&self) -> EntityStatus {
        let model = self.model();
        EntityStatus {
            id: self.id.clone(),
            phase: self.phase(),
            current_tick: model.map(|m| m.timeline().current_tick),
            checkpoint: self.checkpoint_position(),
            staged: self.staged_position(),
            sessions: self.connected_sessions(),
            associated: self.associated_entities(),
            desync_trace_len: self.tracer.len(),
            active_info: model.and_then(|m| self.logic.create_active_entity_info(m)),
        }
    }
}

/// Shift the timeline of a restored model so its current tick is due now.
///
/// Time spent in storage is not simulated.
fn rebase_timeline<M: Model>(model: &mut M, now: DateTime<Utc>) {
    let timeline = model.timeline_mut();
    let elapsed = timeline.time_of_tick(timeline.current_tick) - timeline.time_at_first_tick;
    timeline.time_at_first_tick = now - elapsed;
}
