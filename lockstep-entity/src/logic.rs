//! Game-specific hooks and the context handed to them.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lockstep_journal::Model;

use crate::error::{EntityError, Result};
use crate::session::{ClientInfo, SubscribeRequest};
use crate::types::{ClientSlot, EntityId, PlayerId, SessionId};

/// Hooks a concrete game implements.
///
/// Hooks run on the entity's task, after the operation that triggered them
/// has completed. Actions they request through [`EntityContext`] run right
/// after the current operation, before anything queued earlier.
#[async_trait]
pub trait EntityLogic<M: Model>: Send + Sync + 'static {
    /// Parameters of a setup request.
    type SetupParams: Send + 'static;

    /// Build the initial model of a fresh entity.
    async fn set_up_model(&self, id: &EntityId, params: Self::SetupParams, now: DateTime<Utc>) -> Result<M>;

    /// A model was installed, fresh or restored.
    fn on_switched_to_model(&self, _model: &M) {}

    /// The entity started running.
    fn on_entity_initialized(&self, _ctx: &mut EntityContext<'_, M>) {}

    /// A tick finished.
    fn on_post_tick(&self, _ctx: &mut EntityContext<'_, M>, _tick: u64) {}

    /// An action (server-issued or client-submitted) finished.
    fn on_action_executed(&self, _ctx: &mut EntityContext<'_, M>, _action: &M::Action) {}

    /// Game-specific check of a client-submitted action.
    fn validate_client_originating_action(&self, _client: &ClientInfo<'_>, _action: &M::Action) -> bool {
        true
    }

    /// Accept or refuse a subscribing session. `Err` carries the reason.
    async fn on_client_session_handshake(&self, _request: &SubscribeRequest) -> std::result::Result<(), String> {
        Ok(())
    }

    fn on_client_session_start(&self, _ctx: &mut EntityContext<'_, M>, _session: SessionId) {}

    fn on_client_session_end(&self, _ctx: &mut EntityContext<'_, M>, _session: SessionId) {}

    /// Generic envelope from a client.
    fn on_client_message(&self, _ctx: &mut EntityContext<'_, M>, _session: SessionId, _payload: &[u8]) {}

    /// Summary shown by status inspection.
    fn create_active_entity_info(&self, _model: &M) -> Option<serde_json::Value> {
        None
    }

    /// An associated entity refused a session. Return `true` if handled.
    fn on_associated_entity_refusal(&self, _ctx: &mut EntityContext<'_, M>, _slot: ClientSlot, _reason: &str) -> bool {
        false
    }

    /// Whether `player` may submit development-only actions.
    fn is_development_enabled_for(&self, _player: &PlayerId) -> bool {
        false
    }
}

/// Side effects requested by hooks, applied by the entity afterwards.
#[derive(Debug)]
pub(crate) struct HookEffects<A> {
    pub actions: Vec<A>,
    pub associations: Vec<AssociationEdit>,
    pub outbound: Vec<(Option<SessionId>, Vec<u8>)>,
    pub fatal: Option<EntityError>,
}

impl<A> Default for HookEffects<A> {
    fn default() -> Self {
        Self {
            actions: vec![],
            associations: vec![],
            outbound: vec![],
            fatal: None,
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) enum AssociationEdit {
    Associate(ClientSlot, EntityId),
    Dissociate(ClientSlot),
}

/// What a hook can see and do.
pub struct EntityContext<'a, M: Model> {
    entity_id: &'a EntityId,
    model: &'a M,
    now: DateTime<Utc>,
    updating_ticks: bool,
    effects: &'a mut HookEffects<M::Action>,
}

impl<'a, M: Model> EntityContext<'a, M> {
    pub(crate) fn new(
        entity_id: &'a EntityId,
        model: &'a M,
        now: DateTime<Utc>,
        updating_ticks: bool,
        effects: &'a mut HookEffects<M::Action>,
    ) -> Self {
        Self {
            entity_id,
            model,
            now,
            updating_ticks,
            effects,
        }
    }

    pub fn entity_id(&self) -> &EntityId {
        self.entity_id
    }

    /// The model as of the end of the current operation.
    pub fn model(&self) -> &M {
        self.model
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.now
    }

    /// Whether the current operation is part of a tick update.
    pub fn is_updating_ticks(&self) -> bool {
        self.updating_ticks
    }

    /// Run `action` after the current operation, before earlier queued work.
    pub fn execute_action_after_pending_actions(&mut self, action: M::Action) {
        self.effects.actions.push(action);
    }

    /// Run a server-issued action.
    ///
    /// Asking for tick catch-up while ticks are being updated is a fatal
    /// [`EntityError::ReentrantTickUpdate`].
    pub fn execute_action(&mut self, action: M::Action, run_pending_ticks_first: bool) -> Result<()> {
        if run_pending_ticks_first && self.updating_ticks {
            self.effects.fatal.get_or_insert(EntityError::ReentrantTickUpdate);
            return Err(EntityError::ReentrantTickUpdate);
        }
        self.effects.actions.push(action);
        Ok(())
    }

    /// Deliver the entity on `slot` to subscribers alongside this one.
    pub fn associate_entity(&mut self, slot: ClientSlot, entity: EntityId) {
        self.effects
            .associations
            .push(AssociationEdit::Associate(slot, entity));
    }

    pub fn dissociate_entity(&mut self, slot: ClientSlot) {
        self.effects.associations.push(AssociationEdit::Dissociate(slot));
    }

    pub fn send_to_client(&mut self, session: SessionId, payload: Vec<u8>) {
        self.effects.outbound.push((Some(session), payload));
    }

    pub fn broadcast_to_clients(&mut self, payload: Vec<u8>) {
        self.effects.outbound.push((None, payload));
    }
}
