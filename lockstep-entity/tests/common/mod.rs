//! Shared test model: a small arena where players score points.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;

use lockstep_entity::{
    ActionEnvelope, ChannelId, ClientMessage, ClientSlot, ContentHash, Entity, EntityConfig,
    EntityContext, EntityError, EntityId, EntityLogic, EntityServices, ManualClock, PlayerId,
    SessionId, StaticResources, SubscribeRequest,
};
use lockstep_journal::{ActionError, Cascade, ExecuteFlags, Model, ModelAction, ModelTimeline};

pub const SERVER_VERSION: &str = "cfg-v2";

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 7, 1, 12, 0, 0).unwrap()
}

// ============================================================================
// Model
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Arena {
    pub timeline: ModelTimeline,
    pub scores: BTreeMap<String, i64>,
    /// Names of marks in the order they were applied
    pub log: Vec<String>,
    pub ticks_seen: u64,
    #[serde(skip)]
    pub render_cache: Option<String>,
}

impl Arena {
    pub fn new(ticks_per_second: u32, now: DateTime<Utc>) -> Self {
        Self {
            timeline: ModelTimeline::new(ticks_per_second, now),
            scores: BTreeMap::new(),
            log: vec![],
            ticks_seen: 0,
            render_cache: None,
        }
    }

    pub fn score(&self, player: &str) -> i64 {
        self.scores.get(player).copied().unwrap_or(0)
    }
}

impl Model for Arena {
    type Action = ArenaAction;

    fn timeline(&self) -> &ModelTimeline {
        &self.timeline
    }

    fn timeline_mut(&mut self) -> &mut ModelTimeline {
        &mut self.timeline
    }

    fn on_tick(&mut self, _cascade: &mut Cascade<ArenaAction>) -> Result<(), ActionError> {
        self.ticks_seen += 1;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ArenaAction {
    /// Client-submittable
    Score { player: String, points: i64 },
    /// Server-only marker appended to the log
    Mark(String),
    /// Client-submittable, always fails
    Fail,
    /// Client-submittable, development only
    DevGrant { player: String, points: i64 },
    /// Client-submittable; one extra step per hit
    Combo { player: String, hits: u32 },
}

impl ArenaAction {
    pub fn score(player: &str, points: i64) -> Self {
        ArenaAction::Score {
            player: player.to_string(),
            points,
        }
    }

    pub fn mark(name: &str) -> Self {
        ArenaAction::Mark(name.to_string())
    }
}

impl ModelAction<Arena> for ArenaAction {
    const FAMILY: &'static str = "arena";

    fn execute_flags(&self) -> ExecuteFlags {
        match self {
            ArenaAction::Mark(_) => ExecuteFlags::NONE,
            ArenaAction::DevGrant { .. } => {
                ExecuteFlags::CLIENT_SYNCHRONIZED | ExecuteFlags::DEVELOPMENT_ONLY
            }
            _ => ExecuteFlags::CLIENT_SYNCHRONIZED,
        }
    }

    fn execute(&self, model: &mut Arena, cascade: &mut Cascade<Self>) -> Result<(), ActionError> {
        match self {
            ArenaAction::Score { player, points } | ArenaAction::DevGrant { player, points } => {
                *model.scores.entry(player.clone()).or_insert(0) += points;
            }
            ArenaAction::Mark(name) => model.log.push(name.clone()),
            ArenaAction::Fail => return Err(ActionError::new("always fails")),
            ArenaAction::Combo { player, hits } => {
                for _ in 0..*hits {
                    cascade.push(ArenaAction::score(player, 1));
                }
            }
        }
        Ok(())
    }
}

// ============================================================================
// Logic
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct ArenaLogic {
    /// Mark name -> marks to run after it
    pub follow_ups: BTreeMap<String, Vec<String>>,
    /// Ask for tick catch-up from inside every post-tick hook
    pub catch_up_on_tick: bool,
    pub refuse_handshake: Option<String>,
    pub associate_on_init: Option<(ClientSlot, EntityId)>,
    pub banned_player: Option<String>,
}

impl ArenaLogic {
    pub fn with_follow_ups(pairs: &[(&str, &[&str])]) -> Self {
        let follow_ups = pairs
            .iter()
            .map(|(name, children)| {
                (
                    name.to_string(),
                    children.iter().map(|c| c.to_string()).collect(),
                )
            })
            .collect();
        Self {
            follow_ups,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ArenaSetup {
    pub ticks_per_second: u32,
}

#[async_trait]
impl EntityLogic<Arena> for ArenaLogic {
    type SetupParams = ArenaSetup;

    async fn set_up_model(
        &self,
        _id: &EntityId,
        params: ArenaSetup,
        now: DateTime<Utc>,
    ) -> Result<Arena, EntityError> {
        if params.ticks_per_second == 0 {
            return Err(EntityError::SetupFailed("tick rate must be positive".to_string()));
        }
        Ok(Arena::new(params.ticks_per_second, now))
    }

    fn on_entity_initialized(&self, ctx: &mut EntityContext<'_, Arena>) {
        if let Some((slot, entity)) = &self.associate_on_init {
            ctx.associate_entity(*slot, entity.clone());
        }
    }

    fn on_post_tick(&self, ctx: &mut EntityContext<'_, Arena>, _tick: u64) {
        if self.catch_up_on_tick {
            let _ = ctx.execute_action(ArenaAction::mark("nested"), true);
        }
    }

    fn on_action_executed(&self, ctx: &mut EntityContext<'_, Arena>, action: &ArenaAction) {
        if let ArenaAction::Mark(name) = action {
            for child in self.follow_ups.get(name).into_iter().flatten() {
                ctx.execute_action_after_pending_actions(ArenaAction::mark(child));
            }
        }
    }

    fn validate_client_originating_action(
        &self,
        _client: &lockstep_entity::ClientInfo<'_>,
        action: &ArenaAction,
    ) -> bool {
        match (action, &self.banned_player) {
            (ArenaAction::Score { player, .. }, Some(banned)) => player != banned,
            _ => true,
        }
    }

    async fn on_client_session_handshake(&self, _request: &SubscribeRequest) -> Result<(), String> {
        match &self.refuse_handshake {
            Some(reason) => Err(reason.clone()),
            None => Ok(()),
        }
    }

    fn on_client_message(&self, ctx: &mut EntityContext<'_, Arena>, session: SessionId, payload: &[u8]) {
        if payload == b"mark" {
            ctx.execute_action_after_pending_actions(ArenaAction::mark("from-client"));
        } else {
            ctx.send_to_client(session, payload.to_vec());
        }
    }

    fn create_active_entity_info(&self, model: &Arena) -> Option<serde_json::Value> {
        Some(serde_json::json!({ "players": model.scores.len() }))
    }

    fn on_associated_entity_refusal(
        &self,
        ctx: &mut EntityContext<'_, Arena>,
        slot: ClientSlot,
        reason: &str,
    ) -> bool {
        if reason == "stale" {
            ctx.dissociate_entity(slot);
            true
        } else {
            false
        }
    }
}

// ============================================================================
// Helpers
// ============================================================================

pub type ArenaEntity = Entity<Arena, ArenaLogic>;

pub fn services(clock: &ManualClock) -> EntityServices {
    EntityServices::new(Arc::new(StaticResources::new(ContentHash::new(SERVER_VERSION))))
        .with_clock(Arc::new(clock.clone()))
}

pub fn new_entity(config: EntityConfig, logic: ArenaLogic, clock: &ManualClock) -> ArenaEntity {
    Entity::new(EntityId::new("arena-1"), config, logic, services(clock))
}

/// Entity set up at `t0()` with the given tick rate.
pub async fn running_entity(
    config: EntityConfig,
    logic: ArenaLogic,
    ticks_per_second: u32,
) -> (ArenaEntity, ManualClock) {
    let clock = ManualClock::new(t0());
    let mut entity = new_entity(config, logic, &clock);
    entity.start().await.unwrap();
    entity.setup(ArenaSetup { ticks_per_second }).await.unwrap();
    (entity, clock)
}

pub fn subscribe_request(
    player: &str,
    version: &str,
) -> (SubscribeRequest, mpsc::UnboundedReceiver<ClientMessage>) {
    let (outbox, inbox) = mpsc::unbounded_channel();
    let request = SubscribeRequest {
        session: SessionId::new(),
        player: PlayerId::new(player),
        slot: ClientSlot(0),
        channel: ChannelId(1),
        resource_version: ContentHash::new(version),
        is_dry_run: false,
        handshake: serde_json::Value::Null,
        outbox,
    };
    (request, inbox)
}

pub fn envelope(action: &ArenaAction) -> Option<ActionEnvelope> {
    Some(ActionEnvelope::from_action::<Arena>(action).unwrap())
}

/// Drain everything currently queued for a session.
pub fn drain(inbox: &mut mpsc::UnboundedReceiver<ClientMessage>) -> Vec<ClientMessage> {
    let mut messages = vec![];
    while let Ok(message) = inbox.try_recv() {
        messages.push(message);
    }
    messages
}

pub fn decode_action(bytes: &[u8]) -> ArenaAction {
    rmp_serde::from_slice(bytes).unwrap()
}
