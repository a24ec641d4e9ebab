//! Client session bridge: requests, outbound messages and per-session state.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tokio::sync::mpsc;
use tracing::debug;

use lockstep_journal::{JournalPosition, Model, ModelAction};

use crate::error::{EntityError, Result};
use crate::types::{
    ActionRejection, AssociatedEntityRef, ChannelId, ClientSlot, ContentHash, PlayerId,
    ResourceCorrection, SessionId, SubscribeRefusal,
};

/// Sender half of a session's outbound queue.
pub type ClientOutbox = mpsc::UnboundedSender<ClientMessage>;

/// A session asking to receive an entity.
#[derive(Debug, Clone)]
pub struct SubscribeRequest {
    pub session: SessionId,
    pub player: PlayerId,
    pub slot: ClientSlot,
    pub channel: ChannelId,
    /// Resource version the client has loaded
    pub resource_version: ContentHash,
    /// Probe only; no session state is created
    pub is_dry_run: bool,
    /// Game-specific handshake data
    pub handshake: serde_json::Value,
    pub outbox: ClientOutbox,
}

/// Full state delivered to a new subscriber.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitialState {
    pub session: SessionId,
    /// MessagePack-encoded model
    pub model: Vec<u8>,
    pub position: JournalPosition,
    pub checksum: u32,
    pub associated: Vec<AssociatedEntityRef>,
    /// Set when the client's resources were corrected in place
    pub correction: Option<ResourceCorrection>,
}

/// Answer to a [`SubscribeRequest`].
#[derive(Debug, Clone)]
pub enum SubscribeResponse {
    Subscribed(Box<InitialState>),
    DryRunSuccess { correction: Option<ResourceCorrection> },
    Refused(SubscribeRefusal),
}

impl SubscribeResponse {
    pub fn is_subscribed(&self) -> bool {
        matches!(self, SubscribeResponse::Subscribed(_))
    }
}

/// Delivery point a ping-trace marker waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PingTracePoint {
    AfterTick,
    AfterFlush,
}

/// Operations committed in one flush, in order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimelineUpdate {
    pub start: JournalPosition,
    pub end: JournalPosition,
    /// `None` is a tick; `Some` an encoded action
    pub operations: Vec<Option<Vec<u8>>>,
    /// Checksum of the model at `end`
    pub final_checksum: u32,
    /// Checksum after every step, in per-operation debug mode
    pub step_checksums: Option<Vec<u32>>,
}

/// Message sent from the entity to a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum ClientMessage {
    TimelineUpdate(TimelineUpdate),
    Envelope { payload: Vec<u8> },
    PingTraceReply { id: u32, point: PingTracePoint, tick: u64 },
}

/// A client-submitted action with its declared family.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionEnvelope {
    pub family: String,
    pub payload: Vec<u8>,
}

impl ActionEnvelope {
    /// Wrap an action of model `M`.
    pub fn from_action<M: Model>(action: &M::Action) -> Result<Self> {
        Ok(Self {
            family: <M::Action as ModelAction<M>>::FAMILY.to_string(),
            payload: encode_action(action)?,
        })
    }
}

pub(crate) fn encode_action<A: Serialize>(action: &A) -> Result<Vec<u8>> {
    rmp_serde::to_vec_named(action).map_err(|e| EntityError::Encoding(e.to_string()))
}

/// Outcome of a client action batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub accepted: usize,
    /// Index within the batch and reason
    pub rejected: Vec<(usize, ActionRejection)>,
}

/// Identity of the session submitting an action.
#[derive(Debug, Clone, Copy)]
pub struct ClientInfo<'a> {
    pub session: SessionId,
    pub player: &'a PlayerId,
    pub slot: ClientSlot,
    pub development_enabled: bool,
}

/// Per-session state held by the entity.
#[derive(Debug)]
pub struct ClientPeerState {
    pub session: SessionId,
    pub slot: ClientSlot,
    pub channel: ChannelId,
    pub player: PlayerId,
    pub development_enabled: bool,
    outbox: ClientOutbox,
    after_tick: VecDeque<u32>,
    after_flush: VecDeque<u32>,
}

impl ClientPeerState {
    pub(crate) fn new(request: &SubscribeRequest, development_enabled: bool) -> Self {
        Self {
            session: request.session,
            slot: request.slot,
            channel: request.channel,
            player: request.player.clone(),
            development_enabled,
            outbox: request.outbox.clone(),
            after_tick: VecDeque::new(),
            after_flush: VecDeque::new(),
        }
    }

    pub fn info(&self) -> ClientInfo<'_> {
        ClientInfo {
            session: self.session,
            player: &self.player,
            slot: self.slot,
            development_enabled: self.development_enabled,
        }
    }

    /// Queue a message. A closed outbox only means the session is going away.
    pub(crate) fn send(&self, message: ClientMessage) {
        if self.outbox.send(message).is_err() {
            debug!(session = %self.session, "Dropped message for closed session");
        }
    }

    pub(crate) fn add_ping_marker(&mut self, id: u32, point: PingTracePoint) {
        match point {
            PingTracePoint::AfterTick => self.after_tick.push_back(id),
            PingTracePoint::AfterFlush => self.after_flush.push_back(id),
        }
    }

    /// Reply to every marker waiting for `point`.
    pub(crate) fn resolve_ping_markers(&mut self, point: PingTracePoint, tick: u64) {
        let queue = match point {
            PingTracePoint::AfterTick => &mut self.after_tick,
            PingTracePoint::AfterFlush => &mut self.after_flush,
        };
        let ids: Vec<u32> = queue.drain(..).collect();
        for id in ids {
            self.send(ClientMessage::PingTraceReply { id, point, tick });
        }
    }

    pub fn pending_ping_markers(&self) -> usize {
        self.after_tick.len() + self.after_flush.len()
    }
}
