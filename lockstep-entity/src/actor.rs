//! Mailbox actor hosting one entity.
//!
//! Every request reaches the entity through a single mpsc mailbox drained by
//! one task, so exactly one message mutates the entity at a time. Timers post
//! back into the same mailbox.

use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};

use lockstep_journal::Model;

use crate::desync::{ChecksumMismatchReport, DesyncDiagnosis};
use crate::entity::{Entity, EntityStatus};
use crate::error::{EntityError, Result};
use crate::logic::EntityLogic;
use crate::session::{ActionEnvelope, BatchReport, PingTracePoint, SubscribeRequest, SubscribeResponse};
use crate::types::{ClientSlot, EntityId, SessionId, SubscribeRefusal};

type Reply<T> = oneshot::Sender<Result<T>>;

/// Messages accepted by an entity.
pub enum EntityMessage<M: Model, L: EntityLogic<M>> {
    Setup {
        params: L::SetupParams,
        reply: Reply<()>,
    },
    Subscribe {
        request: SubscribeRequest,
        reply: Reply<SubscribeResponse>,
    },
    Unsubscribe {
        session: SessionId,
        reply: Reply<bool>,
    },
    ClientActions {
        session: SessionId,
        batch: Vec<Option<ActionEnvelope>>,
        reply: Reply<BatchReport>,
    },
    ClientEnvelope {
        session: SessionId,
        payload: Vec<u8>,
    },
    ChecksumMismatch {
        report: ChecksumMismatchReport,
        reply: oneshot::Sender<DesyncDiagnosis>,
    },
    PingTrace {
        session: SessionId,
        id: u32,
        point: PingTracePoint,
    },
    ExecuteAction {
        action: M::Action,
        run_pending_ticks_first: bool,
        reply: Reply<()>,
    },
    ResolveAssociationRefusal {
        slot: ClientSlot,
        reason: String,
        reply: Reply<Option<SubscribeRefusal>>,
    },
    PersistNow {
        reply: Reply<()>,
    },
    Inspect {
        reply: oneshot::Sender<EntityStatus>,
    },
    Shutdown {
        reply: Reply<()>,
    },
    /// Posted by the tick timer
    TickTimer {
        generation: u64,
    },
}

/// Cloneable address of a running entity.
pub struct EntityHandle<M: Model, L: EntityLogic<M>> {
    id: EntityId,
    sender: mpsc::Sender<EntityMessage<M, L>>,
}

impl<M: Model, L: EntityLogic<M>> Clone for EntityHandle<M, L> {
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            sender: self.sender.clone(),
        }
    }
}

impl<M: Model, L: EntityLogic<M>> EntityHandle<M, L> {
    pub fn id(&self) -> &EntityId {
        &self.id
    }

    /// Whether the entity task has stopped.
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    async fn request<T>(&self, make: impl FnOnce(Reply<T>) -> EntityMessage<M, L>) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.sender
            .send(make(reply))
            .await
            .map_err(|_| EntityError::MailboxClosed)?;
        response.await.map_err(|_| EntityError::MailboxClosed)?
    }

    async fn post(&self, message: EntityMessage<M, L>) -> Result<()> {
        self.sender
            .send(message)
            .await
            .map_err(|_| EntityError::MailboxClosed)
    }

    pub async fn setup(&self, params: L::SetupParams) -> Result<()> {
        self.request(|reply| EntityMessage::Setup { params, reply }).await
    }

    pub async fn subscribe(&self, request: SubscribeRequest) -> Result<SubscribeResponse> {
        self.request(|reply| EntityMessage::Subscribe { request, reply })
            .await
    }

    pub async fn unsubscribe(&self, session: SessionId) -> Result<bool> {
        self.request(|reply| EntityMessage::Unsubscribe { session, reply })
            .await
    }

    pub async fn submit_actions(
        &self,
        session: SessionId,
        batch: Vec<Option<ActionEnvelope>>,
    ) -> Result<BatchReport> {
        self.request(|reply| EntityMessage::ClientActions {
            session,
            batch,
            reply,
        })
        .await
    }

    pub async fn send_envelope(&self, session: SessionId, payload: Vec<u8>) -> Result<()> {
        self.post(EntityMessage::ClientEnvelope { session, payload })
            .await
    }

    pub async fn report_mismatch(&self, report: ChecksumMismatchReport) -> Result<DesyncDiagnosis> {
        let (reply, response) = oneshot::channel();
        self.post(EntityMessage::ChecksumMismatch { report, reply })
            .await?;
        response.await.map_err(|_| EntityError::MailboxClosed)
    }

    pub async fn ping_trace(&self, session: SessionId, id: u32, point: PingTracePoint) -> Result<()> {
        self.post(EntityMessage::PingTrace { session, id, point })
            .await
    }

    pub async fn execute_action(&self, action: M::Action, run_pending_ticks_first: bool) -> Result<()> {
        self.request(|reply| EntityMessage::ExecuteAction {
            action,
            run_pending_ticks_first,
            reply,
        })
        .await
    }

    pub async fn resolve_association_refusal(
        &self,
        slot: ClientSlot,
        reason: impl Into<String>,
    ) -> Result<Option<SubscribeRefusal>> {
        let reason = reason.into();
        self.request(|reply| EntityMessage::ResolveAssociationRefusal {
            slot,
            reason,
            reply,
        })
        .await
    }

    pub async fn persist_now(&self) -> Result<()> {
        self.request(|reply| EntityMessage::PersistNow { reply })
            .await
    }

    pub async fn inspect(&self) -> Result<EntityStatus> {
        let (reply, response) = oneshot::channel();
        self.post(EntityMessage::Inspect { reply }).await?;
        response.await.map_err(|_| EntityError::MailboxClosed)
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.request(|reply| EntityMessage::Shutdown { reply })
            .await
    }
}

/// Run `entity` on its own task.
///
/// The task ends after a shutdown request, when every handle is dropped, or
/// with the fatal error that stopped it.
pub fn spawn_entity<M, L>(mut entity: Entity<M, L>) -> (EntityHandle<M, L>, JoinHandle<Result<()>>)
where
    M: Model,
    L: EntityLogic<M>,
{
    let (sender, mailbox) = mpsc::channel(entity.config().mailbox_capacity());
    entity.attach_mailbox(sender.downgrade());
    let handle = EntityHandle {
        id: entity.id().clone(),
        sender,
    };
    let task = tokio::spawn(run(entity, mailbox));
    (handle, task)
}

enum Flow {
    Continue,
    Stop,
}

async fn run<M, L>(mut entity: Entity<M, L>, mut mailbox: mpsc::Receiver<EntityMessage<M, L>>) -> Result<()>
where
    M: Model,
    L: EntityLogic<M>,
{
    if let Err(e) = entity.start().await {
        error!(entity_id = %entity.id(), error = %e, "Entity failed to start");
        return Err(e);
    }

    let snapshot_secs = entity.config().persistence.snapshot_interval_secs;
    let snapshot_period = Duration::from_secs(snapshot_secs.max(1));
    let mut snapshot_timer = interval_at(Instant::now() + snapshot_period, snapshot_period);
    snapshot_timer.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let prune_period = Duration::from_millis(entity.config().desync.prune_interval_ms.max(1));
    let mut prune_timer = interval_at(Instant::now() + prune_period, prune_period);
    prune_timer.set_missed_tick_behavior(MissedTickBehavior::Skip);

    info!(entity_id = %entity.id(), phase = ?entity.phase(), "Entity actor running");

    loop {
        tokio::select! {
            message = mailbox.recv() => {
                let Some(message) = message else {
                    debug!(entity_id = %entity.id(), "All handles dropped, shutting down");
                    return entity.shutdown().await;
                };
                match dispatch(&mut entity, message).await {
                    Ok(Flow::Continue) => {}
                    Ok(Flow::Stop) => return Ok(()),
                    Err(e) => {
                        error!(entity_id = %entity.id(), error = %e, "Entity stopped on fatal error");
                        return Err(e);
                    }
                }
            }
            _ = snapshot_timer.tick(), if snapshot_secs > 0 => {
                if let Err(e) = entity.persist(false).await {
                    warn!(entity_id = %entity.id(), error = %e, "Periodic snapshot failed");
                }
            }
            _ = prune_timer.tick() => {
                entity.prune_desync_trace();
            }
        }
    }
}

/// Answer a request. Fatal errors are reported to the caller as
/// [`EntityError::Terminated`] and returned to stop the actor.
fn settle<T>(reply: Reply<T>, result: Result<T>) -> Result<Flow> {
    match result {
        Err(e) if e.is_fatal() => {
            let _ = reply.send(Err(EntityError::Terminated(e.to_string())));
            Err(e)
        }
        other => {
            let _ = reply.send(other);
            Ok(Flow::Continue)
        }
    }
}

async fn dispatch<M, L>(entity: &mut Entity<M, L>, message: EntityMessage<M, L>) -> Result<Flow>
where
    M: Model,
    L: EntityLogic<M>,
{
    match message {
        EntityMessage::Setup { params, reply } => settle(reply, entity.setup(params).await),
        EntityMessage::Subscribe { request, reply } => settle(reply, entity.subscribe(request).await),
        EntityMessage::Unsubscribe { session, reply } => settle(reply, entity.unsubscribe(session)),
        EntityMessage::ClientActions {
            session,
            batch,
            reply,
        } => settle(reply, entity.handle_client_actions(session, batch)),
        EntityMessage::ClientEnvelope { session, payload } => {
            match entity.handle_client_envelope(session, payload) {
                Err(e) if e.is_fatal() => Err(e),
                Err(e) => {
                    debug!(entity_id = %entity.id(), %session, error = %e, "Envelope ignored");
                    Ok(Flow::Continue)
                }
                Ok(()) => Ok(Flow::Continue),
            }
        }
        EntityMessage::ChecksumMismatch { report, reply } => {
            let _ = reply.send(entity.report_checksum_mismatch(&report));
            Ok(Flow::Continue)
        }
        EntityMessage::PingTrace { session, id, point } => {
            entity.add_ping_trace(session, id, point);
            Ok(Flow::Continue)
        }
        EntityMessage::ExecuteAction {
            action,
            run_pending_ticks_first,
            reply,
        } => {
            let result = entity
                .execute_action(action, run_pending_ticks_first)
                .and_then(|()| entity.flush().map(|_| ()));
            settle(reply, result)
        }
        EntityMessage::ResolveAssociationRefusal { slot, reason, reply } => {
            settle(reply, entity.resolve_association_refusal(slot, reason))
        }
        EntityMessage::PersistNow { reply } => {
            let result = entity.persist(false).await;
            if let Err(e) = &result {
                warn!(entity_id = %entity.id(), error = %e, "Requested snapshot failed");
            }
            // A failed write is reported, not fatal.
            let _ = reply.send(result);
            Ok(Flow::Continue)
        }
        EntityMessage::Inspect { reply } => {
            let _ = reply.send(entity.status());
            Ok(Flow::Continue)
        }
        EntityMessage::Shutdown { reply } => {
            let result = entity.shutdown().await;
            let _ = reply.send(result);
            Ok(Flow::Stop)
        }
        EntityMessage::TickTimer { generation } => {
            if !entity.is_current_timer(generation) {
                trace!(entity_id = %entity.id(), generation, "Stale tick timer ignored");
                return Ok(Flow::Continue);
            }
            entity.wake().map(|_| Flow::Continue)
        }
    }
}
