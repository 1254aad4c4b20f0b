pub mod context;
pub(crate) mod game_loop;
pub(crate) mod queue;
pub(crate) mod timer;
pub(crate) mod worker;

use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::AtomicU32;
use std::sync::{Arc, Weak};
use std::time::Duration;

use atrium_core::{Frame, Packet, RouteHeader, RoutePacket};
use bytes::Bytes;
use tokio::sync::oneshot;

use crate::server::ServerCore;
use crate::session::SessionHandle;
use crate::traits::{Actor, Stage, StageFactory};
use context::StageCtx;
use game_loop::GameLoopHandle;
use queue::StageQueue;
use timer::TimerEntry;

/// Continuation posted back onto a stage by `async_block`. Runs on the
/// stage worker with the stage exclusively held, like any other item.
pub(crate) type AsyncPost =
    Box<dyn FnOnce(&mut dyn Stage, &mut StageCtx<'_>, Box<dyn Any + Send>) + Send>;

/// Where a request's reply goes once user or framework code produces it.
pub(crate) enum ReplyTarget {
    /// Back down the originating client session.
    Client {
        session: SessionHandle,
        msg_seq: u16,
        stage_id: i64,
    },
    /// Back to a peer server as a correlated route envelope.
    Peer { nid: String, msg_seq: u16 },
    /// In-process caller (local create operations, tests).
    Local { tx: oneshot::Sender<Packet> },
}

impl ReplyTarget {
    /// Deliver `packet` to the requester. Consumes the target: a reply
    /// happens at most once.
    pub(crate) fn send(self, server: &Weak<ServerCore>, packet: Packet) {
        match self {
            ReplyTarget::Local { tx } => {
                let _ = tx.send(packet);
            }
            ReplyTarget::Client {
                session,
                msg_seq,
                stage_id,
            } => {
                let frame = Frame::with_error(
                    packet.msg_id,
                    msg_seq,
                    stage_id,
                    packet.error_code,
                    packet.payload,
                );
                session.send_frame(frame);
            }
            ReplyTarget::Peer { nid, msg_seq } => {
                let Some(core) = server.upgrade() else {
                    return;
                };
                let header = RouteHeader {
                    msg_seq,
                    service_type: core.config.service_type,
                    msg_id: packet.msg_id,
                    from_nid: core.config.nid.clone(),
                    stage_id: 0,
                    account_id: String::new(),
                    is_reply: true,
                    error_code: packet.error_code,
                };
                if let Err(e) = core.router.send(&nid, RoutePacket::new(header, packet.payload)) {
                    core.metrics.record_reply_dropped();
                    tracing::warn!(peer = %nid, error = %e, "reply to peer dropped");
                }
            }
        }
    }
}

/// Everything a stage worker can pull from the queue.
pub(crate) enum StageItem {
    Command(SystemCommand),
    ClientMessage {
        account_id: String,
        packet: Packet,
        reply: Option<ReplyTarget>,
    },
    ServerMessage {
        packet: Packet,
        reply: Option<ReplyTarget>,
    },
    TimerFire {
        timer_id: u64,
        last: bool,
    },
    Tick {
        dt: Duration,
        total: Duration,
    },
    AsyncResult {
        post: AsyncPost,
        value: Box<dyn Any + Send>,
    },
}

pub(crate) enum SystemCommand {
    Create {
        payload: Bytes,
        get_or_create: bool,
        reply: Option<ReplyTarget>,
    },
    Join {
        session: SessionHandle,
        payload: Packet,
        reply: Option<ReplyTarget>,
    },
    Leave {
        account_id: String,
        reply: Option<ReplyTarget>,
    },
    DisconnectNotice {
        session_id: u64,
    },
    Destroy {
        reply: Option<ReplyTarget>,
    },
}

/// One actor slot in the stage's table. The session reference is by id; it
/// is resolved through the session registry at send time, so a dead session
/// never pins anything.
pub(crate) struct ActorEntry {
    pub user: Box<dyn Actor>,
    pub session_id: u64,
    pub connected: bool,
}

/// Mutable stage state. Only ever touched by the stage worker, which holds
/// the lock for the duration of each item.
pub(crate) struct StageCore {
    pub user: Box<dyn Stage>,
    pub created: bool,
    pub actors: HashMap<String, ActorEntry>,
    pub timers: HashMap<u64, TimerEntry>,
    pub game_loop: Option<GameLoopHandle>,
}

/// Shared handle on one stage: the mailbox plus the serialized state.
pub(crate) struct StageHandle {
    pub stage_id: i64,
    pub stage_type: String,
    pub queue: StageQueue,
    pub state: tokio::sync::Mutex<StageCore>,
    pub factory: Arc<StageFactory>,
    /// Game-loop ticks enqueued but not yet processed; bounds catch-up.
    pub pending_ticks: AtomicU32,
}

impl StageHandle {
    pub(crate) fn new(stage_id: i64, factory: Arc<StageFactory>) -> Arc<Self> {
        let user = factory.new_stage();
        Arc::new(Self {
            stage_id,
            stage_type: factory.stage_type().to_string(),
            queue: StageQueue::new(),
            state: tokio::sync::Mutex::new(StageCore {
                user,
                created: false,
                actors: HashMap::new(),
                timers: HashMap::new(),
                game_loop: None,
            }),
            factory,
            pending_ticks: AtomicU32::new(0),
        })
    }

    /// Enqueue an item and make sure a worker is draining.
    ///
    /// The first producer to enqueue while no worker runs wins the
    /// `running` flag and spawns one; everyone else just appends. The
    /// worker's own double-check covers the window where a producer
    /// appends between the final pop and the flag clearing.
    pub(crate) fn post(self: &Arc<Self>, server: &Weak<ServerCore>, item: StageItem) {
        self.queue.push(item);
        if self.queue.try_begin() {
            let stage = Arc::clone(self);
            let server = server.clone();
            tokio::spawn(worker::run_stage_worker(stage, server));
        }
    }
}
