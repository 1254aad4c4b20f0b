use std::panic::AssertUnwindSafe;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};
use std::time::Duration;

use atrium_core::route::{sysmsg, CreateStageReply};
use atrium_core::{ErrorCode, Packet};
use bytes::Bytes;
use futures::FutureExt;

use super::context::{CurrentActor, StageCtx};
use super::{ActorEntry, ReplyTarget, StageCore, StageHandle, StageItem, SystemCommand};
use crate::server::ServerCore;
use crate::session::SessionHandle;

/// Drain one stage's queue until it stays empty.
///
/// At most one of these runs per stage at any instant: `post` only spawns a
/// worker after winning the `running` flag. The double-check after clearing
/// the flag closes the race where a producer appends between the last pop
/// and the clear.
pub(crate) async fn run_stage_worker(stage: Arc<StageHandle>, server: Weak<ServerCore>) {
    let burst = server
        .upgrade()
        .map(|core| core.config.stage_dispatch_burst)
        .unwrap_or(256)
        .max(1);

    loop {
        let mut processed = 0usize;
        while let Some(item) = stage.queue.pop() {
            process_item(&stage, &server, item).await;
            processed += 1;
            if processed >= burst {
                processed = 0;
                tokio::task::yield_now().await;
            }
        }
        stage.queue.end();
        if stage.queue.is_empty() || !stage.queue.try_begin() {
            break;
        }
    }
}

async fn process_item(stage: &Arc<StageHandle>, server: &Weak<ServerCore>, item: StageItem) {
    let mut guard = stage.state.lock().await;
    let core = &mut *guard;

    match item {
        StageItem::Command(command) => match command {
            SystemCommand::Create {
                payload,
                get_or_create,
                reply,
            } => handle_create(stage, server, core, payload, get_or_create, reply).await,
            SystemCommand::Join {
                session,
                payload,
                reply,
            } => handle_join(stage, server, core, session, payload, reply).await,
            SystemCommand::Leave { account_id, reply } => {
                handle_leave(stage, server, core, account_id, reply).await
            }
            SystemCommand::DisconnectNotice { session_id } => {
                handle_disconnect_notice(stage, server, core, session_id).await
            }
            SystemCommand::Destroy { reply } => {
                destroy_stage(stage, server, core).await;
                send_reply(server, reply, Packet::empty(sysmsg::DESTROY_STAGE));
            }
        },
        StageItem::ClientMessage {
            account_id,
            packet,
            reply,
        } => handle_client_message(stage, server, core, account_id, packet, reply).await,
        StageItem::ServerMessage { packet, reply } => {
            handle_server_message(stage, server, core, packet, reply).await
        }
        StageItem::TimerFire { timer_id, last } => {
            handle_timer_fire(stage, server, core, timer_id, last).await
        }
        StageItem::Tick { dt, total } => handle_tick(stage, server, core, dt, total).await,
        StageItem::AsyncResult { post, value } => {
            handle_async_result(stage, server, core, post, value)
        }
    }
}

/// Await a user callback, converting a panic into `Err(())`.
async fn guarded<F, T>(fut: F) -> Result<T, ()>
where
    F: std::future::Future<Output = T>,
{
    AssertUnwindSafe(fut).catch_unwind().await.map_err(|_| ())
}

fn send_reply(server: &Weak<ServerCore>, reply: Option<ReplyTarget>, packet: Packet) {
    if let Some(target) = reply {
        target.send(server, packet);
    }
}

fn record_panic(server: &Weak<ServerCore>) {
    if let Some(core) = server.upgrade() {
        core.metrics.record_callback_panic();
    }
}

fn create_reply_packet(msg_id: &str, is_created: bool, payload: Vec<u8>) -> Packet {
    let body = CreateStageReply {
        is_created,
        payload,
    };
    match body.to_bytes() {
        Ok(bytes) => Packet::new(msg_id, bytes),
        Err(e) => {
            tracing::error!(error = %e, "create reply encoding failed");
            Packet::error(msg_id, ErrorCode::InternalError)
        }
    }
}

enum CallbackOutcome<T> {
    Done(T),
    Panicked,
}

/// Run `on_create` / `on_post_create`, flipping `created` on success.
async fn run_on_create(
    stage: &Arc<StageHandle>,
    server: &Weak<ServerCore>,
    core: &mut StageCore,
    payload: Bytes,
) -> Result<Bytes, ErrorCode> {
    let outcome = {
        let StageCore {
            user,
            created,
            actors,
            timers,
            game_loop,
        } = core;
        let mut slot = None;
        let mut ctx = StageCtx {
            stage,
            server,
            actors: &*actors,
            timers,
            game_loop,
            reply_slot: &mut slot,
            current: None,
        };
        match guarded(user.on_create(&mut ctx, payload)).await {
            Err(()) => CallbackOutcome::Panicked,
            Ok(Err(code)) => CallbackOutcome::Done(Err(code)),
            Ok(Ok(reply_payload)) => {
                *created = true;
                match guarded(user.on_post_create(&mut ctx)).await {
                    Err(()) => CallbackOutcome::Panicked,
                    Ok(()) => CallbackOutcome::Done(Ok(reply_payload)),
                }
            }
        }
    };

    match outcome {
        CallbackOutcome::Done(result) => result,
        CallbackOutcome::Panicked => {
            record_panic(server);
            tracing::error!(stage_id = stage.stage_id, "stage creation callback panicked");
            destroy_stage(stage, server, core).await;
            Err(ErrorCode::StageCreationFailed)
        }
    }
}

async fn handle_create(
    stage: &Arc<StageHandle>,
    server: &Weak<ServerCore>,
    core: &mut StageCore,
    payload: Bytes,
    get_or_create: bool,
    reply: Option<ReplyTarget>,
) {
    let msg_id = if get_or_create {
        sysmsg::GET_OR_CREATE_STAGE
    } else {
        sysmsg::CREATE_STAGE
    };

    if core.created {
        if get_or_create {
            send_reply(server, reply, create_reply_packet(msg_id, false, Vec::new()));
        } else {
            send_reply(
                server,
                reply,
                Packet::error(msg_id, ErrorCode::StageAlreadyExists),
            );
        }
        return;
    }

    match run_on_create(stage, server, core, payload).await {
        Ok(reply_payload) => {
            tracing::info!(
                stage_id = stage.stage_id,
                stage_type = %stage.stage_type,
                "stage created"
            );
            send_reply(
                server,
                reply,
                create_reply_packet(msg_id, true, reply_payload.to_vec()),
            );
        }
        Err(code) => {
            let code = if code == ErrorCode::Success {
                ErrorCode::StageCreationFailed
            } else {
                code
            };
            send_reply(server, reply, Packet::error(msg_id, code));
        }
    }
}

async fn handle_join(
    stage: &Arc<StageHandle>,
    server: &Weak<ServerCore>,
    core: &mut StageCore,
    session: SessionHandle,
    payload: Packet,
    reply: Option<ReplyTarget>,
) {
    let reply_msg_id = payload.msg_id.clone();

    // The auth path may reach a stage shell that never ran its create; an
    // implicit, payload-less create keeps the created invariant intact.
    if !core.created {
        if let Err(code) = run_on_create(stage, server, core, Bytes::new()).await {
            send_reply(server, reply, Packet::error(reply_msg_id, code));
            session.begin_disconnect(ErrorCode::StageCreationFailed);
            return;
        }
    }

    let mut probe = stage.factory.new_actor();

    if guarded(probe.on_create()).await.is_err() {
        join_panic(stage, server, core, &session, reply, &reply_msg_id).await;
        return;
    }

    let authenticated = match guarded(probe.on_authenticate(&payload)).await {
        Err(()) => {
            join_panic(stage, server, core, &session, reply, &reply_msg_id).await;
            return;
        }
        Ok(ok) => ok,
    };

    if !authenticated {
        if guarded(probe.on_destroy()).await.is_err() {
            record_panic(server);
        }
        auth_reject(server, &session, reply, &reply_msg_id, ErrorCode::AuthenticationFailed);
        return;
    }

    let account_id = probe.account_id().to_string();
    if account_id.is_empty() {
        // Contract violation: authentication succeeded without publishing
        // an account id.
        if guarded(probe.on_destroy()).await.is_err() {
            record_panic(server);
        }
        auth_reject(server, &session, reply, &reply_msg_id, ErrorCode::AccountIdNotSet);
        return;
    }

    // An actor already holding this account means a returning player: bind
    // the new session to the surviving actor and drop the probe.
    if let Some(mut entry) = core.actors.remove(&account_id) {
        entry.session_id = session.session_id();
        entry.connected = true;
        session.set_authenticated(&account_id, stage.stage_id);

        let panicked = {
            let StageCore {
                user,
                actors,
                timers,
                game_loop,
                ..
            } = core;
            let mut slot = None;
            let mut ctx = StageCtx {
                stage,
                server,
                actors: &*actors,
                timers,
                game_loop,
                reply_slot: &mut slot,
                current: Some(CurrentActor {
                    account_id: account_id.clone(),
                    session_id: entry.session_id,
                }),
            };
            guarded(user.on_connection_changed(&mut ctx, entry.user.as_mut(), true))
                .await
                .is_err()
        };
        core.actors.insert(account_id.clone(), entry);
        if panicked {
            join_panic(stage, server, core, &session, reply, &reply_msg_id).await;
            return;
        }
        tracing::info!(
            stage_id = stage.stage_id,
            account_id = %account_id,
            session_id = session.session_id(),
            "actor reconnected"
        );
        send_reply(server, reply, Packet::empty(reply_msg_id));
        return;
    }

    if guarded(probe.on_post_authenticate()).await.is_err() {
        join_panic(stage, server, core, &session, reply, &reply_msg_id).await;
        return;
    }

    enum JoinOutcome {
        Joined,
        Rejected,
        Panicked,
    }

    let outcome = {
        let StageCore {
            user,
            actors,
            timers,
            game_loop,
            ..
        } = core;
        let mut slot = None;
        let mut ctx = StageCtx {
            stage,
            server,
            actors: &*actors,
            timers,
            game_loop,
            reply_slot: &mut slot,
            current: Some(CurrentActor {
                account_id: account_id.clone(),
                session_id: session.session_id(),
            }),
        };
        match guarded(user.on_join_stage(&mut ctx, probe.as_mut())).await {
            Err(()) => JoinOutcome::Panicked,
            Ok(false) => JoinOutcome::Rejected,
            Ok(true) => match guarded(user.on_post_join_stage(&mut ctx, probe.as_mut())).await {
                Err(()) => JoinOutcome::Panicked,
                Ok(()) => JoinOutcome::Joined,
            },
        }
    };

    match outcome {
        JoinOutcome::Panicked => {
            join_panic(stage, server, core, &session, reply, &reply_msg_id).await;
        }
        JoinOutcome::Rejected => {
            if guarded(probe.on_destroy()).await.is_err() {
                record_panic(server);
            }
            auth_reject(server, &session, reply, &reply_msg_id, ErrorCode::JoinStageFailed);
        }
        JoinOutcome::Joined => {
            session.set_authenticated(&account_id, stage.stage_id);
            core.actors.insert(
                account_id.clone(),
                ActorEntry {
                    user: probe,
                    session_id: session.session_id(),
                    connected: true,
                },
            );
            tracing::info!(
                stage_id = stage.stage_id,
                account_id = %account_id,
                session_id = session.session_id(),
                "actor joined stage"
            );
            send_reply(server, reply, Packet::empty(reply_msg_id));
        }
    }
}

/// A panic inside a system command closes the stage and the joining session.
async fn join_panic(
    stage: &Arc<StageHandle>,
    server: &Weak<ServerCore>,
    core: &mut StageCore,
    session: &SessionHandle,
    reply: Option<ReplyTarget>,
    reply_msg_id: &str,
) {
    record_panic(server);
    tracing::error!(stage_id = stage.stage_id, "join callback panicked, closing stage");
    send_reply(
        server,
        reply,
        Packet::error(reply_msg_id, ErrorCode::InternalError),
    );
    destroy_stage(stage, server, core).await;
    session.begin_disconnect(ErrorCode::InternalError);
}

fn auth_reject(
    server: &Weak<ServerCore>,
    session: &SessionHandle,
    reply: Option<ReplyTarget>,
    reply_msg_id: &str,
    code: ErrorCode,
) {
    if let Some(core) = server.upgrade() {
        core.metrics.record_auth_failure();
    }
    send_reply(server, reply, Packet::error(reply_msg_id, code));
    session.begin_disconnect(code);
}

async fn handle_leave(
    stage: &Arc<StageHandle>,
    server: &Weak<ServerCore>,
    core: &mut StageCore,
    account_id: String,
    reply: Option<ReplyTarget>,
) {
    match core.actors.remove(&account_id) {
        None => {
            send_reply(
                server,
                reply,
                Packet::error(sysmsg::LEAVE_STAGE, ErrorCode::ActorNotFound),
            );
        }
        Some(mut entry) => {
            if guarded(entry.user.on_destroy()).await.is_err() {
                record_panic(server);
            }
            if let Some(server_core) = server.upgrade() {
                if let Some(session) = server_core.sessions.get(&entry.session_id) {
                    session.clear_stage(stage.stage_id);
                }
            }
            tracing::info!(
                stage_id = stage.stage_id,
                account_id = %account_id,
                "actor left stage"
            );
            send_reply(server, reply, Packet::empty(sysmsg::LEAVE_STAGE));
        }
    }
}

async fn handle_disconnect_notice(
    stage: &Arc<StageHandle>,
    server: &Weak<ServerCore>,
    core: &mut StageCore,
    session_id: u64,
) {
    let account_id = core
        .actors
        .iter()
        .find(|(_, entry)| entry.session_id == session_id && entry.connected)
        .map(|(account, _)| account.clone());
    let Some(account_id) = account_id else {
        return;
    };
    let Some(mut entry) = core.actors.remove(&account_id) else {
        return;
    };
    entry.connected = false;

    let panicked = {
        let StageCore {
            user,
            actors,
            timers,
            game_loop,
            ..
        } = core;
        let mut slot = None;
        let mut ctx = StageCtx {
            stage,
            server,
            actors: &*actors,
            timers,
            game_loop,
            reply_slot: &mut slot,
            current: Some(CurrentActor {
                account_id: account_id.clone(),
                session_id,
            }),
        };
        guarded(user.on_connection_changed(&mut ctx, entry.user.as_mut(), false))
            .await
            .is_err()
    };
    // The actor stays: the stage decides its own eviction policy.
    core.actors.insert(account_id, entry);
    if panicked {
        record_panic(server);
    }
}

async fn handle_client_message(
    stage: &Arc<StageHandle>,
    server: &Weak<ServerCore>,
    core: &mut StageCore,
    account_id: String,
    packet: Packet,
    reply: Option<ReplyTarget>,
) {
    let msg_id = packet.msg_id.clone();
    if !core.created {
        send_reply(server, reply, Packet::error(msg_id, ErrorCode::StageNotFound));
        return;
    }
    let Some(mut entry) = core.actors.remove(&account_id) else {
        tracing::warn!(
            stage_id = stage.stage_id,
            account_id = %account_id,
            msg_id = %msg_id,
            "message for unknown actor"
        );
        send_reply(server, reply, Packet::error(msg_id, ErrorCode::ActorNotFound));
        return;
    };

    let mut reply_slot = reply;
    let panicked = {
        let StageCore {
            user,
            actors,
            timers,
            game_loop,
            ..
        } = core;
        let mut ctx = StageCtx {
            stage,
            server,
            actors: &*actors,
            timers,
            game_loop,
            reply_slot: &mut reply_slot,
            current: Some(CurrentActor {
                account_id: account_id.clone(),
                session_id: entry.session_id,
            }),
        };
        guarded(user.on_dispatch(&mut ctx, entry.user.as_mut(), packet))
            .await
            .is_err()
    };
    core.actors.insert(account_id, entry);

    if panicked {
        record_panic(server);
        tracing::error!(
            stage_id = stage.stage_id,
            msg_id = %msg_id,
            "dispatch callback panicked"
        );
        // Best-effort error reply if the item was a request; the stage
        // itself survives.
        if let Some(target) = reply_slot.take() {
            target.send(server, Packet::error(msg_id, ErrorCode::UncheckedContentsError));
        }
    }
}

async fn handle_server_message(
    stage: &Arc<StageHandle>,
    server: &Weak<ServerCore>,
    core: &mut StageCore,
    packet: Packet,
    reply: Option<ReplyTarget>,
) {
    let msg_id = packet.msg_id.clone();
    if !core.created {
        send_reply(server, reply, Packet::error(msg_id, ErrorCode::StageNotFound));
        return;
    }

    let mut reply_slot = reply;
    let panicked = {
        let StageCore {
            user,
            actors,
            timers,
            game_loop,
            ..
        } = core;
        let mut ctx = StageCtx {
            stage,
            server,
            actors: &*actors,
            timers,
            game_loop,
            reply_slot: &mut reply_slot,
            current: None,
        };
        guarded(user.on_server_dispatch(&mut ctx, packet)).await.is_err()
    };

    if panicked {
        record_panic(server);
        tracing::error!(
            stage_id = stage.stage_id,
            msg_id = %msg_id,
            "server dispatch callback panicked"
        );
        if let Some(target) = reply_slot.take() {
            target.send(server, Packet::error(msg_id, ErrorCode::UncheckedContentsError));
        }
    }
}

async fn handle_timer_fire(
    stage: &Arc<StageHandle>,
    server: &Weak<ServerCore>,
    core: &mut StageCore,
    timer_id: u64,
    last: bool,
) {
    // Cancelled between firing and processing: drop silently.
    if !core.timers.contains_key(&timer_id) {
        return;
    }
    if last {
        core.timers.remove(&timer_id);
    }

    let panicked = {
        let StageCore {
            user,
            actors,
            timers,
            game_loop,
            ..
        } = core;
        let mut slot = None;
        let mut ctx = StageCtx {
            stage,
            server,
            actors: &*actors,
            timers,
            game_loop,
            reply_slot: &mut slot,
            current: None,
        };
        guarded(user.on_timer(&mut ctx, timer_id)).await.is_err()
    };
    if panicked {
        record_panic(server);
        tracing::error!(stage_id = stage.stage_id, timer_id, "timer callback panicked");
    }
}

async fn handle_tick(
    stage: &Arc<StageHandle>,
    server: &Weak<ServerCore>,
    core: &mut StageCore,
    dt: Duration,
    total: Duration,
) {
    stage.pending_ticks.fetch_sub(1, Ordering::Relaxed);

    let panicked = {
        let StageCore {
            user,
            actors,
            timers,
            game_loop,
            ..
        } = core;
        let mut slot = None;
        let mut ctx = StageCtx {
            stage,
            server,
            actors: &*actors,
            timers,
            game_loop,
            reply_slot: &mut slot,
            current: None,
        };
        guarded(user.on_tick(&mut ctx, dt, total)).await.is_err()
    };
    if panicked {
        record_panic(server);
        tracing::error!(stage_id = stage.stage_id, "tick callback panicked");
    }
}

fn handle_async_result(
    stage: &Arc<StageHandle>,
    server: &Weak<ServerCore>,
    core: &mut StageCore,
    post: super::AsyncPost,
    value: Box<dyn std::any::Any + Send>,
) {
    let StageCore {
        user,
        actors,
        timers,
        game_loop,
        ..
    } = core;
    let mut slot = None;
    let mut ctx = StageCtx {
        stage,
        server,
        actors: &*actors,
        timers,
        game_loop,
        reply_slot: &mut slot,
        current: None,
    };
    let result = std::panic::catch_unwind(AssertUnwindSafe(|| post(user.as_mut(), &mut ctx, value)));
    if result.is_err() {
        record_panic(server);
        tracing::error!(stage_id = stage.stage_id, "async block continuation panicked");
    }
}

/// Full teardown: timers cancelled, game loop stopped, actors then the
/// stage destroyed, directory entry removed.
pub(crate) async fn destroy_stage(
    stage: &Arc<StageHandle>,
    server: &Weak<ServerCore>,
    core: &mut StageCore,
) {
    for (_, entry) in core.timers.drain() {
        entry.cancel();
    }
    if let Some(handle) = core.game_loop.take() {
        handle.stop();
    }
    let actors: Vec<ActorEntry> = core.actors.drain().map(|(_, entry)| entry).collect();
    for mut entry in actors {
        if guarded(entry.user.on_destroy()).await.is_err() {
            record_panic(server);
        }
    }
    if guarded(core.user.on_destroy()).await.is_err() {
        record_panic(server);
    }
    core.created = false;
    if let Some(server_core) = server.upgrade() {
        server_core.stages.remove(stage.stage_id);
    }
    tracing::info!(stage_id = stage.stage_id, "stage destroyed");
}
