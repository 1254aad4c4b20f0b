use std::sync::Arc;

use atrium_core::error::CoreError;
use atrium_core::frame::Direction;
use atrium_core::route::{service, sysmsg, CreateStageRequest, RouteHeader, RoutePacket};
use atrium_core::tracker::ReplyFuture;
use atrium_core::{ErrorCode, Frame, Packet};
use bytes::Bytes;

use crate::api::ApiSender;
use crate::server::ServerCore;
use crate::session::{SessionHandle, SessionState};
use crate::stage::{ReplyTarget, StageItem, SystemCommand};

/// Route one decoded client frame.
///
/// Heartbeats answer in place; everything else is gated on the session
/// state: an unauthenticated session may only present the configured
/// authenticate msgId, which turns into a `Join` on the target stage.
pub(crate) async fn handle_client_frame(
    core: &Arc<ServerCore>,
    session: &SessionHandle,
    frame: Frame,
) {
    session.mark_inbound();
    core.metrics
        .record_frame_received(frame.encoded_len(Direction::ClientToServer));

    if frame.is_heartbeat() {
        session.send_frame(Frame::heartbeat());
        return;
    }

    match session.state() {
        SessionState::Connected => {
            if frame.msg_id != core.config.authenticate_msg_id {
                tracing::warn!(
                    session_id = session.session_id(),
                    msg_id = %frame.msg_id,
                    "message before authentication"
                );
                session.begin_disconnect(ErrorCode::ConnectionClosed);
                return;
            }
            if !session.begin_authenticating() {
                return;
            }

            let stage_id = frame.stage_id;
            let stage = match core.stages.get_or_create(
                stage_id,
                &core.config.default_stage_type,
                &core.factories,
            ) {
                Ok(stage) => stage,
                Err(e) => {
                    tracing::warn!(
                        session_id = session.session_id(),
                        stage_id,
                        error = %e,
                        "auth path could not resolve stage"
                    );
                    reply_error_to_client(session, &frame, e.to_error_code());
                    session.begin_disconnect(e.to_error_code());
                    return;
                }
            };
            let reply = (frame.msg_seq > 0).then(|| ReplyTarget::Client {
                session: session.clone(),
                msg_seq: frame.msg_seq,
                stage_id,
            });
            stage.post(
                &Arc::downgrade(core),
                StageItem::Command(SystemCommand::Join {
                    session: session.clone(),
                    payload: Packet::new(frame.msg_id, frame.payload),
                    reply,
                }),
            );
        }
        SessionState::Authenticating => {
            // The client is expected to wait for the auth reply.
            tracing::warn!(
                session_id = session.session_id(),
                msg_id = %frame.msg_id,
                "message while authenticating, dropped"
            );
        }
        SessionState::Authenticated => {
            let stage_id = frame.stage_id;
            let Some(stage) = core.stages.get(stage_id) else {
                reply_error_to_client(session, &frame, ErrorCode::StageNotFound);
                return;
            };
            let reply = (frame.msg_seq > 0).then(|| ReplyTarget::Client {
                session: session.clone(),
                msg_seq: frame.msg_seq,
                stage_id,
            });
            stage.post(
                &Arc::downgrade(core),
                StageItem::ClientMessage {
                    account_id: session.account_id(),
                    packet: Packet::new(frame.msg_id, frame.payload),
                    reply,
                },
            );
        }
        SessionState::Disconnecting | SessionState::Closed => {}
    }
}

fn reply_error_to_client(session: &SessionHandle, frame: &Frame, code: ErrorCode) {
    if frame.msg_seq > 0 {
        session.send_frame(Frame::with_error(
            frame.msg_id.clone(),
            frame.msg_seq,
            frame.stage_id,
            code.as_u16(),
            Bytes::new(),
        ));
    }
}

/// Route one inbound server envelope: replies to the tracker, API traffic
/// to its handler, everything else onto the addressed stage's queue.
pub(crate) async fn handle_route_packet(core: &Arc<ServerCore>, packet: RoutePacket) {
    core.metrics.record_envelope_received();

    if packet.header.is_reply {
        core.tracker.complete(packet.header.msg_seq, packet.into_packet());
        return;
    }

    if packet.header.service_type == service::API {
        let from_nid = packet.header.from_nid.clone();
        let msg_seq = packet.header.msg_seq;
        let msg_id = packet.header.msg_id.clone();
        match core.api.get(&msg_id) {
            Some(handler) => {
                let sender = ApiSender::new(Arc::downgrade(core), from_nid, msg_seq);
                tokio::spawn(handler(packet.into_packet(), sender));
            }
            None => {
                tracing::warn!(msg_id = %msg_id, from = %from_nid, "no API handler registered");
                reply_error_to_peer(core, &from_nid, msg_seq, &msg_id, ErrorCode::InternalError);
            }
        }
        return;
    }

    let header = packet.header.clone();
    match header.msg_id.as_str() {
        sysmsg::CREATE_STAGE | sysmsg::GET_OR_CREATE_STAGE => {
            let get_or_create = header.msg_id == sysmsg::GET_OR_CREATE_STAGE;
            let request = match CreateStageRequest::from_bytes(&packet.payload) {
                Ok(request) => request,
                Err(e) => {
                    tracing::warn!(from = %header.from_nid, error = %e, "bad create payload");
                    reply_error_to_peer(
                        core,
                        &header.from_nid,
                        header.msg_seq,
                        &header.msg_id,
                        ErrorCode::FrameFormat,
                    );
                    return;
                }
            };
            let stage = match core.stages.get_or_create(
                header.stage_id,
                &request.stage_type,
                &core.factories,
            ) {
                Ok(stage) => stage,
                Err(e) => {
                    reply_error_to_peer(
                        core,
                        &header.from_nid,
                        header.msg_seq,
                        &header.msg_id,
                        e.to_error_code(),
                    );
                    return;
                }
            };
            let reply = header.is_request().then(|| ReplyTarget::Peer {
                nid: header.from_nid.clone(),
                msg_seq: header.msg_seq,
            });
            stage.post(
                &Arc::downgrade(core),
                StageItem::Command(SystemCommand::Create {
                    payload: Bytes::from(request.payload),
                    get_or_create,
                    reply,
                }),
            );
        }
        sysmsg::DESTROY_STAGE => {
            let Some(stage) = core.stages.get(header.stage_id) else {
                reply_error_to_peer(
                    core,
                    &header.from_nid,
                    header.msg_seq,
                    &header.msg_id,
                    ErrorCode::StageNotFound,
                );
                return;
            };
            let reply = header.is_request().then(|| ReplyTarget::Peer {
                nid: header.from_nid.clone(),
                msg_seq: header.msg_seq,
            });
            stage.post(
                &Arc::downgrade(core),
                StageItem::Command(SystemCommand::Destroy { reply }),
            );
        }
        sysmsg::LEAVE_STAGE => {
            let Some(stage) = core.stages.get(header.stage_id) else {
                reply_error_to_peer(
                    core,
                    &header.from_nid,
                    header.msg_seq,
                    &header.msg_id,
                    ErrorCode::StageNotFound,
                );
                return;
            };
            let reply = header.is_request().then(|| ReplyTarget::Peer {
                nid: header.from_nid.clone(),
                msg_seq: header.msg_seq,
            });
            stage.post(
                &Arc::downgrade(core),
                StageItem::Command(SystemCommand::Leave {
                    account_id: header.account_id.clone(),
                    reply,
                }),
            );
        }
        sysmsg::HELLO => {
            // Links re-announcing themselves are harmless.
        }
        _ => {
            let Some(stage) = core.stages.get(header.stage_id) else {
                reply_error_to_peer(
                    core,
                    &header.from_nid,
                    header.msg_seq,
                    &header.msg_id,
                    ErrorCode::StageNotFound,
                );
                return;
            };
            let reply = header.is_request().then(|| ReplyTarget::Peer {
                nid: header.from_nid.clone(),
                msg_seq: header.msg_seq,
            });
            stage.post(
                &Arc::downgrade(core),
                StageItem::ServerMessage {
                    packet: packet.into_packet(),
                    reply,
                },
            );
        }
    }
}

fn reply_error_to_peer(
    core: &Arc<ServerCore>,
    nid: &str,
    msg_seq: u16,
    msg_id: &str,
    code: ErrorCode,
) {
    if msg_seq == 0 {
        return;
    }
    let header = RouteHeader {
        msg_seq,
        service_type: core.config.service_type,
        msg_id: msg_id.to_string(),
        from_nid: core.config.nid.clone(),
        stage_id: 0,
        account_id: String::new(),
        is_reply: true,
        error_code: code.as_u16(),
    };
    if let Err(e) = core.router.send(nid, RoutePacket::new(header, Bytes::new())) {
        core.metrics.record_reply_dropped();
        tracing::warn!(peer = %nid, error = %e, "error reply to peer dropped");
    }
}

/// Fire-and-forget envelope to a peer.
pub(crate) fn send_envelope(
    core: &Arc<ServerCore>,
    nid: &str,
    service_type: u16,
    stage_id: i64,
    packet: Packet,
) -> Result<(), CoreError> {
    let header = RouteHeader {
        msg_seq: 0,
        service_type,
        msg_id: packet.msg_id,
        from_nid: core.config.nid.clone(),
        stage_id,
        account_id: String::new(),
        is_reply: false,
        error_code: packet.error_code,
    };
    core.router.send(nid, RoutePacket::new(header, packet.payload))
}

/// Correlated request envelope to a peer. Registers with the server-scope
/// tracker first, so the reply or timeout always resolves the future; a
/// synchronous send failure unwinds the registration and surfaces as the
/// error.
pub(crate) fn request_envelope(
    core: &Arc<ServerCore>,
    nid: &str,
    service_type: u16,
    stage_id: i64,
    packet: Packet,
) -> Result<ReplyFuture, CoreError> {
    let (msg_seq, reply) = core
        .tracker
        .begin(core.config.request_timeout(), Some(nid.to_string()))?;
    let header = RouteHeader {
        msg_seq,
        service_type,
        msg_id: packet.msg_id,
        from_nid: core.config.nid.clone(),
        stage_id,
        account_id: String::new(),
        is_reply: false,
        error_code: packet.error_code,
    };
    match core.router.send(nid, RoutePacket::new(header, packet.payload)) {
        Ok(()) => Ok(reply),
        Err(e) => {
            core.tracker.abort(msg_seq);
            Err(e)
        }
    }
}
