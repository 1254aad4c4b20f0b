use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use atrium_core::error::CoreError;
use atrium_core::route::{service, RouteHeader, RoutePacket};
use atrium_core::tracker::ReplyFuture;
use atrium_core::Packet;
use futures::future::BoxFuture;

use crate::dispatcher;
use crate::server::ServerCore;

/// One registered API handler. Built by the server builder from an async
/// closure; the core does no reflection, just a msgId lookup.
pub type ApiHandler = Arc<dyn Fn(Packet, ApiSender) -> BoxFuture<'static, ()> + Send + Sync>;

/// Wrap an async closure into an [`ApiHandler`].
pub(crate) fn boxed_handler<F, Fut>(handler: F) -> ApiHandler
where
    F: Fn(Packet, ApiSender) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    Arc::new(move |packet, sender| Box::pin(handler(packet, sender)))
}

/// Capabilities handed to an API handler: answer the caller, or talk to
/// stages and other API services.
pub struct ApiSender {
    server: Weak<ServerCore>,
    from_nid: String,
    msg_seq: u16,
    replied: AtomicBool,
}

impl ApiSender {
    pub(crate) fn new(server: Weak<ServerCore>, from_nid: String, msg_seq: u16) -> Self {
        Self {
            server,
            from_nid,
            msg_seq,
            replied: AtomicBool::new(false),
        }
    }

    /// NID of the server that sent the message being handled.
    pub fn from_nid(&self) -> &str {
        &self.from_nid
    }

    /// Whether the inbound message expects a reply at all.
    pub fn is_request(&self) -> bool {
        self.msg_seq > 0
    }

    /// Answer the caller. At most one reply goes out; later calls warn.
    pub fn reply(&self, packet: Packet) {
        if !self.is_request() {
            tracing::warn!(msg_id = %packet.msg_id, "reply to a one-way API message");
            return;
        }
        if self.replied.swap(true, Ordering::AcqRel) {
            tracing::warn!(msg_id = %packet.msg_id, "duplicate API reply dropped");
            return;
        }
        let Some(core) = self.server.upgrade() else {
            return;
        };
        let header = RouteHeader {
            msg_seq: self.msg_seq,
            service_type: core.config.service_type,
            msg_id: packet.msg_id,
            from_nid: core.config.nid.clone(),
            stage_id: 0,
            account_id: String::new(),
            is_reply: true,
            error_code: packet.error_code,
        };
        if let Err(e) = core
            .router
            .send(&self.from_nid, RoutePacket::new(header, packet.payload))
        {
            core.metrics.record_reply_dropped();
            tracing::warn!(peer = %self.from_nid, error = %e, "API reply dropped");
        }
    }

    pub fn send_to_stage(&self, nid: &str, stage_id: i64, packet: Packet) -> Result<(), CoreError> {
        let core = self.server.upgrade().ok_or(CoreError::ConnectionClosed)?;
        dispatcher::send_envelope(&core, nid, service::PLAY, stage_id, packet)
    }

    pub fn request_to_stage(
        &self,
        nid: &str,
        stage_id: i64,
        packet: Packet,
    ) -> Result<ReplyFuture, CoreError> {
        let core = self.server.upgrade().ok_or(CoreError::ConnectionClosed)?;
        dispatcher::request_envelope(&core, nid, service::PLAY, stage_id, packet)
    }

    pub fn send_to_api(&self, nid: &str, packet: Packet) -> Result<(), CoreError> {
        let core = self.server.upgrade().ok_or(CoreError::ConnectionClosed)?;
        dispatcher::send_envelope(&core, nid, service::API, 0, packet)
    }

    pub fn request_to_api(&self, nid: &str, packet: Packet) -> Result<ReplyFuture, CoreError> {
        let core = self.server.upgrade().ok_or(CoreError::ConnectionClosed)?;
        dispatcher::request_envelope(&core, nid, service::API, 0, packet)
    }
}
