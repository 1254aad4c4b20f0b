use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, AtomicU16, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use atrium_core::frame::{Direction, Frame, FrameDecoder};
use atrium_core::ErrorCode;
use tokio::sync::{mpsc, Notify};

use crate::dispatcher;
use crate::server::ServerCore;
use crate::stage::{StageItem, SystemCommand};
use crate::transport::{SessionReader, SessionWriter};

/// Session lifecycle. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub(crate) enum SessionState {
    Connected = 0,
    Authenticating = 1,
    Authenticated = 2,
    Disconnecting = 3,
    Closed = 4,
}

impl SessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => SessionState::Connected,
            1 => SessionState::Authenticating,
            2 => SessionState::Authenticated,
            3 => SessionState::Disconnecting,
            _ => SessionState::Closed,
        }
    }
}

pub(crate) enum WriterCmd {
    Frame(Frame),
    Shutdown,
}

/// Shared handle on one client connection.
///
/// The send path is a mailbox: every producer goes through the same
/// unbounded channel into the writer task, so writes are strictly FIFO no
/// matter who sends.
#[derive(Clone)]
pub(crate) struct SessionHandle {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    session_id: u64,
    remote_addr: SocketAddr,
    state: AtomicU8,
    disconnect_reason: AtomicU16,
    account_id: Mutex<String>,
    current_stage_id: AtomicI64,
    epoch: Instant,
    last_inbound_ms: AtomicU64,
    last_heartbeat_sent_ms: AtomicU64,
    tx: mpsc::UnboundedSender<WriterCmd>,
    closing: Notify,
}

impl SessionHandle {
    fn new(session_id: u64, remote_addr: SocketAddr, tx: mpsc::UnboundedSender<WriterCmd>) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                session_id,
                remote_addr,
                state: AtomicU8::new(SessionState::Connected as u8),
                disconnect_reason: AtomicU16::new(0),
                account_id: Mutex::new(String::new()),
                current_stage_id: AtomicI64::new(0),
                epoch: Instant::now(),
                last_inbound_ms: AtomicU64::new(0),
                last_heartbeat_sent_ms: AtomicU64::new(0),
                tx,
                closing: Notify::new(),
            }),
        }
    }

    pub(crate) fn session_id(&self) -> u64 {
        self.inner.session_id
    }

    pub(crate) fn remote_addr(&self) -> SocketAddr {
        self.inner.remote_addr
    }

    pub(crate) fn state(&self) -> SessionState {
        SessionState::from_u8(self.inner.state.load(Ordering::Acquire))
    }

    pub(crate) fn is_authenticated(&self) -> bool {
        self.state() == SessionState::Authenticated
    }

    pub(crate) fn account_id(&self) -> String {
        self.inner.account_id.lock().unwrap().clone()
    }

    pub(crate) fn current_stage_id(&self) -> i64 {
        self.inner.current_stage_id.load(Ordering::Acquire)
    }

    /// Move `connected -> authenticating`. False if the session is past it.
    pub(crate) fn begin_authenticating(&self) -> bool {
        self.inner
            .state
            .compare_exchange(
                SessionState::Connected as u8,
                SessionState::Authenticating as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Publish the account and stage, moving to `authenticated`. The
    /// transition is one-way; a session already disconnecting stays put.
    pub(crate) fn set_authenticated(&self, account_id: &str, stage_id: i64) {
        *self.inner.account_id.lock().unwrap() = account_id.to_string();
        self.inner.current_stage_id.store(stage_id, Ordering::Release);
        let _ = self.inner.state.compare_exchange(
            SessionState::Authenticating as u8,
            SessionState::Authenticated as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Detach from `stage_id` if that is still the bound stage.
    pub(crate) fn clear_stage(&self, stage_id: i64) {
        let _ = self.inner.current_stage_id.compare_exchange(
            stage_id,
            0,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Queue a frame for the writer. False once the writer is gone.
    pub(crate) fn send_frame(&self, frame: Frame) -> bool {
        self.inner.tx.send(WriterCmd::Frame(frame)).is_ok()
    }

    pub(crate) fn mark_inbound(&self) {
        self.inner
            .last_inbound_ms
            .store(self.inner.epoch.elapsed().as_millis() as u64, Ordering::Relaxed);
    }

    pub(crate) fn idle_for(&self) -> Duration {
        let last = self.inner.last_inbound_ms.load(Ordering::Relaxed);
        self.inner.epoch.elapsed().saturating_sub(Duration::from_millis(last))
    }

    pub(crate) fn mark_heartbeat_sent(&self) {
        self.inner
            .last_heartbeat_sent_ms
            .store(self.inner.epoch.elapsed().as_millis() as u64, Ordering::Relaxed);
    }

    pub(crate) fn since_heartbeat_sent(&self) -> Duration {
        let last = self.inner.last_heartbeat_sent_ms.load(Ordering::Relaxed);
        self.inner.epoch.elapsed().saturating_sub(Duration::from_millis(last))
    }

    /// First caller moves the session to `disconnecting` and wakes the
    /// reader; later callers are no-ops. Returns true for the winner.
    pub(crate) fn begin_disconnect(&self, reason: ErrorCode) -> bool {
        loop {
            let current = self.inner.state.load(Ordering::Acquire);
            if current >= SessionState::Disconnecting as u8 {
                return false;
            }
            if self
                .inner
                .state
                .compare_exchange(
                    current,
                    SessionState::Disconnecting as u8,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                self.inner
                    .disconnect_reason
                    .store(reason.as_u16(), Ordering::Release);
                self.inner.closing.notify_one();
                return true;
            }
        }
    }

    pub(crate) fn disconnect_reason(&self) -> ErrorCode {
        ErrorCode::from_u16(self.inner.disconnect_reason.load(Ordering::Acquire))
            .unwrap_or(ErrorCode::ConnectionClosed)
    }

    fn set_closed(&self) {
        self.inner
            .state
            .store(SessionState::Closed as u8, Ordering::Release);
    }

    async fn closed_notified(&self) {
        self.inner.closing.notified().await;
    }
}

/// Own one client connection from accept to teardown.
pub(crate) async fn run_session(
    core: Arc<ServerCore>,
    mut reader: SessionReader,
    writer: SessionWriter,
    remote_addr: SocketAddr,
) {
    let session_id = core.next_session_id.fetch_add(1, Ordering::Relaxed) + 1;
    let (tx, rx) = mpsc::unbounded_channel();
    let session = SessionHandle::new(session_id, remote_addr, tx);
    session.mark_inbound();
    core.sessions.insert(session_id, session.clone());
    core.metrics.record_session_opened();
    tracing::info!(session_id, peer = %remote_addr, "session opened");

    let writer_task = tokio::spawn(write_loop(
        writer,
        rx,
        Arc::clone(&core.metrics),
        core.config.drain_timeout(),
    ));
    let watchdog = tokio::spawn(watchdog_loop(Arc::downgrade(&core), session.clone()));

    read_loop(&core, &session, &mut reader).await;

    // Teardown: whatever ended the read loop has already set a reason.
    session.begin_disconnect(ErrorCode::ConnectionClosed);
    let reason = session.disconnect_reason();
    core.sessions.remove(&session_id);

    // The stage keeps the actor and decides its own policy. The stage
    // binding survives the state transition, so read that rather than the
    // already-past authenticated flag.
    if session.current_stage_id() != 0 {
        let stage_id = session.current_stage_id();
        if let Some(stage) = core.stages.get(stage_id) {
            stage.post(
                &Arc::downgrade(&core),
                StageItem::Command(SystemCommand::DisconnectNotice { session_id }),
            );
        }
    }

    watchdog.abort();
    let _ = session.inner.tx.send(WriterCmd::Shutdown);
    let _ = tokio::time::timeout(
        core.config.drain_timeout() + Duration::from_millis(100),
        writer_task,
    )
    .await;

    session.set_closed();
    core.metrics.record_session_closed();
    tracing::info!(session_id, peer = %remote_addr, reason = %reason, "session closed");
}

async fn read_loop(core: &Arc<ServerCore>, session: &SessionHandle, reader: &mut SessionReader) {
    let mut decoder = FrameDecoder::new(
        Direction::ClientToServer,
        core.config.max_message_size,
        core.buffer_pool.clone(),
    );
    let mut buf = vec![0u8; 16 * 1024];

    loop {
        let chunk = tokio::select! {
            chunk = reader.read_chunk(&mut buf) => chunk,
            _ = session.closed_notified() => return,
        };
        let chunk = match chunk {
            Ok(Some(chunk)) => chunk,
            Ok(None) => {
                session.begin_disconnect(ErrorCode::ConnectionClosed);
                return;
            }
            Err(e) => {
                tracing::debug!(session_id = session.session_id(), error = %e, "read failed");
                session.begin_disconnect(ErrorCode::ConnectionFailed);
                return;
            }
        };

        if let Err(e) = decoder.feed(&chunk) {
            tracing::warn!(session_id = session.session_id(), error = %e, "receive buffer overflow");
            session.begin_disconnect(ErrorCode::FrameFormat);
            return;
        }
        loop {
            match decoder.next_frame() {
                Ok(Some(frame)) => {
                    dispatcher::handle_client_frame(core, session, frame).await;
                    if session.state() >= SessionState::Disconnecting {
                        return;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(session_id = session.session_id(), error = %e, "malformed frame");
                    session.begin_disconnect(ErrorCode::FrameFormat);
                    return;
                }
            }
        }
    }
}

async fn write_loop(
    mut writer: SessionWriter,
    mut rx: mpsc::UnboundedReceiver<WriterCmd>,
    metrics: Arc<crate::metrics::ServerMetrics>,
    drain_timeout: Duration,
) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WriterCmd::Frame(frame) => match frame.encode(Direction::ServerToClient) {
                Ok(bytes) => {
                    if writer.write_chunk(&bytes).await.is_err() {
                        break;
                    }
                    metrics.record_frame_sent(bytes.len());
                }
                Err(e) => {
                    tracing::warn!(error = %e, "outbound frame rejected by encoder");
                }
            },
            WriterCmd::Shutdown => {
                // Flush what was queued before the shutdown, within bounds.
                let deadline = Instant::now() + drain_timeout;
                while let Ok(WriterCmd::Frame(frame)) = rx.try_recv() {
                    if Instant::now() >= deadline {
                        break;
                    }
                    if let Ok(bytes) = frame.encode(Direction::ServerToClient) {
                        if writer.write_chunk(&bytes).await.is_err() {
                            break;
                        }
                        metrics.record_frame_sent(bytes.len());
                    }
                }
                break;
            }
        }
    }
    writer.shutdown().await;
}

/// Probe and silence-timeout clock for one session.
async fn watchdog_loop(core: Weak<ServerCore>, session: SessionHandle) {
    let (interval_ms, timeout_ms) = match core.upgrade() {
        Some(core) => (
            core.config.heartbeat_interval_ms,
            core.config.heartbeat_timeout_ms,
        ),
        None => return,
    };
    if interval_ms == 0 && timeout_ms == 0 {
        return;
    }

    // Granularity fine enough to keep timeout jitter small.
    let smallest = [interval_ms, timeout_ms]
        .into_iter()
        .filter(|&ms| ms > 0)
        .min()
        .unwrap_or(1000);
    let tick = Duration::from_millis((smallest / 10).clamp(25, 1000));

    loop {
        tokio::time::sleep(tick).await;
        let Some(core) = core.upgrade() else {
            return;
        };
        if session.state() >= SessionState::Disconnecting {
            return;
        }
        if timeout_ms > 0 && session.idle_for() > Duration::from_millis(timeout_ms) {
            tracing::warn!(
                session_id = session.session_id(),
                peer = %session.remote_addr(),
                idle_ms = session.idle_for().as_millis() as u64,
                "heartbeat timeout"
            );
            core.metrics.record_heartbeat_timeout();
            session.begin_disconnect(ErrorCode::HeartbeatTimeout);
            return;
        }
        if interval_ms > 0 && session.since_heartbeat_sent() > Duration::from_millis(interval_ms) {
            session.send_frame(Frame::heartbeat());
            session.mark_heartbeat_sent();
        }
    }
}
