use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use atrium_core::error::CoreError;
use atrium_core::frame::{Direction, Frame, FrameDecoder};
use atrium_core::pool::BufferPool;
use atrium_core::tracker::{RequestResult, RequestTracker};
use atrium_core::{ErrorCode, Packet};
use bytes::Bytes;
use rand::Rng;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};

use crate::config::ConnectorConfig;
use crate::metrics::{ConnectorMetrics, ConnectorMetricsSnapshot};
use crate::queue::{Action, ActionQueue};

type PushCallback = Box<dyn FnMut(i64, Packet) + Send>;

#[derive(Default)]
struct Callbacks {
    on_connected: Option<Box<dyn FnMut() + Send>>,
    on_disconnected: Option<Box<dyn FnMut(ErrorCode) + Send>>,
    on_push: Option<PushCallback>,
}

struct ConnHandle {
    tx: mpsc::UnboundedSender<Frame>,
}

struct ConnectorInner {
    config: ConnectorConfig,
    tracker: RequestTracker,
    actions: ActionQueue,
    metrics: Arc<ConnectorMetrics>,
    callbacks: Mutex<Callbacks>,
    conn: Mutex<Option<ConnHandle>>,
    addr: Mutex<Option<String>>,
    /// Bumped per connection; tasks from an older connection notice and die.
    generation: AtomicU64,
    connected: AtomicBool,
    authenticated: AtomicBool,
    reconnecting: AtomicBool,
    manual_disconnect: AtomicBool,
    epoch: Instant,
    last_inbound_ms: AtomicU64,
    last_heartbeat_sent_ms: AtomicU64,
    pool: BufferPool,
}

impl ConnectorInner {
    fn mark_inbound(&self) {
        self.last_inbound_ms
            .store(self.epoch.elapsed().as_millis() as u64, Ordering::Relaxed);
    }

    fn idle_for(&self) -> Duration {
        let last = self.last_inbound_ms.load(Ordering::Relaxed);
        self.epoch.elapsed().saturating_sub(Duration::from_millis(last))
    }

    fn mark_heartbeat_sent(&self) {
        self.last_heartbeat_sent_ms
            .store(self.epoch.elapsed().as_millis() as u64, Ordering::Relaxed);
    }

    fn since_heartbeat_sent(&self) -> Duration {
        let last = self.last_heartbeat_sent_ms.load(Ordering::Relaxed);
        self.epoch.elapsed().saturating_sub(Duration::from_millis(last))
    }

    fn send_frame(&self, frame: Frame) -> Result<(), CoreError> {
        let guard = self.conn.lock().unwrap();
        match guard.as_ref() {
            Some(conn) if self.connected.load(Ordering::Acquire) => {
                conn.tx.send(frame).map_err(|_| CoreError::ConnectionClosed)
            }
            _ => Err(CoreError::ConnectionClosed),
        }
    }
}

/// The client connector.
///
/// Thread-safe and clonable; the application's view is single-threaded
/// because every callback runs inside [`main_thread_action`]
/// (Connector::main_thread_action), on whichever thread calls it.
#[derive(Clone)]
pub struct Connector {
    inner: Arc<ConnectorInner>,
}

impl Connector {
    pub fn new(config: ConnectorConfig) -> Self {
        let capacity = config.action_queue_capacity;
        let metrics = Arc::new(ConnectorMetrics::new());
        Self {
            inner: Arc::new(ConnectorInner {
                config,
                tracker: RequestTracker::new(),
                actions: ActionQueue::new(capacity, Arc::clone(&metrics)),
                metrics,
                callbacks: Mutex::new(Callbacks::default()),
                conn: Mutex::new(None),
                addr: Mutex::new(None),
                generation: AtomicU64::new(0),
                connected: AtomicBool::new(false),
                authenticated: AtomicBool::new(false),
                reconnecting: AtomicBool::new(false),
                manual_disconnect: AtomicBool::new(false),
                epoch: Instant::now(),
                last_inbound_ms: AtomicU64::new(0),
                last_heartbeat_sent_ms: AtomicU64::new(0),
                pool: BufferPool::new(),
            }),
        }
    }

    /// Dial the server. A `Connected` event is queued for the next
    /// [`main_thread_action`](Self::main_thread_action).
    pub async fn connect(&self, addr: &str) -> Result<(), CoreError> {
        if self.is_connected() {
            return Ok(());
        }
        self.inner.manual_disconnect.store(false, Ordering::Release);
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| CoreError::ConnectionFailed(e.to_string()))?;
        let _ = stream.set_nodelay(true);
        *self.inner.addr.lock().unwrap() = Some(addr.to_string());
        install_connection(&self.inner, stream);
        self.inner.actions.push(Action::Connected);
        tracing::info!(addr, "connector connected");
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::Acquire)
    }

    pub fn is_authenticated(&self) -> bool {
        self.inner.authenticated.load(Ordering::Acquire)
    }

    /// Close the connection locally. Suppresses auto-reconnect.
    pub fn disconnect(&self) {
        self.inner.manual_disconnect.store(true, Ordering::Release);
        let generation = self.inner.generation.load(Ordering::Acquire);
        handle_disconnect(&self.inner, generation, ErrorCode::ConnectionClosed);
    }

    /// Fire-and-forget to the bound stage.
    pub fn send(&self, stage_id: i64, packet: Packet) -> Result<(), CoreError> {
        self.inner
            .send_frame(Frame::new(packet.msg_id, 0, stage_id, packet.payload))
    }

    /// Request with a callback. The callback fires exactly once — reply,
    /// typed error, or timeout — from inside
    /// [`main_thread_action`](Self::main_thread_action).
    pub fn request<F>(&self, stage_id: i64, packet: Packet, callback: F) -> Result<(), CoreError>
    where
        F: FnOnce(RequestResult) + Send + 'static,
    {
        let (seq, reply) = self
            .inner
            .tracker
            .begin(self.inner.config.request_timeout(), None)?;
        let frame = Frame::new(packet.msg_id, seq, stage_id, packet.payload);
        match self.inner.send_frame(frame) {
            Ok(()) => {
                let inner = Arc::clone(&self.inner);
                tokio::spawn(async move {
                    let result = reply.await;
                    inner
                        .actions
                        .push(Action::Complete(Box::new(move || callback(result))));
                });
                Ok(())
            }
            Err(e) => {
                self.inner.tracker.abort(seq);
                Err(e)
            }
        }
    }

    /// Awaitable request. Resolution still happens on the action queue, so
    /// something must be driving [`main_thread_action`](Self::main_thread_action)
    /// while awaiting.
    pub async fn request_async(&self, stage_id: i64, packet: Packet) -> RequestResult {
        let (tx, rx) = oneshot::channel();
        self.request(stage_id, packet, move |result| {
            let _ = tx.send(result);
        })?;
        match rx.await {
            Ok(result) => result,
            Err(_) => Err(CoreError::ConnectionClosed),
        }
    }

    /// Authenticate against `stage_id` with the server's configured auth
    /// msgId. A success reply marks the connector authenticated.
    pub async fn authenticate(
        &self,
        stage_id: i64,
        msg_id: &str,
        payload: Bytes,
    ) -> RequestResult {
        let result = self
            .request_async(stage_id, Packet::new(msg_id, payload))
            .await;
        if let Ok(packet) = &result {
            if packet.is_ok() {
                self.inner.authenticated.store(true, Ordering::Release);
            }
        }
        result
    }

    /// Drain the action queue, invoking callbacks on the calling thread.
    /// Returns how many actions ran.
    pub fn main_thread_action(&self) -> usize {
        let mut count = 0usize;
        while let Some(action) = self.inner.actions.pop() {
            count += 1;
            match action {
                Action::Connected => self.invoke_connected(),
                Action::Disconnected(reason) => self.invoke_disconnected(reason),
                Action::Push { stage_id, packet } => self.invoke_push(stage_id, packet),
                Action::Complete(deliver) => deliver(),
            }
        }
        count
    }

    fn invoke_connected(&self) {
        let callback = self.inner.callbacks.lock().unwrap().on_connected.take();
        if let Some(mut callback) = callback {
            callback();
            let mut guard = self.inner.callbacks.lock().unwrap();
            if guard.on_connected.is_none() {
                guard.on_connected = Some(callback);
            }
        }
    }

    fn invoke_disconnected(&self, reason: ErrorCode) {
        let callback = self.inner.callbacks.lock().unwrap().on_disconnected.take();
        if let Some(mut callback) = callback {
            callback(reason);
            let mut guard = self.inner.callbacks.lock().unwrap();
            if guard.on_disconnected.is_none() {
                guard.on_disconnected = Some(callback);
            }
        }
    }

    fn invoke_push(&self, stage_id: i64, packet: Packet) {
        let callback = self.inner.callbacks.lock().unwrap().on_push.take();
        if let Some(mut callback) = callback {
            callback(stage_id, packet);
            let mut guard = self.inner.callbacks.lock().unwrap();
            if guard.on_push.is_none() {
                guard.on_push = Some(callback);
            }
        } else {
            tracing::debug!(stage_id, "push message with no handler");
        }
    }

    pub fn set_on_connected(&self, callback: impl FnMut() + Send + 'static) {
        self.inner.callbacks.lock().unwrap().on_connected = Some(Box::new(callback));
    }

    pub fn set_on_disconnected(&self, callback: impl FnMut(ErrorCode) + Send + 'static) {
        self.inner.callbacks.lock().unwrap().on_disconnected = Some(Box::new(callback));
    }

    pub fn set_on_push(&self, callback: impl FnMut(i64, Packet) + Send + 'static) {
        self.inner.callbacks.lock().unwrap().on_push = Some(Box::new(callback));
    }

    /// Actions waiting for the next drain.
    pub fn pending_actions(&self) -> usize {
        self.inner.actions.len()
    }

    /// Actions shed by queue overflow since creation.
    pub fn dropped_actions(&self) -> u64 {
        self.inner.metrics.shed_actions.load(Ordering::Relaxed)
    }

    /// Replies that arrived after their request timed out.
    pub fn late_replies(&self) -> u64 {
        self.inner.tracker.late_replies()
    }

    /// Requests that hit their deadline.
    pub fn request_timeouts(&self) -> u64 {
        self.inner.tracker.timeouts()
    }

    /// Full counter snapshot, tracker scope included.
    pub fn metrics(&self) -> ConnectorMetricsSnapshot {
        let mut snapshot = self.inner.metrics.snapshot();
        snapshot.request_timeouts = self.inner.tracker.timeouts();
        snapshot.late_replies = self.inner.tracker.late_replies();
        snapshot
    }
}

fn install_connection(inner: &Arc<ConnectorInner>, stream: TcpStream) {
    let generation = inner.generation.fetch_add(1, Ordering::AcqRel) + 1;
    let (read_half, write_half) = stream.into_split();
    let (tx, rx) = mpsc::unbounded_channel();

    inner.mark_inbound();
    inner.mark_heartbeat_sent();
    *inner.conn.lock().unwrap() = Some(ConnHandle { tx });
    inner.connected.store(true, Ordering::Release);

    tokio::spawn(run_reader(Arc::clone(inner), generation, read_half));
    tokio::spawn(run_writer(Arc::clone(inner), generation, write_half, rx));
    tokio::spawn(run_heartbeat(Arc::clone(inner), generation));
}

/// Single-fire teardown for one connection generation. Stale tasks from a
/// superseded connection fall through without touching anything.
fn handle_disconnect(inner: &Arc<ConnectorInner>, generation: u64, reason: ErrorCode) {
    if inner.generation.load(Ordering::Acquire) != generation {
        return;
    }
    if !inner.connected.swap(false, Ordering::AcqRel) {
        return;
    }
    *inner.conn.lock().unwrap() = None;
    inner.authenticated.store(false, Ordering::Release);
    // In-flight requests resolve as closed; their waiter tasks route the
    // failures through the action queue like any other completion.
    inner.tracker.cancel_all();
    inner.actions.push(Action::Disconnected(reason));
    tracing::info!(reason = %reason, "connector disconnected");

    if inner.config.auto_reconnect && !inner.manual_disconnect.load(Ordering::Acquire) {
        tokio::spawn(run_reconnect(Arc::clone(inner)));
    }
}

async fn run_reader(inner: Arc<ConnectorInner>, generation: u64, mut read_half: OwnedReadHalf) {
    let mut decoder = FrameDecoder::new(
        Direction::ServerToClient,
        inner.config.max_message_size,
        inner.pool.clone(),
    );
    let mut buf = vec![0u8; 16 * 1024];

    loop {
        if inner.generation.load(Ordering::Acquire) != generation {
            return;
        }
        match read_half.read(&mut buf).await {
            Ok(0) => {
                handle_disconnect(&inner, generation, ErrorCode::ConnectionClosed);
                return;
            }
            Ok(n) => {
                if decoder.feed(&buf[..n]).is_err() {
                    handle_disconnect(&inner, generation, ErrorCode::FrameFormat);
                    return;
                }
                loop {
                    match decoder.next_frame() {
                        Ok(Some(frame)) => handle_frame(&inner, frame),
                        Ok(None) => break,
                        Err(e) => {
                            tracing::warn!(error = %e, "malformed server frame");
                            handle_disconnect(&inner, generation, ErrorCode::FrameFormat);
                            return;
                        }
                    }
                }
            }
            Err(_) => {
                handle_disconnect(&inner, generation, ErrorCode::ConnectionFailed);
                return;
            }
        }
    }
}

fn handle_frame(inner: &Arc<ConnectorInner>, frame: Frame) {
    inner.mark_inbound();
    inner
        .metrics
        .record_frame_received(frame.encoded_len(Direction::ServerToClient));
    if frame.is_heartbeat() {
        // Liveness only; our own cadence keeps the server's clock fresh.
        return;
    }
    let packet = Packet {
        msg_id: frame.msg_id,
        error_code: frame.error_code,
        payload: frame.payload,
    };
    if frame.msg_seq > 0 {
        inner.tracker.complete(frame.msg_seq, packet);
    } else {
        inner.actions.push(Action::Push {
            stage_id: frame.stage_id,
            packet,
        });
    }
}

async fn run_writer(
    inner: Arc<ConnectorInner>,
    generation: u64,
    mut write_half: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<Frame>,
) {
    while let Some(frame) = rx.recv().await {
        match frame.encode(Direction::ClientToServer) {
            Ok(bytes) => {
                if write_half.write_all(&bytes).await.is_err() {
                    handle_disconnect(&inner, generation, ErrorCode::ConnectionFailed);
                    break;
                }
                inner.metrics.record_frame_sent(bytes.len());
            }
            Err(e) => {
                tracing::warn!(error = %e, "outbound frame rejected by encoder");
            }
        }
    }
    let _ = write_half.shutdown().await;
}

async fn run_heartbeat(inner: Arc<ConnectorInner>, generation: u64) {
    let interval_ms = inner.config.heartbeat_interval_ms;
    let timeout_ms = inner.config.heartbeat_timeout_ms;
    if interval_ms == 0 && timeout_ms == 0 {
        return;
    }
    let smallest = [interval_ms, timeout_ms]
        .into_iter()
        .filter(|&ms| ms > 0)
        .min()
        .unwrap_or(1000);
    let tick = Duration::from_millis((smallest / 10).clamp(25, 1000));

    loop {
        tokio::time::sleep(tick).await;
        if inner.generation.load(Ordering::Acquire) != generation
            || !inner.connected.load(Ordering::Acquire)
        {
            return;
        }
        if timeout_ms > 0 && inner.idle_for() > Duration::from_millis(timeout_ms) {
            tracing::warn!(
                idle_ms = inner.idle_for().as_millis() as u64,
                "server went silent"
            );
            inner.metrics.record_heartbeat_timeout();
            handle_disconnect(&inner, generation, ErrorCode::HeartbeatTimeout);
            return;
        }
        if interval_ms > 0 && inner.since_heartbeat_sent() > Duration::from_millis(interval_ms) {
            if inner.send_frame(Frame::heartbeat()).is_ok() {
                inner.mark_heartbeat_sent();
            }
        }
    }
}

/// Exponential backoff with a random spread so reconnect storms from many
/// clients do not line up.
fn backoff_delay(base_ms: u64, max_ms: u64, attempt: u32) -> Duration {
    let shift = attempt.min(16);
    let raw = base_ms.saturating_mul(1u64 << shift).min(max_ms.max(base_ms));
    let jitter = rand::thread_rng().gen_range(0..250);
    Duration::from_millis(raw + jitter)
}

async fn run_reconnect(inner: Arc<ConnectorInner>) {
    if inner.reconnecting.swap(true, Ordering::AcqRel) {
        return;
    }
    let mut attempt: u32 = 0;
    loop {
        if inner.manual_disconnect.load(Ordering::Acquire)
            || inner.connected.load(Ordering::Acquire)
        {
            break;
        }
        let delay = backoff_delay(
            inner.config.reconnect_base_delay_ms,
            inner.config.reconnect_max_delay_ms,
            attempt,
        );
        tokio::time::sleep(delay).await;
        let addr = match inner.addr.lock().unwrap().clone() {
            Some(addr) => addr,
            None => break,
        };
        match TcpStream::connect(&addr).await {
            Ok(stream) => {
                let _ = stream.set_nodelay(true);
                install_connection(&inner, stream);
                inner.metrics.record_reconnect();
                inner.actions.push(Action::Connected);
                tracing::info!(addr = %addr, attempt, "reconnected");
                break;
            }
            Err(e) => {
                attempt = attempt.saturating_add(1);
                tracing::debug!(addr = %addr, attempt, error = %e, "reconnect attempt failed");
            }
        }
    }
    inner.reconnecting.store(false, Ordering::Release);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_growth_and_cap() {
        let base = 500;
        let max = 15_000;
        let first = backoff_delay(base, max, 0).as_millis() as u64;
        assert!((500..750).contains(&first));

        let sixth = backoff_delay(base, max, 6).as_millis() as u64;
        // 500 * 64 = 32000, capped at 15000 (+ jitter)
        assert!((15_000..15_250).contains(&sixth));

        // Huge attempts must not overflow
        let big = backoff_delay(base, max, u32::MAX).as_millis() as u64;
        assert!(big <= 15_250);
    }

    #[tokio::test]
    async fn test_send_when_disconnected() {
        let connector = Connector::new(ConnectorConfig::default());
        let err = connector
            .send(1, Packet::empty("Ping"))
            .expect_err("should fail while disconnected");
        assert!(matches!(err, CoreError::ConnectionClosed));
    }

    #[tokio::test]
    async fn test_request_when_disconnected_aborts_tracking() {
        let connector = Connector::new(ConnectorConfig::default());
        let err = connector
            .request(1, Packet::empty("Ping"), |_| {})
            .expect_err("should fail while disconnected");
        assert!(matches!(err, CoreError::ConnectionClosed));
        // The aborted registration leaves nothing pending
        assert_eq!(connector.inner.tracker.pending_len(), 0);
    }
}
