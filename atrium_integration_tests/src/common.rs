use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use atrium_connector::config::ConnectorConfig;
use atrium_connector::connector::Connector;
use atrium_core::frame::{Direction, Frame, FrameDecoder};
use atrium_core::pool::BufferPool;
use atrium_core::{ErrorCode, Packet};
use atrium_server::config::PlayServerConfig;
use atrium_server::server::PlayServer;
use atrium_server::stage::context::StageCtx;
use atrium_server::traits::{Actor, Stage, StageFactory};
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// Observations shared between the test body and the stage callbacks.
#[derive(Default)]
pub struct TestCounters {
    pub joins: AtomicU64,
    pub actor_destroys: AtomicU64,
    pub dispatches: AtomicU64,
    pub server_messages: AtomicU64,
    pub timer_fires: AtomicU64,
    pub ticks: AtomicU64,
    pub connected_events: AtomicU64,
    pub disconnected_events: AtomicU64,
    pub async_results: AtomicU64,
    /// Concurrent entries into stage callbacks; must stay zero.
    pub overlap_violations: AtomicU64,
    in_callback: AtomicBool,
    pub seq_observed: Mutex<Vec<u32>>,
}

impl TestCounters {
    fn enter(&self) -> CallbackGuard<'_> {
        if self.in_callback.swap(true, Ordering::AcqRel) {
            self.overlap_violations.fetch_add(1, Ordering::Relaxed);
        }
        CallbackGuard { counters: self }
    }
}

struct CallbackGuard<'a> {
    counters: &'a TestCounters,
}

impl Drop for CallbackGuard<'_> {
    fn drop(&mut self) {
        self.counters.in_callback.store(false, Ordering::Release);
    }
}

/// The stage type every scenario test talks to. Behavior is keyed by
/// msgId so one registration covers the whole suite.
pub struct TestStage {
    pub counters: Arc<TestCounters>,
}

#[async_trait]
impl Stage for TestStage {
    async fn on_join_stage(&mut self, _ctx: &mut StageCtx<'_>, actor: &mut dyn Actor) -> bool {
        if actor.account_id() == "nojoin" {
            return false;
        }
        self.counters.joins.fetch_add(1, Ordering::Relaxed);
        true
    }

    async fn on_connection_changed(
        &mut self,
        _ctx: &mut StageCtx<'_>,
        _actor: &mut dyn Actor,
        connected: bool,
    ) {
        if connected {
            self.counters.connected_events.fetch_add(1, Ordering::Relaxed);
        } else {
            self.counters.disconnected_events.fetch_add(1, Ordering::Relaxed);
        }
    }

    async fn on_dispatch(&mut self, ctx: &mut StageCtx<'_>, _actor: &mut dyn Actor, packet: Packet) {
        let _guard = self.counters.enter();
        self.counters.dispatches.fetch_add(1, Ordering::Relaxed);

        match packet.msg_id.as_str() {
            "Echo" => {
                ctx.reply(Packet::new("EchoReply", packet.payload));
            }
            "SlowEcho" => {
                tokio::time::sleep(Duration::from_millis(300)).await;
                ctx.reply(Packet::new("EchoReply", packet.payload));
            }
            "NoReply" => {}
            "Panic" => {
                panic!("deliberate test panic");
            }
            "Seq" => {
                if let Ok(text) = std::str::from_utf8(&packet.payload) {
                    if let Ok(value) = text.parse::<u32>() {
                        self.counters.seq_observed.lock().unwrap().push(value);
                    }
                }
            }
            "ActorCount" => {
                ctx.reply(Packet::new(
                    "ActorCountReply",
                    Bytes::from(ctx.actor_count().to_string()),
                ));
            }
            "Shout" => {
                ctx.broadcast(Packet::new("Shouted", packet.payload));
            }
            "StartTimer" => {
                // payload: "initial_ms,period_ms,count" with count 0 = repeat
                let reply = parse_three(&packet.payload).and_then(|(initial, period, count)| {
                    let result = if count == 0 {
                        ctx.add_repeat_timer(
                            Duration::from_millis(initial),
                            Duration::from_millis(period),
                        )
                    } else {
                        ctx.add_count_timer(
                            Duration::from_millis(initial),
                            Duration::from_millis(period),
                            count as u32,
                        )
                    };
                    result.ok()
                });
                match reply {
                    Some(timer_id) => ctx.reply(Packet::new(
                        "TimerStarted",
                        Bytes::from(timer_id.to_string()),
                    )),
                    None => ctx.reply(Packet::error("TimerStarted", ErrorCode::InternalError)),
                }
            }
            "CancelTimer" => {
                let cancelled = std::str::from_utf8(&packet.payload)
                    .ok()
                    .and_then(|text| text.parse::<u64>().ok())
                    .map(|timer_id| ctx.cancel_timer(timer_id))
                    .unwrap_or(false);
                ctx.reply(Packet::new(
                    "TimerCancelled",
                    Bytes::from(cancelled.to_string()),
                ));
            }
            "TimerCount" => {
                ctx.reply(Packet::new(
                    "TimerCountReply",
                    Bytes::from(self.counters.timer_fires.load(Ordering::Relaxed).to_string()),
                ));
            }
            "StartLoop" => {
                // payload: "timestep_ms,max_accumulator_ms"
                let started = parse_two(&packet.payload)
                    .map(|(timestep, max_accum)| {
                        ctx.start_game_loop_with(
                            Duration::from_millis(timestep),
                            Duration::from_millis(max_accum),
                        )
                    })
                    .map(|result| result.is_ok())
                    .unwrap_or(false);
                ctx.reply(Packet::new("LoopStarted", Bytes::from(started.to_string())));
            }
            "StopLoop" => {
                let stopped = ctx.stop_game_loop();
                ctx.reply(Packet::new("LoopStopped", Bytes::from(stopped.to_string())));
            }
            "TickCount" => {
                ctx.reply(Packet::new(
                    "TickCountReply",
                    Bytes::from(self.counters.ticks.load(Ordering::Relaxed).to_string()),
                ));
            }
            "Block" => {
                // Hold the stage worker hostage for the requested time
                let ms = std::str::from_utf8(&packet.payload)
                    .ok()
                    .and_then(|text| text.parse::<u64>().ok())
                    .unwrap_or(0);
                tokio::time::sleep(Duration::from_millis(ms)).await;
            }
            "Kick" => {
                if let Ok(account) = std::str::from_utf8(&packet.payload) {
                    ctx.leave_stage(account);
                }
                ctx.reply(Packet::empty("Kicked"));
            }
            "AsyncWork" => {
                // Slow work runs off the stage; the continuation comes back
                // through the queue with the result.
                let counters = Arc::clone(&self.counters);
                ctx.async_block(
                    async move {
                        tokio::time::sleep(Duration::from_millis(200)).await;
                        42u64
                    },
                    move |_stage: &mut dyn Stage, ctx: &mut StageCtx<'_>, value: u64| {
                        counters.async_results.fetch_add(value, Ordering::Relaxed);
                        ctx.broadcast(Packet::new("AsyncDone", Bytes::new()));
                    },
                );
                ctx.reply(Packet::empty("AsyncStarted"));
            }
            "Relay" => {
                // payload: "nid|stage_id|text" — forward to a peer stage and
                // relay its answer back to the client
                let text = String::from_utf8_lossy(&packet.payload).to_string();
                let mut parts = text.splitn(3, '|');
                let target = match (parts.next(), parts.next(), parts.next()) {
                    (Some(nid), Some(stage_id), Some(body)) => stage_id
                        .parse::<i64>()
                        .ok()
                        .map(|stage_id| (nid.to_string(), stage_id, body.to_string())),
                    _ => None,
                };
                let Some((nid, stage_id, body)) = target else {
                    ctx.reply(Packet::error("RelayReply", ErrorCode::InternalError));
                    return;
                };
                let pending = ctx.request_to_stage(
                    &nid,
                    stage_id,
                    Packet::new("ServerEcho", Bytes::from(body)),
                );
                match pending {
                    Ok(pending) => match pending.await {
                        Ok(reply) => ctx.reply(Packet::new("RelayReply", reply.payload)),
                        Err(e) => ctx.reply(Packet::error("RelayReply", e.to_error_code())),
                    },
                    Err(e) => ctx.reply(Packet::error("RelayReply", e.to_error_code())),
                }
            }
            other => {
                tracing::warn!(msg_id = %other, "unhandled test message");
            }
        }
    }

    async fn on_server_dispatch(&mut self, ctx: &mut StageCtx<'_>, packet: Packet) {
        let _guard = self.counters.enter();
        self.counters.server_messages.fetch_add(1, Ordering::Relaxed);
        if packet.msg_id == "ServerEcho" {
            ctx.reply(Packet::new("ServerEchoReply", packet.payload));
        }
    }

    async fn on_timer(&mut self, _ctx: &mut StageCtx<'_>, _timer_id: u64) {
        let _guard = self.counters.enter();
        self.counters.timer_fires.fetch_add(1, Ordering::Relaxed);
        tokio::task::yield_now().await;
    }

    async fn on_tick(&mut self, _ctx: &mut StageCtx<'_>, _dt: Duration, _total: Duration) {
        let _guard = self.counters.enter();
        self.counters.ticks.fetch_add(1, Ordering::Relaxed);
    }
}

fn parse_two(payload: &[u8]) -> Option<(u64, u64)> {
    let text = std::str::from_utf8(payload).ok()?;
    let mut parts = text.split(',');
    let a = parts.next()?.trim().parse().ok()?;
    let b = parts.next()?.trim().parse().ok()?;
    Some((a, b))
}

fn parse_three(payload: &[u8]) -> Option<(u64, u64, u64)> {
    let text = std::str::from_utf8(payload).ok()?;
    let mut parts = text.split(',');
    let a = parts.next()?.trim().parse().ok()?;
    let b = parts.next()?.trim().parse().ok()?;
    let c = parts.next()?.trim().parse().ok()?;
    Some((a, b, c))
}

/// Auth behavior is keyed by the payload: `reject` fails, `noaccount`
/// succeeds without publishing an account id, anything else becomes the
/// account id.
pub struct TestActor {
    pub account_id: String,
    pub counters: Arc<TestCounters>,
}

#[async_trait]
impl Actor for TestActor {
    fn account_id(&self) -> &str {
        &self.account_id
    }

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }

    async fn on_authenticate(&mut self, packet: &Packet) -> bool {
        match std::str::from_utf8(&packet.payload) {
            Ok("reject") => false,
            Ok("noaccount") => true,
            Ok(account) if !account.is_empty() => {
                self.account_id = account.to_string();
                true
            }
            _ => false,
        }
    }

    async fn on_destroy(&mut self) {
        self.counters.actor_destroys.fetch_add(1, Ordering::Relaxed);
    }
}

/// Baseline config: ephemeral TCP port, heartbeats off, short timeouts.
pub fn test_config(nid: &str) -> PlayServerConfig {
    PlayServerConfig::builder()
        .nid(nid)
        .tcp_port(0)
        .authenticate_msg_id("Auth")
        .default_stage_type("Test")
        .heartbeat_interval_ms(0)
        .heartbeat_timeout_ms(0)
        .request_timeout_ms(2_000)
        .build()
}

/// Start a server hosting the `Test` stage type.
pub async fn start_server(config: PlayServerConfig) -> (PlayServer, Arc<TestCounters>) {
    let counters = Arc::new(TestCounters::default());
    let stage_counters = Arc::clone(&counters);
    let actor_counters = Arc::clone(&counters);
    let server = PlayServer::builder(config)
        .register_stage(StageFactory::new(
            "Test",
            move || {
                Box::new(TestStage {
                    counters: Arc::clone(&stage_counters),
                })
            },
            move || {
                Box::new(TestActor {
                    account_id: String::new(),
                    counters: Arc::clone(&actor_counters),
                })
            },
        ))
        .start()
        .await
        .expect("server start");
    (server, counters)
}

pub fn server_tcp_addr(server: &PlayServer) -> SocketAddr {
    server.tcp_addr().expect("TCP listener")
}

/// A connector whose action queue is pumped from a background task, the
/// way a game loop would.
pub fn pumped_connector(config: ConnectorConfig) -> Connector {
    let connector = Connector::new(config);
    let pump = connector.clone();
    tokio::spawn(async move {
        loop {
            pump.main_thread_action();
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    });
    connector
}

pub fn default_connector() -> Connector {
    pumped_connector(
        ConnectorConfig::builder()
            .request_timeout_ms(2_000)
            .heartbeat_interval_ms(0)
            .heartbeat_timeout_ms(0)
            .build(),
    )
}

/// Connect and authenticate as `account` on `stage_id`.
pub async fn connect_and_auth(addr: SocketAddr, account: &str, stage_id: i64) -> Connector {
    let connector = default_connector();
    connector
        .connect(&addr.to_string())
        .await
        .expect("connect");
    let reply = connector
        .authenticate(stage_id, "Auth", Bytes::from(account.to_string()))
        .await
        .expect("auth transport");
    assert!(reply.is_ok(), "auth rejected: {:?}", reply.error_code());
    connector
}

/// Bare TCP client speaking the frame protocol directly, for tests that
/// need to misbehave (skip auth, stop heartbeating).
pub struct RawClient {
    stream: TcpStream,
    decoder: FrameDecoder,
    buf: Vec<u8>,
}

impl RawClient {
    pub async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.expect("raw connect");
        let _ = stream.set_nodelay(true);
        Self {
            stream,
            decoder: FrameDecoder::new(
                Direction::ServerToClient,
                atrium_core::frame::DEFAULT_MAX_MESSAGE_SIZE,
                BufferPool::new(),
            ),
            buf: vec![0u8; 16 * 1024],
        }
    }

    pub async fn send(&mut self, frame: &Frame) {
        let bytes = frame.encode(Direction::ClientToServer).expect("encode");
        self.stream.write_all(&bytes).await.expect("raw write");
    }

    /// Next non-heartbeat frame within `timeout`.
    pub async fn recv(&mut self, timeout: Duration) -> anyhow::Result<Frame> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(frame) = self.decoder.next_frame()? {
                if frame.is_heartbeat() {
                    continue;
                }
                return Ok(frame);
            }
            let remaining = deadline
                .checked_duration_since(tokio::time::Instant::now())
                .ok_or_else(|| anyhow::anyhow!("recv timed out"))?;
            let n = tokio::time::timeout(remaining, self.stream.read(&mut self.buf)).await??;
            if n == 0 {
                anyhow::bail!("connection closed");
            }
            self.decoder.feed(&self.buf[..n])?;
        }
    }

    /// True if the server closes the connection within `timeout`; frames
    /// arriving in the meantime are discarded.
    pub async fn wait_for_close(&mut self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let Some(remaining) = deadline.checked_duration_since(tokio::time::Instant::now())
            else {
                return false;
            };
            match tokio::time::timeout(remaining, self.stream.read(&mut self.buf)).await {
                Ok(Ok(0)) => return true,
                Ok(Ok(_)) => continue,
                Ok(Err(_)) => return true,
                Err(_) => return false,
            }
        }
    }
}
