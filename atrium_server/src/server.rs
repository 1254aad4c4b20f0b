use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Duration;

use atrium_core::error::CoreError;
use atrium_core::pool::BufferPool;
use atrium_core::route::{service, sysmsg, CreateStageRequest};
use atrium_core::tracker::{ReplyFuture, RequestTracker};
use atrium_core::{ErrorCode, Packet};
use bytes::Bytes;
use dashmap::DashMap;
use futures::StreamExt;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;

use crate::api::{boxed_handler, ApiHandler, ApiSender};
use crate::config::PlayServerConfig;
use crate::directory::StageDirectory;
use crate::dispatcher;
use crate::metrics::{MetricsSnapshot, ServerMetrics};
use crate::router::{Router, ServerDirectory, ServerDirectoryEntry};
use crate::session::{self, SessionHandle};
use crate::stage::{ReplyTarget, StageItem, SystemCommand};
use crate::traits::StageFactory;
use crate::transport::{SessionReader, SessionWriter};

/// Everything the running server shares between its tasks. Stages, timers
/// and peer tasks hold this weakly; the [`PlayServer`] owns the only strong
/// root, so dropping the server unwinds the whole tree.
pub(crate) struct ServerCore {
    pub config: PlayServerConfig,
    pub sessions: DashMap<u64, SessionHandle>,
    pub next_session_id: AtomicU64,
    pub next_timer_id: AtomicU64,
    pub stages: StageDirectory,
    pub factories: HashMap<String, Arc<StageFactory>>,
    pub api: HashMap<String, ApiHandler>,
    pub router: Router,
    pub tracker: RequestTracker,
    pub peer_directory: ServerDirectory,
    pub buffer_pool: BufferPool,
    pub metrics: Arc<ServerMetrics>,
}

/// Staged configuration for a [`PlayServer`].
pub struct PlayServerBuilder {
    config: PlayServerConfig,
    factories: HashMap<String, Arc<StageFactory>>,
    api: HashMap<String, ApiHandler>,
}

impl PlayServerBuilder {
    pub fn new(config: PlayServerConfig) -> Self {
        Self {
            config,
            factories: HashMap::new(),
            api: HashMap::new(),
        }
    }

    /// Register a stage type. The factory's type name is the key clients
    /// and peers create stages by.
    pub fn register_stage(mut self, factory: StageFactory) -> Self {
        self.factories
            .insert(factory.stage_type().to_string(), Arc::new(factory));
        self
    }

    /// Register an API handler for one msgId.
    pub fn register_api<F, Fut>(mut self, msg_id: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Packet, ApiSender) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        self.api.insert(msg_id.into(), boxed_handler(handler));
        self
    }

    /// Validate, bind every configured listener, and start serving.
    pub async fn start(self) -> Result<PlayServer, CoreError> {
        self.config.validate()?;
        let config = self.config;
        let factories = self.factories;
        let api = self.api;
        let peer_queue_capacity = config.peer_queue_capacity;

        let core = Arc::new_cyclic(|weak| ServerCore {
            config,
            sessions: DashMap::new(),
            next_session_id: AtomicU64::new(0),
            next_timer_id: AtomicU64::new(0),
            stages: StageDirectory::new(),
            factories,
            api,
            router: Router::new(weak.clone(), peer_queue_capacity),
            tracker: RequestTracker::new(),
            peer_directory: ServerDirectory::new(),
            buffer_pool: BufferPool::new(),
            metrics: Arc::new(ServerMetrics::new()),
        });

        let mut tasks = Vec::new();
        let mut tcp_addr = None;
        let mut ws_addr = None;
        let mut router_addr = None;

        if let Some(port) = core.config.tcp_port {
            let listener = TcpListener::bind((core.config.bind_host.as_str(), port)).await?;
            let addr = listener.local_addr()?;
            tracing::info!(addr = %addr, "TCP listener open");
            tcp_addr = Some(addr);
            tasks.push(tokio::spawn(accept_tcp_loop(Arc::clone(&core), listener)));
        }

        if let Some(port) = core.config.web_socket_port {
            let listener = TcpListener::bind((core.config.bind_host.as_str(), port)).await?;
            let addr = listener.local_addr()?;
            tracing::info!(addr = %addr, path = %core.config.web_socket_path, "WebSocket listener open");
            ws_addr = Some(addr);
            tasks.push(tokio::spawn(accept_ws_loop(Arc::clone(&core), listener)));
        }

        if let Some(port) = core.config.router_port {
            let (addr, task) = core.router.listen(&core.config.bind_host, port).await?;
            router_addr = Some(addr);
            tasks.push(task);
        }

        tracing::info!(nid = %core.config.nid, "play server started");
        Ok(PlayServer {
            core,
            tasks,
            tcp_addr,
            ws_addr,
            router_addr,
        })
    }
}

async fn accept_tcp_loop(core: Arc<ServerCore>, listener: TcpListener) {
    loop {
        match listener.accept().await {
            Ok((stream, peer_addr)) => {
                let _ = stream.set_nodelay(true);
                let (read_half, write_half) = stream.into_split();
                let core = Arc::clone(&core);
                tokio::spawn(session::run_session(
                    core,
                    SessionReader::Tcp(read_half),
                    SessionWriter::Tcp(write_half),
                    peer_addr,
                ));
            }
            Err(e) => {
                tracing::warn!(error = %e, "TCP accept failed");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

async fn accept_ws_loop(core: Arc<ServerCore>, listener: TcpListener) {
    loop {
        match listener.accept().await {
            Ok((stream, peer_addr)) => {
                let _ = stream.set_nodelay(true);
                let core = Arc::clone(&core);
                tokio::spawn(async move {
                    let expected_path = core.config.web_socket_path.clone();
                    let check_path = move |request: &Request, response: Response| {
                        if request.uri().path() == expected_path {
                            Ok(response)
                        } else {
                            let mut rejected = ErrorResponse::new(None);
                            *rejected.status_mut() = StatusCode::NOT_FOUND;
                            Err(rejected)
                        }
                    };
                    match tokio_tungstenite::accept_hdr_async(stream, check_path).await {
                        Ok(ws) => {
                            let (sink, stream) = ws.split();
                            session::run_session(
                                core,
                                SessionReader::Ws(stream),
                                SessionWriter::Ws(sink),
                                peer_addr,
                            )
                            .await;
                        }
                        Err(e) => {
                            tracing::debug!(peer = %peer_addr, error = %e, "WebSocket handshake failed");
                        }
                    }
                });
            }
            Err(e) => {
                tracing::warn!(error = %e, "WebSocket accept failed");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

/// A running play server.
pub struct PlayServer {
    core: Arc<ServerCore>,
    tasks: Vec<JoinHandle<()>>,
    tcp_addr: Option<SocketAddr>,
    ws_addr: Option<SocketAddr>,
    router_addr: Option<SocketAddr>,
}

impl PlayServer {
    pub fn builder(config: PlayServerConfig) -> PlayServerBuilder {
        PlayServerBuilder::new(config)
    }

    pub fn nid(&self) -> &str {
        &self.core.config.nid
    }

    pub fn tcp_addr(&self) -> Option<SocketAddr> {
        self.tcp_addr
    }

    pub fn ws_addr(&self) -> Option<SocketAddr> {
        self.ws_addr
    }

    pub fn router_addr(&self) -> Option<SocketAddr> {
        self.router_addr
    }

    /// Replace the peer directory with the system controller's view.
    pub fn update_server_directory(&self, entries: Vec<ServerDirectoryEntry>) {
        self.core.peer_directory.update(entries);
    }

    pub fn server_directory(&self) -> Vec<ServerDirectoryEntry> {
        self.core.peer_directory.snapshot()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.core.metrics.snapshot()
    }

    /// Late replies counted by the server-scope request tracker.
    pub fn late_replies(&self) -> u64 {
        self.core.tracker.late_replies()
    }

    /// Requests that hit their deadline on the server scope.
    pub fn request_timeouts(&self) -> u64 {
        self.core.tracker.timeouts()
    }

    pub fn session_count(&self) -> usize {
        self.core.sessions.len()
    }

    pub fn stage_count(&self) -> usize {
        self.core.stages.len()
    }

    pub fn has_stage(&self, stage_id: i64) -> bool {
        self.core.stages.contains(stage_id)
    }

    /// Strict local create: exactly one caller sees success, the rest get
    /// `StageAlreadyExists` in the reply's error code.
    pub async fn create_stage(
        &self,
        stage_type: &str,
        stage_id: i64,
        payload: Bytes,
    ) -> Result<Packet, CoreError> {
        self.create_stage_inner(stage_type, stage_id, payload, false)
            .await
    }

    /// Local get-or-create: the reply payload says whether this call won
    /// the creation.
    pub async fn get_or_create_stage(
        &self,
        stage_type: &str,
        stage_id: i64,
        payload: Bytes,
    ) -> Result<Packet, CoreError> {
        self.create_stage_inner(stage_type, stage_id, payload, true)
            .await
    }

    async fn create_stage_inner(
        &self,
        stage_type: &str,
        stage_id: i64,
        payload: Bytes,
        get_or_create: bool,
    ) -> Result<Packet, CoreError> {
        let stage = self
            .core
            .stages
            .get_or_create(stage_id, stage_type, &self.core.factories)?;
        let (tx, rx) = oneshot::channel();
        stage.post(
            &Arc::downgrade(&self.core),
            StageItem::Command(SystemCommand::Create {
                payload,
                get_or_create,
                reply: Some(ReplyTarget::Local { tx }),
            }),
        );
        rx.await.map_err(|_| CoreError::ConnectionClosed)
    }

    /// Tear a local stage down.
    pub async fn destroy_stage(&self, stage_id: i64) -> Result<Packet, CoreError> {
        let stage = self
            .core
            .stages
            .get(stage_id)
            .ok_or(CoreError::StageNotFound(stage_id))?;
        let (tx, rx) = oneshot::channel();
        stage.post(
            &Arc::downgrade(&self.core),
            StageItem::Command(SystemCommand::Destroy {
                reply: Some(ReplyTarget::Local { tx }),
            }),
        );
        rx.await.map_err(|_| CoreError::ConnectionClosed)
    }

    /// Fire-and-forget to a stage hosted by a peer server.
    pub fn send_to_stage(
        &self,
        nid: &str,
        stage_id: i64,
        packet: Packet,
    ) -> Result<(), CoreError> {
        dispatcher::send_envelope(&self.core, nid, service::PLAY, stage_id, packet)
    }

    /// Request to a stage hosted by a peer server.
    pub fn request_to_stage(
        &self,
        nid: &str,
        stage_id: i64,
        packet: Packet,
    ) -> Result<ReplyFuture, CoreError> {
        dispatcher::request_envelope(&self.core, nid, service::PLAY, stage_id, packet)
    }

    /// Ask a peer to create a stage, supplying the type for first creation.
    pub fn request_create_stage(
        &self,
        nid: &str,
        stage_type: &str,
        stage_id: i64,
        payload: Bytes,
    ) -> Result<ReplyFuture, CoreError> {
        let request = CreateStageRequest {
            stage_type: stage_type.to_string(),
            payload: payload.to_vec(),
        };
        let packet = Packet::new(sysmsg::CREATE_STAGE, request.to_bytes()?);
        dispatcher::request_envelope(&self.core, nid, service::PLAY, stage_id, packet)
    }

    pub fn send_to_api(&self, nid: &str, packet: Packet) -> Result<(), CoreError> {
        dispatcher::send_envelope(&self.core, nid, service::API, 0, packet)
    }

    pub fn request_to_api(&self, nid: &str, packet: Packet) -> Result<ReplyFuture, CoreError> {
        dispatcher::request_envelope(&self.core, nid, service::API, 0, packet)
    }

    /// Stop listeners, close sessions, destroy stages, and fail whatever
    /// was still pending.
    pub async fn shutdown(self) {
        tracing::info!(nid = %self.core.config.nid, "play server shutting down");
        for task in &self.tasks {
            task.abort();
        }
        for entry in self.core.sessions.iter() {
            entry.value().begin_disconnect(ErrorCode::ConnectionClosed);
        }
        for stage_id in self.core.stages.ids() {
            if let Some(stage) = self.core.stages.get(stage_id) {
                stage.post(
                    &Arc::downgrade(&self.core),
                    StageItem::Command(SystemCommand::Destroy { reply: None }),
                );
            }
        }
        self.core.tracker.cancel_all();
        self.core.router.shutdown();

        // Bounded wait for sessions and stages to finish their teardown.
        let deadline = tokio::time::Instant::now()
            + self.core.config.drain_timeout()
            + Duration::from_millis(200);
        while (self.core.sessions.len() > 0 || self.core.stages.len() > 0)
            && tokio::time::Instant::now() < deadline
        {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}
