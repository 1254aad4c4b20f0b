//! # Atrium Server
//!
//! The play-server half of the framework: client sessions over TCP or
//! WebSocket, per-stage serialized event loops with timers and a
//! fixed-timestep game loop, and a router fabric for talking to peer
//! servers and stateless API services.
//!
//! Application code implements [`Stage`] and [`Actor`], registers the pair
//! under a stage type, and lets the server drive everything else:
//!
//! ```no_run
//! use atrium_server::config::PlayServerConfig;
//! use atrium_server::server::PlayServer;
//! use atrium_server::traits::StageFactory;
//! # use atrium_server::traits::{Stage, Actor};
//! # use atrium_server::stage::context::StageCtx;
//! # use atrium_core::Packet;
//! # #[derive(Default)] struct Lobby;
//! # #[async_trait::async_trait]
//! # impl Stage for Lobby {
//! #     async fn on_dispatch(&mut self, _: &mut StageCtx<'_>, _: &mut dyn Actor, _: Packet) {}
//! # }
//! # #[derive(Default)] struct Player { account_id: String }
//! # #[async_trait::async_trait]
//! # impl Actor for Player {
//! #     fn account_id(&self) -> &str { &self.account_id }
//! #     fn as_any_mut(&mut self) -> &mut dyn std::any::Any { self }
//! #     async fn on_authenticate(&mut self, _: &Packet) -> bool { true }
//! # }
//!
//! # async fn run() -> Result<(), atrium_core::CoreError> {
//! let config = PlayServerConfig::builder()
//!     .nid("play:1")
//!     .tcp_port(7777)
//!     .default_stage_type("Lobby")
//!     .build();
//! let server = PlayServer::builder(config)
//!     .register_stage(StageFactory::new(
//!         "Lobby",
//!         || Box::new(Lobby::default()),
//!         || Box::new(Player::default()),
//!     ))
//!     .start()
//!     .await?;
//! # drop(server);
//! # Ok(())
//! # }
//! ```

pub mod api;
pub mod config;
pub mod logging;
pub mod metrics;
pub mod server;
pub mod stage;
pub mod traits;

mod directory;
mod dispatcher;
mod router;
mod session;
mod transport;

pub use api::ApiSender;
pub use atrium_core::{CoreError, ErrorCode, Packet};
pub use config::{LoggingConfig, PlayServerConfig};
pub use router::{ServerDirectoryEntry, ServerState};
pub use server::{PlayServer, PlayServerBuilder};
pub use stage::context::StageCtx;
pub use traits::{Actor, Stage, StageFactory};
