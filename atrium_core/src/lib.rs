//! # Atrium Core
//!
//! Wire-level building blocks shared by the play server and the client
//! connector:
//!
//! - the client frame layout and its incremental decoder
//! - the inter-server route envelope
//! - the pending-request tracker that pairs requests with replies
//! - pooled byte buffers and the receive ring buffer
//!
//! Everything here is transport-agnostic: bytes in, frames out. The server
//! and connector crates own the sockets.

pub mod error;
pub mod frame;
pub mod packet;
pub mod pool;
pub mod ring;
pub mod route;
pub mod sequence;
pub mod tracker;

pub use error::{CoreError, ErrorCode};
pub use frame::{Direction, Frame, FrameDecoder, HEARTBEAT_MSG_ID};
pub use packet::Packet;
pub use pool::BufferPool;
pub use route::{RouteHeader, RoutePacket};
pub use tracker::{ReplyFuture, RequestResult, RequestTracker};
