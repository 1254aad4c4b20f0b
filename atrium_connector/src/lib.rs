//! # Atrium Connector
//!
//! The client-side counterpart of the play server: same framing, same
//! heartbeat contract, plus a pending-request table and a main-thread
//! action queue.
//!
//! Every completion — request callbacks, push messages, connect and
//! disconnect events — is delivered when the application calls
//! [`Connector::main_thread_action`], typically once per frame of its own
//! loop. Nothing user-visible runs on the connector's internal tasks.

pub mod config;
pub mod connector;
pub mod metrics;

mod queue;

pub use atrium_core::{CoreError, ErrorCode, Packet};
pub use config::{ConnectorConfig, ConnectorConfigBuilder};
pub use connector::Connector;
pub use metrics::ConnectorMetricsSnapshot;
