use std::path::Path;
use std::time::Duration;

use atrium_core::error::CoreError;
use atrium_core::frame::DEFAULT_MAX_MESSAGE_SIZE;
use serde::Deserialize;

/// Log output settings, applied by [`crate::logging::init`].
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Env-filter directive used when `RUST_LOG` is unset.
    pub filter: String,
    /// Emit JSON lines instead of the human-readable format.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
            json: false,
        }
    }
}

/// Play server configuration.
///
/// Loadable from YAML; every field has a default so partial files work.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PlayServerConfig {
    /// This server's NID, an opaque unique string such as `"play:1"`.
    pub nid: String,
    /// Numeric service class stamped into outgoing route headers.
    pub service_type: u16,
    /// Host for every listener.
    pub bind_host: String,
    /// TCP client listener port. `None` disables the listener; `Some(0)`
    /// binds an ephemeral port.
    pub tcp_port: Option<u16>,
    /// WebSocket client listener port.
    pub web_socket_port: Option<u16>,
    /// Upgrade path checked during the WebSocket handshake.
    pub web_socket_path: String,
    /// Inter-server listener port.
    pub router_port: Option<u16>,
    /// Deadline for outbound requests.
    pub request_timeout_ms: u64,
    /// Server liveness probe cadence; 0 disables probing.
    pub heartbeat_interval_ms: u64,
    /// Silence after which a session is declared dead; 0 disables.
    pub heartbeat_timeout_ms: u64,
    /// Maximum total frame bytes, length prefix included.
    pub max_message_size: usize,
    /// The only msgId accepted on an unauthenticated session.
    pub authenticate_msg_id: String,
    /// Stage type used when the auth path must create the stage implicitly.
    pub default_stage_type: String,
    /// Items one stage worker processes before yielding the thread.
    pub stage_dispatch_burst: usize,
    /// Game-loop frame-debt cap, as a multiple of the timestep.
    pub game_loop_max_accumulator_factor: u32,
    /// Bound on each peer's outbound envelope queue.
    pub peer_queue_capacity: usize,
    /// How long a disconnecting session may spend flushing its send queue.
    pub drain_timeout_ms: u64,
    /// Log output settings.
    pub logging: LoggingConfig,
}

impl Default for PlayServerConfig {
    fn default() -> Self {
        Self {
            nid: "play:1".to_string(),
            service_type: 1,
            bind_host: "0.0.0.0".to_string(),
            tcp_port: None,
            web_socket_port: None,
            web_socket_path: "/play".to_string(),
            router_port: None,
            request_timeout_ms: 30_000,
            heartbeat_interval_ms: 10_000,
            heartbeat_timeout_ms: 30_000,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            authenticate_msg_id: "Auth".to_string(),
            default_stage_type: String::new(),
            stage_dispatch_burst: 256,
            game_loop_max_accumulator_factor: 5,
            peer_queue_capacity: 65_536,
            drain_timeout_ms: 200,
            logging: LoggingConfig::default(),
        }
    }
}

impl PlayServerConfig {
    pub fn builder() -> PlayServerConfigBuilder {
        PlayServerConfigBuilder::default()
    }

    /// Load from a YAML file. Missing fields fall back to defaults.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, CoreError> {
        let text = std::fs::read_to_string(path)?;
        let config: Self =
            serde_yaml::from_str(&text).map_err(|e| CoreError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        if self.nid.is_empty() {
            return Err(CoreError::InvalidConfig("nid must not be empty".into()));
        }
        if self.authenticate_msg_id.is_empty() {
            return Err(CoreError::InvalidConfig(
                "authenticate_msg_id must not be empty".into(),
            ));
        }
        if self.max_message_size < 1024 {
            return Err(CoreError::InvalidConfig(
                "max_message_size must be at least 1024".into(),
            ));
        }
        if self.stage_dispatch_burst == 0 {
            return Err(CoreError::InvalidConfig(
                "stage_dispatch_burst must be at least 1".into(),
            ));
        }
        if self.game_loop_max_accumulator_factor == 0 {
            return Err(CoreError::InvalidConfig(
                "game_loop_max_accumulator_factor must be at least 1".into(),
            ));
        }
        if self.peer_queue_capacity == 0 {
            return Err(CoreError::InvalidConfig(
                "peer_queue_capacity must be at least 1".into(),
            ));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}

/// Builder for [`PlayServerConfig`].
#[derive(Debug, Default)]
pub struct PlayServerConfigBuilder {
    nid: Option<String>,
    service_type: Option<u16>,
    bind_host: Option<String>,
    tcp_port: Option<Option<u16>>,
    web_socket_port: Option<Option<u16>>,
    web_socket_path: Option<String>,
    router_port: Option<Option<u16>>,
    request_timeout_ms: Option<u64>,
    heartbeat_interval_ms: Option<u64>,
    heartbeat_timeout_ms: Option<u64>,
    max_message_size: Option<usize>,
    authenticate_msg_id: Option<String>,
    default_stage_type: Option<String>,
    stage_dispatch_burst: Option<usize>,
    game_loop_max_accumulator_factor: Option<u32>,
    peer_queue_capacity: Option<usize>,
    drain_timeout_ms: Option<u64>,
    logging: Option<LoggingConfig>,
}

impl PlayServerConfigBuilder {
    pub fn nid(mut self, nid: impl Into<String>) -> Self {
        self.nid = Some(nid.into());
        self
    }

    pub fn service_type(mut self, service_type: u16) -> Self {
        self.service_type = Some(service_type);
        self
    }

    pub fn bind_host(mut self, host: impl Into<String>) -> Self {
        self.bind_host = Some(host.into());
        self
    }

    pub fn tcp_port(mut self, port: u16) -> Self {
        self.tcp_port = Some(Some(port));
        self
    }

    pub fn web_socket_port(mut self, port: u16) -> Self {
        self.web_socket_port = Some(Some(port));
        self
    }

    pub fn web_socket_path(mut self, path: impl Into<String>) -> Self {
        self.web_socket_path = Some(path.into());
        self
    }

    pub fn router_port(mut self, port: u16) -> Self {
        self.router_port = Some(Some(port));
        self
    }

    pub fn request_timeout_ms(mut self, ms: u64) -> Self {
        self.request_timeout_ms = Some(ms);
        self
    }

    pub fn heartbeat_interval_ms(mut self, ms: u64) -> Self {
        self.heartbeat_interval_ms = Some(ms);
        self
    }

    pub fn heartbeat_timeout_ms(mut self, ms: u64) -> Self {
        self.heartbeat_timeout_ms = Some(ms);
        self
    }

    pub fn max_message_size(mut self, bytes: usize) -> Self {
        self.max_message_size = Some(bytes);
        self
    }

    pub fn authenticate_msg_id(mut self, msg_id: impl Into<String>) -> Self {
        self.authenticate_msg_id = Some(msg_id.into());
        self
    }

    pub fn default_stage_type(mut self, stage_type: impl Into<String>) -> Self {
        self.default_stage_type = Some(stage_type.into());
        self
    }

    pub fn stage_dispatch_burst(mut self, burst: usize) -> Self {
        self.stage_dispatch_burst = Some(burst);
        self
    }

    pub fn game_loop_max_accumulator_factor(mut self, factor: u32) -> Self {
        self.game_loop_max_accumulator_factor = Some(factor);
        self
    }

    pub fn peer_queue_capacity(mut self, capacity: usize) -> Self {
        self.peer_queue_capacity = Some(capacity);
        self
    }

    pub fn drain_timeout_ms(mut self, ms: u64) -> Self {
        self.drain_timeout_ms = Some(ms);
        self
    }

    pub fn logging(mut self, logging: LoggingConfig) -> Self {
        self.logging = Some(logging);
        self
    }

    pub fn build(self) -> PlayServerConfig {
        let default = PlayServerConfig::default();
        PlayServerConfig {
            nid: self.nid.unwrap_or(default.nid),
            service_type: self.service_type.unwrap_or(default.service_type),
            bind_host: self.bind_host.unwrap_or(default.bind_host),
            tcp_port: self.tcp_port.unwrap_or(default.tcp_port),
            web_socket_port: self.web_socket_port.unwrap_or(default.web_socket_port),
            web_socket_path: self.web_socket_path.unwrap_or(default.web_socket_path),
            router_port: self.router_port.unwrap_or(default.router_port),
            request_timeout_ms: self.request_timeout_ms.unwrap_or(default.request_timeout_ms),
            heartbeat_interval_ms: self
                .heartbeat_interval_ms
                .unwrap_or(default.heartbeat_interval_ms),
            heartbeat_timeout_ms: self
                .heartbeat_timeout_ms
                .unwrap_or(default.heartbeat_timeout_ms),
            max_message_size: self.max_message_size.unwrap_or(default.max_message_size),
            authenticate_msg_id: self
                .authenticate_msg_id
                .unwrap_or(default.authenticate_msg_id),
            default_stage_type: self.default_stage_type.unwrap_or(default.default_stage_type),
            stage_dispatch_burst: self
                .stage_dispatch_burst
                .unwrap_or(default.stage_dispatch_burst),
            game_loop_max_accumulator_factor: self
                .game_loop_max_accumulator_factor
                .unwrap_or(default.game_loop_max_accumulator_factor),
            peer_queue_capacity: self
                .peer_queue_capacity
                .unwrap_or(default.peer_queue_capacity),
            drain_timeout_ms: self.drain_timeout_ms.unwrap_or(default.drain_timeout_ms),
            logging: self.logging.unwrap_or(default.logging),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = PlayServerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.request_timeout_ms, 30_000);
        assert_eq!(config.heartbeat_interval_ms, 10_000);
        assert_eq!(config.stage_dispatch_burst, 256);
    }

    #[test]
    fn test_builder_overrides() {
        let config = PlayServerConfig::builder()
            .nid("play:7")
            .tcp_port(0)
            .request_timeout_ms(100)
            .stage_dispatch_burst(8)
            .build();

        assert_eq!(config.nid, "play:7");
        assert_eq!(config.tcp_port, Some(0));
        assert_eq!(config.request_timeout(), Duration::from_millis(100));
        // Untouched fields keep defaults
        assert_eq!(config.heartbeat_timeout_ms, 30_000);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let config = PlayServerConfig::builder().authenticate_msg_id("").build();
        assert!(config.validate().is_err());

        let config = PlayServerConfig::builder().max_message_size(16).build();
        assert!(config.validate().is_err());

        let config = PlayServerConfig::builder().stage_dispatch_burst(0).build();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_yaml_partial_file() {
        use std::io::Write;

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "nid: \"play:9\"\ntcp_port: 7777\nlogging:\n  filter: \"warn\"\n"
        )
        .unwrap();

        let config = PlayServerConfig::from_yaml_file(file.path()).unwrap();
        assert_eq!(config.nid, "play:9");
        assert_eq!(config.tcp_port, Some(7777));
        assert_eq!(config.heartbeat_interval_ms, 10_000);
        assert_eq!(config.logging.filter, "warn");
        assert!(!config.logging.json);
    }
}
