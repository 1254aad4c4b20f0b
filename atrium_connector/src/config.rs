use std::time::Duration;

use atrium_core::frame::DEFAULT_MAX_MESSAGE_SIZE;

/// Connector configuration. Mirrors the server's session knobs.
#[derive(Debug, Clone)]
pub struct ConnectorConfig {
    /// Deadline for outbound requests.
    pub request_timeout_ms: u64,
    /// Heartbeat send cadence; 0 disables.
    pub heartbeat_interval_ms: u64,
    /// Silence after which the connection is declared dead; 0 disables.
    pub heartbeat_timeout_ms: u64,
    /// Maximum total frame bytes accepted from the server.
    pub max_message_size: usize,
    /// Redial automatically after an unexpected disconnect.
    pub auto_reconnect: bool,
    /// First reconnect delay; doubles per attempt.
    pub reconnect_base_delay_ms: u64,
    /// Ceiling for the reconnect delay.
    pub reconnect_max_delay_ms: u64,
    /// Cap on queued main-thread actions before the oldest are shed.
    pub action_queue_capacity: usize,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 30_000,
            heartbeat_interval_ms: 10_000,
            heartbeat_timeout_ms: 30_000,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            auto_reconnect: false,
            reconnect_base_delay_ms: 500,
            reconnect_max_delay_ms: 15_000,
            action_queue_capacity: 10_000,
        }
    }
}

impl ConnectorConfig {
    pub fn builder() -> ConnectorConfigBuilder {
        ConnectorConfigBuilder::default()
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Builder for [`ConnectorConfig`].
#[derive(Debug, Default)]
pub struct ConnectorConfigBuilder {
    request_timeout_ms: Option<u64>,
    heartbeat_interval_ms: Option<u64>,
    heartbeat_timeout_ms: Option<u64>,
    max_message_size: Option<usize>,
    auto_reconnect: Option<bool>,
    reconnect_base_delay_ms: Option<u64>,
    reconnect_max_delay_ms: Option<u64>,
    action_queue_capacity: Option<usize>,
}

impl ConnectorConfigBuilder {
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

    pub fn auto_reconnect(mut self, enabled: bool) -> Self {
        self.auto_reconnect = Some(enabled);
        self
    }

    pub fn reconnect_base_delay_ms(mut self, ms: u64) -> Self {
        self.reconnect_base_delay_ms = Some(ms);
        self
    }

    pub fn reconnect_max_delay_ms(mut self, ms: u64) -> Self {
        self.reconnect_max_delay_ms = Some(ms);
        self
    }

    pub fn action_queue_capacity(mut self, capacity: usize) -> Self {
        self.action_queue_capacity = Some(capacity);
        self
    }

    pub fn build(self) -> ConnectorConfig {
        let default = ConnectorConfig::default();
        ConnectorConfig {
            request_timeout_ms: self.request_timeout_ms.unwrap_or(default.request_timeout_ms),
            heartbeat_interval_ms: self
                .heartbeat_interval_ms
                .unwrap_or(default.heartbeat_interval_ms),
            heartbeat_timeout_ms: self
                .heartbeat_timeout_ms
                .unwrap_or(default.heartbeat_timeout_ms),
            max_message_size: self.max_message_size.unwrap_or(default.max_message_size),
            auto_reconnect: self.auto_reconnect.unwrap_or(default.auto_reconnect),
            reconnect_base_delay_ms: self
                .reconnect_base_delay_ms
                .unwrap_or(default.reconnect_base_delay_ms),
            reconnect_max_delay_ms: self
                .reconnect_max_delay_ms
                .unwrap_or(default.reconnect_max_delay_ms),
            action_queue_capacity: self
                .action_queue_capacity
                .unwrap_or(default.action_queue_capacity)
                .max(1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ConnectorConfig::default();
        assert_eq!(config.request_timeout_ms, 30_000);
        assert_eq!(config.action_queue_capacity, 10_000);
        assert!(!config.auto_reconnect);
    }

    #[test]
    fn test_builder() {
        let config = ConnectorConfig::builder()
            .request_timeout_ms(100)
            .auto_reconnect(true)
            .action_queue_capacity(0)
            .build();
        assert_eq!(config.request_timeout(), Duration::from_millis(100));
        assert!(config.auto_reconnect);
        // Zero capacity is clamped to something usable
        assert_eq!(config.action_queue_capacity, 1);
        assert_eq!(config.heartbeat_interval_ms, 10_000);
    }
}
