use std::sync::atomic::{AtomicU64, Ordering};

/// Connector-side counters. Bumped from the connector's internal tasks;
/// read through [`snapshot`](ConnectorMetrics::snapshot).
#[derive(Debug, Default)]
pub struct ConnectorMetrics {
    pub frames_received: AtomicU64,
    pub frames_sent: AtomicU64,
    pub bytes_received: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub heartbeat_timeouts: AtomicU64,
    pub reconnects: AtomicU64,
    pub shed_actions: AtomicU64,
}

impl ConnectorMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_frame_received(&self, bytes: usize) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_frame_sent(&self, bytes: usize) {
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_heartbeat_timeout(&self) {
        self.heartbeat_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_shed(&self, count: u64) {
        self.shed_actions.fetch_add(count, Ordering::Relaxed);
    }

    /// Snapshot of the atomic counters. The request-tracker fields are
    /// zero here; `Connector::metrics` fills them from its tracker scope.
    pub fn snapshot(&self) -> ConnectorMetricsSnapshot {
        ConnectorMetricsSnapshot {
            frames_received: self.frames_received.load(Ordering::Relaxed),
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            heartbeat_timeouts: self.heartbeat_timeouts.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            shed_actions: self.shed_actions.load(Ordering::Relaxed),
            request_timeouts: 0,
            late_replies: 0,
        }
    }
}

/// Point-in-time copy of [`ConnectorMetrics`] plus the connector's
/// request-tracker counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectorMetricsSnapshot {
    pub frames_received: u64,
    pub frames_sent: u64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub heartbeat_timeouts: u64,
    pub reconnects: u64,
    pub shed_actions: u64,
    pub request_timeouts: u64,
    pub late_replies: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_counts() {
        let metrics = ConnectorMetrics::new();
        metrics.record_frame_sent(20);
        metrics.record_frame_sent(30);
        metrics.record_frame_received(64);
        metrics.record_shed(10);
        metrics.record_heartbeat_timeout();

        let snap = metrics.snapshot();
        assert_eq!(snap.frames_sent, 2);
        assert_eq!(snap.bytes_sent, 50);
        assert_eq!(snap.frames_received, 1);
        assert_eq!(snap.bytes_received, 64);
        assert_eq!(snap.shed_actions, 10);
        assert_eq!(snap.heartbeat_timeouts, 1);
        assert_eq!(snap.reconnects, 0);
    }
}
