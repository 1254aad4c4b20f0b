use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use atrium_core::{ErrorCode, Packet};

use crate::metrics::ConnectorMetrics;

/// One deferred delivery, drained by `main_thread_action`.
pub(crate) enum Action {
    Connected,
    Disconnected(ErrorCode),
    Push { stage_id: i64, packet: Packet },
    Complete(Box<dyn FnOnce() + Send>),
}

/// The main-thread mailbox.
///
/// Bounded: when the application stops draining (a paused game, a
/// backgrounded tab host), the queue sheds its oldest tenth instead of
/// growing without limit, says so loudly, and counts the loss in the
/// connector metrics.
pub(crate) struct ActionQueue {
    items: Mutex<VecDeque<Action>>,
    capacity: usize,
    metrics: Arc<ConnectorMetrics>,
}

impl ActionQueue {
    pub(crate) fn new(capacity: usize, metrics: Arc<ConnectorMetrics>) -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
            metrics,
        }
    }

    pub(crate) fn push(&self, action: Action) {
        let mut items = self.items.lock().unwrap();
        if items.len() >= self.capacity {
            let shed = (self.capacity / 10).max(1).min(items.len());
            items.drain(..shed);
            self.metrics.record_shed(shed as u64);
            tracing::warn!(
                shed,
                capacity = self.capacity,
                "action queue overflow, oldest entries dropped"
            );
        }
        items.push_back(action);
    }

    pub(crate) fn pop(&self) -> Option<Action> {
        self.items.lock().unwrap().pop_front()
    }

    pub(crate) fn len(&self) -> usize {
        self.items.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    fn queue_with_metrics(capacity: usize) -> (ActionQueue, Arc<ConnectorMetrics>) {
        let metrics = Arc::new(ConnectorMetrics::new());
        (ActionQueue::new(capacity, Arc::clone(&metrics)), metrics)
    }

    #[test]
    fn test_fifo() {
        let (queue, _metrics) = queue_with_metrics(10);
        queue.push(Action::Push {
            stage_id: 1,
            packet: Packet::empty("A"),
        });
        queue.push(Action::Push {
            stage_id: 2,
            packet: Packet::empty("B"),
        });
        match queue.pop() {
            Some(Action::Push { stage_id, .. }) => assert_eq!(stage_id, 1),
            _ => panic!("expected push action"),
        }
        match queue.pop() {
            Some(Action::Push { stage_id, .. }) => assert_eq!(stage_id, 2),
            _ => panic!("expected push action"),
        }
        assert!(queue.pop().is_none());
    }

    #[test]
    fn test_overflow_sheds_oldest_tenth() {
        let (queue, metrics) = queue_with_metrics(100);
        for i in 0..100 {
            queue.push(Action::Push {
                stage_id: i,
                packet: Packet::empty("M"),
            });
        }
        // The 101st push sheds the 10 oldest
        queue.push(Action::Push {
            stage_id: 100,
            packet: Packet::empty("M"),
        });
        assert_eq!(metrics.shed_actions.load(Ordering::Relaxed), 10);
        assert_eq!(queue.len(), 91);
        match queue.pop() {
            Some(Action::Push { stage_id, .. }) => assert_eq!(stage_id, 10),
            _ => panic!("expected push action"),
        }
    }

    #[test]
    fn test_tiny_capacity() {
        let (queue, metrics) = queue_with_metrics(1);
        queue.push(Action::Connected);
        queue.push(Action::Connected);
        assert_eq!(queue.len(), 1);
        assert_eq!(metrics.shed_actions.load(Ordering::Relaxed), 1);
    }
}
