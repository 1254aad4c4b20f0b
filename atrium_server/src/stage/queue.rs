use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use super::StageItem;

/// The stage mailbox: an unbounded FIFO plus the single-worker flag.
///
/// Producers never block. `try_begin` hands exclusive drain rights to
/// exactly one caller; `end` releases them. The worker re-checks the queue
/// after `end` and re-acquires via `try_begin` if a producer raced in, so
/// no item is ever stranded.
pub(crate) struct StageQueue {
    items: Mutex<VecDeque<StageItem>>,
    running: AtomicBool,
}

impl StageQueue {
    pub(crate) fn new() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            running: AtomicBool::new(false),
        }
    }

    pub(crate) fn push(&self, item: StageItem) {
        self.items.lock().unwrap().push_back(item);
    }

    pub(crate) fn pop(&self) -> Option<StageItem> {
        self.items.lock().unwrap().pop_front()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.items.lock().unwrap().is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.items.lock().unwrap().len()
    }

    /// Claim the worker slot. True means the caller is now the only worker.
    pub(crate) fn try_begin(&self) -> bool {
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Release the worker slot.
    pub(crate) fn end(&self) {
        self.running.store(false, Ordering::Release);
    }

    #[cfg(test)]
    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::SystemCommand;

    fn item() -> StageItem {
        StageItem::Command(SystemCommand::DisconnectNotice { session_id: 1 })
    }

    #[test]
    fn test_fifo_order() {
        let queue = StageQueue::new();
        queue.push(StageItem::TimerFire {
            timer_id: 1,
            last: false,
        });
        queue.push(StageItem::TimerFire {
            timer_id: 2,
            last: false,
        });

        match queue.pop() {
            Some(StageItem::TimerFire { timer_id, .. }) => assert_eq!(timer_id, 1),
            _ => panic!("expected timer item"),
        }
        match queue.pop() {
            Some(StageItem::TimerFire { timer_id, .. }) => assert_eq!(timer_id, 2),
            _ => panic!("expected timer item"),
        }
        assert!(queue.pop().is_none());
    }

    #[test]
    fn test_single_worker_flag() {
        let queue = StageQueue::new();
        queue.push(item());

        assert!(queue.try_begin());
        assert!(!queue.try_begin());
        assert!(queue.is_running());

        queue.end();
        assert!(queue.try_begin());
    }
}
