use std::sync::Weak;
use std::time::Duration;

use tokio::task::JoinHandle;

use super::{StageHandle, StageItem};
use crate::server::ServerCore;

/// One live timer. Dropping or aborting the handle stops future firings;
/// firings already sitting in the stage queue still run.
pub(crate) struct TimerEntry {
    pub handle: JoinHandle<()>,
}

impl TimerEntry {
    pub(crate) fn cancel(self) {
        self.handle.abort();
    }
}

/// Spawn a timer task that posts `TimerFire` items into the owning stage.
///
/// `count = None` repeats forever; `Some(n)` stops after `n` firings and
/// marks the final item so the worker drops the table entry.
pub(crate) fn spawn_timer(
    stage: Weak<StageHandle>,
    server: Weak<ServerCore>,
    timer_id: u64,
    initial_delay: Duration,
    period: Duration,
    count: Option<u32>,
) -> TimerEntry {
    let handle = tokio::spawn(async move {
        tokio::time::sleep(initial_delay).await;
        let mut fired: u32 = 0;
        loop {
            let last = count.is_some_and(|c| fired + 1 >= c);
            match stage.upgrade() {
                Some(stage) => stage.post(&server, StageItem::TimerFire { timer_id, last }),
                None => return,
            }
            fired += 1;
            if last {
                return;
            }
            tokio::time::sleep(period).await;
        }
    });
    TimerEntry { handle }
}
