use std::sync::atomic::Ordering;
use std::sync::Weak;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use super::{StageHandle, StageItem};
use crate::server::ServerCore;

/// A running fixed-timestep loop. One per stage at most.
pub(crate) struct GameLoopHandle {
    pub handle: JoinHandle<()>,
    pub timestep: Duration,
}

impl GameLoopHandle {
    pub(crate) fn stop(self) {
        self.handle.abort();
    }
}

/// Drive a fixed-timestep loop for one stage.
///
/// Real elapsed time feeds an accumulator; each full `timestep` consumed
/// posts one `Tick` item. Ticks already enqueued but not yet processed
/// count against `max_accumulator`, so a stage that stalls sees at most
/// `max_accumulator / timestep` catch-up ticks when it resumes; all time
/// beyond the cap is dropped on the floor.
pub(crate) fn spawn_game_loop(
    stage: Weak<StageHandle>,
    server: Weak<ServerCore>,
    timestep: Duration,
    max_accumulator: Duration,
) -> GameLoopHandle {
    let handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(timestep);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick resolves immediately; use it to anchor the clock.
        ticker.tick().await;
        let mut last = Instant::now();
        let mut accumulator = Duration::ZERO;
        let mut total = Duration::ZERO;

        loop {
            ticker.tick().await;
            let now = Instant::now();
            accumulator += now - last;
            last = now;

            let Some(stage_ref) = stage.upgrade() else {
                return;
            };

            let in_flight = timestep * stage_ref.pending_ticks.load(Ordering::Relaxed);
            let budget = max_accumulator.saturating_sub(in_flight);
            if accumulator > budget {
                accumulator = budget;
            }
            while accumulator >= timestep {
                accumulator -= timestep;
                total += timestep;
                stage_ref.pending_ticks.fetch_add(1, Ordering::Relaxed);
                stage_ref.post(
                    &server,
                    StageItem::Tick {
                        dt: timestep,
                        total,
                    },
                );
            }
        }
    });

    GameLoopHandle { handle, timestep }
}
