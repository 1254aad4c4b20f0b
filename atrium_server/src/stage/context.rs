use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};
use std::time::Duration;

use atrium_core::error::CoreError;
use atrium_core::route::service;
use atrium_core::tracker::ReplyFuture;
use atrium_core::{Frame, Packet};

use super::game_loop::{self, GameLoopHandle};
use super::timer::{self, TimerEntry};
use super::{ActorEntry, AsyncPost, ReplyTarget, StageHandle, StageItem};
use crate::dispatcher;
use crate::server::ServerCore;
use crate::traits::Stage;

/// Identity of the actor currently taken out of the table for a callback.
pub(crate) struct CurrentActor {
    pub account_id: String,
    pub session_id: u64,
}

/// Handle given to every stage callback.
///
/// Created by the worker per item and torn down when the callback returns;
/// everything it can reach is either owned by the stage (timers, game loop)
/// or resolved through the server on demand (sessions, peers). Replying
/// consumes the pending reply slot, so a request is answered at most once.
pub struct StageCtx<'a> {
    pub(crate) stage: &'a Arc<StageHandle>,
    pub(crate) server: &'a Weak<ServerCore>,
    pub(crate) actors: &'a HashMap<String, ActorEntry>,
    pub(crate) timers: &'a mut HashMap<u64, TimerEntry>,
    pub(crate) game_loop: &'a mut Option<GameLoopHandle>,
    pub(crate) reply_slot: &'a mut Option<ReplyTarget>,
    pub(crate) current: Option<CurrentActor>,
}

impl StageCtx<'_> {
    pub fn stage_id(&self) -> i64 {
        self.stage.stage_id
    }

    pub fn stage_type(&self) -> &str {
        &self.stage.stage_type
    }

    /// NID of the hosting server.
    pub fn nid(&self) -> String {
        self.server
            .upgrade()
            .map(|core| core.config.nid.clone())
            .unwrap_or_default()
    }

    /// Account of the actor the current callback is about, if any.
    pub fn current_account_id(&self) -> Option<&str> {
        self.current.as_ref().map(|c| c.account_id.as_str())
    }

    pub fn actor_count(&self) -> usize {
        self.actors.len() + usize::from(self.current.is_some())
    }

    pub fn account_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.actors.keys().cloned().collect();
        if let Some(current) = &self.current {
            ids.push(current.account_id.clone());
        }
        ids
    }

    /// Whether the item being processed still expects a reply.
    pub fn has_pending_reply(&self) -> bool {
        self.reply_slot.is_some()
    }

    /// Answer the request that triggered this callback. A second call, or a
    /// call for a one-way message, is a no-op with a warning.
    pub fn reply(&mut self, packet: Packet) {
        match self.reply_slot.take() {
            Some(target) => target.send(self.server, packet),
            None => {
                tracing::warn!(
                    stage_id = self.stage.stage_id,
                    msg_id = %packet.msg_id,
                    "reply with no pending request"
                );
            }
        }
    }

    /// Push a one-way packet to one actor's client.
    pub fn send_to_client(&self, account_id: &str, packet: Packet) -> Result<(), CoreError> {
        let session_id = self.session_id_of(account_id).ok_or_else(|| {
            CoreError::Internal(format!("no actor {account_id} in stage"))
        })?;
        let core = self.server.upgrade().ok_or(CoreError::ConnectionClosed)?;
        let session = core
            .sessions
            .get(&session_id)
            .map(|s| s.clone())
            .ok_or(CoreError::ConnectionClosed)?;
        let frame = Frame::with_error(
            packet.msg_id,
            0,
            self.stage.stage_id,
            packet.error_code,
            packet.payload,
        );
        if !session.send_frame(frame) {
            return Err(CoreError::ConnectionClosed);
        }
        Ok(())
    }

    /// Push a one-way packet to every connected actor in the stage.
    pub fn broadcast(&self, packet: Packet) {
        for account_id in self.account_ids() {
            if let Err(e) = self.send_to_client(&account_id, packet.clone()) {
                tracing::debug!(
                    stage_id = self.stage.stage_id,
                    account_id = %account_id,
                    error = %e,
                    "broadcast skipped actor"
                );
            }
        }
    }

    fn session_id_of(&self, account_id: &str) -> Option<u64> {
        if let Some(current) = &self.current {
            if current.account_id == account_id {
                return Some(current.session_id);
            }
        }
        self.actors.get(account_id).map(|entry| entry.session_id)
    }

    /// Register a timer that fires forever at `period` after `initial_delay`.
    /// Fires arrive as [`Stage::on_timer`] calls carrying the returned id.
    pub fn add_repeat_timer(
        &mut self,
        initial_delay: Duration,
        period: Duration,
    ) -> Result<u64, CoreError> {
        self.add_timer(initial_delay, period, None)
    }

    /// Like [`add_repeat_timer`](Self::add_repeat_timer) but stops after
    /// `count` firings. `count == 0` is rejected.
    pub fn add_count_timer(
        &mut self,
        initial_delay: Duration,
        period: Duration,
        count: u32,
    ) -> Result<u64, CoreError> {
        if count == 0 {
            return Err(CoreError::InvalidConfig("timer count must be > 0".into()));
        }
        self.add_timer(initial_delay, period, Some(count))
    }

    fn add_timer(
        &mut self,
        initial_delay: Duration,
        period: Duration,
        count: Option<u32>,
    ) -> Result<u64, CoreError> {
        if period.is_zero() {
            return Err(CoreError::InvalidConfig("timer period must be > 0".into()));
        }
        let core = self.server.upgrade().ok_or(CoreError::ConnectionClosed)?;
        let timer_id = core.next_timer_id.fetch_add(1, Ordering::Relaxed) + 1;
        let entry = timer::spawn_timer(
            Arc::downgrade(self.stage),
            self.server.clone(),
            timer_id,
            initial_delay,
            period,
            count,
        );
        self.timers.insert(timer_id, entry);
        Ok(timer_id)
    }

    /// Stop a timer. Firings already enqueued before the cancel may still
    /// be observed; nothing fires after those drain.
    pub fn cancel_timer(&mut self, timer_id: u64) -> bool {
        match self.timers.remove(&timer_id) {
            Some(entry) => {
                entry.cancel();
                true
            }
            None => false,
        }
    }

    /// Start the fixed-timestep loop with the configured accumulator cap.
    pub fn start_game_loop(&mut self, timestep: Duration) -> Result<(), CoreError> {
        let factor = self
            .server
            .upgrade()
            .map(|core| core.config.game_loop_max_accumulator_factor)
            .unwrap_or(5);
        self.start_game_loop_with(timestep, timestep * factor)
    }

    /// Start the loop with an explicit accumulator cap.
    pub fn start_game_loop_with(
        &mut self,
        timestep: Duration,
        max_accumulator: Duration,
    ) -> Result<(), CoreError> {
        if timestep.is_zero() {
            return Err(CoreError::InvalidConfig("timestep must be > 0".into()));
        }
        if self.game_loop.is_some() {
            return Err(CoreError::GameLoopRunning);
        }
        let handle = game_loop::spawn_game_loop(
            Arc::downgrade(self.stage),
            self.server.clone(),
            timestep,
            max_accumulator.max(timestep),
        );
        *self.game_loop = Some(handle);
        Ok(())
    }

    /// Stop future ticks. Ticks already enqueued still reach
    /// [`Stage::on_tick`].
    pub fn stop_game_loop(&mut self) -> bool {
        match self.game_loop.take() {
            Some(handle) => {
                handle.stop();
                true
            }
            None => false,
        }
    }

    /// Run `pre` off the stage, then run `post` with its result back on the
    /// stage worker. The sanctioned way to do blocking or slow work without
    /// holding the stage.
    pub fn async_block<F, T, P>(&self, pre: F, post: P)
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
        P: FnOnce(&mut dyn Stage, &mut StageCtx<'_>, T) + Send + 'static,
    {
        let stage = Arc::clone(self.stage);
        let server = self.server.clone();
        tokio::spawn(async move {
            let value = pre.await;
            let post: AsyncPost = Box::new(move |stage_ref, ctx, boxed| {
                if let Ok(value) = boxed.downcast::<T>() {
                    post(stage_ref, ctx, *value);
                }
            });
            stage.post(
                &server,
                StageItem::AsyncResult {
                    post,
                    value: Box::new(value),
                },
            );
        });
    }

    /// Fire-and-forget to a stage on a peer server.
    pub fn send_to_stage(
        &self,
        nid: &str,
        stage_id: i64,
        packet: Packet,
    ) -> Result<(), CoreError> {
        let core = self.server.upgrade().ok_or(CoreError::ConnectionClosed)?;
        dispatcher::send_envelope(&core, nid, service::PLAY, stage_id, packet)
    }

    /// Request to a stage on a peer server. Returns immediately; await the
    /// future (or hand it to [`async_block`](Self::async_block)) for the
    /// reply or timeout.
    pub fn request_to_stage(
        &self,
        nid: &str,
        stage_id: i64,
        packet: Packet,
    ) -> Result<ReplyFuture, CoreError> {
        let core = self.server.upgrade().ok_or(CoreError::ConnectionClosed)?;
        dispatcher::request_envelope(&core, nid, service::PLAY, stage_id, packet)
    }

    /// Fire-and-forget to a stateless API service.
    pub fn send_to_api(&self, nid: &str, packet: Packet) -> Result<(), CoreError> {
        let core = self.server.upgrade().ok_or(CoreError::ConnectionClosed)?;
        dispatcher::send_envelope(&core, nid, service::API, 0, packet)
    }

    /// Request to a stateless API service.
    pub fn request_to_api(&self, nid: &str, packet: Packet) -> Result<ReplyFuture, CoreError> {
        let core = self.server.upgrade().ok_or(CoreError::ConnectionClosed)?;
        dispatcher::request_envelope(&core, nid, service::API, 0, packet)
    }

    /// Queue removal of an actor. Processed after the current item, in
    /// arrival order like everything else.
    pub fn leave_stage(&self, account_id: &str) {
        self.stage.post(
            self.server,
            StageItem::Command(super::SystemCommand::Leave {
                account_id: account_id.to_string(),
                reply: None,
            }),
        );
    }

    /// Queue destruction of this stage: timers cancelled, actors destroyed,
    /// directory entry removed.
    pub fn close_stage(&self) {
        self.stage.post(
            self.server,
            StageItem::Command(super::SystemCommand::Destroy { reply: None }),
        );
    }
}
