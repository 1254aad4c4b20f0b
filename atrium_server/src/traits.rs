use std::any::Any;
use std::time::Duration;

use async_trait::async_trait;
use atrium_core::{ErrorCode, Packet};
use bytes::Bytes;

use crate::stage::context::StageCtx;

/// Server-side room logic supplied by the application.
///
/// Every callback runs on the stage's worker: no two callbacks of the same
/// stage ever overlap, and a callback may freely `.await`. Blocking the
/// callback blocks the whole stage; use [`StageCtx::async_block`] for work
/// that must not.
#[async_trait]
pub trait Stage: Send + 'static {
    /// First-time creation. The returned bytes ride back to the creator in
    /// the create reply; an error code rejects the creation.
    async fn on_create(
        &mut self,
        _ctx: &mut StageCtx<'_>,
        _payload: Bytes,
    ) -> Result<Bytes, ErrorCode> {
        Ok(Bytes::new())
    }

    /// Runs once, right after the created flag flips.
    async fn on_post_create(&mut self, _ctx: &mut StageCtx<'_>) {}

    /// Last callback before the stage is torn down.
    async fn on_destroy(&mut self) {}

    /// Decide whether an authenticated actor may join. Returning false
    /// destroys the actor and rejects the join.
    async fn on_join_stage(&mut self, _ctx: &mut StageCtx<'_>, _actor: &mut dyn Actor) -> bool {
        true
    }

    async fn on_post_join_stage(&mut self, _ctx: &mut StageCtx<'_>, _actor: &mut dyn Actor) {}

    /// An actor's transport came or went. The actor stays in the stage; the
    /// stage decides whether and when to evict a silent one.
    async fn on_connection_changed(
        &mut self,
        _ctx: &mut StageCtx<'_>,
        _actor: &mut dyn Actor,
        _connected: bool,
    ) {
    }

    /// A client message addressed to this stage and actor.
    async fn on_dispatch(&mut self, ctx: &mut StageCtx<'_>, actor: &mut dyn Actor, packet: Packet);

    /// A message from a peer server addressed to this stage alone.
    async fn on_server_dispatch(&mut self, _ctx: &mut StageCtx<'_>, _packet: Packet) {}

    /// A timer registered through the context fired.
    async fn on_timer(&mut self, _ctx: &mut StageCtx<'_>, _timer_id: u64) {}

    /// One fixed-timestep game-loop tick.
    async fn on_tick(&mut self, _ctx: &mut StageCtx<'_>, _dt: Duration, _total: Duration) {}
}

/// Per-user endpoint inside one stage.
///
/// `on_authenticate` must leave a non-empty [`account_id`](Actor::account_id)
/// behind when it succeeds; an empty one is a contract violation reported to
/// the client as `AccountIdNotSet`.
#[async_trait]
pub trait Actor: Send + Sync + 'static {
    fn account_id(&self) -> &str;

    /// Escape hatch so stage code can downcast to the concrete actor type.
    fn as_any_mut(&mut self) -> &mut dyn Any;

    async fn on_create(&mut self) {}

    async fn on_authenticate(&mut self, packet: &Packet) -> bool;

    async fn on_post_authenticate(&mut self) {}

    async fn on_destroy(&mut self) {}
}

/// Constructs stages and actors for one registered stage type.
pub struct StageFactory {
    stage_type: String,
    create_stage: Box<dyn Fn() -> Box<dyn Stage> + Send + Sync>,
    create_actor: Box<dyn Fn() -> Box<dyn Actor> + Send + Sync>,
}

impl StageFactory {
    pub fn new<S, A>(stage_type: impl Into<String>, create_stage: S, create_actor: A) -> Self
    where
        S: Fn() -> Box<dyn Stage> + Send + Sync + 'static,
        A: Fn() -> Box<dyn Actor> + Send + Sync + 'static,
    {
        Self {
            stage_type: stage_type.into(),
            create_stage: Box::new(create_stage),
            create_actor: Box::new(create_actor),
        }
    }

    pub fn stage_type(&self) -> &str {
        &self.stage_type
    }

    pub(crate) fn new_stage(&self) -> Box<dyn Stage> {
        (self.create_stage)()
    }

    pub(crate) fn new_actor(&self) -> Box<dyn Actor> {
        (self.create_actor)()
    }
}

impl std::fmt::Debug for StageFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageFactory")
            .field("stage_type", &self.stage_type)
            .finish()
    }
}
