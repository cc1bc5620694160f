//! `StateStore`: the single contract both backends implement.

pub mod memory;
pub mod replicated;

use async_trait::async_trait;
use futures::future::BoxFuture;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::context::RequestContext;
use crate::error::StoreError;
use crate::model::{RemovalAction, Sandbox, SandboxState};

/// Predicates accepted by `AllItems`; an empty `states` matches every state.
#[derive(Debug, Clone, Default)]
pub struct ItemsFilter {
    pub only_expired: bool,
    pub team_id: Option<Uuid>,
    pub states: Vec<SandboxState>,
}

impl ItemsFilter {
    pub fn matches(&self, sandbox: &Sandbox, now: DateTime<Utc>) -> bool {
        if self.only_expired && !sandbox.is_expired_at(now) {
            return false;
        }
        if let Some(team_id) = self.team_id {
            if sandbox.team_id != team_id {
                return false;
            }
        }
        if !self.states.is_empty() && !self.states.contains(&sandbox.state) {
            return false;
        }
        true
    }
}

/// `fn(current) -> (new, ok)` from `Update`'s contract: `None` means `ok =
/// false`, the record is left untouched.
pub type UpdateFn = Box<dyn FnOnce(&Sandbox) -> Option<Sandbox> + Send>;

/// Invoked at most once after `StartRemoving` returns `already_done = false`,
/// carrying the outcome of the caller's external work (e.g. signaling the
/// worker node). Async because the replicated backend must write the
/// transition result key and release the distributed lock.
pub type TransitionCallback =
    Box<dyn FnOnce(RequestContext, Option<anyhow::Error>) -> BoxFuture<'static, Result<(), StoreError>> + Send>;

/// Result of `StartRemoving`.
pub struct StartRemovingOutcome {
    pub already_done: bool,
    pub callback: TransitionCallback,
}

impl StartRemovingOutcome {
    /// Builds the outcome for the idempotent-no-transition-needed cases: a
    /// `StartRemoving` call whose target equals the current (or
    /// just-settled) state, with a callback that does nothing when invoked.
    pub(crate) fn no_op(already_done: bool) -> Self {
        Self {
            already_done,
            callback: Box::new(|_ctx, _err| Box::pin(async { Ok(()) })),
        }
    }
}

#[async_trait]
pub trait StateStore: Send + Sync {
    /// Inserts `sandbox` if absent, clamping `end_time`. `newly_created`
    /// distinguishes a freshly placed sandbox from one rehydrated on
    /// restart/resume for callers that only want to fire hooks on the
    /// former.
    async fn add(
        &self,
        ctx: &RequestContext,
        sandbox: Sandbox,
        newly_created: bool,
    ) -> Result<(), StoreError>;

    async fn get(
        &self,
        ctx: &RequestContext,
        team_id: Uuid,
        sandbox_id: &str,
        include_evicting: bool,
    ) -> Result<Sandbox, StoreError>;

    async fn remove(&self, ctx: &RequestContext, team_id: Uuid, sandbox_id: &str) -> Result<(), StoreError>;

    async fn team_items(
        &self,
        ctx: &RequestContext,
        team_id: Uuid,
        states: &[SandboxState],
    ) -> Result<Vec<Sandbox>, StoreError>;

    async fn all_items(&self, ctx: &RequestContext, filter: ItemsFilter) -> Result<Vec<Sandbox>, StoreError>;

    async fn update(
        &self,
        ctx: &RequestContext,
        team_id: Uuid,
        sandbox_id: &str,
        f: UpdateFn,
    ) -> Result<(), StoreError>;

    async fn items_to_evict(&self, ctx: &RequestContext) -> Result<Vec<Sandbox>, StoreError>;

    async fn extend_end_time(
        &self,
        ctx: &RequestContext,
        team_id: Uuid,
        sandbox_id: &str,
        new_end: DateTime<Utc>,
        allow_shorter: bool,
    ) -> Result<bool, StoreError>;

    async fn start_removing(
        &self,
        ctx: &RequestContext,
        team_id: Uuid,
        sandbox_id: &str,
        action: RemovalAction,
    ) -> Result<StartRemovingOutcome, StoreError>;

    async fn wait_for_state_change(
        &self,
        ctx: &RequestContext,
        team_id: Uuid,
        sandbox_id: &str,
    ) -> Result<(), StoreError>;
}
