//! Per-(team, sandbox) admission gate.
//!
//! Bounds concurrent starts per team and deduplicates concurrent starts of
//! the *same* sandbox so only one caller does the real work.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use anyhow::anyhow;
use parking_lot::Mutex as SyncMutex;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::context::RequestContext;
use crate::error::ReservationError;
use crate::model::{Sandbox, SandboxId};
use crate::singleshot::SingleShot;
use crate::store::StateStore;

type WaitFuture = Pin<Box<dyn Future<Output = Result<Sandbox, ReservationError>> + Send>>;

/// Callable exactly once with the outcome of the real work the reservation
/// was guarding.
pub type FinishFn = Box<dyn FnOnce(Result<Sandbox, anyhow::Error>) + Send>;

/// What a caller gets back from [`ReservationManager::reserve`]: either the
/// exclusive right (and obligation) to finish the reservation, or a future
/// that resolves once some other caller does.
pub enum ReserveOutcome {
    Finish(FinishFn),
    Wait(WaitFuture),
}

struct TeamReservations {
    pending: HashMap<SandboxId, Arc<SingleShot<Result<Sandbox, String>>>>,
}

impl TeamReservations {
    fn new() -> Self {
        Self {
            pending: HashMap::new(),
        }
    }
}

/// Per-(team, sandbox) admission gate backed by a [`StateStore`] for the
/// "already running" half of the dedup check.
pub struct ReservationManager {
    store: Arc<dyn StateStore>,
    teams: SyncMutex<HashMap<Uuid, Arc<AsyncMutex<TeamReservations>>>>,
}

impl ReservationManager {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self {
            store,
            teams: SyncMutex::new(HashMap::new()),
        }
    }

    fn team_entry(&self, team_id: Uuid) -> Arc<AsyncMutex<TeamReservations>> {
        self.teams
            .lock()
            .entry(team_id)
            .or_insert_with(|| Arc::new(AsyncMutex::new(TeamReservations::new())))
            .clone()
    }

    /// Reserves a concurrency slot for `sandbox_id` under `team_id`, bounded
    /// by `limit`.
    #[instrument(skip(self, ctx))]
    pub async fn reserve(
        &self,
        ctx: &RequestContext,
        team_id: Uuid,
        sandbox_id: SandboxId,
        limit: usize,
    ) -> Result<ReserveOutcome, ReservationError> {
        let team = self.team_entry(team_id);
        let mut guard = ctx.run(team.lock()).await?;

        if let Some(existing) = guard.pending.get(&sandbox_id) {
            let slot = existing.clone();
            return Ok(ReserveOutcome::Wait(wait_future(slot, ctx.clone())));
        }

        let existing_sandboxes = self
            .store
            .team_items(ctx, team_id, &[])
            .await
            .map_err(|err| ReservationError::Backend(anyhow!(err)))?;

        if let Some(sbx) = existing_sandboxes
            .iter()
            .find(|s| s.sandbox_id == sandbox_id)
        {
            let resolved = sbx.clone();
            return Ok(ReserveOutcome::Wait(Box::pin(async move { Ok(resolved) })));
        }

        let distinct: std::collections::HashSet<&str> = existing_sandboxes
            .iter()
            .map(|s| s.sandbox_id.as_str())
            .chain(guard.pending.keys().map(|s| s.as_str()))
            .collect();

        if distinct.len() >= limit {
            return Err(ReservationError::LimitExceeded(team_id));
        }

        let slot = Arc::new(SingleShot::new());
        guard.pending.insert(sandbox_id.clone(), slot.clone());
        drop(guard);

        info!(%team_id, %sandbox_id, "reservation admitted");

        let team_for_finish = team.clone();
        let finish: FinishFn = Box::new(move |outcome| {
            let resolved = match &outcome {
                Ok(sbx) => Ok(sbx.clone()),
                Err(err) => Err(err.to_string()),
            };
            slot.resolve(resolved);
            if outcome.is_err() {
                remove_pending(team_for_finish, sandbox_id);
            }
        });

        Ok(ReserveOutcome::Finish(finish))
    }

    /// Removes a reservation without resolving it, used when the caller
    /// abandons the attempt before any completion callback is invoked.
    #[instrument(skip(self))]
    pub fn release(&self, team_id: Uuid, sandbox_id: &str) {
        if let Some(team) = self.teams.lock().get(&team_id).cloned() {
            remove_pending(team, sandbox_id.to_string());
        }
    }

    /// Consumes an already-resolved reservation once its `Sandbox` has been
    /// inserted into the store. A no-op if nothing is pending.
    #[instrument(skip(self))]
    pub fn mark_consumed(&self, team_id: Uuid, sandbox_id: &str) {
        self.release(team_id, sandbox_id);
    }
}

fn wait_future(slot: Arc<SingleShot<Result<Sandbox, String>>>, ctx: RequestContext) -> WaitFuture {
    Box::pin(async move {
        let outcome = slot
            .wait(&ctx)
            .await
            .map_err(ReservationError::Context)?;
        outcome.map_err(|msg| ReservationError::Backend(anyhow!(msg)))
    })
}

/// Removes `sandbox_id` from a team's pending map. Takes the fast
/// synchronous path when the team lock is uncontended (the common case);
/// falls back to a spawned task so the (synchronous) `finish` closure never
/// has to block on the async mutex under contention.
fn remove_pending(team: Arc<AsyncMutex<TeamReservations>>, sandbox_id: SandboxId) {
    match team.try_lock() {
        Ok(mut guard) => {
            guard.pending.remove(&sandbox_id);
        }
        Err(_) => {
            tokio::spawn(async move {
                team.lock().await.pending.remove(&sandbox_id);
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ContextError;
    use crate::store::memory::InMemoryStore;
    use chrono::{Duration as ChronoDuration, Utc};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn sample_sandbox(team_id: Uuid, sandbox_id: &str) -> Sandbox {
        let now = Utc::now();
        Sandbox {
            sandbox_id: sandbox_id.to_string(),
            team_id,
            template_id: "tmpl".into(),
            execution_id: Uuid::new_v4(),
            build_id: Uuid::new_v4(),
            cluster_id: Uuid::new_v4(),
            client_id: "legacy".into(),
            start_time: now,
            end_time: now + ChronoDuration::hours(1),
            max_instance_length: ChronoDuration::hours(4),
            state: crate::model::SandboxState::Running,
            auto_pause: false,
        }
    }

    #[tokio::test]
    async fn second_distinct_sandbox_exceeds_quota() {
        let store: Arc<dyn StateStore> = Arc::new(InMemoryStore::new());
        let manager = ReservationManager::new(store);
        let team = Uuid::new_v4();
        let ctx = RequestContext::background();

        let outcome = manager
            .reserve(&ctx, team, "s1".into(), 1)
            .await
            .unwrap();
        assert!(matches!(outcome, ReserveOutcome::Finish(_)));

        let err = manager
            .reserve(&ctx, team, "s2".into(), 1)
            .await
            .unwrap_err();
        assert!(matches!(err, ReservationError::LimitExceeded(t) if t == team));
    }

    #[tokio::test]
    async fn same_sandbox_fan_out_unblocks_all_waiters() {
        let store: Arc<dyn StateStore> = Arc::new(InMemoryStore::new());
        let manager = Arc::new(ReservationManager::new(store));
        let team = Uuid::new_v4();
        let ctx = RequestContext::background();

        let finishers = Arc::new(AtomicUsize::new(0));
        let waiters = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();

        for _ in 0..50 {
            let manager = manager.clone();
            let ctx = ctx.clone();
            let finishers = finishers.clone();
            let waiters = waiters.clone();
            handles.push(tokio::spawn(async move {
                match manager.reserve(&ctx, team, "s".into(), 10).await.unwrap() {
                    ReserveOutcome::Finish(finish) => {
                        finishers.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                        finish(Ok(sample_sandbox(team, "s")));
                    }
                    ReserveOutcome::Wait(wait) => {
                        waiters.fetch_add(1, Ordering::SeqCst);
                        let sbx = wait.await.unwrap();
                        assert_eq!(sbx.sandbox_id, "s");
                    }
                }
            }));
        }

        for h in handles {
            h.await.unwrap();
        }

        assert_eq!(finishers.load(Ordering::SeqCst), 1);
        assert_eq!(waiters.load(Ordering::SeqCst), 49);
    }

    #[tokio::test]
    async fn failed_finish_frees_the_slot() {
        let store: Arc<dyn StateStore> = Arc::new(InMemoryStore::new());
        let manager = ReservationManager::new(store);
        let team = Uuid::new_v4();
        let ctx = RequestContext::background();

        let outcome = manager
            .reserve(&ctx, team, "s1".into(), 1)
            .await
            .unwrap();
        let finish = match outcome {
            ReserveOutcome::Finish(f) => f,
            _ => panic!("expected finish"),
        };
        finish(Err(anyhow!("placement failed")));

        // the slot freed, a second attempt at the same id should succeed
        let outcome = manager
            .reserve(&ctx, team, "s1".into(), 1)
            .await
            .unwrap();
        assert!(matches!(outcome, ReserveOutcome::Finish(_)));
    }

    #[tokio::test]
    async fn release_frees_without_resolving() {
        let store: Arc<dyn StateStore> = Arc::new(InMemoryStore::new());
        let manager = ReservationManager::new(store);
        let team = Uuid::new_v4();
        let ctx = RequestContext::background();

        let _outcome = manager
            .reserve(&ctx, team, "s1".into(), 1)
            .await
            .unwrap();
        manager.release(team, "s1");

        let outcome = manager
            .reserve(&ctx, team, "s1".into(), 1)
            .await
            .unwrap();
        assert!(matches!(outcome, ReserveOutcome::Finish(_)));
    }

    #[tokio::test]
    async fn waiter_unblocks_with_context_error_on_cancellation() {
        let store: Arc<dyn StateStore> = Arc::new(InMemoryStore::new());
        let manager = ReservationManager::new(store);
        let team = Uuid::new_v4();
        let ctx = RequestContext::background();

        let first = manager.reserve(&ctx, team, "s".into(), 10).await.unwrap();
        assert!(matches!(first, ReserveOutcome::Finish(_)));

        let waiter_ctx = RequestContext::background();
        let second = manager
            .reserve(&waiter_ctx, team, "s".into(), 10)
            .await
            .unwrap();
        let wait = match second {
            ReserveOutcome::Wait(wait) => wait,
            _ => panic!("expected wait"),
        };

        waiter_ctx.cancel();
        let err = wait.await.unwrap_err();
        assert!(matches!(
            err,
            ReservationError::Context(ContextError::Cancelled)
        ));
    }
}
