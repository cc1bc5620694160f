//! Per-process authoritative [`StateStore`].
//!
//! A concurrent map of `sandbox_id -> record`, each record carrying its own
//! [`parking_lot::Mutex`] for per-record locking, plus one coarse
//! [`parking_lot::RwLock`] for the map itself.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use tracing::instrument;
use uuid::Uuid;

use crate::context::RequestContext;
use crate::error::StoreError;
use crate::model::{allowed_transition, RemovalAction, Sandbox, SandboxId, SandboxState};
use crate::singleshot::SingleShot;
use crate::store::{ItemsFilter, StartRemovingOutcome, StateStore, TransitionCallback, UpdateFn};

type TransitionSlot = Arc<SingleShot<Result<(), String>>>;

struct RecordInner {
    sandbox: Sandbox,
    transition: Option<TransitionSlot>,
}

type SyncHook = Box<dyn Fn(&Sandbox) + Send + Sync>;
type AsyncHook = Arc<dyn Fn(Sandbox) -> BoxFuture<'static, ()> + Send + Sync>;

/// In-memory, single-process [`StateStore`] implementation.
pub struct InMemoryStore {
    records: RwLock<HashMap<SandboxId, Arc<Mutex<RecordInner>>>>,
    on_insert_sync: RwLock<Vec<SyncHook>>,
    on_insert_async: RwLock<Vec<AsyncHook>>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            on_insert_sync: RwLock::new(Vec::new()),
            on_insert_async: RwLock::new(Vec::new()),
        }
    }

    /// Registers a hook run synchronously, inline with `Add`, before it returns.
    pub fn on_insert(&self, hook: impl Fn(&Sandbox) + Send + Sync + 'static) {
        self.on_insert_sync.write().push(Box::new(hook));
    }

    /// Registers a hook run on a spawned task, without holding any store lock.
    pub fn on_insert_async<F>(&self, hook: impl Fn(Sandbox) -> F + Send + Sync + 'static)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        self.on_insert_async
            .write()
            .push(Arc::new(move |sbx| Box::pin(hook(sbx))));
    }

    /// Number of records currently tracked, regardless of state.
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn get_record(&self, sandbox_id: &str) -> Result<Arc<Mutex<RecordInner>>, StoreError> {
        self.records
            .read()
            .get(sandbox_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(sandbox_id.to_string()))
    }

    fn make_callback(&self, record: Arc<Mutex<RecordInner>>, slot: TransitionSlot) -> TransitionCallback {
        Box::new(move |_ctx: RequestContext, err: Option<anyhow::Error>| {
            Box::pin(async move {
                match err {
                    None => {
                        slot.resolve(Ok(()));
                        record.lock().transition = None;
                    }
                    Some(e) => {
                        slot.resolve(Err(e.to_string()));
                        // Deliberately left installed: future start_removing
                        // calls for this target observe the failure instead
                        // of silently retrying.
                    }
                }
                Ok(())
            })
        })
    }
}

#[async_trait]
impl StateStore for InMemoryStore {
    #[instrument(skip(self, ctx, sandbox))]
    async fn add(
        &self,
        ctx: &RequestContext,
        mut sandbox: Sandbox,
        newly_created: bool,
    ) -> Result<(), StoreError> {
        if ctx.is_cancelled() {
            return Err(StoreError::Context(crate::context::ContextError::Cancelled));
        }
        sandbox.clamp_end_time();

        let sandbox_id = sandbox.sandbox_id.clone();
        {
            let mut records = self.records.write();
            if records.contains_key(&sandbox_id) {
                return Ok(());
            }
            records.insert(
                sandbox_id.clone(),
                Arc::new(Mutex::new(RecordInner {
                    sandbox: sandbox.clone(),
                    transition: None,
                })),
            );
        }

        for hook in self.on_insert_sync.read().iter() {
            hook(&sandbox);
        }

        if newly_created {
            for hook in self.on_insert_async.read().iter() {
                let hook = hook.clone();
                let sandbox = sandbox.clone();
                tokio::spawn(async move { hook(sandbox).await });
            }
        }

        Ok(())
    }

    #[instrument(skip(self, ctx))]
    async fn get(
        &self,
        ctx: &RequestContext,
        _team_id: Uuid,
        sandbox_id: &str,
        include_evicting: bool,
    ) -> Result<Sandbox, StoreError> {
        if ctx.is_cancelled() {
            return Err(StoreError::Context(crate::context::ContextError::Cancelled));
        }
        let record = self.get_record(sandbox_id)?;
        let inner = record.lock();
        if !include_evicting && inner.sandbox.is_expired() {
            return Err(StoreError::BeingEvicted(sandbox_id.to_string()));
        }
        Ok(inner.sandbox.clone())
    }

    #[instrument(skip(self, ctx))]
    async fn remove(&self, ctx: &RequestContext, _team_id: Uuid, sandbox_id: &str) -> Result<(), StoreError> {
        if ctx.is_cancelled() {
            return Err(StoreError::Context(crate::context::ContextError::Cancelled));
        }
        self.records.write().remove(sandbox_id);
        Ok(())
    }

    #[instrument(skip(self, ctx))]
    async fn team_items(
        &self,
        ctx: &RequestContext,
        team_id: Uuid,
        states: &[SandboxState],
    ) -> Result<Vec<Sandbox>, StoreError> {
        let filter = ItemsFilter {
            team_id: Some(team_id),
            states: states.to_vec(),
            ..Default::default()
        };
        self.all_items(ctx, filter).await
    }

    #[instrument(skip(self, ctx))]
    async fn all_items(&self, ctx: &RequestContext, filter: ItemsFilter) -> Result<Vec<Sandbox>, StoreError> {
        if ctx.is_cancelled() {
            return Err(StoreError::Context(crate::context::ContextError::Cancelled));
        }
        let now = Utc::now();
        let records = self.records.read();
        Ok(records
            .values()
            .map(|r| r.lock().sandbox.clone())
            .filter(|s| filter.matches(s, now))
            .collect())
    }

    #[instrument(skip(self, ctx, f))]
    async fn update(
        &self,
        ctx: &RequestContext,
        _team_id: Uuid,
        sandbox_id: &str,
        f: UpdateFn,
    ) -> Result<(), StoreError> {
        if ctx.is_cancelled() {
            return Err(StoreError::Context(crate::context::ContextError::Cancelled));
        }
        let record = self.get_record(sandbox_id)?;
        let mut inner = record.lock();
        if let Some(new_value) = f(&inner.sandbox) {
            inner.sandbox = new_value;
        }
        Ok(())
    }

    #[instrument(skip(self, ctx))]
    async fn items_to_evict(&self, ctx: &RequestContext) -> Result<Vec<Sandbox>, StoreError> {
        let filter = ItemsFilter {
            only_expired: true,
            states: vec![SandboxState::Running],
            ..Default::default()
        };
        self.all_items(ctx, filter).await
    }

    #[instrument(skip(self, ctx))]
    async fn extend_end_time(
        &self,
        ctx: &RequestContext,
        _team_id: Uuid,
        sandbox_id: &str,
        new_end: DateTime<Utc>,
        allow_shorter: bool,
    ) -> Result<bool, StoreError> {
        if ctx.is_cancelled() {
            return Err(StoreError::Context(crate::context::ContextError::Cancelled));
        }
        let record = self.get_record(sandbox_id)?;
        let mut inner = record.lock();
        if !allow_shorter && new_end < inner.sandbox.end_time {
            return Ok(false);
        }
        if new_end == inner.sandbox.end_time {
            return Ok(false);
        }
        inner.sandbox.end_time = new_end;
        Ok(true)
    }

    #[instrument(skip(self, ctx))]
    async fn start_removing(
        &self,
        ctx: &RequestContext,
        _team_id: Uuid,
        sandbox_id: &str,
        action: RemovalAction,
    ) -> Result<StartRemovingOutcome, StoreError> {
        let target = action.target_state();
        let mut just_waited_on_transition = false;

        loop {
            let record = self.get_record(sandbox_id)?;
            let pending = {
                let inner = record.lock();
                match &inner.transition {
                    Some(slot) if slot.peek().is_none() => Some(slot.clone()),
                    _ => None,
                }
            };

            if let Some(slot) = pending {
                slot.wait(ctx).await.map_err(StoreError::Context)?;
                just_waited_on_transition = true;
                continue;
            }

            let mut inner = record.lock();
            let current_state = inner.sandbox.state;

            if current_state == target {
                if let Some(slot) = &inner.transition {
                    if let Some(Err(msg)) = slot.peek() {
                        return Err(StoreError::Transient(anyhow!(msg)));
                    }
                }
                return Ok(StartRemovingOutcome::no_op(true));
            }

            if !allowed_transition(current_state, target) {
                return Err(if just_waited_on_transition {
                    StoreError::AlreadyInTransition(current_state)
                } else {
                    StoreError::InvalidTransition {
                        from: current_state,
                        to: target,
                    }
                });
            }

            inner.sandbox.mark_ending_now(Utc::now());
            inner.sandbox.state = target;
            let slot: TransitionSlot = Arc::new(SingleShot::new());
            inner.transition = Some(slot.clone());
            drop(inner);

            return Ok(StartRemovingOutcome {
                already_done: false,
                callback: self.make_callback(record, slot),
            });
        }
    }

    #[instrument(skip(self, ctx))]
    async fn wait_for_state_change(
        &self,
        ctx: &RequestContext,
        _team_id: Uuid,
        sandbox_id: &str,
    ) -> Result<(), StoreError> {
        let pending = {
            let record = self.get_record(sandbox_id)?;
            let inner = record.lock();
            inner.transition.clone()
        };
        if let Some(slot) = pending {
            if slot.peek().is_none() {
                slot.wait(ctx).await.map_err(StoreError::Context)?;
            }
        }
        Ok(())
    }
}
