//! Replicated [`StateStore`] backed by a Redis-compatible key-value store.
//! Same contract as [`super::memory::InMemoryStore`], but coordination
//! crosses process boundaries via distributed locks and transition-token
//! keys instead of an in-process mutex.

use std::env;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context as _};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use rand::Rng;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use tracing::{instrument, warn};
use uuid::Uuid;

use crate::context::RequestContext;
use crate::error::StoreError;
use crate::model::{allowed_transition, RemovalAction, Sandbox, SandboxState};
use crate::store::{ItemsFilter, StartRemovingOutcome, StateStore, TransitionCallback, UpdateFn};

/// Tuning knobs for the replicated backend.
#[derive(Debug, Clone)]
pub struct ReplicatedStoreConfig {
    pub redis_url: String,
    /// Distributed lock lease (`lockTimeout`, ≈1 min).
    pub lock_lease: Duration,
    /// Base backoff for lock/token polling (`retryInterval`, ≈20ms) with
    /// ±25% jitter applied per attempt.
    pub retry_interval: Duration,
    pub retry_jitter_fraction: f64,
    /// TTL for the transition token key; bounded, much longer than any sane
    /// transition.
    pub transition_key_ttl: Duration,
    /// Short TTL for the transition result key, used only to notify waiters.
    pub transition_result_ttl: Duration,
}

impl Default for ReplicatedStoreConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://127.0.0.1:6379".to_string(),
            lock_lease: Duration::from_secs(60),
            retry_interval: Duration::from_millis(20),
            retry_jitter_fraction: 0.25,
            transition_key_ttl: Duration::from_secs(600),
            transition_result_ttl: Duration::from_secs(5),
        }
    }
}

impl ReplicatedStoreConfig {
    /// Reads tuning from `SANDBOX_STORE_REDIS_URL` and friends, falling back
    /// to [`Default`] for anything unset, matching the env-driven config
    /// idiom this workspace uses for its binaries.
    pub fn from_env() -> anyhow::Result<Self> {
        let base = Self::default();
        let redis_url = env::var("SANDBOX_STORE_REDIS_URL").unwrap_or(base.redis_url);
        let lock_lease = env_duration_secs("SANDBOX_STORE_LOCK_LEASE_SECONDS", base.lock_lease)?;
        let retry_interval =
            env_duration_millis("SANDBOX_STORE_RETRY_INTERVAL_MS", base.retry_interval)?;
        let transition_key_ttl =
            env_duration_secs("SANDBOX_STORE_TRANSITION_TTL_SECONDS", base.transition_key_ttl)?;
        let transition_result_ttl = env_duration_secs(
            "SANDBOX_STORE_TRANSITION_RESULT_TTL_SECONDS",
            base.transition_result_ttl,
        )?;

        Ok(Self {
            redis_url,
            lock_lease,
            retry_interval,
            transition_key_ttl,
            transition_result_ttl,
            ..base
        })
    }
}

fn env_duration_secs(key: &str, default: Duration) -> anyhow::Result<Duration> {
    match env::var(key) {
        Ok(value) => Ok(Duration::from_secs(
            value.parse().with_context(|| format!("invalid {key}"))?,
        )),
        Err(_) => Ok(default),
    }
}

fn env_duration_millis(key: &str, default: Duration) -> anyhow::Result<Duration> {
    match env::var(key) {
        Ok(value) => Ok(Duration::from_millis(
            value.parse().with_context(|| format!("invalid {key}"))?,
        )),
        Err(_) => Ok(default),
    }
}

/// `SET record newJSON; SADD teamIndex sandboxID; SADD globalIndex team:id`.
const ADD_SCRIPT: &str = r#"
redis.call('SET', KEYS[1], ARGV[1])
redis.call('SADD', KEYS[2], ARGV[2])
redis.call('SADD', KEYS[3], ARGV[3])
return 1
"#;

/// `DEL record; SREM teamIndex sandboxID; SREM globalIndex team:id`.
const REMOVE_SCRIPT: &str = r#"
redis.call('DEL', KEYS[1])
redis.call('SREM', KEYS[2], ARGV[1])
redis.call('SREM', KEYS[3], ARGV[2])
return 1
"#;

/// `SET record newJSON; SET transitionKey uuid EX ttl; SET resultKey "" EX resultTTL`.
const START_TRANSITION_SCRIPT: &str = r#"
redis.call('SET', KEYS[1], ARGV[1])
redis.call('SET', KEYS[2], ARGV[2], 'EX', ARGV[3])
redis.call('SET', KEYS[3], '', 'EX', ARGV[4])
return 1
"#;

/// Writes the transition result (empty for success) and deletes the
/// transition token, run under the record's distributed lock.
const COMPLETE_TRANSITION_SCRIPT: &str = r#"
redis.call('SET', KEYS[1], ARGV[1], 'EX', ARGV[2])
redis.call('DEL', KEYS[2])
return 1
"#;

/// `SET key value NX PX lease` only releases if `GET key == value`.
const UNLOCK_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('DEL', KEYS[1])
else
  return 0
end
"#;

fn record_key(team_id: Uuid, sandbox_id: &str) -> String {
    format!("sandbox:storage:{{{team_id}}}:sandboxes:{sandbox_id}")
}

fn index_key(team_id: Uuid) -> String {
    format!("sandbox:storage:{{{team_id}}}:index")
}

/// A flat secondary index so `all_items` can scan across teams without a
/// `KEYS`/`SCAN` sweep over the whole keyspace (see DESIGN.md).
fn global_index_key() -> &'static str {
    "sandbox:storage:global:index"
}

fn global_index_member(team_id: Uuid, sandbox_id: &str) -> String {
    format!("{team_id}:{sandbox_id}")
}

fn lock_key(record_key: &str) -> String {
    format!("lock:{record_key}")
}

fn transition_key(team_id: Uuid, sandbox_id: &str) -> String {
    format!("sandbox:storage:{{{team_id}}}:transition:{sandbox_id}")
}

fn transition_result_key(team_id: Uuid, sandbox_id: &str, token: &str) -> String {
    format!("sandbox:storage:{{{team_id}}}:transition-result:{sandbox_id}:{token}")
}

struct LockGuard {
    conn: ConnectionManager,
    key: String,
    token: String,
}

impl LockGuard {
    async fn release(self) {
        let mut conn = self.conn;
        let script = Script::new(UNLOCK_SCRIPT);
        if let Err(err) = script
            .key(&self.key)
            .arg(&self.token)
            .invoke_async::<_, i64>(&mut conn)
            .await
        {
            warn!(key = %self.key, error = %err, "failed to release distributed lock");
        }
    }
}

/// Replicated, multi-process [`StateStore`] implementation.
#[derive(Clone)]
pub struct ReplicatedStore {
    conn: ConnectionManager,
    config: Arc<ReplicatedStoreConfig>,
}

impl ReplicatedStore {
    pub async fn connect(config: ReplicatedStoreConfig) -> anyhow::Result<Self> {
        let client = redis::Client::open(config.redis_url.clone())
            .context("invalid redis connection string")?;
        let conn = client
            .get_tokio_connection_manager()
            .await
            .context("failed to connect to redis")?;
        Ok(Self {
            conn,
            config: Arc::new(config),
        })
    }

    fn jittered_delay(&self) -> Duration {
        let base = self.config.retry_interval.as_secs_f64();
        let jitter = rand::thread_rng()
            .gen_range(-self.config.retry_jitter_fraction..=self.config.retry_jitter_fraction);
        Duration::from_secs_f64((base * (1.0 + jitter)).max(0.0))
    }

    async fn sleep_jittered(&self) {
        tokio::time::sleep(self.jittered_delay()).await;
    }

    #[instrument(skip(self, ctx))]
    async fn acquire_lock(&self, ctx: &RequestContext, record_key: &str) -> Result<LockGuard, StoreError> {
        let key = lock_key(record_key);
        let token = Uuid::new_v4().to_string();
        loop {
            let mut conn = self.conn.clone();
            let acquired: Option<String> = redis::cmd("SET")
                .arg(&key)
                .arg(&token)
                .arg("NX")
                .arg("PX")
                .arg(self.config.lock_lease.as_millis() as u64)
                .query_async(&mut conn)
                .await
                .map_err(|err| StoreError::Transient(anyhow!(err)))?;

            if acquired.is_some() {
                return Ok(LockGuard {
                    conn: self.conn.clone(),
                    key,
                    token,
                });
            }

            ctx.run(self.sleep_jittered()).await.map_err(StoreError::Context)?;
        }
    }

    /// Polls `transition_key` until it no longer holds `original_token`
    /// (either cleared or replaced by a newer transition).
    async fn wait_token_resolved(
        &self,
        ctx: &RequestContext,
        transition_key: &str,
        original_token: &str,
    ) -> Result<(), StoreError> {
        loop {
            let mut conn = self.conn.clone();
            let current: Option<String> = conn
                .get(transition_key)
                .await
                .map_err(|err| StoreError::Transient(anyhow!(err)))?;
            if current.as_deref() != Some(original_token) {
                return Ok(());
            }
            ctx.run(self.sleep_jittered()).await.map_err(StoreError::Context)?;
        }
    }

    /// Reads the result written by the owner of `token`. A missing key is
    /// treated as success — the chosen behavior for when the short-TTL
    /// result key expires before a waiter polls it (see DESIGN.md).
    async fn read_transition_result(
        &self,
        team_id: Uuid,
        sandbox_id: &str,
        token: &str,
    ) -> Result<Result<(), String>, StoreError> {
        let key = transition_result_key(team_id, sandbox_id, token);
        let mut conn = self.conn.clone();
        let value: Option<String> = conn
            .get(&key)
            .await
            .map_err(|err| StoreError::Transient(anyhow!(err)))?;
        Ok(match value {
            None => Ok(()),
            Some(msg) if msg.is_empty() => Ok(()),
            Some(msg) => Err(msg),
        })
    }

    fn make_callback(&self, team_id: Uuid, sandbox_id: String, token: String) -> TransitionCallback {
        let store = self.clone();
        Box::new(move |_ctx: RequestContext, err: Option<anyhow::Error>| -> BoxFuture<'static, Result<(), StoreError>> {
            Box::pin(async move {
                let message = err.map(|e| e.to_string()).unwrap_or_default();
                let rec_key = record_key(team_id, &sandbox_id);
                let lock = store.acquire_lock(&RequestContext::background(), &rec_key).await?;

                let result_key = transition_result_key(team_id, &sandbox_id, &token);
                let trans_key = transition_key(team_id, &sandbox_id);
                let script = Script::new(COMPLETE_TRANSITION_SCRIPT);
                let mut conn = store.conn.clone();
                let outcome: Result<i64, _> = script
                    .key(&result_key)
                    .key(&trans_key)
                    .arg(&message)
                    .arg(store.config.transition_result_ttl.as_secs())
                    .invoke_async(&mut conn)
                    .await;

                lock.release().await;
                outcome
                    .map(|_| ())
                    .map_err(|err| StoreError::Transient(anyhow!(err)))
            })
        })
    }

    async fn fetch_sandbox(&self, record_key: &str) -> Result<Option<Sandbox>, StoreError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn
            .get(record_key)
            .await
            .map_err(|err| StoreError::Transient(anyhow!(err)))?;
        match raw {
            None => Ok(None),
            Some(json) => serde_json::from_str(&json)
                .map(Some)
                .map_err(|err| StoreError::Invariant(anyhow!(err))),
        }
    }
}

#[async_trait]
impl StateStore for ReplicatedStore {
    #[instrument(skip(self, ctx, sandbox))]
    async fn add(
        &self,
        ctx: &RequestContext,
        mut sandbox: Sandbox,
        _newly_created: bool,
    ) -> Result<(), StoreError> {
        if ctx.is_cancelled() {
            return Err(StoreError::Context(crate::context::ContextError::Cancelled));
        }
        sandbox.clamp_end_time();
        let team_id = sandbox.team_id;
        let rec_key = record_key(team_id, &sandbox.sandbox_id);
        let idx_key = index_key(team_id);
        let json = serde_json::to_string(&sandbox).map_err(|err| StoreError::Invariant(anyhow!(err)))?;

        let mut conn = self.conn.clone();
        Script::new(ADD_SCRIPT)
            .key(&rec_key)
            .key(&idx_key)
            .key(global_index_key())
            .arg(&json)
            .arg(&sandbox.sandbox_id)
            .arg(global_index_member(team_id, &sandbox.sandbox_id))
            .invoke_async::<_, i64>(&mut conn)
            .await
            .map_err(|err| StoreError::Transient(anyhow!(err)))?;
        Ok(())
    }

    #[instrument(skip(self, ctx))]
    async fn get(
        &self,
        ctx: &RequestContext,
        team_id: Uuid,
        sandbox_id: &str,
        include_evicting: bool,
    ) -> Result<Sandbox, StoreError> {
        if ctx.is_cancelled() {
            return Err(StoreError::Context(crate::context::ContextError::Cancelled));
        }
        let rec_key = record_key(team_id, sandbox_id);
        let sandbox = self
            .fetch_sandbox(&rec_key)
            .await?
            .ok_or_else(|| StoreError::NotFound(sandbox_id.to_string()))?;
        if !include_evicting && sandbox.is_expired() {
            return Err(StoreError::BeingEvicted(sandbox_id.to_string()));
        }
        Ok(sandbox)
    }

    #[instrument(skip(self, ctx))]
    async fn remove(&self, ctx: &RequestContext, team_id: Uuid, sandbox_id: &str) -> Result<(), StoreError> {
        if ctx.is_cancelled() {
            return Err(StoreError::Context(crate::context::ContextError::Cancelled));
        }
        let rec_key = record_key(team_id, sandbox_id);
        let idx_key = index_key(team_id);
        let mut conn = self.conn.clone();
        Script::new(REMOVE_SCRIPT)
            .key(&rec_key)
            .key(&idx_key)
            .key(global_index_key())
            .arg(sandbox_id)
            .arg(global_index_member(team_id, sandbox_id))
            .invoke_async::<_, i64>(&mut conn)
            .await
            .map_err(|err| StoreError::Transient(anyhow!(err)))?;
        Ok(())
    }

    #[instrument(skip(self, ctx))]
    async fn team_items(
        &self,
        ctx: &RequestContext,
        team_id: Uuid,
        states: &[SandboxState],
    ) -> Result<Vec<Sandbox>, StoreError> {
        if ctx.is_cancelled() {
            return Err(StoreError::Context(crate::context::ContextError::Cancelled));
        }
        let idx_key = index_key(team_id);
        let mut conn = self.conn.clone();
        let ids: Vec<String> = conn
            .smembers(&idx_key)
            .await
            .map_err(|err| StoreError::Transient(anyhow!(err)))?;

        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            let rec_key = record_key(team_id, &id);
            match self.fetch_sandbox(&rec_key).await? {
                // Stale index entry whose record was already removed; tolerate and skip.
                None => continue,
                Some(sbx) if states.is_empty() || states.contains(&sbx.state) => out.push(sbx),
                Some(_) => {}
            }
        }
        Ok(out)
    }

    #[instrument(skip(self, ctx))]
    async fn all_items(&self, ctx: &RequestContext, filter: ItemsFilter) -> Result<Vec<Sandbox>, StoreError> {
        if ctx.is_cancelled() {
            return Err(StoreError::Context(crate::context::ContextError::Cancelled));
        }
        let mut conn = self.conn.clone();
        let members: Vec<String> = conn
            .smembers(global_index_key())
            .await
            .map_err(|err| StoreError::Transient(anyhow!(err)))?;

        let now = Utc::now();
        let mut out = Vec::with_capacity(members.len());
        for member in members {
            let Some((team_str, sandbox_id)) = member.split_once(':') else {
                continue;
            };
            let Ok(team_id) = team_str.parse::<Uuid>() else {
                continue;
            };
            let rec_key = record_key(team_id, sandbox_id);
            if let Some(sbx) = self.fetch_sandbox(&rec_key).await? {
                if filter.matches(&sbx, now) {
                    out.push(sbx);
                }
            }
        }
        Ok(out)
    }

    #[instrument(skip(self, ctx, f))]
    async fn update(
        &self,
        ctx: &RequestContext,
        team_id: Uuid,
        sandbox_id: &str,
        f: UpdateFn,
    ) -> Result<(), StoreError> {
        if ctx.is_cancelled() {
            return Err(StoreError::Context(crate::context::ContextError::Cancelled));
        }
        let rec_key = record_key(team_id, sandbox_id);
        let lock = self.acquire_lock(ctx, &rec_key).await?;
        let result = async {
            let current = self
                .fetch_sandbox(&rec_key)
                .await?
                .ok_or_else(|| StoreError::NotFound(sandbox_id.to_string()))?;
            if let Some(updated) = f(&current) {
                let json =
                    serde_json::to_string(&updated).map_err(|err| StoreError::Invariant(anyhow!(err)))?;
                let mut conn = self.conn.clone();
                let _: () = conn
                    .set(&rec_key, json)
                    .await
                    .map_err(|err| StoreError::Transient(anyhow!(err)))?;
            }
            Ok(())
        }
        .await;
        lock.release().await;
        result
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
        team_id: Uuid,
        sandbox_id: &str,
        new_end: DateTime<Utc>,
        allow_shorter: bool,
    ) -> Result<bool, StoreError> {
        let rec_key = record_key(team_id, sandbox_id);
        let lock = self.acquire_lock(ctx, &rec_key).await?;
        let result = async {
            let mut current = self
                .fetch_sandbox(&rec_key)
                .await?
                .ok_or_else(|| StoreError::NotFound(sandbox_id.to_string()))?;
            if new_end == current.end_time || (!allow_shorter && new_end < current.end_time) {
                return Ok(false);
            }
            current.end_time = new_end;
            let json =
                serde_json::to_string(&current).map_err(|err| StoreError::Invariant(anyhow!(err)))?;
            let mut conn = self.conn.clone();
            let _: () = conn
                .set(&rec_key, json)
                .await
                .map_err(|err| StoreError::Transient(anyhow!(err)))?;
            Ok(true)
        }
        .await;
        lock.release().await;
        result
    }

    #[instrument(skip(self, ctx))]
    async fn start_removing(
        &self,
        ctx: &RequestContext,
        team_id: Uuid,
        sandbox_id: &str,
        action: RemovalAction,
    ) -> Result<StartRemovingOutcome, StoreError> {
        let target = action.target_state();
        let rec_key = record_key(team_id, sandbox_id);
        let trans_key = transition_key(team_id, sandbox_id);

        loop {
            let lock = self.acquire_lock(ctx, &rec_key).await?;
            let sandbox = match self.fetch_sandbox(&rec_key).await {
                Ok(Some(sbx)) => sbx,
                Ok(None) => {
                    lock.release().await;
                    return Err(StoreError::NotFound(sandbox_id.to_string()));
                }
                Err(err) => {
                    lock.release().await;
                    return Err(err);
                }
            };

            let mut conn = self.conn.clone();
            let existing_token: Option<String> = conn
                .get(&trans_key)
                .await
                .map_err(|err| StoreError::Transient(anyhow!(err)))?;

            match existing_token {
                Some(token) => {
                    lock.release().await;
                    if sandbox.state == target {
                        self.wait_token_resolved(ctx, &trans_key, &token).await?;
                        return match self.read_transition_result(team_id, sandbox_id, &token).await? {
                            Ok(()) => Ok(StartRemovingOutcome::no_op(true)),
                            Err(msg) => Err(StoreError::Transient(anyhow!(msg))),
                        };
                    } else if allowed_transition(sandbox.state, target) {
                        self.wait_token_resolved(ctx, &trans_key, &token).await?;
                        continue;
                    } else {
                        return Err(StoreError::InvalidTransition {
                            from: sandbox.state,
                            to: target,
                        });
                    }
                }
                None => {
                    if sandbox.state == target {
                        lock.release().await;
                        return Ok(StartRemovingOutcome::no_op(true));
                    }
                    if !allowed_transition(sandbox.state, target) {
                        lock.release().await;
                        return Err(StoreError::InvalidTransition {
                            from: sandbox.state,
                            to: target,
                        });
                    }

                    let mut updated = sandbox.clone();
                    updated.mark_ending_now(Utc::now());
                    updated.state = target;
                    let json =
                        serde_json::to_string(&updated).map_err(|err| StoreError::Invariant(anyhow!(err)))?;
                    let new_token = Uuid::new_v4().to_string();
                    let result_key = transition_result_key(team_id, sandbox_id, &new_token);

                    let outcome: Result<i64, _> = Script::new(START_TRANSITION_SCRIPT)
                        .key(&rec_key)
                        .key(&trans_key)
                        .key(&result_key)
                        .arg(&json)
                        .arg(&new_token)
                        .arg(self.config.transition_key_ttl.as_secs())
                        .arg(self.config.transition_result_ttl.as_secs())
                        .invoke_async(&mut conn)
                        .await;
                    lock.release().await;
                    outcome.map_err(|err| StoreError::Transient(anyhow!(err)))?;

                    return Ok(StartRemovingOutcome {
                        already_done: false,
                        callback: self.make_callback(team_id, sandbox_id.to_string(), new_token),
                    });
                }
            }
        }
    }

    #[instrument(skip(self, ctx))]
    async fn wait_for_state_change(
        &self,
        ctx: &RequestContext,
        team_id: Uuid,
        sandbox_id: &str,
    ) -> Result<(), StoreError> {
        let trans_key = transition_key(team_id, sandbox_id);
        let mut conn = self.conn.clone();
        let token: Option<String> = conn
            .get(&trans_key)
            .await
            .map_err(|err| StoreError::Transient(anyhow!(err)))?;
        let Some(token) = token else {
            return Ok(());
        };
        self.wait_token_resolved(ctx, &trans_key, &token).await?;
        match self.read_transition_result(team_id, sandbox_id, &token).await? {
            Ok(()) => Ok(()),
            Err(msg) => Err(StoreError::Transient(anyhow!(msg))),
        }
    }
}
