//! `SandboxOrchestrator`: the facade composing the Reservation Manager,
//! Placement Engine, and Sandbox State Store into the two control flows —
//! create, and pause/kill.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::anyhow;
use sandbox_placement::{place_sandbox, ChooseNode, NodeView, SandboxRequest};
use sandbox_store::{
    RemovalAction, RequestContext, ReservationManager, ReserveOutcome, Sandbox, SandboxId, StateStore,
};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::error::OrchestratorError;
use crate::worker::{CreateFailure, WorkerNode};

/// Resolves the worker-node capability for a chosen placement candidate.
/// Kept separate from [`WorkerNode`] because the capability itself is
/// node-bound while placement only hands back a [`NodeView`]; wiring the
/// two together (service discovery, connection pooling) is the caller's
/// concern.
pub trait WorkerNodeResolver: Send + Sync {
    fn resolve(&self, node: &NodeView) -> Arc<dyn WorkerNode>;
}

/// Bounds the placement retry loop so a worker that rejects every candidate
/// cannot spin forever. Placement itself does not retry; the retry loop
/// lives one level up, here.
#[derive(Debug, Clone, Copy)]
pub struct OrchestratorConfig {
    pub max_placement_attempts: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_placement_attempts: 5,
        }
    }
}

pub struct SandboxOrchestrator {
    store: Arc<dyn StateStore>,
    reservations: Arc<ReservationManager>,
    algorithm: Arc<dyn ChooseNode>,
    config: OrchestratorConfig,
}

impl SandboxOrchestrator {
    pub fn new(
        store: Arc<dyn StateStore>,
        algorithm: Arc<dyn ChooseNode>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            reservations: Arc::new(ReservationManager::new(store.clone())),
            store,
            algorithm,
            config,
        }
    }

    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    pub fn reservations(&self) -> &Arc<ReservationManager> {
        &self.reservations
    }

    /// Implements the create control flow: reserve → place → worker create
    /// RPC → finish the reservation → insert into the store. On a
    /// retryable worker failure the refused node is added to `excluded` and
    /// placement is re-invoked, up to `config.max_placement_attempts`.
    #[instrument(skip(self, ctx, resolver, nodes, preferred_node, sandbox_request))]
    #[allow(clippy::too_many_arguments)]
    pub async fn create_sandbox(
        &self,
        ctx: &RequestContext,
        resolver: &dyn WorkerNodeResolver,
        team_id: Uuid,
        sandbox_id: SandboxId,
        nodes: &[Arc<NodeView>],
        preferred_node: Option<&Arc<NodeView>>,
        sandbox_request: SandboxRequest,
        team_limit: usize,
    ) -> Result<Sandbox, OrchestratorError> {
        let outcome = self
            .reservations
            .reserve(ctx, team_id, sandbox_id.clone(), team_limit)
            .await?;

        let finish = match outcome {
            ReserveOutcome::Wait(wait) => return Ok(wait.await?),
            ReserveOutcome::Finish(finish) => finish,
        };

        match self
            .place_and_create(ctx, resolver, nodes, preferred_node, &sandbox_request, &sandbox_id)
            .await
        {
            Ok(sandbox) => {
                finish(Ok(sandbox.clone()));
                self.store.add(ctx, sandbox.clone(), true).await?;
                self.reservations.mark_consumed(team_id, &sandbox_id);
                info!(%team_id, %sandbox_id, node = %sandbox.cluster_id, "sandbox created");
                Ok(sandbox)
            }
            Err(err) => {
                finish(Err(anyhow!(err.to_string())));
                Err(err)
            }
        }
    }

    async fn place_and_create(
        &self,
        ctx: &RequestContext,
        resolver: &dyn WorkerNodeResolver,
        nodes: &[Arc<NodeView>],
        preferred_node: Option<&Arc<NodeView>>,
        sandbox_request: &SandboxRequest,
        sandbox_id: &str,
    ) -> Result<Sandbox, OrchestratorError> {
        let mut excluded: HashSet<String> = HashSet::new();
        let mut preferred = preferred_node;

        for attempt in 0..self.config.max_placement_attempts {
            let node = place_sandbox(
                ctx,
                self.algorithm.as_ref(),
                nodes,
                &excluded,
                preferred,
                sandbox_request,
            )
            .await?;

            let worker = resolver.resolve(&node);
            match worker.create_sandbox(ctx, sandbox_id, sandbox_request).await {
                Ok(sandbox) => return Ok(sandbox),
                Err(err) => match err.kind {
                    CreateFailure::Retryable => {
                        warn!(node_id = %node.id, attempt, error = %err.source, "worker refused placement, retrying");
                        excluded.insert(node.id.clone());
                        preferred = None;
                    }
                    CreateFailure::Fatal => return Err(OrchestratorError::Worker(err.source)),
                },
            }
        }

        Err(OrchestratorError::NoNodeAccepted)
    }

    /// Implements the pause/kill control flow: start the transition in the
    /// store, perform the external worker signal, then report the outcome
    /// back through the store's completion callback.
    #[instrument(skip(self, ctx, worker))]
    pub async fn start_removing(
        &self,
        ctx: &RequestContext,
        worker: &dyn WorkerNode,
        team_id: Uuid,
        sandbox_id: &str,
        action: RemovalAction,
    ) -> Result<(), OrchestratorError> {
        let outcome = self
            .store
            .start_removing(ctx, team_id, sandbox_id, action)
            .await?;

        if outcome.already_done {
            return Ok(());
        }

        let signal_result = worker.signal_sandbox(ctx, sandbox_id, action).await;
        let callback_err = signal_result.as_ref().err().map(|e| anyhow!(e.to_string()));
        (outcome.callback)(ctx.clone(), callback_err).await?;
        signal_result.map_err(OrchestratorError::Worker)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet as StdHashSet;
    use std::sync::Mutex as StdMutex;

    use chrono::{Duration as ChronoDuration, Utc};
    use sandbox_placement::{BestOfKAlgorithm, LeastBusyAlgorithm, NodeMetrics, NodeStatus};
    use sandbox_store::{InMemoryStore, SandboxState};

    fn ready_node(id: &str) -> Arc<NodeView> {
        Arc::new(NodeView::new(
            id,
            NodeStatus::Ready,
            NodeMetrics {
                cpu_count: 8,
                cpu_percent: 0.0,
                cpu_allocated: 0.0,
                memory_total_bytes: 0,
                memory_used_bytes: 0,
                memory_allocated_bytes: 0,
            },
        ))
    }

    fn stub_sandbox(team_id: Uuid, sandbox_id: &str, cluster_id: Uuid) -> Sandbox {
        let now = Utc::now();
        Sandbox {
            sandbox_id: sandbox_id.to_string(),
            team_id,
            template_id: "tmpl".into(),
            execution_id: Uuid::new_v4(),
            build_id: Uuid::new_v4(),
            cluster_id,
            client_id: "legacy".into(),
            start_time: now,
            end_time: now + ChronoDuration::hours(1),
            max_instance_length: ChronoDuration::hours(4),
            state: SandboxState::Running,
            auto_pause: false,
        }
    }

    /// Fake worker bound to a single node; `reject_nodes` simulates the
    /// subset that refuse every create call with a retryable error.
    struct FakeWorker {
        node_id: String,
        reject_nodes: Arc<StdMutex<StdHashSet<String>>>,
        signal_calls: Arc<StdMutex<Vec<(String, RemovalAction)>>>,
        created_on: Arc<StdMutex<Vec<String>>>,
    }

    #[async_trait::async_trait]
    impl WorkerNode for FakeWorker {
        async fn create_sandbox(
            &self,
            _ctx: &RequestContext,
            sandbox_id: &str,
            _request: &SandboxRequest,
        ) -> Result<Sandbox, crate::worker::CreateError> {
            if self.reject_nodes.lock().unwrap().contains(&self.node_id) {
                return Err(crate::worker::CreateError::retryable(anyhow!(
                    "node {} out of capacity",
                    self.node_id
                )));
            }
            self.created_on.lock().unwrap().push(self.node_id.clone());
            Ok(stub_sandbox(Uuid::nil(), sandbox_id, Uuid::new_v4()))
        }

        async fn delete_sandbox(&self, _ctx: &RequestContext, _sandbox_id: &str) -> anyhow::Result<()> {
            Ok(())
        }

        async fn signal_sandbox(
            &self,
            _ctx: &RequestContext,
            sandbox_id: &str,
            action: RemovalAction,
        ) -> anyhow::Result<()> {
            self.signal_calls
                .lock()
                .unwrap()
                .push((sandbox_id.to_string(), action));
            Ok(())
        }
    }

    struct FakeResolver {
        reject_nodes: Arc<StdMutex<StdHashSet<String>>>,
        signal_calls: Arc<StdMutex<Vec<(String, RemovalAction)>>>,
        created_on: Arc<StdMutex<Vec<String>>>,
    }

    impl FakeResolver {
        fn new() -> Self {
            Self {
                reject_nodes: Arc::new(StdMutex::new(StdHashSet::new())),
                signal_calls: Arc::new(StdMutex::new(Vec::new())),
                created_on: Arc::new(StdMutex::new(Vec::new())),
            }
        }
    }

    impl WorkerNodeResolver for FakeResolver {
        fn resolve(&self, node: &NodeView) -> Arc<dyn WorkerNode> {
            Arc::new(FakeWorker {
                node_id: node.id.clone(),
                reject_nodes: self.reject_nodes.clone(),
                signal_calls: self.signal_calls.clone(),
                created_on: self.created_on.clone(),
            })
        }
    }

    fn orchestrator(algorithm: Arc<dyn ChooseNode>) -> (SandboxOrchestrator, Arc<dyn StateStore>) {
        let store: Arc<dyn StateStore> = Arc::new(InMemoryStore::new());
        let orch = SandboxOrchestrator::new(store.clone(), algorithm, OrchestratorConfig::default());
        (orch, store)
    }

    #[tokio::test]
    async fn create_sandbox_happy_path_inserts_into_store() {
        let (orch, store) = orchestrator(Arc::new(LeastBusyAlgorithm::default()));
        let resolver = FakeResolver::new();
        let nodes = vec![ready_node("a")];
        let ctx = RequestContext::background();
        let team_id = Uuid::new_v4();

        let sandbox = orch
            .create_sandbox(
                &ctx,
                &resolver,
                team_id,
                "s1".into(),
                &nodes,
                None,
                SandboxRequest::default(),
                5,
            )
            .await
            .unwrap();

        assert_eq!(sandbox.sandbox_id, "s1");
        let stored = store.get(&ctx, team_id, "s1", false).await.unwrap();
        assert_eq!(stored.sandbox_id, "s1");
    }

    #[tokio::test]
    async fn create_sandbox_retries_past_a_refusing_node() {
        let (orch, _store) = orchestrator(Arc::new(BestOfKAlgorithm::default()));
        let mut resolver = FakeResolver::new();
        resolver.reject_nodes = Arc::new(StdMutex::new(StdHashSet::from(["a".to_string()])));
        let nodes = vec![ready_node("a"), ready_node("b")];
        let ctx = RequestContext::background();
        let team_id = Uuid::new_v4();

        let sandbox = orch
            .create_sandbox(
                &ctx,
                &resolver,
                team_id,
                "s1".into(),
                &nodes,
                None,
                SandboxRequest::default(),
                5,
            )
            .await
            .unwrap();

        assert_eq!(sandbox.sandbox_id, "s1");
        // node "a" always refuses, so only "b" could have produced this record.
        let created = resolver.created_on.lock().unwrap().clone();
        assert_eq!(created, vec!["b".to_string()]);
    }

    #[tokio::test]
    async fn create_sandbox_over_quota_fails_before_touching_placement() {
        let (orch, _store) = orchestrator(Arc::new(LeastBusyAlgorithm::default()));
        let resolver = FakeResolver::new();
        let nodes = vec![ready_node("a")];
        let ctx = RequestContext::background();
        let team_id = Uuid::new_v4();

        orch.create_sandbox(&ctx, &resolver, team_id, "s1".into(), &nodes, None, SandboxRequest::default(), 1)
            .await
            .unwrap();

        let err = orch
            .create_sandbox(&ctx, &resolver, team_id, "s2".into(), &nodes, None, SandboxRequest::default(), 1)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            OrchestratorError::Reservation(sandbox_store::ReservationError::LimitExceeded(t)) if t == team_id
        ));
    }

    #[tokio::test]
    async fn start_removing_signals_worker_and_reports_success() {
        let (orch, store) = orchestrator(Arc::new(LeastBusyAlgorithm::default()));
        let ctx = RequestContext::background();
        let team_id = Uuid::new_v4();
        store
            .add(&ctx, stub_sandbox(team_id, "s1", Uuid::new_v4()), true)
            .await
            .unwrap();

        let signal_calls = Arc::new(StdMutex::new(Vec::new()));
        let worker = FakeWorker {
            node_id: "a".into(),
            reject_nodes: Arc::new(StdMutex::new(StdHashSet::new())),
            signal_calls: signal_calls.clone(),
            created_on: Arc::new(StdMutex::new(Vec::new())),
        };

        orch.start_removing(&ctx, &worker, team_id, "s1", RemovalAction::Pause)
            .await
            .unwrap();

        assert_eq!(signal_calls.lock().unwrap().len(), 1);
        let current = store.get(&ctx, team_id, "s1", true).await.unwrap();
        assert_eq!(current.state, SandboxState::Pausing);
    }

    #[tokio::test]
    async fn start_removing_already_done_skips_the_worker_signal() {
        let (orch, store) = orchestrator(Arc::new(LeastBusyAlgorithm::default()));
        let ctx = RequestContext::background();
        let team_id = Uuid::new_v4();
        let mut sbx = stub_sandbox(team_id, "s1", Uuid::new_v4());
        sbx.state = SandboxState::Pausing;
        store.add(&ctx, sbx, true).await.unwrap();

        let signal_calls = Arc::new(StdMutex::new(Vec::new()));
        let worker = FakeWorker {
            node_id: "a".into(),
            reject_nodes: Arc::new(StdMutex::new(StdHashSet::new())),
            signal_calls: signal_calls.clone(),
            created_on: Arc::new(StdMutex::new(Vec::new())),
        };

        orch.start_removing(&ctx, &worker, team_id, "s1", RemovalAction::Pause)
            .await
            .unwrap();

        assert!(signal_calls.lock().unwrap().is_empty());
    }
}
