//! Power-of-K-choices placement with a configurable score function.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use rand::Rng;
use sandbox_store::RequestContext;
use tracing::instrument;

use crate::algorithm::{filter_candidates, ChooseNode, FilterPolicy};
use crate::error::PlacementError;
use crate::node::NodeView;
use crate::request::ResourceRequest;

/// Dynamic scoring configuration; updated in place under a lock so changes
/// take effect on the next call.
#[derive(Debug, Clone)]
pub struct BestOfKConfig {
    /// Overcommit ratio used both by the shared can-fit filter and the score
    /// denominator.
    pub r: f64,
    /// Weight applied to the node's current usage fraction in the score.
    pub alpha: f64,
    /// Sample size drawn from the filtered pool.
    pub k: usize,
    pub check_too_many_starting: bool,
    pub check_can_fit: bool,
    pub max_starting_instances_per_node: usize,
}

impl Default for BestOfKConfig {
    fn default() -> Self {
        Self {
            r: 2.0,
            alpha: 0.5,
            k: 3,
            check_too_many_starting: true,
            check_can_fit: true,
            max_starting_instances_per_node: 3,
        }
    }
}

impl BestOfKConfig {
    fn filter_policy(&self) -> FilterPolicy {
        FilterPolicy {
            max_starting_instances_per_node: self.max_starting_instances_per_node,
            check_too_many_starting: self.check_too_many_starting,
            check_can_fit: self.check_can_fit,
            overcommit_ratio: self.r,
        }
    }
}

/// Samples up to `K` candidates uniformly at random without replacement and
/// picks the lowest-scoring one.
pub struct BestOfKAlgorithm {
    config: RwLock<BestOfKConfig>,
}

impl BestOfKAlgorithm {
    pub fn new(config: BestOfKConfig) -> Self {
        Self {
            config: RwLock::new(config),
        }
    }

    /// Atomically replaces the scoring configuration; in effect for every
    /// subsequent call.
    pub fn update_config(&self, config: BestOfKConfig) {
        *self.config.write() = config;
    }

    pub fn config_snapshot(&self) -> BestOfKConfig {
        self.config.read().clone()
    }

    fn score(node: &NodeView, requested: &ResourceRequest, r: f64, alpha: f64) -> f64 {
        if node.metrics.cpu_count == 0 {
            return f64::INFINITY;
        }
        let allocated = node.metrics.cpu_allocated + node.placement.read().in_progress_cpus();
        let usage_fraction = node.metrics.usage_fraction();
        (requested.cpus + allocated + alpha * usage_fraction) / (r * node.metrics.cpu_count as f64)
    }
}

impl Default for BestOfKAlgorithm {
    fn default() -> Self {
        Self::new(BestOfKConfig::default())
    }
}

/// Fisher-Yates-style remove-and-swap sample of up to `k` indices from
/// `0..len`, uniform and O(k).
fn sample_indices(len: usize, k: usize, rng: &mut impl Rng) -> Vec<usize> {
    let mut pool: Vec<usize> = (0..len).collect();
    let draws = k.min(len);
    let mut chosen = Vec::with_capacity(draws);
    for _ in 0..draws {
        let i = rng.gen_range(0..pool.len());
        chosen.push(pool.swap_remove(i));
    }
    chosen
}

#[async_trait]
impl ChooseNode for BestOfKAlgorithm {
    #[instrument(skip(self, _ctx, nodes, excluded, requested))]
    async fn choose_node(
        &self,
        _ctx: &RequestContext,
        nodes: &[Arc<NodeView>],
        excluded: &HashSet<String>,
        requested: &ResourceRequest,
    ) -> Result<Arc<NodeView>, PlacementError> {
        let config = self.config_snapshot();
        let policy = config.filter_policy();
        let candidates = filter_candidates(nodes, excluded, requested, &policy);
        if candidates.is_empty() {
            return Err(PlacementError::NoNodeAvailable);
        }

        let mut rng = rand::thread_rng();
        let sampled = sample_indices(candidates.len(), config.k, &mut rng);

        sampled
            .into_iter()
            .map(|i| candidates[i])
            .min_by(|a, b| {
                Self::score(a, requested, config.r, config.alpha)
                    .partial_cmp(&Self::score(b, requested, config.r, config.alpha))
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .cloned()
            .ok_or(PlacementError::NoNodeAvailable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{NodeMetrics, NodeStatus};

    fn node(id: &str, status: NodeStatus, cpu_percent: f64) -> Arc<NodeView> {
        Arc::new(NodeView::new(
            id,
            status,
            NodeMetrics {
                cpu_count: 8,
                cpu_percent,
                cpu_allocated: 0.0,
                memory_total_bytes: 0,
                memory_used_bytes: 0,
                memory_allocated_bytes: 0,
            },
        ))
    }

    #[tokio::test]
    async fn honors_exclusion() {
        let nodes = vec![
            node("a", NodeStatus::Ready, 800.0),
            node("b", NodeStatus::Ready, 200.0),
            node("c", NodeStatus::Ready, 500.0),
        ];
        let algo = BestOfKAlgorithm::new(BestOfKConfig {
            r: 10.0,
            alpha: 0.5,
            k: 3,
            ..Default::default()
        });
        let ctx = RequestContext::background();
        let requested = ResourceRequest {
            cpus: 1.0,
            mib_memory: 256,
            build_machine_info: None,
        };
        let excluded: HashSet<String> = ["b".to_string()].into_iter().collect();

        for _ in 0..20 {
            let chosen = algo
                .choose_node(&ctx, &nodes, &excluded, &requested)
                .await
                .unwrap();
            assert_ne!(chosen.id, "b");
        }
    }

    #[tokio::test]
    async fn empty_pool_reports_no_node_available() {
        let nodes = vec![node("a", NodeStatus::Unhealthy, 0.0)];
        let algo = BestOfKAlgorithm::default();
        let ctx = RequestContext::background();
        let requested = ResourceRequest {
            cpus: 1.0,
            mib_memory: 256,
            build_machine_info: None,
        };
        let err = algo
            .choose_node(&ctx, &nodes, &HashSet::new(), &requested)
            .await
            .unwrap_err();
        assert!(matches!(err, PlacementError::NoNodeAvailable));
    }

    #[tokio::test]
    async fn config_update_takes_effect_on_next_call() {
        let algo = BestOfKAlgorithm::default();
        assert_eq!(algo.config_snapshot().k, 3);
        algo.update_config(BestOfKConfig {
            k: 1,
            ..BestOfKConfig::default()
        });
        assert_eq!(algo.config_snapshot().k, 1);
    }
}
