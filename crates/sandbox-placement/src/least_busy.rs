//! Deterministic minimum-load placement with bounded retry/wait.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sandbox_store::RequestContext;
use tracing::instrument;

use crate::algorithm::{filter_candidates, ChooseNode, FilterPolicy};
use crate::error::PlacementError;
use crate::node::NodeView;
use crate::request::ResourceRequest;

#[derive(Debug, Clone)]
pub struct LeastBusyConfig {
    pub filter: FilterPolicy,
    /// Interval between polls while no candidate exists.
    pub poll_interval: Duration,
    /// Bounded wait for a candidate to appear, independent of the caller's
    /// own deadline.
    pub timeout: Duration,
}

impl Default for LeastBusyConfig {
    fn default() -> Self {
        Self {
            filter: FilterPolicy::default(),
            poll_interval: Duration::from_millis(10),
            timeout: Duration::from_secs(2),
        }
    }
}

/// Scans the filtered candidate pool for the node minimizing
/// [`NodeView::effective_cpu`], polling until one appears, the internal
/// timeout fires, or the caller's context expires.
pub struct LeastBusyAlgorithm {
    config: LeastBusyConfig,
}

impl LeastBusyAlgorithm {
    pub fn new(config: LeastBusyConfig) -> Self {
        Self { config }
    }
}

impl Default for LeastBusyAlgorithm {
    fn default() -> Self {
        Self::new(LeastBusyConfig::default())
    }
}

#[async_trait]
impl ChooseNode for LeastBusyAlgorithm {
    #[instrument(skip(self, ctx, nodes, excluded, requested))]
    async fn choose_node(
        &self,
        ctx: &RequestContext,
        nodes: &[Arc<NodeView>],
        excluded: &HashSet<String>,
        requested: &ResourceRequest,
    ) -> Result<Arc<NodeView>, PlacementError> {
        let bounded_ctx = ctx.with_timeout(self.config.timeout);
        loop {
            let best = filter_candidates(nodes, excluded, requested, &self.config.filter)
                .into_iter()
                .min_by(|a, b| {
                    a.effective_cpu()
                        .partial_cmp(&b.effective_cpu())
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .cloned();

            if let Some(node) = best {
                return Ok(node);
            }

            bounded_ctx
                .run(tokio::time::sleep(self.config.poll_interval))
                .await
                .map_err(PlacementError::Context)?;
        }
    }
}
