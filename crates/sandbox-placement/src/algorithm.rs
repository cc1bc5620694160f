//! `ChooseNode`: the pluggable placement algorithm interface.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use sandbox_store::RequestContext;

use crate::error::PlacementError;
use crate::node::{NodeStatus, NodeView};
use crate::request::ResourceRequest;

#[async_trait]
pub trait ChooseNode: Send + Sync {
    async fn choose_node(
        &self,
        ctx: &RequestContext,
        nodes: &[Arc<NodeView>],
        excluded: &HashSet<String>,
        requested: &ResourceRequest,
    ) -> Result<Arc<NodeView>, PlacementError>;
}

/// Filters shared by every algorithm before it applies its own
/// load-balancing logic. `check_too_many_starting` and `check_can_fit` are
/// independently toggleable so `BestOfK` can disable either; `LeastBusy`
/// always applies both.
#[derive(Debug, Clone)]
pub struct FilterPolicy {
    pub max_starting_instances_per_node: usize,
    pub check_too_many_starting: bool,
    pub check_can_fit: bool,
    pub overcommit_ratio: f64,
}

impl Default for FilterPolicy {
    fn default() -> Self {
        Self {
            max_starting_instances_per_node: 3,
            check_too_many_starting: true,
            check_can_fit: true,
            overcommit_ratio: 2.0,
        }
    }
}

/// The common candidate filter every algorithm runs first: readiness,
/// exclusion, in-flight-start saturation, CPU compatibility, and capacity.
pub(crate) fn filter_candidates<'a>(
    nodes: &'a [Arc<NodeView>],
    excluded: &HashSet<String>,
    requested: &ResourceRequest,
    policy: &FilterPolicy,
) -> Vec<&'a Arc<NodeView>> {
    nodes
        .iter()
        .filter(|node| node.status == NodeStatus::Ready)
        .filter(|node| !excluded.contains(&node.id))
        .filter(|node| {
            !policy.check_too_many_starting
                || node.placement.read().in_progress_count() <= policy.max_starting_instances_per_node
        })
        .filter(|node| match &requested.build_machine_info {
            Some(required) => node.machine_info.satisfies(required),
            None => true,
        })
        .filter(|node| !policy.check_can_fit || node.can_fit(requested.cpus, policy.overcommit_ratio))
        .collect()
}
