//! `PlaceSandbox`: wraps a [`ChooseNode`] algorithm with preferred-node
//! shortcutting. The retry loop that feeds a refused node back into
//! `excluded` is the caller's responsibility; this function does not retry
//! internally.

use std::collections::HashSet;
use std::sync::Arc;

use sandbox_store::RequestContext;
use tracing::{info, instrument};

use crate::algorithm::ChooseNode;
use crate::error::PlacementError;
use crate::node::{NodeStatus, NodeView};
use crate::request::SandboxRequest;

#[instrument(skip(ctx, algorithm, nodes, preferred_node, sandbox_request))]
pub async fn place_sandbox(
    ctx: &RequestContext,
    algorithm: &dyn ChooseNode,
    nodes: &[Arc<NodeView>],
    excluded: &HashSet<String>,
    preferred_node: Option<&Arc<NodeView>>,
    sandbox_request: &SandboxRequest,
) -> Result<Arc<NodeView>, PlacementError> {
    if let Some(preferred) = preferred_node {
        if preferred.status == NodeStatus::Ready && !excluded.contains(&preferred.id) {
            info!(node_id = %preferred.id, "using preferred node");
            return Ok(preferred.clone());
        }
    }

    let requested = sandbox_request.resource_request();
    algorithm.choose_node(ctx, nodes, excluded, &requested).await
}
