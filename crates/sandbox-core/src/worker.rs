//! The worker-node capability this crate consumes but does not define. A
//! [`WorkerNode`] value is bound to one specific node — obtaining it for a
//! node chosen by placement is [`crate::orchestrator::WorkerNodeResolver`]'s
//! job. The wire format, transport, and retry classification for a given
//! failure are entirely the implementor's concern; this crate only needs to
//! know whether a create failure should be retried against a different
//! node.

use async_trait::async_trait;
use sandbox_placement::SandboxRequest;
use sandbox_store::{RemovalAction, RequestContext, Sandbox};

/// Distinguishes a worker-RPC failure that should feed the refused node back
/// into `excluded` and retry placement from one that should fail the whole
/// attempt outright.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateFailure {
    /// The node refused or failed the create; try a different one.
    Retryable,
    /// The failure is not node-specific; do not retry.
    Fatal,
}

#[derive(Debug, thiserror::Error)]
#[error("worker refused sandbox create: {source}")]
pub struct CreateError {
    pub kind: CreateFailure,
    #[source]
    pub source: anyhow::Error,
}

impl CreateError {
    pub fn retryable(source: impl Into<anyhow::Error>) -> Self {
        Self {
            kind: CreateFailure::Retryable,
            source: source.into(),
        }
    }

    pub fn fatal(source: impl Into<anyhow::Error>) -> Self {
        Self {
            kind: CreateFailure::Fatal,
            source: source.into(),
        }
    }
}

/// Opaque worker-node capability: create, delete, and signal a sandbox on
/// the node it is bound to. The wire format is unspecified here; an
/// implementation typically wraps a gRPC client bound to the node it was
/// resolved for.
#[async_trait]
pub trait WorkerNode: Send + Sync {
    async fn create_sandbox(
        &self,
        ctx: &RequestContext,
        sandbox_id: &str,
        request: &SandboxRequest,
    ) -> Result<Sandbox, CreateError>;

    async fn delete_sandbox(&self, ctx: &RequestContext, sandbox_id: &str) -> anyhow::Result<()>;

    async fn signal_sandbox(
        &self,
        ctx: &RequestContext,
        sandbox_id: &str,
        action: RemovalAction,
    ) -> anyhow::Result<()>;
}
