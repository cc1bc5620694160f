//! Facade-level error taxonomy, wrapping the lower-level reservation,
//! placement, and store errors a caller of
//! [`crate::orchestrator::SandboxOrchestrator`] can encounter.

use thiserror::Error;

use sandbox_placement::PlacementError;
use sandbox_store::{ContextError, ReservationError, StoreError};

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Reservation(#[from] ReservationError),

    #[error(transparent)]
    Placement(#[from] PlacementError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Context(#[from] ContextError),

    #[error("worker rejected sandbox create after exhausting candidate nodes")]
    NoNodeAccepted,

    #[error("worker operation failed: {0}")]
    Worker(#[source] anyhow::Error),
}
