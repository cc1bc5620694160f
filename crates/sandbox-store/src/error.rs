//! Error taxonomy for the store and reservation layers.

use thiserror::Error;
use uuid::Uuid;

use crate::context::ContextError;
use crate::model::SandboxState;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sandbox '{0}' not found")]
    NotFound(String),

    #[error("sandbox '{0}' is being evicted")]
    BeingEvicted(String),

    #[error("invalid state transition from {from:?} to {to:?}")]
    InvalidTransition {
        from: SandboxState,
        to: SandboxState,
    },

    #[error("invalid state transition, already in transition from {0:?}")]
    AlreadyInTransition(SandboxState),

    #[error(transparent)]
    Context(#[from] ContextError),

    #[error("transient infrastructure error: {0}")]
    Transient(#[source] anyhow::Error),

    #[error("invariant violation: {0}")]
    Invariant(#[source] anyhow::Error),
}

#[derive(Debug, Error)]
pub enum ReservationError {
    #[error("team {0} exceeded its concurrency limit")]
    LimitExceeded(Uuid),

    #[error(transparent)]
    Context(#[from] ContextError),

    #[error("reservation backend error: {0}")]
    Backend(#[source] anyhow::Error),
}
