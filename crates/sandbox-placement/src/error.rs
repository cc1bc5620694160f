//! Placement error taxonomy.

use thiserror::Error;

use sandbox_store::ContextError;

#[derive(Debug, Error)]
pub enum PlacementError {
    #[error("no node available")]
    NoNodeAvailable,
    #[error(transparent)]
    Context(#[from] ContextError),
}
