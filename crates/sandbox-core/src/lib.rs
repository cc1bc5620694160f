//! Facade composing the Placement Engine ([`sandbox_placement`]) and the
//! Sandbox State Store ([`sandbox_store`]) into the create and pause/kill
//! control flows: the orchestration layer callers actually talk to, backed
//! by the lower persistence/placement crates.

pub mod error;
pub mod orchestrator;
pub mod worker;

pub use error::OrchestratorError;
pub use orchestrator::{OrchestratorConfig, SandboxOrchestrator, WorkerNodeResolver};
pub use worker::{CreateError, CreateFailure, WorkerNode};
