//! Sandbox state storage: the durable record of every sandbox's lifecycle
//! state, plus the per-team reservation bookkeeping that guards admission
//! before a record exists.
//!
//! Two interchangeable [`StateStore`] backends are provided: an in-process
//! [`store::memory::InMemoryStore`] for single-node deployments and tests,
//! and a [`store::replicated::ReplicatedStore`] for multi-process
//! deployments coordinating over Redis.

pub mod context;
pub mod error;
pub mod model;
pub mod reservation;
pub mod singleshot;
pub mod store;

pub use context::{ContextError, RequestContext};
pub use error::{ReservationError, StoreError};
pub use model::{allowed_transition, RemovalAction, Sandbox, SandboxId, SandboxState};
pub use reservation::{FinishFn, ReservationManager, ReserveOutcome};
pub use singleshot::SingleShot;
pub use store::memory::InMemoryStore;
pub use store::replicated::{ReplicatedStore, ReplicatedStoreConfig};
pub use store::{ItemsFilter, StartRemovingOutcome, StateStore, TransitionCallback, UpdateFn};
