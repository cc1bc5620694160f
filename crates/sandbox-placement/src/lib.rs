//! Node placement for new sandboxes: the pluggable [`algorithm::ChooseNode`]
//! interface, its `LeastBusy` and `BestOfK` implementations, and the
//! [`orchestration::place_sandbox`] wrapper that adds preferred-node
//! shortcutting.

pub mod algorithm;
pub mod best_of_k;
pub mod discovery;
pub mod error;
pub mod least_busy;
pub mod node;
pub mod orchestration;
pub mod request;

pub use algorithm::{ChooseNode, FilterPolicy};
pub use best_of_k::{BestOfKAlgorithm, BestOfKConfig};
pub use discovery::DiscoveredItem;
pub use error::PlacementError;
pub use least_busy::{LeastBusyAlgorithm, LeastBusyConfig};
pub use node::{InProgressStart, MachineInfo, NodeMetrics, NodeStatus, NodeView, PlacementMetrics};
pub use orchestration::place_sandbox;
pub use request::{ResourceRequest, SandboxRequest};
