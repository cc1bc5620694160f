//! Node discovery surface — consumed, not owned by this crate. An upstream
//! discovery component yields these items; placement only reads the
//! resulting [`crate::node::NodeView`] list built from them. No refresh
//! loop, dedup, or liveness logic lives here: the feed is assumed to be
//! eventually consistent, may include transient duplicates, and is
//! refreshed periodically by its owner.

/// One entry from the upstream discovery feed. `local_ip_address` and
/// `local_instance_api_port` are optional because some deployments resolve
/// the worker endpoint by `node_id`/`instance_id` through a separate
/// directory instead of publishing it here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredItem {
    pub unique_identifier: String,
    pub node_id: String,
    pub instance_id: String,
    pub local_ip_address: Option<String>,
    pub local_instance_api_port: Option<u16>,
}
