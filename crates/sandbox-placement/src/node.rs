//! Read-only node snapshot plus the mutable in-flight-start tracker.
//! Owned by a node-manager collaborator that refreshes metrics and status
//! externally; placement only reads.

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Opaque identifier for a sandbox undergoing placement, used as the key in
/// [`PlacementMetrics::in_progress`].
pub type SandboxId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Ready,
    Unhealthy,
    Draining,
}

/// CPU compatibility descriptor. An empty descriptor (all fields blank)
/// matches any node's hardware.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineInfo {
    pub cpu_architecture: String,
    pub cpu_family: String,
    pub cpu_model: String,
    pub cpu_model_name: String,
    pub cpu_flags: Vec<String>,
}

impl MachineInfo {
    pub fn is_unspecified(&self) -> bool {
        self.cpu_architecture.is_empty() && self.cpu_family.is_empty() && self.cpu_model.is_empty()
    }

    /// `self` is the node's hardware, `required` is the build's requirement.
    pub fn satisfies(&self, required: &MachineInfo) -> bool {
        required.is_unspecified()
            || (self.cpu_architecture == required.cpu_architecture
                && self.cpu_family == required.cpu_family
                && self.cpu_model == required.cpu_model)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NodeMetrics {
    pub cpu_count: u32,
    /// 0..=100*cpu_count; aggregate usage across all cores.
    pub cpu_percent: f64,
    pub cpu_allocated: f64,
    pub memory_total_bytes: u64,
    pub memory_used_bytes: u64,
    pub memory_allocated_bytes: u64,
}

impl NodeMetrics {
    /// `cpu_percent` expressed in CPU-core units, comparable to a
    /// [`crate::request::ResourceRequest::cpus`] value.
    pub fn cpu_usage_cores(&self) -> f64 {
        self.cpu_percent / 100.0
    }

    pub fn usage_fraction(&self) -> f64 {
        self.cpu_percent / 100.0
    }
}

/// A sandbox currently being started on a node, tracked until the node
/// manager folds it into confirmed `NodeMetrics`.
#[derive(Debug, Clone, Copy)]
pub struct InProgressStart {
    pub cpus: f64,
    pub mib_memory: u64,
}

/// Mutable sub-object updated as placements are attempted and as nodes
/// confirm or reject them.
#[derive(Debug, Clone, Default)]
pub struct PlacementMetrics {
    pub in_progress: HashMap<SandboxId, InProgressStart>,
}

impl PlacementMetrics {
    pub fn in_progress_count(&self) -> usize {
        self.in_progress.len()
    }

    pub fn in_progress_cpus(&self) -> f64 {
        self.in_progress.values().map(|s| s.cpus).sum()
    }
}

/// Read-only node snapshot, shared across concurrent placement calls.
#[derive(Debug)]
pub struct NodeView {
    pub id: String,
    pub status: NodeStatus,
    pub machine_info: MachineInfo,
    pub metrics: NodeMetrics,
    pub placement: RwLock<PlacementMetrics>,
}

impl NodeView {
    pub fn new(id: impl Into<String>, status: NodeStatus, metrics: NodeMetrics) -> Self {
        Self {
            id: id.into(),
            status,
            machine_info: MachineInfo::default(),
            metrics,
            placement: RwLock::new(PlacementMetrics::default()),
        }
    }

    pub fn with_machine_info(mut self, machine_info: MachineInfo) -> Self {
        self.machine_info = machine_info;
        self
    }

    /// `allocated_cpu + requested_cpus <= overcommit_ratio * cpu_count`.
    pub fn can_fit(&self, requested_cpus: f64, overcommit_ratio: f64) -> bool {
        self.metrics.cpu_allocated + requested_cpus <= overcommit_ratio * self.metrics.cpu_count as f64
    }

    /// `metrics.CpuUsage + sum of CPUs reserved by in-progress starts`,
    /// LeastBusy's load figure.
    pub fn effective_cpu(&self) -> f64 {
        self.metrics.cpu_usage_cores() + self.placement.read().in_progress_cpus()
    }
}
