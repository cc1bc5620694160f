//! Inbound request shapes for the placement engine.

use crate::node::MachineInfo;

/// `requested := {CPUs, MiBMemory}` plus the build's CPU compatibility
/// requirement, threaded through every algorithm and filter.
#[derive(Debug, Clone, Default)]
pub struct ResourceRequest {
    pub cpus: f64,
    pub mib_memory: u64,
    pub build_machine_info: Option<MachineInfo>,
}

/// What a caller supplies to [`crate::orchestration::place_sandbox`];
/// `vcpu`/`ram_mb`/`build_machine_info` are the minimum fields any
/// algorithm needs to score or filter candidates.
#[derive(Debug, Clone, Default)]
pub struct SandboxRequest {
    pub vcpu: f64,
    pub ram_mb: u64,
    pub build_machine_info: Option<MachineInfo>,
}

impl SandboxRequest {
    pub fn resource_request(&self) -> ResourceRequest {
        ResourceRequest {
            cpus: self.vcpu,
            mib_memory: self.ram_mb,
            build_machine_info: self.build_machine_info.clone(),
        }
    }
}
