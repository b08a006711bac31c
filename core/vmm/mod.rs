//! Virtual machine management
//!
//! A [`VirtualMachine`] owns its virtual interrupt controller and the vCPU
//! run-state table the controller uses to wake vCPUs.

pub mod vcpu;
pub mod vm;

/// Virtual machine identifier
pub type VmId = u32;

/// vCPU index within a VM
pub type VcpuId = usize;

pub use vcpu::{VcpuState, VirtualCpu};
pub use vm::{HostCpu, VirtualMachine, VmHost};
