//! Core hypervisor modules
//!
//! The VM object model the interrupt controller is embedded in: VM
//! lifecycle, vCPU run state and wakeup.

pub mod vmm;
