//! CPU module for ARM64
//!
//! This module provides the vCPU side of interrupt delivery:
//! - Exit decoding and the guest entry loop
//! - WFI handling

pub mod vcpu;
pub mod wfi;

pub use vcpu::{run_once, ExitReason, GuestContext, GuestExit, VcpuExit};
