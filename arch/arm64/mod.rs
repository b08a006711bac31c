//! ARM64 (AArch64) Architecture Support for Ferrovisor VGIC
//!
//! This module provides the ARM64 pieces a guest interrupt controller needs:
//! - Interrupt controller emulation (virtual GICv3)
//! - vCPU exit decoding and the run loop hand-off (flush/sync)
//! - WFI blocking on pending virtual interrupts
//! - Virtual timer driving its private interrupt
//!
//! ## References
//! - [ARM Architecture Reference Manual ARMv8-A](https://developer.arm.com/documentation/ddi0487/latest)
//! - [ARM Generic Interrupt Controller Architecture Specification](https://developer.arm.com/documentation/ihi0069/latest)
//! - [Xvisor ARM Implementation](https://github.com/xvisor/xvisor)

pub mod cpu;
pub mod interrupt;
pub mod timer;
