//! Interrupt handling for ARM64
//!
//! Provides the virtual GICv3 used by guest VMs.

/// GICv3 architectural definitions
pub mod gic;

/// VGIC (Virtual GIC) implementation
pub mod vgic;

// Re-export commonly used types
pub use gic::{gicd, gicr, icc, ich, GicVersion};
pub use vgic::{
    IrqConfig, IrqState, MmioFault, Vgic, VgicCpuOps, VgicDescriptor, VgicError, VgicHost,
    VgicHwState, VgicLr, VgicLrFlags, VgicTrap, VGIC_MAX_LRS,
};
