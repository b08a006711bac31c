//! Ferrovisor VGIC - virtual GICv3 emulation for the Ferrovisor hypervisor
//!
//! This library provides the guest-facing interrupt controller model used by
//! Ferrovisor ARM64 virtual machines: the per-VM distributor, the per-vCPU
//! redistributors, the list-register scheduler that feeds the hardware
//! virtual CPU interface, and the injection engine used by timers, virtual
//! MSI and SGI emulation.
//!
//! The crate is `no_std` + `alloc`; host-side unit tests build with std.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

// Core modules
#[macro_use]
pub mod utils;
pub mod config;

// Architecture-specific code
pub mod arch;

// VM object model driving the controller
pub mod core;

// Re-export key types for convenience
pub use arch::arm64::interrupt::vgic::{
    MmioFault, Vgic, VgicCpuOps, VgicDescriptor, VgicError, VgicHost, VgicTrap,
};
pub use config::VgicConfig;

/// Ferrovisor VGIC version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Common error type for Ferrovisor VGIC
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Invalid argument
    InvalidArgument,
    /// Not found
    NotFound,
    /// Resource busy
    ResourceBusy,
    /// Not initialized
    NotInitialized,
    /// Invalid state
    InvalidState,
    /// Interrupt controller error
    Vgic(VgicError),
}

impl From<VgicError> for Error {
    fn from(err: VgicError) -> Self {
        Error::Vgic(err)
    }
}

impl ::core::fmt::Display for Error {
    fn fmt(&self, f: &mut ::core::fmt::Formatter<'_>) -> ::core::fmt::Result {
        match self {
            Error::InvalidArgument => write!(f, "invalid argument"),
            Error::NotFound => write!(f, "not found"),
            Error::ResourceBusy => write!(f, "resource busy"),
            Error::NotInitialized => write!(f, "not initialized"),
            Error::InvalidState => write!(f, "invalid state"),
            Error::Vgic(err) => write!(f, "vgic: {}", err),
        }
    }
}

/// Result type alias
pub type Result<T> = ::core::result::Result<T, Error>;
