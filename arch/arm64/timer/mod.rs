//! ARM Generic Timer support for ARM64 guests
//!
//! Only the virtual timer (CNTV) is modelled. Its output is wired to a
//! private interrupt of the owning vCPU.
//!
//! ## Timer Registers
//!
//! - `CNTV_CTL`: Control register (enable, mask, status)
//! - `CNTV_CVAL`: Compare value register (absolute)
//!
//! ## References
//! - [ARM Architecture Reference Manual ARMv8-A](https://developer.arm.com/documentation/ddi0487/latest)
//! - [Xvisor Generic Timer](https://github.com/xvisor/xvisor)

/// Virtual Timer module
pub mod virtual_timer;

pub use virtual_timer::{VirtualTimer, VTIMER_PPI};

/// Timer control register bits
pub mod ctrl {
    /// Timer enable bit
    pub const ENABLE: u64 = 1 << 0;
    /// Timer interrupt mask bit
    pub const IMASK: u64 = 1 << 1;
    /// Timer interrupt status bit
    pub const ISTATUS: u64 = 1 << 2;
}
