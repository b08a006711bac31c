//! Virtual Timer for ARM64
//!
//! Emulates one vCPU's CNTV_CTL/CNTV_CVAL pair and drives the timer PPI as a
//! level-sensitive line. The line follows `ISTATUS && !IMASK` and is
//! re-evaluated on every guest register write and whenever the host timer
//! backing the deadline fires.
//!
//! [`VirtualTimer::expire`] runs in host timer callback context; it only
//! takes the timer's own lock and then the interrupt controller's.
//!
//! ## References
//! - [ARM Architecture Reference Manual ARMv8-A](https://developer.arm.com/documentation/ddi0487/latest), D11.2.4

use alloc::sync::Arc;
use spin::Mutex;

use super::ctrl;
use crate::arch::arm64::interrupt::vgic::{Vgic, VgicError};
use crate::core::vmm::VcpuId;

/// Virtual timer interrupt (PPI 27)
pub const VTIMER_PPI: u32 = 27;

#[derive(Debug, Clone, Copy, Default)]
struct TimerRegs {
    ctl: u64,
    cval: u64,
}

impl TimerRegs {
    fn istatus(&self, now: u64) -> bool {
        self.ctl & ctrl::ENABLE != 0 && now >= self.cval
    }

    fn output(&self, now: u64) -> bool {
        self.istatus(now) && self.ctl & ctrl::IMASK == 0
    }
}

/// Virtual timer of one vCPU
pub struct VirtualTimer {
    vcpu: VcpuId,
    irq: u32,
    vgic: Arc<Vgic>,
    regs: Mutex<TimerRegs>,
}

impl VirtualTimer {
    /// Create a disabled timer for `vcpu` on [`VTIMER_PPI`]
    pub fn new(vgic: Arc<Vgic>, vcpu: VcpuId) -> Self {
        Self::with_irq(vgic, vcpu, VTIMER_PPI)
    }

    /// Create with specific IRQ
    pub fn with_irq(vgic: Arc<Vgic>, vcpu: VcpuId, irq: u32) -> Self {
        Self { vcpu, irq, vgic, regs: Mutex::new(TimerRegs::default()) }
    }

    /// Guest view of CNTV_CTL at counter value `now`
    pub fn ctl(&self, now: u64) -> u64 {
        let regs = self.regs.lock();
        let status = if regs.istatus(now) { ctrl::ISTATUS } else { 0 };
        (regs.ctl & (ctrl::ENABLE | ctrl::IMASK)) | status
    }

    /// CNTV_CVAL
    pub fn cval(&self) -> u64 {
        self.regs.lock().cval
    }

    /// Guest write to CNTV_CTL. ISTATUS is read-only.
    pub fn write_ctl(&self, val: u64, now: u64) -> Result<(), VgicError> {
        let mut regs = self.regs.lock();
        regs.ctl = val & (ctrl::ENABLE | ctrl::IMASK);
        self.update(&regs, now)
    }

    /// Guest write to CNTV_CVAL
    pub fn write_cval(&self, val: u64, now: u64) -> Result<(), VgicError> {
        let mut regs = self.regs.lock();
        regs.cval = val;
        self.update(&regs, now)
    }

    /// Counter value at which the host must call [`VirtualTimer::expire`],
    /// if the output is currently low and would rise
    pub fn deadline(&self, now: u64) -> Option<u64> {
        let regs = self.regs.lock();
        let armed = regs.ctl & ctrl::ENABLE != 0 && regs.ctl & ctrl::IMASK == 0;
        (armed && !regs.output(now)).then_some(regs.cval)
    }

    /// Host timer callback
    pub fn expire(&self, now: u64) -> Result<(), VgicError> {
        let regs = self.regs.lock();
        log::trace!("vtimer: vcpu{} expire at {:#x}", self.vcpu, now);
        self.update(&regs, now)
    }

    // Injected under the timer lock so updates reach the controller in order.
    fn update(&self, regs: &TimerRegs, now: u64) -> Result<(), VgicError> {
        self.vgic.inject_irq(Some(self.vcpu), self.irq, regs.output(now))
    }
}
