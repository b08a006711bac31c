//! VCPU run loop for ARM64
//!
//! One iteration of [`run_once`] brackets a guest entry with the interrupt
//! controller hand-off and dispatches the exit:
//!
//! 1. mark the vCPU running and flush pending interrupts into the list
//!    registers, again if an injection raced the flush
//! 2. load the list-register image and enter the guest
//! 3. save the image back and sync it into the interrupt records
//! 4. route the exit to the trap that claims it
//!
//! The flush/sync pair runs on the vCPU's own thread with no controller
//! lock held across guest execution.
//!
//! Reference: xvisor/arch/arm/cpu/arm64/cpu_vcpu_helper.c

/// Exit syndrome decoding
pub mod trap;

pub use trap::{ExitReason, MmioAccess, SysRegAccess};

use crate::arch::arm64::cpu::wfi;
use crate::arch::arm64::interrupt::vgic::{MmioFault, VgicCpuOps, VgicHwState};
use crate::core::vmm::{VcpuId, VcpuState, VirtualMachine};
use crate::{Error, Result};

/// Raw exit from guest mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuestExit {
    /// Synchronous exception with ESR_EL2 and the faulting IPA
    Sync { esr: u64, ipa: u64 },
    /// Physical IRQ
    Irq,
}

/// Guest register file and world switch of one vCPU
pub trait GuestContext {
    /// Run the guest with `hw` loaded into the CPU interface until it exits.
    /// `hw` holds the saved interface state on return.
    fn enter(&mut self, hw: &mut VgicHwState) -> GuestExit;

    /// Read general purpose register `n`; 31 reads as zero
    fn gpr(&self, n: u8) -> u64;

    /// Write general purpose register `n`; writes to 31 are ignored
    fn set_gpr(&mut self, n: u8, val: u64);

    /// Step over the trapped instruction
    fn advance_pc(&mut self);

    /// Reflect a synchronous external abort at `addr` to the guest
    fn inject_data_abort(&mut self, addr: u64);
}

/// Outcome of one run loop iteration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VcpuExit {
    /// Exit was handled; run again
    Handled,
    /// Exit is not for the interrupt controller
    Unhandled(ExitReason),
}

/// Enter `vcpu` once and dispatch its exit
pub fn run_once(vm: &VirtualMachine, vcpu: VcpuId, ctx: &mut dyn GuestContext) -> Result<VcpuExit> {
    let vgic = vm.vgic();
    let slot = vm.host().vcpu(vcpu).ok_or(Error::NotFound)?;
    if !slot.state().is_active() {
        return Err(Error::InvalidState);
    }

    // From here on an injection is either seen by the flush or posts a wakeup.
    slot.set_state(VcpuState::Running(vm.host().host_cpu().current_cpu()));
    slot.take_wakeup();
    vgic.flush_hwstate(vcpu);
    while slot.take_wakeup() {
        vgic.sync_hwstate(vcpu);
        vgic.flush_hwstate(vcpu);
    }
    let Some(mut hw) = vgic.hw_state(vcpu) else {
        slot.set_state(VcpuState::Ready);
        return Err(Error::NotInitialized);
    };

    let exit = ctx.enter(&mut hw);

    vgic.store_hw_state(vcpu, &hw);
    vgic.sync_hwstate(vcpu);
    slot.set_state(VcpuState::Ready);

    let reason = match exit {
        GuestExit::Irq => return Ok(VcpuExit::Handled),
        GuestExit::Sync { esr, ipa } => ExitReason::from_esr(esr, ipa),
    };
    log::trace!("vcpu{}: exit {:?}", vcpu, reason);

    match reason {
        ExitReason::DataAbort(access) if vm.host().mmio_trapped(access.addr) => {
            handle_mmio(vm, vcpu, ctx, &access);
            Ok(VcpuExit::Handled)
        }
        ExitReason::SysReg(access) if vm.host().sysreg_trapped(access.enc) => {
            if access.write {
                vgic.sysreg_write(vcpu, access.enc, ctx.gpr(access.rt));
            } else {
                ctx.set_gpr(access.rt, vgic.sysreg_read(vcpu, access.enc));
            }
            ctx.advance_pc();
            Ok(VcpuExit::Handled)
        }
        ExitReason::Wfi => {
            wfi::wait_for_irq(vm, vcpu);
            ctx.advance_pc();
            Ok(VcpuExit::Handled)
        }
        other => Ok(VcpuExit::Unhandled(other)),
    }
}

fn handle_mmio(vm: &VirtualMachine, vcpu: VcpuId, ctx: &mut dyn GuestContext, access: &MmioAccess) {
    let vgic = vm.vgic();
    let result = if access.write {
        let val = ctx.gpr(access.srt);
        vgic.mmio_write(vcpu, access.addr, access.size, val)
    } else {
        vgic.mmio_read(vcpu, access.addr, access.size).map(|val| {
            ctx.set_gpr(access.srt, access.extend(val));
        })
    };
    match result {
        Ok(()) => ctx.advance_pc(),
        Err(MmioFault::ExternalAbort) => {
            log::debug!("vcpu{}: external abort at {:#x}", vcpu, access.addr);
            ctx.inject_data_abort(access.addr);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::arm64::interrupt::gic::GicVersion;
    use crate::arch::arm64::interrupt::vgic::{Vgic, VgicDescriptor, VgicHost, VgicLr, VgicLrFlags};
    use crate::config::VgicConfig;
    use crate::core::vmm::HostCpu;
    use alloc::sync::Arc;
    use core::sync::atomic::{AtomicBool, Ordering};
    use spin::Once;

    struct NullCpu;

    impl HostCpu for NullCpu {
        fn current_cpu(&self) -> usize {
            0
        }
        fn kick(&self, _cpu: usize) {}
        fn park(&self, _vcpu: VcpuId) {}
        fn unpark(&self, _vcpu: VcpuId) {}
    }

    /// Replays scripted exits and records what the dispatcher did
    struct Script {
        exits: Vec<GuestExit>,
        regs: [u64; 32],
        entries: Vec<VgicHwState>,
        pc_steps: usize,
        aborts: Vec<u64>,
    }

    impl Script {
        fn new(exits: Vec<GuestExit>) -> Self {
            Self { exits, regs: [0; 32], entries: Vec::new(), pc_steps: 0, aborts: Vec::new() }
        }
    }

    impl GuestContext for Script {
        fn enter(&mut self, hw: &mut VgicHwState) -> GuestExit {
            self.entries.push(*hw);
            self.exits.remove(0)
        }
        fn gpr(&self, n: u8) -> u64 {
            if n == 31 { 0 } else { self.regs[n as usize] }
        }
        fn set_gpr(&mut self, n: u8, val: u64) {
            if n != 31 {
                self.regs[n as usize] = val;
            }
        }
        fn advance_pc(&mut self) {
            self.pc_steps += 1;
        }
        fn inject_data_abort(&mut self, addr: u64) {
            self.aborts.push(addr);
        }
    }

    const DIST: u64 = 0x0800_0000;
    const REDIST: u64 = 0x080a_0000;

    /// Injects SGI 3 into vCPU 0 the first time the run loop asks which
    /// host CPU it is on, i.e. right as the vCPU is about to enter.
    struct RacingCpu {
        vgic: Once<Arc<Vgic>>,
        fired: AtomicBool,
    }

    impl HostCpu for RacingCpu {
        fn current_cpu(&self) -> usize {
            if !self.fired.swap(true, Ordering::SeqCst) {
                if let Some(vgic) = self.vgic.get() {
                    vgic.inject_irq(Some(0), 3, true).unwrap();
                }
            }
            0
        }
        fn kick(&self, _cpu: usize) {}
        fn park(&self, _vcpu: VcpuId) {}
        fn unpark(&self, _vcpu: VcpuId) {}
    }

    fn vm() -> VirtualMachine {
        vm_on(Arc::new(NullCpu))
    }

    fn vm_on(cpu: Arc<dyn HostCpu>) -> VirtualMachine {
        let config = VgicConfig { nirqs: 128, lr_count: 4, max_vcpus: 4 };
        let vm = VirtualMachine::new(0, config, cpu).unwrap();
        vm.create_vcpu(0).unwrap();
        vm.create_vcpu(1).unwrap();
        vm.attach_vgic(&VgicDescriptor {
            dist_base: DIST,
            dist_size: 0x10000,
            redist_base: REDIST,
            redist_size: 0x60000,
            version: GicVersion::V3,
        })
        .unwrap();
        vm
    }

    fn dabt(addr: u64, sas: u32, write: bool, srt: u32) -> GuestExit {
        let iss = (1 << 24) | (sas << 22) | (srt << 16) | (1 << 15) | (u32::from(write) << 6);
        GuestExit::Sync { esr: (0b100100u64 << 26) | u64::from(iss), ipa: addr }
    }

    #[test]
    fn test_mmio_read_dispatch() {
        let vm = vm();
        // GICD_IIDR
        let mut ctx = Script::new(vec![dabt(DIST + 0x8, 2, false, 7)]);
        assert_eq!(run_once(&vm, 0, &mut ctx), Ok(VcpuExit::Handled));
        assert_eq!(ctx.regs[7], 0x43b);
        assert_eq!(ctx.pc_steps, 1);
    }

    #[test]
    fn test_mmio_write_then_flush() {
        let vm = vm();
        let mut ctx = Script::new(vec![
            // ISPENDR0 on vcpu0's SGI frame, SGI 2
            dabt(REDIST + 0x10000 + 0x200, 2, true, 1),
            GuestExit::Irq,
        ]);
        ctx.regs[1] = 1 << 2;
        assert_eq!(run_once(&vm, 0, &mut ctx), Ok(VcpuExit::Handled));
        assert_eq!(run_once(&vm, 0, &mut ctx), Ok(VcpuExit::Handled));
        assert_eq!(ctx.entries[0].lr[0], 0);
        assert_eq!(VgicLr::from_ich_lr(ctx.entries[1].lr[0]).virtid, 2);
    }

    #[test]
    fn test_absent_redistributor_aborts() {
        let vm = vm();
        // vcpu2's frame is in range but the vcpu was never created.
        let mut ctx = Script::new(vec![dabt(REDIST + 2 * 0x20000 + 0x8, 2, false, 0)]);
        assert_eq!(run_once(&vm, 0, &mut ctx), Ok(VcpuExit::Handled));
        assert_eq!(ctx.aborts, vec![REDIST + 2 * 0x20000 + 0x8]);
        assert_eq!(ctx.pc_steps, 0);
    }

    #[test]
    fn test_sgi_sysreg_dispatch() {
        let vm = vm();
        // msr icc_sgi1r_el1, x3
        let iss: u64 = (3 << 20) | (5 << 17) | (12 << 10) | (3 << 5) | (11 << 1);
        let mut ctx = Script::new(vec![GuestExit::Sync { esr: (0b011000 << 26) | iss, ipa: 0 }]);
        // SGI 1 to Aff0 1
        ctx.regs[3] = (1 << 24) | 0b10;
        assert_eq!(run_once(&vm, 0, &mut ctx), Ok(VcpuExit::Handled));
        assert!(vm.vgic().has_pending_irq(1));
        assert!(!vm.vgic().has_pending_irq(0));
    }

    #[test]
    fn test_untrapped_exit_returns() {
        let vm = vm();
        let hvc = GuestExit::Sync { esr: 0b010110 << 26, ipa: 0 };
        let mut ctx = Script::new(vec![hvc, dabt(0x1000, 2, false, 0)]);
        assert_eq!(run_once(&vm, 0, &mut ctx), Ok(VcpuExit::Unhandled(ExitReason::Other(0b010110))));
        assert!(matches!(
            run_once(&vm, 0, &mut ctx),
            Ok(VcpuExit::Unhandled(ExitReason::DataAbort(_)))
        ));
    }

    #[test]
    fn test_uncreated_vcpu() {
        let vm = vm();
        let mut ctx = Script::new(vec![GuestExit::Irq]);
        assert_eq!(run_once(&vm, 3, &mut ctx), Err(Error::InvalidState));
        assert_eq!(run_once(&vm, 9, &mut ctx), Err(Error::NotFound));
    }

    #[test]
    fn test_mmio_read_past_region_end() {
        let vm = vm();
        let mut ctx = Script::new(vec![
            dabt(DIST + 0xfffe, 2, false, 4),
            dabt(DIST + 0xfffe, 2, true, 4),
        ]);
        ctx.regs[4] = 0xdead;
        assert_eq!(run_once(&vm, 0, &mut ctx), Ok(VcpuExit::Handled));
        assert_eq!(ctx.regs[4], 0);
        assert_eq!(run_once(&vm, 0, &mut ctx), Ok(VcpuExit::Handled));
        assert_eq!(ctx.pc_steps, 2);
        assert!(ctx.aborts.is_empty());
    }

    #[test]
    fn test_injection_at_entry_is_loaded() {
        let cpu = Arc::new(RacingCpu { vgic: Once::new(), fired: AtomicBool::new(false) });
        let vm = vm_on(cpu.clone());
        cpu.vgic.call_once(|| vm.vgic().clone());

        let mut ctx = Script::new(vec![GuestExit::Irq]);
        assert_eq!(run_once(&vm, 0, &mut ctx), Ok(VcpuExit::Handled));
        assert!(cpu.fired.load(Ordering::SeqCst));
        let lr = VgicLr::from_ich_lr(ctx.entries[0].lr[0]);
        assert_eq!(lr.virtid, 3);
        assert!(lr.flags.contains(VgicLrFlags::STATE_PENDING));
        assert_eq!(vm.host().vcpu(0).unwrap().state(), VcpuState::Ready);
    }

    #[test]
    fn test_entry_consumes_earlier_wakeup() {
        let vm = vm();
        // Posted while the vCPU is merely Ready.
        vm.host().notify(0);
        let mut ctx = Script::new(vec![GuestExit::Irq]);
        assert_eq!(run_once(&vm, 0, &mut ctx), Ok(VcpuExit::Handled));
        assert!(!vm.host().vcpu(0).unwrap().take_wakeup());
    }
}
