//! WFI (Wait For Interrupt) Handling for ARM64
//!
//! With HCR_EL2.TWI set, a guest WFI traps to EL2. The vCPU thread then
//! parks until its interrupt controller has something for it or another
//! thread notifies it.
//!
//! ## Lost wakeups
//!
//! The vCPU publishes `Blocked` before checking for work, and notifiers
//! publish their wakeup before reading the run state. Either the waiter sees
//! the wakeup or the notifier sees `Blocked` and unparks it; an unpark that
//! lands before the park is kept by [`HostCpu::park`](crate::core::vmm::HostCpu).
//!
//! ## References
//! - [ARM Architecture Reference Manual ARMv8-A](https://developer.arm.com/documentation/ddi0487/latest)
//! - [Xvisor WFI Implementation](https://github.com/xvisor/xvisor)

use crate::arch::arm64::interrupt::vgic::VgicCpuOps;
use crate::core::vmm::{VcpuId, VcpuState, VirtualMachine};

/// Block `vcpu` until it has a pending interrupt or is notified
pub fn wait_for_irq(vm: &VirtualMachine, vcpu: VcpuId) {
    let Some(slot) = vm.host().vcpu(vcpu) else {
        return;
    };
    let vgic = vm.vgic();

    slot.set_state(VcpuState::Blocked);
    loop {
        if vgic.has_pending_irq(vcpu) || slot.take_wakeup() {
            break;
        }
        log::trace!("vcpu{}: wfi park", vcpu);
        vm.host().host_cpu().park(vcpu);
    }
    slot.set_state(VcpuState::Ready);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::arm64::interrupt::gic::GicVersion;
    use crate::arch::arm64::interrupt::vgic::{VgicDescriptor, VgicHost};
    use crate::config::VgicConfig;
    use crate::core::vmm::HostCpu;
    use alloc::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Condvar, Mutex};
    use std::thread;

    /// Token-based park/unpark, like `std::thread::park`
    #[derive(Default)]
    struct ParkCpu {
        token: Mutex<bool>,
        cond: Condvar,
        parks: AtomicUsize,
    }

    impl HostCpu for ParkCpu {
        fn current_cpu(&self) -> usize {
            0
        }

        fn kick(&self, _cpu: usize) {}

        fn park(&self, _vcpu: VcpuId) {
            self.parks.fetch_add(1, Ordering::SeqCst);
            let mut token = self.token.lock().unwrap();
            while !*token {
                token = self.cond.wait(token).unwrap();
            }
            *token = false;
        }

        fn unpark(&self, _vcpu: VcpuId) {
            *self.token.lock().unwrap() = true;
            self.cond.notify_all();
        }
    }

    fn vm(cpu: Arc<ParkCpu>) -> VirtualMachine {
        let config = VgicConfig { nirqs: 64, lr_count: 4, max_vcpus: 2 };
        let vm = VirtualMachine::new(0, config, cpu).unwrap();
        vm.create_vcpu(0).unwrap();
        vm.attach_vgic(&VgicDescriptor {
            dist_base: 0,
            dist_size: 0x10000,
            redist_base: 0x10000,
            redist_size: 0x20000,
            version: GicVersion::V3,
        })
        .unwrap();
        vm
    }

    #[test]
    fn test_pending_irq_skips_park() {
        let cpu = Arc::new(ParkCpu::default());
        let vm = vm(cpu.clone());
        vm.vgic().inject_irq(Some(0), 5, true).unwrap();
        wait_for_irq(&vm, 0);
        assert_eq!(cpu.parks.load(Ordering::SeqCst), 0);
        assert_eq!(vm.host().vcpu(0).unwrap().state(), VcpuState::Ready);
    }

    #[test]
    fn test_earlier_notify_skips_park() {
        let cpu = Arc::new(ParkCpu::default());
        let vm = vm(cpu.clone());
        vm.host().notify(0);
        wait_for_irq(&vm, 0);
        assert_eq!(cpu.parks.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_injection_wakes_parked_vcpu() {
        let cpu = Arc::new(ParkCpu::default());
        let vm = Arc::new(vm(cpu.clone()));

        let waiter = {
            let vm = vm.clone();
            thread::spawn(move || wait_for_irq(&vm, 0))
        };
        while vm.host().vcpu(0).unwrap().state() != VcpuState::Blocked {
            thread::yield_now();
        }
        vm.vgic().inject_irq(Some(0), 1, true).unwrap();
        waiter.join().unwrap();
        assert!(vm.vgic().has_pending_irq(0));
    }
}
