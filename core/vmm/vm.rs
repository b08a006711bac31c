//! Virtual Machine (VM) Management
//!
//! This module handles the lifecycle of a virtual machine and the services
//! it provides to its interrupt controller.
//!
//! The controller and the VM must not own each other, so the VM side the
//! controller calls back into lives in [`VmHost`], which both hold by `Arc`.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;

use crate::arch::arm64::interrupt::vgic::{Vgic, VgicDescriptor, VgicHost, VgicTrap};
use crate::config::VgicConfig;
use crate::core::vmm::{VcpuId, VcpuState, VirtualCpu, VmId};
use crate::{Error, Result};

/// Platform services for reaching host CPUs and vCPU threads
pub trait HostCpu: Send + Sync {
    /// Index of the host CPU running the caller
    fn current_cpu(&self) -> usize;

    /// Force an exit from guest mode on host CPU `cpu`
    fn kick(&self, cpu: usize);

    /// Block the calling vCPU thread until [`HostCpu::unpark`].
    ///
    /// An unpark issued before park makes the next park return at once.
    fn park(&self, vcpu: VcpuId);

    /// Release a vCPU thread blocked in [`HostCpu::park`]
    fn unpark(&self, vcpu: VcpuId);
}

/// The part of a VM its interrupt controller calls back into
pub struct VmHost {
    vcpus: Box<[VirtualCpu]>,
    traps: Mutex<Vec<VgicTrap>>,
    host_cpu: Arc<dyn HostCpu>,
}

impl VmHost {
    fn new(max_vcpus: u16, host_cpu: Arc<dyn HostCpu>) -> Self {
        Self {
            vcpus: (0..usize::from(max_vcpus)).map(VirtualCpu::new).collect(),
            traps: Mutex::new(Vec::new()),
            host_cpu,
        }
    }

    /// vCPU slot `vcpu`
    pub fn vcpu(&self, vcpu: VcpuId) -> Option<&VirtualCpu> {
        self.vcpus.get(vcpu)
    }

    /// Platform CPU services
    pub fn host_cpu(&self) -> &dyn HostCpu {
        &*self.host_cpu
    }

    /// Currently registered traps
    pub fn traps(&self) -> Vec<VgicTrap> {
        self.traps.lock().clone()
    }

    /// Whether an access at `addr` starts in a registered range. Accesses
    /// running past the end are still claimed; the decoder treats them as
    /// RAZ/WI.
    pub fn mmio_trapped(&self, addr: u64) -> bool {
        self.traps.lock().iter().any(|trap| match *trap {
            VgicTrap::Mmio { base, size } => addr >= base && addr - base < size,
            VgicTrap::SysReg { .. } => false,
        })
    }

    /// Whether system register `enc` is registered
    pub fn sysreg_trapped(&self, enc: (u8, u8, u8, u8, u8)) -> bool {
        self.traps
            .lock()
            .iter()
            .any(|trap| matches!(*trap, VgicTrap::SysReg { enc: e } if e == enc))
    }
}

impl VgicHost for VmHost {
    fn vcpu_active(&self, vcpu: VcpuId) -> bool {
        self.vcpu(vcpu).map_or(false, |v| v.state().is_active())
    }

    fn notify(&self, vcpu: VcpuId) {
        let Some(v) = self.vcpu(vcpu) else {
            return;
        };
        match v.post_wakeup() {
            VcpuState::Running(cpu) if cpu != self.host_cpu.current_cpu() => {
                self.host_cpu.kick(cpu)
            }
            // Picks up the change at its next flush.
            VcpuState::Running(_) => {}
            VcpuState::Blocked => self.host_cpu.unpark(vcpu),
            VcpuState::Uninitialized | VcpuState::Ready | VcpuState::Exited => {}
        }
    }

    fn register_traps(&self, traps: &[VgicTrap]) {
        let mut table = self.traps.lock();
        for trap in traps {
            log::debug!("vm: register trap {:x?}", trap);
            table.push(*trap);
        }
    }

    fn unregister_traps(&self) {
        self.traps.lock().clear();
    }
}

/// VM structure
pub struct VirtualMachine {
    id: VmId,
    host: Arc<VmHost>,
    vgic: Arc<Vgic>,
}

impl VirtualMachine {
    /// Create a VM and its interrupt controller
    pub fn new(id: VmId, config: VgicConfig, host_cpu: Arc<dyn HostCpu>) -> Result<Self> {
        let host = Arc::new(VmHost::new(config.max_vcpus, host_cpu));
        let vgic = Vgic::new(config, host.clone())?;
        log::info!("vm{}: created", id);
        Ok(Self { id, host, vgic: Arc::new(vgic) })
    }

    /// Get VM ID
    pub fn id(&self) -> VmId {
        self.id
    }

    /// The VM's interrupt controller
    pub fn vgic(&self) -> &Arc<Vgic> {
        &self.vgic
    }

    /// Controller-facing VM services
    pub fn host(&self) -> &VmHost {
        &self.host
    }

    /// Place the interrupt controller in the guest physical map
    pub fn attach_vgic(&self, desc: &VgicDescriptor) -> Result<()> {
        self.vgic.attach(desc)?;
        Ok(())
    }

    /// Create vCPU `vcpu`
    pub fn create_vcpu(&self, vcpu: VcpuId) -> Result<()> {
        let slot = self.host.vcpu(vcpu).ok_or(Error::NotFound)?;
        if slot.state() != VcpuState::Uninitialized {
            return Err(Error::ResourceBusy);
        }
        self.vgic.cpu_init(vcpu)?;
        slot.set_state(VcpuState::Ready);
        Ok(())
    }

    /// Destroy vCPU `vcpu`
    pub fn destroy_vcpu(&self, vcpu: VcpuId) {
        let Some(slot) = self.host.vcpu(vcpu) else {
            return;
        };
        if slot.state().is_active() {
            slot.set_state(VcpuState::Exited);
            self.vgic.cpu_cleanup(vcpu);
        }
    }

    /// Destroy every vCPU and the interrupt controller
    pub fn destroy(&self) {
        for vcpu in 0..self.host.vcpus.len() {
            self.destroy_vcpu(vcpu);
        }
        self.vgic.cleanup();
        log::info!("vm{}: destroyed", self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::arm64::interrupt::gic::GicVersion;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct TestCpu {
        current: usize,
        kicked: StdMutex<Vec<usize>>,
        unparked: StdMutex<Vec<VcpuId>>,
    }

    impl HostCpu for TestCpu {
        fn current_cpu(&self) -> usize {
            self.current
        }

        fn kick(&self, cpu: usize) {
            self.kicked.lock().unwrap().push(cpu);
        }

        fn park(&self, _vcpu: VcpuId) {}

        fn unpark(&self, vcpu: VcpuId) {
            self.unparked.lock().unwrap().push(vcpu);
        }
    }

    fn vm() -> (Arc<TestCpu>, VirtualMachine) {
        let cpu = Arc::new(TestCpu::default());
        let config = VgicConfig { nirqs: 128, lr_count: 4, max_vcpus: 4 };
        let vm = VirtualMachine::new(1, config, cpu.clone()).unwrap();
        (cpu, vm)
    }

    fn desc() -> VgicDescriptor {
        VgicDescriptor {
            dist_base: 0x0800_0000,
            dist_size: 0x10000,
            redist_base: 0x080a_0000,
            redist_size: 0x40000,
            version: GicVersion::V3,
        }
    }

    #[test]
    fn test_notify_by_run_state() {
        let (cpu, vm) = vm();
        vm.create_vcpu(0).unwrap();
        vm.create_vcpu(1).unwrap();
        vm.create_vcpu(2).unwrap();
        vm.host().vcpu(0).unwrap().set_state(VcpuState::Running(0));
        vm.host().vcpu(1).unwrap().set_state(VcpuState::Running(5));
        vm.host().vcpu(2).unwrap().set_state(VcpuState::Blocked);

        vm.host().notify(0);
        vm.host().notify(1);
        vm.host().notify(2);
        vm.host().notify(3);

        assert_eq!(*cpu.kicked.lock().unwrap(), vec![5]);
        assert_eq!(*cpu.unparked.lock().unwrap(), vec![2]);
        assert!(vm.host().vcpu(0).unwrap().take_wakeup());
    }

    #[test]
    fn test_vcpu_lifecycle() {
        let (_, vm) = vm();
        assert!(!vm.host().vcpu_active(0));
        vm.create_vcpu(0).unwrap();
        assert!(vm.host().vcpu_active(0));
        assert_eq!(vm.create_vcpu(0), Err(Error::ResourceBusy));
        assert_eq!(vm.create_vcpu(4), Err(Error::NotFound));
        vm.destroy_vcpu(0);
        assert!(!vm.host().vcpu_active(0));
    }

    #[test]
    fn test_attach_registers_trap_table() {
        let (_, vm) = vm();
        vm.create_vcpu(0).unwrap();
        vm.attach_vgic(&desc()).unwrap();
        assert!(vm.host().mmio_trapped(0x0800_0100));
        assert!(vm.host().mmio_trapped(0x080a_0000 + 0x3fffc));
        assert!(!vm.host().mmio_trapped(0x080a_0000 + 0x40000));
        assert!(!vm.host().mmio_trapped(0x0900_0000));
        assert!(vm.host().sysreg_trapped((3, 0, 12, 11, 5)));

        vm.destroy();
        assert!(vm.host().traps().is_empty());
        assert!(!vm.vgic().is_attached());
    }
}
