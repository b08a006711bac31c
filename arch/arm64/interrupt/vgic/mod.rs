//! VGIC (Virtual GICv3) implementation for ARM64
//!
//! Provides the guest-visible interrupt controller of one VM: a distributor
//! for shared interrupts, one redistributor per vCPU for private interrupts,
//! and the list-register scheduler that hands pending interrupts to the
//! hardware virtual CPU interface on each guest entry.
//!
//! The VM owns its controller through an `Arc<Vgic>` and reaches the VM back
//! through the [`VgicHost`] trait; there is no global controller instance.
//!
//! ## Locking
//!
//! - Each interrupt record has its own spin lock.
//! - Each vCPU has one spin lock over its list registers and candidate list.
//!   It is only ever taken while already holding a record lock, or alone.
//! - The distributor control register has its own lock, never nested.
//! - The record topology (shared array, vCPU blocks, attach geometry) sits
//!   behind a reader-writer lock. Lifecycle calls take it for writing;
//!   everything else reads.
//!
//! ## References
//! - ARM IHI 0069 (GIC architecture specification)
//! - xvisor/arch/arm/cpu/common/vgic.c, vgic_v3.c

mod dist;
mod inject;
pub mod irq;
pub mod lr;
pub mod mmio;
mod redist;

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use spin::{Mutex, RwLock};

use self::irq::{IrqStore, VgicIrq};
use self::lr::VgicCpu;
use crate::arch::arm64::interrupt::gic::{
    gicd, icc, vcpu_affinity, GicVersion, GICD_SIZE, GICR_FRAME_SIZE, GIC_FRAME_SIZE,
};
use crate::config::{validate_vgic_config, VgicConfig, NR_PRIVATE_IRQS};
use crate::core::vmm::VcpuId;

pub use self::irq::{IrqConfig, IrqState, LockedIrq, LockedIrqCpu};
pub use self::lr::{VgicHwState, VgicLr, VgicLrFlags, VGIC_MAX_LRS};
pub use self::mmio::MmioFault;

/// EINVAL
pub const EINVAL: i32 = 22;
/// EEXIST
pub const EEXIST: i32 = 17;
/// ENODEV
pub const ENODEV: i32 = 19;

/// Interrupt controller errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VgicError {
    /// Controller has not been attached to the VM
    NotAttached,
    /// Controller is already attached
    AlreadyAttached,
    /// Interrupt id does not resolve to a record
    InvalidIrq,
    /// Malformed attach descriptor
    InvalidArgument,
    /// vCPU index out of range or not created
    InvalidVcpu,
}

impl VgicError {
    /// Errno value reported to the device-model layer
    pub fn errno(self) -> i32 {
        match self {
            VgicError::NotAttached => ENODEV,
            VgicError::AlreadyAttached => EEXIST,
            VgicError::InvalidIrq | VgicError::InvalidArgument | VgicError::InvalidVcpu => EINVAL,
        }
    }
}

impl fmt::Display for VgicError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VgicError::NotAttached => write!(f, "controller not attached"),
            VgicError::AlreadyAttached => write!(f, "controller already attached"),
            VgicError::InvalidIrq => write!(f, "invalid interrupt id"),
            VgicError::InvalidArgument => write!(f, "invalid argument"),
            VgicError::InvalidVcpu => write!(f, "invalid vcpu"),
        }
    }
}

/// Guest physical regions and version of an attached controller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VgicDescriptor {
    /// Distributor base address
    pub dist_base: u64,
    /// Distributor region size
    pub dist_size: u64,
    /// Redistributor region base address
    pub redist_base: u64,
    /// Redistributor region size
    pub redist_size: u64,
    /// Controller version
    pub version: GicVersion,
}

impl VgicDescriptor {
    fn validate(&self, max_vcpus: u16) -> Result<(), VgicError> {
        if self.version != GicVersion::V3 {
            log::warn!("vgic: unsupported controller version {:?}", self.version);
            return Err(VgicError::InvalidArgument);
        }
        if !is_aligned!(self.dist_base, GIC_FRAME_SIZE)
            || !is_aligned!(self.redist_base, GIC_FRAME_SIZE)
        {
            log::warn!("vgic: regions must be 64KiB aligned");
            return Err(VgicError::InvalidArgument);
        }
        if self.dist_size != GICD_SIZE {
            log::warn!("vgic: distributor size {:#x} is not 64KiB", self.dist_size);
            return Err(VgicError::InvalidArgument);
        }
        if !is_aligned!(self.redist_size, GICR_FRAME_SIZE) {
            log::warn!("vgic: redistributor size {:#x} is not whole frames", self.redist_size);
            return Err(VgicError::InvalidArgument);
        }
        if self.redist_size / GICR_FRAME_SIZE > u64::from(max_vcpus) {
            log::warn!("vgic: redistributor region covers more than {} vcpus", max_vcpus);
            return Err(VgicError::InvalidArgument);
        }
        let dist_end = self.dist_base.checked_add(self.dist_size);
        let redist_end = self.redist_base.checked_add(self.redist_size);
        let (Some(dist_end), Some(redist_end)) = (dist_end, redist_end) else {
            return Err(VgicError::InvalidArgument);
        };
        if self.redist_size != 0 && self.dist_base < redist_end && self.redist_base < dist_end {
            log::warn!("vgic: distributor and redistributor regions overlap");
            return Err(VgicError::InvalidArgument);
        }
        Ok(())
    }

    fn in_dist(&self, addr: u64) -> bool {
        addr >= self.dist_base && addr - self.dist_base < self.dist_size
    }

    fn in_redist(&self, addr: u64) -> bool {
        addr >= self.redist_base && addr - self.redist_base < self.redist_size
    }
}

/// Emulation traps the controller registers with its VM
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VgicTrap {
    /// Guest physical MMIO range
    Mmio { base: u64, size: u64 },
    /// System register, as (op0, op1, CRn, CRm, op2)
    SysReg { enc: (u8, u8, u8, u8, u8) },
}

/// Services the owning VM provides to its interrupt controller
pub trait VgicHost: Send + Sync {
    /// Whether `vcpu` is currently active (created and not halted)
    fn vcpu_active(&self, vcpu: VcpuId) -> bool;

    /// Wake `vcpu` so it re-evaluates its pending interrupts.
    ///
    /// Must be callable from any thread, including timer callbacks.
    fn notify(&self, vcpu: VcpuId);

    /// Route the given traps to this controller
    fn register_traps(&self, traps: &[VgicTrap]);

    /// Stop routing traps to this controller
    fn unregister_traps(&self);
}

/// Per-vCPU operations the exit dispatcher depends on
pub trait VgicCpuOps {
    /// Load pending interrupts into the list registers before guest entry
    fn flush_hwstate(&self, vcpu: VcpuId);

    /// Fold list register state back after guest exit
    fn sync_hwstate(&self, vcpu: VcpuId);

    /// Whether the vCPU has interrupts that may need delivery
    fn has_pending_irq(&self, vcpu: VcpuId) -> bool;

    /// World-switch image to load before entry
    fn hw_state(&self, vcpu: VcpuId) -> Option<VgicHwState>;

    /// Store the world-switch image saved on exit
    fn store_hw_state(&self, vcpu: VcpuId, hw: &VgicHwState);
}

/// Record topology guarded by the controller's reader-writer lock
#[derive(Debug)]
pub(crate) struct VgicState {
    pub(crate) geometry: Option<VgicDescriptor>,
    pub(crate) shared: Box<[VgicIrq]>,
    pub(crate) cpus: Vec<Option<Box<VgicCpu>>>,
}

impl VgicState {
    pub(crate) fn max_cpu_count(&self, config: &VgicConfig) -> u16 {
        match self.geometry {
            Some(desc) if desc.redist_size > 0 => {
                let frames = desc.redist_size / GICR_FRAME_SIZE;
                frames.min(u64::from(config.max_vcpus)) as u16
            }
            _ => config.max_vcpus,
        }
    }
}

/// Virtual GICv3 of one VM
pub struct Vgic {
    config: VgicConfig,
    host: Arc<dyn VgicHost>,
    dist_ctlr: Mutex<u32>,
    state: RwLock<VgicState>,
}

impl fmt::Debug for Vgic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Vgic")
            .field("config", &self.config)
            .field("dist_ctlr", &*self.dist_ctlr.lock())
            .finish()
    }
}

impl Vgic {
    /// Create the controller for a VM (vm_init)
    pub fn new(config: VgicConfig, host: Arc<dyn VgicHost>) -> crate::Result<Self> {
        validate_vgic_config(&config)?;
        let cpus = (0..config.max_vcpus).map(|_| None).collect();
        log::info!(
            "vgic: init, {} irqs, {} list registers, {} vcpus max",
            config.nirqs,
            config.lr_count,
            config.max_vcpus
        );
        Ok(Self {
            config,
            host,
            dist_ctlr: Mutex::new(gicd::CTLR_ARE_NS),
            state: RwLock::new(VgicState {
                geometry: None,
                shared: Box::new([]),
                cpus,
            }),
        })
    }

    /// Controller configuration
    pub fn config(&self) -> &VgicConfig {
        &self.config
    }

    /// Read-side view of the records
    pub fn store(&self) -> IrqStore<'_> {
        IrqStore::new(self.state.read(), &self.config)
    }

    /// Whether `attach` has completed
    pub fn is_attached(&self) -> bool {
        self.state.read().geometry.is_some()
    }

    /// Attach the controller at the guest physical regions in `desc`
    pub fn attach(&self, desc: &VgicDescriptor) -> Result<(), VgicError> {
        let mut state = self.state.write();
        if state.geometry.is_some() {
            return Err(VgicError::AlreadyAttached);
        }
        desc.validate(self.config.max_vcpus)?;

        let target = state
            .cpus
            .iter()
            .flatten()
            .find(|cpu| cpu.affinity() == 0)
            .map(|cpu| cpu.vcpu());
        state.shared = (NR_PRIVATE_IRQS..self.config.nirqs)
            .map(|id| VgicIrq::new_shared(id, target))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        state.geometry = Some(*desc);
        drop(state);

        self.host.register_traps(&[
            VgicTrap::Mmio { base: desc.dist_base, size: desc.dist_size },
            VgicTrap::Mmio { base: desc.redist_base, size: desc.redist_size },
            VgicTrap::SysReg { enc: icc::SGI1R_EL1 },
        ]);
        log::info!(
            "vgic: attached, GICD {:#x}+{:#x}, GICR {:#x}+{:#x}",
            desc.dist_base,
            desc.dist_size,
            desc.redist_base,
            desc.redist_size
        );
        Ok(())
    }

    /// Detach the controller. Does nothing if not attached.
    pub fn detach(&self) {
        let mut state = self.state.write();
        if state.geometry.take().is_none() {
            return;
        }
        for cpu in state.cpus.iter_mut().flatten() {
            let lr = cpu.lr.get_mut();
            lr.aplist.remove_if(|id| id >= NR_PRIVATE_IRQS as usize);
            lr.release_shared_slots();
        }
        state.shared = Box::new([]);
        drop(state);

        self.host.unregister_traps();
        log::info!("vgic: detached");
    }

    /// Tear down the controller (vm_cleanup)
    pub fn cleanup(&self) {
        self.detach();
        let mut state = self.state.write();
        for cpu in state.cpus.iter_mut() {
            *cpu = None;
        }
        drop(state);
        *self.dist_ctlr.lock() = 0;
        log::info!("vgic: cleanup");
    }

    /// Create the interrupt state of `vcpu` (cpu_init)
    pub fn cpu_init(&self, vcpu: VcpuId) -> Result<(), VgicError> {
        let mut state = self.state.write();
        // Once attached, only vCPUs with a redistributor frame.
        if vcpu >= usize::from(state.max_cpu_count(&self.config)) {
            return Err(VgicError::InvalidVcpu);
        }
        let Some(slot) = state.cpus.get_mut(vcpu) else {
            return Err(VgicError::InvalidVcpu);
        };
        if slot.is_some() {
            return Err(VgicError::InvalidVcpu);
        }
        let affinity = vcpu_affinity(vcpu);
        *slot = Some(Box::new(VgicCpu::new(
            vcpu,
            affinity,
            self.config.lr_count,
            self.config.nirqs,
        )));

        // Shared records routed to this affinity before the vCPU existed.
        for irq in state.shared.iter_mut() {
            let irq = irq.state_mut();
            if irq.target_vcpu.is_none() && irq.affinity == affinity {
                irq.target_vcpu = Some(vcpu);
            }
        }
        log::info!("vgic: vcpu{} init, affinity {:#x}", vcpu, affinity);
        Ok(())
    }

    /// Release the interrupt state of `vcpu` (cpu_cleanup)
    pub fn cpu_cleanup(&self, vcpu: VcpuId) {
        let mut state = self.state.write();
        let Some(cpu) = state.cpus.get_mut(vcpu).and_then(Option::take) else {
            return;
        };
        for irq in state.shared.iter_mut() {
            let irq = irq.state_mut();
            if irq.on_list == Some(vcpu) {
                irq.on_list = None;
            }
            if irq.target_vcpu == Some(vcpu) {
                irq.target_vcpu = None;
            }
        }
        drop(state);
        drop(cpu);
        log::info!("vgic: vcpu{} cleanup", vcpu);
    }

    /// Number of usable vCPUs
    pub fn max_cpu_count(&self) -> u16 {
        self.state.read().max_cpu_count(&self.config)
    }

    /// Guest read of `size` bytes at `addr` by `vcpu`
    pub fn mmio_read(&self, vcpu: VcpuId, addr: u64, size: u8) -> Result<u64, MmioFault> {
        let store = self.store();
        let Some(desc) = store.geometry().copied() else {
            return Ok(0);
        };
        let end = addr.saturating_add(u64::from(size));
        if desc.in_dist(addr) {
            if end > desc.dist_base + desc.dist_size {
                return Ok(0);
            }
            return Ok(self.dist_read(&store, addr - desc.dist_base, size));
        }
        if desc.in_redist(addr) {
            if end > desc.redist_base + desc.redist_size {
                return Ok(0);
            }
            return self.redist_read(&store, addr - desc.redist_base, size);
        }
        log::debug!("vgic: vcpu{} read {:#x} outside controller", vcpu, addr);
        Ok(0)
    }

    /// Guest write of `size` bytes at `addr` by `vcpu`
    pub fn mmio_write(&self, vcpu: VcpuId, addr: u64, size: u8, val: u64) -> Result<(), MmioFault> {
        let store = self.store();
        let Some(desc) = store.geometry().copied() else {
            return Ok(());
        };
        let end = addr.saturating_add(u64::from(size));
        if desc.in_dist(addr) {
            if end <= desc.dist_base + desc.dist_size {
                self.dist_write(&store, addr - desc.dist_base, size, val);
            }
            return Ok(());
        }
        if desc.in_redist(addr) {
            if end > desc.redist_base + desc.redist_size {
                return Ok(());
            }
            return self.redist_write(&store, addr - desc.redist_base, size, val);
        }
        log::debug!("vgic: vcpu{} write {:#x} outside controller", vcpu, addr);
        Ok(())
    }

    /// Guest system register read. ICC_SGI1R_EL1 is write-only.
    pub fn sysreg_read(&self, _vcpu: VcpuId, enc: (u8, u8, u8, u8, u8)) -> u64 {
        if enc != icc::SGI1R_EL1 {
            log::debug!("vgic: read of unhandled system register {:?}", enc);
        }
        0
    }

    /// Guest system register write
    pub fn sysreg_write(&self, vcpu: VcpuId, enc: (u8, u8, u8, u8, u8), val: u64) {
        if enc == icc::SGI1R_EL1 {
            self.send_sgi(vcpu, val);
        } else {
            log::debug!("vgic: write of unhandled system register {:?}", enc);
        }
    }
}

impl VgicCpuOps for Vgic {
    fn flush_hwstate(&self, vcpu: VcpuId) {
        let store = self.store();
        if let Some(cpu) = store.cpu(vcpu) {
            lr::flush(&store, cpu);
        }
    }

    fn sync_hwstate(&self, vcpu: VcpuId) {
        let store = self.store();
        if let Some(cpu) = store.cpu(vcpu) {
            lr::sync(&store, cpu);
        }
    }

    fn has_pending_irq(&self, vcpu: VcpuId) -> bool {
        self.store().cpu(vcpu).map_or(false, VgicCpu::has_pending)
    }

    fn hw_state(&self, vcpu: VcpuId) -> Option<VgicHwState> {
        self.store().cpu(vcpu).map(VgicCpu::hw_state)
    }

    fn store_hw_state(&self, vcpu: VcpuId, hw: &VgicHwState) {
        if let Some(cpu) = self.store().cpu(vcpu) {
            cpu.store_hw_state(hw);
        }
    }
}
