//! Interrupt injection and routing
//!
//! [`Vgic::inject_irq`] is the single entry point timers, virtual devices
//! and SGI emulation use to drive an interrupt line. It updates the record,
//! links it onto the target vCPU's candidate list and wakes that vCPU.
//! Actual delivery happens at the target's next flush.

use super::irq::{IrqConfig, IrqStore, LockedIrq};
use super::{Vgic, VgicError};
use crate::arch::arm64::interrupt::gic::{gicd, IccSgi1r, ICC_SGI1R};
use crate::config::NR_PRIVATE_IRQS;
use crate::core::vmm::VcpuId;

impl Vgic {
    /// Link `irq` onto `target`'s candidate list if it needs a slot and
    /// wake `target` when the link is new. Consumes the record lock.
    pub(crate) fn queue_irq(
        &self,
        store: &IrqStore<'_>,
        irq: LockedIrq<'_>,
        target: Option<VcpuId>,
    ) -> bool {
        if !irq.needs_slot() || irq.on_list.is_some() {
            return false;
        }
        let Some(cpu) = target.and_then(|vcpu| store.cpu(vcpu)) else {
            return false;
        };
        let mut locked = irq.lock_cpu(cpu);
        let linked = locked.link_tail();
        drop(locked);

        if linked {
            self.host.notify(cpu.vcpu());
        }
        linked
    }

    /// Assert or deassert `irqid`.
    ///
    /// `vcpu` names the owning vCPU of a private interrupt and must be
    /// `None` for shared ones, which follow their routing.
    pub fn inject_irq(&self, vcpu: Option<VcpuId>, irqid: u32, level: bool) -> Result<(), VgicError> {
        let store = self.store();
        self.inject_locked(&store, vcpu, irqid, level)
    }

    pub(crate) fn inject_locked(
        &self,
        store: &IrqStore<'_>,
        vcpu: Option<VcpuId>,
        irqid: u32,
        level: bool,
    ) -> Result<(), VgicError> {
        if !store.attached() {
            return Err(VgicError::NotAttached);
        }
        debug_assert!(
            vcpu.is_none() || irqid < NR_PRIVATE_IRQS,
            "vcpu hint for shared irq {}",
            irqid
        );
        let mut irq = store.get(vcpu, irqid).ok_or(VgicError::InvalidIrq)?;
        debug_assert!(vcpu.is_none() || irq.target_vcpu == vcpu);

        let trigger = match irq.config {
            IrqConfig::Edge => level,
            IrqConfig::Level => irq.level != level,
        };
        if !trigger {
            irq.level = level;
            return Ok(());
        }
        match irq.config {
            IrqConfig::Edge => irq.pending = true,
            IrqConfig::Level => irq.level = level,
        }

        let target = vcpu.or(irq.target_vcpu);
        if target.is_none() {
            log::trace!("vgic: irq {} has no target vcpu", irqid);
        }
        self.queue_irq(store, irq, target);
        Ok(())
    }

    /// Inject a message-signaled interrupt written to `addr`.
    ///
    /// Only 32-bit writes to the distributor's GICD_SETSPI_NSR are accepted.
    pub fn inject_msi(&self, addr: u64, size: u8, msg: u64) -> Result<(), VgicError> {
        let store = self.store();
        let Some(geometry) = store.geometry() else {
            return Err(VgicError::NotAttached);
        };
        if addr != geometry.dist_base + gicd::SETSPI_NSR || size != 4 {
            log::warn!("vgic: MSI to {:#x}/{} is not GICD_SETSPI_NSR", addr, size);
            return Err(VgicError::InvalidIrq);
        }
        let irqid = (msg & 0x3ff) as u32;
        self.inject_locked(&store, None, irqid, true)
    }

    /// Handle a guest ICC_SGI1R_EL1 write from `sender`
    pub fn send_sgi(&self, sender: VcpuId, value: u64) {
        let store = self.store();
        if !store.attached() {
            return;
        }
        let sgir = IccSgi1r::new(value);
        let irqid = sgir.read(ICC_SGI1R::INTID) as u32;

        if sgir.is_set(ICC_SGI1R::IRM) {
            let targets = store
                .cpus()
                .map(|cpu| cpu.vcpu())
                .filter(|&vcpu| vcpu != sender && self.host.vcpu_active(vcpu));
            for vcpu in targets {
                let _ = self.inject_locked(&store, Some(vcpu), irqid, true);
            }
            return;
        }

        // Only range selector 0 (Aff0 0..15) exists for our affinity layout.
        if sgir.read(ICC_SGI1R::RS) != 0 {
            return;
        }
        let aff = (sgir.read(ICC_SGI1R::AFF3) << 32)
            | (sgir.read(ICC_SGI1R::AFF2) << 16)
            | (sgir.read(ICC_SGI1R::AFF1) << 8);
        let list = sgir.read(ICC_SGI1R::TARGET_LIST) as u32;
        crate::utils::for_each_set_bit(list, |bit| {
            let Some(vcpu) = store.resolve_affinity(aff | u64::from(bit)) else {
                return;
            };
            if !self.host.vcpu_active(vcpu) {
                return;
            }
            let _ = self.inject_locked(&store, Some(vcpu), irqid, true);
        });
    }
}
