//! List-register scheduler
//!
//! Each vCPU owns a small set of hardware list registers and a candidate
//! list of interrupt records that might need one. Before guest entry,
//! [`flush`] copies candidates into the list registers. After guest exit,
//! [`sync`] folds the list register state back into the records and
//! reorders or prunes the candidate list.
//!
//! Candidates are taken in list order. Sync moves records that are still
//! active to the head, so active interrupts drain before merely pending
//! ones; pending interrupts are otherwise served oldest first.
//!
//! ## References
//! - ARM IHI 0069, 12.4 "Virtual interrupt handling"
//! - xvisor/arch/arm/cpu/common/vgic.c

use alloc::boxed::Box;
use bitflags::bitflags;
use spin::Mutex;

use super::irq::{alloc_private, IrqConfig, IrqStore, VgicIrq};
use crate::arch::arm64::interrupt::gic::{ich, IchLr, ICH_LR};
use crate::config::{MAX_LIST_REGS, NR_PRIVATE_IRQS};
use crate::core::vmm::VcpuId;
use crate::utils::IndexList;

/// Maximum number of list registers
pub const VGIC_MAX_LRS: usize = MAX_LIST_REGS;

/// Decoded list register contents
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VgicLr {
    /// Virtual interrupt ID
    pub virtid: u32,
    /// Physical interrupt ID (for HW interrupts)
    pub physid: u16,
    /// Priority
    pub prio: u8,
    /// LR flags
    pub flags: VgicLrFlags,
}

bitflags! {
    /// List register flags
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct VgicLrFlags: u32 {
        /// Interrupt is pending
        const STATE_PENDING = 1 << 0;
        /// Interrupt is active
        const STATE_ACTIVE = 1 << 1;
        /// Hardware interrupt (needs physical IRQ)
        const HW = 1 << 2;
        /// Group 1 interrupt
        const GROUP1 = 1 << 4;
    }
}

impl VgicLr {
    /// Encode as an `ICH_LR<n>_EL2` value
    pub fn to_ich_lr(&self) -> u64 {
        let state = match (
            self.flags.contains(VgicLrFlags::STATE_PENDING),
            self.flags.contains(VgicLrFlags::STATE_ACTIVE),
        ) {
            (false, false) => ICH_LR::STATE::Invalid,
            (true, false) => ICH_LR::STATE::Pending,
            (false, true) => ICH_LR::STATE::Active,
            (true, true) => ICH_LR::STATE::PendingActive,
        };
        let mut lr = IchLr::new(0);
        lr.write(
            ICH_LR::VINTID.val(u64::from(self.virtid))
                + ICH_LR::PRIORITY.val(u64::from(self.prio))
                + state,
        );
        if self.flags.contains(VgicLrFlags::GROUP1) {
            lr.modify(ICH_LR::GROUP::SET);
        }
        if self.flags.contains(VgicLrFlags::HW) {
            lr.modify(ICH_LR::HW::SET + ICH_LR::PINTID.val(u64::from(self.physid)));
        }
        lr.get()
    }

    /// Decode an `ICH_LR<n>_EL2` value
    pub fn from_ich_lr(value: u64) -> Self {
        let lr = IchLr::new(value);
        let mut flags = VgicLrFlags::empty();
        let state = lr.read(ICH_LR::STATE);
        if state & 0x1 != 0 {
            flags |= VgicLrFlags::STATE_PENDING;
        }
        if state & 0x2 != 0 {
            flags |= VgicLrFlags::STATE_ACTIVE;
        }
        if lr.is_set(ICH_LR::GROUP) {
            flags |= VgicLrFlags::GROUP1;
        }
        let physid = if lr.is_set(ICH_LR::HW) {
            flags |= VgicLrFlags::HW;
            lr.read(ICH_LR::PINTID) as u16
        } else {
            0
        };
        Self {
            virtid: lr.read(ICH_LR::VINTID) as u32,
            physid,
            prio: lr.read(ICH_LR::PRIORITY) as u8,
            flags,
        }
    }

    /// Whether the slot holds no interrupt
    pub fn is_empty(&self) -> bool {
        !self.flags.intersects(VgicLrFlags::STATE_PENDING | VgicLrFlags::STATE_ACTIVE)
    }
}

/// GICv3 virtual CPU interface image saved across a world switch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VgicHwState {
    /// Hypervisor Control Register (ICH_HCR_EL2)
    pub hcr: u64,
    /// Virtual Machine Control Register (ICH_VMCR_EL2)
    pub vmcr: u64,
    /// Active Priorities Registers (Group 0) - ICH_AP0R[0-3]_EL2
    pub ap0r: [u64; 4],
    /// Active Priorities Registers (Group 1) - ICH_AP1R[0-3]_EL2
    pub ap1r: [u64; 4],
    /// List registers (ICH_LR[0-15]_EL2)
    pub lr: [u64; VGIC_MAX_LRS],
    /// Number of implemented list registers
    pub lr_num: usize,
}

impl VgicHwState {
    /// Reset image with `lr_num` list registers
    pub fn new(lr_num: usize) -> Self {
        Self {
            hcr: ich::HCR_EN,
            vmcr: 0,
            ap0r: [0; 4],
            ap1r: [0; 4],
            lr: [0; VGIC_MAX_LRS],
            lr_num: lr_num.min(VGIC_MAX_LRS),
        }
    }

    /// Bitmap of empty list registers, as ICH_ELRSR_EL2 reports it
    pub fn elrsr(&self) -> u16 {
        (0..self.lr_num)
            .filter(|&i| VgicLr::from_ich_lr(self.lr[i]).is_empty())
            .fold(0u16, |acc, i| acc | (1 << i))
    }

    /// Whether the underflow maintenance interrupt is armed
    pub fn underflow_armed(&self) -> bool {
        self.hcr & ich::HCR_UIE != 0
    }
}

/// List registers and candidate list of one vCPU, under one spin lock
#[derive(Debug)]
pub struct LrState {
    /// World-switch image
    pub hw: VgicHwState,
    /// Slots populated by the last flush
    pub lr_used: usize,
    /// Records that may need a list register, indexed by interrupt id
    pub aplist: IndexList,
}

impl LrState {
    /// Drop populated slots holding shared ids. Private ones stay packed at
    /// the front.
    pub(crate) fn release_shared_slots(&mut self) {
        let mut kept = 0;
        for i in 0..self.lr_used {
            let raw = self.hw.lr[i];
            if VgicLr::from_ich_lr(raw).virtid < NR_PRIVATE_IRQS {
                self.hw.lr[kept] = raw;
                kept += 1;
            }
        }
        self.hw.lr[kept..self.lr_used].fill(0);
        self.lr_used = kept;
    }
}

/// Per-vCPU interrupt controller block
#[derive(Debug)]
pub struct VgicCpu {
    vcpu: VcpuId,
    affinity: u64,
    pub(crate) private: Box<[VgicIrq]>,
    pub(crate) lr: Mutex<LrState>,
}

impl VgicCpu {
    pub(crate) fn new(vcpu: VcpuId, affinity: u64, lr_count: usize, nirqs: u32) -> Self {
        Self {
            vcpu,
            affinity,
            private: alloc_private(vcpu, affinity),
            lr: Mutex::new(LrState {
                hw: VgicHwState::new(lr_count),
                lr_used: 0,
                aplist: IndexList::with_capacity(nirqs as usize),
            }),
        }
    }

    /// vCPU index
    pub fn vcpu(&self) -> VcpuId {
        self.vcpu
    }

    /// Affinity value (MPIDR layout)
    pub fn affinity(&self) -> u64 {
        self.affinity
    }

    /// Whether any record is on the candidate list
    pub fn has_pending(&self) -> bool {
        !self.lr.lock().aplist.is_empty()
    }

    /// Copy of the world-switch image
    pub fn hw_state(&self) -> VgicHwState {
        self.lr.lock().hw
    }

    /// Store the post-exit image. Only list register, active priority and
    /// VMCR contents are taken from `hw`.
    pub fn store_hw_state(&self, hw: &VgicHwState) {
        let mut lr = self.lr.lock();
        let n = lr.hw.lr_num;
        lr.hw.vmcr = hw.vmcr;
        lr.hw.ap0r = hw.ap0r;
        lr.hw.ap1r = hw.ap1r;
        lr.hw.lr[..n].copy_from_slice(&hw.lr[..n]);
    }
}

/// Load the candidate list of `cpu` into its list registers
pub(crate) fn flush(store: &IrqStore<'_>, cpu: &VgicCpu) {
    let vcpu = cpu.vcpu();
    let mut cursor = {
        let mut lr = cpu.lr.lock();
        lr.hw.hcr &= !ich::HCR_UIE;
        if lr.aplist.is_empty() {
            let n = lr.hw.lr_num;
            lr.hw.lr[..n].fill(0);
            return;
        }
        debug_assert_eq!(lr.lr_used, 0, "flush with unsynced list registers");
        lr.lr_used = 0;
        lr.aplist.front()
    };

    while let Some(irqid) = cursor {
        let Some(irq) = store.get(Some(vcpu), irqid as u32) else {
            cursor = cpu.lr.lock().aplist.next(irqid);
            continue;
        };
        let mut locked = irq.lock_cpu(cpu);
        cursor = locked.lr().aplist.next(irqid);
        if !locked.irq().enabled {
            continue;
        }

        let lr = locked.lr();
        if lr.lr_used == lr.hw.lr_num {
            lr.hw.hcr |= ich::HCR_UIE;
            break;
        }

        let mut slot = VgicLr {
            virtid: irqid as u32,
            physid: 0,
            prio: locked.irq().priority,
            flags: VgicLrFlags::GROUP1,
        };
        let state = locked.irq();
        if state.active {
            slot.flags |= VgicLrFlags::STATE_ACTIVE;
        } else if state.deliverable() {
            slot.flags |= VgicLrFlags::STATE_PENDING;
            if state.config == IrqConfig::Edge {
                state.pending = false;
            }
        }

        let lr = locked.lr();
        let i = lr.lr_used;
        lr.hw.lr[i] = slot.to_ich_lr();
        lr.lr_used += 1;
    }

    let mut lr = cpu.lr.lock();
    let (used, n) = (lr.lr_used, lr.hw.lr_num);
    lr.hw.lr[used..n].fill(0);
    log::trace!("vgic: vcpu{} flushed {} list registers", vcpu, used);
}

/// Fold list register state back into the interrupt records
pub(crate) fn sync(store: &IrqStore<'_>, cpu: &VgicCpu) {
    let vcpu = cpu.vcpu();
    let slots = {
        let mut lr = cpu.lr.lock();
        lr.hw.hcr &= !ich::HCR_UIE;
        if lr.lr_used == 0 {
            return;
        }
        let mut slots: heapless::Vec<VgicLr, VGIC_MAX_LRS> = heapless::Vec::new();
        for i in 0..lr.lr_used {
            let _ = slots.push(VgicLr::from_ich_lr(lr.hw.lr[i]));
            lr.hw.lr[i] = 0;
        }
        lr.lr_used = 0;
        slots
    };

    for slot in &slots {
        let Some(mut irq) = store.get(Some(vcpu), slot.virtid) else {
            continue;
        };
        irq.active = slot.flags.contains(VgicLrFlags::STATE_ACTIVE);
        let pending = slot.flags.contains(VgicLrFlags::STATE_PENDING);
        match irq.config {
            IrqConfig::Edge if pending => irq.pending = true,
            IrqConfig::Level if !pending => irq.pending = false,
            _ => {}
        }

        let active = irq.active;
        let needs_slot = irq.needs_slot();
        let mut locked = irq.lock_cpu(cpu);
        if active {
            locked.move_to_head();
        } else if !needs_slot {
            locked.unlink();
        }
    }
    log::trace!("vgic: vcpu{} synced {} list registers", vcpu, slots.len());
}
