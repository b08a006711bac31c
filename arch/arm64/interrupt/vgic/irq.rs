//! Virtual interrupt records and the record store
//!
//! Every virtual interrupt line is a [`VgicIrq`]: an immutable id plus a
//! spin-locked [`IrqState`]. Private lines (0..31) live in each vCPU's block,
//! shared lines (32..nirqs) in one VM-wide array.
//!
//! Lookups go through [`IrqStore`], which pins the record topology for the
//! duration of an operation. A looked-up record is returned locked as a
//! [`LockedIrq`]; the only way to also take a vCPU's list-register lock is
//! [`LockedIrq::lock_cpu`], which consumes the record guard. The record lock
//! is therefore always the outer lock.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::ops::{Deref, DerefMut};
use spin::{Mutex, MutexGuard, RwLockReadGuard};

use super::lr::{LrState, VgicCpu};
use super::{VgicDescriptor, VgicState};
use crate::arch::arm64::interrupt::gic::gicd;
use crate::config::{VgicConfig, NR_PRIVATE_IRQS};
use crate::core::vmm::VcpuId;

/// Last SGI id
pub const SGI_LAST: u32 = 15;

/// Priority bits implemented by the model
pub const PRIORITY_MASK: u8 = 0xf8;

/// Trigger mode of an interrupt line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrqConfig {
    /// Level-sensitive
    Level,
    /// Edge-triggered
    Edge,
}

/// Mutable state of one interrupt line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IrqState {
    /// Active in the guest
    pub active: bool,
    /// Latched request
    pub pending: bool,
    /// Forwarding enabled
    pub enabled: bool,
    /// Raw input level (level-sensitive lines)
    pub level: bool,
    /// Trigger mode
    pub config: IrqConfig,
    /// Priority, low 3 bits always zero
    pub priority: u8,
    /// Routing key (MPIDR layout)
    pub affinity: u64,
    /// vCPU resolved from `affinity`
    pub target_vcpu: Option<VcpuId>,
    /// vCPU whose candidate list holds this record
    pub on_list: Option<VcpuId>,
}

impl IrqState {
    fn new(config: IrqConfig, enabled: bool) -> Self {
        Self {
            active: false,
            pending: false,
            enabled,
            level: false,
            config,
            priority: 0,
            affinity: 0,
            target_vcpu: None,
            on_list: None,
        }
    }

    /// Whether the line currently requests delivery
    pub fn deliverable(&self) -> bool {
        match self.config {
            IrqConfig::Level => self.level || self.pending,
            IrqConfig::Edge => self.pending,
        }
    }

    /// Whether the line needs a list register at all
    pub fn needs_slot(&self) -> bool {
        self.active || self.deliverable()
    }

    /// Store a priority, dropping unimplemented bits
    pub fn set_priority(&mut self, priority: u8) {
        self.priority = priority & PRIORITY_MASK;
    }
}

/// One virtual interrupt line
#[derive(Debug)]
pub struct VgicIrq {
    id: u32,
    state: Mutex<IrqState>,
}

impl VgicIrq {
    /// Private record `id` owned by `vcpu`
    pub(crate) fn new_private(id: u32, vcpu: VcpuId, affinity: u64) -> Self {
        let mut state = if id <= SGI_LAST {
            IrqState::new(IrqConfig::Edge, true)
        } else {
            IrqState::new(IrqConfig::Level, false)
        };
        state.affinity = affinity;
        state.target_vcpu = Some(vcpu);
        Self { id, state: Mutex::new(state) }
    }

    /// Shared record `id`, disabled and level-sensitive
    pub(crate) fn new_shared(id: u32, target_vcpu: Option<VcpuId>) -> Self {
        let mut state = IrqState::new(IrqConfig::Level, false);
        state.target_vcpu = target_vcpu;
        Self { id, state: Mutex::new(state) }
    }

    /// Interrupt id
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Lock the record
    pub fn lock(&self) -> LockedIrq<'_> {
        LockedIrq { irq: self, state: self.state.lock() }
    }

    /// Unlocked access for callers holding exclusive ownership
    pub(crate) fn state_mut(&mut self) -> &mut IrqState {
        self.state.get_mut()
    }
}

/// Allocate the 32 private records of `vcpu`
pub(crate) fn alloc_private(vcpu: VcpuId, affinity: u64) -> Box<[VgicIrq]> {
    (0..NR_PRIVATE_IRQS)
        .map(|id| VgicIrq::new_private(id, vcpu, affinity))
        .collect::<Vec<_>>()
        .into_boxed_slice()
}

/// A record held under its own lock
pub struct LockedIrq<'a> {
    irq: &'a VgicIrq,
    state: MutexGuard<'a, IrqState>,
}

impl<'a> LockedIrq<'a> {
    /// Interrupt id
    pub fn id(&self) -> u32 {
        self.irq.id
    }

    /// Additionally take `cpu`'s list-register lock
    pub fn lock_cpu(self, cpu: &'a VgicCpu) -> LockedIrqCpu<'a> {
        LockedIrqCpu { lr: cpu.lr.lock(), vcpu: cpu.vcpu(), irq: self }
    }
}

impl Deref for LockedIrq<'_> {
    type Target = IrqState;

    fn deref(&self) -> &IrqState {
        &self.state
    }
}

impl DerefMut for LockedIrq<'_> {
    fn deref_mut(&mut self) -> &mut IrqState {
        &mut self.state
    }
}

/// A record and one vCPU's list-register state, locked in that order.
///
/// Field order releases the list-register lock first.
pub struct LockedIrqCpu<'a> {
    lr: MutexGuard<'a, LrState>,
    vcpu: VcpuId,
    irq: LockedIrq<'a>,
}

impl<'a> LockedIrqCpu<'a> {
    /// The locked record
    pub fn irq(&mut self) -> &mut LockedIrq<'a> {
        &mut self.irq
    }

    /// The locked list-register state
    pub fn lr(&mut self) -> &mut LrState {
        &mut self.lr
    }

    /// Append the record to this vCPU's candidate list.
    ///
    /// Returns true if the record was not on any list before.
    pub fn link_tail(&mut self) -> bool {
        if self.irq.on_list.is_some() {
            return false;
        }
        let id = self.irq.id() as usize;
        if !self.lr.aplist.push_back(id) {
            return false;
        }
        self.irq.on_list = Some(self.vcpu);
        true
    }

    /// Move the record to the head of this vCPU's candidate list
    pub fn move_to_head(&mut self) {
        match self.irq.on_list {
            Some(owner) if owner != self.vcpu => return,
            _ => {}
        }
        let id = self.irq.id() as usize;
        self.lr.aplist.move_to_front(id);
        self.irq.on_list = Some(self.vcpu);
    }

    /// Remove the record from this vCPU's candidate list
    pub fn unlink(&mut self) {
        if self.irq.on_list != Some(self.vcpu) {
            return;
        }
        let id = self.irq.id() as usize;
        self.lr.aplist.remove(id);
        self.irq.on_list = None;
    }
}

/// Read-side view of the record topology
pub struct IrqStore<'a> {
    state: RwLockReadGuard<'a, VgicState>,
    config: &'a VgicConfig,
}

impl<'a> IrqStore<'a> {
    pub(crate) fn new(state: RwLockReadGuard<'a, VgicState>, config: &'a VgicConfig) -> Self {
        Self { state, config }
    }

    /// Whether the controller is attached
    pub fn attached(&self) -> bool {
        self.state.geometry.is_some()
    }

    /// Attach descriptor, if attached
    pub fn geometry(&self) -> Option<&VgicDescriptor> {
        self.state.geometry.as_ref()
    }

    /// Controller configuration
    pub fn config(&self) -> &VgicConfig {
        self.config
    }

    /// vCPU block, if `vcpu` is in range and created
    pub fn cpu(&self, vcpu: VcpuId) -> Option<&VgicCpu> {
        self.state.cpus.get(vcpu)?.as_deref()
    }

    /// Iterate over created vCPU blocks
    pub fn cpus(&self) -> impl Iterator<Item = &VgicCpu> + '_ {
        self.state.cpus.iter().filter_map(|c| c.as_deref())
    }

    /// Usable vCPU count derived from the attach geometry
    pub fn max_cpu_count(&self) -> u16 {
        self.state.max_cpu_count(self.config)
    }

    /// Resolve and lock an interrupt record.
    ///
    /// Private ids need `vcpu` to name a created vCPU. Shared ids need the
    /// controller to be attached. Ids at or above 1023 never resolve.
    pub fn get(&self, vcpu: Option<VcpuId>, irqid: u32) -> Option<LockedIrq<'_>> {
        self.record(vcpu, irqid).map(VgicIrq::lock)
    }

    fn record(&self, vcpu: Option<VcpuId>, irqid: u32) -> Option<&VgicIrq> {
        if irqid < NR_PRIVATE_IRQS {
            let vcpu = vcpu?;
            if vcpu >= usize::from(self.config.max_vcpus) {
                return None;
            }
            return self.cpu(vcpu)?.private.get(irqid as usize);
        }
        if irqid >= self.config.nirqs || !self.attached() {
            return None;
        }
        self.state.shared.get((irqid - NR_PRIVATE_IRQS) as usize)
    }

    /// Resolve a routing value to a created vCPU by linear scan
    pub fn resolve_affinity(&self, affinity: u64) -> Option<VcpuId> {
        let affinity = affinity & gicd::AFF_MASK;
        self.cpus().find(|c| c.affinity() == affinity).map(VgicCpu::vcpu)
    }
}
