//! Register-window decode shared by the distributor and redistributors
//!
//! A register window is a sorted table of [`RegRange`]s. Each range names a
//! register kind and the access widths it accepts. Anything the table does
//! not accept is read-as-zero / write-ignored: unaligned accesses, accesses
//! of an unsupported width, accesses that run past the end of a range, and
//! offsets no range covers.

use bitflags::bitflags;

use super::irq::{IrqStore, LockedIrq};
use super::Vgic;
use crate::core::vmm::VcpuId;
use crate::utils::for_each_set_bit;

bitflags! {
    /// Access widths a register range accepts
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AccessWidth: u8 {
        /// Byte access
        const BYTE = 1;
        /// Word access
        const WORD = 4;
        /// Doubleword access
        const DWORD = 8;
    }
}

impl AccessWidth {
    fn from_size(size: u8) -> Option<Self> {
        match size {
            1 => Some(Self::BYTE),
            4 => Some(Self::WORD),
            8 => Some(Self::DWORD),
            _ => None,
        }
    }
}

/// Fault reported to the vCPU that performed an access
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MmioFault {
    /// Synchronous external abort on the data access
    ExternalAbort,
}

/// One register or register array in a window
#[derive(Debug, Clone, Copy)]
pub(crate) struct RegRange<K> {
    pub start: u64,
    pub end: u64,
    pub widths: AccessWidth,
    pub kind: K,
}

impl<K> RegRange<K> {
    pub const fn new(start: u64, end: u64, widths: AccessWidth, kind: K) -> Self {
        Self { start, end, widths, kind }
    }
}

/// Find the range accepting an access of `size` bytes at `offset`.
///
/// Returns the register kind and the offset within its range.
pub(crate) fn lookup<K: Copy>(regs: &[RegRange<K>], offset: u64, size: u8) -> Option<(K, u64)> {
    let Some(width) = AccessWidth::from_size(size) else {
        log::warn!("vgic: unsupported access size {} at {:#x}", size, offset);
        return None;
    };
    if !is_aligned!(offset, u64::from(size)) {
        log::debug!("vgic: unaligned {}-byte access at {:#x}", size, offset);
        return None;
    }
    let reg = regs.iter().find(|r| offset >= r.start && offset < r.end)?;
    if offset + u64::from(size) > reg.end {
        return None;
    }
    if !reg.widths.contains(width) {
        log::warn!("vgic: {}-byte access to {:#x} not supported", size, offset);
        return None;
    }
    Some((reg.kind, offset - reg.start))
}

/// Operation encoded by a set/clear register bank
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum GroupOp {
    SetEnable,
    ClearEnable,
    SetPending,
    ClearPending,
    SetActive,
    ClearActive,
}

impl GroupOp {
    fn read_bit(self, irq: &LockedIrq<'_>) -> bool {
        match self {
            GroupOp::SetEnable | GroupOp::ClearEnable => irq.enabled,
            GroupOp::SetPending | GroupOp::ClearPending => irq.deliverable(),
            GroupOp::SetActive | GroupOp::ClearActive => irq.active,
        }
    }
}

/// Read 32 state bits starting at `first`
pub(crate) fn group_read(store: &IrqStore<'_>, vcpu: Option<VcpuId>, first: u32, op: GroupOp) -> u32 {
    (0..32u32)
        .filter(|&bit| {
            store
                .get(vcpu, first + bit)
                .map_or(false, |irq| op.read_bit(&irq))
        })
        .fold(0, |acc, bit| acc | (1 << bit))
}

/// Apply a set/clear write to the 32 records starting at `first`.
///
/// Unresolvable ids are skipped.
pub(crate) fn group_write(
    vgic: &Vgic,
    store: &IrqStore<'_>,
    vcpu: Option<VcpuId>,
    first: u32,
    op: GroupOp,
    val: u32,
) {
    for_each_set_bit(val, |bit| {
        let Some(mut irq) = store.get(vcpu, first + bit) else {
            return;
        };
        match op {
            GroupOp::SetEnable => irq.enabled = true,
            GroupOp::ClearEnable => irq.enabled = false,
            GroupOp::SetPending => {
                irq.pending = true;
                let target = irq.target_vcpu;
                vgic.queue_irq(store, irq, target);
            }
            GroupOp::ClearPending => irq.pending = false,
            GroupOp::SetActive => {
                irq.active = true;
                let target = irq.target_vcpu;
                vgic.queue_irq(store, irq, target);
            }
            GroupOp::ClearActive => irq.active = false,
        }
    });
}

/// Read `size` priority bytes starting at interrupt `first`
pub(crate) fn priority_read(store: &IrqStore<'_>, vcpu: Option<VcpuId>, first: u32, size: u8) -> u64 {
    (0..u32::from(size)).fold(0u64, |acc, i| {
        let prio = store.get(vcpu, first + i).map_or(0, |irq| irq.priority);
        acc | (u64::from(prio) << (8 * i))
    })
}

/// Write `size` priority bytes starting at interrupt `first`
pub(crate) fn priority_write(store: &IrqStore<'_>, vcpu: Option<VcpuId>, first: u32, size: u8, val: u64) {
    for i in 0..u32::from(size) {
        if let Some(mut irq) = store.get(vcpu, first + i) {
            irq.set_priority((val >> (8 * i)) as u8);
        }
    }
}
