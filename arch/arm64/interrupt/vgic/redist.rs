//! Virtual redistributor (GICR) register decode
//!
//! The redistributor region is an array of per-vCPU frames, each made of an
//! RD frame (identification and control) followed by an SGI frame (SGI and
//! PPI configuration). Unlike the distributor, every bit of the SGI frame
//! set/clear registers is live: they describe one vCPU's private block.

use super::dist::config_read;
use super::irq::IrqStore;
use super::mmio::{self, lookup, AccessWidth, GroupOp, MmioFault, RegRange};
use super::Vgic;
use crate::arch::arm64::interrupt::gic::{
    affinity_to_typer, gicr, GicrTyper, GICR_FRAME_SIZE, GICR_RD_FRAME_SIZE, GICR_TYPER,
    GIC_IIDR_ARM, GIC_PIDR2_ARCH_GICV3,
};
use crate::core::vmm::VcpuId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RdReg {
    Iidr,
    Typer,
    Pidr2,
    Raz,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SgiReg {
    Group(GroupOp),
    Priority,
    PpiConfig,
    Raz,
}

const W: AccessWidth = AccessWidth::WORD;
const BW: AccessWidth = AccessWidth::BYTE.union(AccessWidth::WORD);
const WD: AccessWidth = AccessWidth::WORD.union(AccessWidth::DWORD);

const RD_REGS: &[RegRange<RdReg>] = &[
    RegRange::new(gicr::CTLR, gicr::CTLR + 4, W, RdReg::Raz),
    RegRange::new(gicr::IIDR, gicr::IIDR + 4, W, RdReg::Iidr),
    RegRange::new(gicr::TYPER, gicr::TYPER + 8, WD, RdReg::Typer),
    RegRange::new(gicr::STATUSR, gicr::STATUSR + 4, W, RdReg::Raz),
    RegRange::new(gicr::WAKER, gicr::WAKER + 4, W, RdReg::Raz),
    RegRange::new(gicr::PROPBASER, gicr::PROPBASER + 8, WD, RdReg::Raz),
    RegRange::new(gicr::PENDBASER, gicr::PENDBASER + 8, WD, RdReg::Raz),
    RegRange::new(gicr::PIDR2, gicr::PIDR2 + 4, W, RdReg::Pidr2),
];

const SGI_REGS: &[RegRange<SgiReg>] = &[
    RegRange::new(gicr::IGROUPR0, gicr::IGROUPR0 + 4, W, SgiReg::Raz),
    RegRange::new(gicr::ISENABLER0, gicr::ISENABLER0 + 4, W, SgiReg::Group(GroupOp::SetEnable)),
    RegRange::new(gicr::ICENABLER0, gicr::ICENABLER0 + 4, W, SgiReg::Group(GroupOp::ClearEnable)),
    RegRange::new(gicr::ISPENDR0, gicr::ISPENDR0 + 4, W, SgiReg::Group(GroupOp::SetPending)),
    RegRange::new(gicr::ICPENDR0, gicr::ICPENDR0 + 4, W, SgiReg::Group(GroupOp::ClearPending)),
    RegRange::new(gicr::ISACTIVER0, gicr::ISACTIVER0 + 4, W, SgiReg::Group(GroupOp::SetActive)),
    RegRange::new(gicr::ICACTIVER0, gicr::ICACTIVER0 + 4, W, SgiReg::Group(GroupOp::ClearActive)),
    RegRange::new(gicr::IPRIORITYR, gicr::IPRIORITYR_END, BW, SgiReg::Priority),
    RegRange::new(gicr::ICFGR0, gicr::ICFGR0 + 4, W, SgiReg::Raz),
    RegRange::new(gicr::ICFGR1, gicr::ICFGR1 + 4, W, SgiReg::PpiConfig),
    RegRange::new(gicr::IGRPMODR0, gicr::IGRPMODR0 + 4, W, SgiReg::Raz),
    RegRange::new(gicr::NSACR, gicr::NSACR + 4, W, SgiReg::Raz),
];

/// Decoded redistributor address
enum Target {
    /// Access to frame `vcpu`, `offset` bytes into it
    Frame { vcpu: VcpuId, offset: u64 },
    /// Index beyond the usable vCPU count
    OutOfRange,
}

fn decode(store: &IrqStore<'_>, offset: u64) -> Target {
    let vcpu = (offset / GICR_FRAME_SIZE) as usize;
    if vcpu >= usize::from(store.max_cpu_count()) {
        debug_assert!(false, "redistributor {} beyond usable vcpus", vcpu);
        return Target::OutOfRange;
    }
    Target::Frame { vcpu, offset: offset % GICR_FRAME_SIZE }
}

impl Vgic {
    fn redist_typer(&self, store: &IrqStore<'_>, vcpu: VcpuId, affinity: u64) -> u64 {
        let last = vcpu + 1 == usize::from(store.max_cpu_count());
        let mut typer = GicrTyper::new(0);
        typer.write(
            GICR_TYPER::AFFINITY.val(affinity_to_typer(affinity))
                + GICR_TYPER::PROCESSOR_NUMBER.val(vcpu as u64),
        );
        if last {
            typer.modify(GICR_TYPER::LAST::SET);
        }
        typer.get()
    }

    /// Redistributor read at `offset` from the start of the region
    pub(crate) fn redist_read(
        &self,
        store: &IrqStore<'_>,
        offset: u64,
        size: u8,
    ) -> Result<u64, MmioFault> {
        let Target::Frame { vcpu, offset } = decode(store, offset) else {
            return Ok(0);
        };
        let Some(cpu) = store.cpu(vcpu) else {
            log::debug!("vgic: GICR read for absent vcpu {}", vcpu);
            return Err(MmioFault::ExternalAbort);
        };

        let val = if offset < GICR_RD_FRAME_SIZE {
            match lookup(RD_REGS, offset, size) {
                Some((RdReg::Iidr, _)) => u64::from(GIC_IIDR_ARM),
                Some((RdReg::Pidr2, _)) => u64::from(GIC_PIDR2_ARCH_GICV3),
                Some((RdReg::Typer, off)) => {
                    let typer = self.redist_typer(store, vcpu, cpu.affinity());
                    match size {
                        8 => typer,
                        _ => (typer >> (off * 8)) & 0xffff_ffff,
                    }
                }
                Some((RdReg::Raz, _)) | None => 0,
            }
        } else {
            let vcpu = Some(vcpu);
            match lookup(SGI_REGS, offset - GICR_RD_FRAME_SIZE, size) {
                Some((SgiReg::Group(op), _)) => u64::from(mmio::group_read(store, vcpu, 0, op)),
                Some((SgiReg::Priority, off)) => mmio::priority_read(store, vcpu, off as u32, size),
                Some((SgiReg::PpiConfig, _)) => u64::from(config_read(store, vcpu, 16)),
                Some((SgiReg::Raz, _)) | None => 0,
            }
        };
        log::trace!("vgic: GICR{} read {:#07x}/{} = {:#x}", vcpu, offset, size, val);
        Ok(val)
    }

    /// Redistributor write at `offset` from the start of the region
    pub(crate) fn redist_write(
        &self,
        store: &IrqStore<'_>,
        offset: u64,
        size: u8,
        val: u64,
    ) -> Result<(), MmioFault> {
        let Target::Frame { vcpu, offset } = decode(store, offset) else {
            return Ok(());
        };
        if store.cpu(vcpu).is_none() {
            log::debug!("vgic: GICR write for absent vcpu {}", vcpu);
            return Err(MmioFault::ExternalAbort);
        }
        log::trace!("vgic: GICR{} write {:#07x}/{} = {:#x}", vcpu, offset, size, val);

        // The RD frame has no writable state.
        if offset < GICR_RD_FRAME_SIZE {
            return Ok(());
        }
        let vcpu = Some(vcpu);
        match lookup(SGI_REGS, offset - GICR_RD_FRAME_SIZE, size) {
            Some((SgiReg::Group(op), _)) => mmio::group_write(self, store, vcpu, 0, op, val as u32),
            Some((SgiReg::Priority, off)) => mmio::priority_write(store, vcpu, off as u32, size, val),
            // PPI trigger modes are fixed by the platform.
            Some((SgiReg::PpiConfig, _)) | Some((SgiReg::Raz, _)) | None => {}
        }
        Ok(())
    }
}
