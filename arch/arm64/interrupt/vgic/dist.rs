//! Virtual distributor (GICD) register decode
//!
//! The distributor configures shared interrupts 32..nirqs. Register banks
//! that would describe private interrupts (bank 0 of the set/clear
//! registers, the first eight priority words, the first two configuration
//! words and the first 32 routing registers) are read-as-zero /
//! write-ignored; those interrupts are configured through each vCPU's
//! redistributor instead.

use super::irq::{IrqConfig, IrqStore};
use super::mmio::{self, lookup, AccessWidth, GroupOp, RegRange};
use super::Vgic;
use crate::arch::arm64::interrupt::gic::{gic_reg_value_64, gicd, GIC_IIDR_ARM, GIC_PIDR2_ARCH_GICV3};
use crate::config::NR_PRIVATE_IRQS;
use crate::core::vmm::VcpuId;

/// INTID bits implemented (IDbits + 1)
const GICD_ID_BITS: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DistReg {
    Ctlr,
    Typer,
    Iidr,
    SetSpi,
    ClrSpi,
    Group(GroupOp),
    Priority,
    Config,
    Router,
    Pidr2,
    Raz,
}

const W: AccessWidth = AccessWidth::WORD;
const BW: AccessWidth = AccessWidth::BYTE.union(AccessWidth::WORD);
const WD: AccessWidth = AccessWidth::WORD.union(AccessWidth::DWORD);

const DIST_REGS: &[RegRange<DistReg>] = &[
    RegRange::new(gicd::CTLR, gicd::CTLR + 4, W, DistReg::Ctlr),
    RegRange::new(gicd::TYPER, gicd::TYPER + 4, W, DistReg::Typer),
    RegRange::new(gicd::IIDR, gicd::IIDR + 4, W, DistReg::Iidr),
    RegRange::new(gicd::STATUSR, gicd::STATUSR + 4, W, DistReg::Raz),
    RegRange::new(gicd::SETSPI_NSR, gicd::SETSPI_NSR + 4, W, DistReg::SetSpi),
    RegRange::new(gicd::CLRSPI_NSR, gicd::CLRSPI_NSR + 4, W, DistReg::ClrSpi),
    RegRange::new(gicd::IGROUPR, gicd::ISENABLER, W, DistReg::Raz),
    RegRange::new(gicd::ISENABLER, gicd::ICENABLER, W, DistReg::Group(GroupOp::SetEnable)),
    RegRange::new(gicd::ICENABLER, gicd::ISPENDR, W, DistReg::Group(GroupOp::ClearEnable)),
    RegRange::new(gicd::ISPENDR, gicd::ICPENDR, W, DistReg::Group(GroupOp::SetPending)),
    RegRange::new(gicd::ICPENDR, gicd::ISACTIVER, W, DistReg::Group(GroupOp::ClearPending)),
    RegRange::new(gicd::ISACTIVER, gicd::ICACTIVER, W, DistReg::Group(GroupOp::SetActive)),
    RegRange::new(gicd::ICACTIVER, gicd::IPRIORITYR, W, DistReg::Group(GroupOp::ClearActive)),
    RegRange::new(gicd::IPRIORITYR, gicd::ITARGETSR, BW, DistReg::Priority),
    RegRange::new(gicd::ITARGETSR, gicd::ICFGR, BW, DistReg::Raz),
    RegRange::new(gicd::ICFGR, gicd::IGRPMODR, W, DistReg::Config),
    RegRange::new(gicd::IGRPMODR, gicd::NSACR, W, DistReg::Raz),
    RegRange::new(gicd::NSACR, gicd::SGIR, W, DistReg::Raz),
    RegRange::new(gicd::SGIR, gicd::SGIR + 4, W, DistReg::Raz),
    RegRange::new(gicd::CPENDSGIR, gicd::SPENDSGIR_END, BW, DistReg::Raz),
    RegRange::new(gicd::IROUTER, gicd::IROUTER_END, WD, DistReg::Router),
    RegRange::new(gicd::PIDR2, gicd::PIDR2 + 4, W, DistReg::Pidr2),
];

impl Vgic {
    fn dist_typer(&self) -> u32 {
        let lines = (self.config.nirqs + 31) / 32 - 1;
        ((GICD_ID_BITS - 1) << gicd::TYPER_IDBITS_SHIFT)
            | gicd::TYPER_MBIS
            | (lines & gicd::TYPER_ITLINES_MASK)
    }

    /// Distributor read at `offset` within the distributor frame
    pub(crate) fn dist_read(&self, store: &IrqStore<'_>, offset: u64, size: u8) -> u64 {
        let Some((reg, off)) = lookup(DIST_REGS, offset, size) else {
            return 0;
        };

        let val = match reg {
            DistReg::Ctlr => u64::from(*self.dist_ctlr.lock()),
            DistReg::Typer => u64::from(self.dist_typer()),
            DistReg::Iidr => u64::from(GIC_IIDR_ARM),
            DistReg::Pidr2 => u64::from(GIC_PIDR2_ARCH_GICV3),
            DistReg::Group(op) => match (off / 4) as u32 {
                0 => 0,
                n => u64::from(mmio::group_read(store, None, n * 32, op)),
            },
            DistReg::Priority => {
                let first = off as u32;
                if first < NR_PRIVATE_IRQS {
                    0
                } else {
                    mmio::priority_read(store, None, first, size)
                }
            }
            DistReg::Config => match (off / 4) as u32 {
                0 | 1 => 0,
                n => u64::from(config_read(store, None, n * 16)),
            },
            DistReg::Router => {
                let irqid = (off / 8) as u32;
                if irqid < NR_PRIVATE_IRQS {
                    0
                } else {
                    let affinity = store.get(None, irqid).map_or(0, |irq| irq.affinity);
                    match size {
                        8 => affinity,
                        _ => (affinity >> ((off & 0x4) * 8)) & 0xffff_ffff,
                    }
                }
            }
            DistReg::SetSpi | DistReg::ClrSpi | DistReg::Raz => 0,
        };
        log::trace!("vgic: GICD read {:#06x}/{} = {:#x}", offset, size, val);
        val
    }

    /// Distributor write at `offset` within the distributor frame
    pub(crate) fn dist_write(&self, store: &IrqStore<'_>, offset: u64, size: u8, val: u64) {
        let Some((reg, off)) = lookup(DIST_REGS, offset, size) else {
            return;
        };
        log::trace!("vgic: GICD write {:#06x}/{} = {:#x}", offset, size, val);

        match reg {
            DistReg::Ctlr => {
                // Only group 1 enable is modeled; affinity routing is always on.
                *self.dist_ctlr.lock() = (val as u32 & gicd::CTLR_G1A) | gicd::CTLR_ARE_NS;
            }
            DistReg::SetSpi | DistReg::ClrSpi => {
                let irqid = (val & 0x3ff) as u32;
                let level = reg == DistReg::SetSpi;
                if let Err(err) = self.inject_locked(store, None, irqid, level) {
                    log::debug!("vgic: GICD SPI write for irq {} ignored: {}", irqid, err);
                }
            }
            DistReg::Group(op) => match (off / 4) as u32 {
                0 => {}
                n => mmio::group_write(self, store, None, n * 32, op, val as u32),
            },
            DistReg::Priority => {
                let first = off as u32;
                if first >= NR_PRIVATE_IRQS {
                    mmio::priority_write(store, None, first, size, val);
                }
            }
            DistReg::Config => match (off / 4) as u32 {
                0 | 1 => {}
                n => config_write(store, n * 16, val as u32),
            },
            DistReg::Router => {
                let irqid = (off / 8) as u32;
                if irqid < NR_PRIVATE_IRQS {
                    return;
                }
                let Some(mut irq) = store.get(None, irqid) else {
                    return;
                };
                let affinity = gic_reg_value_64(irq.affinity, val, off, size) & gicd::AFF_MASK;
                irq.affinity = affinity;
                // A record already queued stays on its old target's list.
                irq.target_vcpu = store.resolve_affinity(affinity);
                log::debug!(
                    "vgic: irq {} routed to {:#x} (vcpu {:?})",
                    irqid,
                    affinity,
                    irq.target_vcpu
                );
            }
            DistReg::Typer | DistReg::Iidr | DistReg::Pidr2 | DistReg::Raz => {}
        }
    }
}

/// Read 16 two-bit trigger fields starting at `first`
pub(crate) fn config_read(store: &IrqStore<'_>, vcpu: Option<VcpuId>, first: u32) -> u32 {
    (0..16u32).fold(0, |acc, i| match store.get(vcpu, first + i) {
        Some(irq) if irq.config == IrqConfig::Edge => acc | (gicd::ICFGR_EDGE << (2 * i)),
        _ => acc,
    })
}

fn config_write(store: &IrqStore<'_>, first: u32, val: u32) {
    for i in 0..16u32 {
        if let Some(mut irq) = store.get(None, first + i) {
            irq.config = if (val >> (2 * i)) & gicd::ICFGR_EDGE != 0 {
                IrqConfig::Edge
            } else {
                IrqConfig::Level
            };
        }
    }
}
