//! GICv3 architectural definitions
//!
//! Register offsets, field layouts and affinity helpers shared by the
//! virtual distributor, the virtual redistributors and the list-register
//! scheduler.
//!
//! ## References
//! - ARM IHI 0069 (GICv3/v4 architecture specification)

use tock_registers::{register_bitfields, LocalRegisterCopy};

/// GIC version
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GicVersion {
    /// GICv2
    V2,
    /// GICv3
    V3,
    /// GICv4
    V4,
}

/// Size of one 64 KiB GIC frame
pub const GIC_FRAME_SIZE: u64 = 0x1_0000;

/// Distributor region size
pub const GICD_SIZE: u64 = GIC_FRAME_SIZE;

/// Redistributor RD_base frame size
pub const GICR_RD_FRAME_SIZE: u64 = GIC_FRAME_SIZE;

/// Redistributor SGI_base frame size
pub const GICR_SGI_FRAME_SIZE: u64 = GIC_FRAME_SIZE;

/// One redistributor (RD + SGI frames)
pub const GICR_FRAME_SIZE: u64 = GICR_RD_FRAME_SIZE + GICR_SGI_FRAME_SIZE;

/// Implementer JEP106 code for ARM, reported by IIDR
pub const GIC_IIDR_ARM: u32 = 0x43b;

/// PIDR2 value: ArchRev = 3 (GICv3)
pub const GIC_PIDR2_ARCH_GICV3: u32 = 0x3 << 4;

/// Distributor register offsets
pub mod gicd {
    /// Distributor Control Register
    pub const CTLR: u64 = 0x000;
    /// Interrupt Controller Type Register
    pub const TYPER: u64 = 0x004;
    /// Distributor Implementer Identification Register
    pub const IIDR: u64 = 0x008;
    /// Error Reporting Status Register
    pub const STATUSR: u64 = 0x010;
    /// Set SPI Register (non-secure)
    pub const SETSPI_NSR: u64 = 0x040;
    /// Clear SPI Register (non-secure)
    pub const CLRSPI_NSR: u64 = 0x048;
    /// Interrupt Group Registers
    pub const IGROUPR: u64 = 0x080;
    /// Interrupt Set-Enable Registers
    pub const ISENABLER: u64 = 0x100;
    /// Interrupt Clear-Enable Registers
    pub const ICENABLER: u64 = 0x180;
    /// Interrupt Set-Pending Registers
    pub const ISPENDR: u64 = 0x200;
    /// Interrupt Clear-Pending Registers
    pub const ICPENDR: u64 = 0x280;
    /// Interrupt Set-Active Registers
    pub const ISACTIVER: u64 = 0x300;
    /// Interrupt Clear-Active Registers
    pub const ICACTIVER: u64 = 0x380;
    /// Interrupt Priority Registers
    pub const IPRIORITYR: u64 = 0x400;
    /// Interrupt Processor Targets Registers (legacy)
    pub const ITARGETSR: u64 = 0x800;
    /// Interrupt Configuration Registers
    pub const ICFGR: u64 = 0xC00;
    /// Interrupt Group Modifier Registers
    pub const IGRPMODR: u64 = 0xD00;
    /// Non-secure Access Control Registers
    pub const NSACR: u64 = 0xE00;
    /// Software Generated Interrupt Register (legacy)
    pub const SGIR: u64 = 0xF00;
    /// SGI Clear-Pending Registers
    pub const CPENDSGIR: u64 = 0xF10;
    /// SGI Set-Pending Registers
    pub const SPENDSGIR: u64 = 0xF20;
    /// End of the SGI pending registers
    pub const SPENDSGIR_END: u64 = 0xF30;
    /// Interrupt Routing Registers
    pub const IROUTER: u64 = 0x6000;
    /// End of the routing registers (IROUTER1020)
    pub const IROUTER_END: u64 = 0x7FE0;
    /// Peripheral ID2 Register
    pub const PIDR2: u64 = 0xFFE8;

    /// CTLR: Enable Group 1 (affinity routing)
    pub const CTLR_G1A: u32 = 1 << 1;
    /// CTLR: Affinity Routing Enable, non-secure
    pub const CTLR_ARE_NS: u32 = 1 << 4;

    /// TYPER: IDbits field shift
    pub const TYPER_IDBITS_SHIFT: u32 = 19;
    /// TYPER: message-based SPIs supported
    pub const TYPER_MBIS: u32 = 1 << 16;
    /// TYPER: ITLinesNumber mask
    pub const TYPER_ITLINES_MASK: u32 = 0x1f;

    /// ICFGR: edge-triggered field value
    pub const ICFGR_EDGE: u32 = 0b10;

    /// Valid affinity bits of IROUTER (Aff3, Aff2, Aff1, Aff0)
    pub const AFF_MASK: u64 = 0xff_00ff_ffff;
}

/// Redistributor register offsets
pub mod gicr {
    /// Redistributor Control Register (RD frame)
    pub const CTLR: u64 = 0x0000;
    /// Implementer Identification Register (RD frame)
    pub const IIDR: u64 = 0x0004;
    /// Redistributor Type Register (RD frame)
    pub const TYPER: u64 = 0x0008;
    /// Error Reporting Status Register (RD frame)
    pub const STATUSR: u64 = 0x0010;
    /// Redistributor Wake Register (RD frame)
    pub const WAKER: u64 = 0x0014;
    /// LPI configuration table base (RD frame)
    pub const PROPBASER: u64 = 0x0070;
    /// LPI pending table base (RD frame)
    pub const PENDBASER: u64 = 0x0078;
    /// Peripheral ID2 Register (RD frame)
    pub const PIDR2: u64 = 0xFFE8;

    /// Interrupt Group Register 0 (SGI frame)
    pub const IGROUPR0: u64 = 0x0080;
    /// Interrupt Set-Enable Register 0 (SGI frame)
    pub const ISENABLER0: u64 = 0x0100;
    /// Interrupt Clear-Enable Register 0 (SGI frame)
    pub const ICENABLER0: u64 = 0x0180;
    /// Interrupt Set-Pending Register 0 (SGI frame)
    pub const ISPENDR0: u64 = 0x0200;
    /// Interrupt Clear-Pending Register 0 (SGI frame)
    pub const ICPENDR0: u64 = 0x0280;
    /// Interrupt Set-Active Register 0 (SGI frame)
    pub const ISACTIVER0: u64 = 0x0300;
    /// Interrupt Clear-Active Register 0 (SGI frame)
    pub const ICACTIVER0: u64 = 0x0380;
    /// Interrupt Priority Registers 0..7 (SGI frame)
    pub const IPRIORITYR: u64 = 0x0400;
    /// End of the priority registers (SGI frame)
    pub const IPRIORITYR_END: u64 = 0x0420;
    /// SGI Configuration Register (SGI frame)
    pub const ICFGR0: u64 = 0x0C00;
    /// PPI Configuration Register (SGI frame)
    pub const ICFGR1: u64 = 0x0C04;
    /// Interrupt Group Modifier Register 0 (SGI frame)
    pub const IGRPMODR0: u64 = 0x0D00;
    /// Non-secure Access Control Register (SGI frame)
    pub const NSACR: u64 = 0x0E00;
}

/// ICH (hypervisor CPU interface) system register bits
pub mod ich {
    /// HCR: global enable of the virtual CPU interface
    pub const HCR_EN: u64 = 1 << 0;
    /// HCR: underflow maintenance interrupt enable
    pub const HCR_UIE: u64 = 1 << 1;
}

/// ICC (CPU interface) system register encodings
pub mod icc {
    /// ICC_SGI1R_EL1 encoding (op0, op1, CRn, CRm, op2)
    pub const SGI1R_EL1: (u8, u8, u8, u8, u8) = (3, 0, 12, 11, 5);
}

register_bitfields! [u64,
    /// List register layout (ICH_LR<n>_EL2)
    pub ICH_LR [
        VINTID OFFSET(0) NUMBITS(32) [],
        PINTID OFFSET(32) NUMBITS(13) [],
        PRIORITY OFFSET(48) NUMBITS(8) [],
        GROUP OFFSET(60) NUMBITS(1) [],
        HW OFFSET(61) NUMBITS(1) [],
        STATE OFFSET(62) NUMBITS(2) [
            Invalid = 0,
            Pending = 1,
            Active = 2,
            PendingActive = 3
        ]
    ],

    /// SGI generation register layout (ICC_SGI1R_EL1)
    pub ICC_SGI1R [
        TARGET_LIST OFFSET(0) NUMBITS(16) [],
        AFF1 OFFSET(16) NUMBITS(8) [],
        INTID OFFSET(24) NUMBITS(4) [],
        AFF2 OFFSET(32) NUMBITS(8) [],
        IRM OFFSET(40) NUMBITS(1) [],
        RS OFFSET(44) NUMBITS(4) [],
        AFF3 OFFSET(48) NUMBITS(8) []
    ],

    /// Redistributor type register layout (GICR_TYPER)
    pub GICR_TYPER [
        PLPIS OFFSET(0) NUMBITS(1) [],
        VLPIS OFFSET(1) NUMBITS(1) [],
        DIRECT_LPI OFFSET(3) NUMBITS(1) [],
        LAST OFFSET(4) NUMBITS(1) [],
        PROCESSOR_NUMBER OFFSET(8) NUMBITS(16) [],
        AFFINITY OFFSET(32) NUMBITS(32) []
    ]
];

/// Local copy of a list register value
pub type IchLr = LocalRegisterCopy<u64, ICH_LR::Register>;

/// Local copy of an SGI generation request
pub type IccSgi1r = LocalRegisterCopy<u64, ICC_SGI1R::Register>;

/// Local copy of a redistributor type value
pub type GicrTyper = LocalRegisterCopy<u64, GICR_TYPER::Register>;

/// Affinity (MPIDR layout) assigned to vCPU `vcpu`.
///
/// Aff0 carries the low 4 bits so 16 vCPUs share one SGI target list.
pub fn vcpu_affinity(vcpu: usize) -> u64 {
    let vcpu = vcpu as u64;
    let aff0 = vcpu & 0xf;
    let aff1 = (vcpu >> 4) & 0xff;
    let aff2 = (vcpu >> 12) & 0xff;
    (aff2 << 16) | (aff1 << 8) | aff0
}

/// Pack MPIDR-layout affinity (Aff3 at bits [39:32]) into the 32-bit
/// `Aff3.Aff2.Aff1.Aff0` form used by GICR_TYPER
pub fn affinity_to_typer(mpidr: u64) -> u64 {
    ((mpidr >> 8) & 0xff00_0000) | (mpidr & 0x00ff_ffff)
}

/// Merge an access of `size` bytes at byte `offset` within a 64-bit register
pub fn gic_reg_value_64(old: u64, new: u64, offset: u64, size: u8) -> u64 {
    match size {
        8 => new,
        4 => {
            let shift = (offset & 0x4) * 8;
            (old & !(0xffff_ffffu64 << shift)) | ((new & 0xffff_ffff) << shift)
        }
        _ => old,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(0, 0x0 ; "vcpu 0")]
    #[test_case(5, 0x5 ; "aff0 only")]
    #[test_case(17, 0x101 ; "aff1 carry")]
    #[test_case(0x1234, 0x1_2304 ; "aff2 carry")]
    fn test_vcpu_affinity(vcpu: usize, expected: u64) {
        assert_eq!(vcpu_affinity(vcpu), expected);
        assert_eq!(vcpu_affinity(vcpu) & !gicd::AFF_MASK, 0);
    }

    #[test]
    fn test_affinity_to_typer() {
        assert_eq!(affinity_to_typer(0x12_0034_5678), 0x1234_5678);
    }

    #[test]
    fn test_gic_reg_value_64() {
        let old = 0x1111_2222_3333_4444;
        assert_eq!(gic_reg_value_64(old, 0xaaaa_bbbb, 0, 4), 0x1111_2222_aaaa_bbbb);
        assert_eq!(gic_reg_value_64(old, 0xaaaa_bbbb, 4, 4), 0xaaaa_bbbb_3333_4444);
        assert_eq!(gic_reg_value_64(old, 5, 0, 8), 5);
        assert_eq!(gic_reg_value_64(old, 5, 0, 2), old);
    }

    #[test]
    fn test_ich_lr_layout() {
        let mut lr = IchLr::new(0);
        lr.write(
            ICH_LR::VINTID.val(100)
                + ICH_LR::PRIORITY.val(0xa0)
                + ICH_LR::GROUP::SET
                + ICH_LR::STATE::Pending,
        );
        assert_eq!(lr.get(), (1 << 62) | (1 << 60) | (0xa0 << 48) | 100);
        assert_eq!(lr.read(ICH_LR::VINTID), 100);
    }

    #[test]
    fn test_sgi1r_fields() {
        let sgir = IccSgi1r::new((1 << 40) | (3 << 24) | (2 << 16) | 0x5);
        assert_eq!(sgir.read(ICC_SGI1R::INTID), 3);
        assert_eq!(sgir.read(ICC_SGI1R::AFF1), 2);
        assert_eq!(sgir.read(ICC_SGI1R::TARGET_LIST), 5);
        assert!(sgir.is_set(ICC_SGI1R::IRM));
    }
}
