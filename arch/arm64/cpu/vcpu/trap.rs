//! ARM64 VCPU exit decoding
//!
//! Turns the syndrome of a guest exit into an [`ExitReason`].
//!
//! ## Handled Exception Classes
//!
//! | Exit | Description | ESR_EL2.EC |
//! |------|-------------|------------|
//! | WFI/WFE | Trapped wait instruction | 0b000001 |
//! | MSR/MRS | Trapped system register access | 0b011000 |
//! | Data abort | Stage-2 fault from a lower EL | 0b100100 |
//!
//! ## References
//! - [ARM DDI 0487] ARMv8-A Architecture Reference Manual, D13.2.37
//! - [Xvisor cpu_vcpu_helper.c](https://github.com/xvisor/xvisor)

/// Exception classes the dispatcher distinguishes
pub mod ec {
    /// Trapped WFI or WFE
    pub const WFX: u32 = 0b000001;
    /// Trapped MSR, MRS or system instruction (AArch64)
    pub const SYS64: u32 = 0b011000;
    /// Data abort from a lower exception level
    pub const DABT_LOW: u32 = 0b100100;
}

/// Data abort ISS fields
mod dabt {
    pub const ISV: u32 = 1 << 24;
    pub const SAS_SHIFT: u32 = 22;
    pub const SSE: u32 = 1 << 21;
    pub const SRT_SHIFT: u32 = 16;
    pub const SF: u32 = 1 << 15;
    pub const WNR: u32 = 1 << 6;
}

/// A guest load or store to an emulated MMIO address
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MmioAccess {
    /// Guest physical address
    pub addr: u64,
    /// Access size in bytes
    pub size: u8,
    /// Store rather than load
    pub write: bool,
    /// Transfer register
    pub srt: u8,
    /// Sign-extend loaded value
    pub sign_extend: bool,
    /// 64-bit transfer register
    pub sixty_four: bool,
}

impl MmioAccess {
    /// Fit a loaded value to the transfer register
    pub fn extend(&self, val: u64) -> u64 {
        let bits = u32::from(self.size) * 8;
        let mut val = if bits < 64 { val & ((1u64 << bits) - 1) } else { val };
        if self.sign_extend && bits < 64 && val & (1u64 << (bits - 1)) != 0 {
            val |= !0u64 << bits;
        }
        if !self.sixty_four {
            val &= 0xffff_ffff;
        }
        val
    }
}

/// A trapped MSR or MRS
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SysRegAccess {
    /// Register as (op0, op1, CRn, CRm, op2)
    pub enc: (u8, u8, u8, u8, u8),
    /// MSR rather than MRS
    pub write: bool,
    /// Transfer register
    pub rt: u8,
}

/// Why the guest stopped running
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// Stage-2 data abort with a valid instruction syndrome
    DataAbort(MmioAccess),
    /// Trapped system register access
    SysReg(SysRegAccess),
    /// Trapped WFI
    Wfi,
    /// Trapped WFE
    Wfe,
    /// Physical interrupt taken to EL2
    Irq,
    /// Any other synchronous exit, with its exception class
    Other(u32),
}

impl ExitReason {
    /// Decode a synchronous exit from ESR_EL2 and the faulting IPA
    pub fn from_esr(esr: u64, ipa: u64) -> Self {
        let class = ((esr >> 26) & 0x3f) as u32;
        let iss = (esr & 0x1ff_ffff) as u32;

        match class {
            ec::WFX if iss & 1 == 0 => Self::Wfi,
            ec::WFX => Self::Wfe,
            ec::SYS64 => Self::SysReg(SysRegAccess {
                enc: (
                    ((iss >> 20) & 0x3) as u8,
                    ((iss >> 14) & 0x7) as u8,
                    ((iss >> 10) & 0xf) as u8,
                    ((iss >> 1) & 0xf) as u8,
                    ((iss >> 17) & 0x7) as u8,
                ),
                // Direction is 1 for reads.
                write: iss & 1 == 0,
                rt: ((iss >> 5) & 0x1f) as u8,
            }),
            // Without ISV the access cannot be emulated from the syndrome.
            ec::DABT_LOW if iss & dabt::ISV != 0 => Self::DataAbort(MmioAccess {
                addr: ipa,
                size: 1 << ((iss >> dabt::SAS_SHIFT) & 0x3),
                write: iss & dabt::WNR != 0,
                srt: ((iss >> dabt::SRT_SHIFT) & 0x1f) as u8,
                sign_extend: iss & dabt::SSE != 0,
                sixty_four: iss & dabt::SF != 0,
            }),
            _ => Self::Other(class),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn esr(class: u32, iss: u32) -> u64 {
        (u64::from(class) << 26) | (1 << 25) | u64::from(iss)
    }

    #[test_case(0, ExitReason::Wfi ; "wfi")]
    #[test_case(1, ExitReason::Wfe ; "wfe")]
    fn test_wfx(iss: u32, expected: ExitReason) {
        assert_eq!(ExitReason::from_esr(esr(ec::WFX, iss), 0), expected);
    }

    #[test]
    fn test_sgi1r_write() {
        // msr icc_sgi1r_el1, x3: op0=3 op2=5 op1=0 CRn=12 Rt=3 CRm=11 write
        let iss = (3 << 20) | (5 << 17) | (12 << 10) | (3 << 5) | (11 << 1);
        let reason = ExitReason::from_esr(esr(ec::SYS64, iss), 0);
        assert_eq!(
            reason,
            ExitReason::SysReg(SysRegAccess { enc: (3, 0, 12, 11, 5), write: true, rt: 3 })
        );
    }

    #[test]
    fn test_data_abort() {
        // str w5, [x1] with a word access
        let iss = dabt::ISV | (2 << dabt::SAS_SHIFT) | (5 << dabt::SRT_SHIFT) | dabt::WNR;
        let reason = ExitReason::from_esr(esr(ec::DABT_LOW, iss), 0x0800_0100);
        let ExitReason::DataAbort(access) = reason else {
            panic!("unexpected {:?}", reason);
        };
        assert_eq!(access.addr, 0x0800_0100);
        assert_eq!(access.size, 4);
        assert!(access.write);
        assert_eq!(access.srt, 5);
    }

    #[test]
    fn test_data_abort_without_syndrome() {
        let reason = ExitReason::from_esr(esr(ec::DABT_LOW, 0), 0x1000);
        assert_eq!(reason, ExitReason::Other(ec::DABT_LOW));
    }

    #[test_case(1, false, false, 0x80, 0x80 ; "byte zero extend")]
    #[test_case(1, true, true, 0x80, 0xffff_ffff_ffff_ff80 ; "byte sign extend x")]
    #[test_case(1, true, false, 0x80, 0xffff_ff80 ; "byte sign extend w")]
    #[test_case(4, false, true, 0x1_2345_6789, 0x2345_6789 ; "word truncates")]
    #[test_case(8, false, true, u64::MAX, u64::MAX ; "dword")]
    fn test_extend(size: u8, sign_extend: bool, sixty_four: bool, val: u64, expected: u64) {
        let access = MmioAccess { addr: 0, size, write: false, srt: 0, sign_extend, sixty_four };
        assert_eq!(access.extend(val), expected);
    }
}
