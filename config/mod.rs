//! Configuration management
//!
//! This module holds the per-VM interrupt controller configuration: how many
//! interrupt lines are implemented, how many list registers the host CPU
//! interface provides and how many vCPUs the VM may create.

use crate::{Error, Result};

/// Number of private (SGI + PPI) interrupts per vCPU
pub const NR_PRIVATE_IRQS: u32 = 32;

/// First interrupt id that is not a valid SPI (1020..1023 are special)
pub const MAX_SPI_LIMIT: u32 = 1023;

/// Architectural maximum number of list registers
pub const MAX_LIST_REGS: usize = 16;

/// Interrupt controller configuration for one VM
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VgicConfig {
    /// Total implemented interrupt ids (private + shared)
    pub nirqs: u32,
    /// Usable list registers per vCPU
    pub lr_count: usize,
    /// Configured maximum vCPUs for the VM
    pub max_vcpus: u16,
}

impl Default for VgicConfig {
    fn default() -> Self {
        Self {
            nirqs: MAX_SPI_LIMIT,
            lr_count: 4,
            max_vcpus: 8,
        }
    }
}

impl VgicConfig {
    /// Build a configuration from the host's `ICH_VTR_EL2` value.
    ///
    /// ListRegs is bits [4:0] and holds the list register count minus one.
    pub fn from_ich_vtr(vtr: u64, max_vcpus: u16) -> Self {
        let lr_count = ((vtr & 0x1f) as usize + 1).min(MAX_LIST_REGS);
        Self {
            lr_count,
            max_vcpus,
            ..Self::default()
        }
    }

    /// Number of shared interrupt records
    pub fn nr_shared_irqs(&self) -> usize {
        self.nirqs.saturating_sub(NR_PRIVATE_IRQS) as usize
    }
}

/// Validate an interrupt controller configuration
pub fn validate_vgic_config(config: &VgicConfig) -> Result<()> {
    if config.nirqs <= NR_PRIVATE_IRQS || config.nirqs > MAX_SPI_LIMIT {
        return Err(Error::InvalidArgument);
    }

    if config.lr_count == 0 || config.lr_count > MAX_LIST_REGS {
        return Err(Error::InvalidArgument);
    }

    if config.max_vcpus == 0 {
        return Err(Error::InvalidArgument);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test]
    fn test_default_config_is_valid() {
        let config = VgicConfig::default();
        assert!(validate_vgic_config(&config).is_ok());
        assert_eq!(config.nr_shared_irqs(), 991);
    }

    #[test]
    fn test_from_ich_vtr() {
        // ListRegs = 3 (4 LRs), PRIbits = 4
        let config = VgicConfig::from_ich_vtr((4 << 29) | 3, 4);
        assert_eq!(config.lr_count, 4);
        assert_eq!(VgicConfig::from_ich_vtr(0x3f, 4).lr_count, MAX_LIST_REGS);
        assert_eq!(config.max_vcpus, 4);
        assert!(validate_vgic_config(&config).is_ok());
    }

    #[test_case(VgicConfig { nirqs: 32, ..VgicConfig::default() } ; "no shared irqs")]
    #[test_case(VgicConfig { nirqs: 1024, ..VgicConfig::default() } ; "too many irqs")]
    #[test_case(VgicConfig { lr_count: 0, ..VgicConfig::default() } ; "no list registers")]
    #[test_case(VgicConfig { lr_count: 17, ..VgicConfig::default() } ; "too many list registers")]
    #[test_case(VgicConfig { max_vcpus: 0, ..VgicConfig::default() } ; "no vcpus")]
    fn test_invalid_config(config: VgicConfig) {
        assert_eq!(validate_vgic_config(&config), Err(Error::InvalidArgument));
    }
}
