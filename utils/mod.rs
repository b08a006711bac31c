//! Utility functions and data structures
//!
//! This module contains the logging backend, the index-linked list used for
//! per-vCPU candidate queues, and small bit helpers.

pub mod list;
pub mod log;

// Re-export commonly used utilities
pub use self::list::IndexList;

/// Whether `addr` is a multiple of `align`
#[macro_export]
macro_rules! is_aligned {
    ($addr:expr, $align:expr) => {
        (($addr) % ($align) == 0)
    };
}

/// Iterate the set bits of a 32-bit mask, lowest first
#[inline]
pub fn for_each_set_bit(mut mask: u32, mut f: impl FnMut(u32)) {
    while mask != 0 {
        let bit = mask.trailing_zeros();
        f(bit);
        mask &= mask - 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec::Vec;

    #[test]
    fn test_is_aligned() {
        assert!(is_aligned!(0x2_0000u64, 0x1_0000u64));
        assert!(!is_aligned!(0x2_0004u64, 0x1_0000u64));
    }

    #[test]
    fn test_for_each_set_bit() {
        let mut bits = Vec::new();
        for_each_set_bit(0x8000_0005, |b| bits.push(b));
        assert_eq!(bits, [0, 2, 31]);
    }
}
