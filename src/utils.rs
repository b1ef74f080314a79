//! Utility functions.

/// Aligns an address or size up to the next multiple of `align`.
/// `align` must be a power of two.
pub fn align_up(addr: u64, align: u64) -> u64 {
    debug_assert!(align.is_power_of_two());
    (addr + align - 1) & !(align - 1)
}

#[cfg(test)]
mod tests {
    use super::align_up;

    #[test]
    fn rounds_up_to_power_of_two() {
        assert_eq!(align_up(0x1001, 0x1000), 0x2000);
        assert_eq!(align_up(0x1000, 0x1000), 0x1000);
        assert_eq!(align_up(7, 1), 7);
    }
}
