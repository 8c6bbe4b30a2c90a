//! Memory layout utilities

/// Round `value` up to a multiple of a power-of-two `alignment`
///
/// An alignment of zero leaves the value unchanged.
pub fn align_up(value: u64, alignment: u64) -> u64 {
    if alignment == 0 {
        return value;
    }
    (value + alignment - 1) & !(alignment - 1)
}

/// Bytes to allocate so a region of `size` bytes can start at an
/// `alignment` boundary wherever the allocation lands
pub fn padded_size(size: u64, alignment: u64) -> u64 {
    if alignment <= 1 {
        size
    } else {
        size + alignment - 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(32, 32), 32);
        assert_eq!(align_up(33, 32), 64);
        assert_eq!(align_up(0, 64), 0);
        assert_eq!(align_up(7, 0), 7);
    }

    #[test]
    fn test_padded_region_fits_after_alignment() {
        let base = 0x1004;
        let alignment = 128;
        let size = 4096;

        let start = align_up(base, alignment);
        assert_eq!(start % alignment, 0);
        assert!(start + size <= base + padded_size(size, alignment));
    }

    #[test]
    fn test_unit_alignment_needs_no_padding() {
        assert_eq!(padded_size(100, 1), 100);
        assert_eq!(padded_size(100, 0), 100);
    }
}
