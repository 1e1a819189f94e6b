//! Size-class index.
//!
//! Free blocks are grouped by the bit-length of their size: class `i` holds
//! every block whose highest set bit is bit `i`, so class `i` covers sizes in
//! `2^i..2^(i+1)`. Classification is a single leading-zero count.

/// Number of size classes (free-list buckets).
pub const CLASS_COUNT: usize = 64;

const _: () = assert!(usize::BITS as usize <= CLASS_COUNT);

/// Returns the size class of a block of `size` bytes.
///
/// # Panics
///
/// Panics if `size` is zero.
#[must_use]
pub const fn class_of(size: usize) -> usize {
    assert!(size != 0, "size class of an empty block is undefined");
    size.ilog2() as usize
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ALIGN, MIN_BLOCK_SIZE};

    #[test]
    fn test_class_boundaries() {
        assert_eq!(class_of(1), 0);
        assert_eq!(class_of(2), 1);
        assert_eq!(class_of(3), 1);
        assert_eq!(class_of(4096), 12);
        assert_eq!(class_of(4095), 11);
        assert_eq!(class_of(usize::MAX), usize::BITS as usize - 1);
    }

    #[test]
    fn test_classes_are_monotonic() {
        let mut prev = class_of(MIN_BLOCK_SIZE);
        for size in (MIN_BLOCK_SIZE..1 << 16).step_by(ALIGN) {
            let class = class_of(size);
            assert!(class >= prev);
            assert!(class < CLASS_COUNT);
            assert!(size >= 1 << class && size < 1 << (class + 1));
            prev = class;
        }
    }

    #[test]
    #[should_panic(expected = "size class of an empty block is undefined")]
    fn test_zero_size() {
        let _ = class_of(0);
    }
}
