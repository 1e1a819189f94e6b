//! Block metadata codec.
//!
//! A block's header (and, for free blocks, its footer) is a single word that
//! packs the block size together with two status bits. Block sizes are always
//! multiples of [`ALIGN`], so the low bits of the size are free to carry the
//! flags:
//!
//! ```text
//! ┌──────────────────────────────────────────────┬───┬───┐
//! │ size (multiple of ALIGN)                     │ P │ A │
//! └──────────────────────────────────────────────┴───┴───┘
//!                                                  1   0
//! ```

use bitflags::bitflags;

use crate::ALIGN;

bitflags! {
    /// Status bits stored in the low bits of a block tag.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct TagFlags: usize {
        /// The block holds a live allocation.
        const ALLOCATED = 1 << 0;

        /// The block immediately preceding this one (by address) holds a
        /// live allocation.
        const PREV_ALLOCATED = 1 << 1;
    }
}

const FLAGS_MASK: usize = 0b11;
const SIZE_MASK: usize = !FLAGS_MASK;

const _: () = assert!(TagFlags::all().bits() == FLAGS_MASK);
const _: () = assert!(ALIGN > FLAGS_MASK);

/// Decoded contents of a header or footer word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tag {
    /// Total block length in bytes, including the header.
    pub size: usize,
    /// Whether the block holds a live allocation.
    pub allocated: bool,
    /// Whether the preceding block holds a live allocation.
    pub prev_allocated: bool,
}

impl Tag {
    #[must_use]
    pub const fn new(size: usize, allocated: bool, prev_allocated: bool) -> Self {
        Self {
            size,
            allocated,
            prev_allocated,
        }
    }

    /// Tag of a free block.
    #[must_use]
    pub const fn free(size: usize, prev_allocated: bool) -> Self {
        Self::new(size, false, prev_allocated)
    }

    /// Tag of an allocated block.
    #[must_use]
    pub const fn allocated(size: usize, prev_allocated: bool) -> Self {
        Self::new(size, true, prev_allocated)
    }

    /// Packs the tag into a word.
    ///
    /// # Panics
    ///
    /// Panics if `size` is not a multiple of [`ALIGN`].
    #[must_use]
    pub fn encode(self) -> usize {
        assert!(
            self.size.is_multiple_of(ALIGN),
            "block size must be a multiple of {ALIGN}: size={}",
            self.size
        );
        let mut flags = TagFlags::empty();
        flags.set(TagFlags::ALLOCATED, self.allocated);
        flags.set(TagFlags::PREV_ALLOCATED, self.prev_allocated);
        self.size | flags.bits()
    }

    /// Unpacks a word written by [`encode`](Self::encode).
    #[must_use]
    pub const fn decode(word: usize) -> Self {
        let flags = TagFlags::from_bits_truncate(word & FLAGS_MASK);
        Self {
            size: word & SIZE_MASK,
            allocated: flags.contains(TagFlags::ALLOCATED),
            prev_allocated: flags.contains(TagFlags::PREV_ALLOCATED),
        }
    }
}
