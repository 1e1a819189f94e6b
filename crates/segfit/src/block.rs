//! Block handle.
//!
//! [`Block`] is the only place that does header/footer/link address
//! arithmetic. Every method that touches memory is `unsafe`: the caller
//! guarantees the handle points at a block header inside the managed region
//! (the heap checks this against the region bounds before building handles
//! from untrusted addresses).

use core::{fmt, ptr::NonNull};

use crate::{WORD, tag::Tag};

const NEXT_FREE_OFFSET: usize = WORD;
const PREV_FREE_OFFSET: usize = 2 * WORD;

/// Handle to a block, identified by the address of its header.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct Block {
    header: NonNull<u8>,
}

impl fmt::Debug for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Block({:#x})", self.addr())
    }
}

impl Block {
    /// Creates a handle for the block whose header is at `header`.
    ///
    /// # Safety
    ///
    /// `header` must be word-aligned and point into the managed region.
    pub(crate) const unsafe fn from_header(header: NonNull<u8>) -> Self {
        Self { header }
    }

    /// Creates a handle for the block owning the payload at `payload`.
    ///
    /// # Safety
    ///
    /// `payload` must be a payload address previously handed out by the heap,
    /// so that the word before it lies in the same region.
    pub(crate) unsafe fn from_payload(payload: NonNull<u8>) -> Self {
        Self {
            header: unsafe { payload.sub(WORD) },
        }
    }

    pub(crate) fn addr(self) -> usize {
        self.header.addr().get()
    }

    pub(crate) const fn header_ptr(self) -> NonNull<u8> {
        self.header
    }

    pub(crate) fn payload(self) -> NonNull<u8> {
        unsafe { self.header.add(WORD) }
    }

    unsafe fn word(self, offset: usize) -> NonNull<usize> {
        unsafe { self.header.add(offset).cast() }
    }

    pub(crate) unsafe fn raw_header(self) -> usize {
        unsafe { self.word(0).read() }
    }

    pub(crate) unsafe fn tag(self) -> Tag {
        unsafe { Tag::decode(self.raw_header()) }
    }

    pub(crate) unsafe fn set_tag(self, tag: Tag) {
        unsafe { self.word(0).write(tag.encode()) }
    }

    pub(crate) unsafe fn size(self) -> usize {
        unsafe { self.tag().size }
    }

    pub(crate) unsafe fn set_prev_allocated(self, prev_allocated: bool) {
        unsafe {
            let tag = self.tag();
            self.set_tag(Tag {
                prev_allocated,
                ..tag
            });
        }
    }

    /// Address one past the end of the block, which is also the header of the
    /// block that follows it.
    pub(crate) unsafe fn end(self) -> NonNull<u8> {
        unsafe { self.header.add(self.size()) }
    }

    unsafe fn footer(self) -> NonNull<usize> {
        unsafe { self.word(self.size() - WORD) }
    }

    pub(crate) unsafe fn raw_footer(self) -> usize {
        unsafe { self.footer().read() }
    }

    /// Writes the header and the footer of a free block of `size` bytes.
    pub(crate) unsafe fn write_free(self, size: usize, prev_allocated: bool) {
        let tag = Tag::free(size, prev_allocated);
        unsafe {
            self.set_tag(tag);
            self.footer().write(tag.encode());
        }
    }

    /// Zeroes the footer slot of the block at its current size.
    pub(crate) unsafe fn clear_footer(self) {
        unsafe { self.footer().write(0) }
    }

    pub(crate) unsafe fn clear_header(self) {
        unsafe { self.word(0).write(0) }
    }

    /// Address of the word right before the header, where the preceding
    /// block keeps its footer when it is free.
    pub(crate) fn prev_footer_addr(self) -> usize {
        self.addr() - WORD
    }

    /// Returns the preceding block, located through its footer.
    ///
    /// # Safety
    ///
    /// The preceding block must be free, and its footer must lie inside the
    /// managed region.
    pub(crate) unsafe fn prev_in_memory(self) -> Self {
        unsafe {
            let footer = Tag::decode(self.header.sub(WORD).cast::<usize>().read());
            Self::from_header(self.header.sub(footer.size))
        }
    }

    pub(crate) unsafe fn next_free(self) -> Option<Self> {
        unsafe { load_link(self.word(NEXT_FREE_OFFSET)) }
    }

    pub(crate) unsafe fn set_next_free(self, next: Option<Self>) {
        unsafe { store_link(self.word(NEXT_FREE_OFFSET), next) }
    }

    pub(crate) unsafe fn prev_free(self) -> Option<Self> {
        unsafe { load_link(self.word(PREV_FREE_OFFSET)) }
    }

    pub(crate) unsafe fn set_prev_free(self, prev: Option<Self>) {
        unsafe { store_link(self.word(PREV_FREE_OFFSET), prev) }
    }
}

unsafe fn load_link(slot: NonNull<usize>) -> Option<Block> {
    let ptr = unsafe { slot.cast::<*mut u8>().read() };
    NonNull::new(ptr).map(|header| Block { header })
}

unsafe fn store_link(slot: NonNull<usize>, block: Option<Block>) {
    let ptr = block.map_or(core::ptr::null_mut(), |block| block.header.as_ptr());
    unsafe { slot.cast::<*mut u8>().write(ptr) }
}
