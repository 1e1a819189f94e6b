//! Memory-backed region source.
//!
//! [`ArenaSource`] hands out a fixed memory window one span at a time, the
//! way `sbrk` moves a program break. It is what a kernel uses when its heap
//! is a reserved physical range, and what tests use to get a region with a
//! known capacity.

use core::{marker::PhantomData, ptr::NonNull};

use crate::{ALIGN, error::GrowError, region::RegionSource};

/// A [`RegionSource`] that grows through a fixed memory window.
///
/// The window start is rounded up to [`ALIGN`]. Growth never exceeds the
/// window; a request that does not fit fails as a whole.
#[derive(Debug)]
pub struct ArenaSource<'a> {
    base: NonNull<u8>,
    capacity: usize,
    brk: usize,
    _memory: PhantomData<&'a mut [u8]>,
}

unsafe impl Send for ArenaSource<'_> {}

impl<'a> ArenaSource<'a> {
    /// Creates a source that grows through `memory`.
    #[must_use]
    pub fn new(memory: &'a mut [u8]) -> Self {
        let len = memory.len();
        let start = NonNull::from(memory).cast::<u8>();
        unsafe { Self::from_raw_parts(start, len) }
    }

    /// Creates a source over the memory window `start..start + len`.
    ///
    /// # Safety
    ///
    /// The caller must ensure that:
    ///
    /// - the window is valid for reads and writes for `'a`
    /// - nothing else uses the window for `'a`
    pub unsafe fn from_raw_parts(start: NonNull<u8>, len: usize) -> Self {
        let offset = start.as_ptr().align_offset(ALIGN).min(len);
        Self {
            base: unsafe { start.add(offset) },
            capacity: len - offset,
            brk: 0,
            _memory: PhantomData,
        }
    }

    /// Total number of bytes the region can grow to.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of bytes handed out so far.
    #[must_use]
    pub fn used(&self) -> usize {
        self.brk
    }

    #[must_use]
    pub fn remaining(&self) -> usize {
        self.capacity - self.brk
    }
}

unsafe impl RegionSource for ArenaSource<'_> {
    fn grow(&mut self, bytes: usize) -> Result<NonNull<u8>, GrowError> {
        let available = self.remaining();
        if bytes > available {
            return Err(GrowError::Exhausted {
                requested: bytes,
                available,
            });
        }
        let span = unsafe { self.base.add(self.brk) };
        self.brk += bytes;
        Ok(span)
    }

    fn start(&self) -> NonNull<u8> {
        self.base
    }

    fn end(&self) -> NonNull<u8> {
        unsafe { self.base.add(self.brk) }
    }
}
