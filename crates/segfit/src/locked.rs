//! Spin-locked heap usable as a global allocator.
//!
//! The heap core assumes a single caller at a time. [`LockedHeap`] takes one
//! exclusive lock around every call, which is what a kernel needs to put the
//! heap behind `#[global_allocator]`:
//!
//! ```rust,ignore
//! #[global_allocator]
//! static ALLOCATOR: LockedHeap<ArenaSource<'static>> = LockedHeap::empty();
//!
//! unsafe fn init_heap(start: NonNull<u8>, len: usize) {
//!     let source = unsafe { ArenaSource::from_raw_parts(start, len) };
//!     ALLOCATOR.init(source).unwrap();
//! }
//! ```

use core::{
    alloc::{GlobalAlloc, Layout},
    ptr::{self, NonNull},
};

use snafu::ensure;
use spin::{Mutex, MutexGuard};

use crate::{
    ALIGN,
    error::{AlreadyInitializedSnafu, InitError},
    heap::SegFitHeap,
    region::RegionSource,
};

/// A [`SegFitHeap`] behind a spin lock.
///
/// The heap starts out empty; allocations fail until [`init`](Self::init)
/// has been called.
pub struct LockedHeap<S> {
    heap: Mutex<Option<SegFitHeap<S>>>,
}

impl<S> Default for LockedHeap<S> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<S> LockedHeap<S> {
    /// Creates a heap with no region.
    #[must_use]
    pub const fn empty() -> Self {
        Self {
            heap: Mutex::new(None),
        }
    }

    /// Locks the heap for direct use.
    pub fn lock(&self) -> MutexGuard<'_, Option<SegFitHeap<S>>> {
        self.heap.lock()
    }

    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.heap.lock().is_some()
    }
}

impl<S> LockedHeap<S>
where
    S: RegionSource,
{
    /// Creates the heap over `source`.
    pub fn init(&self, source: S) -> Result<(), InitError> {
        let mut heap = self.heap.lock();
        ensure!(heap.is_none(), AlreadyInitializedSnafu);
        *heap = Some(SegFitHeap::new(source)?);
        Ok(())
    }
}

unsafe impl<S> GlobalAlloc for LockedHeap<S>
where
    S: RegionSource + Send,
{
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() > ALIGN {
            return ptr::null_mut();
        }
        self.heap
            .lock()
            .as_mut()
            .and_then(|heap| heap.allocate(layout.size()))
            .map_or(ptr::null_mut(), NonNull::as_ptr)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        if let Some(heap) = self.heap.lock().as_mut() {
            unsafe { heap.release(ptr) }
        }
    }
}
