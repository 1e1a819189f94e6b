//! Allocator core.
//!
//! [`SegFitHeap`] ties the pieces together: it classifies requests, searches
//! the segregated free list, splits blocks, grows the region when nothing
//! fits, and coalesces freed blocks with their neighbors.
//!
//! # Allocation
//!
//! A request of `n` bytes needs a block of `round_up(n + WORD, ALIGN)` bytes
//! (header plus payload), but never less than [`MIN_BLOCK_SIZE`]. The best
//! fitting free block is either used whole, when the leftover could not hold
//! a free block, or split into the allocated block and a free remainder.
//! When no free block fits, the region grows by exactly the block size and
//! the new span becomes the allocated block.
//!
//! # Release
//!
//! A freed block is merged with the block before it (found through that
//! block's footer, consulted only when the previous-allocated bit is clear)
//! and with the block after it (found by address arithmetic, consulted only
//! when it lies inside the region). The merged block keeps the lowest header
//! of the blocks it absorbed.
//!
//! ```text
//! before:  │ back (free) │ this (allocated) │ front (free) │
//! after:   │ back (free, size = back + this + front)        │
//! ```

use core::{num::NonZeroUsize, ptr::NonNull};

use snafu::{OptionExt as _, ResultExt as _, ensure};

use crate::{
    ALIGN, INITIAL_HEAP_SIZE, MIN_BLOCK_SIZE, WORD,
    block::Block,
    error::{
        AllocError, CheckError, GrowError, InitError, InitialGrowSnafu, InvalidInitialSizeSnafu,
        MisalignedStartSnafu, OutOfMemorySnafu, SizeOverflowSnafu,
    },
    free_list::FreeList,
    region::{Region, RegionSource},
    size_class::{CLASS_COUNT, class_of},
    tag::Tag,
};

/// Returns the size of the block that holds a payload of `size` bytes.
fn block_size_for(size: usize) -> Option<usize> {
    let size = size.checked_add(WORD)?.checked_next_multiple_of(ALIGN)?;
    Some(size.max(MIN_BLOCK_SIZE))
}

/// A segregated-fit heap over a region grown through `S`.
///
/// The heap is single-threaded: it is `Send` when its source is, and never
/// `Sync`. Wrap it in a [`LockedHeap`](crate::LockedHeap) to share it.
pub struct SegFitHeap<S> {
    region: Region<S>,
    free_list: FreeList,
}

unsafe impl<S> Send for SegFitHeap<S> where S: Send {}

impl<S> SegFitHeap<S>
where
    S: RegionSource,
{
    /// Creates a heap whose region starts with [`INITIAL_HEAP_SIZE`] bytes.
    pub fn new(source: S) -> Result<Self, InitError> {
        Self::with_initial_size(source, INITIAL_HEAP_SIZE)
    }

    /// Creates a heap whose region starts with `size` bytes.
    ///
    /// The first word of the region is padding; the remaining `size - WORD`
    /// bytes become one free block, so that amount must be a multiple of
    /// [`ALIGN`] and at least [`MIN_BLOCK_SIZE`]. The start of the region
    /// returned by `source` must be [`ALIGN`]-aligned.
    pub fn with_initial_size(mut source: S, size: usize) -> Result<Self, InitError> {
        let minimum = WORD + MIN_BLOCK_SIZE;
        ensure!(
            size >= minimum && (size - WORD).is_multiple_of(ALIGN),
            InvalidInitialSizeSnafu { size, minimum }
        );

        let start = source.grow(size).context(InitialGrowSnafu)?;
        let address = start.addr().get();
        ensure!(
            address.is_multiple_of(ALIGN),
            MisalignedStartSnafu {
                address,
                alignment: ALIGN
            }
        );

        let first = unsafe {
            let first = Block::from_header(start.add(WORD));
            first.write_free(size - WORD, true);
            first
        };
        let end = unsafe { start.add(size) };
        let region = Region::new(source, start, first, end);
        let mut free_list = FreeList::new();
        unsafe { free_list.insert(first) };

        info!("heap initialized: start={address:#x}, size={size}");
        Ok(Self { region, free_list })
    }

    /// Allocates at least `size` bytes and returns the payload address.
    ///
    /// The returned address is [`ALIGN`]-aligned. Returns `None` when `size`
    /// is zero (without touching the heap) or when the region cannot grow.
    #[must_use]
    pub fn allocate(&mut self, size: usize) -> Option<NonNull<u8>> {
        let size = NonZeroUsize::new(size)?;
        match self.try_allocate(size) {
            Ok(payload) => Some(payload),
            Err(err) => {
                warn!("allocation failed: {err}");
                None
            }
        }
    }

    /// Allocates at least `size` bytes, reporting why an allocation failed.
    ///
    /// On failure the heap is left exactly as it was.
    pub fn try_allocate(&mut self, size: NonZeroUsize) -> Result<NonNull<u8>, AllocError> {
        let requested = size.get();
        let block_size = block_size_for(requested).context(SizeOverflowSnafu { requested })?;

        let block = match unsafe { self.free_list.find_best_fit(block_size) } {
            Some(block) => unsafe { self.take_free_block(block, block_size) },
            None => self.grow_block(block_size).context(OutOfMemorySnafu {
                requested,
                block_size,
            })?,
        };
        Ok(block.payload())
    }

    /// Turns the free block `block` into an allocated block of at least
    /// `block_size` bytes, splitting off the remainder when it is large
    /// enough to be a free block.
    unsafe fn take_free_block(&mut self, block: Block, block_size: usize) -> Block {
        unsafe {
            self.free_list.remove(block);
            let tag = block.tag();
            debug_assert!(!tag.allocated && tag.size >= block_size);

            let remainder = tag.size - block_size;
            if remainder < MIN_BLOCK_SIZE {
                trace!(
                    "using whole free block: block={:#x}, size={}",
                    block.addr(),
                    tag.size
                );
                block.set_tag(Tag::allocated(tag.size, tag.prev_allocated));
                if let Some(next) = self.next_block(block) {
                    next.set_prev_allocated(true);
                }
            } else {
                block.set_tag(Tag::allocated(block_size, tag.prev_allocated));
                let rest = Block::from_header(block.end());
                rest.write_free(remainder, true);
                self.free_list.insert(rest);
                if self.region.last_block() == block {
                    self.region.update_last_block(rest);
                }
                trace!(
                    "split free block: block={:#x}, size={block_size}, remainder={remainder}",
                    block.addr()
                );
            }
            block
        }
    }

    /// Grows the region by `block_size` bytes and returns the new span as an
    /// allocated block.
    fn grow_block(&mut self, block_size: usize) -> Result<Block, GrowError> {
        let prev_allocated = unsafe { self.region.last_block().tag().allocated };
        let block = self.region.grow(block_size)?;
        unsafe { block.set_tag(Tag::allocated(block_size, prev_allocated)) };
        self.region.update_last_block(block);
        debug!(
            "region grown: block={:#x}, size={block_size}, region_size={}",
            block.addr(),
            self.region.size()
        );
        Ok(block)
    }

    /// Returns the block following `block`, if it lies inside the region.
    unsafe fn next_block(&self, block: Block) -> Option<Block> {
        let next = unsafe { block.end() };
        self.region
            .is_within_region(next.addr().get())
            .then(|| unsafe { Block::from_header(next) })
    }

    /// Looks up the live block owning `payload`, panicking on addresses that
    /// cannot belong to one.
    fn live_block(&self, payload: NonNull<u8>) -> Block {
        let addr = payload.addr().get();
        let in_region = addr >= self.region.first_block().addr() + WORD
            && addr < self.region.end().addr().get()
            && addr.is_multiple_of(ALIGN);
        if !in_region {
            error!("released pointer does not belong to the heap: ptr={addr:#x}");
            panic!("released pointer does not belong to the heap: ptr={addr:#x}");
        }
        let block = unsafe { Block::from_payload(payload) };
        let tag = unsafe { block.tag() };
        if !tag.allocated {
            error!("double free detected: ptr={addr:#x}");
            panic!("double free detected: ptr={addr:#x}");
        }
        block
    }

    /// Releases the allocation at `ptr`. A null `ptr` is ignored.
    ///
    /// # Panics
    ///
    /// Panics if `ptr` lies outside the region or its block is not allocated
    /// (for example, on a double free).
    ///
    /// # Safety
    ///
    /// The caller must ensure that:
    ///
    /// - `ptr` is null or was returned by this heap's
    ///   [`allocate`](Self::allocate) or [`try_allocate`](Self::try_allocate)
    /// - the memory is not accessed after this call
    pub unsafe fn release(&mut self, ptr: *mut u8) {
        let Some(payload) = NonNull::new(ptr) else {
            return;
        };
        let block = self.live_block(payload);

        unsafe {
            let tag = block.tag();
            let size = tag.size;

            let back = (!tag.prev_allocated
                && self.region.is_within_region(block.prev_footer_addr()))
            .then(|| block.prev_in_memory());
            let next = self.next_block(block);
            let front = next.filter(|next| !next.tag().allocated);

            match (back, front) {
                (None, None) => {
                    block.write_free(size, tag.prev_allocated);
                    self.free_list.insert(block);
                    if let Some(next) = next {
                        next.set_prev_allocated(false);
                    }
                    trace!("released block: block={:#x}, size={size}", block.addr());
                }
                (None, Some(front)) => {
                    self.free_list.remove(front);
                    let merged = size + front.size();
                    block.clear_footer();
                    front.clear_header();
                    block.write_free(merged, tag.prev_allocated);
                    self.free_list.insert(block);
                    if self.region.last_block() == front {
                        self.region.update_last_block(block);
                    }
                    trace!(
                        "merged with front: block={:#x}, size={merged}",
                        block.addr()
                    );
                }
                (Some(back), None) => {
                    self.free_list.remove(back);
                    let back_tag = back.tag();
                    let merged = back_tag.size + size;
                    back.clear_footer();
                    block.clear_header();
                    back.write_free(merged, back_tag.prev_allocated);
                    self.free_list.insert(back);
                    if self.region.last_block() == block {
                        self.region.update_last_block(back);
                    }
                    if let Some(next) = next {
                        next.set_prev_allocated(false);
                    }
                    trace!(
                        "merged with back: block={:#x}, size={merged}",
                        back.addr()
                    );
                }
                (Some(back), Some(front)) => {
                    self.free_list.remove(back);
                    self.free_list.remove(front);
                    let back_tag = back.tag();
                    let merged = back_tag.size + size + front.size();
                    back.clear_footer();
                    block.clear_footer();
                    block.clear_header();
                    front.clear_header();
                    back.write_free(merged, back_tag.prev_allocated);
                    self.free_list.insert(back);
                    if self.region.last_block() == front {
                        self.region.update_last_block(back);
                    }
                    trace!(
                        "merged with both neighbors: block={:#x}, size={merged}",
                        back.addr()
                    );
                }
            }
        }
    }

    /// Returns the number of payload bytes usable through `ptr`.
    ///
    /// # Panics
    ///
    /// Panics if `ptr` does not point at a live allocation of this heap.
    #[must_use]
    pub fn usable_size(&self, ptr: NonNull<u8>) -> usize {
        let block = self.live_block(ptr);
        unsafe { block.size() - WORD }
    }

    /// Iterates over all blocks of the region in address order.
    #[must_use]
    pub fn blocks(&self) -> Blocks<'_, S> {
        Blocks {
            heap: self,
            next: Some(self.region.first_block()),
        }
    }

    /// Summarizes the blocks of the region.
    #[must_use]
    pub fn stats(&self) -> HeapStats {
        let mut stats = HeapStats {
            region_size: self.region.size(),
            ..HeapStats::default()
        };
        for block in self.blocks() {
            stats.record(&block);
        }
        stats
    }

    /// Verifies every heap invariant and returns the heap statistics.
    ///
    /// The walk checks block sizes, header/footer agreement of free blocks,
    /// the previous-allocated bits, that no two free blocks are adjacent, and
    /// that the tracked last block is the last one. The free lists are then
    /// checked for membership, size class and link consistency.
    pub fn check(&self) -> Result<HeapStats, CheckError> {
        let end = self.region.end().addr().get();
        let mut stats = HeapStats {
            region_size: self.region.size(),
            ..HeapStats::default()
        };

        let mut block = self.region.first_block();
        let mut prev: Option<Tag> = None;
        loop {
            let addr = block.addr();
            let (tag, header) = unsafe { (block.tag(), block.raw_header()) };
            let size = tag.size;
            if !size.is_multiple_of(ALIGN) {
                return Err(CheckError::UnalignedSize { block: addr, size });
            }
            if size < MIN_BLOCK_SIZE {
                return Err(CheckError::TooSmall { block: addr, size });
            }
            if size > end - addr {
                return Err(CheckError::Overrun {
                    block: addr,
                    size,
                    end,
                });
            }
            if let Some(prev) = prev {
                if tag.prev_allocated != prev.allocated {
                    return Err(CheckError::StalePrevAllocated {
                        block: addr,
                        expected: prev.allocated,
                    });
                }
                if !prev.allocated && !tag.allocated {
                    return Err(CheckError::AdjacentFree { block: addr });
                }
            }
            if !tag.allocated {
                let footer = unsafe { block.raw_footer() };
                if footer != header {
                    return Err(CheckError::FooterMismatch {
                        block: addr,
                        header,
                        footer,
                    });
                }
            }
            stats.record(&BlockInfo::new(block, tag));
            prev = Some(tag);

            if addr + size == end {
                break;
            }
            block = unsafe { Block::from_header(block.end()) };
        }

        let tracked = self.region.last_block();
        if tracked != block {
            return Err(CheckError::LastBlockMismatch {
                tracked: tracked.addr(),
                actual: block.addr(),
            });
        }

        let mut listed = 0;
        for class in 0..CLASS_COUNT {
            let mut expected_prev = None;
            for block in unsafe { self.free_list.iter_class(class) } {
                let addr = block.addr();
                if !self.region.is_within_region(addr) {
                    return Err(CheckError::StrayFreeBlock { block: addr });
                }
                let tag = unsafe { block.tag() };
                if tag.allocated {
                    return Err(CheckError::AllocatedInFreeList { block: addr });
                }
                if tag.size == 0 || class_of(tag.size) != class {
                    return Err(CheckError::MisfiledFreeBlock {
                        block: addr,
                        size: tag.size,
                        class,
                    });
                }
                if unsafe { block.prev_free() } != expected_prev {
                    return Err(CheckError::BrokenLink { block: addr });
                }
                expected_prev = Some(block);
                listed += 1;
                if listed > stats.free_block_count {
                    break;
                }
            }
        }
        if listed != stats.free_block_count {
            return Err(CheckError::FreeCountMismatch {
                walked: stats.free_block_count,
                listed,
            });
        }

        Ok(stats)
    }

    /// Lowest address of the managed region.
    #[must_use]
    pub fn region_start(&self) -> NonNull<u8> {
        self.region.start()
    }

    /// Address one past the end of the managed region.
    #[must_use]
    pub fn region_end(&self) -> NonNull<u8> {
        self.region.end()
    }

    /// Current size of the managed region in bytes.
    #[must_use]
    pub fn region_size(&self) -> usize {
        self.region.size()
    }

    #[must_use]
    pub fn source(&self) -> &S {
        self.region.source()
    }

    /// Tears down the heap and returns its source. Outstanding allocations
    /// stay valid for as long as the source's memory does.
    #[must_use]
    pub fn into_source(self) -> S {
        self.region.into_source()
    }
}

/// Description of one block of the region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
    /// Address of the block header.
    pub header: usize,
    /// Address of the block payload.
    pub payload: usize,
    /// Total block size, header included.
    pub size: usize,
    pub allocated: bool,
    pub prev_allocated: bool,
}

impl BlockInfo {
    fn new(block: Block, tag: Tag) -> Self {
        Self {
            header: block.addr(),
            payload: block.payload().addr().get(),
            size: tag.size,
            allocated: tag.allocated,
            prev_allocated: tag.prev_allocated,
        }
    }
}

/// Iterator over the blocks of a [`SegFitHeap`], created by
/// [`SegFitHeap::blocks`].
pub struct Blocks<'a, S> {
    heap: &'a SegFitHeap<S>,
    next: Option<Block>,
}

impl<S> Iterator for Blocks<'_, S>
where
    S: RegionSource,
{
    type Item = BlockInfo;

    fn next(&mut self) -> Option<Self::Item> {
        let block = self.next.take()?;
        let tag = unsafe { block.tag() };
        let end = self.heap.region.end().addr().get();
        // stop at a corrupted size instead of walking off the region
        if tag.size >= MIN_BLOCK_SIZE && tag.size < end - block.addr() {
            self.next = Some(unsafe { Block::from_header(block.end()) });
        }
        Some(BlockInfo::new(block, tag))
    }
}

/// Block-level statistics of a heap.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct HeapStats {
    /// Size of the managed region in bytes.
    pub region_size: usize,
    pub allocated_block_count: usize,
    pub free_block_count: usize,
    /// Bytes in allocated blocks, headers included.
    pub allocated_bytes: usize,
    /// Bytes in free blocks, headers and footers included.
    pub free_bytes: usize,
    pub largest_free_block: usize,
}

impl HeapStats {
    fn record(&mut self, block: &BlockInfo) {
        if block.allocated {
            self.allocated_block_count += 1;
            self.allocated_bytes += block.size;
        } else {
            self.free_block_count += 1;
            self.free_bytes += block.size;
            self.largest_free_block = self.largest_free_block.max(block.size);
        }
    }

    #[must_use]
    pub fn block_count(&self) -> usize {
        self.allocated_block_count + self.free_block_count
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    extern crate alloc;

    use alloc::vec::Vec;
    use core::{alloc::Layout, slice};

    use super::*;
    use crate::ArenaSource;

    type TestHeap = SegFitHeap<ArenaSource<'static>>;

    fn with_test_heap<F>(capacity: usize, test_fn: F)
    where
        F: FnOnce(&mut TestHeap),
    {
        unsafe {
            let layout = Layout::from_size_align(capacity, ALIGN).unwrap();
            let start = alloc::alloc::alloc(layout);
            start.write_bytes(0x11, capacity);
            let source = ArenaSource::from_raw_parts(NonNull::new(start).unwrap(), capacity);
            let mut heap = SegFitHeap::new(source).unwrap();
            test_fn(&mut heap);
            heap.check().unwrap();
            drop(heap);
            alloc::alloc::dealloc(start, layout);
        }
    }

    fn block_list(heap: &TestHeap) -> Vec<(usize, bool)> {
        heap.blocks()
            .map(|block| (block.size, block.allocated))
            .collect()
    }

    fn block_of(heap: &TestHeap, payload: NonNull<u8>) -> BlockInfo {
        heap.blocks()
            .find(|block| block.payload == payload.addr().get())
            .unwrap()
    }

    unsafe fn fill(ptr: NonNull<u8>, len: usize, byte: u8) {
        unsafe { ptr.as_ptr().write_bytes(byte, len) }
    }

    unsafe fn verify(ptr: NonNull<u8>, len: usize, byte: u8) {
        let bytes = unsafe { slice::from_raw_parts(ptr.as_ptr(), len) };
        assert!(bytes.iter().all(|&b| b == byte));
    }

    const INITIAL_BLOCK: usize = INITIAL_HEAP_SIZE - WORD;

    #[test]
    fn test_block_size_for() {
        assert_eq!(block_size_for(1), Some(MIN_BLOCK_SIZE));
        assert_eq!(block_size_for(100), Some((100 + WORD).next_multiple_of(ALIGN)));
        assert_eq!(block_size_for(usize::MAX), None);
        for size in 1..512 {
            let block_size = block_size_for(size).unwrap();
            assert!(block_size.is_multiple_of(ALIGN));
            assert!(block_size >= size + WORD);
            assert!(block_size == MIN_BLOCK_SIZE || block_size < size + WORD + ALIGN);
        }
    }

    #[test]
    fn test_initial_layout() {
        with_test_heap(2 * INITIAL_HEAP_SIZE, |heap| {
            assert_eq!(heap.region_size(), INITIAL_HEAP_SIZE);
            let blocks = heap.blocks().collect::<Vec<_>>();
            assert_eq!(blocks.len(), 1);
            assert_eq!(blocks[0].header, heap.region_start().addr().get() + WORD);
            assert_eq!(blocks[0].size, INITIAL_BLOCK);
            assert!(!blocks[0].allocated);
            assert!(blocks[0].prev_allocated);
        });
    }

    #[test]
    fn test_allocate_zero() {
        with_test_heap(2 * INITIAL_HEAP_SIZE, |heap| {
            let before = heap.check().unwrap();
            assert!(heap.allocate(0).is_none());
            assert_eq!(heap.check().unwrap(), before);
            assert_eq!(heap.source().used(), INITIAL_HEAP_SIZE);
        });
    }

    #[test]
    fn test_release_null() {
        with_test_heap(2 * INITIAL_HEAP_SIZE, |heap| unsafe {
            let before = heap.check().unwrap();
            heap.release(core::ptr::null_mut());
            assert_eq!(heap.check().unwrap(), before);
        });
    }

    #[test]
    fn test_allocate_one() {
        with_test_heap(2 * INITIAL_HEAP_SIZE, |heap| unsafe {
            let ptr = heap.allocate(1).unwrap();
            assert_eq!(block_of(heap, ptr).size, MIN_BLOCK_SIZE);
            assert_eq!(heap.usable_size(ptr), MIN_BLOCK_SIZE - WORD);
            heap.release(ptr.as_ptr());
        });
    }

    #[test]
    fn test_alignment() {
        with_test_heap(64 * 1024, |heap| unsafe {
            let mut ptrs = Vec::new();
            for size in 1..=257 {
                let ptr = heap.allocate(size).unwrap();
                assert!(ptr.addr().get().is_multiple_of(ALIGN));
                assert!(heap.usable_size(ptr) >= size);
                ptrs.push(ptr);
            }
            heap.check().unwrap();
            for ptr in ptrs {
                heap.release(ptr.as_ptr());
            }
            let stats = heap.check().unwrap();
            assert_eq!(stats.block_count(), 1);
            assert_eq!(stats.free_bytes, heap.region_size() - WORD);
        });
    }

    #[test]
    fn test_split_and_release() {
        with_test_heap(2 * INITIAL_HEAP_SIZE, |heap| unsafe {
            let a_size = block_size_for(100).unwrap();
            let a = heap.allocate(100).unwrap();
            assert_eq!(
                a.addr().get(),
                heap.region_start().addr().get() + 2 * WORD
            );
            assert_eq!(
                block_list(heap),
                [(a_size, true), (INITIAL_BLOCK - a_size, false)]
            );

            heap.release(a.as_ptr());
            assert_eq!(block_list(heap), [(INITIAL_BLOCK, false)]);

            // the freed block is found again without growing
            let again = heap.allocate(100).unwrap();
            assert_eq!(again, a);
            assert_eq!(heap.region_size(), INITIAL_HEAP_SIZE);
            heap.release(again.as_ptr());
        });
    }

    #[test]
    fn test_growth_when_nothing_fits() {
        with_test_heap(4 * INITIAL_HEAP_SIZE, |heap| unsafe {
            let a_size = block_size_for(100).unwrap();
            let b_size = block_size_for(4000).unwrap();
            let a = heap.allocate(100).unwrap();
            let old_end = heap.region_end();

            let b = heap.allocate(4000).unwrap();
            assert!(b > old_end);
            assert_eq!(heap.region_size(), INITIAL_HEAP_SIZE + b_size);
            assert_eq!(
                block_list(heap),
                [
                    (a_size, true),
                    (INITIAL_BLOCK - a_size, false),
                    (b_size, true)
                ]
            );
            assert!(!block_of(heap, b).prev_allocated);
            fill(b, 4000, 0xb0);
            heap.check().unwrap();

            // the grown block merges back into the free block before it
            heap.release(b.as_ptr());
            assert_eq!(
                block_list(heap),
                [(a_size, true), (INITIAL_BLOCK - a_size + b_size, false)]
            );
            heap.check().unwrap();

            heap.release(a.as_ptr());
            assert_eq!(block_list(heap), [(INITIAL_BLOCK + b_size, false)]);
        });
    }

    #[test]
    fn test_full_block_reused_after_release() {
        with_test_heap(INITIAL_HEAP_SIZE, |heap| unsafe {
            let a = heap.allocate(100).unwrap();
            heap.release(a.as_ptr());
            let b = heap.allocate(4000).unwrap();
            assert_eq!(b, a);
            assert_eq!(heap.region_size(), INITIAL_HEAP_SIZE);
            heap.release(b.as_ptr());
        });
    }

    #[test]
    fn test_growth_failure_leaves_heap_unchanged() {
        with_test_heap(INITIAL_HEAP_SIZE, |heap| unsafe {
            let a = heap.allocate(100).unwrap();
            let before = heap.check().unwrap();

            assert!(heap.allocate(4000).is_none());
            let err = heap
                .try_allocate(NonZeroUsize::new(4000).unwrap())
                .unwrap_err();
            assert!(matches!(
                err,
                AllocError::OutOfMemory {
                    requested: 4000,
                    source: GrowError::Exhausted { available: 0, .. },
                    ..
                }
            ));
            assert_eq!(heap.check().unwrap(), before);
            assert_eq!(heap.region_size(), INITIAL_HEAP_SIZE);

            heap.release(a.as_ptr());
        });
    }

    #[test]
    fn test_size_overflow() {
        with_test_heap(INITIAL_HEAP_SIZE, |heap| {
            let err = heap.try_allocate(NonZeroUsize::MAX).unwrap_err();
            assert!(matches!(err, AllocError::SizeOverflow { .. }));
            assert!(heap.allocate(usize::MAX - 1).is_none());
        });
    }

    #[test]
    fn test_small_remainder_is_not_split() {
        with_test_heap(2 * INITIAL_HEAP_SIZE, |heap| unsafe {
            // leaves exactly ALIGN bytes, too little for a free block
            let size = INITIAL_BLOCK - ALIGN - WORD;
            let a = heap.allocate(size).unwrap();
            assert_eq!(block_list(heap), [(INITIAL_BLOCK, true)]);
            assert_eq!(heap.usable_size(a), INITIAL_BLOCK - WORD);

            let b = heap.allocate(1).unwrap();
            assert!(block_of(heap, b).prev_allocated);
            heap.release(a.as_ptr());
            assert!(!block_of(heap, b).prev_allocated);
            heap.release(b.as_ptr());
        });
    }

    #[test]
    fn test_whole_block_reuse_marks_next_block() {
        with_test_heap(2 * INITIAL_HEAP_SIZE, |heap| unsafe {
            let a = heap.allocate(100).unwrap();
            let b = heap.allocate(100).unwrap();
            heap.release(a.as_ptr());
            assert!(!block_of(heap, b).prev_allocated);

            // fits the freed block with a remainder too small to split off
            let c = heap.allocate(100 - ALIGN).unwrap();
            assert_eq!(c, a);
            assert_eq!(block_of(heap, c).size, block_size_for(100).unwrap());
            assert!(block_of(heap, b).prev_allocated);

            heap.release(b.as_ptr());
            heap.release(c.as_ptr());
        });
    }

    #[test]
    fn test_merge_front() {
        with_test_heap(2 * INITIAL_HEAP_SIZE, |heap| unsafe {
            let size = block_size_for(100).unwrap();
            let a = heap.allocate(100).unwrap();
            let b = heap.allocate(100).unwrap();
            let c = heap.allocate(100).unwrap();

            heap.release(b.as_ptr());
            assert!(!block_of(heap, c).prev_allocated);
            heap.release(a.as_ptr());
            assert_eq!(
                block_list(heap),
                [
                    (2 * size, false),
                    (size, true),
                    (INITIAL_BLOCK - 3 * size, false)
                ]
            );
            heap.check().unwrap();
            heap.release(c.as_ptr());
        });
    }

    #[test]
    fn test_merge_back() {
        with_test_heap(2 * INITIAL_HEAP_SIZE, |heap| unsafe {
            let size = block_size_for(100).unwrap();
            let a = heap.allocate(100).unwrap();
            let b = heap.allocate(100).unwrap();
            let c = heap.allocate(100).unwrap();

            heap.release(a.as_ptr());
            heap.release(b.as_ptr());
            assert_eq!(
                block_list(heap),
                [
                    (2 * size, false),
                    (size, true),
                    (INITIAL_BLOCK - 3 * size, false)
                ]
            );
            assert!(!block_of(heap, c).prev_allocated);
            heap.check().unwrap();
            heap.release(c.as_ptr());
        });
    }

    #[test]
    fn test_merge_both_neighbors() {
        with_test_heap(2 * INITIAL_HEAP_SIZE, |heap| unsafe {
            let size = block_size_for(100).unwrap();
            let a = heap.allocate(100).unwrap();
            let b = heap.allocate(100).unwrap();
            let c = heap.allocate(100).unwrap();
            let d = heap.allocate(100).unwrap();

            heap.release(a.as_ptr());
            heap.release(c.as_ptr());
            heap.release(b.as_ptr());
            assert_eq!(
                block_list(heap),
                [
                    (3 * size, false),
                    (size, true),
                    (INITIAL_BLOCK - 4 * size, false)
                ]
            );

            // the merged span satisfies a request of the combined size
            let merged = heap.allocate(3 * size - WORD).unwrap();
            assert_eq!(merged, a);
            assert_eq!(heap.region_size(), INITIAL_HEAP_SIZE);

            heap.release(merged.as_ptr());
            heap.release(d.as_ptr());
            assert_eq!(block_list(heap), [(INITIAL_BLOCK, false)]);
        });
    }

    #[test]
    fn test_last_block_tracking() {
        with_test_heap(4 * INITIAL_HEAP_SIZE, |heap| unsafe {
            let all = heap.allocate(INITIAL_BLOCK - WORD).unwrap();
            let x = heap.allocate(200).unwrap();
            let y = heap.allocate(300).unwrap();
            heap.check().unwrap();

            // last block released alone
            heap.release(y.as_ptr());
            heap.check().unwrap();

            // front neighbor is the last block
            heap.release(x.as_ptr());
            let stats = heap.check().unwrap();
            assert_eq!(stats.free_block_count, 1);

            // splitting the last block moves the tracking to the remainder
            let z = heap.allocate(50).unwrap();
            assert_eq!(z, x);
            heap.check().unwrap();

            // back neighbor absorbs the last block
            heap.release(all.as_ptr());
            heap.release(z.as_ptr());
            let stats = heap.check().unwrap();
            assert_eq!(stats.block_count(), 1);
            assert_eq!(stats.free_bytes, heap.region_size() - WORD);
        });
    }

    #[test]
    fn test_random_workload() {
        with_test_heap(256 * 1024, |heap| unsafe {
            let mut state = 0x2545_f491_4f6c_dd1d_u64;
            let mut next = move |bound: usize| {
                state = state
                    .wrapping_mul(6_364_136_223_846_793_005)
                    .wrapping_add(1_442_695_040_888_963_407);
                usize::try_from(state >> 33).unwrap() % bound
            };

            let mut live: Vec<(NonNull<u8>, usize, u8)> = Vec::new();
            for step in 0..2000 {
                if live.is_empty() || next(3) != 0 {
                    let size = if next(10) == 0 {
                        1 + next(4000)
                    } else {
                        1 + next(300)
                    };
                    let Some(ptr) = heap.allocate(size) else {
                        continue;
                    };
                    let byte = u8::try_from(step % 251).unwrap();
                    fill(ptr, size, byte);
                    live.push((ptr, size, byte));
                } else {
                    let (ptr, size, byte) = live.swap_remove(next(live.len()));
                    verify(ptr, size, byte);
                    heap.release(ptr.as_ptr());
                }
                heap.check().unwrap();
            }

            for (ptr, size, byte) in live.drain(..) {
                verify(ptr, size, byte);
                heap.release(ptr.as_ptr());
            }
            let stats = heap.check().unwrap();
            assert_eq!(stats.block_count(), 1);
            assert_eq!(stats.free_bytes, heap.region_size() - WORD);
        });
    }

    #[test]
    fn test_check_detects_corruption() {
        with_test_heap(2 * INITIAL_HEAP_SIZE, |heap| unsafe {
            let a = heap.allocate(100).unwrap();
            let b = heap.allocate(100).unwrap();
            let free = heap.blocks().find(|block| !block.allocated).unwrap();
            let footer_addr = NonZeroUsize::new(free.header + free.size - WORD).unwrap();
            let footer_ptr = heap.region_start().with_addr(footer_addr).cast::<usize>();
            let saved = footer_ptr.read();
            footer_ptr.write(0);
            assert!(matches!(
                heap.check(),
                Err(CheckError::FooterMismatch { .. })
            ));
            footer_ptr.write(saved);

            let b_header = b.sub(WORD).cast::<usize>();
            let saved = b_header.read();
            b_header.write(Tag::allocated(block_size_for(100).unwrap(), false).encode());
            assert!(matches!(
                heap.check(),
                Err(CheckError::StalePrevAllocated {
                    expected: true,
                    ..
                })
            ));
            b_header.write(saved);
            heap.check().unwrap();

            heap.release(a.as_ptr());
            heap.release(b.as_ptr());
        });
    }

    #[test]
    #[should_panic(expected = "double free detected")]
    fn test_double_free() {
        with_test_heap(2 * INITIAL_HEAP_SIZE, |heap| unsafe {
            let a = heap.allocate(100).unwrap();
            let _b = heap.allocate(100).unwrap();
            heap.release(a.as_ptr());
            heap.release(a.as_ptr());
        });
    }

    #[test]
    #[should_panic(expected = "released pointer does not belong to the heap")]
    fn test_release_foreign_pointer() {
        with_test_heap(2 * INITIAL_HEAP_SIZE, |heap| unsafe {
            let mut local = [0_u64; 4];
            heap.release(local.as_mut_ptr().cast());
        });
    }

    struct ShiftedSource(ArenaSource<'static>);

    unsafe impl RegionSource for ShiftedSource {
        fn grow(&mut self, bytes: usize) -> Result<NonNull<u8>, GrowError> {
            self.0.grow(WORD)?;
            self.0.grow(bytes)
        }

        fn start(&self) -> NonNull<u8> {
            self.0.start()
        }

        fn end(&self) -> NonNull<u8> {
            self.0.end()
        }
    }

    #[test]
    fn test_init_errors() {
        let layout = Layout::from_size_align(2 * INITIAL_HEAP_SIZE, ALIGN).unwrap();
        unsafe {
            let start = NonNull::new(alloc::alloc::alloc(layout)).unwrap();
            let arena = || ArenaSource::from_raw_parts(start, layout.size());

            let err = SegFitHeap::with_initial_size(arena(), WORD + ALIGN).err().unwrap();
            assert!(matches!(err, InitError::InvalidInitialSize { .. }));
            let err = SegFitHeap::with_initial_size(arena(), INITIAL_HEAP_SIZE + WORD)
                .err()
                .unwrap();
            assert!(matches!(err, InitError::InvalidInitialSize { .. }));

            let err = SegFitHeap::with_initial_size(arena(), 4 * INITIAL_HEAP_SIZE - 3 * WORD)
                .err()
                .unwrap();
            assert!(matches!(
                err,
                InitError::InitialGrow {
                    source: GrowError::Exhausted { .. },
                    ..
                }
            ));

            let err = SegFitHeap::new(ShiftedSource(arena())).err().unwrap();
            assert!(matches!(
                err,
                InitError::MisalignedStart {
                    alignment: ALIGN,
                    ..
                }
            ));

            let heap = SegFitHeap::with_initial_size(arena(), WORD + MIN_BLOCK_SIZE).unwrap();
            assert_eq!(heap.check().unwrap().free_bytes, MIN_BLOCK_SIZE);
            drop(heap);

            alloc::alloc::dealloc(start.as_ptr(), layout);
        }
    }
}
