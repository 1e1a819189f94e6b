//! Segregated-fit heap allocator with boundary tags.
//!
//! This crate provides a freestanding dynamic-memory allocator that manages a
//! single contiguous, growable memory region. It does not depend on any
//! underlying allocator; the only primitive it needs is "grow the region by N
//! bytes", supplied by the host through the [`RegionSource`] trait.
//!
//! # Algorithm
//!
//! - **Size classes**: free blocks are kept in 64 doubly linked lists, one per
//!   bit-length of the block size.
//! - **Allocation**: a best-fit search starts at the size class of the request
//!   and stops at the first class that yields a fitting block. Blocks larger
//!   than needed are split when the remainder can hold a free block.
//! - **Growth**: when no free block fits, the region is grown by exactly the
//!   needed block size.
//! - **Deallocation**: freed blocks are merged immediately with free
//!   neighbors on both sides.
//!
//! # Memory Layout
//!
//! Every block starts with a one-word header holding the block size and two
//! status bits. Free blocks additionally store their free-list links in the
//! payload area and mirror the header in a footer word, so that the block
//! following them can find their start.
//!
//! ```text
//! Allocated Block:
//! ┌──────────────┬────────────────────────────────────────────┐
//! │ header       │ payload                                    │
//! │ size | A | P │                                            │
//! └──────────────┴────────────────────────────────────────────┘
//!
//! Free Block:
//! ┌──────────────┬──────────┬──────────┬─────────┬────────────┐
//! │ header       │ next     │ prev     │ unused  │ footer     │
//! │ size | 0 | P │ *mut u8  │ *mut u8  │         │ size | 0 | P
//! └──────────────┴──────────┴──────────┴─────────┴────────────┘
//! ```
//!
//! `A` is the allocated bit and `P` is the previous-block-allocated bit.
//! Headers are placed one word past an [`ALIGN`] boundary so that payloads are
//! always [`ALIGN`]-aligned.
//!
//! # Usage Example
//!
//! ```rust
//! use core::alloc::Layout;
//!
//! use segfit::{ArenaSource, SegFitHeap};
//!
//! let layout = Layout::from_size_align(64 * 1024, segfit::ALIGN).unwrap();
//! let memory = unsafe { std::alloc::alloc(layout) };
//! let source =
//!     unsafe { ArenaSource::from_raw_parts(core::ptr::NonNull::new(memory).unwrap(), layout.size()) };
//!
//! let mut heap = SegFitHeap::new(source).unwrap();
//! let ptr = heap.allocate(100).unwrap();
//! assert!(ptr.addr().get().is_multiple_of(segfit::ALIGN));
//! unsafe {
//!     heap.release(ptr.as_ptr());
//! }
//! assert_eq!(heap.stats().free_block_count, 1);
//!
//! drop(heap);
//! unsafe { std::alloc::dealloc(memory, layout) };
//! ```
//!
//! # Thread Safety
//!
//! [`SegFitHeap`] is `Send` but not `Sync`. Shared use goes through
//! [`LockedHeap`], which serializes every call with a spin lock and implements
//! [`GlobalAlloc`](core::alloc::GlobalAlloc).

#![no_std]
#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

#[macro_use]
pub mod log;

pub mod arena;
mod block;
pub mod error;
mod free_list;
pub mod heap;
pub mod locked;
pub mod region;
pub mod size_class;
pub mod tag;

pub use self::{
    arena::ArenaSource,
    error::{AllocError, CheckError, GrowError, InitError},
    heap::{BlockInfo, Blocks, HeapStats, SegFitHeap},
    locked::LockedHeap,
    region::RegionSource,
};

/// Size of a header or footer word in bytes.
pub const WORD: usize = size_of::<usize>();

/// Alignment guaranteed for every payload returned by the allocator.
///
/// Block sizes are always multiples of this value.
pub const ALIGN: usize = 2 * WORD;

/// Smallest block the allocator creates: header, two free-list links and a
/// footer.
pub const MIN_BLOCK_SIZE: usize = 4 * WORD;

/// Default number of bytes requested from the source when a heap is created.
///
/// The leading word is padding that places the first header one word past an
/// [`ALIGN`] boundary; the rest becomes the initial free block.
pub const INITIAL_HEAP_SIZE: usize = 4096 + WORD;

const _: () = assert!(MIN_BLOCK_SIZE.is_multiple_of(ALIGN));
const _: () = assert!((INITIAL_HEAP_SIZE - WORD).is_multiple_of(ALIGN));
