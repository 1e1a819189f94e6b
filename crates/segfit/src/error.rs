use snafu::{Location, Snafu};

/// The error type returned by a [`RegionSource`](crate::RegionSource) that
/// cannot grow the region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display, derive_more::Error)]
#[non_exhaustive]
pub enum GrowError {
    #[display("region exhausted: requested={requested}, available={available}")]
    Exhausted { requested: usize, available: usize },
}

/// The error type returned when a heap cannot be created.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
#[non_exhaustive]
pub enum InitError {
    #[snafu(display("invalid initial heap size: size={size}, minimum={minimum}"))]
    InvalidInitialSize {
        size: usize,
        minimum: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("failed to grow the region for the initial heap: {source}"))]
    InitialGrow {
        #[snafu(implicit)]
        location: Location,
        #[snafu(source)]
        source: GrowError,
    },
    #[snafu(display("misaligned region start: address={address:#x}, alignment={alignment}"))]
    MisalignedStart {
        address: usize,
        alignment: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("heap is already initialized"))]
    AlreadyInitialized {
        #[snafu(implicit)]
        location: Location,
    },
}

/// The error type returned by [`SegFitHeap::try_allocate`](crate::SegFitHeap::try_allocate).
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
#[non_exhaustive]
pub enum AllocError {
    #[snafu(display("requested size is too large: requested={requested}"))]
    SizeOverflow {
        requested: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display(
        "out of memory: requested={requested}, block_size={block_size}: {source}"
    ))]
    OutOfMemory {
        requested: usize,
        block_size: usize,
        #[snafu(implicit)]
        location: Location,
        #[snafu(source)]
        source: GrowError,
    },
}

/// A heap invariant violation found by
/// [`SegFitHeap::check`](crate::SegFitHeap::check).
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display, derive_more::Error)]
#[non_exhaustive]
pub enum CheckError {
    #[display("block size is not aligned: block={block:#x}, size={size}")]
    UnalignedSize { block: usize, size: usize },
    #[display("block is smaller than the minimum block size: block={block:#x}, size={size}")]
    TooSmall { block: usize, size: usize },
    #[display("block runs past the end of the region: block={block:#x}, size={size}, end={end:#x}")]
    Overrun { block: usize, size: usize, end: usize },
    #[display("free block header and footer disagree: block={block:#x}, header={header:#x}, footer={footer:#x}")]
    FooterMismatch {
        block: usize,
        header: usize,
        footer: usize,
    },
    #[display("stale previous-allocated bit: block={block:#x}, expected={expected}")]
    StalePrevAllocated { block: usize, expected: bool },
    #[display("adjacent free blocks were not merged: block={block:#x}")]
    AdjacentFree { block: usize },
    #[display("last block is not tracked: tracked={tracked:#x}, actual={actual:#x}")]
    LastBlockMismatch { tracked: usize, actual: usize },
    #[display("free list entry lies outside the region: block={block:#x}")]
    StrayFreeBlock { block: usize },
    #[display("allocated block is in the free list: block={block:#x}")]
    AllocatedInFreeList { block: usize },
    #[display("free block is in the wrong size class: block={block:#x}, size={size}, class={class}")]
    MisfiledFreeBlock {
        block: usize,
        size: usize,
        class: usize,
    },
    #[display("free list back link is broken: block={block:#x}")]
    BrokenLink { block: usize },
    #[display("free list and heap disagree on free blocks: walked={walked}, listed={listed}")]
    FreeCountMismatch { walked: usize, listed: usize },
}
