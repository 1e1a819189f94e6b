//! Heap region tracking.
//!
//! The managed region is one contiguous span obtained from a
//! [`RegionSource`]. The tracker remembers the first block, the last block
//! and the current high mark of the region, and is the only component that
//! talks to the source.

use core::ptr::NonNull;

use crate::{block::Block, error::GrowError};

/// The host primitive that extends the managed region.
///
/// # Safety
///
/// Implementors must guarantee that:
///
/// - every span returned by [`grow`](Self::grow) is valid for reads and
///   writes of the requested length and is used by nothing else
/// - every span starts exactly where the previous one ended, so the region
///   stays contiguous and never moves
/// - a failed `grow` leaves the region unchanged
/// - [`start`](Self::start) and [`end`](Self::end) report the current bounds
///   of the region
pub unsafe trait RegionSource {
    /// Extends the region by `bytes` bytes and returns the start of the new
    /// span.
    fn grow(&mut self, bytes: usize) -> Result<NonNull<u8>, GrowError>;

    /// Lowest address of the region.
    fn start(&self) -> NonNull<u8>;

    /// Address one past the highest byte of the region.
    fn end(&self) -> NonNull<u8>;
}

pub(crate) struct Region<S> {
    source: S,
    start: NonNull<u8>,
    first: Block,
    last: Block,
    end: NonNull<u8>,
}

impl<S> Region<S>
where
    S: RegionSource,
{
    /// Starts tracking a region that currently holds the single block
    /// `first`, spanning up to `end`.
    pub(crate) fn new(source: S, start: NonNull<u8>, first: Block, end: NonNull<u8>) -> Self {
        debug_assert!(start < first.header_ptr() && first.header_ptr() < end);
        Self {
            source,
            start,
            first,
            last: first,
            end,
        }
    }

    pub(crate) fn source(&self) -> &S {
        &self.source
    }

    pub(crate) fn into_source(self) -> S {
        self.source
    }

    pub(crate) fn start(&self) -> NonNull<u8> {
        self.start
    }

    pub(crate) fn end(&self) -> NonNull<u8> {
        self.end
    }

    pub(crate) fn size(&self) -> usize {
        self.end.addr().get() - self.start.addr().get()
    }

    pub(crate) fn first_block(&self) -> Block {
        self.first
    }

    pub(crate) fn last_block(&self) -> Block {
        self.last
    }

    pub(crate) fn update_last_block(&mut self, block: Block) {
        debug_assert!(self.is_within_region(block.addr()));
        self.last = block;
    }

    /// Returns `true` if `addr` lies between the first block header and the
    /// high mark.
    pub(crate) fn is_within_region(&self, addr: usize) -> bool {
        self.first.addr() <= addr && addr < self.end.addr().get()
    }

    /// Grows the region by `extra` bytes and returns the new span as a block
    /// handle. The caller writes the block's header.
    pub(crate) fn grow(&mut self, extra: usize) -> Result<Block, GrowError> {
        let span = self.source.grow(extra)?;
        assert_eq!(
            span, self.end,
            "region source returned a span that does not continue the region"
        );
        self.end = unsafe { span.add(extra) };
        Ok(unsafe { Block::from_header(span) })
    }
}
