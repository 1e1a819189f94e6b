//! Segregated free list.
//!
//! One intrusive doubly linked list per size class. The links live in the
//! payload of the free blocks themselves, so the list needs no storage beyond
//! the array of bucket heads.

use core::iter;

use crate::{
    block::Block,
    size_class::{CLASS_COUNT, class_of},
};

pub(crate) struct FreeList {
    heads: [Option<Block>; CLASS_COUNT],
}

impl FreeList {
    pub(crate) const fn new() -> Self {
        Self {
            heads: [None; CLASS_COUNT],
        }
    }

    /// Pushes `block` to the front of the bucket for its current size.
    ///
    /// # Safety
    ///
    /// `block` must be a free block with a valid header that is not already in
    /// the list.
    pub(crate) unsafe fn insert(&mut self, block: Block) {
        unsafe {
            let class = class_of(block.size());
            let head = self.heads[class];
            block.set_next_free(head);
            block.set_prev_free(None);
            if let Some(head) = head {
                head.set_prev_free(Some(block));
            }
            self.heads[class] = Some(block);
        }
    }

    /// Unlinks `block` from its bucket.
    ///
    /// # Safety
    ///
    /// `block` must be in the list, and its size must not have changed since
    /// it was inserted.
    pub(crate) unsafe fn remove(&mut self, block: Block) {
        unsafe {
            let class = class_of(block.size());
            let next = block.next_free();
            let prev = block.prev_free();
            if let Some(prev) = prev {
                prev.set_next_free(next);
            } else {
                assert_eq!(
                    self.heads[class],
                    Some(block),
                    "unlinked block is not the head of its size class"
                );
                self.heads[class] = next;
            }
            if let Some(next) = next {
                next.set_prev_free(prev);
            }
        }
    }

    /// Finds a free block of at least `min_size` bytes.
    ///
    /// The search starts at the size class of `min_size` and returns the
    /// smallest fitting block of the first class that has one. Every block of
    /// a higher class is larger than any block of a lower class, so stopping
    /// at the first class with a candidate loses nothing.
    ///
    /// # Safety
    ///
    /// Every block in the list must have a valid header and valid links.
    pub(crate) unsafe fn find_best_fit(&self, min_size: usize) -> Option<Block> {
        for class in class_of(min_size)..CLASS_COUNT {
            let mut best: Option<(Block, usize)> = None;
            for block in unsafe { self.iter_class(class) } {
                let size = unsafe { block.size() };
                if size < min_size || best.is_some_and(|(_, best_size)| size >= best_size) {
                    continue;
                }
                best = Some((block, size));
                if size == min_size {
                    break;
                }
            }
            if let Some((block, _)) = best {
                return Some(block);
            }
        }
        None
    }

    /// Iterates over the blocks of one size class, most recently inserted
    /// first.
    ///
    /// # Safety
    ///
    /// Every block in the bucket must have valid links for as long as the
    /// iterator is used.
    pub(crate) unsafe fn iter_class(&self, class: usize) -> impl Iterator<Item = Block> + '_ {
        iter::successors(self.heads[class], |block| unsafe { block.next_free() })
    }
}
