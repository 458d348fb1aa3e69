use std::{cmp::Ordering, collections::BTreeSet};

use crate::block::BlockRef;

/// Keeps track of the free [`Block`][crate::block::Block]s of one family, across all of
/// its pages, ordered by size from largest to smallest.
///
/// ```text
///                              Free List
///        +-----------------------+----------------------+
///        | largest               |                      | smallest
/// +------|-------------------+   |   +------------------|---------------+
/// |      v                   |   |   |                  v               |
/// | Page | Free(900) | Block |   |   | Page | Block | Free(16) | Block  |
/// |      |           |       |   |   |      |       |          |        |
/// +--------------------------+   |   +----------------------------------+
///                                v
///                     +--------------------------+
///                     | Page | Block | Free(120) |
///                     +--------------------------+
/// ```
///
/// The list only records where the free blocks are; the headers themselves stay in
/// their pages. An entry remembers the size the block had when it was inserted, so a
/// block must be removed before its size changes.
#[derive(Debug)]
pub(crate) struct FreeList {
    entries: BTreeSet<FreeEntry>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
struct FreeEntry {
    size: usize,
    block: BlockRef,
}

impl Ord for FreeEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Largest first, equal sizes by address so every block has a unique key.
        other
            .size
            .cmp(&self.size)
            .then_with(|| self.block.cmp(&other.block))
    }
}

impl PartialOrd for FreeEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl FreeList {
    pub(crate) const fn new() -> Self {
        Self {
            entries: BTreeSet::new(),
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    /// Adds a free block.
    ///
    /// # Safety
    ///
    /// `block` must point to a live block header.
    pub(crate) unsafe fn insert(&mut self, block: BlockRef) {
        // SAFETY: forwarded from the caller.
        let data = unsafe { &block.as_ref().data };
        debug_assert!(data.is_free, "only free blocks belong in the free list");

        let inserted = self.entries.insert(FreeEntry {
            size: data.size,
            block,
        });
        debug_assert!(inserted, "block {block:p} is already in the free list");
    }

    /// Removes a block that was inserted with its current size.
    ///
    /// # Safety
    ///
    /// `block` must point to a live block header.
    pub(crate) unsafe fn remove(&mut self, block: BlockRef) {
        // SAFETY: forwarded from the caller.
        let size = unsafe { block.as_ref().data.size };

        let removed = self.entries.remove(&FreeEntry { size, block });
        debug_assert!(removed, "block {block:p} is not in the free list");
    }

    /// Returns the block to allocate `size` bytes from.
    ///
    /// Only the largest free block is looked at. If that one is too small, so is
    /// every other block, and the caller needs a new page.
    pub(crate) fn find_free_block(&self, size: usize) -> Option<BlockRef> {
        self.entries
            .first()
            .filter(|entry| entry.size >= size)
            .map(|entry| entry.block)
    }

    /// Free blocks with their sizes, largest first.
    pub(crate) fn iter(&self) -> impl Iterator<Item = (BlockRef, usize)> + '_ {
        self.entries.iter().map(|entry| (entry.block, entry.size))
    }

    #[cfg(test)]
    pub(crate) fn sizes(&self) -> impl Iterator<Item = usize> + '_ {
        self.iter().map(|(_, size)| size)
    }
}

#[cfg(test)]
mod tests {
    use std::ptr::NonNull;

    use super::*;
    use crate::{block::Block, list::Node};

    fn free_block(size: usize) -> Box<Node<Block>> {
        Box::new(Node {
            next: None,
            prev: None,
            data: Block::free(size, 0),
        })
    }

    fn block_ref(node: &mut Node<Block>) -> BlockRef {
        NonNull::from(node)
    }

    #[test]
    fn empty_list_has_nothing_to_offer() {
        let list = FreeList::new();

        assert_eq!(list.len(), 0);
        assert!(list.find_free_block(0).is_none());
        assert!(list.find_free_block(1).is_none());
    }

    #[test]
    fn largest_block_comes_first() {
        let mut small = free_block(16);
        let mut large = free_block(900);
        let mut medium = free_block(120);
        let (small, large, medium) = (
            block_ref(&mut small),
            block_ref(&mut large),
            block_ref(&mut medium),
        );

        let mut list = FreeList::new();
        unsafe {
            list.insert(small);
            list.insert(large);
            list.insert(medium);
        }

        assert_eq!(list.find_free_block(0), Some(large));
        assert_eq!(list.sizes().collect::<Vec<_>>(), vec![900, 120, 16]);

        unsafe { list.remove(large) };

        assert_eq!(list.find_free_block(0), Some(medium));
        assert_eq!(list.len(), 2);
    }

    #[test]
    fn equal_sizes_are_kept_apart() {
        let mut first = free_block(64);
        let mut second = free_block(64);
        let (first, second) = (block_ref(&mut first), block_ref(&mut second));

        let mut list = FreeList::new();
        unsafe {
            list.insert(first);
            list.insert(second);
        }
        assert_eq!(list.len(), 2);

        unsafe { list.remove(first) };
        assert_eq!(list.find_free_block(0), Some(second));
    }

    #[test]
    fn only_the_largest_block_is_considered() {
        let mut small = free_block(64);
        let mut large = free_block(800);
        let (small, large) = (block_ref(&mut small), block_ref(&mut large));

        let mut list = FreeList::new();
        unsafe {
            list.insert(small);
            list.insert(large);
        }

        // A perfect fit exists, but the largest block is still the one handed out.
        assert_eq!(list.find_free_block(64), Some(large));
        assert_eq!(list.find_free_block(800), Some(large));
        assert_eq!(list.find_free_block(801), None);
    }
}
